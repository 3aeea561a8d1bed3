// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Session management
//!
//! A [`Session`] owns the root service handle for its whole lifetime and
//! hands out namespace-scoped handles for single operations. Establishing
//! the session is the only fatal step; everything after it reports errors
//! per call.

use std::cell::OnceCell;
use std::ops::Deref;

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::marshal::Marshaler;
use crate::namespace::QualifiedName;
use crate::provider::{Connector, Services, UnsecuredApartment};

/// Service handle for one operation.
///
/// `Root` borrows the session's root handle and never releases it;
/// `Scoped` owns a sub-namespace handle released when dropped.
pub enum NamespaceHandle<'a> {
    Root(&'a (dyn Services + 'static)),
    Scoped {
        namespace: String,
        services: Box<dyn Services>,
    },
}

impl NamespaceHandle<'_> {
    pub fn is_root(&self) -> bool {
        matches!(self, NamespaceHandle::Root(_))
    }
}

impl Deref for NamespaceHandle<'_> {
    type Target = dyn Services;

    fn deref(&self) -> &Self::Target {
        match self {
            NamespaceHandle::Root(services) => *services,
            NamespaceHandle::Scoped { services, .. } => services.as_ref(),
        }
    }
}

impl Drop for NamespaceHandle<'_> {
    fn drop(&mut self) {
        if let NamespaceHandle::Scoped { namespace, .. } = self {
            log::trace!("Releasing service handle for namespace {}", namespace);
        }
    }
}

/// A connection to the instrumentation provider rooted at one namespace
pub struct Session {
    // Field order is teardown order: root handle, stub factory, then the
    // connector (which shuts the subsystem down).
    root: Box<dyn Services>,
    apartment: OnceCell<Box<dyn UnsecuredApartment>>,
    marshaler: Marshaler,
    config: BridgeConfig,
    connector: Box<dyn Connector>,
}

impl Session {
    /// Establish the root session through `connector`
    pub fn connect(connector: Box<dyn Connector>, config: BridgeConfig) -> Result<Self> {
        config.validate()?;

        let root = connector.connect_root(&config.root_namespace).map_err(|failure| {
            let err = Error::from(failure);
            log::error!("{}", err);
            err
        })?;
        log::info!("Connected to {} namespace", config.root_namespace);

        Ok(Self {
            root,
            apartment: OnceCell::new(),
            marshaler: Marshaler::from_config(&config),
            config,
            connector,
        })
    }

    /// Establish the root session or terminate the process.
    ///
    /// No operation can proceed without a session, so bootstrap failures
    /// print their coded message and exit with status 1.
    pub fn connect_or_exit(connector: Box<dyn Connector>, config: BridgeConfig) -> Self {
        match Self::connect(connector, config) {
            Ok(session) => session,
            Err(err) => {
                eprintln!("{}", err);
                std::process::exit(1);
            }
        }
    }

    /// Connect to the local WMI service
    pub fn connect_local(config: BridgeConfig) -> Result<Self> {
        Self::connect(Self::local_connector()?, config)
    }

    /// Connector for the local WMI service. COM is initialised when it
    /// connects.
    #[cfg(windows)]
    pub fn local_connector() -> Result<Box<dyn Connector>> {
        Ok(Box::new(crate::provider::windows::ComConnector::new()))
    }

    /// Connector for the local WMI service
    #[cfg(not(windows))]
    pub fn local_connector() -> Result<Box<dyn Connector>> {
        Err(Error::UnsupportedPlatform(
            "WMI is only available on Windows".into(),
        ))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Marshaler configured from this session's settings
    pub fn marshaler(&self) -> &Marshaler {
        &self.marshaler
    }

    /// Root service handle
    pub fn root(&self) -> &dyn Services {
        self.root.as_ref()
    }

    /// Service handle for the namespace part of `name`.
    ///
    /// Returns the borrowed root handle when `name` has no namespace.
    pub fn resolve_namespace(&self, name: &QualifiedName) -> Result<NamespaceHandle<'_>> {
        if !name.has_namespace() {
            return Ok(NamespaceHandle::Root(self.root.as_ref()));
        }

        match self.root.open_namespace(name.namespace()) {
            Ok(services) => Ok(NamespaceHandle::Scoped {
                namespace: name.namespace().to_string(),
                services,
            }),
            Err(code) => {
                let err = Error::Namespace {
                    namespace: name.namespace().to_string(),
                    code,
                };
                log::error!("{}", err);
                Err(err)
            }
        }
    }

    /// The stub factory, created on first use and kept for the session's
    /// lifetime
    pub(crate) fn apartment(&self) -> Result<&dyn UnsecuredApartment> {
        if let Some(apartment) = self.apartment.get() {
            return Ok(apartment.as_ref());
        }

        let created = self
            .connector
            .create_unsecured_apartment()
            .map_err(|code| {
                let err = Error::StubFactory { code };
                log::error!("{}", err);
                err
            })?;
        Ok(self.apartment.get_or_init(|| created).as_ref())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        log::debug!("Closing session on {} namespace", self.config.root_namespace);
    }
}
