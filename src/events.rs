// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Event subscriptions
//!
//! Registers a caller-implemented [`EventSink`] for intrinsic instance
//! events on one class. Notifications arrive on the provider's own thread
//! through an object stub created by the session's unsecured apartment.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use wbridgelib::config::BridgeConfig;
//! use wbridgelib::events::event_types;
//! use wbridgelib::provider::{CallbackSink, EventSink};
//! use wbridgelib::session::Session;
//!
//! let session = Session::connect_local(BridgeConfig::default()).unwrap();
//! let sink: Arc<dyn EventSink> = Arc::new(CallbackSink::new(|objects| {
//!     println!("{} events", objects.len());
//! }));
//! let subscription = session
//!     .subscribe(&sink, event_types::INSTANCE_MODIFICATION, "cimv2\\Win32_Service")
//!     .unwrap();
//! // Dropping the subscription releases the wrapped sink.
//! drop(subscription);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::error::{Error, HResult, Result};
use crate::namespace::QualifiedName;
use crate::provider::{EventSink, ObjectSink, QueryFlags};
use crate::session::Session;

/// Intrinsic event classes, without their `__` prefix
pub mod event_types {
    pub const INSTANCE_CREATION: &str = "InstanceCreationEvent";
    pub const INSTANCE_DELETION: &str = "InstanceDeletionEvent";
    pub const INSTANCE_MODIFICATION: &str = "InstanceModificationEvent";
    pub const INSTANCE_OPERATION: &str = "InstanceOperationEvent";
}

/// `SELECT * FROM __<event> WITHIN <secs> WHERE TargetInstance ISA '<class>'`
pub fn event_query(event_type: &str, class: &str, within_secs: u32) -> String {
    format!(
        "SELECT * FROM __{} WITHIN {} WHERE TargetInstance ISA '{}'",
        event_type, within_secs, class
    )
}

/// An active event registration.
///
/// Owns the wrapped sink handed to the provider; dropping it releases that
/// handle. Notifications already in flight may still be delivered.
pub struct Subscription {
    sink: Box<dyn ObjectSink>,
    query: String,
}

impl Subscription {
    /// Notification query this subscription was registered with
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Provider-side handle of the wrapped sink
    pub fn sink(&self) -> &dyn ObjectSink {
        self.sink.as_ref()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        log::debug!("Releasing event sink for \"{}\"", self.query);
    }
}

impl Session {
    /// Deliver `event_type` events for instances of `qualified` to `sink`.
    ///
    /// The first call creates the session's unsecured apartment and is not
    /// reentrant-safe. On failure every reference taken on `sink` is
    /// released before returning.
    pub fn subscribe(
        &self,
        sink: &Arc<dyn EventSink>,
        event_type: &str,
        qualified: &str,
    ) -> Result<Subscription> {
        let name = QualifiedName::parse(qualified)?;
        let sink = Arc::clone(sink);

        let stub = self
            .apartment()?
            .create_object_stub(sink)
            .map_err(stub_error)?;
        let object_sink = stub.query_object_sink().map_err(stub_error)?;

        let services = self.resolve_namespace(&name)?;
        let query = event_query(
            event_type,
            name.class(),
            self.config().event_poll_interval_secs,
        );

        let registered = services.exec_notification_query_async(
            &self.config().query_language,
            &query,
            QueryFlags::SEND_STATUS,
            object_sink.as_ref(),
        );
        drop(stub);

        match registered {
            Ok(()) => {
                log::debug!("Registered \"{}\"", query);
                Ok(Subscription {
                    sink: object_sink,
                    query,
                })
            }
            Err(code) => {
                let err = Error::Registration { query, code };
                log::error!("{}", err);
                Err(err)
            }
        }
    }
}

fn stub_error(code: HResult) -> Error {
    let err = Error::StubCreation { code };
    log::error!("{}", err);
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::provider::memory::{MemoryObject, MemoryProvider};
    use crate::provider::{CallbackSink, ClassObject};
    use crate::tree::ValueTree;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        trees: Mutex<Vec<ValueTree>>,
    }

    impl EventSink for RecordingSink {
        fn indicate(&self, objects: Vec<Box<dyn ClassObject>>) {
            let marshaler = crate::marshal::Marshaler::new();
            let mut trees = self.trees.lock().unwrap();
            for object in objects {
                trees.push(marshaler.to_tree(object.as_ref()).unwrap());
            }
        }
    }

    fn setup() -> (MemoryProvider, Session) {
        let provider = MemoryProvider::new();
        provider.add_namespace("ROOT\\cimv2");
        let session = Session::connect(Box::new(provider.clone()), BridgeConfig::default()).unwrap();
        (provider, session)
    }

    fn sink() -> (Arc<RecordingSink>, Arc<dyn EventSink>) {
        let recording = Arc::new(RecordingSink::default());
        let sink: Arc<dyn EventSink> = recording.clone();
        (recording, sink)
    }

    #[test]
    fn test_event_query() {
        assert_eq!(
            event_query(event_types::INSTANCE_MODIFICATION, "Win32_Service", 1),
            "SELECT * FROM __InstanceModificationEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Service'"
        );
    }

    #[test]
    fn test_subscribe_and_receive() {
        let (provider, session) = setup();
        let (recording, sink) = sink();
        let subscription = session
            .subscribe(&sink, event_types::INSTANCE_MODIFICATION, "cimv2\\Win32_Service")
            .unwrap();
        assert!(subscription.query().contains("ISA 'Win32_Service'"));
        assert_eq!(provider.live_services(), 1);

        let spooler = MemoryObject::new("Win32_Service")
            .with("Name", "Spooler")
            .with("State", "Stopped");
        assert_eq!(provider.raise("ROOT\\cimv2", "InstanceModificationEvent", &spooler), 1);

        let trees = recording.trees.lock().unwrap();
        assert_eq!(trees.len(), 1);
        let target = trees[0].get("TargetInstance").unwrap();
        assert_eq!(target.get("State").and_then(ValueTree::as_leaf), Some("Stopped"));
    }

    #[test]
    fn test_other_classes_are_not_delivered() {
        let (provider, session) = setup();
        let (recording, sink) = sink();
        let _subscription = session
            .subscribe(&sink, event_types::INSTANCE_CREATION, "cimv2\\Win32_Process")
            .unwrap();
        let service = MemoryObject::new("Win32_Service");
        assert_eq!(provider.raise("ROOT\\cimv2", "InstanceCreationEvent", &service), 0);
        assert_eq!(provider.raise("ROOT", "InstanceCreationEvent", &MemoryObject::new("Win32_Process")), 0);
        assert!(recording.trees.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dropping_subscription_releases_sink() {
        let (provider, session) = setup();
        let (_recording, sink) = sink();
        let subscription = session
            .subscribe(&sink, event_types::INSTANCE_DELETION, "Win32_Process")
            .unwrap();
        assert_eq!(Arc::strong_count(&sink), 3);
        assert_eq!(provider.active_registrations(), 1);

        drop(subscription);
        assert_eq!(Arc::strong_count(&sink), 2);
        assert_eq!(provider.active_registrations(), 0);
        assert_eq!(provider.raise("ROOT", "InstanceDeletionEvent", &MemoryObject::new("Win32_Process")), 0);
    }

    #[test]
    fn test_malformed_event_type_releases_sink_reference() {
        let (provider, session) = setup();
        let (_recording, sink) = sink();
        let before = Arc::strong_count(&sink);

        let err = session
            .subscribe(&sink, "Instance Modification", "Win32_Process")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Registration { .. }));
        assert_eq!(Arc::strong_count(&sink), before);
        assert_eq!(provider.active_registrations(), 0);

        let err = session
            .subscribe(&sink, "NoSuchEvent", "Win32_Process")
            .err()
            .unwrap();
        assert_eq!(err.code(), Some(HResult::WBEM_E_INVALID_CLASS));
        assert_eq!(Arc::strong_count(&sink), before);
    }

    #[test]
    fn test_registration_failure_releases_namespace() {
        let (provider, session) = setup();
        provider.fail_registration(HResult::E_FAIL);
        let (_recording, sink) = sink();
        assert!(session
            .subscribe(&sink, event_types::INSTANCE_MODIFICATION, "cimv2\\Win32_Service")
            .is_err());
        assert_eq!(provider.live_services(), 1);
    }

    #[test]
    fn test_stub_creation_failure_is_an_error() {
        let (provider, session) = setup();
        provider.fail_stub_creation(HResult::E_NOINTERFACE);
        let (_recording, sink) = sink();
        let before = Arc::strong_count(&sink);
        let err = session
            .subscribe(&sink, event_types::INSTANCE_MODIFICATION, "Win32_Process")
            .err()
            .unwrap();
        assert!(matches!(err, Error::StubCreation { .. }));
        assert_eq!(Arc::strong_count(&sink), before);
    }

    #[test]
    fn test_namespace_failure_releases_sink_reference() {
        let (_provider, session) = setup();
        let (_recording, sink) = sink();
        let before = Arc::strong_count(&sink);
        let err = session
            .subscribe(&sink, event_types::INSTANCE_MODIFICATION, "missing\\Win32_Process")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Namespace { .. }));
        assert_eq!(Arc::strong_count(&sink), before);
    }

    #[test]
    fn test_apartment_shared_across_subscriptions() {
        let (provider, session) = setup();
        let (_recording, sink) = sink();
        let _a = session
            .subscribe(&sink, event_types::INSTANCE_CREATION, "Win32_Process")
            .unwrap();
        let _b = session
            .subscribe(&sink, event_types::INSTANCE_DELETION, "Win32_Process")
            .unwrap();
        assert_eq!(provider.apartments_created(), 1);
        assert_eq!(provider.active_registrations(), 2);
    }

    #[test]
    fn test_poll_interval_from_config() {
        let provider = MemoryProvider::new();
        let config = BridgeConfig {
            event_poll_interval_secs: 5,
            ..BridgeConfig::default()
        };
        let session = Session::connect(Box::new(provider), config).unwrap();
        let (_recording, sink) = sink();
        let subscription = session
            .subscribe(&sink, event_types::INSTANCE_OPERATION, "Win32_Process")
            .unwrap();
        assert!(subscription.query().contains("WITHIN 5"));
    }

    #[test]
    fn test_panicking_sink_does_not_stop_delivery() {
        let (provider, session) = setup();
        let failing: Arc<dyn EventSink> = Arc::new(CallbackSink::new(|_| panic!("handler failed")));
        let (recording, sink) = sink();
        let _failing = session
            .subscribe(&failing, event_types::INSTANCE_CREATION, "Win32_Process")
            .unwrap();
        let _recording = session
            .subscribe(&sink, event_types::INSTANCE_CREATION, "Win32_Process")
            .unwrap();

        let process = MemoryObject::new("Win32_Process").with("ProcessId", 4242);
        assert_eq!(provider.raise("ROOT", "InstanceCreationEvent", &process), 2);
        assert_eq!(recording.trees.lock().unwrap().len(), 1);
    }
}
