// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Provider abstraction
//!
//! The instrumentation provider is reached through a small set of traits
//! mirroring the COM interfaces the bridge needs:
//!
//! | Trait                | COM counterpart        |
//! |----------------------|------------------------|
//! | [`Connector`]        | `IWbemLocator` + bootstrap |
//! | [`Services`]         | `IWbemServices`        |
//! | [`ObjectEnumerator`] | `IEnumWbemClassObject` |
//! | [`ClassObject`]      | `IWbemClassObject`     |
//! | [`ForeignObject`]    | `IUnknown`             |
//! | [`UnsecuredApartment`] | `IUnsecuredApartment` |
//! | [`ObjectSink`]       | `IWbemObjectSink` (stub side) |
//!
//! Handles are released when the boxed trait object is dropped.
//!
//! Backends:
//! - [`windows`]: the real COM provider (Windows only)
//! - [`memory`]: an in-process provider for tests and offline use

use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::{BootstrapFailure, HResult};
use crate::variant::Variant;

pub mod memory;
#[cfg(windows)]
pub mod windows;

/// Flags accepted by query submission calls (`WBEM_FLAG_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct QueryFlags(u32);

impl QueryFlags {
    pub const NONE: QueryFlags = QueryFlags(0);
    /// `WBEM_FLAG_RETURN_IMMEDIATELY`
    pub const RETURN_IMMEDIATELY: QueryFlags = QueryFlags(0x10);
    /// `WBEM_FLAG_FORWARD_ONLY`
    pub const FORWARD_ONLY: QueryFlags = QueryFlags(0x20);
    /// `WBEM_FLAG_SEND_STATUS`
    pub const SEND_STATUS: QueryFlags = QueryFlags(0x80);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for QueryFlags {
    type Output = QueryFlags;

    fn bitor(self, rhs: QueryFlags) -> QueryFlags {
        QueryFlags(self.0 | rhs.0)
    }
}

/// Wait bound for a single enumerator step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// `WBEM_INFINITE`
    Infinite,
    Millis(u32),
}

/// Kind of intermediate report delivered through [`EventSink::set_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    /// `WBEM_STATUS_COMPLETE`
    Complete,
    /// `WBEM_STATUS_REQUIREMENTS`
    Requirements,
    /// `WBEM_STATUS_PROGRESS`
    Progress,
    Other(i32),
}

impl StatusKind {
    pub fn from_raw(flags: i32) -> Self {
        match flags {
            0 => StatusKind::Complete,
            1 => StatusKind::Requirements,
            2 => StatusKind::Progress,
            other => StatusKind::Other(other),
        }
    }
}

/// Intermediate or final status report for an asynchronous call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkStatus {
    pub kind: StatusKind,
    pub code: HResult,
    pub message: Option<String>,
}

/// An instance of an instrumentation class
pub trait ClassObject {
    /// Non-system property names, in enumeration order
    fn property_names(&self) -> Result<Vec<String>, HResult>;

    /// Current value of one property. System properties (`__CLASS`,
    /// `__PATH`, ...) can be read even though they are not enumerated.
    fn get(&self, name: &str) -> Result<Variant, HResult>;

    /// Class this object is an instance of
    fn class_name(&self) -> Option<String> {
        match self.get("__CLASS") {
            Ok(Variant::String(name)) => Some(name),
            _ => None,
        }
    }
}

/// An untyped foreign object carried inside a property value.
///
/// Implementations must report a failed cast through the error value; the
/// marshaler additionally contains panics raised here.
pub trait ForeignObject {
    /// Reinterpret this object as a class object
    fn query_class_object(&self) -> Result<Box<dyn ClassObject>, HResult>;
}

/// Forward-only cursor over query results
pub trait ObjectEnumerator {
    /// Pull at most one object. `Ok(None)` means the enumerator returned
    /// zero objects and is exhausted.
    fn next_object(&mut self, timeout: Timeout) -> Result<Option<Box<dyn ClassObject>>, HResult>;
}

/// A connection scoped to one namespace
pub trait Services {
    /// Open a namespace relative to this one
    fn open_namespace(&self, namespace: &str) -> Result<Box<dyn Services>, HResult>;

    /// Submit a synchronous query
    fn exec_query(
        &self,
        language: &str,
        query: &str,
        flags: QueryFlags,
    ) -> Result<Box<dyn ObjectEnumerator>, HResult>;

    /// Register an event query whose results are delivered to `sink`
    fn exec_notification_query_async(
        &self,
        language: &str,
        query: &str,
        flags: QueryFlags,
        sink: &dyn ObjectSink,
    ) -> Result<(), HResult>;
}

/// Performs the bootstrap sequence and produces the root service handle
pub trait Connector {
    /// Create the locator, connect to `namespace` and secure the proxy
    fn connect_root(&self, namespace: &str) -> Result<Box<dyn Services>, BootstrapFailure>;

    /// Create the factory used to wrap event sinks for cross-apartment delivery
    fn create_unsecured_apartment(&self) -> Result<Box<dyn UnsecuredApartment>, HResult>;
}

/// Factory for object stubs around caller-implemented event sinks
pub trait UnsecuredApartment {
    fn create_object_stub(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn ObjectStub>, HResult>;
}

/// A stub wrapping an event sink
pub trait ObjectStub {
    /// Query the stub for the object sink interface
    fn query_object_sink(&self) -> Result<Box<dyn ObjectSink>, HResult>;
}

/// Provider-side handle of a wrapped event sink.
///
/// Opaque to callers; backends downcast it to their own type when a query
/// is registered against it.
pub trait ObjectSink {
    fn as_any(&self) -> &dyn Any;
}

/// Caller-implemented receiver of asynchronous notifications.
///
/// Invoked from the provider's own thread, possibly while synchronous calls
/// are running on the session.
pub trait EventSink: Send + Sync {
    /// One or more event objects arrived
    fn indicate(&self, objects: Vec<Box<dyn ClassObject>>);

    /// Intermediate or final status of the registration
    fn set_status(&self, _status: SinkStatus) {}
}

/// Hand `objects` to `sink` on the provider's thread.
///
/// A panicking sink is logged and contained; it never unwinds into the
/// provider. Returns false when the sink panicked.
pub(crate) fn deliver(sink: &dyn EventSink, objects: Vec<Box<dyn ClassObject>>) -> bool {
    let count = objects.len();
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.indicate(objects))).is_ok();
    if !delivered {
        log::error!("Event sink panicked while handling {} objects", count);
    }
    delivered
}

/// [`deliver`] for status reports
pub(crate) fn deliver_status(sink: &dyn EventSink, status: SinkStatus) -> bool {
    let delivered = panic::catch_unwind(AssertUnwindSafe(|| sink.set_status(status))).is_ok();
    if !delivered {
        log::error!("Event sink panicked while handling a status report");
    }
    delivered
}

/// Event callback type
pub type EventCallback = Box<dyn Fn(Vec<Box<dyn ClassObject>>) + Send + Sync>;

/// [`EventSink`] backed by a closure
pub struct CallbackSink {
    on_event: EventCallback,
}

impl CallbackSink {
    pub fn new<F>(on_event: F) -> Self
    where
        F: Fn(Vec<Box<dyn ClassObject>>) + Send + Sync + 'static,
    {
        Self {
            on_event: Box::new(on_event),
        }
    }
}

impl EventSink for CallbackSink {
    fn indicate(&self, objects: Vec<Box<dyn ClassObject>>) {
        (self.on_event)(objects)
    }

    fn set_status(&self, status: SinkStatus) {
        if status.code.is_failure() {
            log::warn!("Event sink status {:?}: error code = {}", status.kind, status.code);
        } else {
            log::debug!("Event sink status {:?}", status.kind);
        }
    }
}

impl fmt::Debug for CallbackSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSink").finish_non_exhaustive()
    }
}
