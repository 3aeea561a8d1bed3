// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! In-process provider
//!
//! Holds a namespace tree of class instances and answers the same calls the
//! COM provider does: `SELECT * FROM <class>` queries, `__<Event>` notification
//! queries, namespace opening and object stub creation. Failures can be
//! injected at every step so error paths can be exercised without a live
//! WMI service.
//!
//! # Examples
//!
//! ```
//! use wbridgelib::provider::memory::{MemoryObject, MemoryProvider};
//!
//! let provider = MemoryProvider::new();
//! provider.insert(
//!     "ROOT\\cimv2",
//!     MemoryObject::new("Win32_Process")
//!         .with("Name", "System")
//!         .with("ProcessId", 4),
//! );
//! assert_eq!(provider.instance_count("ROOT\\cimv2", "Win32_Process"), 1);
//! ```

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use super::{
    ClassObject, Connector, EventSink, ForeignObject, ObjectEnumerator, ObjectSink, ObjectStub,
    QueryFlags, Services, Timeout, UnsecuredApartment,
};
use crate::error::{BootstrapFailure, BootstrapStage, HResult};
use crate::variant::Variant;

/// Event classes accepted in notification queries
const INTRINSIC_EVENTS: &[&str] = &[
    "__InstanceCreationEvent",
    "__InstanceDeletionEvent",
    "__InstanceModificationEvent",
    "__InstanceOperationEvent",
];

/// Unsupported query language (`WBEM_E_INVALID_QUERY_TYPE`)
const WBEM_E_INVALID_QUERY_TYPE: HResult = HResult(0x8004_1018_u32 as i32);

struct ObjectData {
    class: String,
    properties: RefCell<Vec<(String, Variant)>>,
    failing: RefCell<HashSet<String>>,
    names_failure: Cell<Option<HResult>>,
}

/// An instance held by the memory provider.
///
/// Clones share state, so an object can be given a property that refers
/// back to itself.
#[derive(Clone)]
pub struct MemoryObject {
    data: Rc<ObjectData>,
}

impl MemoryObject {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            data: Rc::new(ObjectData {
                class: class.into(),
                properties: RefCell::new(Vec::new()),
                failing: RefCell::new(HashSet::new()),
                names_failure: Cell::new(None),
            }),
        }
    }

    /// Add or replace a property
    pub fn with(self, name: impl Into<String>, value: impl Into<Variant>) -> Self {
        self.set(name, value);
        self
    }

    /// Property whose value is this embedded object
    pub fn with_object(self, name: impl Into<String>, object: MemoryObject) -> Self {
        self.set(name, Variant::object(object));
        self
    }

    /// Property that is enumerated but whose retrieval fails
    pub fn with_failing(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.data.failing.borrow_mut().insert(name.clone());
        if !self.has_property(&name) {
            self.data.properties.borrow_mut().push((name, Variant::Empty));
        }
        self
    }

    /// Make property-name enumeration fail
    pub fn with_names_failure(self, code: HResult) -> Self {
        self.data.names_failure.set(Some(code));
        self
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Variant>) {
        let name = name.into();
        let value = value.into();
        let mut properties = self.data.properties.borrow_mut();
        match properties.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(slot) => slot.1 = value,
            None => properties.push((name, value)),
        }
    }

    pub fn class(&self) -> &str {
        &self.data.class
    }

    fn has_property(&self, name: &str) -> bool {
        self.data
            .properties
            .borrow()
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    fn system_property(&self, name: &str) -> Option<Variant> {
        match name.to_ascii_uppercase().as_str() {
            "__CLASS" => Some(Variant::from(self.data.class.as_str())),
            "__GENUS" => Some(Variant::I4(2)),
            "__PROPERTY_COUNT" => Some(Variant::I4(self.data.properties.borrow().len() as i32)),
            _ => None,
        }
    }
}

impl ClassObject for MemoryObject {
    fn property_names(&self) -> Result<Vec<String>, HResult> {
        if let Some(code) = self.data.names_failure.get() {
            return Err(code);
        }
        Ok(self
            .data
            .properties
            .borrow()
            .iter()
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn get(&self, name: &str) -> Result<Variant, HResult> {
        if self.data.failing.borrow().contains(name) {
            return Err(HResult::WBEM_E_NOT_FOUND);
        }
        if let Some(value) = self.system_property(name) {
            return Ok(value);
        }
        self.data
            .properties
            .borrow()
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
            .ok_or(HResult::WBEM_E_NOT_FOUND)
    }
}

impl ForeignObject for MemoryObject {
    fn query_class_object(&self) -> Result<Box<dyn ClassObject>, HResult> {
        Ok(Box::new(self.clone()))
    }
}

/// A foreign object that is not a class object (e.g. an `MSFT_*` helper
/// interface); every cast fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueObject;

impl ForeignObject for OpaqueObject {
    fn query_class_object(&self) -> Result<Box<dyn ClassObject>, HResult> {
        Err(HResult::E_NOINTERFACE)
    }
}

struct SinkCell {
    sink: Arc<dyn EventSink>,
}

struct Registration {
    namespace: String,
    event_class: String,
    target_class: String,
    sink: Weak<SinkCell>,
}

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, BTreeMap<String, Vec<MemoryObject>>>,
    bootstrap_failure: Option<BootstrapFailure>,
    apartment_failure: Option<HResult>,
    stub_failure: Option<HResult>,
    registration_failure: Option<HResult>,
    registrations: Vec<Registration>,
    apartments_created: usize,
    live_services: usize,
    live_enumerators: usize,
}

/// In-process instrumentation provider
#[derive(Clone, Default)]
pub struct MemoryProvider {
    state: Rc<RefCell<State>>,
}

fn key(path: &str) -> String {
    path.trim_matches('\\').to_ascii_lowercase()
}

fn join(parent: &str, child: &str) -> String {
    format!("{}\\{}", parent.trim_end_matches('\\'), child.trim_start_matches('\\'))
}

impl MemoryProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.add_namespace("ROOT");
        provider
    }

    /// Register an (empty) namespace by full path, e.g. `ROOT\cimv2`
    pub fn add_namespace(&self, path: &str) {
        self.state
            .borrow_mut()
            .namespaces
            .entry(key(path))
            .or_default();
    }

    /// Add an instance to a namespace, creating the namespace if needed
    pub fn insert(&self, namespace: &str, object: MemoryObject) {
        let class = object.class().to_ascii_lowercase();
        self.state
            .borrow_mut()
            .namespaces
            .entry(key(namespace))
            .or_default()
            .entry(class)
            .or_default()
            .push(object);
    }

    pub fn instance_count(&self, namespace: &str, class: &str) -> usize {
        self.state
            .borrow()
            .namespaces
            .get(&key(namespace))
            .and_then(|classes| classes.get(&class.to_ascii_lowercase()))
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Fail the bootstrap at `stage`
    pub fn fail_bootstrap(&self, stage: BootstrapStage, code: HResult) {
        self.state.borrow_mut().bootstrap_failure = Some(BootstrapFailure::new(stage, code));
    }

    pub fn fail_apartment(&self, code: HResult) {
        self.state.borrow_mut().apartment_failure = Some(code);
    }

    /// Remove every injected failure
    pub fn clear_failures(&self) {
        let mut state = self.state.borrow_mut();
        state.bootstrap_failure = None;
        state.apartment_failure = None;
        state.stub_failure = None;
        state.registration_failure = None;
    }

    pub fn fail_stub_creation(&self, code: HResult) {
        self.state.borrow_mut().stub_failure = Some(code);
    }

    pub fn fail_registration(&self, code: HResult) {
        self.state.borrow_mut().registration_failure = Some(code);
    }

    /// Number of unsecured apartments created so far
    pub fn apartments_created(&self) -> usize {
        self.state.borrow().apartments_created
    }

    /// Service handles not yet released, root included
    pub fn live_services(&self) -> usize {
        self.state.borrow().live_services
    }

    /// Enumerators not yet released
    pub fn live_enumerators(&self) -> usize {
        self.state.borrow().live_enumerators
    }

    /// Registrations whose wrapped sink is still alive
    pub fn active_registrations(&self) -> usize {
        self.state
            .borrow()
            .registrations
            .iter()
            .filter(|r| r.sink.strong_count() > 0)
            .count()
    }

    /// Raise an intrinsic event (`event_type` without the `__` prefix) for
    /// `target` in `namespace`. Returns the number of sinks notified.
    pub fn raise(&self, namespace: &str, event_type: &str, target: &MemoryObject) -> usize {
        let namespace = key(namespace);
        let event_class = format!("__{}", event_type);

        let sinks: Vec<Arc<dyn EventSink>> = {
            let mut state = self.state.borrow_mut();
            state.registrations.retain(|r| r.sink.strong_count() > 0);
            state
                .registrations
                .iter()
                .filter(|r| {
                    r.namespace == namespace
                        && r.event_class.eq_ignore_ascii_case(&event_class)
                        && r.target_class.eq_ignore_ascii_case(target.class())
                })
                .filter_map(|r| r.sink.upgrade())
                .map(|cell| Arc::clone(&cell.sink))
                .collect()
        };

        for sink in &sinks {
            let event = MemoryObject::new(event_class.clone()).with_object("TargetInstance", target.clone());
            super::deliver(sink.as_ref(), vec![Box::new(event)]);
        }
        sinks.len()
    }

    fn services(&self, path: String) -> Box<dyn Services> {
        self.state.borrow_mut().live_services += 1;
        Box::new(MemoryServices {
            provider: self.clone(),
            path,
        })
    }
}

impl Connector for MemoryProvider {
    fn connect_root(&self, namespace: &str) -> Result<Box<dyn Services>, BootstrapFailure> {
        if let Some(failure) = self.state.borrow().bootstrap_failure {
            return Err(failure);
        }
        if !self.state.borrow().namespaces.contains_key(&key(namespace)) {
            return Err(BootstrapFailure::new(
                BootstrapStage::Connect,
                HResult::WBEM_E_INVALID_NAMESPACE,
            ));
        }
        Ok(self.services(namespace.to_string()))
    }

    fn create_unsecured_apartment(&self) -> Result<Box<dyn UnsecuredApartment>, HResult> {
        let mut state = self.state.borrow_mut();
        if let Some(code) = state.apartment_failure {
            return Err(code);
        }
        state.apartments_created += 1;
        Ok(Box::new(MemoryApartment {
            provider: self.clone(),
        }))
    }
}

struct MemoryServices {
    provider: MemoryProvider,
    path: String,
}

impl Drop for MemoryServices {
    fn drop(&mut self) {
        self.provider.state.borrow_mut().live_services -= 1;
    }
}

/// Parse `SELECT * FROM <class>`
fn parse_select_all(query: &str) -> Option<&str> {
    let mut words = query.split_whitespace();
    let select = words.next()?;
    let star = words.next()?;
    let from = words.next()?;
    let class = words.next()?;
    if words.next().is_some()
        || !select.eq_ignore_ascii_case("SELECT")
        || star != "*"
        || !from.eq_ignore_ascii_case("FROM")
    {
        return None;
    }
    Some(class)
}

/// Parse `SELECT * FROM <event> WITHIN <n> WHERE TargetInstance ISA '<class>'`
fn parse_event_query(query: &str) -> Option<(&str, &str)> {
    let words: Vec<&str> = query.split_whitespace().collect();
    if words.len() != 10 {
        return None;
    }
    let keywords = [(0, "SELECT"), (2, "FROM"), (4, "WITHIN"), (6, "WHERE"), (7, "TargetInstance"), (8, "ISA")];
    if words[1] != "*" || keywords.iter().any(|(i, kw)| !words[*i].eq_ignore_ascii_case(kw)) {
        return None;
    }
    words[5].parse::<u32>().ok().filter(|secs| *secs > 0)?;
    let class = words[9].strip_prefix('\'')?.strip_suffix('\'')?;
    Some((words[3], class))
}

impl Services for MemoryServices {
    fn open_namespace(&self, namespace: &str) -> Result<Box<dyn Services>, HResult> {
        let path = join(&self.path, namespace);
        if !self.provider.state.borrow().namespaces.contains_key(&key(&path)) {
            return Err(HResult::WBEM_E_INVALID_NAMESPACE);
        }
        Ok(self.provider.services(path))
    }

    fn exec_query(
        &self,
        language: &str,
        query: &str,
        _flags: QueryFlags,
    ) -> Result<Box<dyn ObjectEnumerator>, HResult> {
        if !language.eq_ignore_ascii_case("WQL") {
            return Err(WBEM_E_INVALID_QUERY_TYPE);
        }
        let class = parse_select_all(query).ok_or(HResult::WBEM_E_INVALID_QUERY)?;

        let mut state = self.provider.state.borrow_mut();
        let instances = state
            .namespaces
            .get(&key(&self.path))
            .and_then(|classes| classes.get(&class.to_ascii_lowercase()))
            .cloned()
            .ok_or(HResult::WBEM_E_INVALID_CLASS)?;
        state.live_enumerators += 1;

        Ok(Box::new(MemoryEnumerator {
            provider: self.provider.clone(),
            pending: instances.into(),
        }))
    }

    fn exec_notification_query_async(
        &self,
        language: &str,
        query: &str,
        _flags: QueryFlags,
        sink: &dyn ObjectSink,
    ) -> Result<(), HResult> {
        if !language.eq_ignore_ascii_case("WQL") {
            return Err(WBEM_E_INVALID_QUERY_TYPE);
        }
        let (event_class, target_class) =
            parse_event_query(query).ok_or(HResult::WBEM_E_INVALID_QUERY)?;
        if !INTRINSIC_EVENTS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(event_class))
        {
            return Err(HResult::WBEM_E_INVALID_CLASS);
        }
        let sink = sink
            .as_any()
            .downcast_ref::<MemoryObjectSink>()
            .ok_or(HResult::E_NOINTERFACE)?;

        let mut state = self.provider.state.borrow_mut();
        if let Some(code) = state.registration_failure {
            return Err(code);
        }
        state.registrations.push(Registration {
            namespace: key(&self.path),
            event_class: event_class.to_string(),
            target_class: target_class.to_string(),
            sink: Rc::downgrade(&sink.cell),
        });
        Ok(())
    }
}

struct MemoryEnumerator {
    provider: MemoryProvider,
    pending: VecDeque<MemoryObject>,
}

impl ObjectEnumerator for MemoryEnumerator {
    fn next_object(&mut self, _timeout: Timeout) -> Result<Option<Box<dyn ClassObject>>, HResult> {
        Ok(self
            .pending
            .pop_front()
            .map(|object| Box::new(object) as Box<dyn ClassObject>))
    }
}

impl Drop for MemoryEnumerator {
    fn drop(&mut self) {
        self.provider.state.borrow_mut().live_enumerators -= 1;
    }
}

struct MemoryApartment {
    provider: MemoryProvider,
}

impl UnsecuredApartment for MemoryApartment {
    fn create_object_stub(&self, sink: Arc<dyn EventSink>) -> Result<Box<dyn ObjectStub>, HResult> {
        if let Some(code) = self.provider.state.borrow().stub_failure {
            return Err(code);
        }
        Ok(Box::new(MemoryStub { sink }))
    }
}

struct MemoryStub {
    sink: Arc<dyn EventSink>,
}

impl ObjectStub for MemoryStub {
    fn query_object_sink(&self) -> Result<Box<dyn ObjectSink>, HResult> {
        Ok(Box::new(MemoryObjectSink {
            cell: Rc::new(SinkCell {
                sink: Arc::clone(&self.sink),
            }),
        }))
    }
}

struct MemoryObjectSink {
    cell: Rc<SinkCell>,
}

impl ObjectSink for MemoryObjectSink {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_properties_in_insertion_order() {
        let object = MemoryObject::new("Win32_Service")
            .with("Name", "Spooler")
            .with("State", "Running")
            .with("AcceptStop", true);
        assert_eq!(
            object.property_names().unwrap(),
            vec!["Name", "State", "AcceptStop"]
        );
        assert!(matches!(object.get("state"), Ok(Variant::String(s)) if s == "Running"));
    }

    #[test]
    fn test_system_properties_not_enumerated() {
        let object = MemoryObject::new("Win32_Service").with("Name", "Spooler");
        assert_eq!(object.property_names().unwrap(), vec!["Name"]);
        assert_eq!(object.class_name().as_deref(), Some("Win32_Service"));
    }

    #[test]
    fn test_failing_property_is_enumerated() {
        let object = MemoryObject::new("Win32_Process").with_failing("CommandLine");
        assert_eq!(object.property_names().unwrap(), vec!["CommandLine"]);
        assert_eq!(object.get("CommandLine").unwrap_err(), HResult::WBEM_E_NOT_FOUND);
    }

    #[test]
    fn test_opaque_object_cast_fails() {
        assert_eq!(
            OpaqueObject.query_class_object().err(),
            Some(HResult::E_NOINTERFACE)
        );
    }

    #[test]
    fn test_parse_select_all() {
        assert_eq!(parse_select_all("SELECT * FROM Win32_Process"), Some("Win32_Process"));
        assert_eq!(parse_select_all("select *  from  Foo"), Some("Foo"));
        assert_eq!(parse_select_all("SELECT Name FROM Foo"), None);
        assert_eq!(parse_select_all("SELECT * FROM"), None);
    }

    #[test]
    fn test_parse_event_query() {
        let query = "SELECT * FROM __InstanceModificationEvent WITHIN 1 WHERE TargetInstance ISA 'Win32_Process'";
        assert_eq!(
            parse_event_query(query),
            Some(("__InstanceModificationEvent", "Win32_Process"))
        );
        assert_eq!(
            parse_event_query("SELECT * FROM __X WITHIN 0 WHERE TargetInstance ISA 'Y'"),
            None
        );
        assert_eq!(
            parse_event_query("SELECT * FROM __Bad Event WITHIN 1 WHERE TargetInstance ISA 'Y'"),
            None
        );
    }

    #[test]
    fn test_connect_and_open_namespace() {
        let provider = MemoryProvider::new();
        provider.add_namespace("ROOT\\cimv2");
        let root = provider.connect_root("ROOT").unwrap();
        assert_eq!(provider.live_services(), 1);
        {
            let _cimv2 = root.open_namespace("cimv2").unwrap();
            assert_eq!(provider.live_services(), 2);
        }
        assert_eq!(provider.live_services(), 1);
        assert_eq!(
            root.open_namespace("missing").err(),
            Some(HResult::WBEM_E_INVALID_NAMESPACE)
        );
    }

    #[test]
    fn test_injected_bootstrap_failure() {
        let provider = MemoryProvider::new();
        provider.fail_bootstrap(BootstrapStage::Locator, HResult::E_FAIL);
        let failure = provider.connect_root("ROOT").err().unwrap();
        assert_eq!(failure.stage, BootstrapStage::Locator);
    }

    #[test]
    fn test_enumerator_drains_in_order() {
        let provider = MemoryProvider::new();
        for pid in [4, 8, 15] {
            provider.insert("ROOT", MemoryObject::new("Thing").with("Id", pid));
        }
        let root = provider.connect_root("ROOT").unwrap();
        let mut enumerator = root
            .exec_query("WQL", "SELECT * FROM Thing", QueryFlags::NONE)
            .unwrap();
        let mut ids = Vec::new();
        while let Some(object) = enumerator.next_object(Timeout::Infinite).unwrap() {
            if let Ok(Variant::I4(id)) = object.get("Id") {
                ids.push(id);
            }
        }
        assert_eq!(ids, vec![4, 8, 15]);
        drop(enumerator);
        assert_eq!(provider.live_enumerators(), 0);
    }
}
