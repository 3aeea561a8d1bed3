// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Value trees
//!
//! A [`ValueTree`] is the caller-owned result of marshaling an object: leaf
//! text for plain values, an ordered map for embedded objects. It renders as
//! JSON with one indentation unit per nesting level and keys in property
//! enumeration order; downstream reporting parses this text, so the layout
//! is kept stable.

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{Error, Result};
use crate::marshal::{reinterpret, Marshaler, DEPTH_LIMIT, UNKNOWN_TYPE};
use crate::provider::ClassObject;
use crate::variant::Variant;

/// Marshaled form of a class object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueTree {
    Leaf(String),
    Node(Vec<(String, ValueTree)>),
}

impl Default for ValueTree {
    fn default() -> Self {
        ValueTree::Node(Vec::new())
    }
}

impl ValueTree {
    /// Interior node without children
    pub fn empty() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing entry in place. A leaf becomes a
    /// node first.
    pub fn insert(&mut self, key: impl Into<String>, value: ValueTree) {
        let key = key.into();
        if let ValueTree::Leaf(_) = self {
            *self = ValueTree::empty();
        }
        if let ValueTree::Node(entries) = self {
            match entries.iter_mut().find(|(k, _)| *k == key) {
                Some(entry) => entry.1 = value,
                None => entries.push((key, value)),
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&ValueTree> {
        match self {
            ValueTree::Node(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            ValueTree::Leaf(_) => None,
        }
    }

    pub fn as_leaf(&self) -> Option<&str> {
        match self {
            ValueTree::Leaf(text) => Some(text),
            ValueTree::Node(_) => None,
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        match self {
            ValueTree::Node(entries) => entries.iter().map(|(k, _)| k.as_str()).collect(),
            ValueTree::Leaf(_) => Vec::new(),
        }
    }

    /// Number of direct children
    pub fn len(&self) -> usize {
        match self {
            ValueTree::Node(entries) => entries.len(),
            ValueTree::Leaf(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON text with `indentation` repeated once per nesting level
    pub fn render(&self, indentation: &str) -> Result<String> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indentation.as_bytes());
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)?;
        String::from_utf8(buf)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}

impl Serialize for ValueTree {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ValueTree::Leaf(text) => serializer.serialize_str(text),
            ValueTree::Node(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl Marshaler {
    /// Build the value tree of `object`.
    ///
    /// Properties holding embedded class objects become child nodes; all
    /// other values become leaves with their text form.
    pub fn to_tree(&self, object: &dyn ClassObject) -> Result<ValueTree> {
        self.tree_at(object, 0)
    }

    /// Build the value tree of `object` and render it
    pub fn to_text(&self, object: &dyn ClassObject) -> Result<String> {
        self.to_tree(object)?.render(&self.indentation)
    }

    pub(crate) fn tree_at(&self, object: &dyn ClassObject, depth: usize) -> Result<ValueTree> {
        let mut tree = ValueTree::empty();

        // Each value is dropped as soon as it has been converted.
        for property in self.property_map(object)? {
            let node = match &property.value {
                Variant::Unknown(foreign) => match reinterpret(foreign.as_ref()) {
                    Some(_) if self.exceeds_depth(depth + 1) => ValueTree::Leaf(DEPTH_LIMIT.into()),
                    Some(nested) => self
                        .tree_at(nested.as_ref(), depth + 1)
                        .unwrap_or_else(|err| {
                            log::warn!("Embedded object in {}: {}", property.name, err);
                            ValueTree::Leaf(err.to_string())
                        }),
                    None => ValueTree::Leaf(UNKNOWN_TYPE.into()),
                },
                value => ValueTree::Leaf(self.text_at(value, depth)),
            };
            tree.insert(property.name, node);
        }

        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HResult;
    use crate::provider::memory::{MemoryObject, OpaqueObject};

    fn process() -> MemoryObject {
        MemoryObject::new("Win32_Process")
            .with("Name", "explorer.exe")
            .with("ProcessId", 4242)
            .with("ThreadCount", 37)
    }

    #[test]
    fn test_tree_keys_in_enumeration_order() {
        let tree = Marshaler::new().to_tree(&process()).unwrap();
        assert_eq!(tree.keys(), vec!["Name", "ProcessId", "ThreadCount"]);
        assert_eq!(tree.get("ProcessId").and_then(ValueTree::as_leaf), Some("4242"));
    }

    #[test]
    fn test_render_layout() {
        let text = Marshaler::new().to_text(&process()).unwrap();
        assert_eq!(
            text,
            "{\n\t\"Name\": \"explorer.exe\",\n\t\"ProcessId\": \"4242\",\n\t\"ThreadCount\": \"37\"\n}"
        );
    }

    #[test]
    fn test_nested_object_becomes_child_node() {
        let target = MemoryObject::new("Win32_Service").with("Name", "Spooler");
        let event = MemoryObject::new("__InstanceModificationEvent")
            .with_object("TargetInstance", target)
            .with("TIME_CREATED", "133000000000000000");
        let tree = Marshaler::new().to_tree(&event).unwrap();
        let child = tree.get("TargetInstance").unwrap();
        assert_eq!(child.get("Name").and_then(ValueTree::as_leaf), Some("Spooler"));

        let text = tree.render("\t").unwrap();
        assert!(text.contains("\t\"TargetInstance\": {\n\t\t\"Name\": \"Spooler\"\n\t}"));
    }

    #[test]
    fn test_opaque_object_is_placeholder_leaf() {
        let object = MemoryObject::new("Holder").with("Handle", Variant::object(OpaqueObject));
        let tree = Marshaler::new().to_tree(&object).unwrap();
        assert_eq!(tree.get("Handle").and_then(ValueTree::as_leaf), Some(UNKNOWN_TYPE));
    }

    #[test]
    fn test_string_round_trip() {
        let literal = "C:\\Windows\\System32\\svchost.exe -k \"netsvcs\"\n\tü";
        let object = MemoryObject::new("Win32_Process").with("CommandLine", literal);
        let text = Marshaler::new().to_text(&object).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed["CommandLine"], literal);
    }

    #[test]
    fn test_to_tree_is_idempotent() {
        let object = process().with_object("Owner", MemoryObject::new("Account").with("Sid", "S-1-5-18"));
        let marshaler = Marshaler::new();
        assert_eq!(marshaler.to_tree(&object).unwrap(), marshaler.to_tree(&object).unwrap());
    }

    #[test]
    fn test_object_without_properties_is_empty_node() {
        let tree = Marshaler::new().to_tree(&MemoryObject::new("Empty")).unwrap();
        assert_eq!(tree, ValueTree::empty());
        assert!(tree.is_empty());
        assert_eq!(tree.render("\t").unwrap(), "{}");
    }

    #[test]
    fn test_failed_retrieval_is_empty_leaf() {
        let object = process().with_failing("ExecutablePath");
        let tree = Marshaler::new().to_tree(&object).unwrap();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.get("ExecutablePath").and_then(ValueTree::as_leaf), Some(""));
    }

    #[test]
    fn test_nested_enumeration_failure_is_inline() {
        let broken = MemoryObject::new("Broken").with_names_failure(HResult::WBEM_E_FAILED);
        let object = MemoryObject::new("Holder").with_object("Inner", broken);
        let tree = Marshaler::new().to_tree(&object).unwrap();
        assert_eq!(
            tree.get("Inner").and_then(ValueTree::as_leaf),
            Some("Failed to enumerate property names. Error code = 0x80041001")
        );
    }

    #[test]
    fn test_self_reference_stops_at_depth_limit() {
        let node = MemoryObject::new("Node").with("Label", "loop");
        node.set("Next", Variant::object(node.clone()));
        let tree = Marshaler::new().with_max_depth(Some(2)).to_tree(&node).unwrap();

        let second = tree.get("Next").and_then(|t| t.get("Next")).unwrap();
        assert_eq!(second.get("Label").and_then(ValueTree::as_leaf), Some("loop"));
        assert_eq!(second.get("Next").and_then(ValueTree::as_leaf), Some(DEPTH_LIMIT));
    }

    #[test]
    fn test_insert_replaces_existing_key() {
        let mut tree = ValueTree::empty();
        tree.insert("A", ValueTree::Leaf("1".into()));
        tree.insert("B", ValueTree::Leaf("2".into()));
        tree.insert("A", ValueTree::Leaf("3".into()));
        assert_eq!(tree.keys(), vec!["A", "B"]);
        assert_eq!(tree.get("A").and_then(ValueTree::as_leaf), Some("3"));
    }

    #[test]
    fn test_render_custom_indentation() {
        let mut tree = ValueTree::empty();
        tree.insert("Caption", ValueTree::Leaf("Microsoft Windows 11 Pro".into()));
        assert_eq!(
            tree.render("    ").unwrap(),
            "{\n    \"Caption\": \"Microsoft Windows 11 Pro\"\n}"
        );
    }
}
