// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (c) 2026 nervosys

//! Property marshaling
//!
//! Turns the properties of a class object into text. Every value is
//! converted by one exhaustive match over [`Variant`]; values the bridge
//! cannot convert become inline diagnostic text so that one bad property
//! never hides the rest of the object.

use std::panic::{self, AssertUnwindSafe};

use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::provider::{ClassObject, ForeignObject};
use crate::variant::{ArrayData, SafeArray, VarType, Variant};

/// Text for a single embedded object that is not a class object
pub const UNKNOWN_TYPE: &str = "VARIANT type unknown";
/// Text for an array element that is not a class object
pub const NON_OBJECT_ELEMENT: &str = "Array element is not a class object";
/// Text for an array whose storage could not be read
pub const INACCESSIBLE_ARRAY: &str = "Array of VARIANT type unknown";
/// Text for an embedded object beyond the configured depth
pub const DEPTH_LIMIT: &str = "Nested object depth limit reached";

/// Diagnostic text for a tag the bridge does not convert
pub fn unsupported(vt: VarType) -> String {
    format!("VARIANT type unsupported: 0x{:x}", vt)
}

/// One named property value
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: Variant,
}

/// Properties of one object in enumeration order
pub type PropertyMap = Vec<Property>;

/// Reinterpret a foreign object as a class object.
///
/// Any failure of the cast, including a panic in the provider, means "not
/// a class object".
pub fn reinterpret(foreign: &dyn ForeignObject) -> Option<Box<dyn ClassObject>> {
    match panic::catch_unwind(AssertUnwindSafe(|| foreign.query_class_object())) {
        Ok(Ok(object)) => Some(object),
        Ok(Err(code)) => {
            log::trace!("Cast to class object failed: error code = {}", code);
            None
        }
        Err(_) => {
            log::warn!("Cast to class object panicked; treating value as opaque");
            None
        }
    }
}

/// Converts class objects and their property values to text and trees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marshaler {
    pub(crate) max_depth: Option<usize>,
    pub(crate) indentation: String,
}

impl Default for Marshaler {
    fn default() -> Self {
        Self {
            max_depth: None,
            indentation: "\t".into(),
        }
    }
}

impl Marshaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            indentation: config.indentation.clone(),
        }
    }

    /// Stop expanding embedded objects deeper than `depth` levels
    pub fn with_max_depth(mut self, depth: Option<usize>) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_indentation(mut self, indentation: impl Into<String>) -> Self {
        self.indentation = indentation.into();
        self
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }

    pub fn indentation(&self) -> &str {
        &self.indentation
    }

    /// Read every non-system property of `object`.
    ///
    /// Fails only when the names cannot be enumerated. A property whose
    /// value cannot be read is kept with [`Variant::Empty`].
    pub fn property_map(&self, object: &dyn ClassObject) -> Result<PropertyMap> {
        let names = object
            .property_names()
            .map_err(|code| Error::PropertyNames { code })?;

        Ok(names
            .into_iter()
            .map(|name| {
                let value = object.get(&name).unwrap_or_else(|code| {
                    log::debug!("Failed to read property {}: error code = {}", name, code);
                    Variant::Empty
                });
                Property { name, value }
            })
            .collect())
    }

    /// Text form of a property value
    pub fn value_to_text(&self, value: &Variant) -> String {
        self.text_at(value, 0)
    }

    pub(crate) fn text_at(&self, value: &Variant, depth: usize) -> String {
        match value {
            Variant::Empty | Variant::Null => String::new(),
            Variant::String(s) => s.clone(),
            Variant::Bool(raw) => (*raw != 0).to_string(),
            Variant::I2(v) => v.to_string(),
            Variant::I4(v) => v.to_string(),
            Variant::R8(v) => v.to_string(),
            Variant::UI1(v) => v.to_string(),
            Variant::Unknown(foreign) => match reinterpret(foreign.as_ref()) {
                Some(object) => self.nested_text(object.as_ref(), depth + 1),
                None => UNKNOWN_TYPE.to_string(),
            },
            Variant::Array(array) => self.array_text(array, depth),
            Variant::Unsupported(vt) => unsupported(*vt),
        }
    }

    fn array_text(&self, array: &SafeArray, depth: usize) -> String {
        let data = array.data();
        let element = |index: i32| -> String {
            let slot = array.slot(index);
            match data {
                ArrayData::I4(values) => slot.map(|i| values[i].to_string()).unwrap_or_default(),
                ArrayData::String(values) => slot.map(|i| values[i].clone()).unwrap_or_default(),
                ArrayData::UI1(values) => slot.map(|i| values[i].to_string()).unwrap_or_default(),
                ArrayData::Unknown(values) => slot
                    .and_then(|i| reinterpret(values[i].as_ref()))
                    .map(|object| self.nested_text(object.as_ref(), depth + 1))
                    .unwrap_or_else(|| NON_OBJECT_ELEMENT.to_string()),
                ArrayData::Other(_) | ArrayData::Inaccessible(_) => String::new(),
            }
        };

        match data {
            ArrayData::Other(_) => unsupported(array.var_type()),
            ArrayData::Inaccessible(_) => INACCESSIBLE_ARRAY.to_string(),
            _ => array.indices().map(element).collect::<Vec<_>>().join(" "),
        }
    }

    /// Rendered tree of an embedded object, or inline diagnostics
    fn nested_text(&self, object: &dyn ClassObject, depth: usize) -> String {
        if self.exceeds_depth(depth) {
            return DEPTH_LIMIT.to_string();
        }
        self.tree_at(object, depth)
            .and_then(|tree| tree.render(&self.indentation))
            .unwrap_or_else(|err| err.to_string())
    }

    pub(crate) fn exceeds_depth(&self, depth: usize) -> bool {
        self.max_depth.map_or(false, |max| depth > max)
    }
}
