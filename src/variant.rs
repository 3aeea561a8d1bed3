//! Typed property values
//!
//! [`Variant`] is the closed set of forms a property value can take once it
//! has been read out of the provider. The tag determines the payload; any tag
//! outside the supported set is kept as [`Variant::Unsupported`] so it can be
//! reported rather than rejected.

use std::fmt;
use std::ops::RangeInclusive;
use std::rc::Rc;

use crate::provider::ForeignObject;

/// Raw `VARTYPE` tag
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarType(pub u16);

impl VarType {
    pub const EMPTY: VarType = VarType(0);
    pub const NULL: VarType = VarType(1);
    pub const I2: VarType = VarType(2);
    pub const I4: VarType = VarType(3);
    pub const R4: VarType = VarType(4);
    pub const R8: VarType = VarType(5);
    pub const DATE: VarType = VarType(7);
    pub const BSTR: VarType = VarType(8);
    pub const BOOL: VarType = VarType(11);
    pub const VARIANT: VarType = VarType(12);
    pub const UNKNOWN: VarType = VarType(13);
    pub const I1: VarType = VarType(16);
    pub const UI1: VarType = VarType(17);
    pub const UI2: VarType = VarType(18);
    pub const UI4: VarType = VarType(19);
    pub const I8: VarType = VarType(20);
    pub const UI8: VarType = VarType(21);
    pub const ARRAY: VarType = VarType(0x2000);

    const TYPE_MASK: u16 = 0x0fff;

    /// Tag of an array whose elements are `element`
    pub fn array_of(element: VarType) -> VarType {
        VarType(Self::ARRAY.0 | (element.0 & Self::TYPE_MASK))
    }

    pub fn is_array(self) -> bool {
        self.0 & Self::ARRAY.0 != 0
    }

    /// Element tag with the array and modifier bits stripped
    pub fn element(self) -> VarType {
        VarType(self.0 & Self::TYPE_MASK)
    }
}

impl fmt::Debug for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarType(0x{:x})", self.0)
    }
}

impl fmt::LowerHex for VarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Element storage of a homogeneous array
#[derive(Clone)]
pub enum ArrayData {
    I4(Vec<i32>),
    String(Vec<String>),
    UI1(Vec<u8>),
    Unknown(Vec<Rc<dyn ForeignObject>>),
    /// Declared element type the bridge does not convert
    Other(VarType),
    /// The array storage could not be accessed
    Inaccessible(VarType),
}

impl ArrayData {
    pub fn element_type(&self) -> VarType {
        match self {
            ArrayData::I4(_) => VarType::I4,
            ArrayData::String(_) => VarType::BSTR,
            ArrayData::UI1(_) => VarType::UI1,
            ArrayData::Unknown(_) => VarType::UNKNOWN,
            ArrayData::Other(vt) | ArrayData::Inaccessible(vt) => *vt,
        }
    }

    /// Number of stored elements
    pub fn stored_len(&self) -> usize {
        match self {
            ArrayData::I4(v) => v.len(),
            ArrayData::String(v) => v.len(),
            ArrayData::UI1(v) => v.len(),
            ArrayData::Unknown(v) => v.len(),
            ArrayData::Other(_) | ArrayData::Inaccessible(_) => 0,
        }
    }
}

impl fmt::Debug for ArrayData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArrayData::I4(v) => f.debug_tuple("I4").field(v).finish(),
            ArrayData::String(v) => f.debug_tuple("String").field(v).finish(),
            ArrayData::UI1(v) => f.debug_tuple("UI1").field(v).finish(),
            ArrayData::Unknown(v) => write!(f, "Unknown(<{} objects>)", v.len()),
            ArrayData::Other(vt) => f.debug_tuple("Other").field(vt).finish(),
            ArrayData::Inaccessible(vt) => f.debug_tuple("Inaccessible").field(vt).finish(),
        }
    }
}

/// One-dimensional array with declared bounds.
///
/// The declared bounds are authoritative: iteration covers
/// `lower..=upper` even when fewer elements are stored.
#[derive(Debug, Clone)]
pub struct SafeArray {
    lower: i32,
    upper: i32,
    data: ArrayData,
}

impl SafeArray {
    pub fn new(lower: i32, upper: i32, data: ArrayData) -> Self {
        Self { lower, upper, data }
    }

    /// Zero-based array whose bounds match the stored elements
    pub fn from_data(data: ArrayData) -> Self {
        let upper = data.stored_len() as i32 - 1;
        Self::new(0, upper, data)
    }

    pub fn lower(&self) -> i32 {
        self.lower
    }

    pub fn upper(&self) -> i32 {
        self.upper
    }

    pub fn data(&self) -> &ArrayData {
        &self.data
    }

    /// Declared element indices, inclusive
    pub fn indices(&self) -> RangeInclusive<i32> {
        self.lower..=self.upper
    }

    /// Number of elements the bounds declare
    pub fn declared_len(&self) -> usize {
        (self.upper as i64 - self.lower as i64 + 1).max(0) as usize
    }

    /// Position in storage of a declared index
    pub fn slot(&self, index: i32) -> Option<usize> {
        let offset = index as i64 - self.lower as i64;
        if offset < 0 || offset >= self.data.stored_len() as i64 {
            None
        } else {
            Some(offset as usize)
        }
    }

    pub fn var_type(&self) -> VarType {
        VarType::array_of(self.data.element_type())
    }
}

/// A property value
#[derive(Clone)]
pub enum Variant {
    Empty,
    Null,
    /// Native boolean: zero is false, anything else is true
    Bool(i16),
    I2(i16),
    I4(i32),
    R8(f64),
    UI1(u8),
    String(String),
    /// Embedded object of unknown interface
    Unknown(Rc<dyn ForeignObject>),
    Array(SafeArray),
    /// Any tag outside the supported set
    Unsupported(VarType),
}

impl Variant {
    /// Native `VARIANT_TRUE` / `VARIANT_FALSE` encoding
    pub fn bool(value: bool) -> Self {
        Variant::Bool(if value { -1 } else { 0 })
    }

    pub fn object<T: ForeignObject + 'static>(object: T) -> Self {
        Variant::Unknown(Rc::new(object))
    }

    pub fn var_type(&self) -> VarType {
        match self {
            Variant::Empty => VarType::EMPTY,
            Variant::Null => VarType::NULL,
            Variant::Bool(_) => VarType::BOOL,
            Variant::I2(_) => VarType::I2,
            Variant::I4(_) => VarType::I4,
            Variant::R8(_) => VarType::R8,
            Variant::UI1(_) => VarType::UI1,
            Variant::String(_) => VarType::BSTR,
            Variant::Unknown(_) => VarType::UNKNOWN,
            Variant::Array(array) => array.var_type(),
            Variant::Unsupported(vt) => *vt,
        }
    }

    /// Null and empty values are absent, not erroneous
    pub fn is_absent(&self) -> bool {
        matches!(self, Variant::Empty | Variant::Null)
    }
}

impl fmt::Debug for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Variant::Empty => write!(f, "Empty"),
            Variant::Null => write!(f, "Null"),
            Variant::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Variant::I2(v) => f.debug_tuple("I2").field(v).finish(),
            Variant::I4(v) => f.debug_tuple("I4").field(v).finish(),
            Variant::R8(v) => f.debug_tuple("R8").field(v).finish(),
            Variant::UI1(v) => f.debug_tuple("UI1").field(v).finish(),
            Variant::String(v) => f.debug_tuple("String").field(v).finish(),
            Variant::Unknown(_) => write!(f, "Unknown(..)"),
            Variant::Array(array) => f.debug_tuple("Array").field(array).finish(),
            Variant::Unsupported(vt) => f.debug_tuple("Unsupported").field(vt).finish(),
        }
    }
}

impl From<&str> for Variant {
    fn from(value: &str) -> Self {
        Variant::String(value.to_string())
    }
}

impl From<String> for Variant {
    fn from(value: String) -> Self {
        Variant::String(value)
    }
}

impl From<bool> for Variant {
    fn from(value: bool) -> Self {
        Variant::bool(value)
    }
}

impl From<i16> for Variant {
    fn from(value: i16) -> Self {
        Variant::I2(value)
    }
}

impl From<i32> for Variant {
    fn from(value: i32) -> Self {
        Variant::I4(value)
    }
}

impl From<f64> for Variant {
    fn from(value: f64) -> Self {
        Variant::R8(value)
    }
}

impl From<u8> for Variant {
    fn from(value: u8) -> Self {
        Variant::UI1(value)
    }
}

impl From<SafeArray> for Variant {
    fn from(value: SafeArray) -> Self {
        Variant::Array(value)
    }
}

impl From<Vec<i32>> for Variant {
    fn from(value: Vec<i32>) -> Self {
        Variant::Array(SafeArray::from_data(ArrayData::I4(value)))
    }
}

impl From<Vec<String>> for Variant {
    fn from(value: Vec<String>) -> Self {
        Variant::Array(SafeArray::from_data(ArrayData::String(value)))
    }
}

impl From<Vec<u8>> for Variant {
    fn from(value: Vec<u8>) -> Self {
        Variant::Array(SafeArray::from_data(ArrayData::UI1(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_tag() {
        let vt = VarType::array_of(VarType::I4);
        assert_eq!(vt, VarType(0x2003));
        assert!(vt.is_array());
        assert_eq!(vt.element(), VarType::I4);
        assert!(!VarType::BSTR.is_array());
    }

    #[test]
    fn test_var_type_lower_hex() {
        assert_eq!(format!("{:x}", VarType::array_of(VarType::R8)), "2005");
        assert_eq!(format!("{:?}", VarType::UI8), "VarType(0x15)");
    }

    #[test]
    fn test_variant_tags() {
        assert_eq!(Variant::from("x").var_type(), VarType::BSTR);
        assert_eq!(Variant::from(true).var_type(), VarType::BOOL);
        assert_eq!(Variant::from(7u8).var_type(), VarType::UI1);
        assert_eq!(Variant::from(vec![1, 2]).var_type(), VarType(0x2003));
        assert_eq!(Variant::Unsupported(VarType::I8).var_type(), VarType::I8);
    }

    #[test]
    fn test_native_bool_encoding() {
        assert!(matches!(Variant::bool(true), Variant::Bool(-1)));
        assert!(matches!(Variant::bool(false), Variant::Bool(0)));
    }

    #[test]
    fn test_safe_array_bounds() {
        let array = SafeArray::new(1, 3, ArrayData::UI1(vec![10, 20, 30]));
        assert_eq!(array.declared_len(), 3);
        assert_eq!(array.slot(1), Some(0));
        assert_eq!(array.slot(3), Some(2));
        assert_eq!(array.slot(0), None);
        assert_eq!(array.slot(4), None);
    }

    #[test]
    fn test_safe_array_declared_beyond_storage() {
        let array = SafeArray::new(0, 4, ArrayData::I4(vec![1, 2]));
        assert_eq!(array.declared_len(), 5);
        assert_eq!(array.slot(2), None);
    }

    #[test]
    fn test_empty_array_from_data() {
        let array = SafeArray::from_data(ArrayData::String(Vec::new()));
        assert_eq!(array.declared_len(), 0);
        assert_eq!(array.indices().count(), 0);
    }

    #[test]
    fn test_absent_values() {
        assert!(Variant::Empty.is_absent());
        assert!(Variant::Null.is_absent());
        assert!(!Variant::I4(0).is_absent());
    }
}
