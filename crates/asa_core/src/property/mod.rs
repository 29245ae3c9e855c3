//! The recursive property-bag model and its codecs.
//!
//! A [`PropertyBag`] is the ordered list of tagged values an object or struct
//! serializes. Every decoded [`Property`] remembers the byte span it came
//! from, which is what the patch engine edits.

mod decode;
mod encode;
pub mod structs;

use std::fmt;

use serde::Serialize;
use uuid::Uuid;

use crate::context::Name;
use crate::layout::{ByteRange, PropertySpan};

pub use decode::PropertyDecoder;
pub use encode::PropertyEncoder;
pub use structs::{WellKnownKind, WellKnownStruct};

pub const STRUCT_PROPERTY: &str = "StructProperty";
pub const ARRAY_PROPERTY: &str = "ArrayProperty";
pub const CUSTOM_ITEM_BYTE_ARRAY: &str = "CustomItemByteArray";

// Object reference payload kinds.
const OBJECT_REF_ID: u16 = 0;
const OBJECT_REF_PATH: u16 = 1;

/// Closed set of property type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PropertyType {
    Bool,
    Int8,
    Int16,
    Int,
    Int64,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Str,
    Name,
    Object,
    SoftObject,
    Byte,
    Struct,
    Array,
    Map,
    Set,
}

const TYPE_NAMES: [(PropertyType, &str); 19] = [
    (PropertyType::Bool, "BoolProperty"),
    (PropertyType::Int8, "Int8Property"),
    (PropertyType::Int16, "Int16Property"),
    (PropertyType::Int, "IntProperty"),
    (PropertyType::Int64, "Int64Property"),
    (PropertyType::UInt16, "UInt16Property"),
    (PropertyType::UInt32, "UInt32Property"),
    (PropertyType::UInt64, "UInt64Property"),
    (PropertyType::Float, "FloatProperty"),
    (PropertyType::Double, "DoubleProperty"),
    (PropertyType::Str, "StrProperty"),
    (PropertyType::Name, "NameProperty"),
    (PropertyType::Object, "ObjectProperty"),
    (PropertyType::SoftObject, "SoftObjectProperty"),
    (PropertyType::Byte, "ByteProperty"),
    (PropertyType::Struct, STRUCT_PROPERTY),
    (PropertyType::Array, ARRAY_PROPERTY),
    (PropertyType::Map, "MapProperty"),
    (PropertyType::Set, "SetProperty"),
];

impl PropertyType {
    pub fn from_name(name: &str) -> Option<Self> {
        TYPE_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        TYPE_NAMES
            .iter()
            .find(|(kind, _)| kind == self)
            .map_or("", |(_, n)| n)
    }

    pub fn all_names() -> impl Iterator<Item = &'static str> {
        TYPE_NAMES.iter().map(|(_, n)| *n)
    }

    /// Types whose payload is read directly, without container structure.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Self::Struct | Self::Array | Self::Map | Self::Set)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of an object reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Id(Uuid),
    Path(Name),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SoftObjectPath {
    pub asset: Name,
    pub sub_path: String,
}

/// A byte property that carries an enum name instead of a raw byte.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnumValue {
    pub enum_type: Name,
    pub value: Name,
}

impl fmt::Display for EnumValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.enum_type, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StructBody {
    Fixed(WellKnownStruct),
    Bag(PropertyBag),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructValue {
    pub struct_type: Name,
    #[serde(skip)]
    pub guid: [u8; 16],
    pub body: StructBody,
}

impl StructValue {
    pub fn bag(&self) -> Option<&PropertyBag> {
        match &self.body {
            StructBody::Bag(bag) => Some(bag),
            StructBody::Fixed(_) => None,
        }
    }

    pub fn fixed(&self) -> Option<&WellKnownStruct> {
        match &self.body {
            StructBody::Fixed(s) => Some(s),
            StructBody::Bag(_) => None,
        }
    }
}

/// The shared header in front of struct-element arrays and struct-valued
/// maps.
#[derive(Debug, Clone, Serialize)]
pub struct StructHeader {
    pub name: Name,
    pub type_name: Name,
    pub inner_size: u32,
    pub struct_type: Name,
    #[serde(skip)]
    pub guid: [u8; 16],
    pub size_byte: Option<u8>,
    pub position: Option<u32>,
    /// Offset of `inner_size` and the bytes it counts, when decoded.
    #[serde(skip)]
    pub size_field: usize,
    #[serde(skip)]
    pub body: ByteRange,
}

impl PartialEq for StructHeader {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.type_name == other.type_name
            && self.struct_type == other.struct_type
            && self.guid == other.guid
            && self.size_byte == other.size_byte
            && self.position == other.position
    }
}

impl StructHeader {
    /// A header for an array of `struct_type` elements, as written by a save
    /// of `version`.
    pub fn for_array(name: impl Into<Name>, struct_type: impl Into<Name>, version: u16) -> Self {
        let extended = version >= crate::context::EXTENDED_HEADER_VERSION;
        Self {
            name: name.into(),
            type_name: Name::new(STRUCT_PROPERTY),
            inner_size: 0,
            struct_type: struct_type.into(),
            guid: [0; 16],
            size_byte: extended.then_some(0),
            position: extended.then_some(0),
            size_field: 0,
            body: ByteRange::default(),
        }
    }

    /// Whether a position word follows the size byte.
    pub fn has_position(size_byte: u8, in_array: bool) -> bool {
        (size_byte != 0 && size_byte != 8) || (in_array && size_byte == 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ArrayElements {
    Bytes(Vec<u8>),
    Scalars(Vec<Value>),
    Structs {
        header: StructHeader,
        items: Vec<StructValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayValue {
    pub element_type: Name,
    pub elements: ArrayElements,
}

impl ArrayValue {
    pub fn len(&self) -> usize {
        match &self.elements {
            ArrayElements::Bytes(b) => b.len(),
            ArrayElements::Scalars(v) => v.len(),
            ArrayElements::Structs { items, .. } => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements as owned values; byte arrays expand to [`Value::Byte`].
    pub fn values(&self) -> Vec<Value> {
        match &self.elements {
            ArrayElements::Bytes(b) => b.iter().copied().map(Value::Byte).collect(),
            ArrayElements::Scalars(v) => v.clone(),
            ArrayElements::Structs { items, .. } => {
                items.iter().cloned().map(Value::Struct).collect()
            }
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.elements {
            ArrayElements::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapValue {
    pub key_type: Name,
    pub value_type: Name,
    pub header: StructHeader,
    pub entries: Vec<(Value, StructValue)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetValue {
    pub element_type: Name,
    pub elements: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Str(String),
    Name(Name),
    Object(ObjectRef),
    SoftObject(SoftObjectPath),
    Byte(u8),
    Enum(EnumValue),
    Struct(StructValue),
    Array(ArrayValue),
    Map(MapValue),
    Set(SetValue),
}

impl Value {
    pub fn property_type(&self) -> PropertyType {
        match self {
            Self::Bool(_) => PropertyType::Bool,
            Self::Int8(_) => PropertyType::Int8,
            Self::Int16(_) => PropertyType::Int16,
            Self::Int(_) => PropertyType::Int,
            Self::Int64(_) => PropertyType::Int64,
            Self::UInt16(_) => PropertyType::UInt16,
            Self::UInt32(_) => PropertyType::UInt32,
            Self::UInt64(_) => PropertyType::UInt64,
            Self::Float(_) => PropertyType::Float,
            Self::Double(_) => PropertyType::Double,
            Self::Str(_) => PropertyType::Str,
            Self::Name(_) => PropertyType::Name,
            Self::Object(_) => PropertyType::Object,
            Self::SoftObject(_) => PropertyType::SoftObject,
            Self::Byte(_) | Self::Enum(_) => PropertyType::Byte,
            Self::Struct(_) => PropertyType::Struct,
            Self::Array(_) => PropertyType::Array,
            Self::Map(_) => PropertyType::Map,
            Self::Set(_) => PropertyType::Set,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::Int8(v) => Some(v.into()),
            Self::Int16(v) => Some(v.into()),
            Self::Int(v) => Some(v.into()),
            Self::Int64(v) => Some(v),
            Self::UInt16(v) => Some(v.into()),
            Self::UInt32(v) => Some(v.into()),
            Self::UInt64(v) => i64::try_from(v).ok(),
            Self::Byte(v) => Some(v.into()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Self::Float(v) => Some(v.into()),
            Self::Double(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Name(n) => Some(n.base()),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match self {
            Self::Array(a) => Some(a),
            _ => None,
        }
    }
}

/// One tagged value and where it was decoded from.
#[derive(Debug, Clone, Serialize)]
pub struct Property {
    pub name: Name,
    pub type_name: Name,
    pub position: u32,
    #[serde(skip)]
    pub flag: u8,
    pub value: Value,
    /// Bytes between the end of the value and the declared payload end,
    /// kept when the decoder resyncs forward.
    #[serde(skip)]
    pub trailing: Vec<u8>,
    #[serde(skip)]
    pub span: PropertySpan,
}

/// Equality ignores the source span: a decoded property equals the one it
/// was encoded from.
impl PartialEq for Property {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.type_name == other.type_name
            && self.position == other.position
            && self.flag == other.flag
            && self.value == other.value
            && self.trailing == other.trailing
    }
}

impl Property {
    /// A property built in memory, with no source span.
    pub fn new(name: impl Into<Name>, value: Value) -> Self {
        let type_name = Name::new(value.property_type().as_str());
        Self {
            name: name.into(),
            type_name,
            position: 0,
            flag: 0,
            value,
            trailing: Vec::new(),
            span: PropertySpan::default(),
        }
    }

    pub fn with_position(mut self, position: u32) -> Self {
        self.position = position;
        self
    }

    pub fn property_type(&self) -> PropertyType {
        self.value.property_type()
    }
}

/// Ordered properties. Order matters: repeated names are told apart by
/// their position.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct PropertyBag {
    pub properties: Vec<Property>,
}

impl PropertyBag {
    pub fn new(properties: Vec<Property>) -> Self {
        Self { properties }
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.properties.iter()
    }

    pub fn push(&mut self, property: Property) {
        self.properties.push(property);
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name.matches(name))
    }

    /// First value named `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.property(name).map(|p| &p.value)
    }

    pub fn get_at(&self, name: &str, position: u32) -> Option<&Value> {
        self.properties
            .iter()
            .find(|p| p.position == position && p.name.matches(name))
            .map(|p| &p.value)
    }

    /// Elements of the array named `name`; empty when absent or not an array.
    pub fn get_array(&self, name: &str) -> Vec<Value> {
        self.get(name)
            .and_then(Value::as_array)
            .map(ArrayValue::values)
            .unwrap_or_default()
    }

    pub fn find_all(&self, name: &str) -> Vec<&Property> {
        self.properties
            .iter()
            .filter(|p| p.name.matches(name))
            .collect()
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn get_struct(&self, name: &str) -> Option<&StructValue> {
        self.get(name).and_then(Value::as_struct)
    }
}

impl<'a> IntoIterator for &'a PropertyBag {
    type Item = &'a Property;
    type IntoIter = std::slice::Iter<'a, Property>;

    fn into_iter(self) -> Self::IntoIter {
        self.properties.iter()
    }
}
