use super::{
    ArrayElements, ArrayValue, MapValue, OBJECT_REF_ID, OBJECT_REF_PATH, ObjectRef, Property,
    PropertyBag, PropertyType, SetValue, StructBody, StructHeader, StructValue, Value,
};
use crate::buffer::ByteWriter;
use crate::context::{EXTENDED_HEADER_VERSION, Name, NameTable, SaveContext};
use crate::error::{Result, SaveError};

/// Writes the property model back to bytes, mirroring [`super::PropertyDecoder`].
///
/// Size fields are backfilled once their payload is out, so a value that
/// decoded from consistent bytes re-encodes to the same bytes.
#[derive(Debug, Clone, Copy)]
pub struct PropertyEncoder<'c> {
    ctx: &'c SaveContext,
}

impl<'c> PropertyEncoder<'c> {
    pub fn new(ctx: &'c SaveContext) -> Self {
        Self { ctx }
    }

    fn names(&self) -> &'c NameTable {
        self.ctx.names()
    }

    pub fn encode_bag(&self, bag: &PropertyBag) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        self.write_bag(&mut w, bag)?;
        Ok(w.into_bytes())
    }

    pub fn encode_property(&self, property: &Property) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        self.write_property(&mut w, property)?;
        Ok(w.into_bytes())
    }

    /// Every property followed by the `None` terminator.
    pub fn write_bag(&self, w: &mut ByteWriter, bag: &PropertyBag) -> Result<()> {
        for property in bag {
            self.write_property(w, property)?;
        }
        self.names().write_name(w, &Name::none())
    }

    pub fn write_property(&self, w: &mut ByteWriter, property: &Property) -> Result<()> {
        let kind = property.property_type();
        if PropertyType::from_name(property.type_name.base()) != Some(kind) {
            return Err(SaveError::invalid(format!(
                "property {} is tagged {} but holds a {kind} value",
                property.name, property.type_name
            )));
        }

        let names = self.names();
        names.write_name(w, &property.name)?;
        names.write_name(w, &property.type_name)?;
        let size_field = w.position();
        w.write_u32(0);
        w.write_u32(property.position);

        let payload_start = match &property.value {
            Value::Bool(v) => {
                w.write_bool(*v);
                return Ok(());
            }
            Value::Byte(b) => {
                names.write_name(w, &Name::none())?;
                w.write_u8(property.flag);
                let start = w.position();
                w.write_u8(*b);
                start
            }
            Value::Enum(e) => {
                names.write_name(w, &e.enum_type)?;
                w.write_u8(property.flag);
                let start = w.position();
                names.write_name(w, &e.value)?;
                start
            }
            Value::Struct(s) => {
                names.write_name(w, &s.struct_type)?;
                w.write_bytes(&s.guid);
                w.write_u8(property.flag);
                let start = w.position();
                self.write_struct(w, s)?;
                start
            }
            Value::Array(a) => {
                names.write_name(w, &a.element_type)?;
                w.write_u8(property.flag);
                let start = w.position();
                self.write_array(w, &property.name, a)?;
                start
            }
            Value::Map(m) => {
                names.write_name(w, &m.key_type)?;
                names.write_name(w, &m.value_type)?;
                w.write_u8(property.flag);
                let start = w.position();
                self.write_map(w, m)?;
                start
            }
            Value::Set(s) => {
                names.write_name(w, &s.element_type)?;
                w.write_u8(property.flag);
                let start = w.position();
                self.write_set(w, &property.name, s)?;
                start
            }
            scalar => {
                w.write_u8(property.flag);
                let start = w.position();
                self.write_scalar(w, scalar)?;
                start
            }
        };

        w.write_bytes(&property.trailing);
        let size = w.position() - payload_start;
        w.patch_u32(size_field, size as u32)
    }

    fn write_struct(&self, w: &mut ByteWriter, value: &StructValue) -> Result<()> {
        match &value.body {
            StructBody::Fixed(fixed) => {
                fixed.write(w);
                Ok(())
            }
            StructBody::Bag(bag) => self.write_bag(w, bag),
        }
    }

    /// Write a struct header with a zero `inner_size`, returning the offset
    /// to backfill once the body is written.
    fn begin_struct_header(
        &self,
        w: &mut ByteWriter,
        header: &StructHeader,
        in_array: bool,
    ) -> Result<usize> {
        let names = self.names();
        names.write_name(w, &header.name)?;
        names.write_name(w, &header.type_name)?;
        let size_field = w.position();
        w.write_u32(0);
        names.write_name(w, &header.struct_type)?;
        w.write_bytes(&header.guid);
        if self.ctx.version() >= EXTENDED_HEADER_VERSION {
            let size_byte = header.size_byte.unwrap_or(0);
            w.write_u8(size_byte);
            if StructHeader::has_position(size_byte, in_array) {
                w.write_u32(header.position.unwrap_or(0));
            }
        }
        Ok(size_field)
    }

    fn end_struct_header(w: &mut ByteWriter, size_field: usize, body_start: usize) -> Result<()> {
        let inner_size = w.position() - body_start;
        w.patch_u32(size_field, inner_size as u32)
    }

    fn write_array(&self, w: &mut ByteWriter, name: &Name, array: &ArrayValue) -> Result<()> {
        w.write_u32(array.len() as u32);
        match &array.elements {
            ArrayElements::Bytes(bytes) => w.write_bytes(bytes),
            ArrayElements::Scalars(values) => {
                let kind = PropertyType::from_name(array.element_type.base());
                for value in values {
                    self.check_element(name, kind, value)?;
                    self.write_scalar(w, value)?;
                }
            }
            ArrayElements::Structs { header, items } => {
                let size_field = self.begin_struct_header(w, header, true)?;
                let body_start = w.position();
                for item in items {
                    self.write_struct(w, item)?;
                }
                Self::end_struct_header(w, size_field, body_start)?;
            }
        }
        Ok(())
    }

    fn write_map(&self, w: &mut ByteWriter, map: &MapValue) -> Result<()> {
        w.write_u32(map.entries.len() as u32);
        let size_field = self.begin_struct_header(w, &map.header, false)?;
        let body_start = w.position();
        for (key, value) in &map.entries {
            self.write_scalar(w, key)?;
            self.write_struct(w, value)?;
        }
        Self::end_struct_header(w, size_field, body_start)
    }

    fn write_set(&self, w: &mut ByteWriter, name: &Name, set: &SetValue) -> Result<()> {
        let kind = PropertyType::from_name(set.element_type.base());
        w.write_u32(set.elements.len() as u32);
        for value in &set.elements {
            self.check_element(name, kind, value)?;
            self.write_scalar(w, value)?;
        }
        Ok(())
    }

    fn check_element(&self, name: &Name, kind: Option<PropertyType>, value: &Value) -> Result<()> {
        if kind == Some(value.property_type()) {
            return Ok(());
        }
        Err(SaveError::UnsupportedValueType {
            property: name.to_string(),
            value_type: value.property_type().to_string(),
        })
    }

    /// A bare scalar payload, as stored in arrays, sets and map keys.
    pub fn write_scalar(&self, w: &mut ByteWriter, value: &Value) -> Result<()> {
        match value {
            Value::Bool(v) => w.write_bool(*v),
            Value::Int8(v) => w.write_i8(*v),
            Value::Int16(v) => w.write_i16(*v),
            Value::Int(v) => w.write_i32(*v),
            Value::Int64(v) => w.write_i64(*v),
            Value::UInt16(v) => w.write_u16(*v),
            Value::UInt32(v) => w.write_u32(*v),
            Value::UInt64(v) => w.write_u64(*v),
            Value::Float(v) => w.write_f32(*v),
            Value::Double(v) => w.write_f64(*v),
            Value::Str(s) => w.write_string(s),
            Value::Name(n) => self.names().write_name(w, n)?,
            Value::Byte(b) => w.write_u8(*b),
            Value::Object(ObjectRef::Id(id)) => {
                w.write_u16(OBJECT_REF_ID);
                w.write_uuid(id);
            }
            Value::Object(ObjectRef::Path(path)) => {
                w.write_u16(OBJECT_REF_PATH);
                self.names().write_name(w, path)?;
            }
            Value::SoftObject(path) => {
                self.names().write_name(w, &path.asset)?;
                w.write_string(&path.sub_path);
            }
            Value::Enum(_) | Value::Struct(_) | Value::Array(_) | Value::Map(_) | Value::Set(_) => {
                return Err(SaveError::invalid(format!(
                    "{} value cannot be written as a bare scalar",
                    value.property_type()
                )));
            }
        }
        Ok(())
    }
}
