use tracing::{debug, warn};

use super::{
    ArrayElements, ArrayValue, EnumValue, MapValue, OBJECT_REF_ID, OBJECT_REF_PATH, ObjectRef, Property, PropertyBag,
    PropertyType, STRUCT_PROPERTY, SetValue, SoftObjectPath, StructBody, StructHeader,
    StructValue, Value, WellKnownKind, WellKnownStruct,
};
use crate::buffer::ByteBuffer;
use crate::config::DecodeOptions;
use crate::context::{EXTENDED_HEADER_VERSION, Name, NameTable, SaveContext};
use crate::error::{Result, SaveError};
use crate::layout::{ByteRange, PropertySpan};

/// Reads property bags against one save context.
///
/// The decoder holds no cursor of its own, so one instance can serve many
/// buffers; each buffer is still read strictly sequentially.
#[derive(Debug, Clone, Copy)]
pub struct PropertyDecoder<'c> {
    ctx: &'c SaveContext,
    options: DecodeOptions,
    verbose: bool,
}

impl<'c> PropertyDecoder<'c> {
    pub fn new(ctx: &'c SaveContext, options: DecodeOptions) -> Self {
        Self {
            ctx,
            options,
            verbose: options.verbose_recovery,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn context(&self) -> &'c SaveContext {
        self.ctx
    }

    fn names(&self) -> &'c NameTable {
        self.ctx.names()
    }

    /// Read properties up to and including the `None` terminator.
    pub fn read_bag(&self, buf: &mut ByteBuffer, in_array: bool) -> Result<PropertyBag> {
        let mut properties = Vec::new();
        while let Some(property) = self.read_property(buf, in_array)? {
            properties.push(property);
        }
        Ok(PropertyBag::new(properties))
    }

    /// One tagged property, or `None` at the end-of-bag sentinel.
    pub fn read_property(&self, buf: &mut ByteBuffer, in_array: bool) -> Result<Option<Property>> {
        let start = buf.position();
        let name = self.names().read_name(buf)?;
        if name.is_none() {
            return Ok(None);
        }

        let type_name = self.names().read_name(buf)?;
        let size_field = buf.position();
        let size = buf.read_u32()? as usize;
        let position = buf.read_u32()?;
        let kind = PropertyType::from_name(type_name.base()).ok_or_else(|| {
            SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: type_name.to_string(),
            }
        })?;

        if self.verbose {
            debug!(offset = start, name = %name, value_type = %type_name, size, position, "property");
        }

        if kind == PropertyType::Bool {
            let value = buf.read_bool()?;
            let end = buf.position();
            return Ok(Some(Property {
                name,
                type_name,
                position,
                flag: 0,
                value: Value::Bool(value),
                trailing: Vec::new(),
                span: PropertySpan {
                    range: ByteRange::new(start, end),
                    size_field,
                    payload: ByteRange::new(end, end),
                },
            }));
        }

        let names = self.names();
        let (flag, payload_start, value, label) = match kind {
            PropertyType::Byte => {
                let enum_type = names.read_name(buf)?;
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let value = if enum_type.is_none() {
                    Value::Byte(buf.read_u8()?)
                } else {
                    Value::Enum(EnumValue {
                        enum_type,
                        value: names.read_name(buf)?,
                    })
                };
                (flag, payload_start, value, type_name.to_string())
            }
            PropertyType::Struct => {
                let struct_type = names.read_name(buf)?;
                let guid = buf.read_uuid()?.into_bytes();
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let label = struct_type.to_string();
                let value = self.read_struct(buf, struct_type, guid, in_array)?;
                (flag, payload_start, Value::Struct(value), label)
            }
            PropertyType::Array => {
                let element_type = names.read_name(buf)?;
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let value = self.read_array(buf, &name, element_type)?;
                (flag, payload_start, Value::Array(value), type_name.to_string())
            }
            PropertyType::Map => {
                let key_type = names.read_name(buf)?;
                let value_type = names.read_name(buf)?;
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let value = self.read_map(buf, &name, key_type, value_type)?;
                (flag, payload_start, Value::Map(value), type_name.to_string())
            }
            PropertyType::Set => {
                let element_type = names.read_name(buf)?;
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let value = self.read_set(buf, &name, element_type)?;
                let expected_end = payload_start + size;
                let mut trailing = Vec::new();
                if buf.position() != expected_end && !in_array {
                    warn!(
                        property = %name,
                        expected_end,
                        actual_end = buf.position(),
                        "set size mismatch, resyncing"
                    );
                    trailing = resync(buf, expected_end)?;
                }
                let end = buf.position();
                return Ok(Some(Property {
                    name,
                    type_name,
                    position,
                    flag,
                    value: Value::Set(value),
                    trailing,
                    span: PropertySpan {
                        range: ByteRange::new(start, end),
                        size_field,
                        payload: ByteRange::new(payload_start, end),
                    },
                }));
            }
            scalar => {
                let flag = buf.read_u8()?;
                let payload_start = buf.position();
                let value = self.read_scalar(buf, scalar)?;
                (flag, payload_start, value, type_name.to_string())
            }
        };

        let trailing = self.finish_payload(buf, &name, label, payload_start + size, in_array)?;
        let end = buf.position();

        Ok(Some(Property {
            name,
            type_name,
            position,
            flag,
            value,
            trailing,
            span: PropertySpan {
                range: ByteRange::new(start, end),
                size_field,
                payload: ByteRange::new(payload_start, end),
            },
        }))
    }

    /// Check the cursor against the declared payload end. Outside arrays a
    /// mismatch is logged and the cursor forced to the declared end; inside
    /// arrays it is tolerated as-is. Returns the bytes skipped over.
    fn finish_payload(
        &self,
        buf: &mut ByteBuffer,
        name: &Name,
        label: String,
        expected_end: usize,
        in_array: bool,
    ) -> Result<Vec<u8>> {
        let actual_end = buf.position();
        if actual_end == expected_end || in_array {
            return Ok(Vec::new());
        }

        let mismatch = SaveError::StructSizeMismatch {
            struct_type: label,
            expected_end,
            actual_end,
        };
        if self.options.strict_struct_sizes {
            return Err(mismatch);
        }
        warn!(property = %name, "{mismatch}, resyncing");
        resync(buf, expected_end)
    }

    fn read_struct(
        &self,
        buf: &mut ByteBuffer,
        struct_type: Name,
        guid: [u8; 16],
        in_array: bool,
    ) -> Result<StructValue> {
        let body = match WellKnownKind::from_name(struct_type.base()) {
            Some(kind) => StructBody::Fixed(WellKnownStruct::read(kind, buf)?),
            None => StructBody::Bag(self.read_bag(buf, in_array)?),
        };
        Ok(StructValue {
            struct_type,
            guid,
            body,
        })
    }

    fn read_struct_header(&self, buf: &mut ByteBuffer, in_array: bool) -> Result<StructHeader> {
        let names = self.names();
        let name = names.read_name(buf)?;
        let type_name = names.read_name(buf)?;
        if type_name.base() != STRUCT_PROPERTY {
            return Err(SaveError::invalid(format!(
                "struct header for {name} declares type {type_name} at offset {}",
                buf.position()
            )));
        }

        let size_field = buf.position();
        let inner_size = buf.read_u32()?;
        let struct_type = names.read_name(buf)?;
        let guid = buf.read_uuid()?.into_bytes();
        let (size_byte, position) = if self.ctx.version() >= EXTENDED_HEADER_VERSION {
            let size_byte = buf.read_u8()?;
            let position = if StructHeader::has_position(size_byte, in_array) {
                Some(buf.read_u32()?)
            } else {
                None
            };
            (Some(size_byte), position)
        } else {
            (None, None)
        };

        let body_start = buf.position();
        Ok(StructHeader {
            name,
            type_name,
            inner_size,
            struct_type,
            guid,
            size_byte,
            position,
            size_field,
            body: ByteRange::new(body_start, body_start),
        })
    }

    fn read_array(
        &self,
        buf: &mut ByteBuffer,
        name: &Name,
        element_type: Name,
    ) -> Result<ArrayValue> {
        let count = buf.read_u32()? as usize;
        let kind = PropertyType::from_name(element_type.base())
            .filter(|kind| !matches!(kind, PropertyType::Array | PropertyType::Map | PropertyType::Set))
            .ok_or_else(|| SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: element_type.to_string(),
            })?;

        let elements = match kind {
            PropertyType::Byte => ArrayElements::Bytes(buf.read_bytes(count)?),
            PropertyType::Struct => {
                let mut header = self.read_struct_header(buf, true)?;
                let mut items = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    items.push(self.read_struct(buf, header.struct_type.clone(), header.guid, true)?);
                }
                header.body.end = buf.position();
                ArrayElements::Structs { header, items }
            }
            scalar => {
                let mut values = Vec::with_capacity(count.min(buf.remaining()));
                for _ in 0..count {
                    values.push(self.read_scalar(buf, scalar)?);
                }
                ArrayElements::Scalars(values)
            }
        };

        Ok(ArrayValue {
            element_type,
            elements,
        })
    }

    fn read_map(
        &self,
        buf: &mut ByteBuffer,
        name: &Name,
        key_type: Name,
        value_type: Name,
    ) -> Result<MapValue> {
        if PropertyType::from_name(value_type.base()) != Some(PropertyType::Struct) {
            return Err(SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: value_type.to_string(),
            });
        }
        let key_kind = PropertyType::from_name(key_type.base())
            .filter(PropertyType::is_scalar)
            .ok_or_else(|| SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: key_type.to_string(),
            })?;

        let count = buf.read_u32()? as usize;
        let mut header = self.read_struct_header(buf, false)?;
        let mut entries = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            let key = self.read_scalar(buf, key_kind)?;
            let value = self.read_struct(buf, header.struct_type.clone(), header.guid, false)?;
            entries.push((key, value));
        }
        header.body.end = buf.position();

        Ok(MapValue {
            key_type,
            value_type,
            header,
            entries,
        })
    }

    fn read_set(&self, buf: &mut ByteBuffer, name: &Name, element_type: Name) -> Result<SetValue> {
        let kind = PropertyType::from_name(element_type.base())
            .filter(PropertyType::is_scalar)
            .ok_or_else(|| SaveError::UnsupportedValueType {
                property: name.to_string(),
                value_type: element_type.to_string(),
            })?;

        let count = buf.read_u32()? as usize;
        let mut elements = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            elements.push(self.read_scalar(buf, kind)?);
        }
        Ok(SetValue {
            element_type,
            elements,
        })
    }

    pub fn read_scalar(&self, buf: &mut ByteBuffer, kind: PropertyType) -> Result<Value> {
        Ok(match kind {
            PropertyType::Bool => Value::Bool(buf.read_bool()?),
            PropertyType::Int8 => Value::Int8(buf.read_i8()?),
            PropertyType::Int16 => Value::Int16(buf.read_i16()?),
            PropertyType::Int => Value::Int(buf.read_i32()?),
            PropertyType::Int64 => Value::Int64(buf.read_i64()?),
            PropertyType::UInt16 => Value::UInt16(buf.read_u16()?),
            PropertyType::UInt32 => Value::UInt32(buf.read_u32()?),
            PropertyType::UInt64 => Value::UInt64(buf.read_u64()?),
            PropertyType::Float => Value::Float(buf.read_f32()?),
            PropertyType::Double => Value::Double(buf.read_f64()?),
            PropertyType::Str => Value::Str(buf.read_string()?),
            PropertyType::Name => Value::Name(self.names().read_name(buf)?),
            PropertyType::Byte => Value::Byte(buf.read_u8()?),
            PropertyType::Object => {
                let offset = buf.position();
                match buf.read_u16()? {
                    OBJECT_REF_ID => Value::Object(ObjectRef::Id(buf.read_uuid()?)),
                    OBJECT_REF_PATH => Value::Object(ObjectRef::Path(self.names().read_name(buf)?)),
                    other => {
                        return Err(SaveError::invalid(format!(
                            "unknown object reference kind {other} at offset {offset}"
                        )));
                    }
                }
            }
            PropertyType::SoftObject => Value::SoftObject(SoftObjectPath {
                asset: self.names().read_name(buf)?,
                sub_path: buf.read_string()?,
            }),
            PropertyType::Struct | PropertyType::Array | PropertyType::Map | PropertyType::Set => {
                return Err(SaveError::invalid(format!(
                    "{kind} is not a scalar type (offset {})",
                    buf.position()
                )));
            }
        })
    }
}

/// Move the cursor to `expected_end`. Bytes skipped going forward are
/// returned so the payload can be written back unchanged.
fn resync(buf: &mut ByteBuffer, expected_end: usize) -> Result<Vec<u8>> {
    let actual_end = buf.position();
    if expected_end > actual_end {
        return buf.read_bytes(expected_end - actual_end);
    }
    buf.seek_to(expected_end)?;
    Ok(Vec::new())
}
