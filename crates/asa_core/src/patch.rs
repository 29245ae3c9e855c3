//! In-place edits of one object blob.
//!
//! Every operation works from offsets decoded out of the current bytes and
//! rewrites only the affected span plus the size fields that count it. An
//! offset returned by [`Patcher::locate`] is only valid until the next patch
//! that changes the buffer length in front of it; locate again afterwards.
//!
//! Operations validate and encode everything before the first byte changes,
//! so a failed patch leaves the buffer untouched.

use tracing::debug;
use uuid::Uuid;

use crate::buffer::{ByteBuffer, ByteWriter};
use crate::config::DecodeOptions;
use crate::context::{Name, SaveContext};
use crate::error::{Result, SaveError};
use crate::layout::ByteRange;
use crate::object::GameObject;
use crate::property::{
    ArrayElements, ArrayValue, Property, PropertyBag, PropertyDecoder, PropertyEncoder,
    PropertyType, StructHeader, Value,
};

/// Owns one object blob while it is being edited.
#[derive(Debug)]
pub struct Patcher<'c> {
    ctx: &'c SaveContext,
    options: DecodeOptions,
    buf: ByteBuffer,
}

impl<'c> Patcher<'c> {
    pub fn new(ctx: &'c SaveContext, bytes: Vec<u8>) -> Self {
        Self {
            ctx,
            options: DecodeOptions::default(),
            buf: ByteBuffer::new(bytes),
        }
    }

    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf.into_inner()
    }

    /// Offset of the `occurrence`-th (zero-based) property tag named `name`.
    ///
    /// A linear scan over every byte offset, O(buffer length): a candidate is
    /// any `name index, 0` pair followed by a property type name. It does not
    /// depend on the surrounding layout decoding cleanly.
    pub fn locate(&self, name: &str, occurrence: usize) -> Option<usize> {
        let index = self.ctx.index_of(name)?;
        let mut needle = [0u8; 8];
        needle[..4].copy_from_slice(&index.to_le_bytes());
        let names = self.ctx.names();

        self.buf
            .as_slice()
            .windows(needle.len())
            .enumerate()
            .filter(|(_, window)| *window == &needle[..])
            .map(|(offset, _)| offset)
            .filter(|&offset| {
                self.buf
                    .peek_u32_at(offset + 8)
                    .and_then(|type_index| names.resolve(type_index))
                    .and_then(PropertyType::from_name)
                    .is_some()
            })
            .nth(occurrence)
    }

    /// Decode the property whose tag starts at `offset`.
    pub fn property_at(&mut self, offset: usize) -> Result<Property> {
        let saved = self.buf.position();
        self.buf.seek_to(offset)?;
        let decoded =
            PropertyDecoder::new(self.ctx, self.options).read_property(&mut self.buf, false);
        self.buf.seek_to(saved)?;
        decoded?.ok_or_else(|| SaveError::NotFound(format!("no property tag at offset {offset}")))
    }

    /// The object as the current bytes decode.
    pub fn object(&self) -> Result<GameObject> {
        GameObject::decode(Uuid::nil(), self.buf.as_slice(), self.ctx, self.options)
    }

    /// Overwrite a fixed-size scalar. The new value must have the property's
    /// type and encode to the same number of bytes.
    pub fn replace_scalar(&mut self, offset: usize, value: &Value) -> Result<()> {
        let property = self.property_at(offset)?;
        let payload = value_range(&property);
        let mismatch = || SaveError::UnsupportedValueType {
            property: property.name.to_string(),
            value_type: value.property_type().to_string(),
        };

        let mut w = ByteWriter::new();
        let (at, expected_len) = match (&property.value, value) {
            (Value::Bool(_), Value::Bool(v)) => {
                w.write_bool(*v);
                (property.span.range.end - 2, 2)
            }
            (Value::Enum(_), Value::Enum(e)) => {
                self.ctx.names().write_name(&mut w, &e.value)?;
                (payload.start, payload.len())
            }
            (Value::Enum(_), _) | (_, Value::Enum(_)) => return Err(mismatch()),
            (old, new) if old.property_type() == new.property_type() && new.property_type().is_scalar() => {
                PropertyEncoder::new(self.ctx).write_scalar(&mut w, new)?;
                (payload.start, payload.len())
            }
            _ => return Err(mismatch()),
        };

        if w.position() != expected_len {
            return Err(SaveError::invalid(format!(
                "new value for {} is {} bytes, existing payload is {expected_len}",
                property.name,
                w.position()
            )));
        }
        self.buf.overwrite(at, w.as_slice())
    }

    /// Replace a string payload, splicing when its encoded length changes.
    /// The property's size field and every enclosing size field are moved by
    /// the same delta.
    pub fn replace_string(&mut self, offset: usize, value: &str) -> Result<()> {
        let property = self.property_at(offset)?;
        if property.property_type() != PropertyType::Str {
            return Err(SaveError::UnsupportedValueType {
                property: property.name.to_string(),
                value_type: property.type_name.to_string(),
            });
        }

        let mut w = ByteWriter::new();
        w.write_string(value);
        let payload = w.into_bytes();
        let old = value_range(&property);
        let delta = payload.len() as i64 - old.len() as i64;

        let size = payload.len() + property.trailing.len();
        let mut updates = vec![(property.span.size_field, size as u32)];
        if delta != 0 {
            let object = self.object()?;
            let mut fields = Vec::new();
            collect_enclosing(&object.properties, &property.span.range, &mut fields);
            for field in fields {
                let current = self.buf.peek_u32_at(field).ok_or(SaveError::BufferUnderflow {
                    offset: field,
                    needed: 4,
                    len: self.buf.len(),
                })?;
                updates.push((field, shift(current, delta)?));
            }
        }

        debug!(property = %property.name, offset, delta, enclosing = updates.len() - 1, "replace string");
        self.buf.remove_bytes(old.start, old.len())?;
        self.buf.insert_bytes(old.start, &payload)?;
        // Size fields all precede the splice, so their offsets still hold.
        for (field, size) in updates {
            self.buf.overwrite_u32(field, size)?;
        }
        Ok(())
    }

    /// Replace the top-level array `name` with `elements`.
    ///
    /// The existing span (tag and payload) is removed. Unless `elements` is
    /// `None` or empty, a new array of `element_type` is written at the same
    /// offset, or in front of the closing `None` if the array was absent.
    /// Struct arrays keep their existing header.
    pub fn replace_array(
        &mut self,
        name: &str,
        element_type: &str,
        elements: Option<&[Value]>,
    ) -> Result<()> {
        let object = self.object()?;
        let existing = object
            .properties
            .iter()
            .find(|p| p.name.matches(name) && p.property_type() == PropertyType::Array);

        let encoded = match elements {
            Some(values) if !values.is_empty() => {
                Some(self.encode_array(name, element_type, values, existing)?)
            }
            _ => None,
        };
        let (at, old_len) = match existing {
            Some(property) => (property.span.range.start, property.span.range.len()),
            None => (object.properties_end, 0),
        };

        debug!(
            array = name,
            at,
            old_len,
            new_len = encoded.as_ref().map_or(0, Vec::len),
            "replace array"
        );
        if old_len > 0 {
            self.buf.remove_bytes(at, old_len)?;
        }
        if let Some(bytes) = encoded {
            self.buf.insert_bytes(at, &bytes)?;
        }
        Ok(())
    }

    fn encode_array(
        &self,
        name: &str,
        element_type: &str,
        values: &[Value],
        existing: Option<&Property>,
    ) -> Result<Vec<u8>> {
        let unsupported = |value_type: String| SaveError::UnsupportedValueType {
            property: name.to_string(),
            value_type,
        };
        let kind = PropertyType::from_name(element_type)
            .ok_or_else(|| unsupported(element_type.to_string()))?;

        let elements = match kind {
            PropertyType::Byte => ArrayElements::Bytes(
                values
                    .iter()
                    .map(|v| match v {
                        Value::Byte(b) => Ok(*b),
                        other => Err(unsupported(other.property_type().to_string())),
                    })
                    .collect::<Result<_>>()?,
            ),
            PropertyType::Struct => {
                let items = values
                    .iter()
                    .map(|v| match v {
                        Value::Struct(s) => Ok(s.clone()),
                        other => Err(unsupported(other.property_type().to_string())),
                    })
                    .collect::<Result<Vec<_>>>()?;
                let header = existing
                    .and_then(|p| p.value.as_array())
                    .and_then(|a| match &a.elements {
                        ArrayElements::Structs { header, .. } => Some(header.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| {
                        StructHeader::for_array(name, items[0].struct_type.clone(), self.ctx.version())
                    });
                ArrayElements::Structs { header, items }
            }
            PropertyType::Array | PropertyType::Map | PropertyType::Set => {
                return Err(unsupported(element_type.to_string()));
            }
            _ => ArrayElements::Scalars(values.to_vec()),
        };

        let mut property = Property::new(
            name,
            Value::Array(ArrayValue {
                element_type: Name::new(element_type),
                elements,
            }),
        );
        if let Some(old) = existing {
            property.name = old.name.clone();
            property.position = old.position;
            property.flag = old.flag;
        }
        PropertyEncoder::new(self.ctx).encode_property(&property)
    }

    /// Rewrite every occurrence of `old`'s bytes with `new`. Returns the
    /// number of occurrences replaced.
    pub fn reidentify(&mut self, old: &Uuid, new: &Uuid) -> Result<usize> {
        let offsets = identifier_offsets(self.buf.as_slice(), old);
        for &offset in &offsets {
            self.buf.overwrite(offset, new.as_bytes())?;
        }
        Ok(offsets.len())
    }
}

/// Non-overlapping offsets of `id`'s 16 bytes in `bytes`.
pub fn identifier_offsets(bytes: &[u8], id: &Uuid) -> Vec<usize> {
    let needle = id.as_bytes();
    let mut found = Vec::new();
    let mut i = 0;
    while i + needle.len() <= bytes.len() {
        if &bytes[i..i + needle.len()] == needle {
            found.push(i);
            i += needle.len();
        } else {
            i += 1;
        }
    }
    found
}

/// The payload bytes the value itself occupies, without any trailing bytes
/// kept from a resync.
fn value_range(property: &Property) -> ByteRange {
    let payload = property.span.payload;
    ByteRange::new(payload.start, payload.end - property.trailing.len())
}

fn shift(size: u32, delta: i64) -> Result<u32> {
    u32::try_from(i64::from(size) + delta)
        .map_err(|_| SaveError::invalid(format!("size field {size} cannot move by {delta}")))
}

/// Offsets of every size field whose counted bytes contain `target`: the
/// size of each enclosing property and the inner size of each enclosing
/// struct header.
fn collect_enclosing(bag: &PropertyBag, target: &ByteRange, fields: &mut Vec<usize>) {
    for property in bag {
        if !property.span.payload.covers(target) {
            continue;
        }
        fields.push(property.span.size_field);
        match &property.value {
            Value::Struct(s) => {
                if let Some(inner) = s.bag() {
                    collect_enclosing(inner, target, fields);
                }
            }
            Value::Array(array) => {
                if let ArrayElements::Structs { header, items } = &array.elements {
                    if header.body.covers(target) {
                        fields.push(header.size_field);
                    }
                    for inner in items.iter().filter_map(|item| item.bag()) {
                        collect_enclosing(inner, target, fields);
                    }
                }
            }
            Value::Map(map) => {
                if map.header.body.covers(target) {
                    fields.push(map.header.size_field);
                }
                for inner in map.entries.iter().filter_map(|(_, value)| value.bag()) {
                    collect_enclosing(inner, target, fields);
                }
            }
            _ => {}
        }
    }
}
