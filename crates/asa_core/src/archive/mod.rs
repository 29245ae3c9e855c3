//! Self-contained archives nested inside objects (frozen creatures and
//! their gear).
//!
//! An archive is `{u32 magic, u32 inflated size, u32 name table offset}`
//! followed by a zlib stream of wildcard-escaped bytes. The unescaped body
//! carries its own object list and name table, so it decodes without the
//! enclosing save.

mod wildcard;

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::buffer::{ByteBuffer, ByteWriter};
use crate::config::DecodeOptions;
use crate::context::{EXTENDED_HEADER_VERSION, Name, NameTable, SaveContext};
use crate::error::{Result, SaveError};
use crate::property::{
    ArrayElements, CUSTOM_ITEM_BYTE_ARRAY, PropertyBag, PropertyDecoder, PropertyEncoder,
    StructValue, Value,
};

pub use wildcard::{WildcardDecoder, wildcard_deflate, wildcard_inflate};

pub const ARCHIVE_MAGIC: u32 = 0x0406;
pub const ARCHIVE_VERSION: u32 = 7;
pub const ARCHIVE_HEADER_LEN: usize = 12;

/// Names every archive can reference through the constant bit without
/// carrying them in its own table.
pub static ARCHIVE_CONSTANT_NAMES: &[&str] = &[
    "None",
    "BoolProperty",
    "Int8Property",
    "Int16Property",
    "IntProperty",
    "Int64Property",
    "UInt16Property",
    "UInt32Property",
    "UInt64Property",
    "FloatProperty",
    "DoubleProperty",
    "StrProperty",
    "NameProperty",
    "ObjectProperty",
    "SoftObjectProperty",
    "ByteProperty",
    "StructProperty",
    "ArrayProperty",
    "MapProperty",
    "SetProperty",
    "Vector",
    "Vector2D",
    "Rotator",
    "Quat",
    "LinearColor",
    "Color",
    "IntPoint",
    "Guid",
    "DateTime",
    "Box",
    "ItemNetID",
    "UniqueNetIdRepl",
    "TimestampFlag",
    "CustomItemByteArray",
    "Bytes",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveObject {
    pub id: Uuid,
    pub class: Name,
    pub flags: u32,
    #[serde(skip)]
    pub properties_offset: u32,
    pub properties: PropertyBag,
}

impl ArchiveObject {
    pub fn new(id: Uuid, class: impl Into<Name>, properties: PropertyBag) -> Self {
        Self {
            id,
            class: class.into(),
            flags: 0,
            properties_offset: 0,
            properties,
        }
    }
}

/// An object whose properties could not be decoded, even on retry.
#[derive(Debug)]
pub struct FailedObject {
    pub id: Uuid,
    pub class: Name,
    pub error: SaveError,
}

#[derive(Debug)]
pub struct Archive {
    pub version: u32,
    pub context: SaveContext,
    pub objects: Vec<ArchiveObject>,
    pub failed: Vec<FailedObject>,
}

struct ObjectHeader {
    id: Uuid,
    class: Name,
    flags: u32,
    properties_offset: u32,
}

impl Archive {
    /// An archive to be encoded. `names` seeds the archive's own table;
    /// constant names need not be listed.
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, objects: Vec<ArchiveObject>) -> Self {
        let mut table = NameTable::with_constants(ARCHIVE_CONSTANT_NAMES);
        for name in names {
            table.intern(name);
        }
        Self {
            version: ARCHIVE_VERSION,
            context: SaveContext::new(EXTENDED_HEADER_VERSION, table),
            objects,
            failed: Vec::new(),
        }
    }

    pub fn is_archive(bytes: &[u8]) -> bool {
        bytes
            .get(..4)
            .and_then(|magic| <[u8; 4]>::try_from(magic).ok())
            .is_some_and(|magic| u32::from_le_bytes(magic) == ARCHIVE_MAGIC)
    }

    pub fn decode(bytes: &[u8], options: DecodeOptions) -> Result<Self> {
        let mut header = ByteBuffer::from_slice(bytes.get(..ARCHIVE_HEADER_LEN).ok_or(
            SaveError::BufferUnderflow {
                offset: 0,
                needed: ARCHIVE_HEADER_LEN,
                len: bytes.len(),
            },
        )?);
        let magic = header.read_u32()?;
        if magic != ARCHIVE_MAGIC {
            return Err(SaveError::invalid(format!(
                "archive magic 0x{magic:04x}, expected 0x{ARCHIVE_MAGIC:04x}"
            )));
        }
        let inflated_size = header.read_u32()? as usize;
        let names_offset = header.read_u32()? as usize;

        let mut body = Vec::with_capacity(inflated_size);
        WildcardDecoder::new(ZlibDecoder::new(&bytes[ARCHIVE_HEADER_LEN..]))
            .read_to_end(&mut body)
            .map_err(|e| SaveError::Decompress(e.to_string()))?;
        if body.len() != inflated_size {
            return Err(SaveError::Decompress(format!(
                "archive body inflated to {} bytes, header declares {inflated_size}",
                body.len()
            )));
        }

        Self::decode_body(body, names_offset, options)
    }

    fn decode_body(body: Vec<u8>, names_offset: usize, options: DecodeOptions) -> Result<Self> {
        let mut buf = ByteBuffer::new(body);
        let version = buf.read_u32()?;
        if version != ARCHIVE_VERSION {
            return Err(SaveError::ArchiveVersionUnsupported(version, ARCHIVE_VERSION));
        }

        let objects_start = buf.position();
        buf.seek_to(names_offset)?;
        let names = NameTable::read_sequential(&mut buf, ARCHIVE_CONSTANT_NAMES)?;
        let context = SaveContext::new(EXTENDED_HEADER_VERSION, names);
        buf.seek_to(objects_start)?;

        let count = buf.read_u32()? as usize;
        let mut headers = Vec::with_capacity(count.min(buf.remaining()));
        for _ in 0..count {
            headers.push(ObjectHeader {
                id: buf.read_uuid()?,
                class: context.names().read_name(&mut buf)?,
                flags: buf.read_u32()?,
                properties_offset: buf.read_u32()?,
            });
        }
        debug!(objects = count, names = context.names().len(), "decoding archive");

        let decoder = PropertyDecoder::new(&context, options);
        let mut objects = Vec::with_capacity(headers.len());
        let mut failed = Vec::new();
        for header in headers {
            let cursor = buf.position();
            let properties = match decoder.read_bag(&mut buf, false) {
                Ok(bag) => Ok(bag),
                Err(first) => {
                    warn!(
                        id = %header.id,
                        cursor,
                        offset = header.properties_offset,
                        error = %first,
                        "archive object failed at cursor, retrying at declared offset"
                    );
                    trace!(id = %header.id, "verbose retry");
                    buf.seek_to(header.properties_offset as usize)
                        .and_then(|()| decoder.verbose(true).read_bag(&mut buf, false))
                }
            };

            match properties {
                Ok(properties) => objects.push(ArchiveObject {
                    id: header.id,
                    class: header.class,
                    flags: header.flags,
                    properties_offset: header.properties_offset,
                    properties,
                }),
                Err(error) => {
                    warn!(id = %header.id, class = %header.class, %error, "archive object skipped");
                    failed.push(FailedObject {
                        id: header.id,
                        class: header.class,
                        error,
                    });
                }
            }
        }

        Ok(Self {
            version,
            context,
            objects,
            failed,
        })
    }

    /// Unescaped body: version, object headers, bags, then the name table.
    fn encode_body(&self) -> Result<(Vec<u8>, usize)> {
        let names = self.context.names();
        let encoder = PropertyEncoder::new(&self.context);
        let mut w = ByteWriter::new();
        w.write_u32(self.version);
        w.write_u32(self.objects.len() as u32);

        let mut offset_fields = Vec::with_capacity(self.objects.len());
        for object in &self.objects {
            w.write_uuid(&object.id);
            names.write_name(&mut w, &object.class)?;
            w.write_u32(object.flags);
            offset_fields.push(w.position());
            w.write_u32(0);
        }
        for (object, field) in self.objects.iter().zip(offset_fields) {
            let offset = w.position() as u32;
            w.patch_u32(field, offset)?;
            encoder.write_bag(&mut w, &object.properties)?;
        }

        let names_offset = w.position();
        names.write_sequential(&mut w);
        Ok((w.into_bytes(), names_offset))
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let (body, names_offset) = self.encode_body()?;

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&wildcard_deflate(&body))?;
        let compressed = zlib.finish()?;

        let mut w = ByteWriter::new();
        w.write_u32(ARCHIVE_MAGIC);
        w.write_u32(body.len() as u32);
        w.write_u32(names_offset as u32);
        w.write_bytes(&compressed);
        Ok(w.into_bytes())
    }

    pub fn object(&self, id: &Uuid) -> Option<&ArchiveObject> {
        self.objects.iter().find(|o| o.id == *id)
    }
}

/// Byte payloads of every `CustomItemByteArray` element reachable from
/// `bag`, in encounter order.
pub fn custom_item_blobs(bag: &PropertyBag) -> Vec<&[u8]> {
    let mut blobs = Vec::new();
    collect_bag(bag, &mut blobs);
    blobs
}

fn collect_bag<'a>(bag: &'a PropertyBag, blobs: &mut Vec<&'a [u8]>) {
    for property in bag {
        collect_value(&property.value, blobs);
    }
}

fn collect_struct<'a>(value: &'a StructValue, blobs: &mut Vec<&'a [u8]>) {
    let Some(bag) = value.bag() else {
        return;
    };
    if value.struct_type.base() == CUSTOM_ITEM_BYTE_ARRAY {
        if let Some(bytes) = bag.get("Bytes").and_then(Value::as_array).and_then(|a| a.as_bytes()) {
            blobs.push(bytes);
        }
        return;
    }
    collect_bag(bag, blobs);
}

fn collect_value<'a>(value: &'a Value, blobs: &mut Vec<&'a [u8]>) {
    match value {
        Value::Struct(s) => collect_struct(s, blobs),
        Value::Array(array) => {
            if let ArrayElements::Structs { items, .. } = &array.elements {
                for item in items {
                    collect_struct(item, blobs);
                }
            }
        }
        Value::Map(map) => {
            for (_, value) in &map.entries {
                collect_struct(value, blobs);
            }
        }
        _ => {}
    }
}
