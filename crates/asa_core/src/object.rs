use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::archive::{self, Archive};
use crate::buffer::{ByteBuffer, ByteWriter};
use crate::config::DecodeOptions;
use crate::context::{Name, SaveContext, WorldTransform};
use crate::error::Result;
use crate::property::{PropertyBag, PropertyDecoder, PropertyEncoder};

const SECONDARY_TRAILER_LEN: usize = 4 + 16;

/// Bytes after an object's closing `None`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectTrailer {
    #[default]
    None,
    /// Objects written from archive contexts point at a second identifier.
    Secondary { marker: u32, id: Uuid },
    Raw(Vec<u8>),
}

impl ObjectTrailer {
    fn parse(bytes: Vec<u8>) -> Self {
        match bytes.len() {
            0 => Self::None,
            SECONDARY_TRAILER_LEN => {
                let (marker, id) = bytes.split_at(4);
                match (<[u8; 4]>::try_from(marker), Uuid::from_slice(id)) {
                    (Ok(marker), Ok(id)) => Self::Secondary {
                        marker: u32::from_le_bytes(marker),
                        id,
                    },
                    _ => Self::Raw(bytes),
                }
            }
            _ => Self::Raw(bytes),
        }
    }

    fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::None => {}
            Self::Secondary { marker, id } => {
                w.write_u32(*marker);
                w.write_uuid(id);
            }
            Self::Raw(bytes) => w.write_bytes(bytes),
        }
    }
}

/// One stored object: `{blueprint name, u32 marker, property bag, None}`
/// followed by an optional trailer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameObject {
    pub id: Uuid,
    pub blueprint: Name,
    #[serde(skip)]
    pub marker: u32,
    pub properties: PropertyBag,
    pub transform: Option<WorldTransform>,
    #[serde(skip_serializing_if = "is_no_trailer")]
    pub trailer: ObjectTrailer,
    /// Offset of the first property tag.
    #[serde(skip)]
    pub properties_start: usize,
    /// Offset of the closing `None`; new top-level properties go here.
    #[serde(skip)]
    pub properties_end: usize,
}

fn is_no_trailer(trailer: &ObjectTrailer) -> bool {
    *trailer == ObjectTrailer::None
}

impl GameObject {
    pub fn new(id: Uuid, blueprint: impl Into<Name>) -> Self {
        Self {
            id,
            blueprint: blueprint.into(),
            marker: 0,
            properties: PropertyBag::default(),
            transform: None,
            trailer: ObjectTrailer::None,
            properties_start: 0,
            properties_end: 0,
        }
    }

    pub fn decode(id: Uuid, bytes: &[u8], ctx: &SaveContext, options: DecodeOptions) -> Result<Self> {
        let mut buf = ByteBuffer::from_slice(bytes);
        let blueprint = ctx.names().read_name(&mut buf)?;
        let marker = buf.read_u32()?;
        let properties_start = buf.position();

        let decoder = PropertyDecoder::new(ctx, options);
        let mut properties = PropertyBag::default();
        let properties_end = loop {
            let offset = buf.position();
            match decoder.read_property(&mut buf, false)? {
                Some(property) => properties.push(property),
                None => break offset,
            }
        };
        let trailer = ObjectTrailer::parse(buf.read_bytes(buf.remaining())?);

        debug!(%id, blueprint = %blueprint, properties = properties.len(), "decoded object");

        Ok(Self {
            id,
            blueprint,
            marker,
            properties,
            transform: ctx.transform(&id).copied(),
            trailer,
            properties_start,
            properties_end,
        })
    }

    /// The blueprint name alone, without decoding properties.
    pub fn peek_blueprint(bytes: &[u8], ctx: &SaveContext) -> Result<Name> {
        ctx.names().read_name(&mut ByteBuffer::from_slice(bytes))
    }

    pub fn to_bytes(&self, ctx: &SaveContext) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        ctx.names().write_name(&mut w, &self.blueprint)?;
        w.write_u32(self.marker);
        PropertyEncoder::new(ctx).write_bag(&mut w, &self.properties)?;
        self.trailer.write(&mut w);
        Ok(w.into_bytes())
    }

    /// Decode every nested archive carried in this object's custom item
    /// byte arrays. Each archive succeeds or fails on its own.
    pub fn embedded_archives(&self, options: DecodeOptions) -> Vec<Result<Archive>> {
        archive::custom_item_blobs(&self.properties)
            .into_iter()
            .filter(|blob| Archive::is_archive(blob))
            .map(|blob| Archive::decode(blob, options))
            .collect()
    }
}
