use serde::Serialize;
use uuid::Uuid;

use crate::buffer::{ByteBuffer, ByteWriter, encoded_string_len};
use crate::error::Result;

/// Struct types with a fixed binary layout, decoded field by field instead
/// of as a property bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WellKnownKind {
    Vector,
    Vector2D,
    Rotator,
    Quat,
    LinearColor,
    Color,
    IntPoint,
    Guid,
    DateTime,
    Box,
    ItemNetId,
    UniqueNetId,
    TimestampFlag,
}

const STRUCT_NAMES: [(WellKnownKind, &str); 13] = [
    (WellKnownKind::Vector, "Vector"),
    (WellKnownKind::Vector2D, "Vector2D"),
    (WellKnownKind::Rotator, "Rotator"),
    (WellKnownKind::Quat, "Quat"),
    (WellKnownKind::LinearColor, "LinearColor"),
    (WellKnownKind::Color, "Color"),
    (WellKnownKind::IntPoint, "IntPoint"),
    (WellKnownKind::Guid, "Guid"),
    (WellKnownKind::DateTime, "DateTime"),
    (WellKnownKind::Box, "Box"),
    (WellKnownKind::ItemNetId, "ItemNetID"),
    (WellKnownKind::UniqueNetId, "UniqueNetIdRepl"),
    (WellKnownKind::TimestampFlag, "TimestampFlag"),
];

impl WellKnownKind {
    pub fn from_name(name: &str) -> Option<Self> {
        STRUCT_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        STRUCT_NAMES
            .iter()
            .find(|(kind, _)| kind == self)
            .map_or("", |(_, n)| n)
    }

    pub fn all_names() -> impl Iterator<Item = &'static str> {
        STRUCT_NAMES.iter().map(|(_, n)| *n)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Vector {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector {
    fn read(buf: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            x: buf.read_f64()?,
            y: buf.read_f64()?,
            z: buf.read_f64()?,
        })
    }

    fn write(&self, w: &mut ByteWriter) {
        w.write_f64(self.x);
        w.write_f64(self.y);
        w.write_f64(self.z);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum WellKnownStruct {
    Vector(Vector),
    Vector2D { x: f64, y: f64 },
    Rotator { pitch: f64, yaw: f64, roll: f64 },
    Quat { x: f64, y: f64, z: f64, w: f64 },
    LinearColor { r: f32, g: f32, b: f32, a: f32 },
    Color { b: u8, g: u8, r: u8, a: u8 },
    IntPoint { x: i32, y: i32 },
    Guid { id: Uuid },
    DateTime { ticks: i64 },
    Box { min: Vector, max: Vector, valid: u8 },
    ItemNetId { id1: u32, id2: u32 },
    UniqueNetId { flag: u8, net_type: String, value: String },
    TimestampFlag { timestamp: f64, flag: u32 },
}

impl WellKnownStruct {
    pub fn kind(&self) -> WellKnownKind {
        match self {
            Self::Vector(_) => WellKnownKind::Vector,
            Self::Vector2D { .. } => WellKnownKind::Vector2D,
            Self::Rotator { .. } => WellKnownKind::Rotator,
            Self::Quat { .. } => WellKnownKind::Quat,
            Self::LinearColor { .. } => WellKnownKind::LinearColor,
            Self::Color { .. } => WellKnownKind::Color,
            Self::IntPoint { .. } => WellKnownKind::IntPoint,
            Self::Guid { .. } => WellKnownKind::Guid,
            Self::DateTime { .. } => WellKnownKind::DateTime,
            Self::Box { .. } => WellKnownKind::Box,
            Self::ItemNetId { .. } => WellKnownKind::ItemNetId,
            Self::UniqueNetId { .. } => WellKnownKind::UniqueNetId,
            Self::TimestampFlag { .. } => WellKnownKind::TimestampFlag,
        }
    }

    pub fn read(kind: WellKnownKind, buf: &mut ByteBuffer) -> Result<Self> {
        Ok(match kind {
            WellKnownKind::Vector => Self::Vector(Vector::read(buf)?),
            WellKnownKind::Vector2D => Self::Vector2D {
                x: buf.read_f64()?,
                y: buf.read_f64()?,
            },
            WellKnownKind::Rotator => Self::Rotator {
                pitch: buf.read_f64()?,
                yaw: buf.read_f64()?,
                roll: buf.read_f64()?,
            },
            WellKnownKind::Quat => Self::Quat {
                x: buf.read_f64()?,
                y: buf.read_f64()?,
                z: buf.read_f64()?,
                w: buf.read_f64()?,
            },
            WellKnownKind::LinearColor => Self::LinearColor {
                r: buf.read_f32()?,
                g: buf.read_f32()?,
                b: buf.read_f32()?,
                a: buf.read_f32()?,
            },
            WellKnownKind::Color => Self::Color {
                b: buf.read_u8()?,
                g: buf.read_u8()?,
                r: buf.read_u8()?,
                a: buf.read_u8()?,
            },
            WellKnownKind::IntPoint => Self::IntPoint {
                x: buf.read_i32()?,
                y: buf.read_i32()?,
            },
            WellKnownKind::Guid => Self::Guid {
                id: buf.read_uuid()?,
            },
            WellKnownKind::DateTime => Self::DateTime {
                ticks: buf.read_i64()?,
            },
            WellKnownKind::Box => Self::Box {
                min: Vector::read(buf)?,
                max: Vector::read(buf)?,
                valid: buf.read_u8()?,
            },
            WellKnownKind::ItemNetId => Self::ItemNetId {
                id1: buf.read_u32()?,
                id2: buf.read_u32()?,
            },
            WellKnownKind::UniqueNetId => Self::UniqueNetId {
                flag: buf.read_u8()?,
                net_type: buf.read_string()?,
                value: buf.read_string()?,
            },
            WellKnownKind::TimestampFlag => Self::TimestampFlag {
                timestamp: buf.read_f64()?,
                flag: buf.read_u32()?,
            },
        })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        match self {
            Self::Vector(v) => v.write(w),
            Self::Vector2D { x, y } => {
                w.write_f64(*x);
                w.write_f64(*y);
            }
            Self::Rotator { pitch, yaw, roll } => {
                w.write_f64(*pitch);
                w.write_f64(*yaw);
                w.write_f64(*roll);
            }
            Self::Quat { x, y, z, w: qw } => {
                for v in [*x, *y, *z, *qw] {
                    w.write_f64(v);
                }
            }
            Self::LinearColor { r, g, b, a } => {
                for v in [*r, *g, *b, *a] {
                    w.write_f32(v);
                }
            }
            Self::Color { b, g, r, a } => w.write_bytes(&[*b, *g, *r, *a]),
            Self::IntPoint { x, y } => {
                w.write_i32(*x);
                w.write_i32(*y);
            }
            Self::Guid { id } => w.write_uuid(id),
            Self::DateTime { ticks } => w.write_i64(*ticks),
            Self::Box { min, max, valid } => {
                min.write(w);
                max.write(w);
                w.write_u8(*valid);
            }
            Self::ItemNetId { id1, id2 } => {
                w.write_u32(*id1);
                w.write_u32(*id2);
            }
            Self::UniqueNetId {
                flag,
                net_type,
                value,
            } => {
                w.write_u8(*flag);
                w.write_string(net_type);
                w.write_string(value);
            }
            Self::TimestampFlag { timestamp, flag } => {
                w.write_f64(*timestamp);
                w.write_u32(*flag);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Vector(_) | Self::Rotator { .. } => 24,
            Self::Vector2D { .. } => 16,
            Self::Quat { .. } => 32,
            Self::LinearColor { .. } | Self::Guid { .. } => 16,
            Self::Color { .. } => 4,
            Self::IntPoint { .. } | Self::DateTime { .. } | Self::ItemNetId { .. } => 8,
            Self::Box { .. } => 49,
            Self::UniqueNetId {
                net_type, value, ..
            } => 1 + encoded_string_len(net_type) + encoded_string_len(value),
            Self::TimestampFlag { .. } => 12,
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{Vector, WellKnownKind, WellKnownStruct};
    use crate::buffer::{ByteBuffer, ByteWriter};

    fn decode(kind: WellKnownKind, bytes: Vec<u8>) -> WellKnownStruct {
        let mut buf = ByteBuffer::new(bytes);
        let value = WellKnownStruct::read(kind, &mut buf).unwrap();
        assert_eq!(buf.remaining(), 0, "{kind:?} left bytes unread");
        value
    }

    fn f64s(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn vector_is_three_little_endian_doubles() {
        let bytes = f64s(&[1.0, 2.0, 3.0]);
        assert_eq!(bytes.len(), 24);
        assert_eq!(
            decode(WellKnownKind::Vector, bytes),
            WellKnownStruct::Vector(Vector { x: 1.0, y: 2.0, z: 3.0 })
        );
    }

    #[test]
    fn rotator_and_quat_fixtures() {
        assert_eq!(
            decode(WellKnownKind::Rotator, f64s(&[10.0, -90.5, 0.25])),
            WellKnownStruct::Rotator { pitch: 10.0, yaw: -90.5, roll: 0.25 }
        );
        assert_eq!(
            decode(WellKnownKind::Quat, f64s(&[0.0, 0.0, 0.7071, 0.7071])),
            WellKnownStruct::Quat { x: 0.0, y: 0.0, z: 0.7071, w: 0.7071 }
        );
    }

    #[test]
    fn color_fixtures() {
        assert_eq!(
            decode(WellKnownKind::Color, vec![0x10, 0x20, 0x30, 0xFF]),
            WellKnownStruct::Color { b: 0x10, g: 0x20, r: 0x30, a: 0xFF }
        );
        let mut bytes = Vec::new();
        for v in [0.5f32, 0.25, 1.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert_eq!(
            decode(WellKnownKind::LinearColor, bytes),
            WellKnownStruct::LinearColor { r: 0.5, g: 0.25, b: 1.0, a: 0.0 }
        );
    }

    #[test]
    fn id_struct_fixtures() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u32.to_le_bytes());
        bytes.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        assert_eq!(
            decode(WellKnownKind::ItemNetId, bytes),
            WellKnownStruct::ItemNetId { id1: 7, id2: 0xDEADBEEF }
        );

        let id = Uuid::from_u128(0x0011_2233_4455_6677_8899_AABB_CCDD_EEFF);
        assert_eq!(
            decode(WellKnownKind::Guid, id.as_bytes().to_vec()),
            WellKnownStruct::Guid { id }
        );

        let mut w = ByteWriter::new();
        w.write_u8(1);
        w.write_string("EOS");
        w.write_string("0002abcdef");
        assert_eq!(
            decode(WellKnownKind::UniqueNetId, w.into_bytes()),
            WellKnownStruct::UniqueNetId {
                flag: 1,
                net_type: "EOS".into(),
                value: "0002abcdef".into()
            }
        );
    }

    #[test]
    fn timestamp_and_box_fixtures() {
        let mut bytes = 1234.5f64.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        assert_eq!(
            decode(WellKnownKind::TimestampFlag, bytes),
            WellKnownStruct::TimestampFlag { timestamp: 1234.5, flag: 1 }
        );

        let mut bytes = f64s(&[-1.0, -2.0, -3.0, 4.0, 5.0, 6.0]);
        bytes.push(1);
        let value = decode(WellKnownKind::Box, bytes);
        assert_eq!(value.encoded_len(), 49);
        assert_eq!(
            value,
            WellKnownStruct::Box {
                min: Vector { x: -1.0, y: -2.0, z: -3.0 },
                max: Vector { x: 4.0, y: 5.0, z: 6.0 },
                valid: 1
            }
        );
    }

    #[test]
    fn encoded_len_matches_writer() {
        let samples = [
            WellKnownStruct::Vector2D { x: 1.0, y: 2.0 },
            WellKnownStruct::IntPoint { x: -4, y: 9 },
            WellKnownStruct::DateTime { ticks: 637_000_000_000 },
            WellKnownStruct::UniqueNetId {
                flag: 0,
                net_type: String::new(),
                value: "x".into(),
            },
        ];
        for sample in samples {
            let mut w = ByteWriter::new();
            sample.write(&mut w);
            assert_eq!(w.position(), sample.encoded_len(), "{:?}", sample.kind());
            assert_eq!(
                WellKnownKind::from_name(sample.kind().as_str()),
                Some(sample.kind())
            );
        }
    }
}
