use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Serialize, Serializer};
use tracing::debug;
use uuid::Uuid;

use crate::buffer::{ByteBuffer, ByteWriter};
use crate::error::{Result, SaveError};

pub const NONE_NAME: &str = "None";

/// Indices with this bit set resolve against a table's constant names rather
/// than its own entries.
pub const CONSTANT_NAME_BIT: u32 = 0x1000_0000;

/// First header version that carries the reserved u32 and the struct-header
/// size byte.
pub const EXTENDED_HEADER_VERSION: u16 = 12;

const VOLUME_MARKER_SUFFIX: &str = "Volume";

/// An interned string as it appeared on disk: base text, the table index it
/// came from and its instance number.
#[derive(Debug, Clone)]
pub struct Name {
    text: String,
    index: Option<u32>,
    number: u32,
}

impl Name {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            index: None,
            number: 0,
        }
    }

    pub fn none() -> Self {
        Self::new(NONE_NAME)
    }

    pub fn resolved(text: impl Into<String>, index: u32, number: u32) -> Self {
        Self {
            text: text.into(),
            index: Some(index),
            number,
        }
    }

    pub fn base(&self) -> &str {
        &self.text
    }

    pub fn index(&self) -> Option<u32> {
        self.index
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn is_none(&self) -> bool {
        self.number == 0 && self.text == NONE_NAME
    }

    fn is_volume_marker(&self) -> bool {
        self.text.ends_with(VOLUME_MARKER_SUFFIX)
    }

    /// Matches either the bare base text (instance 0) or the full display form.
    pub fn matches(&self, s: &str) -> bool {
        if self.number == 0 {
            self.text == s
        } else {
            self.to_string() == s
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.number {
            0 => f.write_str(&self.text),
            n if self.is_volume_marker() => write!(f, "{}_{:X}", self.text, n),
            n => write!(f, "{}_{}", self.text, n - 1),
        }
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text && self.number == other.number
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
        self.number.hash(state);
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Bidirectional index <-> string table.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    by_index: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
    order: Vec<u32>,
    constants: &'static [&'static str],
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_constants(constants: &'static [&'static str]) -> Self {
        Self {
            constants,
            ..Self::default()
        }
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut table = Self::new();
        for name in names {
            table.intern(name);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// An empty table means "no table": name reads fall back to strings.
    /// A table with constants is never empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty() && self.constants.is_empty()
    }

    pub fn insert(&mut self, index: u32, name: impl Into<String>) {
        let name = name.into();
        if self.by_index.insert(index, name.clone()).is_none() {
            self.order.push(index);
        }
        self.by_name.entry(name).or_insert(index);
    }

    /// Index of `name`, appending it with the next free index if absent.
    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(index) = self.index_of(name) {
            return index;
        }
        let index = self.order.iter().max().map_or(0, |max| max + 1);
        self.insert(index, name);
        index
    }

    pub fn resolve(&self, index: u32) -> Option<&str> {
        if index & CONSTANT_NAME_BIT != 0 && !self.constants.is_empty() {
            return self
                .constants
                .get((index & !CONSTANT_NAME_BIT) as usize)
                .copied();
        }
        self.by_index.get(&index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied().or_else(|| {
            self.constants
                .iter()
                .position(|&c| c == name)
                .map(|i| i as u32 | CONSTANT_NAME_BIT)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.order
            .iter()
            .filter_map(|&index| self.by_index.get(&index).map(|s| (index, s.as_str())))
    }

    /// `u32 count` followed by `(u32 index, string)` pairs.
    pub fn read_indexed(buf: &mut ByteBuffer) -> Result<Self> {
        let count = buf.read_u32()?;
        let mut table = Self::new();
        for _ in 0..count {
            let index = buf.read_u32()?;
            let name = buf.read_string()?;
            table.insert(index, name);
        }
        Ok(table)
    }

    pub fn write_indexed(&self, w: &mut ByteWriter) {
        w.write_u32(self.order.len() as u32);
        for (index, name) in self.iter() {
            w.write_u32(index);
            w.write_string(name);
        }
    }

    /// `u32 count` followed by strings whose index is their position.
    pub fn read_sequential(
        buf: &mut ByteBuffer,
        constants: &'static [&'static str],
    ) -> Result<Self> {
        let count = buf.read_u32()?;
        let mut table = Self::with_constants(constants);
        for index in 0..count {
            let name = buf.read_string()?;
            table.insert(index, name);
        }
        Ok(table)
    }

    pub fn write_sequential(&self, w: &mut ByteWriter) {
        w.write_u32(self.order.len() as u32);
        for (_, name) in self.iter() {
            w.write_string(name);
        }
    }

    pub fn read_name(&self, buf: &mut ByteBuffer) -> Result<Name> {
        if self.is_empty() {
            return Ok(Name::new(buf.read_string()?));
        }

        let offset = buf.position();
        let index = buf.read_u32()?;
        let text = self
            .resolve(index)
            .ok_or(SaveError::UnresolvedName { index, offset })?
            .to_string();
        let number = buf.read_u32()?;
        Ok(Name::resolved(text, index, number))
    }

    pub fn write_name(&self, w: &mut ByteWriter, name: &Name) -> Result<()> {
        if self.is_empty() {
            w.write_string(&name.to_string());
            return Ok(());
        }

        let index = name
            .index()
            .filter(|&i| self.resolve(i) == Some(name.base()))
            .or_else(|| self.index_of(name.base()))
            .ok_or_else(|| {
                SaveError::NotFound(format!("name {:?} is not in the name table", name.base()))
            })?;
        w.write_u32(index);
        w.write_u32(name.number());
        Ok(())
    }

    /// Bytes [`NameTable::write_name`] would emit for `name`.
    pub fn name_len(&self, name: &Name) -> usize {
        if self.is_empty() {
            crate::buffer::encoded_string_len(&name.to_string())
        } else {
            8
        }
    }
}

/// Position and rotation of a placed object.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct WorldTransform {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
    pub flags: u64,
}

impl WorldTransform {
    pub fn read(buf: &mut ByteBuffer) -> Result<Self> {
        Ok(Self {
            x: buf.read_f64()?,
            y: buf.read_f64()?,
            z: buf.read_f64()?,
            pitch: buf.read_f64()?,
            yaw: buf.read_f64()?,
            roll: buf.read_f64()?,
            flags: buf.read_u64()?,
        })
    }

    pub fn write(&self, w: &mut ByteWriter) {
        for v in [self.x, self.y, self.z, self.pitch, self.yaw, self.roll] {
            w.write_f64(v);
        }
        w.write_u64(self.flags);
    }
}

/// Identifier -> transform records, terminated on disk by an all-zero id.
#[derive(Debug, Clone, Default)]
pub struct TransformTable {
    entries: Vec<(Uuid, WorldTransform)>,
    by_id: HashMap<Uuid, usize>,
    tail: Vec<u8>,
}

impl TransformTable {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = ByteBuffer::from_slice(bytes);
        let mut table = Self::default();
        loop {
            let id = buf.read_uuid()?;
            if id.is_nil() {
                break;
            }
            let transform = WorldTransform::read(&mut buf)?;
            table.insert(id, transform);
        }
        table.tail = buf.read_bytes(buf.remaining())?;
        Ok(table)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        for (id, transform) in &self.entries {
            w.write_uuid(id);
            transform.write(&mut w);
        }
        w.write_uuid(&Uuid::nil());
        w.write_bytes(&self.tail);
        w.into_bytes()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&WorldTransform> {
        self.by_id.get(id).map(|&i| &self.entries[i].1)
    }

    /// Replace an existing record in place, or append one just before the
    /// sentinel.
    pub fn insert(&mut self, id: Uuid, transform: WorldTransform) {
        match self.by_id.get(&id) {
            Some(&i) => self.entries[i].1 = transform,
            None => {
                self.by_id.insert(id, self.entries.len());
                self.entries.push((id, transform));
            }
        }
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<WorldTransform> {
        let index = self.by_id.remove(id)?;
        let (_, transform) = self.entries.remove(index);
        for slot in self.by_id.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(transform)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Uuid, WorldTransform)> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderSection {
    pub name: String,
    pub index: u32,
    pub flags: u32,
}

/// Save-level metadata stored under `custom["SaveHeader"]`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveHeader {
    pub version: u16,
    pub game_time: f64,
    pub reserved: Option<u32>,
    pub sections: Vec<HeaderSection>,
    #[serde(skip)]
    padding: Vec<u8>,
    #[serde(skip)]
    trailing: Vec<u8>,
}

impl SaveHeader {
    pub fn new(version: u16, game_time: f64) -> Self {
        Self {
            version,
            game_time,
            reserved: (version >= EXTENDED_HEADER_VERSION).then_some(0),
            sections: Vec::new(),
            padding: Vec::new(),
            trailing: Vec::new(),
        }
    }

    fn parse(buf: &mut ByteBuffer) -> Result<(Self, NameTable)> {
        let version = buf.read_u16()?;
        let name_table_offset = buf.read_u32()? as usize;
        let game_time = buf.read_f64()?;
        let reserved = if version >= EXTENDED_HEADER_VERSION {
            Some(buf.read_u32()?)
        } else {
            None
        };

        let section_count = buf.read_u32()?;
        let mut sections = Vec::new();
        for _ in 0..section_count {
            sections.push(HeaderSection {
                name: buf.read_string()?,
                index: buf.read_u32()?,
                flags: buf.read_u32()?,
            });
        }

        let padding_len = name_table_offset.checked_sub(buf.position()).ok_or_else(|| {
            SaveError::invalid(format!(
                "name table offset {name_table_offset} points inside the header sections (cursor {})",
                buf.position()
            ))
        })?;
        let padding = buf.read_bytes(padding_len)?;
        let names = NameTable::read_indexed(buf)?;
        let trailing = buf.read_bytes(buf.remaining())?;

        Ok((
            Self {
                version,
                game_time,
                reserved,
                sections,
                padding,
                trailing,
            },
            names,
        ))
    }

    fn to_bytes(&self, names: &NameTable) -> Result<Vec<u8>> {
        let mut w = ByteWriter::new();
        w.write_u16(self.version);
        let offset_field = w.position();
        w.write_u32(0);
        w.write_f64(self.game_time);
        if self.version >= EXTENDED_HEADER_VERSION {
            w.write_u32(self.reserved.unwrap_or(0));
        }
        w.write_u32(self.sections.len() as u32);
        for section in &self.sections {
            w.write_string(&section.name);
            w.write_u32(section.index);
            w.write_u32(section.flags);
        }
        w.write_bytes(&self.padding);
        let table_offset = w.position() as u32;
        w.patch_u32(offset_field, table_offset)?;
        names.write_indexed(&mut w);
        w.write_bytes(&self.trailing);
        Ok(w.into_bytes())
    }
}

/// Per-save state shared read-only by every decoder: the name table, the
/// transform table and header metadata.
///
/// Built once when a save or archive is opened. The only mutations are
/// [`SaveContext::intern_name`] and [`SaveContext::insert_transform`], which
/// need exclusive access.
#[derive(Debug, Clone, Default)]
pub struct SaveContext {
    header: Option<SaveHeader>,
    names: NameTable,
    transforms: TransformTable,
    version: u16,
}

impl SaveContext {
    pub fn new(version: u16, names: NameTable) -> Self {
        Self {
            header: None,
            names,
            transforms: TransformTable::default(),
            version,
        }
    }

    pub fn with_header(header: SaveHeader, names: NameTable) -> Self {
        Self {
            version: header.version,
            header: Some(header),
            names,
            transforms: TransformTable::default(),
        }
    }

    pub fn from_blobs(header: &[u8], transforms: Option<&[u8]>) -> Result<Self> {
        let mut buf = ByteBuffer::from_slice(header);
        let (header, names) = SaveHeader::parse(&mut buf)?;
        let transforms = match transforms {
            Some(bytes) => TransformTable::parse(bytes)?,
            None => TransformTable::default(),
        };
        debug!(
            version = header.version,
            names = names.len(),
            transforms = transforms.len(),
            "loaded save context"
        );
        Ok(Self {
            version: header.version,
            header: Some(header),
            names,
            transforms,
        })
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn header(&self) -> Option<&SaveHeader> {
        self.header.as_ref()
    }

    pub fn game_time(&self) -> Option<f64> {
        self.header.as_ref().map(|h| h.game_time)
    }

    pub fn names(&self) -> &NameTable {
        &self.names
    }

    pub fn resolve(&self, index: u32) -> Option<&str> {
        self.names.resolve(index)
    }

    pub fn index_of(&self, name: &str) -> Option<u32> {
        self.names.index_of(name)
    }

    pub fn intern_name(&mut self, name: &str) -> u32 {
        self.names.intern(name)
    }

    pub fn transforms(&self) -> &TransformTable {
        &self.transforms
    }

    pub fn transform(&self, id: &Uuid) -> Option<&WorldTransform> {
        self.transforms.get(id)
    }

    pub fn insert_transform(&mut self, id: Uuid, transform: WorldTransform) {
        self.transforms.insert(id, transform);
    }

    pub fn remove_transform(&mut self, id: &Uuid) -> Option<WorldTransform> {
        self.transforms.remove(id)
    }

    pub fn set_transforms(&mut self, transforms: TransformTable) {
        self.transforms = transforms;
    }

    /// Re-encode the header blob, name table included.
    pub fn header_bytes(&self) -> Result<Vec<u8>> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| SaveError::invalid("context has no save header"))?;
        header.to_bytes(&self.names)
    }

    pub fn transforms_bytes(&self) -> Vec<u8> {
        self.transforms.to_bytes()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{
        CONSTANT_NAME_BIT, Name, NameTable, SaveContext, SaveHeader, TransformTable,
        WorldTransform,
    };
    use crate::buffer::{ByteBuffer, ByteWriter};
    use crate::error::SaveError;

    #[test]
    fn instance_numbers_render_as_suffixes() {
        assert_eq!(Name::resolved("Dodo_Character", 4, 0).to_string(), "Dodo_Character");
        assert_eq!(Name::resolved("Dodo_Character", 4, 3).to_string(), "Dodo_Character_2");
        assert_eq!(Name::resolved("MissionVolume", 9, 26).to_string(), "MissionVolume_1A");
        assert!(Name::resolved("Dodo_Character", 4, 3).matches("Dodo_Character_2"));
    }

    #[test]
    fn read_name_requires_resolution() {
        let table = NameTable::from_names(["None", "Health"]);
        let mut w = ByteWriter::new();
        w.write_u32(7);
        w.write_u32(0);
        let mut buf = ByteBuffer::new(w.into_bytes());
        let err = table.read_name(&mut buf).unwrap_err();
        assert!(matches!(err, SaveError::UnresolvedName { index: 7, offset: 0 }));
    }

    #[test]
    fn empty_table_degrades_to_strings() {
        let table = NameTable::new();
        let mut w = ByteWriter::new();
        table.write_name(&mut w, &Name::new("BoolProperty")).unwrap();
        let mut buf = ByteBuffer::new(w.into_bytes());
        assert_eq!(table.read_name(&mut buf).unwrap().base(), "BoolProperty");
    }

    #[test]
    fn constants_live_in_their_own_index_space() {
        static CONSTANTS: &[&str] = &["None", "IntProperty"];
        let mut table = NameTable::with_constants(CONSTANTS);
        table.insert(1, "Local");
        assert_eq!(table.resolve(1), Some("Local"));
        assert_eq!(table.resolve(1 | CONSTANT_NAME_BIT), Some("IntProperty"));
        assert_eq!(table.index_of("IntProperty"), Some(1 | CONSTANT_NAME_BIT));
    }

    #[test]
    fn transform_insert_lands_before_sentinel() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut table = TransformTable::default();
        table.insert(a, WorldTransform { x: 1.0, ..Default::default() });
        let mut bytes = table.to_bytes();
        bytes.extend_from_slice(&[0xAB, 0xCD]);

        let mut parsed = TransformTable::parse(&bytes).unwrap();
        parsed.insert(b, WorldTransform { y: 2.0, flags: 5, ..Default::default() });
        let out = parsed.to_bytes();

        let record = 16 + 6 * 8 + 8;
        assert_eq!(out.len(), 2 * record + 16 + 2);
        assert_eq!(&out[record..record + 16], b.as_bytes());
        assert!(out[2 * record..2 * record + 16].iter().all(|&b| b == 0));
        assert_eq!(&out[out.len() - 2..], &[0xAB, 0xCD]);
        assert_eq!(parsed.get(&b).unwrap().flags, 5);
    }

    #[test]
    fn header_round_trips_and_grows_name_table() {
        let mut header = SaveHeader::new(13, 4321.5);
        header.sections.push(super::HeaderSection {
            name: "TheIsland_WP".to_string(),
            index: 0,
            flags: 1,
        });
        let names = NameTable::from_names(["None", "IntProperty"]);
        let ctx = SaveContext::with_header(header, names);
        let bytes = ctx.header_bytes().unwrap();

        let mut reopened = SaveContext::from_blobs(&bytes, None).unwrap();
        assert_eq!(reopened.header_bytes().unwrap(), bytes);
        assert_eq!(reopened.version(), 13);
        assert_eq!(reopened.game_time(), Some(4321.5));
        assert_eq!(reopened.header().unwrap().reserved, Some(0));

        let index = reopened.intern_name("TamedName");
        assert_eq!(index, 2);
        let grown = SaveContext::from_blobs(&reopened.header_bytes().unwrap(), None).unwrap();
        assert_eq!(grown.resolve(2), Some("TamedName"));
        assert_eq!(grown.index_of("TamedName"), Some(2));
    }

    #[test]
    fn legacy_header_has_no_reserved_field() {
        let ctx = SaveContext::with_header(SaveHeader::new(11, 0.0), NameTable::from_names(["None"]));
        let bytes = ctx.header_bytes().unwrap();
        // version, offset, game time, section count
        assert_eq!(u32::from_le_bytes(bytes[2..6].try_into().unwrap()), 2 + 4 + 8 + 4);
        let reopened = SaveContext::from_blobs(&bytes, None).unwrap();
        assert_eq!(reopened.header().unwrap().reserved, None);
    }
}
