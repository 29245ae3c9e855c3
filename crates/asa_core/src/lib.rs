//! Decode, re-encode and patch survival-game world saves.
//!
//! A save is a SQLite file ([`store::SaveStore`]) mapping identifiers to
//! object blobs. Each blob is a tagged property bag ([`property`]) whose
//! names index the save-wide table in [`context::SaveContext`]. Frozen
//! creatures carry whole nested archives ([`archive`]) inside byte arrays.
//! [`patch::Patcher`] edits single values in a blob without re-encoding the
//! rest of it.

pub mod archive;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod layout;
pub mod object;
pub mod patch;
pub mod property;
pub mod store;

pub use archive::{Archive, ArchiveObject};
pub use config::{DecodeOptions, DecodePolicy, InvalidObjectHook};
pub use context::{Name, NameTable, SaveContext, WorldTransform};
pub use error::{ErrorCode, Result, SaveError};
pub use object::GameObject;
pub use patch::Patcher;
pub use property::{Property, PropertyBag, PropertyType, Value};
pub use store::{SaveStore, ScanReport};
