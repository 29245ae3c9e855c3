use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SaveError;

/// Decoder switches. Deserializable so front ends can load them from a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecodeOptions {
    /// Skip objects that fail to decode during a scan instead of aborting it.
    pub allow_invalid_objects: bool,
    /// Report struct size mismatches as errors instead of resyncing.
    pub strict_struct_sizes: bool,
    /// Log every property while decoding, not just archive retries.
    pub verbose_recovery: bool,
}

impl DecodeOptions {
    pub fn permissive() -> Self {
        Self {
            allow_invalid_objects: true,
            ..Self::default()
        }
    }

    pub fn strict() -> Self {
        Self {
            strict_struct_sizes: true,
            ..Self::default()
        }
    }
}

/// Callback invoked for each object a permissive scan skips.
pub type InvalidObjectHook = Arc<dyn Fn(&Uuid, &SaveError) + Send + Sync>;

/// What a scan does with objects that fail to decode.
#[derive(Clone, Default)]
pub struct DecodePolicy {
    pub options: DecodeOptions,
    pub on_invalid: Option<InvalidObjectHook>,
}

impl DecodePolicy {
    pub fn new(options: DecodeOptions) -> Self {
        Self {
            options,
            on_invalid: None,
        }
    }

    pub fn with_hook(mut self, hook: InvalidObjectHook) -> Self {
        self.on_invalid = Some(hook);
        self
    }

    pub fn allows_invalid(&self) -> bool {
        self.options.allow_invalid_objects
    }
}

impl fmt::Debug for DecodePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodePolicy")
            .field("options", &self.options)
            .field("on_invalid", &self.on_invalid.is_some())
            .finish()
    }
}
