//! Tagged encoding of step results.
//!
//! A completed step's output is stored as a JSON envelope carrying the Rust
//! type name of the value, so a replay that asks for a different type fails
//! loudly instead of silently coercing:
//!
//! ```json
//! {"type": "alloc::string::String", "value": "hello"}
//! ```
//!
//! The tag comes from `std::any::type_name`, which is stable for a given
//! build of the workflow code but not guaranteed across compiler versions.

use std::any::TypeId;

use durable_types::error::CodecError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    #[serde(rename = "type")]
    tag: &'a str,
    value: &'a T,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    tag: String,
    value: serde_json::Value,
}

/// Encodes and decodes step results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultCodec;

impl ResultCodec {
    /// Encode `value` into its stored text form.
    pub fn serialize<T: Serialize + 'static>(value: &T) -> Result<String, CodecError> {
        let envelope = EnvelopeRef {
            tag: std::any::type_name::<T>(),
            value,
        };
        serde_json::to_string(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
    }

    /// Decode stored text as `T`.
    ///
    /// Asking for `serde_json::Value` accepts any recorded type.
    pub fn deserialize<T: DeserializeOwned + 'static>(text: &str) -> Result<T, CodecError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;

        let requested = std::any::type_name::<T>();
        let generic = TypeId::of::<T>() == TypeId::of::<serde_json::Value>();
        if !generic && envelope.tag != requested {
            return Err(CodecError::TypeMismatch {
                recorded: envelope.tag,
                requested: requested.to_string(),
            });
        }

        serde_json::from_value(envelope.value).map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
