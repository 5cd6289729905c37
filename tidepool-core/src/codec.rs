//! Typed values on top of opaque blobs.
//!
//! Stores only ever see bytes. This module is the serialization
//! collaborator: bincode (serde adapter, standard config) in both
//! directions, plus [`TypedStore`] for reading and writing typed values
//! through any [`StateStore`].

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::traits::StateStore;
use crate::Blob;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A required key is absent
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Encode a value into a blob.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Blob, CodecError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a blob into a value.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    Ok(value)
}

/// Typed reads and writes for any [`StateStore`].
pub trait TypedStore: StateStore {
    /// Read and decode `key`, failing with [`CodecError::KeyNotFound`]
    /// when it is absent.
    fn read_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, CodecError> {
        self.try_read_as(key)?
            .ok_or_else(|| CodecError::KeyNotFound(key.to_owned()))
    }

    /// Read and decode `key`, `None` when absent.
    fn try_read_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CodecError> {
        match self.read(key) {
            Some(blob) => decode(&blob)
                .map(Some)
                .map_err(|e| CodecError::Decode(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    /// Encode and write `value`. Returns whether the write was effective.
    fn write_as<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<bool, CodecError> {
        let blob = encode(value)?;
        Ok(self.write(key, Some(blob)))
    }
}

impl<S: StateStore + ?Sized> TypedStore for S {}
