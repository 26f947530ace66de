// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload codecs keyed by stable type tags.
//!
//! Parameters, scrapbooks, results and failures cross the store boundary as
//! [`Payload`] values: a JSON document plus an application-chosen tag naming
//! how to interpret it. The registry maps each tag to an encode/decode pair;
//! tags without a registered codec fall back to plain JSON pass-through. Tags
//! are stable strings chosen by the application, never runtime type names, so
//! payloads written by one process version remain readable by the next.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::storage::Payload;

/// Tag used when the application registers no codec of its own.
pub const JSON_TAG: &str = "json";

/// A codec failure; surfaces as a `Failed` verdict rather than an engine error
/// so a malformed payload cannot leave an invocation executing forever.
#[derive(Debug, Clone, thiserror::Error)]
#[error("codec error for tag '{tag}': {message}")]
pub struct CodecError {
    /// The tag whose codec failed.
    pub tag: String,
    /// Failure details.
    pub message: String,
}

/// Encode/decode pair for one type tag.
pub trait Codec: Send + Sync {
    /// The stable tag this codec serves.
    fn tag(&self) -> &str;

    /// Serialize a value into a payload carrying this codec's tag.
    fn encode(&self, value: &Value) -> Result<Payload, CodecError>;

    /// Interpret a payload previously produced by [`encode`](Self::encode).
    fn decode(&self, payload: &Payload) -> Result<Value, CodecError>;
}

/// Pass-through codec: the value already is JSON.
pub struct JsonCodec {
    tag: String,
}

impl JsonCodec {
    /// Create a pass-through codec for `tag`.
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

impl Codec for JsonCodec {
    fn tag(&self) -> &str {
        &self.tag
    }

    fn encode(&self, value: &Value) -> Result<Payload, CodecError> {
        let json = serde_json::to_string(value).map_err(|e| CodecError {
            tag: self.tag.clone(),
            message: e.to_string(),
        })?;
        Ok(Payload::new(json, self.tag.clone()))
    }

    fn decode(&self, payload: &Payload) -> Result<Value, CodecError> {
        serde_json::from_str(&payload.json).map_err(|e| CodecError {
            tag: self.tag.clone(),
            message: e.to_string(),
        })
    }
}

/// Registry of codecs keyed by type tag.
///
/// Populated at engine construction; immutable afterwards.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: HashMap<String, Arc<dyn Codec>>,
}

impl CodecRegistry {
    /// Create an empty registry. Unregistered tags decode as plain JSON.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec under its own tag, replacing any previous one.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.tag().to_string(), codec);
    }

    /// Encode `value` under `tag`.
    pub fn encode(&self, tag: &str, value: &Value) -> Result<Payload, CodecError> {
        match self.codecs.get(tag) {
            Some(codec) => codec.encode(value),
            None => JsonCodec::new(tag).encode(value),
        }
    }

    /// Decode a payload by its embedded tag.
    pub fn decode(&self, payload: &Payload) -> Result<Value, CodecError> {
        match self.codecs.get(&payload.type_tag) {
            Some(codec) => codec.decode(payload),
            None => JsonCodec::new(&payload.type_tag).decode(payload),
        }
    }
}
