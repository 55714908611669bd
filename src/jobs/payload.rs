//! Job payload codec
//!
//! Payloads are typed serde values stored as text. Decoding always targets a
//! concrete type, so values such as `chrono` dates come back as the same
//! type they were dispatched with instead of degrading to strings.

use crate::error::{QueueError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema tag written into every dispatch payload
pub const PAYLOAD_VERSION: &str = "v1";

/// Envelope written by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchPayload<T> {
    pub class_path: String,
    pub data: T,
    pub version: String,
}

/// Serialized payload as persisted by drivers
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPayload(String);

impl JobPayload {
    /// Serialize any value
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self(serde_json::to_string(value)?))
    }

    /// Deserialize into a concrete type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.0)?)
    }

    /// Wrap job data in a versioned dispatch envelope
    pub fn dispatch<T: Serialize>(class_path: &str, data: &T) -> Result<Self> {
        Self::encode(&DispatchPayload {
            class_path: class_path.to_string(),
            data,
            version: PAYLOAD_VERSION.to_string(),
        })
    }

    /// Unwrap a dispatch envelope, rejecting unknown schema versions
    pub fn decode_dispatch<T: DeserializeOwned>(&self) -> Result<DispatchPayload<T>> {
        let payload: DispatchPayload<T> = self.decode()?;
        if payload.version != PAYLOAD_VERSION {
            return Err(QueueError::unsupported(format!(
                "payload version \"{}\" (expected \"{}\")",
                payload.version, PAYLOAD_VERSION
            )));
        }
        Ok(payload)
    }

    /// Wrap text that is already serialized (e.g. read back from storage)
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for JobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("JobPayload").field(&self.0).finish()
    }
}
