//! JSON envelopes exchanged between the adapter and the control plane.
//!
//! An invocation arrives as an [`InvocationEnvelope`] and concludes with
//! exactly one [`ResponseEnvelope`] or [`ErrorEnvelope`]. A decoded
//! invocation body may instead carry a [`StreamingDirective`], in which case
//! the response body leaves through the streaming relay and the control
//! plane only receives the empty placeholder envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Encoding marker emitted on every response envelope body.
pub const BODY_ENCODING: &str = "base64";

/// One inbound HTTP request as serialized by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationEnvelope {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded request body; empty string when the request had none.
    #[serde(default)]
    pub body: String,
}

/// Header values folded per name: repeated header names become a sequence
/// with values in emission order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum HeaderValues {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValues {
    /// Folds the values emitted for one header name. A single value stays a
    /// bare string on the wire; two or more become a sequence.
    pub fn from_values(mut values: Vec<String>) -> Self {
        if values.len() == 1 {
            Self::Single(values.remove(0))
        } else {
            Self::Multi(values)
        }
    }

    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Multi(values) => values,
        }
    }
}

/// One outbound HTTP response as serialized for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub headers: BTreeMap<String, HeaderValues>,
    pub encoding: String,
    /// Base64-encoded response body; empty string for an empty body, never
    /// an omitted field.
    pub body: String,
}

impl ResponseEnvelope {
    /// Placeholder envelope posted after a streamed response: the real bytes
    /// already left through the relay, the control plane only needs to know
    /// the invocation finished.
    pub fn empty() -> Self {
        Self {
            status_code: 200,
            headers: BTreeMap::new(),
            encoding: BODY_ENCODING.to_string(),
            body: String::new(),
        }
    }
}

/// Unhandled-error report for one invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Vec<String>,
}

impl ErrorEnvelope {
    pub fn new(
        error_type: impl Into<String>,
        error_message: impl Into<String>,
        stack_trace: Vec<String>,
    ) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace,
        }
    }
}

/// Streaming instructions embedded in a decoded invocation body.
///
/// Presence of all five fields switches the invocation onto the relay path;
/// any other body shape means "respond inline".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingDirective {
    pub callout_url: String,
    pub stream_id: String,
    pub cipher_algorithm: String,
    /// Base64-encoded cipher key.
    pub cipher_key: String,
    /// Base64-encoded cipher IV.
    #[serde(rename = "cipherIV")]
    pub cipher_iv: String,
}

impl StreamingDirective {
    /// Probes a decoded invocation body for streaming instructions.
    pub fn detect(decoded_body: &[u8]) -> Option<Self> {
        serde_json::from_slice(decoded_body).ok()
    }
}
