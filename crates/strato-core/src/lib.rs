//! Wire data model and pure translation layer for the strato runtime adapter.
//!
//! Defines the JSON envelopes exchanged with the control plane and the pure
//! conversions between envelopes and standard HTTP request/response objects.
//! Nothing in this crate performs I/O.

pub mod envelope;
pub mod translate;

pub use envelope::{
    ErrorEnvelope, HeaderValues, InvocationEnvelope, ResponseEnvelope, StreamingDirective,
};
pub use translate::{decode_body, from_envelope, from_envelope_without_body, to_envelope, TranslateError};
