//! The unbounded serial invocation loop.
//!
//! One invocation is in flight at a time: fetch, translate, dispatch,
//! report, repeat. Recoverable failures become error envelopes and the loop
//! keeps serving; control-plane failures propagate out and terminate the
//! process.

use std::convert::Infallible;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use strato_core::{translate, ErrorEnvelope, InvocationEnvelope, ResponseEnvelope, StreamingDirective, TranslateError};

use crate::control_plane::{ControlPlaneClient, FatalError, PendingInvocation};
use crate::handler::{Handler, HandlerLoader};
use crate::relay::{self, RelayError};

/// Recoverable per-invocation failure. Reported through `post_error`; the
/// loop then proceeds to the next invocation.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("invocation payload is not a valid envelope")]
    Payload(#[source] serde_json::Error),
    #[error(transparent)]
    Translate(#[from] TranslateError),
    #[error("failed to load handler '{locator}': {error}")]
    HandlerLoad {
        locator: String,
        error: anyhow::Error,
    },
    #[error("handler failed: {0}")]
    Handler(anyhow::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl InvocationError {
    /// Stable classification name reported as the envelope `errorType`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Payload(_) => "PayloadError",
            Self::Translate(_) => "TranslateError",
            Self::HandlerLoad { .. } => "HandlerLoadError",
            Self::Handler(_) => "HandlerError",
            Self::Relay(_) => "RelayError",
        }
    }

    /// Converts the failure into the wire error report: type, top-level
    /// message, then the cause chain minus the message itself.
    pub fn to_error_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.error_type(), self.to_string(), self.cause_chain())
    }

    fn cause_chain(&self) -> Vec<String> {
        match self {
            Self::Handler(error) | Self::HandlerLoad { error, .. } => {
                error.chain().skip(1).map(|cause| cause.to_string()).collect()
            }
            other => {
                let mut chain = Vec::new();
                let mut cause = std::error::Error::source(other);
                while let Some(current) = cause {
                    chain.push(current.to_string());
                    cause = current.source();
                }
                chain
            }
        }
    }
}

/// The runtime adapter: owns the control-plane client, the handler loader,
/// and the single-slot handler cache. Only one invocation ever executes, so
/// the slot needs no locking.
pub struct Runtime {
    client: ControlPlaneClient,
    loader: Box<dyn HandlerLoader>,
    locator: String,
    handler: Option<Arc<dyn Handler>>,
}

impl Runtime {
    pub fn new(
        client: ControlPlaneClient,
        loader: Box<dyn HandlerLoader>,
        locator: impl Into<String>,
    ) -> Self {
        Self {
            client,
            loader,
            locator: locator.into(),
            handler: None,
        }
    }

    /// Serves invocations until the control plane fails. Never returns
    /// normally; the caller maps the fatal error to a non-zero exit.
    pub fn run(&mut self) -> Result<Infallible, FatalError> {
        loop {
            let pending = self.client.next_invocation()?;
            let span = tracing::info_span!(
                "invocation",
                invocation_id = %pending.context.invocation_id,
                trace_id = %pending.context.trace_id.as_deref().unwrap_or("-"),
            );
            let _guard = span.enter();
            match self.serve_one(&pending) {
                Ok(envelope) => {
                    self.client
                        .post_response(&pending.context.invocation_id, &envelope)?;
                    tracing::debug!(status = envelope.status_code, "invocation completed");
                }
                Err(error) => {
                    tracing::error!(
                        error = %error,
                        error_type = error.error_type(),
                        "invocation failed"
                    );
                    self.client
                        .post_error(&pending.context.invocation_id, &error.to_error_envelope())?;
                }
            }
        }
    }

    fn serve_one(
        &mut self,
        pending: &PendingInvocation,
    ) -> Result<ResponseEnvelope, InvocationError> {
        let envelope = parse_event(&pending.payload)?;
        let handler = self.handler()?;
        let decoded_body = translate::decode_body(&envelope.body)?;
        match StreamingDirective::detect(&decoded_body) {
            Some(directive) => {
                let request = translate::from_envelope_without_body(&envelope)?;
                let response = handler.invoke(request).map_err(InvocationError::Handler)?;
                relay::relay_response(&directive, &response)?;
                Ok(ResponseEnvelope::empty())
            }
            None => {
                let request = translate::from_envelope(&envelope)?;
                let response = handler.invoke(request).map_err(InvocationError::Handler)?;
                Ok(translate::to_envelope(&response))
            }
        }
    }

    /// Loads the handler on first use and pins it for the process lifetime.
    /// A failed load leaves the slot empty so the next invocation retries.
    fn handler(&mut self) -> Result<Arc<dyn Handler>, InvocationError> {
        if let Some(handler) = &self.handler {
            return Ok(handler.clone());
        }
        let handler =
            self.loader
                .load(&self.locator)
                .map_err(|error| InvocationError::HandlerLoad {
                    locator: self.locator.clone(),
                    error,
                })?;
        self.handler = Some(handler.clone());
        Ok(handler)
    }
}

/// The control plane wraps the envelope JSON in an outer event object whose
/// `body` field is the envelope serialized as a string.
fn parse_event(payload: &str) -> Result<InvocationEnvelope, InvocationError> {
    #[derive(Deserialize)]
    struct Event {
        body: String,
    }
    let event: Event = serde_json::from_str(payload).map_err(InvocationError::Payload)?;
    serde_json::from_str(&event.body).map_err(InvocationError::Payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parse_event_unwraps_the_nested_envelope() {
        let payload = serde_json::json!({
            "body": r#"{"method":"GET","path":"/x","headers":{},"body":""}"#
        })
        .to_string();
        let envelope = parse_event(&payload).expect("parse");
        assert_eq!(envelope.method, "GET");
        assert_eq!(envelope.path, "/x");
    }

    #[test]
    fn unit_parse_event_reports_malformed_payloads() {
        let error = parse_event("not json").expect_err("must fail");
        assert_eq!(error.error_type(), "PayloadError");
        let error = parse_event(r#"{"body":"not an envelope"}"#).expect_err("must fail");
        assert_eq!(error.error_type(), "PayloadError");
    }

    #[test]
    fn unit_error_envelope_carries_type_message_and_cause_chain() {
        let error = InvocationError::Handler(
            anyhow::anyhow!("connection reset").context("upstream fetch failed"),
        );
        let envelope = error.to_error_envelope();
        assert_eq!(envelope.error_type, "HandlerError");
        assert_eq!(envelope.error_message, "handler failed: upstream fetch failed");
        assert_eq!(envelope.stack_trace, vec!["connection reset".to_string()]);
    }

    #[test]
    fn unit_translate_errors_keep_their_classification() {
        let error = InvocationError::from(TranslateError::MissingForwardedHost);
        assert_eq!(error.error_type(), "TranslateError");
        let envelope = error.to_error_envelope();
        assert!(envelope.error_message.contains("x-forwarded-host"));
    }
}
