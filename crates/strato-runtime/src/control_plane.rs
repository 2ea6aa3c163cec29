//! Blocking client for the three control-plane operations.
//!
//! Every failure here is fatal: an unexpected status or a missing
//! invocation-id header means the control plane itself is broken and there
//! is no reliable channel left to report against a specific invocation.

use reqwest::blocking::Client;
use thiserror::Error;

use strato_core::{ErrorEnvelope, ResponseEnvelope};

const RUNTIME_API_VERSION: &str = "2018-06-01/runtime";
const INVOCATION_ID_HEADER: &str = "lambda-runtime-aws-request-id";
const TRACE_ID_HEADER: &str = "lambda-runtime-trace-id";
const DEADLINE_MS_HEADER: &str = "lambda-runtime-deadline-ms";
const FUNCTION_ARN_HEADER: &str = "lambda-runtime-invoked-function-arn";
const UNHANDLED_ERROR_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

/// Unrecoverable control-plane failure; the process must terminate.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("unexpected status {status} from control-plane {operation}")]
    UnexpectedStatus { operation: &'static str, status: u16 },
    #[error("control-plane invocation is missing the {INVOCATION_ID_HEADER} header")]
    MissingInvocationId,
    #[error("control-plane transport failure during {operation}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

/// Per-invocation correlation data extracted from the control-plane
/// response headers. Scoped to one loop iteration; replaces the ambient
/// trace environment variable, so a stale trace id cannot leak into the
/// next invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationContext {
    pub invocation_id: String,
    pub trace_id: Option<String>,
    pub deadline_ms: Option<u64>,
    pub function_arn: Option<String>,
}

/// One fetched invocation: the raw event payload plus its context. Parsing
/// the inner envelope is deferred to the loop because a malformed envelope
/// is a recoverable, reportable failure.
#[derive(Debug, Clone)]
pub struct PendingInvocation {
    pub payload: String,
    pub context: InvocationContext,
}

pub struct ControlPlaneClient {
    http: Client,
    base_url: String,
}

impl ControlPlaneClient {
    pub fn new(runtime_api: &str) -> Result<Self, FatalError> {
        let http = Client::builder()
            .build()
            .map_err(|source| FatalError::Transport {
                operation: "client initialization",
                source,
            })?;
        Ok(Self {
            http,
            base_url: format!("http://{runtime_api}/{RUNTIME_API_VERSION}"),
        })
    }

    /// Blocks until the control plane hands out the next invocation.
    pub fn next_invocation(&self) -> Result<PendingInvocation, FatalError> {
        let operation = "next invocation";
        let response = self
            .http
            .get(format!("{}/invocation/next", self.base_url))
            .send()
            .map_err(|source| FatalError::Transport { operation, source })?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(FatalError::UnexpectedStatus { operation, status });
        }

        let headers = response.headers().clone();
        let payload = response
            .text()
            .map_err(|source| FatalError::Transport { operation, source })?;

        let invocation_id =
            header_value(&headers, INVOCATION_ID_HEADER).ok_or(FatalError::MissingInvocationId)?;
        let context = InvocationContext {
            invocation_id,
            trace_id: header_value(&headers, TRACE_ID_HEADER),
            deadline_ms: header_value(&headers, DEADLINE_MS_HEADER)
                .and_then(|value| value.parse().ok()),
            function_arn: header_value(&headers, FUNCTION_ARN_HEADER),
        };
        Ok(PendingInvocation { payload, context })
    }

    /// Posts the completed response envelope for one invocation.
    pub fn post_response(
        &self,
        invocation_id: &str,
        envelope: &ResponseEnvelope,
    ) -> Result<(), FatalError> {
        let operation = "post response";
        let response = self
            .http
            .post(format!(
                "{}/invocation/{invocation_id}/response",
                self.base_url
            ))
            .json(envelope)
            .send()
            .map_err(|source| FatalError::Transport { operation, source })?;
        expect_accepted(operation, response.status().as_u16())
    }

    /// Posts an unhandled-error report for one invocation.
    pub fn post_error(
        &self,
        invocation_id: &str,
        envelope: &ErrorEnvelope,
    ) -> Result<(), FatalError> {
        let operation = "post error";
        let response = self
            .http
            .post(format!("{}/invocation/{invocation_id}/error", self.base_url))
            .header(UNHANDLED_ERROR_HEADER, "Unhandled")
            .json(envelope)
            .send()
            .map_err(|source| FatalError::Transport { operation, source })?;
        expect_accepted(operation, response.status().as_u16())
    }
}

fn expect_accepted(operation: &'static str, status: u16) -> Result<(), FatalError> {
    if status == 202 {
        Ok(())
    } else {
        Err(FatalError::UnexpectedStatus { operation, status })
    }
}

fn header_value(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread::{self, JoinHandle};

    use super::*;

    /// A captured HTTP request: request line, lowercased headers, body.
    struct CapturedRequest {
        request_line: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        }
    }

    fn read_request(stream: &mut TcpStream) -> CapturedRequest {
        let mut reader = BufReader::new(stream);
        let mut request_line = String::new();
        reader.read_line(&mut request_line).expect("request line");
        let mut headers = Vec::new();
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).expect("header line");
            let line = line.trim_end().to_string();
            if line.is_empty() {
                break;
            }
            let (name, value) = line.split_once(':').expect("header separator");
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_length = value.parse().expect("content length");
            }
            headers.push((name, value));
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).expect("body");
        CapturedRequest {
            request_line: request_line.trim_end().to_string(),
            headers,
            body: String::from_utf8(body).expect("utf8 body"),
        }
    }

    /// Serves exactly one HTTP exchange and hands back the captured request.
    fn serve_once(response: String) -> (SocketAddr, JoinHandle<CapturedRequest>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let captured = read_request(&mut stream);
            stream.write_all(response.as_bytes()).expect("write");
            captured
        });
        (addr, handle)
    }

    fn http_response(status_line: &str, extra_headers: &[(&str, &str)], body: &str) -> String {
        let mut response = format!("HTTP/1.1 {status_line}\r\n");
        for (name, value) in extra_headers {
            response.push_str(&format!("{name}: {value}\r\n"));
        }
        response.push_str(&format!(
            "content-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        ));
        response
    }

    #[test]
    fn functional_next_invocation_extracts_context_and_payload() {
        let (addr, handle) = serve_once(http_response(
            "200 OK",
            &[
                ("lambda-runtime-aws-request-id", "inv-1"),
                ("lambda-runtime-trace-id", "trace-1"),
                ("lambda-runtime-deadline-ms", "1700000000000"),
                ("lambda-runtime-invoked-function-arn", "arn:test:fn"),
            ],
            r#"{"body":"{}"}"#,
        ));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        let pending = client.next_invocation().expect("next invocation");
        assert_eq!(pending.context.invocation_id, "inv-1");
        assert_eq!(pending.context.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(pending.context.deadline_ms, Some(1_700_000_000_000));
        assert_eq!(pending.context.function_arn.as_deref(), Some("arn:test:fn"));
        assert_eq!(pending.payload, r#"{"body":"{}"}"#);
        let captured = handle.join().expect("server");
        assert_eq!(
            captured.request_line,
            "GET /2018-06-01/runtime/invocation/next HTTP/1.1"
        );
    }

    #[test]
    fn regression_next_invocation_with_unexpected_status_is_fatal() {
        let (addr, handle) = serve_once(http_response("500 Internal Server Error", &[], ""));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        let error = client.next_invocation().expect_err("must be fatal");
        assert!(matches!(
            error,
            FatalError::UnexpectedStatus {
                operation: "next invocation",
                status: 500
            }
        ));
        handle.join().expect("server");
    }

    #[test]
    fn regression_next_invocation_without_invocation_id_is_fatal() {
        let (addr, handle) = serve_once(http_response("200 OK", &[], r#"{"body":"{}"}"#));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        let error = client.next_invocation().expect_err("must be fatal");
        assert!(matches!(error, FatalError::MissingInvocationId));
        handle.join().expect("server");
    }

    #[test]
    fn functional_post_response_targets_invocation_path() {
        let (addr, handle) = serve_once(http_response("202 Accepted", &[], ""));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        client
            .post_response("inv-9", &ResponseEnvelope::empty())
            .expect("post response");
        let captured = handle.join().expect("server");
        assert_eq!(
            captured.request_line,
            "POST /2018-06-01/runtime/invocation/inv-9/response HTTP/1.1"
        );
        assert!(captured.body.contains("\"statusCode\":200"));
    }

    #[test]
    fn functional_post_error_flags_unhandled_errors() {
        let (addr, handle) = serve_once(http_response("202 Accepted", &[], ""));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        let envelope = ErrorEnvelope::new("HandlerError", "boom", vec![]);
        client.post_error("inv-9", &envelope).expect("post error");
        let captured = handle.join().expect("server");
        assert_eq!(
            captured.request_line,
            "POST /2018-06-01/runtime/invocation/inv-9/error HTTP/1.1"
        );
        assert_eq!(
            captured.header("lambda-runtime-function-error-type"),
            Some("Unhandled")
        );
        assert!(captured.body.contains("\"errorType\":\"HandlerError\""));
    }

    #[test]
    fn regression_post_response_rejection_is_fatal() {
        let (addr, handle) = serve_once(http_response("403 Forbidden", &[], ""));
        let client = ControlPlaneClient::new(&addr.to_string()).expect("client");
        let error = client
            .post_response("inv-9", &ResponseEnvelope::empty())
            .expect_err("must be fatal");
        assert!(matches!(
            error,
            FatalError::UnexpectedStatus {
                operation: "post response",
                status: 403
            }
        ));
        handle.join().expect("server");
    }
}
