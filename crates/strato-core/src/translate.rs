//! Pure translation between control-plane envelopes and HTTP objects.
//!
//! `from_envelope` rebuilds a standard request from the JSON the control
//! plane delivered; `to_envelope` folds a handler's response back into the
//! wire shape. Both are pure; failures here are recoverable per-invocation.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response};
use thiserror::Error;

use crate::envelope::{HeaderValues, InvocationEnvelope, ResponseEnvelope, BODY_ENCODING};

const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Failure rebuilding a request or decoding its body.
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("invocation is missing the {FORWARDED_HOST_HEADER} header")]
    MissingForwardedHost,
    #[error("invalid request URL '{url}'")]
    InvalidUrl {
        url: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("invalid request method '{method}'")]
    InvalidMethod {
        method: String,
        #[source]
        source: http::method::InvalidMethod,
    },
    #[error("invalid header name '{name}'")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid value for header '{name}'")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("invocation body is not valid base64")]
    InvalidBodyEncoding(#[from] base64::DecodeError),
    #[error("failed to assemble request")]
    Request(#[from] http::Error),
}

/// Decodes an envelope body. An empty string means no body, not an error.
pub fn decode_body(body: &str) -> Result<Vec<u8>, TranslateError> {
    if body.is_empty() {
        return Ok(Vec::new());
    }
    Ok(BASE64_STANDARD.decode(body)?)
}

/// Rebuilds the inbound HTTP request, decoding the envelope body.
pub fn from_envelope(envelope: &InvocationEnvelope) -> Result<Request<Vec<u8>>, TranslateError> {
    let body = decode_body(&envelope.body)?;
    build_request(envelope, body)
}

/// Rebuilds the inbound HTTP request with an empty body. Used on the
/// streaming path, where the envelope body slot carries the directive
/// rather than request payload.
pub fn from_envelope_without_body(
    envelope: &InvocationEnvelope,
) -> Result<Request<Vec<u8>>, TranslateError> {
    build_request(envelope, Vec::new())
}

fn build_request(
    envelope: &InvocationEnvelope,
    body: Vec<u8>,
) -> Result<Request<Vec<u8>>, TranslateError> {
    let method = http::Method::from_bytes(envelope.method.as_bytes()).map_err(|source| {
        TranslateError::InvalidMethod {
            method: envelope.method.clone(),
            source,
        }
    })?;

    let proto = envelope_header(envelope, FORWARDED_PROTO_HEADER).unwrap_or("https");
    let host =
        envelope_header(envelope, FORWARDED_HOST_HEADER).ok_or(TranslateError::MissingForwardedHost)?;
    let url = format!("{proto}://{host}{}", envelope.path);
    let uri = url
        .parse::<http::Uri>()
        .map_err(|source| TranslateError::InvalidUrl { url, source })?;

    let mut request = Request::builder().method(method).uri(uri).body(body)?;
    let headers = request.headers_mut();
    for (name, value) in &envelope.headers {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|source| {
            TranslateError::InvalidHeaderName {
                name: name.clone(),
                source,
            }
        })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|source| TranslateError::InvalidHeaderValue {
                name: name.clone(),
                source,
            })?;
        headers.append(header_name, header_value);
    }
    Ok(request)
}

/// Folds a handler response into the wire envelope. Total over any response:
/// status verbatim, headers multi-valued in emission order, body always
/// base64 (empty string for an empty body).
pub fn to_envelope(response: &Response<Vec<u8>>) -> ResponseEnvelope {
    let mut headers = std::collections::BTreeMap::new();
    for name in response.headers().keys() {
        let values: Vec<String> = response
            .headers()
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        headers.insert(name.as_str().to_string(), HeaderValues::from_values(values));
    }
    ResponseEnvelope {
        status_code: response.status().as_u16(),
        headers,
        encoding: BODY_ENCODING.to_string(),
        body: BASE64_STANDARD.encode(response.body()),
    }
}

fn envelope_header<'a>(envelope: &'a InvocationEnvelope, name: &str) -> Option<&'a str> {
    envelope
        .headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
