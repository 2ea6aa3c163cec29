//! Streaming relay: ships a response body to a caller-supplied callback
//! address instead of through the control plane.
//!
//! Wire shape, in order: the stream id line, a minimal HTTP/1.1 request
//! frame carrying the response status and forwarded headers, then the body
//! as length-prefixed chunks fed through the directive's cipher. Chunk
//! lengths are decimal; both relay ends are the same bespoke
//! implementation, not a generic HTTP/1.1 peer.

use std::io::Write;
use std::net::TcpStream;

use aes::cipher::{generic_array::GenericArray, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use http::Response;
use thiserror::Error;
use url::Url;

use strato_core::StreamingDirective;

const RELAY_CHUNK_BYTES: usize = 16 * 1024;
const CIPHER_BLOCK_BYTES: usize = 16;
const CIPHER_KEY_BYTES: usize = 32;
const CIPHER_IV_BYTES: usize = 16;
const STATUS_CODE_HEADER: &str = "x-relay-status-code";
const FORWARDED_HEADER_PREFIX: &str = "x-relay-header-";
/// Hop-by-hop headers synthesized locally instead of forwarded.
const HOP_BY_HOP_HEADERS: [&str; 2] = ["connection", "transfer-encoding"];

type Aes256CbcEncryptor = cbc::Encryptor<Aes256>;

/// Relay failure; recoverable per-invocation.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid callout URL '{url}'")]
    InvalidCalloutUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("callout URL '{url}' has no usable host or port")]
    MissingCalloutAddress { url: String },
    #[error("unsupported cipher algorithm '{0}'")]
    UnsupportedCipherAlgorithm(String),
    #[error("cipher key is not valid base64")]
    InvalidKeyEncoding(#[source] base64::DecodeError),
    #[error("cipher IV is not valid base64")]
    InvalidIvEncoding(#[source] base64::DecodeError),
    #[error("cipher key must be {CIPHER_KEY_BYTES} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("cipher IV must be {CIPHER_IV_BYTES} bytes, got {0}")]
    InvalidIvLength(usize),
    #[error("relay connection failed")]
    Io(#[from] std::io::Error),
}

/// Incremental AES-256-CBC encryptor. `update` consumes whole cipher blocks
/// as they accumulate; `finish` applies PKCS#7 padding and emits the final
/// block, which exists even for an empty stream.
pub struct StreamCipher {
    encryptor: Aes256CbcEncryptor,
    pending: Vec<u8>,
}

impl StreamCipher {
    pub fn new(directive: &StreamingDirective) -> Result<Self, RelayError> {
        match directive.cipher_algorithm.as_str() {
            "aes-256-cbc" | "aes256" => {}
            other => return Err(RelayError::UnsupportedCipherAlgorithm(other.to_string())),
        }
        let key = BASE64_STANDARD
            .decode(&directive.cipher_key)
            .map_err(RelayError::InvalidKeyEncoding)?;
        if key.len() != CIPHER_KEY_BYTES {
            return Err(RelayError::InvalidKeyLength(key.len()));
        }
        let iv = BASE64_STANDARD
            .decode(&directive.cipher_iv)
            .map_err(RelayError::InvalidIvEncoding)?;
        if iv.len() != CIPHER_IV_BYTES {
            return Err(RelayError::InvalidIvLength(iv.len()));
        }
        let encryptor = Aes256CbcEncryptor::new_from_slices(&key, &iv)
            .map_err(|_| RelayError::InvalidKeyLength(key.len()))?;
        Ok(Self {
            encryptor,
            pending: Vec::new(),
        })
    }

    pub fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let whole = self.pending.len() - self.pending.len() % CIPHER_BLOCK_BYTES;
        let mut output: Vec<u8> = self.pending.drain(..whole).collect();
        for block in output.chunks_exact_mut(CIPHER_BLOCK_BYTES) {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output
    }

    pub fn finish(mut self) -> Vec<u8> {
        // pending always holds less than one block here
        let pad = CIPHER_BLOCK_BYTES - self.pending.len();
        let mut output = self.pending;
        output.resize(output.len() + pad, pad as u8);
        for block in output.chunks_exact_mut(CIPHER_BLOCK_BYTES) {
            self.encryptor
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output
    }
}

#[derive(Debug)]
struct CalloutAddress {
    host: String,
    port: u16,
    path: String,
}

fn callout_address(raw_url: &str) -> Result<CalloutAddress, RelayError> {
    let url = Url::parse(raw_url).map_err(|source| RelayError::InvalidCalloutUrl {
        url: raw_url.to_string(),
        source,
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| RelayError::MissingCalloutAddress {
            url: raw_url.to_string(),
        })?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| RelayError::MissingCalloutAddress {
            url: raw_url.to_string(),
        })?;
    let path = match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    };
    Ok(CalloutAddress { host, port, path })
}

/// Relays one response over the directive's side channel. The announce and
/// header frames are written even for an empty body, since the remote end
/// is stateful per-stream; an empty body then contributes only the cipher's
/// final padding block.
pub fn relay_response(
    directive: &StreamingDirective,
    response: &Response<Vec<u8>>,
) -> Result<(), RelayError> {
    let mut cipher = StreamCipher::new(directive)?;
    let address = callout_address(&directive.callout_url)?;
    let mut stream = TcpStream::connect((address.host.as_str(), address.port))?;
    tracing::debug!(
        stream_id = %directive.stream_id,
        host = %address.host,
        port = address.port,
        "relay connected"
    );

    stream.write_all(format!("{}\r\n", directive.stream_id).as_bytes())?;
    write_header_frame(&mut stream, &address, response)?;

    for chunk in response.body().chunks(RELAY_CHUNK_BYTES) {
        let mut framed = format!("{}\r\n", chunk.len()).into_bytes();
        framed.extend_from_slice(chunk);
        framed.extend_from_slice(b"\r\n");
        stream.write_all(&cipher.update(&framed))?;
    }
    stream.write_all(&cipher.finish())?;
    stream.flush()?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

fn write_header_frame(
    stream: &mut TcpStream,
    address: &CalloutAddress,
    response: &Response<Vec<u8>>,
) -> Result<(), RelayError> {
    let mut frame = format!("POST {} HTTP/1.1\r\n", address.path);
    frame.push_str(&format!("host: {}\r\n", address.host));
    frame.push_str(&format!(
        "{STATUS_CODE_HEADER}: {}\r\n",
        response.status().as_u16()
    ));
    for name in response.headers().keys() {
        if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        for value in response.headers().get_all(name) {
            frame.push_str(&format!(
                "{FORWARDED_HEADER_PREFIX}{}: {}\r\n",
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes())
            ));
        }
    }
    frame.push_str("connection: close\r\n");
    frame.push_str("transfer-encoding: chunked\r\n");
    frame.push_str("\r\n");
    stream.write_all(frame.as_bytes())?;
    Ok(())
}
