//! User handler loading and dispatch.
//!
//! A handler is registered under a locator and constructed lazily on first
//! use. Two calling conventions are supported behind the single [`Handler`]
//! seam: the native shape returns a full response, the legacy buffered
//! shape writes status, headers, and body into an in-memory sink and
//! signals completion by finishing it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Request, Response, StatusCode};

/// Dispatch seam shared by both calling conventions.
pub trait Handler: Send + Sync {
    fn invoke(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

impl std::fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Handler")
    }
}

/// Adapter for the native convention: the handler returns the response.
pub struct NativeHandler<F> {
    func: F,
}

impl<F> NativeHandler<F>
where
    F: Fn(Request<Vec<u8>>) -> Result<Response<Vec<u8>>> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Handler for NativeHandler<F>
where
    F: Fn(Request<Vec<u8>>) -> Result<Response<Vec<u8>>> + Send + Sync,
{
    fn invoke(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        (self.func)(request)
    }
}

/// In-memory buffered response sink for the legacy convention. The handler
/// writes into it and must call [`ResponseSink::end`] before returning.
pub struct ResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    done: bool,
}

impl ResponseSink {
    fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
            done: false,
        }
    }

    pub fn set_status(&mut self, status: u16) -> Result<()> {
        self.status =
            StatusCode::from_u16(status).map_err(|_| anyhow!("invalid status code {status}"))?;
        Ok(())
    }

    pub fn append_header(&mut self, name: &str, value: &str) -> Result<()> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid value for header '{name}'"))?;
        self.headers.append(header_name, header_value);
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    /// Marks the buffered response complete.
    pub fn end(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn into_response(self) -> Result<Response<Vec<u8>>> {
        if !self.done {
            bail!("buffered handler returned without finishing its response");
        }
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        Ok(response)
    }
}

/// Adapter for the legacy buffered convention.
pub struct BufferedHandler<F> {
    func: F,
}

impl<F> BufferedHandler<F>
where
    F: Fn(&Request<Vec<u8>>, &mut ResponseSink) -> Result<()> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> Handler for BufferedHandler<F>
where
    F: Fn(&Request<Vec<u8>>, &mut ResponseSink) -> Result<()> + Send + Sync,
{
    fn invoke(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let mut sink = ResponseSink::new();
        (self.func)(&request, &mut sink)?;
        sink.into_response()
    }
}

/// Resolves a locator to a handler instance.
pub trait HandlerLoader: Send + Sync {
    fn load(&self, locator: &str) -> Result<Arc<dyn Handler>>;
}

type HandlerConstructor = Box<dyn Fn() -> Result<Arc<dyn Handler>> + Send + Sync>;

enum RegistryEntry {
    Pending(HandlerConstructor),
    Loaded(Arc<dyn Handler>),
}

/// Linked-in handler registry: named constructors, each run at most once.
/// A failing constructor stays pending and is retried on the next load.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Mutex<BTreeMap<String, RegistryEntry>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, locator: impl Into<String>, constructor: F)
    where
        F: Fn() -> Result<Arc<dyn Handler>> + Send + Sync + 'static,
    {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                locator.into(),
                RegistryEntry::Pending(Box::new(constructor)),
            );
    }
}

impl HandlerLoader for HandlerRegistry {
    fn load(&self, locator: &str) -> Result<Arc<dyn Handler>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .get_mut(locator)
            .ok_or_else(|| anyhow!("no handler registered for locator '{locator}'"))?;
        match entry {
            RegistryEntry::Loaded(handler) => Ok(handler.clone()),
            RegistryEntry::Pending(constructor) => {
                let handler = constructor()?;
                *entry = RegistryEntry::Loaded(handler.clone());
                Ok(handler)
            }
        }
    }
}
