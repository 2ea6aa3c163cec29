//! Process-start configuration for the runtime adapter.
//!
//! All three variables are read exactly once at startup and never mutated.
//! Which of them are present decides the process mode: a handler locator
//! selects serve mode, its absence selects build-time priming mode.

/// Control-plane base address, e.g. `127.0.0.1:9001`.
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
/// Locator of the user handler to serve.
pub const HANDLER_ENV: &str = "_HANDLER";
/// Locator primed in build-time mode when no handler is configured.
pub const ENTRYPOINT_ENV: &str = "ENTRYPOINT";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub runtime_api: Option<String>,
    pub handler_locator: Option<String>,
    pub entrypoint: Option<String>,
}

impl RuntimeConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Self {
            runtime_api: non_empty(RUNTIME_API_ENV),
            handler_locator: non_empty(HANDLER_ENV),
            entrypoint: non_empty(ENTRYPOINT_ENV),
        }
    }

    /// True when the process should serve invocations rather than prime the
    /// entrypoint and exit.
    pub fn is_serve_mode(&self) -> bool {
        self.handler_locator.is_some()
    }
}
