//! Process entrypoint for the strato runtime adapter.
//!
//! With a handler configured the process serves invocations until the
//! control plane fails, then exits non-zero so the execution environment
//! recycles it. Without one it runs in build-time priming mode: resolve the
//! entrypoint once to force handler construction, then exit.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use strato_runtime::{ControlPlaneClient, HandlerLoader, HandlerRegistry, Runtime, RuntimeConfig};

mod handlers;

fn main() {
    init_tracing();
    let config = RuntimeConfig::from_env();
    std::process::exit(run(&config));
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn run(config: &RuntimeConfig) -> i32 {
    let registry = handlers::built_in_registry();
    match &config.handler_locator {
        Some(locator) => serve(config, registry, locator),
        None => prime(config, &registry),
    }
}

fn serve(config: &RuntimeConfig, registry: HandlerRegistry, locator: &str) -> i32 {
    let Some(runtime_api) = &config.runtime_api else {
        tracing::error!("AWS_LAMBDA_RUNTIME_API is not set");
        return 1;
    };
    let client = match ControlPlaneClient::new(runtime_api) {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(error = %error, "failed to initialize control-plane client");
            return 1;
        }
    };
    let mut runtime = Runtime::new(client, Box::new(registry), locator);
    tracing::info!(handler = locator, "serving invocations");
    match runtime.run() {
        Ok(never) => match never {},
        Err(fatal) => {
            tracing::error!(error = %fatal, "control-plane failure, terminating");
            1
        }
    }
}

/// Build-time priming: construct the entrypoint handler once so the build
/// packager can warm caches without ever entering the loop.
fn prime(config: &RuntimeConfig, registry: &HandlerRegistry) -> i32 {
    let Some(entrypoint) = &config.entrypoint else {
        tracing::error!("ENTRYPOINT is not set and no handler is configured");
        return 1;
    };
    match registry.load(entrypoint) {
        Ok(_) => {
            tracing::info!(entrypoint = entrypoint.as_str(), "entrypoint primed");
            0
        }
        Err(error) => {
            tracing::error!(error = %error, "failed to prime entrypoint");
            1
        }
    }
}
