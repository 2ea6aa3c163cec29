//! Runtime adapter between a polling control plane and user HTTP handlers.
//!
//! The control-plane client fetches invocations and posts results, the
//! handler module loads and dispatches user code, the relay ships streamed
//! response bodies over a raw side channel, and the invocation loop ties
//! them together as an unbounded serial loop.

pub mod config;
pub mod control_plane;
pub mod handler;
pub mod invocation_loop;
pub mod relay;

pub use config::RuntimeConfig;
pub use control_plane::{ControlPlaneClient, FatalError, InvocationContext, PendingInvocation};
pub use handler::{
    BufferedHandler, Handler, HandlerLoader, HandlerRegistry, NativeHandler, ResponseSink,
};
pub use invocation_loop::{InvocationError, Runtime};
pub use relay::{relay_response, RelayError, StreamCipher};
