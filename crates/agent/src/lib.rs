#![forbid(unsafe_code)]

//! Fleet worker agent: holds a session with the server, runs the leases it
//! hands out, and reports their results.

pub mod config;
pub mod error;
pub mod http;
pub mod lease;
pub mod manager;
pub mod retry;
pub mod rpc;
pub mod session;
pub mod status;
pub mod telemetry;
pub mod termination;

pub use config::{AgentConfig, LeaseManagerConfig};
pub use error::{AgentError, Result};
pub use http::HttpServerConnection;
pub use lease::{HandlerRegistry, LeaseContext, LeaseExecutor, LeaseHandler, LeaseHandlerFactory};
pub use manager::LeaseManager;
pub use rpc::{ServerConnection, UpdateStream};
pub use session::Session;
pub use status::{StatusSink, StatusSnapshot};
