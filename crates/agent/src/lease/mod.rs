//! Lease execution: handlers, the payload-type registry and built-in lease kinds.

mod exec_block;
mod handler;
mod registry;

pub use exec_block::{ExecBlockExecutor, ExecBlockFactory};
pub use handler::{LeaseContext, LeaseExecutor, LeaseHandler};
pub use registry::{HandlerRegistry, LeaseHandlerFactory, UnsupportedLeaseExecutor};
