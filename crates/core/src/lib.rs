#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared wire and data model for the fleet agent and its server.

pub mod api;
pub mod bytes;
pub mod exec;
pub mod ids;
pub mod model;

mod util;

pub use ids::{AgentId, LeaseId, SessionId};
pub use model::{
    AgentStatus, Lease, LeaseOutcome, LeaseReport, LeaseResult, LeaseState, LeaseTransitionError,
    SessionOutcome, SessionReason, SessionResult,
};
pub use util::{new_ulid, now_ms};
