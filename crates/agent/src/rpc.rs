//! Transport-agnostic view of the server.

use async_trait::async_trait;
use fleet_core::api::{SystemMetrics, UpdateRequest, UpdateResponse};
use fleet_core::{AgentId, SessionId};

use crate::error::Result;

/// Connection to the fleet server.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Opens a duplex update stream for one long-poll round.
    async fn open_update_stream(&self, session_id: &SessionId) -> Result<Box<dyn UpdateStream>>;

    /// One-way telemetry upload.
    async fn upload_telemetry(&self, agent_id: &AgentId, metrics: SystemMetrics) -> Result<()>;
}

/// One long-poll exchange with the server.
///
/// The server holds its response until it has something new to say or the
/// send side is closed.
#[async_trait]
pub trait UpdateStream: Send {
    async fn send(&mut self, request: UpdateRequest) -> Result<()>;

    /// Next response, or `None` once the server has finished the exchange.
    ///
    /// Must be cancel-safe: dropping the future loses no response.
    async fn recv(&mut self) -> Result<Option<UpdateResponse>>;

    /// Closes the send side. The server may still deliver a final response.
    async fn close_send(&mut self) -> Result<()>;
}
