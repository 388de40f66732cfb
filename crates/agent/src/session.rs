use std::path::{Path, PathBuf};
use std::sync::Arc;

use fleet_core::{AgentId, SessionId};

use crate::rpc::ServerConnection;

/// Identity and context for talking to the server. Owned by the host.
#[derive(Clone)]
pub struct Session {
    agent_id: AgentId,
    session_id: SessionId,
    working_dir: PathBuf,
    connection: Arc<dyn ServerConnection>,
}

impl Session {
    pub fn new(
        agent_id: AgentId,
        session_id: SessionId,
        working_dir: PathBuf,
        connection: Arc<dyn ServerConnection>,
    ) -> Self {
        Self {
            agent_id,
            session_id,
            working_dir,
            connection,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn connection(&self) -> &Arc<dyn ServerConnection> {
        &self.connection
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("agent_id", &self.agent_id)
            .field("session_id", &self.session_id)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}
