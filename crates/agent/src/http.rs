//! HTTP/JSON transport.
//!
//! Each update round is one long-poll `POST`. The server answers when it has
//! something new to say; closing the send side abandons the request.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::api::{SystemMetrics, TelemetryRequest, UpdateRequest, UpdateResponse};
use fleet_core::{AgentId, SessionId};
use reqwest::StatusCode;
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};
use crate::rpc::{ServerConnection, UpdateStream};

#[derive(Debug, Clone)]
pub struct HttpServerConnection {
    client: reqwest::Client,
    base_url: String,
}

impl HttpServerConnection {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn update_url(&self, session_id: &SessionId) -> String {
        format!("{}/v1/agent/sessions/{}/update", self.base_url, session_id)
    }

    fn telemetry_url(&self) -> String {
        format!("{}/v1/agent/telemetry", self.base_url)
    }
}

#[async_trait]
impl ServerConnection for HttpServerConnection {
    async fn open_update_stream(&self, session_id: &SessionId) -> Result<Box<dyn UpdateStream>> {
        Ok(Box::new(HttpUpdateStream {
            client: self.client.clone(),
            url: self.update_url(session_id),
            in_flight: None,
            finished: false,
        }))
    }

    async fn upload_telemetry(&self, agent_id: &AgentId, metrics: SystemMetrics) -> Result<()> {
        self.client
            .post(self.telemetry_url())
            .json(&TelemetryRequest {
                agent_id: agent_id.clone(),
                metrics,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// One long-poll request. Carries at most one response.
struct HttpUpdateStream {
    client: reqwest::Client,
    url: String,
    in_flight: Option<JoinHandle<Result<Option<UpdateResponse>>>>,
    finished: bool,
}

async fn post_update(
    client: reqwest::Client,
    url: String,
    request: UpdateRequest,
) -> Result<Option<UpdateResponse>> {
    let resp = client.post(&url).json(&request).send().await?;
    if resp.status() == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    let resp = resp.error_for_status()?;
    Ok(Some(resp.json::<UpdateResponse>().await?))
}

#[async_trait]
impl UpdateStream for HttpUpdateStream {
    async fn send(&mut self, request: UpdateRequest) -> Result<()> {
        if self.in_flight.is_some() || self.finished {
            return Err(AgentError::Protocol(
                "update stream accepts a single request".into(),
            ));
        }
        let task = post_update(self.client.clone(), self.url.clone(), request);
        self.in_flight = Some(tokio::spawn(task));
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<UpdateResponse>> {
        let Some(handle) = self.in_flight.as_mut() else {
            return Ok(None);
        };
        // Awaiting the handle by reference keeps it alive if this future is dropped.
        let joined = handle.await;
        self.in_flight = None;
        self.finished = true;
        match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(None),
            Err(e) => Err(AgentError::Transport(format!("update request task failed: {e}"))),
        }
    }

    async fn close_send(&mut self) -> Result<()> {
        // HTTP/1 has no half-close; an unanswered long poll is simply abandoned.
        if let Some(handle) = &self.in_flight {
            if !handle.is_finished() {
                handle.abort();
                tracing::trace!(url = %self.url, "abandoned pending update request");
            }
        }
        Ok(())
    }
}

impl Drop for HttpUpdateStream {
    fn drop(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_ignore_trailing_slash() {
        let conn = HttpServerConnection::new("http://fleet:9000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            conn.update_url(&"s-1".into()),
            "http://fleet:9000/v1/agent/sessions/s-1/update"
        );
        assert_eq!(conn.telemetry_url(), "http://fleet:9000/v1/agent/telemetry");
    }

    #[tokio::test]
    async fn unreachable_server_is_retryable() {
        let conn = HttpServerConnection::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        let mut stream = conn.open_update_stream(&"s-1".into()).await.unwrap();
        stream
            .send(UpdateRequest {
                agent_id: "agent".into(),
                session_id: "s-1".into(),
                status: fleet_core::AgentStatus::Ok,
                leases: vec![],
                capabilities: None,
            })
            .await
            .unwrap();
        let err = stream.recv().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
        assert!(stream.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recv_without_send_ends_immediately() {
        let conn = HttpServerConnection::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let mut stream = conn.open_update_stream(&"s-1".into()).await.unwrap();
        stream.close_send().await.unwrap();
        assert!(stream.recv().await.unwrap().is_none());
    }
}
