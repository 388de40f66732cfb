use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{Lease, LeaseResult};

use super::handler::{LeaseContext, LeaseExecutor, LeaseHandler};

/// Builds handlers for one payload type.
pub trait LeaseHandlerFactory: Send + Sync {
    /// Stable payload type identifier, e.g. `exec_block.v1`.
    fn payload_type(&self) -> &str;

    fn create_executor(&self, lease: &Lease) -> Arc<dyn LeaseExecutor>;

    /// Binds a new handler to `lease`. Does not start any work.
    fn create_handler(&self, lease: Lease) -> LeaseHandler {
        let executor = self.create_executor(&lease);
        LeaseHandler::new(lease, executor)
    }
}

/// Payload type -> factory.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    factories: HashMap<String, Arc<dyn LeaseHandlerFactory>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory, replacing any previous one for the same type.
    pub fn register(&mut self, factory: Arc<dyn LeaseHandlerFactory>) -> &mut Self {
        self.factories
            .insert(factory.payload_type().to_string(), factory);
        self
    }

    pub fn with(mut self, factory: Arc<dyn LeaseHandlerFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn payload_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Handler for `lease`. Unknown payload types get one that fails at once.
    pub fn create_handler(&self, lease: Lease) -> LeaseHandler {
        match self.factories.get(&lease.payload_type) {
            Some(factory) => factory.create_handler(lease),
            None => {
                tracing::warn!(
                    lease_id = %lease.id,
                    payload_type = %lease.payload_type,
                    "no handler registered for payload type"
                );
                let executor = Arc::new(UnsupportedLeaseExecutor::new(lease.payload_type.clone()));
                LeaseHandler::new(lease, executor)
            }
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("payload_types", &self.payload_types())
            .finish()
    }
}

/// Fallback for payload types this build does not know.
#[derive(Debug)]
pub struct UnsupportedLeaseExecutor {
    payload_type: String,
}

impl UnsupportedLeaseExecutor {
    pub fn new(payload_type: impl Into<String>) -> Self {
        Self {
            payload_type: payload_type.into(),
        }
    }
}

#[async_trait]
impl LeaseExecutor for UnsupportedLeaseExecutor {
    async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
        let message = format!("unsupported payload type '{}'", self.payload_type);
        Ok(LeaseResult::failed().with_output(message.into_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl LeaseExecutor for Noop {
        async fn execute(&self, _ctx: LeaseContext) -> anyhow::Result<LeaseResult> {
            Ok(LeaseResult::success())
        }
    }

    struct NoopFactory;

    impl LeaseHandlerFactory for NoopFactory {
        fn payload_type(&self) -> &str {
            "noop.v1"
        }

        fn create_executor(&self, _lease: &Lease) -> Arc<dyn LeaseExecutor> {
            Arc::new(Noop)
        }
    }

    #[test]
    fn lists_registered_types() {
        let registry = HandlerRegistry::new().with(Arc::new(NoopFactory));
        assert_eq!(registry.payload_types(), vec!["noop.v1"]);
    }

    #[test]
    fn creates_handler_without_starting() {
        let registry = HandlerRegistry::new().with(Arc::new(NoopFactory));
        let handler = registry.create_handler(Lease::new("a".into(), "noop.v1", vec![]));
        assert_eq!(handler.id().as_str(), "a");
        assert!(!handler.is_complete());
        let unknown = registry.create_handler(Lease::new("b".into(), "foo.v1", vec![]));
        assert!(!unknown.is_complete());
    }
}
