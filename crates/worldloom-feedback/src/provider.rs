//! Collaborator traits: the only way the engine reaches the outside world

use worldloom_core::Entity;

/// Result type for generator calls
pub type GeneratorResult<T> = Result<T, GeneratorError>;

/// Generator error types
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("request failed: {0}")]
    RequestFailed(String),

    #[error("empty response")]
    EmptyResponse,

    #[error("timed out after {0}ms")]
    TimedOut(u64),
}

/// Produces critique text for a prompt.
///
/// Any model call an implementation makes on its own must be tagged with the
/// engine's internal call-type prefix if it is ledgered, so it is never
/// critiqued in turn.
#[async_trait::async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, call_type: Option<&str>) -> GeneratorResult<String>;
}

/// Read-only view of the world graph.
pub trait EntitySource: Send + Sync {
    fn list_entities(&self) -> Vec<Entity>;
}

/// Where final reports are shown to the user.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, message: &str);
}

/// Entity source for hosts without a world graph.
pub struct NoEntities;

impl EntitySource for NoEntities {
    fn list_entities(&self) -> Vec<Entity> {
        Vec::new()
    }
}

impl EntitySource for Vec<Entity> {
    fn list_entities(&self) -> Vec<Entity> {
        self.clone()
    }
}

/// Sink that drops reports (logged at info).
pub struct NullSink;

impl MessageSink for NullSink {
    fn deliver(&self, message: &str) {
        tracing::info!("Report dropped by NullSink ({} chars)", message.len());
    }
}
