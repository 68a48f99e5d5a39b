//! Viewer-side stream consumption and generation state reconstruction.

pub mod active;
pub mod connection;
pub mod state;
pub mod transport;

pub use active::{ActiveGenerationGuard, ActiveGenerations};
pub use connection::{
    ConnectionPhase, ConsumerConfig, ConsumerSnapshot, EventStream, EventTransport, Sleeper,
    StreamConsumer, TokioSleeper,
};
pub use state::{FileState, GenerationState, GenerationStatus};
pub use transport::{DistributorTransport, SseDecoder, SseFrame, SseTransport};

use std::sync::Arc;

use crate::config::ServiceConfig;

/// Follow a project on the server described by `config` over SSE, with the
/// reconnect policy from its `[consumer]` section.
pub fn remote_consumer(
    config: &ServiceConfig,
    project_id: impl Into<String>,
    active: ActiveGenerations,
) -> StreamConsumer {
    let transport = Arc::new(SseTransport::new(config.server.callback_base()));
    StreamConsumer::new(project_id, transport, active).with_config(config.consumer_config())
}
