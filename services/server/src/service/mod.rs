// Long-running pieces of the propagation pipeline plus the write path.
pub mod feature;
pub mod ingestor;
pub mod outbox;
pub mod reconciler;

pub use feature::{FeatureError, FeatureService, HealthReport};
pub use ingestor::{run_supervised, Ingestor};
pub use outbox::OutboxWorker;
pub use reconciler::Reconciler;
