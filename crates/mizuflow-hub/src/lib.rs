// Fan-out core for MizuFlow.
//
// The ingestor is the single writer for everything in this crate: it pushes
// watch events into the revision ring, applies them to the feature cache, and
// hands them to the hub for delivery. Stream handlers are the readers.
pub mod cache;
pub mod hub;
pub mod ring;

pub use cache::FeatureCache;
pub use hub::{Hub, HubConfig, StreamEvent, Subscription};
pub use ring::RevisionRing;
