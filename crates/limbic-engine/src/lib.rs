//! Async orchestration for limbic.
//!
//! [`MemoryEngine`] owns the single-writer queue, a reader connection and the
//! affect store for one data directory, and exposes the host lifecycle as
//! [`MemoryHooks`]. Synchronous store calls run on the blocking pool under
//! the configured timeouts.

mod blocking;
pub mod capture;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod recall;

pub use capture::{CaptureOutcome, CapturePipeline};
pub use embedding::{EmbeddingProvider, HttpEmbeddingProvider, cosine};
pub use engine::{EngineHealth, MemoryEngine, ReplayReport};
pub use error::{EngineError, Result};
pub use hooks::MemoryHooks;
pub use metrics::{EngineMetrics, MetricsSnapshot, RecallResult};
pub use recall::{RecallEngine, RecallOptions, RecallOutcome, SearchResults};
