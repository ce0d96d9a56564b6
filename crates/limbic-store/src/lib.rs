pub mod affect_state;
pub mod error;
pub mod fallback;
pub mod paths;
pub mod retry;
pub mod schema;
pub mod store;
pub mod writer;

pub use affect_state::{AffectState, AffectStateStore, AffectUpdate, SHARED_SCOPE, scope_for};
pub use error::{ErrorClass, Result, StoreError};
pub use fallback::{FallbackEntry, FallbackLog};
pub use paths::{DataLayout, default_base_dir, load_config, parse_config};
pub use retry::{RetryPolicy, retry_blocking};
pub use store::{HealthReport, MemoryStore};
pub use writer::WriteQueue;
