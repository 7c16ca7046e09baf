pub mod backup;
pub mod digest;
pub mod engine;
pub mod eviction;
pub mod notification;
pub mod paths;
pub mod persistence;
pub mod policy;
pub mod store;
pub mod watcher;

pub use digest::{ContentDigest, ContentHash, DigestAlgorithm};
pub use engine::{PushOutcome, SyncEngine};
pub use eviction::{EvictionPolicy, EvictionReport, MIN_ENTRIES};
pub use notification::{Notifier, SyncNotification};
pub use paths::normalize_path;
pub use persistence::{RestoreReport, StateFile};
pub use policy::{CheckMode, ProviderClass, ProviderRule, ProviderStrategy, ProviderTable};
pub use store::{CacheEntry, CacheStore, PathGuard, SyncPhase};
pub use watcher::{CacheWatcher, WatchEvent};
