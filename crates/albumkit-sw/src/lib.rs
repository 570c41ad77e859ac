//! # AlbumKit Offline Worker
//!
//! Offline resource cache and mutation replay for the photo-album client.
//!
//! ## Features
//!
//! - **Versioned caches**: one cache generation per deployed build, older
//!   generations purged on activation
//! - **Fetch policy**: passthrough, cache-first for media, network-first with
//!   application-shell fallback, replay-aware mutations
//! - **Replay queue**: mutations made offline are persisted and answered from
//!   their last known response
//! - **Control channel**: pages switch cache writes off under storage pressure
//!
//! ## Architecture
//!
//! ```text
//! OfflineWorker
//!     ├── LifecycleController ── install / activate / control messages
//!     │       └── VersionedCacheStore
//!     └── FetchPolicy ── dispatch → strategy
//!             ├── VersionedCacheStore ── DurableCache
//!             └── ReplayQueue ── DurableKeyValueStore
//!                     └── RequestCodec
//! ```
//!
//! Shared state lives in the durable stores, never in process memory, so
//! several worker instances over one store stay consistent.

pub mod cache;
pub mod clients;
pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod policy;
pub mod replay;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

pub use cache::{Cache, RequestKey, VersionedCacheStore};
pub use clients::{Client, Clients};
pub use codec::{CodecError, MutationMarker, RequestCodec, SerializedRequest, SerializedResponse};
pub use config::{default_store_path, WorkerConfig};
pub use context::{CacheGeneration, WorkerContext};
pub use error::{FetchError, ServiceWorkerError};
pub use lifecycle::{
    ActivateReport, ControlMessage, InstallReport, LifecycleController, ManifestAsset,
    StorageEstimate, UpdateCheck, VersionDescriptor,
};
pub use policy::{dispatch, FetchOutcome, FetchPolicy, Strategy};
pub use replay::{DrainReport, ReplayQueue, ReplayQueueEntry};
pub use worker::{EventOutcome, OfflineWorker, WorkerEvent, WorkerNotification, WorkerState};
