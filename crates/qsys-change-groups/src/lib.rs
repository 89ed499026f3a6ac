//! # Q-SYS Change Groups
//!
//! Change monitoring for the controls of a Q-SYS-style core.
//!
//! A change group is a named set of controls polled together. Each poll
//! diffs the current values against the group's last snapshot and reports
//! only what changed. Groups can poll themselves on a timer, and every
//! change lands in a bounded per-group event history that can be queried
//! later.
//!
//! ## Components
//!
//! - [`ChangeGroupRegistry`]: groups, members, snapshots and polling
//! - [`ChangeDetector`]: diff of readings against a snapshot
//! - [`AutoPollScheduler`]: one cancellable timer per group, auto-disabled
//!   after repeated failures
//! - [`EventCache`]: bounded event buffers with age, count and priority
//!   eviction, plus filtered and aggregated queries
//! - [`ChangeGroupManager`]: all of the above behind one facade
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use qsys_change_groups::{ChangeGroupConfig, ChangeGroupManager, EventQuery};
//!
//! let manager = ChangeGroupManager::new(gateway, ChangeGroupConfig::default())?;
//! manager.create_group("lobby")?;
//! manager
//!     .add_controls("lobby", &["Mixer.gain".into(), "Mixer.mute".into()])
//!     .await?;
//!
//! // First poll reports every member
//! let outcome = manager.poll("lobby", false).await?;
//!
//! // Poll twice a second from now on
//! manager.enable_auto_poll("lobby", 0.5)?;
//!
//! let history = manager.query_events(&EventQuery::builder().group("lobby").build()?)?;
//! ```

pub mod cache;
pub mod config;
pub mod detector;
pub mod error;
pub mod group;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use cache::{
    Aggregation, CacheStats, CachedEvent, EventCache, EventQuery, EventQueryBuilder,
    EventRecord, EventSummary, EvictionReport, FilterOperator, GroupCacheStats, QueryResult,
    RecordReport, ValueFilter,
};
pub use config::{BufferConfig, CacheConfig, CachePriority, ChangeGroupConfig};
pub use detector::{ChangeDetector, Snapshot, SnapshotEntry};
pub use error::{CacheError, ChangeGroupError, ChangeGroupResult, ConfigError, ErrorCode};
pub use group::ChangeGroup;
pub use manager::{ChangeGroupManager, Describe, ErrorReport, OperationReport};
pub use registry::ChangeGroupRegistry;
pub use scheduler::{AutoPollScheduler, AutoPollState, AutoPollStatus};
pub use types::*;
