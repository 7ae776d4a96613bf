//! # Follow-up Automation Engine
//!
//! Runs per-recipient follow-up sequences: ordered, delayed steps that send
//! notifications to a recipient or to staff, backed by PostgreSQL.
//!
//! ## Features
//!
//! - **Stepped workflows**: each step waits its delay after the previous one ran
//! - **At-least-once safe**: optimistic versioning ensures a step advances once
//! - **Atomic step units**: state change, delivery and log entry commit together
//! - **Live definitions**: deactivated steps and workflows take effect on the next run
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FollowupService                           │
//! │  (start / restart, halt, audit reads, definition admin)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Dispatcher ──▶ DueScanner ──▶ StepExecutor          │
//! │  (scan loop, bounded consumer, one step per run)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │       FollowupStore  ·  Directory  ·  NotificationGateway    │
//! │  (PostgreSQL: followup_instances, execution log, steps)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use steward_followup::prelude::*;
//!
//! let store = Arc::new(InMemoryFollowupStore::new());
//! let directory = Arc::new(StaticDirectory::new());
//! let clock = Arc::new(SystemClock);
//! let executor = Arc::new(StepExecutor::new(
//!     store.clone(),
//!     directory.clone(),
//!     Arc::new(RecordingGateway::new()),
//!     clock.clone(),
//! ));
//! let service = FollowupService::new(store, directory, executor, clock);
//!
//! let workflow = WorkflowDefinition::new(tenant_id, "First-time visitors")
//!     .with_step(Step::new(1, Duration::ZERO, Channel::Email))
//!     .with_step(Step::new(2, Duration::from_secs(3 * 86400), Channel::Sms));
//! service.save_workflow(&workflow).await?;
//! service.start(tenant_id, recipient_id, workflow.id).await?;
//! ```

pub mod clock;
pub mod config;
pub mod definition;
pub mod engine;
pub mod instance;
pub mod notify;
pub mod persistence;
pub mod scanner;

/// Prelude for common imports
pub mod prelude {
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ConfigError, FollowupConfig};
    pub use crate::definition::{Channel, Step, WorkflowDefinition};
    pub use crate::engine::{
        ExecutorError, FollowupService, RunOutcome, ServiceError, StartOutcome, StepExecutor,
        StepPlanner,
    };
    pub use crate::instance::{
        ExecutionLogEntry, FollowupInstance, InstanceState, InstanceStatus, LogStatus,
    };
    pub use crate::notify::{
        Directory, HttpNotificationGateway, LogOnlyGateway, NotificationGateway, Recipient,
        RecordingGateway, StaticDirectory,
    };
    pub use crate::persistence::{
        FollowupStore, InMemoryFollowupStore, InstanceFilter, Pagination, PostgresDirectory,
        PostgresFollowupStore, StoreError,
    };
    pub use crate::scanner::{Dispatcher, DispatcherConfig, DueScanner};
    pub use std::sync::Arc;
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, FollowupConfig};
pub use definition::{Channel, ChannelKind, DefinitionError, Step, WorkflowDefinition};
pub use engine::{
    ExecutorError, FollowupService, RunOutcome, ServiceError, StartOutcome, StartResult,
    StepExecutor, StepPlanner, DEFAULT_STAFF_ROLE,
};
pub use instance::{
    ExecutionLogEntry, FollowupInstance, InstanceKey, InstanceState, InstanceStatus, LogStatus,
};
pub use notify::{
    DeliveryId, Directory, DirectoryError, DispatchRequest, GatewayError,
    HttpNotificationGateway, LogOnlyGateway, MessageTemplate, NotificationGateway, Recipient,
    RecordingGateway, StaticDirectory,
};
pub use persistence::{
    FollowupStore, InMemoryFollowupStore, InstanceFilter, Pagination, PostgresDirectory,
    PostgresFollowupStore, StepTransaction, StoreError, Upserted,
};
pub use scanner::{
    ChannelJobQueue, Dispatcher, DispatcherConfig, DispatcherError, DueScanner, JobQueue,
    QueueError, ScanError, ScannerConfig,
};
