//! Persistence layer
//!
//! - [`FollowupStore`] - definitions, instances and the execution log
//! - [`StepTransaction`] - one atomic step unit
//! - [`InMemoryFollowupStore`] - for tests and local runs
//! - [`PostgresFollowupStore`] / [`PostgresDirectory`] - production storage

mod memory;
mod postgres;
mod postgres_directory;
mod store;

pub use memory::InMemoryFollowupStore;
pub use postgres::PostgresFollowupStore;
pub use postgres_directory::PostgresDirectory;
pub use store::{
    FollowupStore, InstanceFilter, Pagination, StepTransaction, StoreError, Upserted,
};
