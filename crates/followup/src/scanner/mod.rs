//! Due scanning and the dispatcher runtime

mod dispatcher;
mod due;
mod queue;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherError};
pub use due::{DueScanner, ScanError, ScannerConfig};
pub use queue::{ChannelJobQueue, JobQueue, QueueError};
