// ABOUTME: Library root for database-tailer
// ABOUTME: Incremental table polling with durable per-table checkpoints

pub mod catalog;
pub mod config;
pub mod cursor;
pub mod db;
pub mod engine;
pub mod error;
pub mod poller;
pub mod position;
pub mod query;
pub mod record;
pub mod registry;
pub mod table;
pub mod utils;

pub use config::TailerConfig;
pub use engine::{Batch, TableCursor};
pub use error::TailError;
pub use poller::{PollStats, Poller};
pub use record::{ChannelSink, JsonLinesSink, Record, RecordSink};
pub use registry::TableRegistry;
