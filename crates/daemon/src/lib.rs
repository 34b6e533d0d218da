//! Squeeze daemon
//!
//! Background service that indexes a video library, re-encodes selected
//! files on the GPU and replaces originals only after validation.

pub mod bus;
pub mod catalog;
pub mod daemon;
pub mod encode;
pub mod hardware;
pub mod inbox;
pub mod indexer;
pub mod layout;
pub mod lifecycle;
pub mod power;
pub mod probe;
pub mod report;
pub mod scheduler;
pub mod server;
pub mod stability;
pub mod startup;
pub mod validate;
pub mod watch;

pub use squeeze_config as config;
pub use squeeze_config::Config;

pub use bus::{CancelHandle, JobOutcome, Phase, Progress, StatusBus, StatusSnapshot};
pub use catalog::{Catalog, CatalogError, SqliteCatalog, Status, VideoRecord};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, EncodeJob, FfmpegTranscoder, Transcoder};
pub use indexer::{IndexRules, Indexer, IndexerError};
pub use layout::WorkLayout;
pub use scheduler::{ActionError, JobContext, Scheduler, SchedulerSettings, Tick};
pub use server::{create_router, run_server, AppState, ServerError};
pub use startup::{run_startup_checks, StartupError};
pub use validate::{Tolerances, Validator, Verdict};
