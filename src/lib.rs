pub mod config;
pub mod core;
pub mod error;
pub mod execution;
pub mod log;
pub mod store;
pub mod terminal;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
pub use execution::{Coordinator, ExecuteOptions, ExecutionOutcome, ExecutionReport};
pub use store::ProjectStore;
