pub mod backlog;
pub mod config;
pub mod error;
pub mod exec;
pub mod gate;
pub mod generator;
pub mod io;
pub mod lock;
pub mod paths;
pub mod prd;
pub mod prompts;
pub mod queue;
pub mod runner;
pub mod sequencer;

pub use error::{PipelineError, Result};
