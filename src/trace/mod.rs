//! Syscall tracer integration.
//!
//! The tracer is an external process printing one line per observed syscall.
//! This module spawns it and turns its output into [`TraceEvent`]s.
mod event;
pub mod parser;
mod tracer;

use std::path::PathBuf;

pub use event::{LiveEvent, TIMESTAMP_FORMAT, TraceEvent};
pub use parser::{ParseError, ParsedLine, parse_line};
pub use tracer::{ExitWatcher, RunningTracer, TracerCommand};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn tracer `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tracer stdout was not captured")]
    MissingStdout,
    #[error("failed to wait for tracer: {0}")]
    Wait(#[source] std::io::Error),
    #[error("tracer exited: {0}")]
    Exited(String),
}

pub type Result<T> = std::result::Result<T, Error>;
