use chrono::NaiveDateTime;

use crate::container::ContainerID;

/// Format used by the tracer for event timestamps, without the optional zone suffix.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A single syscall observation emitted by the tracer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TraceEvent {
    pub timestamp: NaiveDateTime,
    pub container_id: ContainerID,
    pub syscall_category: String,
    pub ppid: u32,
    pub pid: u32,
    pub syscall_type: String,
    pub exe: String,
    pub cmd: String,
}

/// Message delivered to live subscribers of the accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Event(TraceEvent),
    /// The tracer reported that it dropped events.
    Overflow,
}
