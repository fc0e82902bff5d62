//! Time-bucketed cache of tracer events with live per-container fan-out.
//!
//! Every structured line read from the tracer is stored in a fixed ring of
//! one-second buckets (see [`Ring`]) and forwarded to the live subscriber of
//! its container, if one is registered. Overflow notices are not stored; they
//! are broadcast to every live subscriber.
//!
//! The ring and the subscriber registry are guarded by two independent locks,
//! and neither is held while the other is taken.
mod registry;
mod ring;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use chrono::NaiveDateTime;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::container::ContainerID;
use crate::trace::{ParsedLine, TraceEvent, parser};

pub use registry::{Subscription, SubscriptionHandle};
pub use ring::Placement;

use registry::Registry;
use ring::Ring;

#[derive(Debug)]
pub struct Accumulator {
    ring: Mutex<Ring>,
    subscribers: Registry,
    self_containers: RwLock<HashSet<ContainerID>>,
}

impl Accumulator {
    /// Creates an accumulator holding `cache_size` one-second buckets.
    pub fn new(cache_size: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(cache_size)),
            subscribers: Registry::default(),
            self_containers: RwLock::new(HashSet::new()),
        }
    }

    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a container of the monitor's own pod. Lines it emits are dropped
    /// on ingestion.
    pub fn add_self_container(&self, container_id: ContainerID) {
        let mut own = self
            .self_containers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !own.contains(&container_id) {
            log::info!("Excluding own container `{container_id}` from tracing");
            own.insert(container_id);
        }
    }

    pub fn is_self_container(&self, container_id: &ContainerID) -> bool {
        self.self_containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(container_id)
    }

    fn is_self_emitted(&self, line: &str) -> bool {
        self.self_containers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|own| parser::is_emitted_by(line, own.as_ref()))
    }

    /// Ingests a single tracer line. Malformed lines are logged and dropped.
    pub fn ingest(&self, line: &str) {
        if self.is_self_emitted(line) {
            return;
        }

        match parser::parse_line(line) {
            Ok(ParsedLine::Overflow) => {
                let reached = self.subscribers.broadcast_overflow();
                log::warn!("tracer dropped events, notified {reached} live subscribers");
            }
            Ok(ParsedLine::Event(event)) => self.accept(event),
            Err(err) => log::debug!("discarding trace line: {err}"),
        }
    }

    fn accept(&self, event: TraceEvent) {
        let placement = self.ring().insert(event.clone());
        match placement {
            Some(placement) => {
                log::trace!(
                    "stored event of container `{}` at {:?}",
                    event.container_id,
                    placement
                );
                self.subscribers.forward(&event);
            }
            None => log::warn!(
                "no cache slot available, dropping event of container `{}`",
                event.container_id
            ),
        }
    }

    /// Reads newline-delimited tracer output until EOF.
    ///
    /// Command lines of traced processes may carry arbitrary bytes, so
    /// invalid UTF-8 is replaced rather than rejected.
    ///
    /// # Errors
    ///
    /// Returns the I/O error that interrupted reading.
    pub async fn consume(&self, reader: impl AsyncRead + Unpin) -> std::io::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                self.ingest(line);
            }
        }
        log::debug!("tracer output reached EOF");
        Ok(())
    }

    /// All cached events of a container, concatenated in slot order.
    pub fn query_by_container(&self, container_id: &ContainerID) -> Vec<TraceEvent> {
        self.ring().events_of(container_id)
    }

    /// First-event timestamp of every bucket, `None` for empty buckets.
    pub fn bucket_starts(&self) -> Vec<Option<NaiveDateTime>> {
        self.ring().first_seen()
    }

    pub fn cache_size(&self) -> usize {
        self.ring().capacity()
    }

    /// Registers the live subscriber of a container.
    pub fn register(&self, container_id: ContainerID) -> Subscription {
        log::debug!("registering live subscriber for container `{container_id}`");
        self.subscribers.register(container_id)
    }

    pub fn unregister(&self, handle: &SubscriptionHandle) {
        if self.subscribers.unregister(handle) {
            log::debug!(
                "unregistered live subscriber for container `{}`",
                handle.container_id()
            );
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
