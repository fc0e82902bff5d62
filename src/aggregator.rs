//! Per-container aggregation of the live trace stream.
//!
//! An [`Aggregator`] registers a live subscription for one container, replays
//! what the cache already holds for it and then folds every new event into an
//! [`AggregationReport`] until it is stopped. Events already queued when the
//! stop arrives are still recorded. An overflow notice ends the
//! aggregation with [`Error::Overflow`], since the report can no longer be
//! trusted to be complete.
//!
//! An event ingested between the registration and the replay is seen twice;
//! its live copy is skipped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::accumulator::{Accumulator, Subscription};
use crate::container::ContainerID;
use crate::trace::{LiveEvent, TraceEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("tracer dropped events while aggregating container `{0}`")]
    Overflow(ContainerID),
    #[error("live stream of container `{0}` closed unexpectedly")]
    StreamClosed(ContainerID),
    #[error("aggregator task of container `{0}` failed: {1}")]
    Task(ContainerID, String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Everything observed for one container during its observation window.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct AggregationReport {
    /// Distinct syscall names.
    pub syscalls: BTreeSet<String>,
    /// Distinct files in use: executables and absolute paths passed on
    /// command lines.
    pub files: BTreeSet<String>,
    /// Number of events folded into the report, replayed ones included.
    pub events: usize,
}

impl AggregationReport {
    pub fn record(&mut self, event: &TraceEvent) {
        self.events += 1;
        if !event.syscall_type.is_empty() {
            self.syscalls.insert(event.syscall_type.clone());
        }
        if event.exe.starts_with('/') {
            self.files.insert(event.exe.clone());
        }
        for arg in event.cmd.split_whitespace() {
            if arg.starts_with('/') {
                self.files.insert(arg.to_owned());
            }
        }
    }

    pub fn syscall_list(&self) -> Vec<String> {
        self.syscalls.iter().cloned().collect()
    }
}

/// Handle of a running aggregation task.
#[derive(Debug)]
pub struct Aggregator {
    container_id: ContainerID,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<AggregationReport>>,
}

impl Aggregator {
    /// Subscribes to the container's live stream and starts aggregating.
    pub fn spawn(accumulator: Arc<Accumulator>, container_id: ContainerID) -> Self {
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(aggregate(accumulator, container_id.clone(), stop_rx));
        Self {
            container_id,
            stop: Some(stop),
            task,
        }
    }

    pub fn container_id(&self) -> &ContainerID {
        &self.container_id
    }

    /// Resolves when the aggregation ends without being stopped, which only
    /// happens on error.
    pub async fn finished(&mut self) -> Result<AggregationReport> {
        let container_id = self.container_id.clone();
        (&mut self.task)
            .await
            .map_err(|err| Error::Task(container_id, err.to_string()))?
    }

    /// Stops the aggregation and returns its report.
    pub async fn stop(mut self) -> Result<AggregationReport> {
        if let Some(stop) = self.stop.take() {
            // the task may already have ended on its own
            let _ = stop.send(());
        }
        self.finished().await
    }
}

/// Replayed events not yet matched by their live copy.
#[derive(Debug, Default)]
struct Replayed(HashMap<TraceEvent, usize>);

impl Replayed {
    fn insert(&mut self, event: TraceEvent) {
        *self.0.entry(event).or_default() += 1;
    }

    /// Consumes one replayed copy of the event, if any is left.
    fn take(&mut self, event: &TraceEvent) -> bool {
        let Some(count) = self.0.get_mut(event) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.0.remove(event);
        }
        true
    }
}

async fn aggregate(
    accumulator: Arc<Accumulator>,
    container_id: ContainerID,
    stop: oneshot::Receiver<()>,
) -> Result<AggregationReport> {
    let subscription = accumulator.register(container_id.clone());
    aggregate_subscribed(accumulator, container_id, subscription, stop).await
}

async fn aggregate_subscribed(
    accumulator: Arc<Accumulator>,
    container_id: ContainerID,
    mut subscription: Subscription,
    mut stop: oneshot::Receiver<()>,
) -> Result<AggregationReport> {
    let mut report = AggregationReport::default();
    let mut replayed = Replayed::default();
    for event in accumulator.query_by_container(&container_id) {
        report.record(&event);
        replayed.insert(event);
    }
    log::debug!(
        "replayed {} cached events of container `{}`",
        report.events,
        container_id
    );

    let mut record = |event: TraceEvent| {
        if !replayed.take(&event) {
            report.record(&event);
        }
    };
    let result = loop {
        tokio::select! {
            _ = &mut stop => {
                while let Some(pending) = subscription.try_recv() {
                    if let LiveEvent::Event(event) = pending {
                        record(event);
                    }
                }
                break Ok(());
            }
            event = subscription.recv() => match event {
                Some(LiveEvent::Event(event)) => record(event),
                Some(LiveEvent::Overflow) => break Err(Error::Overflow(container_id.clone())),
                None => break Err(Error::StreamClosed(container_id.clone())),
            },
        }
    };
    accumulator.unregister(subscription.handle());

    result.map(|()| report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(micros: u32, container: &str, syscall: &str, cmd: &str) -> String {
        format!(
            "2024-01-01T00:00:00.{micros:06}]::[{container}]::[file]::[1]::[2]::[{syscall}]::[/usr/bin/cat]::[{cmd}"
        )
    }

    fn id(raw: &str) -> ContainerID {
        ContainerID::new(raw).unwrap()
    }

    #[test]
    fn report_collects_syscalls_and_files() {
        let mut report = AggregationReport::default();
        let crate::trace::ParsedLine::Event(event) =
            crate::trace::parse_line(&line(0, "aaa", "openat", "cat -n /etc/hosts")).unwrap()
        else {
            panic!("expected event");
        };
        report.record(&event);
        report.record(&event);

        assert_eq!(report.events, 2);
        assert_eq!(report.syscall_list(), vec!["openat"]);
        assert_eq!(
            report.files.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["/etc/hosts", "/usr/bin/cat"]
        );
    }

    #[tokio::test]
    async fn stop_returns_replayed_and_live_events() {
        let accumulator = Arc::new(Accumulator::new(4));
        accumulator.ingest(&line(0, "aaa", "execve", "cat"));
        let aggregator = Aggregator::spawn(Arc::clone(&accumulator), id("aaa"));

        while accumulator.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        accumulator.ingest(&line(1, "aaa", "read", "cat"));
        accumulator.ingest(&line(2, "bbb", "write", "cat"));

        let report = aggregator.stop().await.unwrap();
        assert_eq!(report.syscall_list(), vec!["execve", "read"]);
        assert_eq!(accumulator.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn overflow_fails_the_aggregation() {
        let accumulator = Arc::new(Accumulator::new(4));
        let mut aggregator = Aggregator::spawn(Arc::clone(&accumulator), id("aaa"));

        while accumulator.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        accumulator.ingest("drop event occured");

        assert_eq!(
            aggregator.finished().await,
            Err(Error::Overflow(id("aaa")))
        );
        assert_eq!(accumulator.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn events_ingested_before_the_replay_are_counted_once() {
        let accumulator = Arc::new(Accumulator::new(4));
        let subscription = accumulator.register(id("aaa"));
        accumulator.ingest(&line(0, "aaa", "execve", "cat"));
        accumulator.ingest(&line(0, "aaa", "execve", "cat"));
        let (stop, stop_rx) = oneshot::channel();
        stop.send(()).unwrap();

        let report = aggregate_subscribed(Arc::clone(&accumulator), id("aaa"), subscription, stop_rx)
            .await
            .unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(accumulator.subscriber_count(), 0);
    }
}
