//! Integration tests for container tracking
//!
//! These tests drive discovery, the tracker registry and the per-container
//! tasks against an in-memory runtime instead of a Docker daemon.

use super::*;
use crate::models::{labels, LogRecord};
use futures::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// In-memory runtime with scripted containers, log lines and stats samples
#[derive(Default)]
pub(crate) struct MockRuntime {
    containers: Mutex<Vec<ContainerDescriptor>>,
    logs: Mutex<HashMap<String, Vec<String>>>,
    stats: Mutex<HashMap<String, Vec<RawStatsSample>>>,
    end_streams: bool,
    events: Mutex<Option<mpsc::UnboundedReceiver<RuntimeEvent>>>,
    log_requests: Mutex<Vec<(String, i64)>>,
    stats_gate: Mutex<Option<oneshot::Receiver<()>>>,
    host: Option<String>,
}

impl MockRuntime {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Close log and stats streams after the scripted items instead of
    /// keeping them open
    pub(crate) fn ending_streams(mut self) -> Self {
        self.end_streams = true;
        self
    }

    pub(crate) fn with_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub(crate) fn with_container(self, container: ContainerDescriptor) -> Self {
        self.containers.lock().unwrap().push(container);
        self
    }

    pub(crate) fn with_logs(self, container_id: &str, lines: &[&str]) -> Self {
        self.logs.lock().unwrap().insert(
            container_id.to_string(),
            lines.iter().map(|l| l.to_string()).collect(),
        );
        self
    }

    pub(crate) fn with_stats(self, container_id: &str, samples: Vec<RawStatsSample>) -> Self {
        self.stats
            .lock()
            .unwrap()
            .insert(container_id.to_string(), samples);
        self
    }

    /// Attach an event source and return its sender
    pub(crate) fn event_sender(&self) -> mpsc::UnboundedSender<RuntimeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(rx);
        tx
    }

    /// Keep the next stats stream open after its scripted samples until
    /// the returned sender fires or is dropped
    pub(crate) fn stats_gate(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.stats_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub(crate) fn set_containers(&self, containers: Vec<ContainerDescriptor>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub(crate) fn log_requests(&self) -> Vec<(String, i64)> {
        self.log_requests.lock().unwrap().clone()
    }

    fn finish<T: Send + 'static>(&self, items: Vec<T>) -> stream::BoxStream<'static, T> {
        let scripted = stream::iter(items);
        if self.end_streams {
            scripted.boxed()
        } else {
            scripted.chain(stream::pending()).boxed()
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_containers(&self) -> Result<Vec<ContainerDescriptor>, RuntimeError> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn logs(&self, container_id: &str, since: i64) -> Result<LogStream, RuntimeError> {
        self.log_requests
            .lock()
            .unwrap()
            .push((container_id.to_string(), since));
        let lines = self
            .logs
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default();
        Ok(self.finish(lines.into_iter().map(Ok).collect()))
    }

    async fn stats(&self, container_id: &str) -> Result<StatsStream, RuntimeError> {
        let samples = self
            .stats
            .lock()
            .unwrap()
            .get(container_id)
            .cloned()
            .unwrap_or_default();
        if let Some(gate) = self.stats_gate.lock().unwrap().take() {
            let closed = stream::once(gate).filter_map(|_| async { None });
            return Ok(stream::iter(samples.into_iter().map(Ok)).chain(closed).boxed());
        }
        Ok(self.finish(samples.into_iter().map(Ok).collect()))
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let rx = self
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| RuntimeError::Events("no event source".to_string()))?;
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (Ok(event), rx))
        })
        .boxed())
    }

    async fn host_name(&self) -> Result<String, RuntimeError> {
        self.host
            .clone()
            .ok_or_else(|| RuntimeError::Info("no host".to_string()))
    }
}

pub(crate) fn container(id: &str, name: &str, pairs: &[(&str, &str)]) -> ContainerDescriptor {
    ContainerDescriptor {
        id: id.to_string(),
        names: vec![name.to_string()],
        labels: pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        image_id: format!("sha256:{}", id),
    }
}

/// Poll `check` until it holds or a second has passed
pub(crate) async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

mod registry_tests {
    use super::*;

    #[tokio::test]
    async fn test_same_id_twice_keeps_one_tracker_with_latest_labels() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = TrackerRegistry::new(runtime);

        let first = registry
            .reconcile(vec![container("c1", "/web", &[(labels::SEARCH_INDEX, "shop")])])
            .await;
        let second = registry
            .reconcile(vec![container("c1", "/web", &[(labels::SEARCH_INDEX, "billing")])])
            .await;

        assert_eq!(first, ReconcileSummary { created: 1, updated: 0 });
        assert_eq!(second, ReconcileSummary { created: 0, updated: 1 });
        assert_eq!(registry.len().await, 1);

        let tracker = registry.get("c1").await.unwrap();
        assert_eq!(tracker.container().await.search_index(), "billing");
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_missing_container_keeps_its_tracker() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = TrackerRegistry::new(runtime);

        registry
            .reconcile(vec![container("c1", "/a", &[]), container("c2", "/b", &[])])
            .await;
        registry.reconcile(vec![container("c2", "/b", &[])]).await;

        assert_eq!(registry.len().await, 2);
        assert!(registry.get("c1").await.is_some());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_trackers_request_logs_since_registry_start() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = TrackerRegistry::new(runtime.clone()).with_since(1_565_000_000);

        registry.reconcile(vec![container("c1", "/web", &[])]).await;

        assert!(eventually(|| async { !runtime.log_requests().is_empty() }).await);
        assert_eq!(
            runtime.log_requests(),
            vec![("c1".to_string(), 1_565_000_000)]
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_every_tracker() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = TrackerRegistry::new(runtime);
        registry
            .reconcile(vec![container("c1", "/a", &[]), container("c2", "/b", &[])])
            .await;

        registry.shutdown();

        for tracker in registry.lock().await.values() {
            assert!(tracker.is_stopped());
        }
    }

    #[tokio::test]
    async fn test_closed_discovery_channel_keeps_trackers_running() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(TrackerRegistry::new(runtime));
        let (updates_tx, updates_rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(Arc::clone(&registry).run(updates_rx, shutdown_rx));
        updates_tx
            .send(vec![container("c1", "/web", &[])])
            .await
            .unwrap();
        drop(updates_tx);
        task.await.unwrap();

        let tracker = registry.get("c1").await.unwrap();
        assert!(!tracker.is_stopped());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_run_applies_updates_until_shutdown() {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(TrackerRegistry::new(runtime));
        let (updates_tx, updates_rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let task = tokio::spawn(Arc::clone(&registry).run(updates_rx, shutdown_rx));
        updates_tx
            .send(vec![container("c1", "/web", &[])])
            .await
            .unwrap();

        assert!(eventually(|| async { registry.len().await == 1 }).await);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(registry.get("c1").await.unwrap().is_stopped());
    }
}

mod tracker_tests {
    use super::*;

    async fn drained(tracker: &Tracker, expected: usize) -> Vec<LogRecord> {
        let mut records = Vec::new();
        for _ in 0..100 {
            records.extend(tracker.drain_logs().await);
            if records.len() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        records
    }

    #[tokio::test]
    async fn test_log_lines_are_normalized_in_order() {
        let runtime = Arc::new(MockRuntime::new().with_logs(
            "c1",
            &[
                r#"2019-08-16T10:00:00Z {"mock":true}"#,
                "2019-08-16T10:00:01Z plain text",
            ],
        ));
        let registry = TrackerRegistry::new(runtime);
        registry.reconcile(vec![container("c1", "/web", &[])]).await;
        let tracker = registry.get("c1").await.unwrap();

        let records = drained(&tracker, 2).await;
        let texts: Vec<_> = records.iter().map(LogRecord::as_str).collect();
        assert_eq!(
            texts,
            vec![
                r#"{"mock":true}"#,
                r#"{"message":"2019-08-16T10:00:01Z plain text"}"#
            ]
        );
        assert!(tracker.drain_logs().await.is_empty());
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_format_label_drives_extraction() {
        let runtime = Arc::new(MockRuntime::new().with_logs(
            "c1",
            &["2019-08-16T10:00:00Z GET /health 200"],
        ));
        let registry = TrackerRegistry::new(runtime);
        registry
            .reconcile(vec![container(
                "c1",
                "/web",
                &[(
                    labels::FORMAT_REGEX,
                    r"(?P<method>[A-Z]+) (?P<path>\S+) (?P<status>\d{3})",
                )],
            )])
            .await;
        let tracker = registry.get("c1").await.unwrap();

        let records = drained(&tracker, 1).await;
        assert_eq!(
            records[0].as_str(),
            r#"{"method":"GET","path":"/health","status":"200"}"#
        );
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_stats_snapshot_tracks_latest_sample() {
        let mut sample = RawStatsSample::default();
        sample.memory_stats.usage = 42;
        let runtime = Arc::new(MockRuntime::new().with_stats("c1", vec![sample]));
        let registry = TrackerRegistry::new(runtime);
        registry.reconcile(vec![container("c1", "/web", &[])]).await;
        let tracker = registry.get("c1").await.unwrap();

        assert!(eventually(|| async { tracker.current_stats().await.memory_stats.usage == 42 }).await);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_stats_reset_when_stream_ends() {
        let mut sample = RawStatsSample::default();
        sample.memory_stats.usage = 42;
        let runtime = Arc::new(MockRuntime::new().with_stats("c1", vec![sample]));
        let end_stream = runtime.stats_gate();
        let tracker = Tracker::spawn(
            runtime,
            container("c1", "/web", &[]),
            0,
            tokio_util::sync::CancellationToken::new(),
            crate::observability::AgentMetrics::new(),
        );

        assert!(eventually(|| async { tracker.current_stats().await.memory_stats.usage == 42 }).await);

        end_stream.send(()).unwrap();
        assert!(
            eventually(|| async { *tracker.current_stats().await == RawStatsSample::default() })
                .await
        );
        tracker.stop();
    }

    #[tokio::test]
    async fn test_tasks_exit_when_streams_end() {
        let runtime = Arc::new(
            MockRuntime::new()
                .ending_streams()
                .with_logs("c1", &["2019-08-16T10:00:00Z {\"last\":true}"]),
        );
        let tracker = Tracker::spawn(
            runtime,
            container("c1", "/web", &[]),
            0,
            tokio_util::sync::CancellationToken::new(),
            crate::observability::AgentMetrics::new(),
        );

        // Both tasks hold a reference until they return.
        assert!(eventually(|| async { Arc::strong_count(&tracker) == 1 }).await);
        assert!(!tracker.is_stopped());

        let records = tracker.drain_logs().await;
        let texts: Vec<_> = records.iter().map(LogRecord::as_str).collect();
        assert_eq!(texts, vec![r#"{"last":true}"#]);
        assert!(tracker.drain_logs().await.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_tracker_ignores_further_lines() {
        let runtime = Arc::new(MockRuntime::new());
        let tracker = Tracker::spawn(
            runtime,
            container("c1", "/web", &[]),
            0,
            tokio_util::sync::CancellationToken::new(),
            crate::observability::AgentMetrics::new(),
        );
        tracker.stop();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(tracker.drain_logs().await.is_empty());
    }
}

mod discovery_tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_update_skips_opted_out_containers() {
        let runtime = MockRuntime::new()
            .with_container(container("a", "/a", &[]))
            .with_container(container("b", "/b", &[(labels::TRACK, "false")]));
        let _events = runtime.event_sender();
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let _handle = DiscoveryWatcher::new(Arc::new(runtime), tx)
            .start(shutdown_rx)
            .await
            .unwrap();

        let update = rx.recv().await.unwrap();
        let ids: Vec<_> = update.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn test_container_event_triggers_relist() {
        let runtime = Arc::new(MockRuntime::new().with_container(container("a", "/a", &[])));
        let events = runtime.event_sender();
        let (tx, mut rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let _handle = DiscoveryWatcher::new(runtime.clone(), tx)
            .start(shutdown_rx)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().len(), 1);

        runtime.set_containers(vec![container("a", "/a", &[]), container("b", "/b", &[])]);
        events.send(RuntimeEvent::Other).unwrap();
        events
            .send(RuntimeEvent::Container {
                action: "start".to_string(),
            })
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(update.len(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_watcher_stops_on_shutdown() {
        let runtime = Arc::new(MockRuntime::new());
        let _events = runtime.event_sender();
        let (tx, _rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = DiscoveryWatcher::new(runtime, tx)
            .start(shutdown_rx)
            .await
            .unwrap();
        shutdown_tx.send(()).unwrap();

        assert!(eventually(|| async { handle.is_finished() }).await);
    }

    #[tokio::test]
    async fn test_start_fails_without_event_source() {
        let runtime = Arc::new(MockRuntime::new());
        let (tx, _rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);

        assert!(DiscoveryWatcher::new(runtime, tx)
            .start(shutdown_rx)
            .await
            .is_err());
    }
}

mod host_tests {
    use super::*;

    #[tokio::test]
    async fn test_reported_host_name_is_used() {
        let runtime = MockRuntime::new().with_host("node-7");
        assert_eq!(resolve_host(&runtime).await, "node-7");
    }

    #[tokio::test]
    async fn test_missing_host_name_falls_back_to_localhost() {
        let runtime = MockRuntime::new();
        assert_eq!(resolve_host(&runtime).await, DEFAULT_HOST);
        assert_eq!(DEFAULT_HOST, "localhost");
    }
}
