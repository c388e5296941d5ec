//! Async tracker driver
//!
//! Runs a `BehaviorTracker` inside one tokio task. Host events, sampling
//! ticks, requeues from failed deliveries and cancellation all go through a
//! single `select!` loop, so only this task ever mutates tracker state.
//! Keepalive fallbacks run on their own tasks and report failures back over
//! a channel instead of touching the buffer.

use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::TrackerConfig;
use crate::delivery::{
    DeliveryManager, DeliveryOutcome, Dispatch, FlushBatch, FlushTrigger, Transport,
};
use crate::error::TrackerError;
use crate::tracker::{BehaviorTracker, PageSnapshot, TrackerEvent};
use crate::types::{FeatureRecord, ViewerSession};

/// Monotonic page clock in milliseconds
#[derive(Debug, Clone, Copy)]
pub struct PageClock {
    origin: Instant,
    offset_ms: u64,
}

impl PageClock {
    /// A clock reading `offset_ms` right now
    pub fn starting_at(offset_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            offset_ms,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.offset_ms + self.origin.elapsed().as_millis() as u64
    }
}

/// Summary returned once the tracker task has shut down
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopReport {
    /// Records confirmed delivered or accepted by the beacon
    pub delivered: usize,
    /// Flush attempts made
    pub flushes: u64,
    /// Records that could not be delivered before shutdown, oldest first
    pub undelivered: Vec<FeatureRecord>,
}

/// Control handle for a running tracker task
pub struct TrackerHandle {
    events: mpsc::UnboundedSender<TrackerEvent>,
    cancel: CancellationToken,
    join: JoinHandle<StopReport>,
    clock: PageClock,
}

impl TrackerHandle {
    /// Clock the host should stamp events with
    pub fn clock(&self) -> PageClock {
        self.clock
    }

    /// Forward a host event to the tracker
    pub fn send(&self, event: TrackerEvent) -> Result<(), TrackerError> {
        self.events.send(event).map_err(|_| TrackerError::Stopped)
    }

    /// Stop tracking, wait for pending deliveries and the final flush
    pub async fn stop(self) -> Result<StopReport, TrackerError> {
        self.cancel.cancel();
        self.join
            .await
            .map_err(|e| TrackerError::Driver(e.to_string()))
    }
}

/// Start tracking on the current tokio runtime
pub fn spawn_tracker<T>(
    config: TrackerConfig,
    session: ViewerSession,
    page: PageSnapshot,
    transport: Arc<T>,
) -> Result<TrackerHandle, TrackerError>
where
    T: Transport + 'static,
{
    config.validate()?;
    if !session.has_consent_signal {
        return Err(TrackerError::NotEligible(session.viewer_id));
    }

    let clock = PageClock::starting_at(page.at_ms);
    let tracker = BehaviorTracker::new(&config, page);
    let manager = DeliveryManager::new(session, config.collector_path.clone());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    info!(
        "tracking viewer {} on article {} (session {})",
        manager.session().viewer_id,
        manager.session().article_id,
        manager.session().session_id
    );

    let join = tokio::spawn(tracker_loop(
        tracker,
        manager,
        transport,
        events_rx,
        cancel.clone(),
        Duration::from_millis(config.tick_interval_ms),
        clock,
    ));

    Ok(TrackerHandle {
        events: events_tx,
        cancel,
        join,
        clock,
    })
}

async fn tracker_loop<T>(
    mut tracker: BehaviorTracker,
    manager: DeliveryManager,
    transport: Arc<T>,
    mut events_rx: mpsc::UnboundedReceiver<TrackerEvent>,
    cancel: CancellationToken,
    tick_interval: Duration,
    clock: PageClock,
) -> StopReport
where
    T: Transport + 'static,
{
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel::<Vec<FeatureRecord>>();
    let mut in_flight: JoinSet<usize> = JoinSet::new();
    let mut report = StopReport::default();

    loop {
        let batch = tokio::select! {
            biased;

            event = events_rx.recv() => match event {
                Some(event) => tracker.handle(event),
                None => {
                    info!("event channel closed; shutting down tracker");
                    break;
                }
            },
            Some(records) = requeue_rx.recv() => {
                tracker.requeue(records);
                None
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                collect_in_flight(joined, &mut report);
                None
            }
            _ = ticker.tick() => tracker.handle(TrackerEvent::Tick { at_ms: clock.now_ms() }),
            _ = cancel.cancelled() => {
                info!("tracker cancelled");
                break;
            }
        };

        if let Some(batch) = batch {
            report.flushes += 1;
            dispatch_in_background(
                &manager,
                batch,
                &transport,
                &requeue_tx,
                &mut in_flight,
                &mut tracker,
                &mut report,
            );
        }

        if tracker.is_stopped() {
            break;
        }
    }

    // Let outstanding fallbacks finish so their failures can be retried once more
    while let Some(joined) = in_flight.join_next().await {
        collect_in_flight(joined, &mut report);
    }
    while let Ok(records) = requeue_rx.try_recv() {
        tracker.requeue(records);
    }

    let final_batch = if tracker.is_stopped() {
        tracker.flush(FlushTrigger::Stop)
    } else {
        tracker.stop()
    };

    if let Some(batch) = final_batch {
        report.flushes += 1;
        match manager.deliver(batch.clone(), transport.as_ref()).await {
            Ok(DeliveryOutcome::Delivered { count }) => report.delivered += count,
            Ok(DeliveryOutcome::Failed { records, error }) => {
                warn!("final flush failed ({error}); {} records undelivered", records.len());
                report.undelivered = records;
            }
            Err(err) => {
                error!("final flush could not be encoded: {err}");
                report.undelivered = batch.records;
            }
        }
    }

    info!(
        "tracker shut down: {} delivered, {} undelivered, {} flushes",
        report.delivered,
        report.undelivered.len(),
        report.flushes
    );
    report
}

fn dispatch_in_background<T>(
    manager: &DeliveryManager,
    batch: FlushBatch,
    transport: &Arc<T>,
    requeue_tx: &mpsc::UnboundedSender<Vec<FeatureRecord>>,
    in_flight: &mut JoinSet<usize>,
    tracker: &mut BehaviorTracker,
    report: &mut StopReport,
) where
    T: Transport + 'static,
{
    let records = batch.records.clone();
    match manager.dispatch(batch, transport.as_ref()) {
        Ok(Dispatch::Beaconed { count }) => report.delivered += count,
        Ok(Dispatch::Fallback(pending)) => {
            let transport = Arc::clone(transport);
            let requeue_tx = requeue_tx.clone();
            in_flight.spawn(async move {
                match pending.send(transport.as_ref()).await {
                    DeliveryOutcome::Delivered { count } => count,
                    DeliveryOutcome::Failed { records, .. } => {
                        // The loop owns the buffer; hand the records back to it
                        let _ = requeue_tx.send(records);
                        0
                    }
                }
            });
        }
        Err(err) => {
            error!("could not encode payload: {err}");
            tracker.requeue(records);
        }
    }
}

fn collect_in_flight(
    joined: Result<usize, tokio::task::JoinError>,
    report: &mut StopReport,
) {
    match joined {
        Ok(count) => report.delivered += count,
        Err(err) => error!("delivery task failed to join: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{BeaconTransport, KeepaliveTransport};
    use crate::error::TransportError;
    use crate::types::{DeliveryPayload, Rect, Viewport};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        accept_beacon: bool,
        keepalive_ok: bool,
        beacons: Mutex<Vec<DeliveryPayload>>,
        posts: Mutex<Vec<DeliveryPayload>>,
    }

    impl BeaconTransport for RecordingTransport {
        fn send_beacon(&self, _path: &str, body: &str) -> bool {
            if self.accept_beacon {
                self.beacons
                    .lock()
                    .unwrap()
                    .push(serde_json::from_str(body).unwrap());
            }
            self.accept_beacon
        }
    }

    #[async_trait]
    impl KeepaliveTransport for RecordingTransport {
        async fn post_keepalive(&self, _path: &str, body: String) -> Result<(), TransportError> {
            self.posts
                .lock()
                .unwrap()
                .push(serde_json::from_str(&body).unwrap());
            if self.keepalive_ok {
                Ok(())
            } else {
                Err(TransportError::Network("connection reset".to_string()))
            }
        }
    }

    fn page() -> PageSnapshot {
        PageSnapshot::new(0, Viewport::new(1000.0, 800.0))
            .with_region(Rect::new(100.0, 100.0, 900.0, 700.0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_flush_via_beacon() {
        let transport = Arc::new(RecordingTransport {
            accept_beacon: true,
            ..Default::default()
        });
        let handle = spawn_tracker(
            TrackerConfig::default(),
            ViewerSession::new("reader-1", "news-42"),
            page(),
            Arc::clone(&transport),
        )
        .unwrap();

        handle
            .send(TrackerEvent::PointerMove {
                at_ms: handle.clock().now_ms(),
                x: 500.0,
                y: 400.0,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10_050)).await;
        let report = handle.stop().await.unwrap();

        let beacons = transport.beacons.lock().unwrap();
        assert_eq!(beacons.len(), 1);
        assert_eq!(beacons[0].total_logs, 10);
        assert_eq!(beacons[0].news_id, "news-42");
        assert_eq!(beacons[0].logs[0].proximity, 1.0);
        assert_eq!(report.delivered, 10);
        assert!(report.undelivered.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_fallback_delivers() {
        let transport = Arc::new(RecordingTransport {
            keepalive_ok: true,
            ..Default::default()
        });
        let handle = spawn_tracker(
            TrackerConfig::default(),
            ViewerSession::new("reader-1", "news-42"),
            page(),
            Arc::clone(&transport),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(3_050)).await;
        handle
            .send(TrackerEvent::Visibility {
                at_ms: handle.clock().now_ms(),
                visible: false,
            })
            .unwrap();
        let report = handle.stop().await.unwrap();

        let posts = transport.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].total_logs, 3);
        assert_eq!(report.delivered, 3);
        assert!(report.undelivered.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_failure_reports_undelivered_in_order() {
        let transport = Arc::new(RecordingTransport::default());
        let handle = spawn_tracker(
            TrackerConfig::default(),
            ViewerSession::new("reader-1", "news-42"),
            page(),
            Arc::clone(&transport),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(3_050)).await;
        handle
            .send(TrackerEvent::Visibility {
                at_ms: handle.clock().now_ms(),
                visible: false,
            })
            .unwrap();
        let report = handle.stop().await.unwrap();

        // Hidden flush and final stop flush both reached the keepalive path
        let posts = transport.posts.lock().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].logs, posts[1].logs);

        let secs: Vec<f64> = report.undelivered.iter().map(|r| r.elapsed_sec).collect();
        assert_eq!(secs, vec![1.0, 2.0, 3.0]);
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_event_ends_task() {
        let transport = Arc::new(RecordingTransport {
            accept_beacon: true,
            ..Default::default()
        });
        let handle = spawn_tracker(
            TrackerConfig::default(),
            ViewerSession::new("reader-1", "news-42"),
            page(),
            Arc::clone(&transport),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(2_050)).await;
        handle
            .send(TrackerEvent::Stop {
                at_ms: handle.clock().now_ms(),
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            handle.send(TrackerEvent::Tick { at_ms: 0 }),
            Err(TrackerError::Stopped)
        ));

        let report = handle.stop().await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(transport.beacons.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_without_consent_is_not_tracked() {
        let transport = Arc::new(RecordingTransport {
            accept_beacon: true,
            ..Default::default()
        });
        let mut session = ViewerSession::new("guest", "news-42");
        session.has_consent_signal = false;

        let result = spawn_tracker(
            TrackerConfig::default(),
            session,
            page(),
            Arc::clone(&transport),
        );
        assert!(matches!(result, Err(TrackerError::NotEligible(ref id)) if id == "guest"));

        tokio::time::sleep(Duration::from_millis(12_050)).await;
        assert!(transport.beacons.lock().unwrap().is_empty());
        assert!(transport.posts.lock().unwrap().is_empty());
    }
}
