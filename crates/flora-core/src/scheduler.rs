//! Discovery and polling loop.
//!
//! The scheduler alternates between two phases:
//!
//! 1. **Discovery** scans for sensors and builds a fresh [`Roster`].
//! 2. **Polling** fetches readings from every device in the roster at a
//!    fixed interval and writes them to the [`Sink`], until the roster is
//!    due to be rebuilt.
//!
//! A failed discovery is retried after a cooldown. Each discover-and-poll
//! cycle runs on its own task so the top-level loop can react to shutdown
//! while a cycle is in progress. On shutdown the cycle is cancelled and
//! awaited before the sink is closed: a device session already under way
//! completes, nothing new starts.

use std::future::Future;
use std::sync::Arc;

use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectionConfig;
use crate::discovery::{self, DiscoveryError, Roster};
use crate::error::FloraError;
use crate::sink::Sink;
use crate::transport::Transport;
use crate::types::{DeviceConfigMap, Measurement};

/// Outcome of one pass over a roster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Devices whose readings were fetched.
    pub fetched: usize,
    /// Devices whose session failed.
    pub failed: usize,
    /// Fetched measurements the sink did not accept.
    pub write_failures: usize,
}

/// Runs discovery and polling until shut down.
pub struct Scheduler<T: Transport, S: Sink> {
    transport: Arc<T>,
    sink: Arc<S>,
    collection: CollectionConfig,
    devices: Arc<DeviceConfigMap>,
}

impl<T: Transport, S: Sink> Scheduler<T, S> {
    /// Create a scheduler. Nothing runs until [`Scheduler::run`].
    pub fn new(
        transport: Arc<T>,
        sink: Arc<S>,
        collection: CollectionConfig,
        devices: DeviceConfigMap,
    ) -> Self {
        Self {
            transport,
            sink,
            collection,
            devices: Arc::new(devices),
        }
    }

    /// Run until `shutdown` completes, then close the sink.
    ///
    /// When this returns the collection task has stopped; no device is
    /// contacted and nothing is written afterwards.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let cancel = CancellationToken::new();

        loop {
            let mut worker = tokio::spawn(run_cycle(
                Arc::clone(&self.transport),
                Arc::clone(&self.sink),
                self.collection,
                Arc::clone(&self.devices),
                cancel.child_token(),
            ));

            tokio::select! {
                () = &mut shutdown => {
                    info!("Stopping collection");
                    cancel.cancel();
                    if let Err(err) = worker.await {
                        error!(error = %err, "Collection task ended unexpectedly");
                    }
                    break;
                }
                outcome = &mut worker => match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(err)) => {
                        let err = FloraError::from(err);
                        if err.is_recoverable() {
                            warn!(code = err.error_code(), error = %err, "Discovery failed");
                        } else {
                            error!(code = err.error_code(), error = %err, "Discovery failed");
                        }
                    }
                    Err(err) => error!(error = %err, "Collection task ended unexpectedly"),
                },
            }

            info!(
                "Retrying discovery in {}",
                humantime::format_duration(self.collection.discovery_cooldown)
            );
            tokio::select! {
                () = &mut shutdown => break,
                () = time::sleep(self.collection.discovery_cooldown) => {}
            }
        }

        info!("Shutting down");
        self.sink.close().await;
    }
}

/// Discover once, then poll the roster until rediscovery is due or
/// `cancel` fires.
async fn run_cycle<T: Transport, S: Sink>(
    transport: Arc<T>,
    sink: Arc<S>,
    collection: CollectionConfig,
    devices: Arc<DeviceConfigMap>,
    cancel: CancellationToken,
) -> Result<(), DiscoveryError> {
    let roster = tokio::select! {
        biased;

        () = cancel.cancelled() => return Ok(()),
        roster = discovery::discover(&transport, collection.discovery_timeout, &devices) => roster?,
    };
    if roster.is_empty() {
        warn!("No Flora devices found");
    } else {
        info!(devices = roster.len(), "Discovery finished");
    }

    let rediscovery = time::sleep(collection.discovery_interval);
    tokio::pin!(rediscovery);

    let mut ticker = time::interval(collection.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("Collection cycle cancelled");
                return Ok(());
            }
            () = &mut rediscovery => {
                info!("Rediscovery due");
                return Ok(());
            }
            _ = ticker.tick() => {
                let summary = poll_roster(&roster, sink.as_ref(), &cancel).await;
                debug!(
                    fetched = summary.fetched,
                    failed = summary.failed,
                    write_failures = summary.write_failures,
                    "Poll pass finished"
                );
            }
        }
    }
}

/// Fetch readings from every device in turn and write each success.
///
/// A failing device is logged and skipped; it never prevents the rest of
/// the roster from being polled. Once `cancel` fires no further device is
/// contacted.
pub async fn poll_roster<T: Transport, S: Sink + ?Sized>(
    roster: &Roster<T>,
    sink: &S,
    cancel: &CancellationToken,
) -> PollSummary {
    let mut summary = PollSummary::default();

    for device in roster {
        if cancel.is_cancelled() {
            debug!("Poll pass cancelled");
            break;
        }

        let readings = match device.fetch_readings().await {
            Ok(readings) => readings,
            Err(err) => {
                summary.failed += 1;
                let err = FloraError::from(err);
                if err.is_recoverable() {
                    warn!(device = %device.identity(), alias = device.alias(), code = err.error_code(), error = %err, "Failed to fetch readings");
                } else {
                    error!(device = %device.identity(), alias = device.alias(), code = err.error_code(), error = %err, "Failed to fetch readings");
                }
                continue;
            }
        };

        summary.fetched += 1;
        info!(device = device.display_name(), readings = %readings, "Readings fetched");

        let measurement = Measurement::now(device.identity(), device.alias(), readings);
        if let Err(err) = sink.write(&measurement).await {
            summary.write_failures += 1;
            let err = FloraError::from(err);
            if err.is_recoverable() {
                warn!(device = %device.identity(), code = err.error_code(), error = %err, "Failed to write measurement");
            } else {
                error!(device = %device.identity(), code = err.error_code(), error = %err, "Failed to write measurement");
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::mock::{MockEvent, MockFailure, MockPeripheral, MockTransport};
    use crate::protocol::HANDLE_SENSOR_READINGS;
    use crate::sink::SinkError;

    const PAYLOAD: [u8; 10] = [0xCE, 0x00, 0x00, 0x90, 0x01, 0x00, 0x00, 0x28, 0xE8, 0x00];

    #[derive(Default)]
    struct RecordingSink {
        measurements: Mutex<Vec<Measurement>>,
        closes: AtomicUsize,
        writes_after_close: AtomicUsize,
        reject: AtomicBool,
    }

    impl RecordingSink {
        fn rejecting() -> Self {
            let sink = Self::default();
            sink.reject.store(true, Ordering::SeqCst);
            sink
        }

        fn macs(&self) -> Vec<String> {
            self.measurements
                .lock()
                .unwrap()
                .iter()
                .map(|m| m.tags.mac.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.measurements.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn write(&self, measurement: &Measurement) -> Result<(), SinkError> {
            if self.closes.load(Ordering::SeqCst) > 0 {
                self.writes_after_close.fetch_add(1, Ordering::SeqCst);
                return Err(SinkError::Closed);
            }
            if self.reject.load(Ordering::SeqCst) {
                return Err(SinkError::Rejected {
                    status: 500,
                    body: "timeout".into(),
                });
            }
            self.measurements.lock().unwrap().push(measurement.clone());
            Ok(())
        }

        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn collection() -> CollectionConfig {
        CollectionConfig {
            discovery_interval: Duration::from_secs(5 * 60),
            discovery_timeout: Duration::from_secs(10),
            discovery_cooldown: Duration::from_secs(30),
            interval: Duration::from_secs(60),
        }
    }

    fn two_sensors() -> MockTransport {
        let transport = MockTransport::new();
        transport.add_peripheral(MockPeripheral::flora("AA:00:00:00:00:01", "2.6.2", 80, &PAYLOAD));
        transport.add_peripheral(MockPeripheral::flora("AA:00:00:00:00:02", "3.2.1", 50, &PAYLOAD));
        transport
    }

    fn sensor_reads(transport: &MockTransport, address: &str) -> usize {
        transport
            .events_for(address)
            .iter()
            .filter(|event| matches!(event, MockEvent::Read(_, handle) if *handle == HANDLE_SENSOR_READINGS))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_roster_skips_failing_device() {
        let transport = MockTransport::new();
        transport.add_peripheral(MockPeripheral::flora("AA:00:00:00:00:01", "3.2.1", 50, &PAYLOAD));
        transport.add_peripheral(
            MockPeripheral::flora("AA:00:00:00:00:02", "3.2.1", 50, &PAYLOAD)
                .failing(MockFailure::Connect),
        );
        transport.add_peripheral(MockPeripheral::flora("AA:00:00:00:00:03", "3.2.1", 50, &PAYLOAD));
        let transport = Arc::new(transport);
        let sink = RecordingSink::default();

        let roster = discovery::discover(&transport, Duration::from_secs(10), &DeviceConfigMap::new())
            .await
            .unwrap();
        let summary = poll_roster(&roster, &sink, &CancellationToken::new()).await;

        assert_eq!(
            summary,
            PollSummary {
                fetched: 2,
                failed: 1,
                write_failures: 0
            }
        );
        assert_eq!(sink.macs(), vec!["AA:00:00:00:00:01", "AA:00:00:00:00:03"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_roster_tags_measurements() {
        let transport = MockTransport::new();
        transport.add_peripheral(MockPeripheral::flora("AA:00:00:00:00:01", "3.2.1", 50, &PAYLOAD));
        let transport = Arc::new(transport);
        let sink = RecordingSink::default();

        let mut configs = DeviceConfigMap::new();
        configs.insert(
            "AA:00:00:00:00:01".into(),
            crate::types::DeviceConfig {
                alias: Some("Ficus".into()),
                ignore: false,
            },
        );
        let roster = discovery::discover(&transport, Duration::from_secs(10), &configs)
            .await
            .unwrap();
        poll_roster(&roster, &sink, &CancellationToken::new()).await;

        let measurements = sink.measurements.lock().unwrap();
        let tags = &measurements[0].tags;
        assert_eq!(tags.mac, "AA:00:00:00:00:01");
        assert_eq!(tags.alias.as_deref(), Some("Ficus"));
        assert_eq!(tags.version, "3.2.1");
        assert_eq!(measurements[0].fields.light, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_roster_counts_write_failures() {
        let transport = Arc::new(two_sensors());
        let sink = RecordingSink::rejecting();

        let roster = discovery::discover(&transport, Duration::from_secs(10), &DeviceConfigMap::new())
            .await
            .unwrap();
        let summary = poll_roster(&roster, &sink, &CancellationToken::new()).await;

        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.write_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_until_rediscovery() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        // discovery 0..10s, polls at 10, 70, 130, 190, 250, rediscovery at
        // 310s, discovery 310..320s, poll at 320s
        scheduler.run(time::sleep(Duration::from_secs(350))).await;

        assert_eq!(transport.scan_count(), 2);
        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:01"), 6);
        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:02"), 6);
        assert_eq!(sink.count(), 12);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_first_poll_follows_discovery_immediately() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        scheduler.run(time::sleep(Duration::from_secs(11))).await;

        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_rediscovers_with_empty_roster() {
        let transport = MockTransport::new();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        // scans start at 0, 310 and 620s
        scheduler.run(time::sleep(Duration::from_secs(650))).await;

        assert_eq!(transport.scan_count(), 3);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_waits_cooldown_after_discovery_failure() {
        let transport = two_sensors();
        transport.set_scan_error(Some("org.bluez.Error.NotReady"));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        // failed scans at 0, 30 and 60s
        scheduler.run(time::sleep(Duration::from_secs(65))).await;

        assert_eq!(transport.scan_count(), 3);
        assert_eq!(sink.count(), 0);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_discovery_failure() {
        let transport = two_sensors();
        transport.set_scan_error(Some("org.bluez.Error.NotReady"));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        let recover = async {
            time::sleep(Duration::from_secs(45)).await;
            transport.set_scan_error(None);
        };

        // failed scans at 0 and 30s, successful scan 60..70s, poll at 70s
        tokio::join!(
            scheduler.run(time::sleep(Duration::from_secs(100))),
            recover
        );

        assert_eq!(transport.scan_count(), 3);
        assert_eq!(sink.count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_keeps_polling_when_sink_rejects() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::rejecting());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        // polls at 10, 70 and 130s
        scheduler.run(time::sleep(Duration::from_secs(135))).await;

        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:01"), 3);
        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:02"), 3);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_discovery_closes_sink_once() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        scheduler.run(time::sleep(Duration::from_secs(5))).await;

        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_roster_contacts_nobody_once_cancelled() {
        let transport = Arc::new(two_sensors());
        let sink = RecordingSink::default();

        let roster = discovery::discover(&transport, Duration::from_secs(10), &DeviceConfigMap::new())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = poll_roster(&roster, &sink, &cancel).await;

        assert_eq!(summary, PollSummary::default());
        assert!(transport
            .events()
            .iter()
            .all(|event| !matches!(event, MockEvent::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_activity_after_shutdown_during_discovery() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        scheduler.run(time::sleep(Duration::from_secs(5))).await;
        let events_at_shutdown = transport.events();
        time::sleep(Duration::from_secs(1000)).await;

        assert_eq!(transport.events(), events_at_shutdown);
        assert_eq!(transport.scan_count(), 1);
        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:01"), 0);
        assert_eq!(sink.count(), 0);
        assert_eq!(sink.writes_after_close.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_activity_after_shutdown_during_polling() {
        let transport = two_sensors();
        let sink = Arc::new(RecordingSink::default());
        let scheduler = Scheduler::new(
            Arc::new(transport.clone()),
            Arc::clone(&sink),
            collection(),
            DeviceConfigMap::new(),
        );

        // polls at 10 and 70s, shutdown before the 130s tick
        scheduler.run(time::sleep(Duration::from_secs(75))).await;
        let events_at_shutdown = transport.events();
        time::sleep(Duration::from_secs(1000)).await;

        assert_eq!(transport.events(), events_at_shutdown);
        assert_eq!(sensor_reads(&transport, "AA:00:00:00:00:01"), 2);
        assert_eq!(sink.count(), 4);
        assert_eq!(sink.closes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.writes_after_close.load(Ordering::SeqCst), 0);
    }
}
