//! Periodic telemetry producers.
//!
//! Both loops run regardless of subscribers and stop when the shutdown
//! channel flips to `true` (or its sender is dropped).

use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::comms::broker::Broker;
use crate::monitoring::HostSampler;
use crate::transport::{StatsEvent, TelemetryEvent};

pub const STATS_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Join handles for the running producer tasks.
#[derive(Debug)]
pub struct ProducerHandles {
    pub logs: JoinHandle<()>,
    pub stats: JoinHandle<()>,
}

impl ProducerHandles {
    pub async fn join(self) {
        for (name, handle) in [("logs", self.logs), ("stats", self.stats)] {
            if let Err(e) = handle.await {
                warn!(producer = name, "producer task ended abnormally: {}", e);
            }
        }
    }
}

pub fn format_log_line(seq: u64, cpu_percent: f64) -> String {
    format!(
        "[{}] log #{} cpu={:.1}%",
        Local::now().format("%H:%M:%S"),
        seq,
        cpu_percent
    )
}

/// Emit a log line with a running sequence number every `period`.
pub fn spawn_log_producer<S: HostSampler>(
    sampler: Arc<S>,
    broker: Arc<Broker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut seq: u64 = 0;
        info!(interval_ms = period.as_millis() as u64, "log producer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let sample = match sampler.sample().await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("log producer skipped a tick: {:#}", e);
                    continue;
                }
            };

            seq += 1;
            let delivered = broker.publish(TelemetryEvent::log(format_log_line(
                seq,
                sample.cpu_percent,
            )));
            debug!(seq, delivered, "log event published");
        }

        info!(produced = seq, "log producer stopped");
    })
}

/// Emit a CPU/memory sample every `period`.
pub fn spawn_stats_producer<S: HostSampler>(
    sampler: Arc<S>,
    broker: Arc<Broker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = period.as_millis() as u64, "stats producer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let sample = match sampler.sample().await {
                Ok(sample) => sample,
                Err(e) => {
                    warn!("stats producer skipped a tick: {:#}", e);
                    continue;
                }
            };

            let delivered = broker.publish(TelemetryEvent::Stats(StatsEvent {
                cpu_percent: sample.cpu_percent,
                memory_percent: sample.memory_percent,
                timestamp: Local::now().format(STATS_TIMESTAMP_FORMAT).to_string(),
            }));
            debug!(
                cpu = sample.cpu_percent,
                memory = sample.memory_percent,
                delivered,
                "stats event published"
            );
        }

        info!("stats producer stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::HostSample;
    use crate::transport::Topic;
    use anyhow::{bail, Result};
    use std::future::Future;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Fails every other call.
    #[derive(Default)]
    struct FlakySampler {
        calls: AtomicU64,
    }

    impl HostSampler for FlakySampler {
        fn sample(&self) -> impl Future<Output = Result<HostSample>> + Send {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n % 2 == 1 {
                    bail!("sensor glitch");
                }
                Ok(HostSample {
                    cpu_percent: 5.0,
                    memory_percent: 50.0,
                })
            }
        }
    }

    fn log_seq(event: &TelemetryEvent) -> u64 {
        match event {
            TelemetryEvent::Log(log) => log
                .message
                .split("log #")
                .nth(1)
                .and_then(|rest| rest.split_whitespace().next())
                .and_then(|n| n.parse().ok())
                .unwrap(),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_log_producer_survives_failed_samples() {
        let broker = Arc::new(Broker::new(64));
        let mut sub = broker.subscribe(Topic::Logs);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_log_producer(
            Arc::new(FlakySampler::default()),
            broker.clone(),
            Duration::from_millis(10),
            rx,
        );

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap();
            seqs.push(log_seq(&event));
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_producer_publishes_only_stats() {
        let broker = Arc::new(Broker::new(64));
        let mut stats = broker.subscribe(Topic::Stats);
        let mut logs = broker.subscribe(Topic::Logs);
        let (tx, rx) = watch::channel(false);

        let handle = spawn_stats_producer(
            Arc::new(FlakySampler::default()),
            broker.clone(),
            Duration::from_millis(10),
            rx,
        );

        let event = tokio::time::timeout(Duration::from_secs(2), stats.recv())
            .await
            .unwrap()
            .unwrap();
        match event.as_ref() {
            TelemetryEvent::Stats(s) => {
                assert_eq!(s.cpu_percent, 5.0);
                assert_eq!(s.memory_percent, 50.0);
                assert!(chrono::NaiveDateTime::parse_from_str(&s.timestamp, STATS_TIMESTAMP_FORMAT)
                    .is_ok());
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Dropping the sender also stops the loop.
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(logs.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_producers_run_without_subscribers() {
        let broker = Arc::new(Broker::new(4));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_stats_producer(
            Arc::new(FlakySampler::default()),
            broker.clone(),
            Duration::from_millis(5),
            rx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.subscriber_count(Topic::Stats), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn test_log_line_format() {
        let line = format_log_line(7, 12.345);
        assert!(line.contains("log #7"));
        assert!(line.ends_with("cpu=12.3%"));
    }
}
