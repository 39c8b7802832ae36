//! Node health monitoring.
//!
//! Probes the managed node on a fixed cadence and reflects the result in a
//! single readiness flag plus head-block and storage gauges. Probe failures
//! are a reporting signal, never a pipeline failure: five consecutive
//! failures merely clear readiness until a probe succeeds again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use metrics::gauge;
use snafu::Snafu;
use tracing::debug;

use crate::internal_events::{HeadBlockSeen, InternalEvent, NodeProbeFailed, ReadinessChanged};
use crate::shutdown::ShutdownSignal;

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
/// The DB-size probe runs every 6th readiness probe, i.e. every 30 s.
const DB_SIZE_EVERY: u32 = 6;
const FAILURES_BEFORE_NOT_READY: u32 = 5;

#[derive(Debug, Snafu)]
#[snafu(display("node query failed: {message}"))]
pub struct NodeError {
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct ChainInfo {
    pub head_block_num: u64,
    pub head_block_time: DateTime<Utc>,
    /// Whether this node is an active block producer.
    pub is_producer: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct DbSize {
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// Chain-specific client for the managed node's local RPC surface.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn chain_info(&self) -> Result<ChainInfo, NodeError>;

    async fn db_size(&self) -> Result<DbSize, NodeError>;

    /// Only polled while the node is an active producer.
    async fn is_producer_paused(&self) -> Result<bool, NodeError>;
}

/// Shared readiness flag with change logging.
#[derive(Debug, Default)]
pub struct Readiness {
    ready: AtomicBool,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn set(&self, ready: bool) {
        if self
            .ready
            .compare_exchange(!ready, ready, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            ReadinessChanged { ready }.emit();
        }
    }
}

pub struct Monitor {
    client: Arc<dyn NodeClient>,
    readiness: Arc<Readiness>,
    /// Maximum head-block drift that still counts as ready. Zero disables
    /// the latency check.
    max_latency: Duration,
    consecutive_failures: u32,
    ticks: u32,
}

impl Monitor {
    pub fn new(client: Arc<dyn NodeClient>, max_latency: Duration) -> Self {
        Monitor {
            client,
            readiness: Arc::new(Readiness::default()),
            max_latency,
            consecutive_failures: 0,
            ticks: 0,
        }
    }

    pub fn readiness(&self) -> Arc<Readiness> {
        Arc::clone(&self.readiness)
    }

    pub async fn run(mut self, shutdown: ShutdownSignal) {
        let mut interval = tokio::time::interval(PROBE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => self.probe_once().await,
                _ = shutdown.cancelled() => break,
            }
        }
        debug!(message = "Monitor stopped.");
    }

    async fn probe_once(&mut self) {
        self.ticks = self.ticks.wrapping_add(1);

        match self.client.chain_info().await {
            Ok(info) => {
                self.consecutive_failures = 0;
                self.observe_chain_info(&info).await;
            }
            Err(error) => {
                self.consecutive_failures += 1;
                NodeProbeFailed {
                    consecutive_failures: self.consecutive_failures,
                    error: error.to_string(),
                }
                .emit();
                if self.consecutive_failures >= FAILURES_BEFORE_NOT_READY {
                    self.readiness.set(false);
                }
            }
        }

        if self.ticks % DB_SIZE_EVERY == 0 {
            match self.client.db_size().await {
                Ok(size) => {
                    gauge!("db_size_free").set(size.free_bytes as f64);
                    gauge!("db_size_used").set(size.used_bytes as f64);
                    gauge!("db_size_total").set(size.total_bytes as f64);
                }
                Err(error) => debug!(message = "DB size probe failed.", %error),
            }
        }
    }

    async fn observe_chain_info(&mut self, info: &ChainInfo) {
        let drift = Utc::now() - info.head_block_time;
        HeadBlockSeen {
            num: info.head_block_num,
            drift_seconds: drift.num_milliseconds() as f64 / 1000.0,
        }
        .emit();
        gauge!("is_block_producer").set(if info.is_producer { 1.0 } else { 0.0 });

        if info.is_producer {
            match self.client.is_producer_paused().await {
                Ok(paused) => {
                    gauge!("is_producer_paused").set(if paused { 1.0 } else { 0.0 });
                }
                Err(error) => debug!(message = "Producer pause probe failed.", %error),
            }
        }

        let within_latency = self.max_latency.is_zero()
            || drift <= TimeDelta::from_std(self.max_latency).unwrap_or(TimeDelta::MAX);
        self.readiness.set(within_latency);
    }
}
