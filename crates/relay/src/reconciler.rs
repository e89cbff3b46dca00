use std::time::Duration;

use futures::future::join_all;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

use crate::{Observation, RelayService};

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub polled: usize,
    pub applied: usize,
    pub kept_optimistic: usize,
    pub stale: usize,
    pub failed: usize,
}

/// Periodically reads every device from the ledger and feeds the readings to
/// the device actors. A failed read leaves the last confirmed value in place.
#[derive(Clone)]
pub struct Reconciler {
    relay: RelayService,
    interval: Duration,
}

impl Reconciler {
    pub fn new(relay: RelayService, interval: Duration) -> Self {
        Self { relay, interval }
    }

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let ledger = self.relay.ledger();
        let devices = self.relay.devices();

        let readings = join_all(devices.iter().map(|device| {
            let ledger = ledger.clone();
            let device = *device;
            async move { (device, ledger.query_state(device).await) }
        }))
        .await;

        let mut report = ReconcileReport {
            polled: devices.len(),
            ..ReconcileReport::default()
        };
        for (device, reading) in readings {
            let reading = match reading {
                Ok(reading) => reading,
                Err(error) => {
                    warn!(%device, %error, "ledger read failed, keeping last confirmed state");
                    report.failed += 1;
                    continue;
                }
            };
            match self.relay.observe(device, reading).await {
                Ok(Observation::Applied) => report.applied += 1,
                Ok(Observation::KeptOptimistic) => report.kept_optimistic += 1,
                Ok(Observation::Stale) => report.stale += 1,
                Err(error) => {
                    warn!(%device, %error, "could not deliver ledger reading");
                    report.failed += 1;
                }
            }
        }

        debug!(
            polled = report.polled,
            applied = report.applied,
            kept_optimistic = report.kept_optimistic,
            stale = report.stale,
            failed = report.failed,
            "reconcile pass finished"
        );
        report
    }

    /// Polls every `interval`, starting one interval from now; callers run
    /// their own initial pass.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.reconcile_once().await;
            }
        })
    }
}
