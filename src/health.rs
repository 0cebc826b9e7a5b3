//! Periodic ICE health sampling and the rejoin policy that acts on it.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::media::{IceState, NegotiationSnapshot};
use crate::timer::PeriodicTask;

/// A degraded reading, tagged with the media session it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSample {
    pub generation: u64,
    pub ice_state: IceState,
}

pub struct ConnectionHealthMonitor;

impl ConnectionHealthMonitor {
    /// Reads `snapshots` every `period` and reports degraded ICE on `tx`.
    /// Stops when the returned task is dropped or the session closes.
    pub fn spawn(
        generation: u64,
        snapshots: watch::Receiver<NegotiationSnapshot>,
        period: Duration,
        tx: mpsc::UnboundedSender<HealthSample>,
    ) -> PeriodicTask {
        debug!("Health monitor armed for media session {}", generation);
        PeriodicTask::spawn(period, move || {
            let ice_state = snapshots.borrow().ice_state;
            let tx = tx.clone();
            async move {
                if ice_state.is_degraded() {
                    warn!("Media session {} degraded: ICE {:?}", generation, ice_state);
                    let _ = tx.send(HealthSample { generation, ice_state });
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy,
    /// Tear down and rejoin; `attempt` counts from 1.
    Rejoin { attempt: u32 },
    /// A rejoin is already running.
    InFlight,
    GiveUp,
}

/// Keeps at most one rejoin running and caps consecutive attempts.
#[derive(Debug)]
pub struct HealthPolicy {
    max_attempts: u32,
    attempts: u32,
    in_flight: bool,
}

impl HealthPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            in_flight: false,
        }
    }

    pub fn assess(&mut self, ice_state: IceState) -> HealthVerdict {
        if ice_state.is_connected() {
            self.mark_connected();
            return HealthVerdict::Healthy;
        }
        if !ice_state.is_degraded() {
            return HealthVerdict::Healthy;
        }
        if self.in_flight {
            return HealthVerdict::InFlight;
        }
        if self.attempts >= self.max_attempts {
            return HealthVerdict::GiveUp;
        }
        self.attempts += 1;
        self.in_flight = true;
        HealthVerdict::Rejoin {
            attempt: self.attempts,
        }
    }

    /// The rejoin has produced a new media session (or failed).
    pub fn finish_rejoin(&mut self) {
        self.in_flight = false;
    }

    /// ICE reached connected; the attempt budget starts over.
    pub fn mark_connected(&mut self) {
        self.attempts = 0;
    }

    pub fn is_rejoining(&self) -> bool {
        self.in_flight
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SignalingState;

    #[test]
    fn only_one_rejoin_in_flight() {
        let mut policy = HealthPolicy::new(3);
        assert_eq!(policy.assess(IceState::Failed), HealthVerdict::Rejoin { attempt: 1 });
        assert_eq!(policy.assess(IceState::Failed), HealthVerdict::InFlight);
        assert_eq!(policy.assess(IceState::Disconnected), HealthVerdict::InFlight);
        assert!(policy.is_rejoining());

        policy.finish_rejoin();
        assert_eq!(policy.assess(IceState::Closed), HealthVerdict::Rejoin { attempt: 2 });
    }

    #[test]
    fn gives_up_after_budget() {
        let mut policy = HealthPolicy::new(2);
        for attempt in 1..=2 {
            assert_eq!(policy.assess(IceState::Failed), HealthVerdict::Rejoin { attempt });
            policy.finish_rejoin();
        }
        assert_eq!(policy.assess(IceState::Failed), HealthVerdict::GiveUp);
    }

    #[test]
    fn connected_resets_budget() {
        let mut policy = HealthPolicy::new(1);
        assert_eq!(policy.assess(IceState::Failed), HealthVerdict::Rejoin { attempt: 1 });
        policy.finish_rejoin();
        assert_eq!(policy.assess(IceState::Checking), HealthVerdict::Healthy);
        assert_eq!(policy.assess(IceState::Connected), HealthVerdict::Healthy);
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.assess(IceState::Failed), HealthVerdict::Rejoin { attempt: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_degraded_samples_until_dropped() {
        let (snapshot_tx, snapshot_rx) = watch::channel(NegotiationSnapshot {
            ice_state: IceState::Connected,
            signaling_state: SignalingState::Stable,
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let period = Duration::from_secs(30);
        let task = ConnectionHealthMonitor::spawn(4, snapshot_rx, period, tx);

        tokio::time::sleep(period + Duration::from_millis(1)).await;
        assert!(rx.try_recv().is_err());

        snapshot_tx.send_modify(|s| s.ice_state = IceState::Failed);
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample, HealthSample { generation: 4, ice_state: IceState::Failed });

        drop(task);
        tokio::time::sleep(period * 3).await;
        assert!(rx.try_recv().is_err());
    }
}
