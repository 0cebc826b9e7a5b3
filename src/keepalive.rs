use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::hub::HubConnectionManager;
use crate::protocol::HubCommand;
use crate::timer::PeriodicTask;

/// Asks the controller to re-establish signaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectRequest {
    pub session_id: i64,
}

/// A running keepalive for one media session token.
pub struct KeepAliveTicket {
    session_id: i64,
    _task: PeriodicTask,
}

impl KeepAliveTicket {
    pub fn session_id(&self) -> i64 {
        self.session_id
    }
}

pub struct KeepAliveScheduler;

impl KeepAliveScheduler {
    /// Pings `keepAlive(session_id)` every `period` while the hub is
    /// connected. A failure while the hub is down sends one
    /// [`ReconnectRequest`]; another is only sent after a ping succeeds.
    pub fn spawn(
        hub: HubConnectionManager,
        session_id: i64,
        period: Duration,
        reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    ) -> KeepAliveTicket {
        let requested = Arc::new(AtomicBool::new(false));
        let task = PeriodicTask::spawn(period, move || {
            let hub = hub.clone();
            let reconnect_tx = reconnect_tx.clone();
            let requested = requested.clone();
            async move {
                if !hub.is_connected() {
                    debug!("Skipping keepalive for {}: hub {}", session_id, hub.state());
                    return;
                }
                match hub.send(&HubCommand::KeepAlive { session_id }).await {
                    Ok(_) => {
                        requested.store(false, Ordering::SeqCst);
                        debug!("Keepalive sent for {}", session_id);
                    }
                    Err(e) => {
                        warn!("Keepalive for {} failed: {}", session_id, e);
                        if !hub.is_connected() && !requested.swap(true, Ordering::SeqCst) {
                            let _ = reconnect_tx.send(ReconnectRequest { session_id });
                        }
                    }
                }
            }
        });
        KeepAliveTicket {
            session_id,
            _task: task,
        }
    }
}
