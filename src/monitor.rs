use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::platform::MessageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Connected,
    Disconnected,
}

impl From<bool> for ConnectionState {
    fn from(connected: bool) -> Self {
        if connected {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }
}

/// Watches source liveness and logs changes. It never reconnects.
pub struct ConnectionMonitor {
    source: Arc<dyn MessageSource>,
    interval: Duration,
    state: ConnectionState,
}

impl ConnectionMonitor {
    pub fn new(source: Arc<dyn MessageSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            state: ConnectionState::Unknown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Record one sample. Returns the new state when it differs from a
    /// previously known one; the first sample only initializes.
    pub fn observe(&mut self, connected: bool) -> Option<ConnectionState> {
        let next = ConnectionState::from(connected);
        debug!("Connection status: {}", connected);

        match self.state {
            ConnectionState::Unknown => {
                debug!("Connection state initialized: {}", connected);
                self.state = next;
                None
            }
            current if current == next => None,
            _ => {
                match next {
                    ConnectionState::Connected => info!("Source connection restored"),
                    _ => warn!("Source connection lost"),
                }
                self.state = next;
                Some(next)
            }
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("Connection monitor started");

        loop {
            let connected = self.source.is_connected();
            self.observe(connected);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Connection monitor stopped (last state: {:?})", self.state());
    }
}
