//! Periodic re-reads with drift-free cadence.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::errors::UmdtError;
use crate::events::EventKind;

use super::{ModbusClient, ReadRequest, ValueView};

/// One successful monitor read.
#[derive(Debug, Clone)]
pub struct MonitorSample {
    pub timestamp: SystemTime,
    pub values: Vec<ValueView>,
}

/// Handle to a running monitor; dropping it stops the loop.
pub struct Monitor {
    rx: mpsc::Receiver<MonitorSample>,
    handle: JoinHandle<()>,
}

impl Monitor {
    /// Next sample, or `None` once the monitor stopped.
    pub async fn next(&mut self) -> Option<MonitorSample> {
        self.rx.recv().await
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl ModbusClient {
    /// Repeats `params` every `interval`.
    ///
    /// The ticker is anchored to the start time, so a slow cycle is followed
    /// by a shortened sleep and the mean cadence stays on the interval.
    /// Failures become error events and the loop keeps going; only a dead
    /// transport (or an unread backlog) ends the stream.
    pub fn monitor(self: &Arc<Self>, params: ReadRequest, interval: Duration) -> Monitor {
        let (tx, rx) = mpsc::channel(64);
        let client = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            loop {
                ticker.tick().await;
                match client.read(&params).await {
                    Ok(values) => {
                        let sample = MonitorSample {
                            timestamp: SystemTime::now(),
                            values,
                        };
                        if tx.send(sample).await.is_err() {
                            break;
                        }
                    }
                    Err(UmdtError::Transport(e)) if e.is_disconnect() => {
                        warn!("Monitor stopping: {}", e);
                        client.events().publish(EventKind::Error {
                            message: format!("monitor stopped: {}", e),
                            raw: None,
                        });
                        break;
                    }
                    Err(e) => {
                        client.events().publish(EventKind::Error {
                            message: format!("monitor read failed: {}", e),
                            raw: None,
                        });
                    }
                }
            }
        });

        Monitor { rx, handle }
    }
}
