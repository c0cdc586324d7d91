use super::Result;

use eyre::WrapErr;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// SIGINT and SIGTERM as one stream of interrupts.
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
}

impl Signals {
    pub fn new() -> Result<Self> {
        Ok(Signals {
            interrupt: signal(SignalKind::interrupt()).wrap_err("can't install SIGINT handler")?,
            terminate: signal(SignalKind::terminate()).wrap_err("can't install SIGTERM handler")?,
        })
    }

    /// Waits for the next interrupt, returning its name.
    pub async fn next(&mut self) -> Option<&'static str> {
        tokio::select! {
            received = self.interrupt.recv() => received.map(|_| "SIGINT"),
            received = self.terminate.recv() => received.map(|_| "SIGTERM"),
        }
    }

    /// Cancels `token` on the first interrupt.
    pub fn cancel_on_interrupt(mut self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::select! {
                received = self.next() => {
                    if let Some(name) = received {
                        info!("Received {}, cancelling", name);
                        token.cancel();
                    }
                }
                _ = token.cancelled() => {}
            }
        })
    }
}
