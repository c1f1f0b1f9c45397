use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::{debug, trace, warn};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::domain::TransactionDomain;
use crate::errors::{Result, TxError};

/// Commands sent to the scanner thread.
enum ScannerCommand {
    Shutdown,
}

/// Background thread rolling back transactions past their deadline.
pub struct TimeoutScanner {
    sender: Sender<ScannerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutScanner {
    /// Starts scanning `domain` every `interval`. The thread exits on
    /// [`TimeoutScanner::stop`] or once the domain is dropped.
    pub fn start(name: &str, interval: Duration, domain: Weak<TransactionDomain>) -> Result<Self> {
        let (sender, receiver) = bounded::<ScannerCommand>(1);
        let handle = thread::Builder::new()
            .name(format!("maat-timer-{}", name))
            .spawn(move || {
                loop {
                    match receiver.recv_timeout(interval) {
                        Ok(ScannerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    let Some(domain) = domain.upgrade() else {
                        break;
                    };
                    let expired = domain.expire_overdue();
                    if expired > 0 {
                        debug!("Timed out {} transactions in {}", expired, domain.name());
                    } else {
                        trace!("No overdue transactions in {}", domain.name());
                    }
                }
            })
            .map_err(|err| TxError::System(format!("failed to start timeout scanner: {}", err)))?;
        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        let _ = self.sender.try_send(ScannerCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            // The last domain reference may be released by the scanner itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Timeout scanner thread panicked");
            }
        }
    }
}

impl Drop for TimeoutScanner {
    fn drop(&mut self) {
        self.stop();
    }
}
