//! Operator interrupts: "stop after the current substrate" versus "abort now".

use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

/// Escalation level of an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Interrupt {
    None,
    /// Finish the substrate in flight, start no more
    Stop,
    /// Kill the substrate in flight and restore its output
    Abort,
}

/// Shared, cloneable interrupt state.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<Interrupt>>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Interrupt::None);
        Self { tx: Arc::new(tx) }
    }

    pub fn level(&self) -> Interrupt {
        *self.tx.borrow()
    }

    fn raise(&self, to: Interrupt) {
        self.tx.send_if_modified(|level| {
            if *level < to {
                *level = to;
                true
            } else {
                false
            }
        });
    }

    pub fn request_stop(&self) {
        self.raise(Interrupt::Stop);
    }

    pub fn request_abort(&self) {
        self.raise(Interrupt::Abort);
    }

    /// One step up: none to stop, stop to abort. Returns the new level.
    pub fn escalate(&self) -> Interrupt {
        let next = match self.level() {
            Interrupt::None => Interrupt::Stop,
            Interrupt::Stop | Interrupt::Abort => Interrupt::Abort,
        };
        self.raise(next);
        self.level()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.level() >= Interrupt::Stop
    }

    pub fn is_aborted(&self) -> bool {
        self.level() == Interrupt::Abort
    }

    /// Resolve once an abort has been requested.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on abort.
        let _ = rx.wait_for(|level| *level == Interrupt::Abort).await;
    }

    /// Escalate on every Ctrl-C until aborted.
    pub fn listen_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                match signal.escalate() {
                    Interrupt::Stop => {
                        warn!("interrupt: stopping after the current substrate (Ctrl-C again to abort)")
                    }
                    _ => {
                        warn!("interrupt: aborting");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_goes_stop_then_abort() {
        let signal = StopSignal::new();
        assert_eq!(signal.level(), Interrupt::None);
        assert_eq!(signal.escalate(), Interrupt::Stop);
        assert!(signal.is_stop_requested());
        assert!(!signal.is_aborted());
        assert_eq!(signal.escalate(), Interrupt::Abort);
        assert_eq!(signal.escalate(), Interrupt::Abort);
    }

    #[test]
    fn stop_never_lowers_abort() {
        let signal = StopSignal::new();
        signal.request_abort();
        signal.request_stop();
        assert!(signal.is_aborted());
    }

    #[tokio::test]
    async fn aborted_wakes_waiters() {
        let signal = StopSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.aborted().await })
        };
        signal.request_stop();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        signal.request_abort();
        waiter.await.unwrap();
    }
}
