//! Digital-twin safety handshake.
//!
//! An external observer checks every simulated motion and publishes a verdict:
//!
//! ```text
//!   -1 ABORT     motion is unsafe, stop the run
//!    0 HOLD      twin still moving, keep waiting
//!    1 CONTINUE  motion verified
//! ```
//!
//! The latest verdict lives in a `tokio::sync::watch` channel. The observer side
//! holds a cloneable [`SafetyPublisher`]; the executor owns the single
//! [`SafetySynchronizer`], which latches HOLD before each twin action and then
//! waits for the verdict to move off HOLD.

use crate::config::SafetyConfig;
use crate::error::{AppResult, EchemError};
use crate::hardware::capabilities::TwinDevice;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Verdict of the safety observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SafetyState {
    /// Unsafe motion; terminal for the current run
    Abort,
    /// No verdict yet
    Hold,
    /// Motion verified
    Continue,
}

impl SafetyState {
    /// Wire value used on the observer's status topic.
    pub fn as_i8(self) -> i8 {
        match self {
            SafetyState::Abort => -1,
            SafetyState::Hold => 0,
            SafetyState::Continue => 1,
        }
    }
}

impl TryFrom<i8> for SafetyState {
    type Error = EchemError;

    fn try_from(raw: i8) -> Result<Self, Self::Error> {
        match raw {
            -1 => Ok(SafetyState::Abort),
            0 => Ok(SafetyState::Hold),
            1 => Ok(SafetyState::Continue),
            other => Err(EchemError::parse(
                "safety_state",
                format!("expected -1, 0 or 1, got {other}"),
            )),
        }
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SafetyState::Abort => "ABORT",
            SafetyState::Hold => "HOLD",
            SafetyState::Continue => "CONTINUE",
        };
        f.write_str(name)
    }
}

/// Creates a connected publisher/synchronizer pair, initialised to HOLD.
pub fn safety_channel() -> (SafetyPublisher, SafetySynchronizer) {
    let (tx, rx) = watch::channel(SafetyState::Hold);
    let tx = Arc::new(tx);
    let publisher = SafetyPublisher {
        tx: Arc::clone(&tx),
    };
    let synchronizer = SafetySynchronizer {
        tx,
        rx,
        poll_interval: Duration::from_millis(100),
        timeout: None,
    };
    (publisher, synchronizer)
}

/// Observer side of the safety channel.
#[derive(Clone)]
pub struct SafetyPublisher {
    tx: Arc<watch::Sender<SafetyState>>,
}

impl SafetyPublisher {
    /// Replaces the current verdict.
    pub fn publish(&self, state: SafetyState) {
        debug!(%state, "Safety verdict published");
        self.tx.send_replace(state);
    }

    /// Publishes a raw status value as sent by the observer.
    pub fn publish_raw(&self, raw: i8) -> AppResult<()> {
        self.publish(SafetyState::try_from(raw)?);
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn current(&self) -> SafetyState {
        *self.tx.borrow()
    }
}

/// Executor side of the safety channel.
pub struct SafetySynchronizer {
    tx: Arc<watch::Sender<SafetyState>>,
    rx: watch::Receiver<SafetyState>,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl SafetySynchronizer {
    /// Applies poll interval and timeout from the safety settings.
    pub fn configure(mut self, config: &SafetyConfig) -> Self {
        self.poll_interval = config.poll_interval();
        self.timeout = config.timeout();
        self
    }

    #[allow(missing_docs)]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// `None` waits for a verdict indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Latest verdict.
    pub fn state(&self) -> SafetyState {
        *self.rx.borrow()
    }

    /// Latches HOLD ahead of a twin action.
    ///
    /// Must run before the twin is told to move so that a verdict arriving
    /// during the publish is not overwritten.
    pub fn hold(&mut self) {
        self.tx.send_replace(SafetyState::Hold);
        self.rx.borrow_and_update();
    }

    /// Waits until the observer leaves HOLD.
    ///
    /// CONTINUE returns `Ok`. ABORT, the configured timeout and cancellation
    /// all end the wait with an error.
    pub async fn await_verdict(
        &mut self,
        device: TwinDevice,
        cancel: &CancellationToken,
    ) -> AppResult<()> {
        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let state = *self.rx.borrow_and_update();
            match state {
                SafetyState::Continue => {
                    info!(?device, "Digital twin motion verified");
                    return Ok(());
                }
                SafetyState::Abort => {
                    error!(?device, "Digital twin reported UNSAFE motion");
                    return Err(EchemError::SafetyAbort(format!(
                        "{device:?} motion rejected by safety observer"
                    )));
                }
                SafetyState::Hold => debug!(?device, "Digital twin moving"),
            }

            if cancel.is_cancelled() {
                return Err(EchemError::Cancelled);
            }
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        error!(?device, timeout = ?self.timeout, "No safety verdict before timeout");
                        return Err(EchemError::SafetyTimeout(
                            self.timeout.unwrap_or_default(),
                        ));
                    }
                    self.poll_interval.min(remaining)
                }
                None => self.poll_interval,
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(EchemError::Cancelled),
                _ = tokio::time::timeout(wait, self.rx.changed()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(sync: SafetySynchronizer) -> SafetySynchronizer {
        sync.with_poll_interval(Duration::from_millis(10))
    }

    #[test]
    fn test_wire_values() {
        for state in [SafetyState::Abort, SafetyState::Hold, SafetyState::Continue] {
            assert_eq!(SafetyState::try_from(state.as_i8()).unwrap(), state);
        }
        assert!(SafetyState::try_from(2).is_err());
    }

    #[tokio::test]
    async fn test_starts_on_hold() {
        let (publisher, sync) = safety_channel();
        assert_eq!(sync.state(), SafetyState::Hold);
        assert_eq!(publisher.current(), SafetyState::Hold);
    }

    #[tokio::test]
    async fn test_continue_resolves() {
        let (publisher, sync) = safety_channel();
        let mut sync = fast(sync);
        sync.hold();
        let observer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            publisher.publish(SafetyState::Continue);
        });
        sync.await_verdict(TwinDevice::Robot, &CancellationToken::new())
            .await
            .unwrap();
        observer.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_is_terminal() {
        let (publisher, sync) = safety_channel();
        let mut sync = fast(sync);
        sync.hold();
        publisher.publish_raw(-1).unwrap();
        let err = sync
            .await_verdict(TwinDevice::Arm, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EchemError::SafetyAbort(_)));
    }

    #[tokio::test]
    async fn test_hold_overrides_stale_verdict() {
        let (publisher, sync) = safety_channel();
        let mut sync = fast(sync).with_timeout(Some(Duration::from_millis(40)));
        publisher.publish(SafetyState::Continue);
        sync.hold();
        assert_eq!(sync.state(), SafetyState::Hold);
        let err = sync
            .await_verdict(TwinDevice::Robot, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EchemError::SafetyTimeout(d) if d == Duration::from_millis(40)));
    }

    #[tokio::test]
    async fn test_cancellation_stops_wait() {
        let (_publisher, sync) = safety_channel();
        let mut sync = fast(sync);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = sync
            .await_verdict(TwinDevice::Robot, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EchemError::Cancelled));
    }
}
