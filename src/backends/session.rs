//! Device session lifecycle shared by every technique backend.
//!
//! ```text
//! Unconnected --connect--> Connected --disconnect--> Disconnected
//!                              |  ^                      |
//!                              +--+ measure              +--connect--> Connected
//! ```
//!
//! `disconnect` is idempotent from any state.

use crate::error::{AppResult, EchemError};
use crate::error_recovery::{retry_with_policy, RetryPolicy};
use crate::hardware::capabilities::PeripheralBoard;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Link to the instruments a backend measures with.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Opens the device links.
    async fn connect(&self) -> AppResult<()>;

    /// Closes the device links.
    async fn disconnect(&self) -> AppResult<()>;

    /// Peripheral board reachable through this connection, if any.
    fn board(&self) -> Option<Arc<dyn PeripheralBoard>>;
}

/// Where a session is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum SessionState {
    Unconnected,
    Connected,
    Disconnected,
}

/// Owns the connection state for one backend instance.
pub struct DeviceSession {
    connector: Arc<dyn DeviceConnector>,
    retry: RetryPolicy,
    state: SessionState,
}

impl DeviceSession {
    #[allow(missing_docs)]
    pub fn new(connector: Arc<dyn DeviceConnector>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            retry,
            state: SessionState::Unconnected,
        }
    }

    #[allow(missing_docs)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[allow(missing_docs)]
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Connects unless already connected, retrying per the session policy.
    pub async fn connect(&mut self) -> AppResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        let connector = Arc::clone(&self.connector);
        retry_with_policy("device connection", &self.retry, || {
            let connector = Arc::clone(&connector);
            async move { connector.connect().await }
        })
        .await?;
        self.state = SessionState::Connected;
        info!("Devices connected");
        Ok(())
    }

    /// Closes the links if open. Errors are logged; the session always ends
    /// up `Disconnected`.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Connected {
            match self.connector.disconnect().await {
                Ok(()) => info!("Devices disconnected"),
                Err(err) => error!(error = %err, "Error disconnecting devices"),
            }
        }
        self.state = SessionState::Disconnected;
    }

    /// Fails with a `Connection` error unless connected.
    pub fn ensure_connected(&self) -> AppResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(EchemError::Connection(format!(
                "devices are {:?}, not connected",
                self.state
            )))
        }
    }

    /// Peripheral board of the connected devices.
    pub fn board(&self) -> Option<Arc<dyn PeripheralBoard>> {
        if self.is_connected() {
            self.connector.board()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedBench;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let bench = Arc::new(SimulatedBench::new());
        let mut session = DeviceSession::new(bench.clone(), fast_retry());
        assert_eq!(session.state(), SessionState::Unconnected);
        assert!(session.ensure_connected().is_err());
        assert!(session.board().is_none());

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.board().is_some());

        session.connect().await.unwrap();
        assert_eq!(bench.connect_count(), 1);

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_harmless() {
        let bench = Arc::new(SimulatedBench::new());
        let mut session = DeviceSession::new(bench.clone(), fast_retry());
        session.connect().await.unwrap();
        session.disconnect().await;
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(bench.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_failure_after_retries() {
        let bench = Arc::new(SimulatedBench::unreachable());
        let mut session = DeviceSession::new(bench.clone(), fast_retry());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, EchemError::Connection(_)));
        assert_eq!(bench.connect_count(), 2);
        assert_eq!(session.state(), SessionState::Unconnected);
    }
}
