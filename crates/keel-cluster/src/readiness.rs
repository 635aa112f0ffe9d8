use std::fmt;
use std::time::Duration;

use keel_types::KeelError;
use tokio::sync::watch;

/// `Joining → AwaitingMinimumMembers → AwaitingLeader → Ready`, then
/// `Stopped` once shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReadinessState {
    Joining,
    AwaitingMinimumMembers,
    AwaitingLeader,
    Ready,
    Stopped,
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReadinessState::Joining => "joining",
            ReadinessState::AwaitingMinimumMembers => "awaiting_minimum_members",
            ReadinessState::AwaitingLeader => "awaiting_leader",
            ReadinessState::Ready => "ready",
            ReadinessState::Stopped => "stopped",
        })
    }
}

pub struct Readiness {
    tx: watch::Sender<ReadinessState>,
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

impl Readiness {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ReadinessState::Joining);
        Readiness { tx }
    }

    pub fn state(&self) -> ReadinessState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: ReadinessState) {
        let prev = self.tx.send_replace(state);
        if prev != state {
            tracing::info!(from = %prev, to = %state, "readiness changed");
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    pub fn ensure_ready(&self) -> Result<(), KeelError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(KeelError::NotReady)
        }
    }

    /// Block until `Ready`. Fails with `Timeout` after `timeout` and with
    /// `NotReady` if the node stops first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), KeelError> {
        let mut rx = self.tx.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ReadinessState::Ready | ReadinessState::Stopped)),
        )
        .await;
        match waited {
            Err(_) => Err(KeelError::Timeout),
            Ok(Ok(state)) if *state == ReadinessState::Ready => Ok(()),
            Ok(_) => Err(KeelError::NotReady),
        }
    }
}
