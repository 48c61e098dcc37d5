//! Room member handle
//!
//! A member is one authenticated connection inside one room. The registry only
//! ever holds the sending side of the member's outbound queue; the connection
//! handler's writer task owns the receiving side and the socket.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use uuid::Uuid;

use crate::auth::Identity;

/// Process-unique identifier of a member connection
pub type MemberId = Uuid;

/// Delivery to a single member failed
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerSendFailure {
    #[error("Outbound queue of member {0} is closed")]
    Closed(MemberId),

    #[error("Timed out delivering to member {0}")]
    TimedOut(MemberId),
}

/// A live connection registered in a room
#[derive(Debug, Clone)]
pub struct Member {
    id: MemberId,
    identity: Identity,
    outbound: mpsc::Sender<String>,
}

impl Member {
    /// Create a member with a fresh id
    pub fn new(identity: Identity, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            outbound,
        }
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a text frame for this member
    ///
    /// Waits at most `timeout` for space in the member's queue. The frame is
    /// dropped on failure; the member's own handler notices a dead socket and
    /// runs its leave path.
    pub async fn deliver(&self, text: String, timeout: Duration) -> Result<(), PeerSendFailure> {
        self.outbound
            .send_timeout(text, timeout)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Closed(_) => PeerSendFailure::Closed(self.id),
                SendTimeoutError::Timeout(_) => PeerSendFailure::TimedOut(self.id),
            })
    }
}
