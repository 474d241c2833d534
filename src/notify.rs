//! Cluster-wide notifications.
//!
//! Reconciliation outcomes are fanned out to peer nodes so a multi-node
//! cluster converges without every node redundantly processing the same
//! diff. Dispatch goes through a bounded channel: `notify` never blocks the
//! reconciler, and when the channel is full the notification is dropped with
//! a warning — peers converge on their own poll cycle regardless.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Capacity of the notification channel.
pub const NOTIFICATION_BUFFER_SIZE: usize = 64;

/// A typed notification published to peer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    /// Peers should apply the carried comma-joined change-key list locally.
    KeySpaceUpdate { payload: String },

    /// Peers should swap their node credential; payload is
    /// `"{old}.{new}:UserKeyReset"`.
    UserKeyReset { payload: String },

    /// The whole group must reload its configuration from the control plane.
    GroupReload,
}

impl Notification {
    /// Wire command name of this notification.
    pub fn command(&self) -> &'static str {
        match self {
            Notification::KeySpaceUpdate { .. } => "KeySpaceUpdateNotification",
            Notification::UserKeyReset { .. } => "UserKeyReset",
            Notification::GroupReload => "GroupReload",
        }
    }
}

/// Sending half of the cluster notification channel.
#[derive(Clone)]
pub struct ClusterNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ClusterNotifier {
    /// Create a notifier and the receiving half the embedder's transport
    /// drains.
    pub fn new() -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        (Self { sender }, receiver)
    }

    /// Queue a notification for delivery. Returns `false` when it was dropped
    /// (channel full or receiver gone).
    pub fn notify(&self, notification: Notification) -> bool {
        match self.sender.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    command = dropped.command(),
                    "notification channel full, dropping notification"
                );
                false
            }
            Err(TrySendError::Closed(dropped)) => {
                tracing::warn!(
                    command = dropped.command(),
                    "notification channel closed, dropping notification"
                );
                false
            }
        }
    }
}
