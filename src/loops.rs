//! Background loops keeping the control-plane link healthy and the local
//! state reconciled.
//!
//! Two independent tasks run for the lifetime of the node:
//!
//! 1. **Keepalive watcher**: a trivial write every 10 seconds, purely to
//!    detect a dead connection and re-login.
//! 2. **Keyspace poller**: checks for a pending full-reload instruction and
//!    otherwise fetches the keyspace diff, handing non-empty batches to the
//!    reconciler on their own task.
//!
//! Both tasks check a [`CancellationToken`] between operations and exit
//! promptly on shutdown; [`SyncLoops::shutdown`] waits a bounded time and
//! aborts stragglers. Dropping [`SyncLoops`] without an explicit shutdown
//! aborts the tasks immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, StorageError};
use crate::notify::Notification;
use crate::storage::RpcStorageHandler;
use crate::stores::StorageBackend;

/// Fixed keepalive cadence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Dummy key written by the keepalive probe.
const KEEPALIVE_KEY: &str = "0000";

/// Pause after a failed poll before the next attempt.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Maximum wait for a task to finish during shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the background tasks of one control-plane link.
pub struct SyncLoops {
    cancel_token: CancellationToken,
    keepalive_task: Option<JoinHandle<()>>,
    poller_task: Option<JoinHandle<()>>,
}

impl SyncLoops {
    /// Start the keepalive watcher and, unless keyspace sync is disabled,
    /// the keyspace poller.
    pub async fn spawn(handler: Arc<RpcStorageHandler>, org_id: impl Into<String>) -> Self {
        let org_id = org_id.into();
        let cancel_token = CancellationToken::new();

        let keepalive_cancel = cancel_token.child_token();
        let keepalive_handler = handler.clone();
        let keepalive_task = tokio::spawn(async move {
            keepalive_loop(keepalive_handler, keepalive_cancel).await;
        });

        let disable_sync = { handler.config.read().await.disable_keyspace_sync };
        let poller_task = if disable_sync {
            None
        } else {
            let poller_cancel = cancel_token.child_token();
            Some(tokio::spawn(async move {
                keyspace_poll_loop(handler, org_id, poller_cancel).await;
            }))
        };

        Self {
            cancel_token,
            keepalive_task: Some(keepalive_task),
            poller_task,
        }
    }

    /// Signal both loops and wait (bounded) for them to finish.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down sync loops");
        self.cancel_token.cancel();

        if let Some(task) = self.keepalive_task.take() {
            wait_for_task(task, "keepalive").await;
        }
        if let Some(task) = self.poller_task.take() {
            wait_for_task(task, "keyspace poller").await;
        }
    }
}

impl Drop for SyncLoops {
    fn drop(&mut self) {
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
        if let Some(task) = &self.poller_task {
            task.abort();
        }
    }
}

async fn wait_for_task(mut task: JoinHandle<()>, name: &str) {
    tokio::select! {
        result = &mut task => match result {
            Ok(()) => tracing::debug!(task = name, "task completed"),
            Err(err) => tracing::error!(task = name, error = %err, "task panicked"),
        },
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!(task = name, "task did not complete within timeout, aborting");
            task.abort();
        }
    }
}

/// Periodic no-op write to detect and recover connectivity.
async fn keepalive_loop(handler: Arc<RpcStorageHandler>, cancel: CancellationToken) {
    tracing::info!("starting keepalive watcher...");
    loop {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = handler.set_key(KEEPALIVE_KEY, KEEPALIVE_KEY, 10).await {
            tracing::warn!(error = %err, "can't connect to rpc layer");

            if err.is_retriable() && handler.connect().await {
                // reconnected; probe again without waiting out the interval
                continue;
            }
            if matches!(err, StorageError::Rpc(RpcError::ResponseTimeout)) {
                continue;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
        }
    }
}

/// Poll for keyspace changes, preferring a full group reload when the
/// control plane asks for one.
async fn keyspace_poll_loop(
    handler: Arc<RpcStorageHandler>,
    org_id: String,
    cancel: CancellationToken,
) {
    tracing::info!("starting keyspace poller");
    loop {
        if cancel.is_cancelled() {
            return;
        }

        // re-read every tick so a config change takes effect immediately
        let interval = {
            Duration::from_secs(handler.config.read().await.effective_sync_interval_secs())
        };

        match handler.check_for_reload(&org_id).await {
            Ok(true) => {
                // a full reload supersedes this tick's diff
                handler.notifier().notify(Notification::GroupReload);
            }
            Ok(false) => Arc::clone(&handler).check_for_keyspace_changes(&org_id).await,
            Err(_) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                }
                continue;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
