//! The resources of one acquisition and how they are released.
//!
//! At most one browser session and one transcoder process are alive at any
//! time. Both live in an [`AcquisitionContext`] so an interrupt handler can
//! reach them and shut them down before the process exits.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::browser::{PageSession, Renderer};
use crate::error::{Error, Result};

/// How long [`AcquisitionContext::shutdown`] waits for a transcoder to exit.
pub const SUBPROCESS_GRACE: Duration = Duration::from_secs(5);

/// Tracks the one transcoder process that may be running.
#[derive(Debug, Default)]
pub struct SubprocessSlot {
    active: Mutex<Option<u32>>,
    released: Notify,
}

impl SubprocessSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a process as running until the returned lease is dropped.
    pub fn occupy(self: &Arc<Self>, pid: Option<u32>) -> SubprocessLease {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = active.replace(pid.unwrap_or_default()) {
            warn!("Subprocess {} still registered when starting another", previous);
        }
        SubprocessLease {
            slot: Arc::clone(self),
        }
    }

    /// The pid of the running process, if any.
    pub fn active(&self) -> Option<u32> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until no process is registered. Returns `false` on timeout.
    pub async fn wait_released(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            if self.active().is_none() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active().is_none();
            }
        }
    }

    fn release(&self) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.released.notify_waiters();
    }
}

/// Clears its [`SubprocessSlot`] when dropped.
#[derive(Debug)]
pub struct SubprocessLease {
    slot: Arc<SubprocessSlot>,
}

impl Drop for SubprocessLease {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// Owns the cancellation token, the browser session and the transcoder slot.
pub struct AcquisitionContext {
    cancel: CancellationToken,
    session: tokio::sync::Mutex<Option<Arc<dyn PageSession>>>,
    subprocess: Arc<SubprocessSlot>,
}

impl Default for AcquisitionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AcquisitionContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            session: tokio::sync::Mutex::new(None),
            subprocess: Arc::new(SubprocessSlot::new()),
        }
    }

    /// Fires when the acquisition is interrupted.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fails with [`Error::Cancelled`] once interrupted.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn subprocess_slot(&self) -> Arc<SubprocessSlot> {
        Arc::clone(&self.subprocess)
    }

    /// Opens a page with `renderer` and keeps it as the active session.
    ///
    /// A session that was still open is closed first.
    pub async fn open_session(&self, renderer: &dyn Renderer) -> Result<Arc<dyn PageSession>> {
        self.check()?;
        self.close_session().await;

        let session = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            session = renderer.open() => session?,
        };

        let mut slot = self.session.lock().await;
        if self.cancel.is_cancelled() {
            drop(slot);
            close_quietly(session.as_ref()).await;
            return Err(Error::Cancelled);
        }
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    pub async fn has_session(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Closes the active session, if any. Errors are logged.
    pub async fn close_session(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            close_quietly(session.as_ref()).await;
        }
    }

    /// Interrupts everything: cancels, waits for the transcoder to be killed,
    /// then closes the browser session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if !self.subprocess.wait_released(SUBPROCESS_GRACE).await {
            warn!(
                "Transcoder {:?} did not exit within {:?}",
                self.subprocess.active(),
                SUBPROCESS_GRACE
            );
        }
        self.close_session().await;
        debug!("Acquisition context shut down");
    }
}

async fn close_quietly(session: &dyn PageSession) {
    if let Err(e) = session.close().await {
        warn!("Failed to close browser session: {}", e);
    }
}
