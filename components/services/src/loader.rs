//! Firmware reload and the bounded reattach loop
//!
//! The mailbox never retries on its own. Reloading firmware is the one
//! place a retry loop exists: after the loader hands back a fresh remote,
//! the manager polls `Mailbox::reattach` until the handshake succeeds or
//! the policy deadline passes, then tells every registered listener.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bpmp_mailbox::{Mailbox, MailboxError};

use crate::{Result, ServiceError};

/// Loads (or resets) the remote firmware image
pub trait FirmwareLoader: Send + Sync {
    fn reload(&self) -> core::result::Result<(), String>;
}

impl<F> FirmwareLoader for F
where
    F: Fn() -> core::result::Result<(), String> + Send + Sync,
{
    fn reload(&self) -> core::result::Result<(), String> {
        self()
    }
}

/// How long, and how often, to retry the handshake after a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReattachPolicy {
    pub deadline: Duration,
    pub interval: Duration,
}

impl Default for ReattachPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            interval: Duration::from_millis(500),
        }
    }
}

type ResetNotifier = Arc<dyn Fn() + Send + Sync>;

/// Owns the reload sequence for one mailbox
pub struct FirmwareManager {
    mailbox: Arc<Mailbox>,
    loader: Box<dyn FirmwareLoader>,
    policy: ReattachPolicy,
    notifiers: spin::Mutex<Vec<ResetNotifier>>,
}

impl FirmwareManager {
    pub fn new(mailbox: Arc<Mailbox>, loader: impl FirmwareLoader + 'static) -> Self {
        Self::with_policy(mailbox, loader, ReattachPolicy::default())
    }

    pub fn with_policy(
        mailbox: Arc<Mailbox>,
        loader: impl FirmwareLoader + 'static,
        policy: ReattachPolicy,
    ) -> Self {
        Self {
            mailbox,
            loader: Box::new(loader),
            policy,
            notifiers: spin::Mutex::new(Vec::new()),
        }
    }

    pub fn policy(&self) -> ReattachPolicy {
        self.policy
    }

    /// Run `notify` after every successful reload
    pub fn on_reset<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.notifiers.lock().push(Arc::new(notify));
    }

    /// Disconnect, reload the firmware and reattach
    ///
    /// Returns the number of handshake attempts it took.
    ///
    /// # Errors
    /// `Loader` if the image could not be loaded, `ReattachFailed` if the
    /// remote never answered within the policy deadline
    pub fn reload(&self) -> Result<u32> {
        self.mailbox.disconnect();
        self.loader.reload().map_err(ServiceError::Loader)?;
        log::info!("bpmp: firmware reloaded, reattaching");

        let attempts = self.reattach_with_retry()?;

        // Listeners may register more listeners; call them unlocked
        let notifiers: Vec<ResetNotifier> = self.notifiers.lock().clone();
        for notify in notifiers {
            notify();
        }
        Ok(attempts)
    }

    /// Poll `reattach` at the policy interval until it succeeds
    pub fn reattach_with_retry(&self) -> Result<u32> {
        let deadline = Instant::now() + self.policy.deadline;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.mailbox.reattach() {
                Ok(()) => return Ok(attempts),
                Err(MailboxError::NotReady) | Err(MailboxError::Timeout(_)) => {
                    log::warn!("bpmp: reattach attempt {} failed", attempts);
                }
                Err(err) => return Err(err.into()),
            }
            if Instant::now() + self.policy.interval > deadline {
                log::error!("bpmp: firmware unresponsive after {} attempts", attempts);
                return Err(ServiceError::ReattachFailed { attempts });
            }
            std::thread::sleep(self.policy.interval);
        }
    }
}
