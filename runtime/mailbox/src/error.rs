//! Mailbox error taxonomy

use core::fmt;

use bpmp_ipc::IpcError;
use thiserror::Error;

use crate::mrq::{errno, Mrq};

/// What a bounded wait was waiting for when it gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// Outbound channel to become free
    FreeChannel,
    /// Remote acknowledgement on a spinning call
    Ack,
    /// Slot in the thread-channel pool
    PoolSlot,
    /// Completion signalled from the doorbell interrupt
    Completion,
    /// Remote side of the initial handshake
    Handshake,
}

impl fmt::Display for WaitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            WaitPhase::FreeChannel => "a free channel",
            WaitPhase::Ack => "the remote ack",
            WaitPhase::PoolSlot => "a thread channel",
            WaitPhase::Completion => "request completion",
            WaitPhase::Handshake => "the handshake",
        };
        f.write_str(what)
    }
}

/// Error types for mailbox operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    #[error("mailbox not connected")]
    NotConnected,

    #[error("remote never became ready")]
    NotReady,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("timed out waiting for {0}")]
    Timeout(WaitPhase),

    #[error("channel {channel} bookkeeping disagrees with transport state")]
    ConsistencyFault { channel: usize },

    #[error("no free slot")]
    ResourceExhausted,

    #[error("remote reported error {code}")]
    Remote { code: i32 },

    #[error("{mrq} already has a handler")]
    AlreadyRegistered { mrq: Mrq },

    #[error("{mrq} has no handler")]
    NotRegistered { mrq: Mrq },

    #[error("module {base:#x} already has a mail handler")]
    ModuleAlreadyRegistered { base: u32 },

    #[error("module {base:#x} has no mail handler")]
    ModuleNotRegistered { base: u32 },

    #[error("operation not allowed from a dispatch handler")]
    Reentrant,

    #[error("CPU {cpu} has no synchronous channel")]
    CpuOutOfRange { cpu: usize },

    #[error("no transport for compatible {0:?}")]
    UnsupportedTransport(String),

    #[error("shared memory: {0}")]
    Ipc(IpcError),
}

impl MailboxError {
    /// Negative BPMP error code for this error
    pub fn errno(&self) -> i32 {
        match self {
            MailboxError::NotConnected | MailboxError::NotReady => -errno::ENODEV,
            MailboxError::InvalidArgument(_) | MailboxError::CpuOutOfRange { .. } => {
                -errno::EINVAL
            }
            MailboxError::Timeout(_) => -errno::ETIMEDOUT,
            MailboxError::ConsistencyFault { .. } | MailboxError::Ipc(_) => -errno::EFAULT,
            MailboxError::ResourceExhausted => -errno::ENOMEM,
            MailboxError::Remote { code } => *code,
            MailboxError::AlreadyRegistered { .. }
            | MailboxError::ModuleAlreadyRegistered { .. }
            | MailboxError::Reentrant => -errno::EBUSY,
            MailboxError::NotRegistered { .. } | MailboxError::ModuleNotRegistered { .. } => {
                -errno::ENOENT
            }
            MailboxError::UnsupportedTransport(_) => -errno::ENODEV,
        }
    }
}

impl From<IpcError> for MailboxError {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::PayloadTooLarge { .. } => {
                MailboxError::InvalidArgument("payload exceeds frame size")
            }
            other => MailboxError::Ipc(other),
        }
    }
}

pub type Result<T> = core::result::Result<T, MailboxError>;

/// Split a reply code into success value and remote error
///
/// Round trips return the remote's code verbatim; callers that treat a
/// negative code as failure use this.
pub fn check_code(code: i32) -> Result<i32> {
    if code < 0 {
        Err(MailboxError::Remote { code })
    } else {
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_code() {
        assert_eq!(check_code(0), Ok(0));
        assert_eq!(check_code(7), Ok(7));
        assert_eq!(check_code(-19), Err(MailboxError::Remote { code: -19 }));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(MailboxError::NotConnected.errno(), -errno::ENODEV);
        assert_eq!(MailboxError::Timeout(WaitPhase::Ack).errno(), -errno::ETIMEDOUT);
        assert_eq!(MailboxError::Remote { code: -3 }.errno(), -3);
    }

    #[test]
    fn test_payload_error_maps_to_invalid_argument() {
        let err: MailboxError = IpcError::PayloadTooLarge { len: 121 }.into();
        assert!(matches!(err, MailboxError::InvalidArgument(_)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            MailboxError::Timeout(WaitPhase::PoolSlot).to_string(),
            "timed out waiting for a thread channel"
        );
    }
}
