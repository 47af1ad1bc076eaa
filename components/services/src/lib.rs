//! BPMP Services - Higher-level BPMP requests built on the mailbox
//!
//! # Purpose
//! Wraps well-known message types in typed calls so drivers never build
//! payloads by hand: liveness pings, firmware tag and ABI queries, trace
//! control, and firmware reload with a bounded reattach loop.
//!
//! # Integration Points
//! - Depends on: `bpmp-mailbox`
//! - Provides to: platform drivers, debug tooling, `bpmp-sim`
//! - IPC endpoints: PING, THREADED_PING, QUERY_TAG, QUERY_ABI,
//!   TRACE_MODIFY, WRITE_TRACE (outbound); PING (inbound responder)
//!
//! # Testing Strategy
//! - Unit tests: payload encoding and reply decoding
//! - Integration tests: every service against `bpmp-mock` on both transports

mod firmware;
mod loader;
mod ping;
mod trace;

pub use firmware::{query_abi, query_tag};
pub use loader::{FirmwareLoader, FirmwareManager, ReattachPolicy};
pub use ping::{ping, ping_atomic, register_ping_responder, threaded_ping};
pub use trace::{read_trace, trace_modify, MAX_TRACE_LEN};

use bpmp_mailbox::{MailboxError, Mrq};
use thiserror::Error;

/// Error types for service calls
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error("unexpected reply to {mrq}: {detail}")]
    UnexpectedReply { mrq: Mrq, detail: String },

    #[error("firmware did not come back after {attempts} reattach attempts")]
    ReattachFailed { attempts: u32 },

    #[error("firmware loader failed: {0}")]
    Loader(String),
}

pub type Result<T> = core::result::Result<T, ServiceError>;

/// Read a little-endian u32 from the start of `bytes`
fn le_u32(bytes: &[u8]) -> Option<u32> {
    let word = bytes.get(..4)?;
    Some(u32::from_le_bytes([word[0], word[1], word[2], word[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_u32() {
        assert_eq!(le_u32(&[1, 0, 0, 0, 9]), Some(1));
        assert_eq!(le_u32(&[1, 2]), None);
    }

    #[test]
    fn test_mailbox_errors_convert() {
        let err: ServiceError = MailboxError::NotConnected.into();
        assert_eq!(err.to_string(), "mailbox not connected");
    }
}
