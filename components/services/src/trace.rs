//! Firmware trace mask and trace buffer retrieval

use bpmp_mailbox::{Mailbox, MailboxError, Mrq, MAX_PAYLOAD};

use crate::{le_u32, Result, ServiceError};

/// Upper bound on a retrieved trace; longer buffers are truncated
pub const MAX_TRACE_LEN: usize = 64 * 1024;

/// Clear then set bits in the firmware trace mask; returns the new mask
pub fn trace_modify(mailbox: &Mailbox, clear: u32, set: u32) -> Result<u32> {
    let mut request = [0u8; 8];
    request[..4].copy_from_slice(&clear.to_le_bytes());
    request[4..].copy_from_slice(&set.to_le_bytes());

    let mut reply = [0u8; 4];
    let code = mailbox.send_receive(Mrq::TRACE_MODIFY, &request, &mut reply)?;
    bpmp_mailbox::check_code(code)?;
    le_u32(&reply).ok_or(ServiceError::UnexpectedReply {
        mrq: Mrq::TRACE_MODIFY,
        detail: "short mask".into(),
    })
}

/// Pull the whole trace buffer, one frame-sized chunk per request
///
/// Each reply's code is the number of bytes in its chunk; zero ends the
/// buffer.
pub fn read_trace(mailbox: &Mailbox) -> Result<Vec<u8>> {
    let mut trace = Vec::new();
    let mut chunk = [0u8; MAX_PAYLOAD];

    while trace.len() < MAX_TRACE_LEN {
        let offset = trace.len() as u32;
        let code = mailbox.send_receive(Mrq::WRITE_TRACE, &offset.to_le_bytes(), &mut chunk)?;
        let len = match usize::try_from(code) {
            Ok(0) => break,
            Ok(len) if len <= MAX_PAYLOAD => len,
            Ok(len) => {
                return Err(ServiceError::UnexpectedReply {
                    mrq: Mrq::WRITE_TRACE,
                    detail: format!("chunk of {len} bytes"),
                })
            }
            Err(_) => return Err(MailboxError::Remote { code }.into()),
        };
        trace.extend_from_slice(&chunk[..len]);
    }

    if trace.len() >= MAX_TRACE_LEN {
        log::warn!("bpmp: trace truncated at {} bytes", MAX_TRACE_LEN);
        trace.truncate(MAX_TRACE_LEN);
    }
    Ok(trace)
}
