//! Firmware identity and capability queries

use bpmp_mailbox::{check_code, errno, Mailbox, MailboxError, Mrq};

use crate::Result;

/// Maximum length of the firmware tag
pub const TAG_LEN: usize = 32;

/// Firmware build tag, NUL padding stripped
pub fn query_tag(mailbox: &Mailbox) -> Result<String> {
    let mut reply = [0u8; TAG_LEN];
    let code = mailbox.send_receive(Mrq::QUERY_TAG, &[], &mut reply)?;
    check_code(code)?;
    Ok(decode_tag(&reply))
}

fn decode_tag(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Whether the firmware implements `mrq`
///
/// # Errors
/// Any remote error other than "no such MRQ" is reported as `Remote`
pub fn query_abi(mailbox: &Mailbox, mrq: Mrq) -> Result<bool> {
    let mut reply = [0u8; 0];
    let code = mailbox.send_receive(Mrq::QUERY_ABI, &mrq.id().to_le_bytes(), &mut reply)?;
    match code {
        0 => Ok(true),
        c if c == -errno::ENODEV => Ok(false),
        code => Err(MailboxError::Remote { code }.into()),
    }
}
