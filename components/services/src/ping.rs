//! Liveness pings in each call discipline, plus the inbound responder

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bpmp_mailbox::{check_code, InboundRequest, IrqGuard, Mailbox, Mrq, Responder};

use crate::{le_u32, Result, ServiceError};

static CHALLENGE: AtomicU32 = AtomicU32::new(1);

fn next_challenge() -> u32 {
    CHALLENGE.fetch_add(1, Ordering::Relaxed)
}

fn check_pong(mrq: Mrq, challenge: u32, code: i32, reply: &[u8]) -> Result<()> {
    check_code(code)?;
    let expected = challenge.wrapping_mul(2);
    match le_u32(reply) {
        Some(value) if value == expected => Ok(()),
        other => Err(ServiceError::UnexpectedReply {
            mrq,
            detail: format!("expected {expected}, got {other:?}"),
        }),
    }
}

/// Blocking ping; returns the round-trip time
pub fn ping(mailbox: &Mailbox) -> Result<Duration> {
    let challenge = next_challenge();
    let mut reply = [0u8; 4];
    let started = Instant::now();
    let code = mailbox.send_receive(Mrq::PING, &challenge.to_le_bytes(), &mut reply)?;
    let elapsed = started.elapsed();
    check_pong(Mrq::PING, challenge, code, &reply)?;
    log::debug!("bpmp: ping {} answered in {:?}", challenge, elapsed);
    Ok(elapsed)
}

/// Ping with interrupts masked, spinning for the reply
pub fn ping_atomic(mailbox: &Mailbox) -> Result<Duration> {
    let challenge = next_challenge();
    let mut reply = [0u8; 4];
    let started = Instant::now();
    let code = {
        let _irq = IrqGuard::new(mailbox.cpu());
        mailbox.send_receive_atomic(Mrq::PING, &challenge.to_le_bytes(), &mut reply)?
    };
    let elapsed = started.elapsed();
    check_pong(Mrq::PING, challenge, code, &reply)?;
    Ok(elapsed)
}

/// Ping served by a firmware thread rather than its interrupt handler
pub fn threaded_ping(mailbox: &Mailbox) -> Result<Duration> {
    let challenge = next_challenge();
    let mut reply = [0u8; 4];
    let started = Instant::now();
    let code = mailbox.send_receive(Mrq::THREADED_PING, &challenge.to_le_bytes(), &mut reply)?;
    let elapsed = started.elapsed();
    check_pong(Mrq::THREADED_PING, challenge, code, &reply)?;
    Ok(elapsed)
}

/// Answer firmware-initiated pings with twice the challenge
pub fn register_ping_responder(mailbox: &Mailbox) -> Result<()> {
    mailbox.register_handler(Mrq::PING, |req: &InboundRequest, resp: Responder<'_>| {
        let challenge = req.read_u32(0).unwrap_or(0);
        if let Err(err) = resp.reply(0, &challenge.wrapping_mul(2).to_le_bytes()) {
            log::warn!("bpmp: ping reply failed: {}", err);
        }
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmp_mailbox::{errno, MailboxError};

    #[test]
    fn test_check_pong() {
        assert!(check_pong(Mrq::PING, 21, 0, &42u32.to_le_bytes()).is_ok());
        assert!(matches!(
            check_pong(Mrq::PING, 21, 0, &41u32.to_le_bytes()),
            Err(ServiceError::UnexpectedReply { .. })
        ));
        assert_eq!(
            check_pong(Mrq::PING, 21, -errno::EBUSY, &[]),
            Err(ServiceError::Mailbox(MailboxError::Remote {
                code: -errno::EBUSY
            }))
        );
    }

    #[test]
    fn test_challenges_differ() {
        assert_ne!(next_challenge(), next_challenge());
    }
}
