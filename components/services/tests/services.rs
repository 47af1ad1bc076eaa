//! Every service against simulated firmware, on both transports

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bpmp_mailbox::{errno, MailboxConfig, MailboxError, Mrq};
use bpmp_mock::{MockBpmp, RemoteAction, SimSystem, TransportKind};
use bpmp_services::{
    ping, ping_atomic, query_abi, query_tag, read_trace, register_ping_responder, threaded_ping,
    trace_modify, FirmwareManager, ReattachPolicy, ServiceError,
};

fn config() -> MailboxConfig {
    MailboxConfig::default()
        .with_channel_timeout(Duration::from_millis(500))
        .with_handshake_timeout(Duration::from_millis(100))
}

fn start(kind: TransportKind, firmware: bpmp_mock::MockBuilder) -> SimSystem {
    SimSystem::start(kind, config(), firmware).unwrap()
}

#[test]
fn test_ping_in_every_discipline() {
    for kind in TransportKind::ALL {
        let system = start(kind, MockBpmp::builder());
        let rtt = ping(&system.mailbox).unwrap();
        assert!(rtt < Duration::from_millis(500), "{kind}");
        ping_atomic(&system.mailbox).unwrap();
        threaded_ping(&system.mailbox).unwrap();

        let stats = system.mailbox.stats();
        assert_eq!(stats.blocking_calls, 2);
        assert_eq!(stats.atomic_calls, 1);
    }
}

#[test]
fn test_wrong_pong_reported() {
    for kind in TransportKind::ALL {
        let firmware = MockBpmp::builder().handler(Mrq::PING, |_| RemoteAction::ok(&[0; 4]));
        let system = start(kind, firmware);
        assert!(matches!(
            ping(&system.mailbox),
            Err(ServiceError::UnexpectedReply { mrq: Mrq::PING, .. })
        ));
    }
}

#[test]
fn test_firmware_tag() {
    for kind in TransportKind::ALL {
        let system = start(kind, MockBpmp::builder().firmware_tag("r36.2-test"));
        assert_eq!(query_tag(&system.mailbox).unwrap(), "r36.2-test", "{kind}");
    }
}

#[test]
fn test_abi_query() {
    for kind in TransportKind::ALL {
        let firmware = MockBpmp::builder()
            .handler(Mrq(60), |_| RemoteAction::ok(&[]))
            .handler(Mrq::QUERY_ABI, |data| {
                if data[0] == 61 {
                    RemoteAction::error(-errno::EACCES)
                } else {
                    RemoteAction::error(-errno::ENODEV)
                }
            });
        let system = start(kind, firmware);
        assert_eq!(query_abi(&system.mailbox, Mrq(60)), Ok(false), "{kind}");
        assert_eq!(
            query_abi(&system.mailbox, Mrq(61)),
            Err(ServiceError::Mailbox(MailboxError::Remote {
                code: -errno::EACCES
            }))
        );

        system.bpmp.remove_handler(Mrq::QUERY_ABI);
        assert_eq!(query_abi(&system.mailbox, Mrq(60)), Ok(true));
        assert_eq!(query_abi(&system.mailbox, Mrq::QUERY_TAG), Ok(true));
        assert_eq!(query_abi(&system.mailbox, Mrq(99)), Ok(false));
    }
}

#[test]
fn test_trace_mask_and_buffer() {
    for kind in TransportKind::ALL {
        let log: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        let system = start(kind, MockBpmp::builder().trace_log(&log));

        assert_eq!(trace_modify(&system.mailbox, 0, 0b1010).unwrap(), 0b1010);
        assert_eq!(trace_modify(&system.mailbox, 0b0010, 0b0100).unwrap(), 0b1100);
        assert_eq!(system.bpmp.trace_mask(), 0b1100, "{kind}");

        assert_eq!(read_trace(&system.mailbox).unwrap(), log, "{kind}");
    }
}

#[test]
fn test_empty_trace() {
    let system = start(TransportKind::Raw, MockBpmp::builder());
    assert!(read_trace(&system.mailbox).unwrap().is_empty());
}

#[test]
fn test_trace_remote_error() {
    let firmware =
        MockBpmp::builder().handler(Mrq::WRITE_TRACE, |_| RemoteAction::error(-errno::EFAULT));
    let system = start(TransportKind::Ivc, firmware);
    assert_eq!(
        read_trace(&system.mailbox),
        Err(ServiceError::Mailbox(MailboxError::Remote {
            code: -errno::EFAULT
        }))
    );
}

#[test]
fn test_ping_responder_answers_firmware() {
    for kind in TransportKind::ALL {
        let system = start(kind, MockBpmp::builder());
        register_ping_responder(&system.mailbox).unwrap();
        let reply = system
            .bpmp
            .send_request(Mrq::PING, &33u32.to_le_bytes(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(reply.code, 0, "{kind}");
        assert_eq!(reply.read_u32(0), Some(66));

        assert!(matches!(
            register_ping_responder(&system.mailbox),
            Err(ServiceError::Mailbox(MailboxError::AlreadyRegistered { .. }))
        ));
    }
}

#[test]
fn test_reload_reattaches_and_notifies() {
    for kind in TransportKind::ALL {
        // Boot delay outlasts a single handshake attempt
        let firmware = MockBpmp::builder().boot_delay(Duration::from_millis(150));
        let system = Arc::new(SimSystem::assemble(kind, config(), firmware).unwrap());
        let resets = Arc::new(AtomicUsize::new(0));

        let target = system.clone();
        let manager = FirmwareManager::with_policy(
            system.mailbox.clone(),
            move || {
                target.bpmp.reset();
                Ok(())
            },
            ReattachPolicy {
                deadline: Duration::from_secs(5),
                interval: Duration::from_millis(20),
            },
        );
        assert!(manager.reattach_with_retry().unwrap() >= 2, "{kind}");
        let counter = resets.clone();
        manager.on_reset(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let attempts = manager.reload().unwrap();
        assert!(attempts >= 2, "{kind}: {attempts}");
        assert_eq!(resets.load(Ordering::SeqCst), 1);
        assert_eq!(system.bpmp.boot_count(), 2);
        ping(&system.mailbox).unwrap();
    }
}

#[test]
fn test_reload_gives_up_after_deadline() {
    for kind in TransportKind::ALL {
        let system = Arc::new(start(kind, MockBpmp::builder()));
        let target = system.clone();
        let manager = FirmwareManager::with_policy(
            system.mailbox.clone(),
            move || {
                target.bpmp.go_offline();
                Ok(())
            },
            ReattachPolicy {
                deadline: Duration::from_millis(300),
                interval: Duration::from_millis(50),
            },
        );
        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        manager.on_reset(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            manager.reload(),
            Err(ServiceError::ReattachFailed { .. })
        ));
        assert!(!system.mailbox.is_connected(), "{kind}");
        assert_eq!(notified.load(Ordering::SeqCst), 0);
    }
}

#[test]
fn test_loader_failure_leaves_mailbox_disconnected() {
    let system = start(TransportKind::Raw, MockBpmp::builder());
    let manager = FirmwareManager::new(system.mailbox.clone(), || {
        Err::<(), _>("image not found".to_string())
    });
    assert_eq!(
        manager.reload(),
        Err(ServiceError::Loader("image not found".into()))
    );
    assert_eq!(ping(&system.mailbox), Err(MailboxError::NotConnected.into()));
}
