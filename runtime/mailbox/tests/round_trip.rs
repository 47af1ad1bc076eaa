//! Outbound call disciplines against simulated firmware, on both transports

use std::sync::Arc;
use std::time::{Duration, Instant};

use bpmp_mailbox::{HostCpu, IrqGuard, MailboxConfig, MailboxError, Mrq, MAX_PAYLOAD};
use bpmp_mock::{MockBpmp, RemoteAction, SimSystem, TransportKind};

fn config() -> MailboxConfig {
    MailboxConfig::default()
        .with_channel_timeout(Duration::from_millis(500))
        .with_handshake_timeout(Duration::from_secs(2))
}

fn start(kind: TransportKind) -> SimSystem {
    SimSystem::start(kind, config(), MockBpmp::builder()).unwrap()
}

fn ping(system: &SimSystem, value: u32) -> u32 {
    let mut out = [0u8; 4];
    let code = system
        .mailbox
        .send_receive(Mrq::PING, &value.to_le_bytes(), &mut out)
        .unwrap();
    assert_eq!(code, 0);
    u32::from_le_bytes(out)
}

#[test]
fn test_blocking_ping_doubles_value() {
    for kind in TransportKind::ALL {
        let system = start(kind);
        let started = Instant::now();
        assert_eq!(ping(&system, 21), 42, "{kind}");
        assert!(started.elapsed() < config().timeouts.channel);
        assert_eq!(system.mailbox.stats().blocking_calls, 1);
    }
}

#[test]
fn test_atomic_ping_doubles_value() {
    for kind in TransportKind::ALL {
        let system = start(kind);
        let _irq = IrqGuard::new(&HostCpu);
        let mut out = [0u8; 4];
        let code = system
            .mailbox
            .send_receive_atomic(Mrq::PING, &7u32.to_le_bytes(), &mut out)
            .unwrap();
        assert_eq!(code, 0, "{kind}");
        assert_eq!(u32::from_le_bytes(out), 14);
    }
}

#[test]
fn test_thousand_sequential_round_trips() {
    for kind in TransportKind::ALL {
        let system = start(kind);
        for i in 0..1000u32 {
            assert_eq!(ping(&system, i), i * 2, "{kind} iteration {i}");
        }
        let stats = system.mailbox.stats();
        assert_eq!(stats.blocking_calls, 1000);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.faults, 0);
    }
}

#[test]
fn test_hundred_fire_and_forget_posts() {
    for kind in TransportKind::ALL {
        let system = start(kind);
        for i in 0..100u32 {
            system
                .mailbox
                .send(Mrq::THREADED_PING, &i.to_le_bytes())
                .unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while system.bpmp.requests_served() < 100 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(system.bpmp.requests_served(), 100, "{kind}");
        assert_eq!(system.mailbox.stats().posts, 100);

        // Channel is usable for a round trip afterwards
        let _irq = IrqGuard::new(&HostCpu);
        let mut out = [0u8; 4];
        system
            .mailbox
            .send_receive_atomic(Mrq::PING, &1u32.to_le_bytes(), &mut out)
            .unwrap();
        assert_eq!(u32::from_le_bytes(out), 2);
    }
}

#[test]
fn test_concurrent_blocking_calls_get_their_own_replies() {
    for kind in TransportKind::ALL {
        let config = MailboxConfig {
            thread_channels: 3,
            ..config()
        };
        let firmware = MockBpmp::builder().latency(Duration::from_micros(200));
        let system = Arc::new(SimSystem::start(kind, config, firmware).unwrap());

        let workers: Vec<_> = (0..8u32)
            .map(|worker| {
                let system = system.clone();
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        let value = worker * 1000 + i;
                        assert_eq!(ping(&system, value), value * 2);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let stats = system.mailbox.stats();
        assert_eq!(stats.blocking_calls, 400, "{kind}");
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.faults, 0);
    }
}

#[test]
fn test_atomic_calls_on_distinct_cpus() {
    for kind in TransportKind::ALL {
        let system = Arc::new(start(kind));
        let workers: Vec<_> = (0..4usize)
            .map(|cpu| {
                let system = system.clone();
                std::thread::spawn(move || {
                    HostCpu::bind_current(cpu);
                    let _irq = IrqGuard::new(&HostCpu);
                    for i in 0..100u32 {
                        let mut out = [0u8; 4];
                        system
                            .mailbox
                            .send_receive_atomic(Mrq::PING, &i.to_le_bytes(), &mut out)
                            .unwrap();
                        assert_eq!(u32::from_le_bytes(out), i * 2);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(system.mailbox.stats().atomic_calls, 400, "{kind}");
    }
}

#[test]
fn test_full_frame_payload_round_trips() {
    for kind in TransportKind::ALL {
        let firmware = MockBpmp::builder().handler(Mrq(60), |data| RemoteAction::ok(data));
        let system = SimSystem::start(kind, config(), firmware).unwrap();

        let request: Vec<u8> = (0..MAX_PAYLOAD as u8).collect();
        let mut response = [0u8; MAX_PAYLOAD];
        let code = system
            .mailbox
            .send_receive(Mrq(60), &request, &mut response)
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(&response[..], &request[..], "{kind}");

        let served = system.bpmp.requests_served();
        let too_big = [0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            system.mailbox.send_receive(Mrq(60), &too_big, &mut response),
            Err(MailboxError::InvalidArgument(_))
        ));
        assert!(matches!(
            system.mailbox.send(Mrq(60), &too_big),
            Err(MailboxError::InvalidArgument(_))
        ));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(system.bpmp.requests_served(), served);
    }
}

#[test]
fn test_remote_error_code_passed_through() {
    for kind in TransportKind::ALL {
        let system = start(kind);
        let mut out = [0u8; 4];
        // No firmware handler for this id
        let code = system.mailbox.send_receive(Mrq(90), &[], &mut out).unwrap();
        assert_eq!(code, -bpmp_mailbox::errno::ENODEV, "{kind}");
        assert_eq!(
            bpmp_mailbox::check_code(code),
            Err(MailboxError::Remote { code })
        );
    }
}

#[test]
fn test_not_connected_until_connect() {
    for kind in TransportKind::ALL {
        let system = SimSystem::assemble(kind, config(), MockBpmp::builder()).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(
            system.mailbox.send(Mrq::PING, &[]),
            Err(MailboxError::NotConnected)
        );
        assert_eq!(
            system.mailbox.send_receive(Mrq::PING, &[], &mut out),
            Err(MailboxError::NotConnected)
        );
        {
            let _irq = IrqGuard::new(&HostCpu);
            assert_eq!(
                system.mailbox.send_receive_atomic(Mrq::PING, &[], &mut out),
                Err(MailboxError::NotConnected)
            );
        }
        assert_eq!(system.bpmp.requests_served(), 0);

        system.mailbox.connect().unwrap();
        assert_eq!(ping(&system, 5), 10, "{kind}");
    }
}

#[test]
fn test_connect_fails_when_firmware_never_boots() {
    for kind in TransportKind::ALL {
        let config = config().with_handshake_timeout(Duration::from_millis(50));
        let system =
            SimSystem::assemble(kind, config, MockBpmp::builder().offline()).unwrap();
        assert_eq!(system.mailbox.connect(), Err(MailboxError::NotReady), "{kind}");
        assert!(!system.mailbox.is_connected());
    }
}

#[test]
fn test_connect_waits_for_late_boot() {
    for kind in TransportKind::ALL {
        let firmware = MockBpmp::builder().boot_delay(Duration::from_millis(50));
        let system = SimSystem::start(kind, config(), firmware).unwrap();
        assert_eq!(ping(&system, 1), 2, "{kind}");
    }
}

#[test]
fn test_blocking_call_from_masked_context_rejected() {
    let system = start(TransportKind::Raw);
    let irq = IrqGuard::new(&HostCpu);
    let mut out = [0u8; 4];
    assert_eq!(
        system.mailbox.send_receive(Mrq::PING, &[], &mut out),
        Err(MailboxError::InvalidArgument(
            "blocking call with interrupts disabled"
        ))
    );
    drop(irq);
    assert!(matches!(
        system.mailbox.send_receive_atomic(Mrq::PING, &[], &mut out),
        Err(MailboxError::InvalidArgument(_))
    ));
    assert_eq!(system.bpmp.requests_served(), 0);
}
