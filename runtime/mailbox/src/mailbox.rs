//! Mailbox Core - Call disciplines, interrupt handling and replies
//!
//! # Call Disciplines
//! - `send`: fire-and-forget on the caller's per-CPU channel, no reply
//! - `send_receive_atomic`: spin for the reply on the per-CPU channel;
//!   caller must have local interrupts masked
//! - `send_receive`: sleep on a pooled thread channel until the doorbell
//!   interrupt signals completion; caller must have interrupts enabled
//!
//! # Interrupt Path
//! `handle_irq` serves one remote-initiated request from the inbound
//! channel, then completes every thread channel the remote has acked. Both
//! happen in one pass because both directions share the doorbell. The
//! inbound half runs under a dispatch lock: when several CPUs take the
//! doorbell at once, exactly one of them serves the request.
//!
//! # Ownership
//! A per-CPU channel belongs to whichever call runs on that CPU (re-entry is
//! a consistency fault); a thread channel belongs to the holder of its pool
//! lease. The channel table itself is immutable after construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bpmp_ipc::{FrameFlags, MAX_PAYLOAD};

use crate::channel::{ChannelDescriptor, ChannelTable};
use crate::config::{ChannelLayout, MailboxConfig};
use crate::cpu::{CpuContext, IrqGuard};
use crate::dispatch::{
    in_dispatch, DispatchRegistry, InboundRequest, ModuleBase, ReplySink, Responder,
};
use crate::error::{MailboxError, Result, WaitPhase};
use crate::mrq::Mrq;
use crate::pool::{PoolStatus, ThreadPool};
use crate::transport::Transport;

/// Snapshot of mailbox counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStats {
    pub posts: u64,
    pub atomic_calls: u64,
    pub blocking_calls: u64,
    pub timeouts: u64,
    pub inbound_requests: u64,
    pub completions: u64,
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    posts: AtomicU64,
    atomic_calls: AtomicU64,
    blocking_calls: AtomicU64,
    timeouts: AtomicU64,
    inbound_requests: AtomicU64,
    completions: AtomicU64,
    faults: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MailboxStats {
        MailboxStats {
            posts: self.posts.load(Ordering::Relaxed),
            atomic_calls: self.atomic_calls.load(Ordering::Relaxed),
            blocking_calls: self.blocking_calls.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            inbound_requests: self.inbound_requests.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }

    /// Count error outcomes of a call
    fn record<T>(&self, result: &Result<T>) {
        match result {
            Err(MailboxError::Timeout(_)) => Self::bump(&self.timeouts),
            Err(MailboxError::ConsistencyFault { .. }) => Self::bump(&self.faults),
            _ => {}
        }
    }
}

/// Exclusive use of a per-CPU channel for one call
struct CpuClaim<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CpuClaim<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Subsystem handle: transport, channel table, pool and dispatch registry
///
/// Constructed once at startup and shared (usually behind an `Arc`) with
/// every caller and with the doorbell interrupt.
pub struct Mailbox {
    config: MailboxConfig,
    layout: ChannelLayout,
    transport: Box<dyn Transport>,
    cpu: Arc<dyn CpuContext>,
    table: ChannelTable,
    pool: ThreadPool,
    registry: DispatchRegistry,
    /// Held from the inbound check until the reply is posted
    inbound: spin::Mutex<()>,
    connected: AtomicBool,
    /// Per-CPU channel currently used by a call on that CPU
    cpu_busy: Box<[AtomicBool]>,
    /// Per-CPU channel whose atomic call timed out before the ack
    cpu_stale: Box<[AtomicBool]>,
    counters: Counters,
}

impl Mailbox {
    /// Build the channel table over `transport`; does not talk to the remote
    ///
    /// # Errors
    /// Returns `MailboxError::InvalidArgument` for an invalid config or a
    /// transport with too few channels
    pub fn new(
        config: MailboxConfig,
        transport: Box<dyn Transport>,
        cpu: Arc<dyn CpuContext>,
    ) -> Result<Self> {
        config.validate()?;
        let layout = config.layout();
        let table = ChannelTable::build(layout, transport.as_ref())?;
        let pool = ThreadPool::new(layout.first_thread(), layout.thread_count);

        log::debug!(
            "bpmp: mailbox over {} transport: {} per-CPU, {} thread, inbound {}",
            transport.name(),
            layout.cpu_count,
            layout.thread_count,
            layout.inbound()
        );

        Ok(Self {
            config,
            layout,
            transport,
            cpu,
            table,
            pool,
            registry: DispatchRegistry::new(),
            inbound: spin::Mutex::new(()),
            connected: AtomicBool::new(false),
            cpu_busy: (0..layout.cpu_count).map(|_| AtomicBool::new(false)).collect(),
            cpu_stale: (0..layout.cpu_count).map(|_| AtomicBool::new(false)).collect(),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    /// Platform CPU context the mailbox was built with
    pub fn cpu(&self) -> &dyn CpuContext {
        self.cpu.as_ref()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.table
    }

    pub fn stats(&self) -> MailboxStats {
        self.counters.snapshot()
    }

    /// Thread-channel pool occupancy
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Synchronise with the remote and open the mailbox for traffic
    ///
    /// # Errors
    /// Returns `MailboxError::NotReady` if the remote does not answer within
    /// the handshake timeout
    pub fn connect(&self) -> Result<()> {
        self.transport.handshake(self.config.timeouts.handshake)?;
        self.connected.store(true, Ordering::Release);
        log::info!("bpmp: connected over {} transport", self.transport.name());
        Ok(())
    }

    /// Stop all traffic; every primitive fails with `NotConnected` afterwards
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            log::info!("bpmp: disconnected");
        }
    }

    /// Re-synchronise after the remote firmware was reloaded
    ///
    /// Channel bookkeeping is reset; dispatch registrations are kept.
    pub fn reattach(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        self.pool.reset(self.cpu.as_ref());
        for flag in self.cpu_stale.iter() {
            flag.store(false, Ordering::Release);
        }
        self.transport.handshake(self.config.timeouts.handshake)?;
        self.connected.store(true, Ordering::Release);
        log::info!("bpmp: reattached to remote firmware");
        Ok(())
    }

    /// Re-establish the transport after a local low-power exit
    pub fn resume(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(MailboxError::NotConnected);
        }
        self.transport.resume(self.config.timeouts.handshake)
    }

    fn check_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MailboxError::NotConnected)
        }
    }

    fn check_len(len: usize) -> Result<()> {
        if len > MAX_PAYLOAD {
            return Err(MailboxError::InvalidArgument("payload exceeds frame size"));
        }
        Ok(())
    }

    fn descriptor(&self, channel: usize) -> Result<&ChannelDescriptor> {
        self.table
            .get(channel)
            .ok_or(MailboxError::ConsistencyFault { channel })
    }

    /// Take the calling CPU's channel
    ///
    /// Must run with interrupts masked so the claim cannot be preempted.
    fn claim_cpu_channel(&self) -> Result<(usize, CpuClaim<'_>)> {
        let channel = self.layout.per_cpu(self.cpu.current_cpu())?;
        let flag = &self.cpu_busy[channel];
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("bpmp: per-CPU channel {} re-entered", channel);
            return Err(MailboxError::ConsistencyFault { channel });
        }
        Ok((channel, CpuClaim { flag }))
    }

    /// Consume a late ack left behind by a timed-out atomic call
    fn reclaim_cpu_channel(&self, channel: usize) {
        let stale = &self.cpu_stale[channel];
        if stale.load(Ordering::Acquire)
            && self.transport.outbound_acked(channel)
            && self.transport.release_after_read(channel).is_ok()
        {
            stale.store(false, Ordering::Release);
            log::info!("bpmp: reclaimed per-CPU channel {}", channel);
        }
    }

    /// Spin until `channel` may take a new request
    ///
    /// A channel with an outstanding late reply stays busy even if the
    /// transport reports it writable.
    fn wait_cpu_channel_free(&self, channel: usize, deadline: Instant) -> Result<()> {
        loop {
            self.reclaim_cpu_channel(channel);
            if !self.cpu_stale[channel].load(Ordering::Acquire)
                && self.transport.outbound_free(channel)
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                log::warn!("bpmp: per-CPU channel {} never became free", channel);
                return Err(MailboxError::Timeout(WaitPhase::FreeChannel));
            }
            core::hint::spin_loop();
        }
    }

    /// Post `data` under `mrq` without waiting for a reply
    ///
    /// Callable from any context; interrupts are masked for the duration.
    ///
    /// # Errors
    /// - `NotConnected` before `connect`
    /// - `InvalidArgument` if `data` exceeds one frame
    /// - `Timeout(FreeChannel)` if the per-CPU channel stays busy
    pub fn send(&self, mrq: Mrq, data: &[u8]) -> Result<()> {
        let result = self.send_inner(mrq, data);
        self.counters.record(&result);
        result
    }

    fn send_inner(&self, mrq: Mrq, data: &[u8]) -> Result<()> {
        self.check_connected()?;
        Self::check_len(data.len())?;

        let _irq = IrqGuard::new(self.cpu.as_ref());
        let (channel, _claim) = self.claim_cpu_channel()?;
        let deadline = Instant::now() + self.config.timeouts.channel;
        self.wait_cpu_channel_free(channel, deadline)?;

        self.descriptor(channel)?
            .write_outbound(mrq.id(), FrameFlags::empty(), data)?;
        self.transport.signal_remote(channel)?;
        self.transport.ring_doorbell(channel);
        Counters::bump(&self.counters.posts);
        Ok(())
    }

    /// Round trip on the per-CPU channel, spinning for the reply
    ///
    /// Returns the remote's reply code; up to `response.len()` reply bytes
    /// are copied into `response`.
    ///
    /// # Errors
    /// - `InvalidArgument` if interrupts are enabled or a buffer exceeds one frame
    /// - `Timeout(FreeChannel | Ack)` when the remote does not respond in time
    pub fn send_receive_atomic(&self, mrq: Mrq, request: &[u8], response: &mut [u8]) -> Result<i32> {
        let result = self.send_receive_atomic_inner(mrq, request, response);
        self.counters.record(&result);
        result
    }

    fn send_receive_atomic_inner(&self, mrq: Mrq, request: &[u8], response: &mut [u8]) -> Result<i32> {
        self.check_connected()?;
        Self::check_len(request.len())?;
        Self::check_len(response.len())?;
        if !self.cpu.irqs_disabled() {
            return Err(MailboxError::InvalidArgument(
                "atomic call with interrupts enabled",
            ));
        }

        let (channel, _claim) = self.claim_cpu_channel()?;
        let desc = self.descriptor(channel)?;
        let deadline = Instant::now() + self.config.timeouts.channel;
        self.wait_cpu_channel_free(channel, deadline)?;

        desc.write_outbound(mrq.id(), FrameFlags::DO_ACK, request)?;
        self.transport.signal_remote(channel)?;
        self.transport.ring_doorbell(channel);

        let deadline = Instant::now() + self.config.timeouts.channel;
        while !self.transport.outbound_acked(channel) {
            if Instant::now() >= deadline {
                self.cpu_stale[channel].store(true, Ordering::Release);
                log::warn!("bpmp: {} on per-CPU channel {} timed out", mrq, channel);
                return Err(MailboxError::Timeout(WaitPhase::Ack));
            }
            core::hint::spin_loop();
        }

        let code = desc.read_inbound(response);
        self.transport.release_after_read(channel)?;
        Counters::bump(&self.counters.atomic_calls);
        Ok(code)
    }

    /// Round trip on a pooled thread channel, sleeping until the reply
    ///
    /// Returns the remote's reply code; up to `response.len()` reply bytes
    /// are copied into `response`.
    ///
    /// # Errors
    /// - `InvalidArgument` if interrupts are disabled or a buffer exceeds one frame
    /// - `Timeout(PoolSlot | Completion)` when no channel frees up or the
    ///   remote does not answer in time
    pub fn send_receive(&self, mrq: Mrq, request: &[u8], response: &mut [u8]) -> Result<i32> {
        let result = self.send_receive_inner(mrq, request, response);
        self.counters.record(&result);
        result
    }

    fn send_receive_inner(&self, mrq: Mrq, request: &[u8], response: &mut [u8]) -> Result<i32> {
        self.check_connected()?;
        Self::check_len(request.len())?;
        Self::check_len(response.len())?;
        if self.cpu.irqs_disabled() {
            return Err(MailboxError::InvalidArgument(
                "blocking call with interrupts disabled",
            ));
        }

        let timeout = self.config.timeouts.channel;
        let cpu = self.cpu.as_ref();
        let permit = self.pool.acquire_permit(cpu, Instant::now() + timeout)?;

        let lease = self
            .pool
            .start(cpu, self.transport.as_ref(), permit, |channel| {
                self.descriptor(channel)?.write_outbound(
                    mrq.id(),
                    FrameFlags::DO_ACK | FrameFlags::RING_DOORBELL,
                    request,
                )?;
                self.transport.signal_remote(channel)
            })?;
        self.transport.ring_doorbell(lease.channel);

        self.pool.wait(cpu, &lease, Instant::now() + timeout)?;

        let code = self.pool.finish(cpu, lease, |channel| {
            let code = self.descriptor(channel)?.read_inbound(response);
            self.transport.release_after_read(channel)?;
            Ok(code)
        })?;
        Counters::bump(&self.counters.blocking_calls);
        Ok(code)
    }

    /// Doorbell interrupt entry point
    ///
    /// Serves a pending remote-initiated request, then completes acked
    /// thread channels. Safe to enter from several CPUs at once; a request
    /// is dispatched to exactly one handler invocation. Faults are logged;
    /// the interrupt is never failed.
    pub fn handle_irq(&self) {
        let _irq = IrqGuard::new(self.cpu.as_ref());
        if !self.is_connected() {
            log::trace!("bpmp: doorbell while disconnected");
            return;
        }

        // A handler polling the doorbell already owns the inbound channel
        if !in_dispatch() {
            let _dispatch = self.inbound.lock();
            self.serve_inbound();
        }

        let completed = self.pool.complete_acked(self.transport.as_ref());
        self.counters
            .completions
            .fetch_add(completed as u64, Ordering::Relaxed);
    }

    /// Dispatch the request waiting on the inbound channel, if any
    ///
    /// Caller holds the dispatch lock; the handler's reply or the dropped
    /// responder releases the channel before it is let go.
    fn serve_inbound(&self) {
        let inbound = self.layout.inbound();
        if !self.transport.inbound_signalled(inbound) {
            return;
        }
        match self.descriptor(inbound) {
            Ok(desc) => {
                let request = InboundRequest::from_frame(inbound, &desc.inbound.load());
                let responder = Responder::new(self, inbound, request.mrq(), request.flags());
                Counters::bump(&self.counters.inbound_requests);
                self.registry.dispatch(&request, responder);
            }
            Err(err) => {
                Counters::bump(&self.counters.faults);
                log::error!("bpmp: inbound channel unavailable: {}", err);
            }
        }
    }

    /// Register `handler` for remote-initiated requests with id `mrq`
    pub fn register_handler<F>(&self, mrq: Mrq, handler: F) -> Result<()>
    where
        F: Fn(&InboundRequest, Responder<'_>) + Send + Sync + 'static,
    {
        let _irq = IrqGuard::new(self.cpu.as_ref());
        self.registry.register(mrq, Arc::new(handler))
    }

    pub fn cancel_handler(&self, mrq: Mrq) -> Result<()> {
        let _irq = IrqGuard::new(self.cpu.as_ref());
        self.registry.cancel(mrq)
    }

    /// Register a handler for module mail addressed to `base`
    pub fn register_module<F>(&self, base: ModuleBase, handler: F) -> Result<()>
    where
        F: Fn(ModuleBase, &[u8], Responder<'_>) + Send + Sync + 'static,
    {
        let _irq = IrqGuard::new(self.cpu.as_ref());
        self.registry.register_module(base, Arc::new(handler))
    }

    pub fn cancel_module(&self, base: ModuleBase) -> Result<()> {
        let _irq = IrqGuard::new(self.cpu.as_ref());
        self.registry.cancel_module(base)
    }

    pub fn is_registered(&self, mrq: Mrq) -> bool {
        self.registry.is_registered(mrq)
    }
}

impl ReplySink for Mailbox {
    fn send_reply(&self, channel: usize, request_flags: FrameFlags, code: i32, data: &[u8]) -> Result<()> {
        let desc = self.descriptor(channel)?;
        let ack = request_flags.contains(FrameFlags::DO_ACK);
        if ack {
            desc.write_outbound(code, FrameFlags::empty(), data)?;
        }
        let result = self.transport.release_after_read(channel).and_then(|()| {
            if ack {
                self.transport.post_reply(channel)?;
                if request_flags.contains(FrameFlags::RING_DOORBELL) {
                    self.transport.ring_doorbell(channel);
                }
            }
            Ok(())
        });
        self.counters.record(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::HostCpu;
    use crate::mrq::errno;
    use crate::transport::RawTransport;
    use bpmp_ipc::{ChannelState, MessageFrame, RawSharedArea};
    use std::time::Duration;

    // 1 CPU, 1 thread channel, inbound on 2
    fn mailbox() -> (Arc<RawSharedArea>, Mailbox) {
        let area = Arc::new(RawSharedArea::new(3).unwrap());
        area.set_ready(true);
        let transport = RawTransport::new(area.clone(), Arc::new(|_: usize| {})).unwrap();
        let config = MailboxConfig {
            cpu_count: 1,
            thread_channels: 1,
            ..MailboxConfig::default()
        }
        .with_channel_timeout(Duration::from_millis(20))
        .with_handshake_timeout(Duration::from_millis(20));
        let mb = Mailbox::new(config, Box::new(transport), Arc::new(HostCpu)).unwrap();
        (area, mb)
    }

    #[test]
    fn test_primitives_require_connect() {
        let (_, mb) = mailbox();
        let mut buf = [0u8; 4];
        assert_eq!(mb.send(Mrq::PING, &[]), Err(MailboxError::NotConnected));
        assert_eq!(
            mb.send_receive(Mrq::PING, &[], &mut buf),
            Err(MailboxError::NotConnected)
        );
        let _irq = IrqGuard::new(&HostCpu);
        assert_eq!(
            mb.send_receive_atomic(Mrq::PING, &[], &mut buf),
            Err(MailboxError::NotConnected)
        );
    }

    #[test]
    fn test_payload_bound_checked_before_io() {
        let (area, mb) = mailbox();
        mb.connect().unwrap();
        let before = area.state().snapshot();
        assert!(matches!(
            mb.send(Mrq::PING, &[0; MAX_PAYLOAD + 1]),
            Err(MailboxError::InvalidArgument(_))
        ));
        let mut big = [0u8; MAX_PAYLOAD + 1];
        assert!(matches!(
            mb.send_receive(Mrq::PING, &[], &mut big),
            Err(MailboxError::InvalidArgument(_))
        ));
        assert_eq!(area.state().snapshot(), before);

        mb.send(Mrq::PING, &[0; MAX_PAYLOAD]).unwrap();
        assert_eq!(area.state().state(0).unwrap(), ChannelState::Queued);
    }

    #[test]
    fn test_irq_context_checks() {
        let (_, mb) = mailbox();
        mb.connect().unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            mb.send_receive_atomic(Mrq::PING, &[], &mut buf),
            Err(MailboxError::InvalidArgument(_))
        ));
        let _irq = IrqGuard::new(&HostCpu);
        assert!(matches!(
            mb.send_receive(Mrq::PING, &[], &mut buf),
            Err(MailboxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_atomic_call_with_inline_remote() {
        let (area, mb) = mailbox();
        mb.connect().unwrap();

        // Nobody answers: the call times out and the ack arrives late
        let _irq = IrqGuard::new(&HostCpu);
        let mut buf = [0u8; 4];
        assert_eq!(
            mb.send_receive_atomic(Mrq::PING, &[1], &mut buf),
            Err(MailboxError::Timeout(WaitPhase::Ack))
        );
        assert_eq!(mb.stats().timeouts, 1);

        area.inbound_frame(0)
            .unwrap()
            .store(&MessageFrame::new(0, FrameFlags::empty(), &[]).unwrap());
        area.state().ack(0).unwrap();

        // Late ack is consumed before the next request goes out
        mb.send(Mrq::PING, &[]).unwrap();
        assert_eq!(area.state().state(0).unwrap(), ChannelState::Queued);
    }

    #[test]
    fn test_per_cpu_out_of_range() {
        let (_, mb) = mailbox();
        mb.connect().unwrap();
        std::thread::spawn(move || {
            HostCpu::bind_current(3);
            assert_eq!(
                mb.send(Mrq::PING, &[]),
                Err(MailboxError::CpuOutOfRange { cpu: 3 })
            );
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_inbound_dispatch_and_reply() {
        let (area, mb) = mailbox();
        mb.connect().unwrap();
        mb.register_handler(Mrq::PING, |req: &InboundRequest, resp: Responder<'_>| {
            let value = req.read_u32(0).unwrap_or(0);
            let _ = resp.reply(0, &(value * 2).to_le_bytes());
        })
        .unwrap();

        let inbound = mb.layout().inbound();
        area.inbound_frame(inbound)
            .unwrap()
            .store(&MessageFrame::new(0, FrameFlags::DO_ACK, &21u32.to_le_bytes()).unwrap());
        area.state().signal(inbound).unwrap();
        mb.handle_irq();

        assert_eq!(area.state().state(inbound).unwrap(), ChannelState::Free);
        let reply = area.outbound_frame(inbound).unwrap().load();
        assert_eq!(reply.code, 0);
        assert_eq!(reply.read_u32(0), Some(42));
        assert_eq!(mb.stats().inbound_requests, 1);
    }

    #[test]
    fn test_inbound_unknown_mrq_gets_enodev() {
        let (area, mb) = mailbox();
        mb.connect().unwrap();
        let inbound = mb.layout().inbound();
        area.inbound_frame(inbound)
            .unwrap()
            .store(&MessageFrame::new(77, FrameFlags::DO_ACK, &[]).unwrap());
        area.state().signal(inbound).unwrap();
        mb.handle_irq();
        assert_eq!(area.outbound_frame(inbound).unwrap().code(), -errno::ENODEV);
    }

    #[test]
    fn test_disconnect_and_reattach() {
        let (area, mb) = mailbox();
        mb.connect().unwrap();
        mb.disconnect();
        assert!(!mb.is_connected());
        assert_eq!(mb.resume(), Err(MailboxError::NotConnected));

        area.set_ready(false);
        assert_eq!(mb.reattach(), Err(MailboxError::NotReady));
        area.set_ready(true);
        mb.reattach().unwrap();
        assert!(mb.is_connected());
        mb.resume().unwrap();
    }
}
