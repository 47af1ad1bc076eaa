//! Mock BPMP - Simulated co-processor firmware for host testing
//!
//! # Purpose
//! Plays the remote side of the mailbox protocol on a service thread so the
//! real `bpmp-mailbox` code can be exercised without hardware. Both shared
//! area kinds are supported.
//!
//! # Integration Points
//! - Depends on: `bpmp-ipc` shared areas, `bpmp-mailbox` layout and MRQ ids
//! - Provides to: mailbox integration tests, benchmarks, `bpmp-services`
//!   tests and the `bpmp-sim` CLI
//!
//! # Behaviour
//! - Local requests are served by per-MRQ handlers returning a `RemoteAction`
//! - Built-in handlers answer PING, THREADED_PING, QUERY_TAG, QUERY_ABI,
//!   TRACE_MODIFY and WRITE_TRACE; unknown MRQs get `-ENODEV`
//! - Replies to requests flagged `RING_DOORBELL` raise the local interrupt;
//!   deliveries from the service thread and from `send_request` callers may
//!   overlap, as they would on several CPUs
//! - `send_request` starts a remote-initiated request on the inbound channel
//! - Firmware can boot late, go offline, or be reset

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bpmp_ipc::{Doorbell, FrameFlags, MessageFrame, MAX_PAYLOAD};
use bpmp_mailbox::{errno, ChannelLayout, Mrq, SharedArea};
use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};
use spin::Mutex;

mod harness;
mod remote;

pub use harness::{SimSystem, TransportKind};

use remote::{IvcRemote, RawRemote, RemoteSide};

/// How often the service thread looks at the shared area without a doorbell
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Tag reported by QUERY_TAG unless overridden
pub const DEFAULT_FIRMWARE_TAG: &str = "mock-bpmp-0.1";

/// Length of the QUERY_TAG reply
pub const TAG_LEN: usize = 32;

/// What the firmware does with one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteAction {
    /// Answer right away (plus any configured latency)
    Reply { code: i32, data: Vec<u8> },
    /// Answer after `after`
    Delay { after: Duration, code: i32, data: Vec<u8> },
    /// Hold the request until `MockBpmp::release_stalled`
    Stall,
}

impl RemoteAction {
    pub fn ok(data: &[u8]) -> Self {
        RemoteAction::Reply {
            code: 0,
            data: data.to_vec(),
        }
    }

    pub fn error(code: i32) -> Self {
        RemoteAction::Reply {
            code,
            data: Vec::new(),
        }
    }
}

/// Firmware handler for one MRQ; gets the whole request payload
pub type RemoteHandler = Arc<dyn Fn(&[u8; MAX_PAYLOAD]) -> RemoteAction + Send + Sync>;

type IrqHook = Arc<dyn Fn() + Send + Sync>;

enum Wake {
    Doorbell,
    Shutdown,
}

struct Pending {
    due: Instant,
    channel: usize,
    flags: FrameFlags,
    code: i32,
    data: Vec<u8>,
}

struct Shared {
    remote: Box<dyn RemoteSide>,
    layout: ChannelLayout,
    handlers: Mutex<HashMap<Mrq, RemoteHandler>>,
    online: AtomicBool,
    boot_at: Mutex<Option<Instant>>,
    boot_delay: Duration,
    latency: Duration,
    pending: Mutex<Vec<Pending>>,
    stalled: Mutex<Vec<(usize, FrameFlags)>>,
    irq: Mutex<Option<IrqHook>>,
    served: AtomicU64,
    doorbells: AtomicU64,
    boots: AtomicU64,
    trace_mask: AtomicU32,
    trace: Mutex<Vec<u8>>,
    tag: [u8; TAG_LEN],
}

impl Shared {
    fn raise_irq(&self) {
        let hook = self.irq.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn boot_if_due(&self) {
        let mut boot_at = self.boot_at.lock();
        if boot_at.is_some_and(|at| Instant::now() >= at) {
            *boot_at = None;
            self.boots.fetch_add(1, Ordering::Relaxed);
            self.remote.boot();
            self.online.store(true, Ordering::Release);
            log::info!("mock: firmware booted");
        }
    }

    fn builtin(&self, mrq: Mrq, data: &[u8; MAX_PAYLOAD]) -> Option<RemoteAction> {
        let word = |offset: usize| {
            u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        };
        let action = match mrq {
            Mrq::PING | Mrq::THREADED_PING => {
                RemoteAction::ok(&word(0).wrapping_mul(2).to_le_bytes())
            }
            Mrq::QUERY_TAG => RemoteAction::ok(&self.tag),
            Mrq::QUERY_ABI => {
                let queried = Mrq(word(0) as i32);
                let known = self.handlers.lock().contains_key(&queried)
                    || self.builtin_known(queried);
                if known {
                    RemoteAction::error(0)
                } else {
                    RemoteAction::error(-errno::ENODEV)
                }
            }
            Mrq::TRACE_MODIFY => {
                let (clear, set) = (word(0), word(4));
                let mask = self
                    .trace_mask
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| {
                        Some((m & !clear) | set)
                    })
                    .map(|m| (m & !clear) | set)
                    .unwrap_or(0);
                RemoteAction::ok(&mask.to_le_bytes())
            }
            Mrq::WRITE_TRACE => {
                let offset = word(0) as usize;
                let trace = self.trace.lock();
                let chunk = trace.get(offset..).unwrap_or(&[]);
                let chunk = &chunk[..chunk.len().min(MAX_PAYLOAD)];
                RemoteAction::Reply {
                    code: chunk.len() as i32,
                    data: chunk.to_vec(),
                }
            }
            _ => return None,
        };
        Some(action)
    }

    fn builtin_known(&self, mrq: Mrq) -> bool {
        matches!(
            mrq,
            Mrq::PING
                | Mrq::THREADED_PING
                | Mrq::QUERY_TAG
                | Mrq::QUERY_ABI
                | Mrq::TRACE_MODIFY
                | Mrq::WRITE_TRACE
        )
    }

    fn serve(&self, channel: usize, request: MessageFrame) {
        self.served.fetch_add(1, Ordering::Relaxed);
        let mrq = Mrq(request.code);
        let handler = self.handlers.lock().get(&mrq).cloned();
        let action = match handler {
            Some(handler) => handler(&request.data),
            None => self
                .builtin(mrq, &request.data)
                .unwrap_or_else(|| RemoteAction::error(-errno::ENODEV)),
        };
        log::trace!("mock: {} on channel {} -> {:?}", mrq, channel, action);

        let flags = request.flags;
        match action {
            RemoteAction::Reply { code, data } if self.latency.is_zero() => {
                self.reply(channel, flags, code, &data);
            }
            RemoteAction::Reply { code, data } => self.pending.lock().push(Pending {
                due: Instant::now() + self.latency,
                channel,
                flags,
                code,
                data,
            }),
            RemoteAction::Delay { after, code, data } => self.pending.lock().push(Pending {
                due: Instant::now() + after,
                channel,
                flags,
                code,
                data,
            }),
            RemoteAction::Stall => self.stalled.lock().push((channel, flags)),
        }
    }

    fn reply(&self, channel: usize, flags: FrameFlags, code: i32, data: &[u8]) {
        self.remote.complete(channel, flags, code, data);
        if flags.contains(FrameFlags::RING_DOORBELL) {
            self.raise_irq();
        }
    }

    fn flush_due(&self) {
        let now = Instant::now();
        let due: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let (due, waiting) = pending.drain(..).partition(|p| p.due <= now);
            *pending = waiting;
            due
        };
        for p in due {
            self.reply(p.channel, p.flags, p.code, &p.data);
        }
    }

    fn step(&self) {
        self.boot_if_due();
        if !self.online.load(Ordering::Acquire) {
            return;
        }
        self.remote.sync_links();
        for channel in self.layout.outbound_channels() {
            if let Some(request) = self.remote.take_request(channel) {
                self.serve(channel, request);
            }
        }
        self.flush_due();
    }

    fn take_offline(&self) {
        self.online.store(false, Ordering::Release);
        self.remote.shutdown();
        self.pending.lock().clear();
        self.stalled.lock().clear();
    }
}

fn service_loop(shared: Arc<Shared>, wake: crossbeam::channel::Receiver<Wake>) {
    loop {
        match wake.recv_timeout(POLL_INTERVAL) {
            Ok(Wake::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(Wake::Doorbell) | Err(RecvTimeoutError::Timeout) => {}
        }
        shared.step();
    }
    log::debug!("mock: service thread exiting");
}

/// Builder for `MockBpmp`
pub struct MockBuilder {
    handlers: HashMap<Mrq, RemoteHandler>,
    latency: Duration,
    boot_delay: Duration,
    tag: String,
    trace: Vec<u8>,
    offline: bool,
}

impl MockBuilder {
    /// Serve `mrq` with `handler` instead of the built-in behaviour
    pub fn handler<F>(mut self, mrq: Mrq, handler: F) -> Self
    where
        F: Fn(&[u8; MAX_PAYLOAD]) -> RemoteAction + Send + Sync + 'static,
    {
        self.handlers.insert(mrq, Arc::new(handler));
        self
    }

    /// Delay every reply by `latency`
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Time between start (or reset) and firmware readiness
    pub fn boot_delay(mut self, delay: Duration) -> Self {
        self.boot_delay = delay;
        self
    }

    pub fn firmware_tag(mut self, tag: &str) -> Self {
        self.tag = tag.to_string();
        self
    }

    /// Contents served by WRITE_TRACE
    pub fn trace_log(mut self, trace: &[u8]) -> Self {
        self.trace = trace.to_vec();
        self
    }

    /// Do not boot until `MockBpmp::boot` is called
    pub fn offline(mut self) -> Self {
        self.offline = true;
        self
    }

    /// Start the firmware over `area`, serving the channels of `layout`
    pub fn build(self, layout: ChannelLayout, area: SharedArea) -> MockBpmp {
        let remote: Box<dyn RemoteSide> = match area {
            SharedArea::Raw(area) => Box::new(RawRemote::new(area)),
            SharedArea::Ivc(area) => Box::new(IvcRemote::new(area)),
        };

        let mut tag = [0u8; TAG_LEN];
        let len = self.tag.len().min(TAG_LEN);
        tag[..len].copy_from_slice(&self.tag.as_bytes()[..len]);

        let boot_at = (!self.offline).then(|| Instant::now() + self.boot_delay);
        let shared = Arc::new(Shared {
            remote,
            layout,
            handlers: Mutex::new(self.handlers),
            online: AtomicBool::new(false),
            boot_at: Mutex::new(boot_at),
            boot_delay: self.boot_delay,
            latency: self.latency,
            pending: Mutex::new(Vec::new()),
            stalled: Mutex::new(Vec::new()),
            irq: Mutex::new(None),
            served: AtomicU64::new(0),
            doorbells: AtomicU64::new(0),
            boots: AtomicU64::new(0),
            trace_mask: AtomicU32::new(0),
            trace: Mutex::new(self.trace),
            tag,
        });

        let (wake_tx, wake_rx) = unbounded();
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name("mock-bpmp".into())
            .spawn(move || service_loop(thread_shared, wake_rx))
            .ok();
        if thread.is_none() {
            log::error!("mock: could not spawn service thread");
        }

        MockBpmp {
            shared,
            wake: wake_tx,
            thread,
        }
    }
}

/// Running simulated firmware; stops its service thread on drop
pub struct MockBpmp {
    shared: Arc<Shared>,
    wake: Sender<Wake>,
    thread: Option<JoinHandle<()>>,
}

impl MockBpmp {
    pub fn builder() -> MockBuilder {
        MockBuilder {
            handlers: HashMap::new(),
            latency: Duration::ZERO,
            boot_delay: Duration::ZERO,
            tag: DEFAULT_FIRMWARE_TAG.to_string(),
            trace: Vec::new(),
            offline: false,
        }
    }

    /// Doorbell the local side rings to wake the firmware
    pub fn doorbell(&self) -> Arc<dyn Doorbell> {
        let wake = self.wake.clone();
        let shared = self.shared.clone();
        Arc::new(move |_channel: usize| {
            shared.doorbells.fetch_add(1, Ordering::Relaxed);
            let _ = wake.send(Wake::Doorbell);
        })
    }

    /// Install the local interrupt handler the firmware raises
    pub fn set_irq_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.shared.irq.lock() = Some(Arc::new(handler));
    }

    pub fn set_handler<F>(&self, mrq: Mrq, handler: F)
    where
        F: Fn(&[u8; MAX_PAYLOAD]) -> RemoteAction + Send + Sync + 'static,
    {
        self.shared.handlers.lock().insert(mrq, Arc::new(handler));
    }

    pub fn remove_handler(&self, mrq: Mrq) {
        self.shared.handlers.lock().remove(&mrq);
    }

    pub fn is_online(&self) -> bool {
        self.shared.online.load(Ordering::Acquire)
    }

    /// Boot now if not already running
    pub fn boot(&self) {
        if !self.is_online() {
            *self.shared.boot_at.lock() = Some(Instant::now());
            let _ = self.wake.send(Wake::Doorbell);
        }
    }

    /// Firmware disappears; shared state stops being serviced
    pub fn go_offline(&self) {
        *self.shared.boot_at.lock() = None;
        self.shared.take_offline();
        log::info!("mock: firmware offline");
    }

    /// Firmware reload: offline now, back after the boot delay
    pub fn reset(&self) {
        self.shared.take_offline();
        *self.shared.boot_at.lock() = Some(Instant::now() + self.shared.boot_delay);
        log::info!("mock: firmware reset");
    }

    /// Answer every stalled request with `code`; returns how many
    pub fn release_stalled(&self, code: i32) -> usize {
        let stalled: Vec<_> = self.shared.stalled.lock().drain(..).collect();
        for &(channel, flags) in &stalled {
            self.shared.reply(channel, flags, code, &[]);
        }
        stalled.len()
    }

    /// Remote-initiated request on the inbound channel, waiting for the reply
    ///
    /// Returns `None` if the channel is busy or nothing comes back within
    /// `timeout`.
    pub fn send_request(&self, mrq: Mrq, data: &[u8], timeout: Duration) -> Option<MessageFrame> {
        self.start_request(mrq, data, FrameFlags::DO_ACK | FrameFlags::RING_DOORBELL, timeout)?
    }

    /// Remote-initiated request that asks for no reply
    ///
    /// Returns whether the local side consumed it within `timeout`.
    pub fn notify(&self, mrq: Mrq, data: &[u8], timeout: Duration) -> bool {
        self.start_request(mrq, data, FrameFlags::empty(), timeout)
            .is_some()
    }

    fn start_request(
        &self,
        mrq: Mrq,
        data: &[u8],
        flags: FrameFlags,
        timeout: Duration,
    ) -> Option<Option<MessageFrame>> {
        let frame = MessageFrame::new(mrq.id(), flags, data).ok()?;
        let channel = self.shared.layout.inbound();
        if !self.is_online() || !self.shared.remote.post_request(channel, &frame) {
            return None;
        }
        self.shared.raise_irq();

        let deadline = Instant::now() + timeout;
        let wants_reply = flags.contains(FrameFlags::DO_ACK);
        loop {
            if let Some(outcome) = self.shared.remote.poll_reply(channel, wants_reply) {
                return Some(outcome);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::yield_now();
        }
    }

    /// Requests served since start
    pub fn requests_served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    /// Doorbells rung by the local side
    pub fn doorbells(&self) -> u64 {
        self.shared.doorbells.load(Ordering::Relaxed)
    }

    /// Times the firmware came up
    pub fn boot_count(&self) -> u64 {
        self.shared.boots.load(Ordering::Relaxed)
    }

    pub fn trace_mask(&self) -> u32 {
        self.shared.trace_mask.load(Ordering::Acquire)
    }

    pub fn stalled_count(&self) -> usize {
        self.shared.stalled.lock().len()
    }
}

impl Drop for MockBpmp {
    fn drop(&mut self) {
        let _ = self.wake.send(Wake::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
