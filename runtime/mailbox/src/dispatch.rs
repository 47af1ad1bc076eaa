//! Dispatch Registry - Routing remote-initiated requests to handlers
//!
//! # Purpose
//! Maps MRQ ids to handler closures for requests the remote starts on the
//! inbound channel. A small fixed table is addressed through an
//! index-of-index lookup over the sparse id space; `MRQ_MODULE_MAIL` is
//! routed further by a module base taken from the payload.
//!
//! # Handler Contract
//! Handlers run from the doorbell interrupt with local interrupts masked.
//! They must not block, must not register or cancel handlers, and reply
//! through the `Responder` they are given. A `Responder` dropped without a
//! reply answers `-EIO` so the remote is never left waiting.

use std::cell::Cell;
use std::sync::Arc;

use bpmp_ipc::{FrameFlags, MessageFrame, MAX_PAYLOAD};
use spin::Mutex;

use crate::error::{MailboxError, Result};
use crate::mrq::{errno, Mrq, MAX_MRQ};

/// Handlers that can be registered at the same time
pub const MAX_HANDLERS: usize = 8;

const NO_ENTRY: u8 = u8::MAX;

/// Key of a dynamically loaded firmware module's mail handler
///
/// The remote addresses module mail by the base address it loaded the
/// module at; locally it is just an opaque key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleBase(pub u32);

/// Request the remote placed on the inbound channel
#[derive(Debug, Clone)]
pub struct InboundRequest {
    mrq: Mrq,
    flags: FrameFlags,
    channel: usize,
    data: [u8; MAX_PAYLOAD],
}

impl InboundRequest {
    pub(crate) fn from_frame(channel: usize, frame: &MessageFrame) -> Self {
        Self {
            mrq: Mrq(frame.code),
            flags: frame.flags,
            channel,
            data: frame.data,
        }
    }

    pub fn mrq(&self) -> Mrq {
        self.mrq
    }

    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    /// Whole payload area; requests carry no explicit length
    pub fn data(&self) -> &[u8; MAX_PAYLOAD] {
        &self.data
    }

    /// Little-endian u32 at byte `offset`
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn wants_reply(&self) -> bool {
        self.flags.contains(FrameFlags::DO_ACK)
    }
}

/// Where a `Responder` sends its reply
pub(crate) trait ReplySink: Send + Sync {
    fn send_reply(&self, channel: usize, request_flags: FrameFlags, code: i32, data: &[u8]) -> Result<()>;
}

/// Reply primitive for one inbound request
///
/// Consumed by `reply`; only dispatch can create one.
pub struct Responder<'a> {
    sink: &'a dyn ReplySink,
    channel: usize,
    mrq: Mrq,
    flags: FrameFlags,
    replied: bool,
}

impl<'a> Responder<'a> {
    pub(crate) fn new(sink: &'a dyn ReplySink, channel: usize, mrq: Mrq, flags: FrameFlags) -> Self {
        Self {
            sink,
            channel,
            mrq,
            flags,
            replied: false,
        }
    }

    pub fn mrq(&self) -> Mrq {
        self.mrq
    }

    /// Remote asked for a reply frame; if not, `reply` only frees the channel
    pub fn wants_reply(&self) -> bool {
        self.flags.contains(FrameFlags::DO_ACK)
    }

    /// Answer the request with `code` and `data`
    ///
    /// # Errors
    /// Returns `MailboxError::InvalidArgument` if `data` exceeds one frame;
    /// the remote then receives `-EINVAL`
    pub fn reply(mut self, code: i32, data: &[u8]) -> Result<()> {
        self.replied = true;
        if data.len() > MAX_PAYLOAD {
            self.sink
                .send_reply(self.channel, self.flags, -errno::EINVAL, &[])?;
            return Err(MailboxError::InvalidArgument("reply exceeds frame size"));
        }
        self.sink.send_reply(self.channel, self.flags, code, data)
    }

    /// Answer with a bare error code (already negated)
    pub fn reply_error(self, code: i32) -> Result<()> {
        self.reply(code, &[])
    }
}

impl Drop for Responder<'_> {
    fn drop(&mut self) {
        if self.replied {
            return;
        }
        log::warn!("bpmp: handler for {} returned without replying", self.mrq);
        if let Err(err) = self
            .sink
            .send_reply(self.channel, self.flags, -errno::EIO, &[])
        {
            log::error!("bpmp: fallback reply on channel {} failed: {}", self.channel, err);
        }
    }
}

/// Handler for one MRQ id
pub type MrqHandler = Arc<dyn Fn(&InboundRequest, Responder<'_>) + Send + Sync>;

/// Handler for one module's mail; gets the payload after the base word
pub type ModuleHandler = Arc<dyn Fn(ModuleBase, &[u8], Responder<'_>) + Send + Sync>;

struct Entry {
    mrq: Mrq,
    handler: MrqHandler,
}

struct Table {
    /// MRQ id -> slot in `entries`, `NO_ENTRY` when unregistered
    index: [u8; MAX_MRQ],
    entries: [Option<Entry>; MAX_HANDLERS],
    modules: Vec<(ModuleBase, ModuleHandler)>,
}

impl Table {
    fn lookup(&self, mrq: Mrq) -> Option<&Entry> {
        let idx = mrq.table_index()?;
        let slot = self.index[idx];
        if slot == NO_ENTRY {
            return None;
        }
        self.entries[slot as usize].as_ref()
    }
}

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current CPU as running a handler
struct DispatchScope;

impl DispatchScope {
    fn enter() -> Self {
        IN_DISPATCH.with(|flag| flag.set(true));
        DispatchScope
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(false));
    }
}

/// True while the caller is running inside a dispatch handler
pub fn in_dispatch() -> bool {
    IN_DISPATCH.with(Cell::get)
}

pub struct DispatchRegistry {
    table: Mutex<Table>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                index: [NO_ENTRY; MAX_MRQ],
                entries: Default::default(),
                modules: Vec::new(),
            }),
        }
    }

    /// Install `handler` for `mrq`
    ///
    /// # Errors
    /// - `Reentrant` when called from a handler
    /// - `InvalidArgument` for ids outside `0..MAX_MRQ` or `MRQ_MODULE_MAIL`
    /// - `AlreadyRegistered` if `mrq` has a handler
    /// - `ResourceExhausted` when all `MAX_HANDLERS` entries are taken
    pub fn register(&self, mrq: Mrq, handler: MrqHandler) -> Result<()> {
        if in_dispatch() {
            return Err(MailboxError::Reentrant);
        }
        let idx = mrq
            .table_index()
            .ok_or(MailboxError::InvalidArgument("MRQ outside dispatch id space"))?;
        if mrq == Mrq::MODULE_MAIL {
            return Err(MailboxError::InvalidArgument(
                "module mail is routed to module handlers",
            ));
        }

        let mut table = self.table.lock();
        if table.index[idx] != NO_ENTRY {
            return Err(MailboxError::AlreadyRegistered { mrq });
        }
        let slot = table
            .entries
            .iter()
            .position(Option::is_none)
            .ok_or(MailboxError::ResourceExhausted)?;
        table.entries[slot] = Some(Entry { mrq, handler });
        table.index[idx] = slot as u8;
        log::debug!("bpmp: registered handler for {} in slot {}", mrq, slot);
        Ok(())
    }

    /// Remove the handler for `mrq`
    pub fn cancel(&self, mrq: Mrq) -> Result<()> {
        if in_dispatch() {
            return Err(MailboxError::Reentrant);
        }
        let idx = mrq.table_index().ok_or(MailboxError::NotRegistered { mrq })?;

        let mut table = self.table.lock();
        let slot = table.index[idx];
        if slot == NO_ENTRY {
            return Err(MailboxError::NotRegistered { mrq });
        }
        table.entries[slot as usize] = None;
        table.index[idx] = NO_ENTRY;
        log::debug!("bpmp: cancelled handler for {}", mrq);
        Ok(())
    }

    pub fn register_module(&self, base: ModuleBase, handler: ModuleHandler) -> Result<()> {
        if in_dispatch() {
            return Err(MailboxError::Reentrant);
        }
        let mut table = self.table.lock();
        if table.modules.iter().any(|(b, _)| *b == base) {
            return Err(MailboxError::ModuleAlreadyRegistered { base: base.0 });
        }
        table.modules.push((base, handler));
        log::debug!("bpmp: registered module mail handler at {:#x}", base.0);
        Ok(())
    }

    pub fn cancel_module(&self, base: ModuleBase) -> Result<()> {
        if in_dispatch() {
            return Err(MailboxError::Reentrant);
        }
        let mut table = self.table.lock();
        let pos = table
            .modules
            .iter()
            .position(|(b, _)| *b == base)
            .ok_or(MailboxError::ModuleNotRegistered { base: base.0 })?;
        table.modules.remove(pos);
        Ok(())
    }

    pub fn is_registered(&self, mrq: Mrq) -> bool {
        self.table.lock().lookup(mrq).is_some()
    }

    pub fn handler_count(&self) -> usize {
        self.table.lock().entries.iter().flatten().count()
    }

    /// Route `request` to its handler, replying `-ENODEV` when there is none
    pub(crate) fn dispatch(&self, request: &InboundRequest, responder: Responder<'_>) {
        let _scope = DispatchScope::enter();

        if request.mrq() == Mrq::MODULE_MAIL {
            self.dispatch_module(request, responder);
            return;
        }

        let handler = self
            .table
            .lock()
            .lookup(request.mrq())
            .map(|entry| (entry.mrq, entry.handler.clone()));
        match handler {
            Some((mrq, handler)) => {
                log::trace!("bpmp: dispatching {}", mrq);
                handler(request, responder);
            }
            None => {
                log::debug!("bpmp: no handler for inbound {}", request.mrq());
                if let Err(err) = responder.reply_error(-errno::ENODEV) {
                    log::error!("bpmp: ENODEV reply failed: {}", err);
                }
            }
        }
    }

    fn dispatch_module(&self, request: &InboundRequest, responder: Responder<'_>) {
        let Some(base) = request.read_u32(0).map(ModuleBase) else {
            let _ = responder.reply_error(-errno::EINVAL);
            return;
        };
        let handler = self
            .table
            .lock()
            .modules
            .iter()
            .find(|(b, _)| *b == base)
            .map(|(_, handler)| handler.clone());
        match handler {
            Some(handler) => handler(base, &request.data()[4..], responder),
            None => {
                log::debug!("bpmp: no module at {:#x}", base.0);
                if let Err(err) = responder.reply_error(-errno::ENODEV) {
                    log::error!("bpmp: ENODEV reply failed: {}", err);
                }
            }
        }
    }
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        replies: std::sync::Mutex<Vec<(usize, i32, Vec<u8>)>>,
    }

    impl ReplySink for Recorder {
        fn send_reply(&self, channel: usize, _flags: FrameFlags, code: i32, data: &[u8]) -> Result<()> {
            self.replies
                .lock()
                .unwrap()
                .push((channel, code, data.to_vec()));
            Ok(())
        }
    }

    fn request(mrq: Mrq, payload: &[u8]) -> InboundRequest {
        let frame = MessageFrame::new(mrq.id(), FrameFlags::DO_ACK, payload).unwrap();
        InboundRequest::from_frame(11, &frame)
    }

    fn run(registry: &DispatchRegistry, sink: &Recorder, req: &InboundRequest) {
        registry.dispatch(req, Responder::new(sink, req.channel(), req.mrq(), req.flags()));
    }

    #[test]
    fn test_routes_to_registered_handler_once() {
        let registry = DispatchRegistry::new();
        let sink = Recorder::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry
            .register(
                Mrq::PING,
                Arc::new(move |req: &InboundRequest, resp: Responder<'_>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let value = req.read_u32(0).unwrap() * 2;
                    resp.reply(0, &value.to_le_bytes()).unwrap();
                }),
            )
            .unwrap();

        run(&registry, &sink, &request(Mrq::PING, &21u32.to_le_bytes()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.as_slice(), &[(11, 0, 42u32.to_le_bytes().to_vec())]);
    }

    #[test]
    fn test_read_u32_bounds() {
        let req = request(Mrq::PING, &7u32.to_le_bytes());
        assert_eq!(req.read_u32(0), Some(7));
        assert_eq!(req.read_u32(MAX_PAYLOAD - 4), Some(0));
        assert_eq!(req.read_u32(MAX_PAYLOAD - 3), None);
        assert_eq!(req.read_u32(usize::MAX - 2), None);
        assert_eq!(req.read_u32(usize::MAX), None);
    }

    #[test]
    fn test_unregistered_id_gets_enodev() {
        let registry = DispatchRegistry::new();
        let sink = Recorder::default();
        run(&registry, &sink, &request(Mrq(42), &[]));
        assert_eq!(sink.replies.lock().unwrap()[0].1, -errno::ENODEV);
    }

    #[test]
    fn test_register_rules() {
        let registry = DispatchRegistry::new();
        let noop: MrqHandler = Arc::new(|_: &InboundRequest, r: Responder<'_>| {
            let _ = r.reply(0, &[]);
        });

        registry.register(Mrq::PING, noop.clone()).unwrap();
        assert_eq!(
            registry.register(Mrq::PING, noop.clone()),
            Err(MailboxError::AlreadyRegistered { mrq: Mrq::PING })
        );
        assert!(matches!(
            registry.register(Mrq(MAX_MRQ as i32), noop.clone()),
            Err(MailboxError::InvalidArgument(_))
        ));
        assert!(matches!(
            registry.register(Mrq::MODULE_MAIL, noop.clone()),
            Err(MailboxError::InvalidArgument(_))
        ));

        for id in 1..MAX_HANDLERS as i32 {
            registry.register(Mrq(id + 30), noop.clone()).unwrap();
        }
        assert_eq!(registry.handler_count(), MAX_HANDLERS);
        assert_eq!(
            registry.register(Mrq(99), noop.clone()),
            Err(MailboxError::ResourceExhausted)
        );

        registry.cancel(Mrq::PING).unwrap();
        assert!(!registry.is_registered(Mrq::PING));
        assert_eq!(
            registry.cancel(Mrq::PING),
            Err(MailboxError::NotRegistered { mrq: Mrq::PING })
        );
        registry.register(Mrq(99), noop).unwrap();
    }

    #[test]
    fn test_dropped_responder_replies_eio() {
        let registry = DispatchRegistry::new();
        let sink = Recorder::default();
        registry
            .register(Mrq::QUERY_TAG, Arc::new(|_: &InboundRequest, _r: Responder<'_>| {}))
            .unwrap();
        run(&registry, &sink, &request(Mrq::QUERY_TAG, &[]));
        assert_eq!(sink.replies.lock().unwrap()[0].1, -errno::EIO);
    }

    #[test]
    fn test_oversized_reply_sends_einval() {
        let registry = DispatchRegistry::new();
        let sink = Recorder::default();
        registry
            .register(
                Mrq::QUERY_TAG,
                Arc::new(|_: &InboundRequest, r: Responder<'_>| {
                    assert!(r.reply(0, &[0; MAX_PAYLOAD + 1]).is_err());
                }),
            )
            .unwrap();
        run(&registry, &sink, &request(Mrq::QUERY_TAG, &[]));
        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1, -errno::EINVAL);
    }

    #[test]
    fn test_register_from_handler_is_reentrant() {
        let registry = Arc::new(DispatchRegistry::new());
        let sink = Recorder::default();
        let inner = registry.clone();
        let result = Arc::new(std::sync::Mutex::new(None));
        let seen = result.clone();
        registry
            .register(
                Mrq::PING,
                Arc::new(move |_: &InboundRequest, r: Responder<'_>| {
                    let noop: MrqHandler = Arc::new(|_: &InboundRequest, _r: Responder<'_>| {});
                    *seen.lock().unwrap() = Some(inner.register(Mrq(50), noop));
                    let _ = r.reply(0, &[]);
                }),
            )
            .unwrap();

        run(&registry, &sink, &request(Mrq::PING, &[]));
        assert_eq!(*result.lock().unwrap(), Some(Err(MailboxError::Reentrant)));
        assert!(!in_dispatch());
    }

    #[test]
    fn test_module_mail_routing() {
        let registry = DispatchRegistry::new();
        let sink = Recorder::default();
        registry
            .register_module(
                ModuleBase(0x8000_1000),
                Arc::new(|base: ModuleBase, data: &[u8], r: Responder<'_>| {
                    assert_eq!(base, ModuleBase(0x8000_1000));
                    let _ = r.reply(data[0] as i32, &[]);
                }),
            )
            .unwrap();
        assert_eq!(
            registry.register_module(
                ModuleBase(0x8000_1000),
                Arc::new(|_: ModuleBase, _: &[u8], _r: Responder<'_>| {})
            ),
            Err(MailboxError::ModuleAlreadyRegistered { base: 0x8000_1000 })
        );

        let mut payload = 0x8000_1000u32.to_le_bytes().to_vec();
        payload.push(7);
        run(&registry, &sink, &request(Mrq::MODULE_MAIL, &payload));
        run(&registry, &sink, &request(Mrq::MODULE_MAIL, &0x1234u32.to_le_bytes()));

        let replies = sink.replies.lock().unwrap();
        assert_eq!(replies[0].1, 7);
        assert_eq!(replies[1].1, -errno::ENODEV);
        drop(replies);

        registry.cancel_module(ModuleBase(0x8000_1000)).unwrap();
        assert_eq!(
            registry.cancel_module(ModuleBase(0x8000_1000)),
            Err(MailboxError::ModuleNotRegistered { base: 0x8000_1000 })
        );
    }
}
