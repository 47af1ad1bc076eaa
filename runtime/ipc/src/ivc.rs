//! Shared area of the ring/doorbell transport
//!
//! Each channel is a pair of single-frame rings plus one link-state word per
//! side. Both sides run the same reset handshake on their own view of the
//! channel:
//!
//! ```text
//! peer SYNC                      -> rewind own indices, own = ACK
//! own SYNC and peer ACK          -> rewind own indices, own = ESTABLISHED
//! own ACK and peer ACK|ESTABLISHED -> own = ESTABLISHED
//! ```
//!
//! No frames may be exchanged until both words read ESTABLISHED.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::{IpcError, Result, SharedRing};

/// Slots per direction; one frame in flight per direction
pub const RING_SLOTS: usize = 2;

pub type FrameQueue = SharedRing<RING_SLOTS>;

/// Per-side link state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LinkState {
    Established = 0,
    Sync = 1,
    Ack = 2,
}

impl LinkState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => LinkState::Established,
            2 => LinkState::Ack,
            _ => LinkState::Sync,
        }
    }
}

/// Which end of the channel a view belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

pub struct IvcChannel {
    to_remote: FrameQueue,
    to_local: FrameQueue,
    local_link: AtomicU32,
    remote_link: AtomicU32,
}

impl IvcChannel {
    fn new() -> Self {
        Self {
            to_remote: FrameQueue::new(),
            to_local: FrameQueue::new(),
            local_link: AtomicU32::new(LinkState::Sync as u32),
            remote_link: AtomicU32::new(LinkState::Sync as u32),
        }
    }

    /// View of the channel from one side
    pub fn endpoint(&self, side: Side) -> IvcEndpoint<'_> {
        match side {
            Side::Local => IvcEndpoint {
                tx: &self.to_remote,
                rx: &self.to_local,
                own: &self.local_link,
                peer: &self.remote_link,
            },
            Side::Remote => IvcEndpoint {
                tx: &self.to_local,
                rx: &self.to_remote,
                own: &self.remote_link,
                peer: &self.local_link,
            },
        }
    }
}

/// One side's view: what it transmits, what it receives, and the link words
pub struct IvcEndpoint<'a> {
    tx: &'a FrameQueue,
    rx: &'a FrameQueue,
    own: &'a AtomicU32,
    peer: &'a AtomicU32,
}

impl<'a> IvcEndpoint<'a> {
    pub fn tx(&self) -> &'a FrameQueue {
        self.tx
    }

    pub fn rx(&self) -> &'a FrameQueue {
        self.rx
    }

    pub fn link_state(&self) -> LinkState {
        LinkState::from_raw(self.own.load(Ordering::Acquire))
    }

    pub fn peer_link_state(&self) -> LinkState {
        LinkState::from_raw(self.peer.load(Ordering::Acquire))
    }

    /// Both sides agree the link is up
    pub fn is_established(&self) -> bool {
        self.link_state() == LinkState::Established
            && self.peer_link_state() == LinkState::Established
    }

    /// Start (or restart) the handshake from this side
    pub fn reset(&self) {
        self.rewind();
        self.own.store(LinkState::Sync as u32, Ordering::Release);
    }

    /// Advance the handshake after the peer rang the doorbell
    ///
    /// Returns `true` once this side considers the link established. The
    /// caller should ring the peer whenever the state changed.
    pub fn notified(&self) -> bool {
        let own = self.link_state();
        let peer = self.peer_link_state();

        let next = match (own, peer) {
            (_, LinkState::Sync) if own != LinkState::Ack => {
                self.rewind();
                Some(LinkState::Ack)
            }
            (LinkState::Sync, LinkState::Ack) => {
                self.rewind();
                Some(LinkState::Established)
            }
            (LinkState::Ack, LinkState::Ack) | (LinkState::Ack, LinkState::Established) => {
                Some(LinkState::Established)
            }
            _ => None,
        };

        if let Some(state) = next {
            log::trace!("ivc link {:?} -> {:?} (peer {:?})", own, state, peer);
            self.own.store(state as u32, Ordering::Release);
        }

        self.link_state() == LinkState::Established
    }

    fn rewind(&self) {
        self.tx.reset_head();
        self.rx.reset_tail();
    }
}

pub struct IvcSharedArea {
    channels: Box<[IvcChannel]>,
}

impl IvcSharedArea {
    pub fn new(channels: usize) -> Self {
        Self {
            channels: (0..channels).map(|_| IvcChannel::new()).collect(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// # Errors
    /// Returns `IpcError::InvalidChannel` if `channel` is out of range
    pub fn channel(&self, channel: usize) -> Result<&IvcChannel> {
        self.channels
            .get(channel)
            .ok_or(IpcError::InvalidChannel { channel })
    }
}
