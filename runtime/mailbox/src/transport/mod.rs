//! Transport Backends - Raw channel primitives behind one interface
//!
//! # Purpose
//! Hides how a channel's state is encoded in hardware. The mailbox core only
//! ever asks "may I write", "is there something to read", "is my request
//! acknowledged", and tells the backend to hand off, release, and ring.
//!
//! # Backends
//! - `RawTransport`: 2-bit semaphore state per channel plus a ready bit
//! - `IvcTransport`: single-frame SPSC rings per direction plus a doorbell
//!
//! # Failure Semantics
//! Queries never block and never mutate state, with one documented
//! exception in the raw backend (see `RawTransport::outbound_free`). Actions
//! that find the channel in the wrong state fail without touching it.

use std::sync::Arc;
use std::time::Duration;

use bpmp_ipc::{Doorbell, FrameRef, IvcSharedArea, RawSharedArea};

use crate::error::{MailboxError, Result};

mod ivc;
mod raw;

pub use ivc::IvcTransport;
pub use raw::RawTransport;

/// Devicetree compatibles served by the raw semaphore backend
pub const RAW_COMPATIBLE: &[&str] = &["nvidia,tegra210-bpmp"];

/// Devicetree compatibles served by the ring/doorbell backend
pub const IVC_COMPATIBLE: &[&str] = &["nvidia,tegra186-bpmp", "nvidia,tegra194-bpmp"];

/// The two frames of one channel as mapped by a backend
#[derive(Debug, Clone)]
pub struct ChannelFrames {
    /// Written by the remote, read locally
    pub inbound: FrameRef,
    /// Written locally, read by the remote
    pub outbound: FrameRef,
}

/// Per-hardware-variant channel primitives
pub trait Transport: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Number of channels the shared area provides
    fn channel_count(&self) -> usize;

    /// Resolve the frames backing `channel`
    fn map_channel(&self, channel: usize) -> Result<ChannelFrames>;

    /// Local side may write a new request into `channel`
    fn outbound_free(&self, channel: usize) -> bool;

    /// Remote has placed a fresh request into `channel`
    fn inbound_signalled(&self, channel: usize) -> bool;

    /// Remote finished the last local request on `channel`; reply ready
    fn outbound_acked(&self, channel: usize) -> bool;

    /// Hand the freshly written outbound frame to the remote
    fn signal_remote(&self, channel: usize) -> Result<()>;

    /// Mark the inbound frame consumed, returning the channel to free
    fn release_after_read(&self, channel: usize) -> Result<()>;

    /// Publish a reply to a remote-initiated request on `channel`
    ///
    /// Called after `release_after_read` and only when the request asked
    /// for an acknowledgement.
    fn post_reply(&self, channel: usize) -> Result<()>;

    /// Wake the remote for `channel`
    fn ring_doorbell(&self, channel: usize);

    /// One-time synchronisation with the remote; busy-waits up to `timeout`
    fn handshake(&self, timeout: Duration) -> Result<()>;

    /// Re-synchronise after a local suspend without dropping channel state
    fn resume(&self, timeout: Duration) -> Result<()>;
}

/// Shared memory handed to `probe`
#[derive(Clone)]
pub enum SharedArea {
    Raw(Arc<RawSharedArea>),
    Ivc(Arc<IvcSharedArea>),
}

/// Pick the backend for a device from its compatible strings
///
/// The first compatible string that names a known backend wins; it must
/// agree with the kind of shared area provided.
///
/// # Errors
/// Returns `MailboxError::UnsupportedTransport` if no string matches or the
/// area does not fit the matched backend
pub fn probe(
    compatible: &[&str],
    area: SharedArea,
    doorbell: Arc<dyn Doorbell>,
) -> Result<Box<dyn Transport>> {
    for compat in compatible {
        if RAW_COMPATIBLE.contains(compat) {
            return match area {
                SharedArea::Raw(area) => {
                    log::info!("bpmp: {} using raw semaphore transport", compat);
                    Ok(Box::new(RawTransport::new(area, doorbell)?))
                }
                SharedArea::Ivc(_) => Err(MailboxError::UnsupportedTransport(compat.to_string())),
            };
        }
        if IVC_COMPATIBLE.contains(compat) {
            return match area {
                SharedArea::Ivc(area) => {
                    log::info!("bpmp: {} using ivc doorbell transport", compat);
                    Ok(Box::new(IvcTransport::new(area, doorbell)))
                }
                SharedArea::Raw(_) => Err(MailboxError::UnsupportedTransport(compat.to_string())),
            };
        }
    }
    Err(MailboxError::UnsupportedTransport(compatible.join(",")))
}
