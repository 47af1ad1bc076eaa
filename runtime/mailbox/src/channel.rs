//! Channel Table - Fixed descriptors mapping channel numbers to frames
//!
//! Built once from the transport at mailbox construction and never changed
//! afterwards. Ownership of a channel is not tracked here; the call
//! disciplines guarantee a single writer per channel.

use bpmp_ipc::{FrameFlags, FrameRef, MessageFrame, MAX_PAYLOAD};

use crate::config::{ChannelLayout, ChannelRole};
use crate::error::{MailboxError, Result};
use crate::transport::Transport;

/// One channel: role plus its two frames
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    pub index: usize,
    pub role: ChannelRole,
    /// Written by the remote
    pub inbound: FrameRef,
    /// Written locally
    pub outbound: FrameRef,
}

impl ChannelDescriptor {
    /// Fill the outbound frame with a request
    pub fn write_outbound(&self, code: i32, flags: FrameFlags, payload: &[u8]) -> Result<()> {
        let frame = MessageFrame::new(code, flags, payload)?;
        self.outbound.store(&frame);
        Ok(())
    }

    /// Copy the inbound payload into `out` and return the inbound code
    pub fn read_inbound(&self, out: &mut [u8]) -> i32 {
        let frame = self.inbound.load();
        let len = out.len().min(MAX_PAYLOAD);
        out[..len].copy_from_slice(&frame.data[..len]);
        frame.code
    }
}

pub struct ChannelTable {
    layout: ChannelLayout,
    channels: Box<[ChannelDescriptor]>,
}

impl ChannelTable {
    /// Map every channel in `layout` through `transport`
    ///
    /// # Errors
    /// Returns `MailboxError::InvalidArgument` if the transport's shared area
    /// has fewer channels than the layout needs
    pub fn build(layout: ChannelLayout, transport: &dyn Transport) -> Result<Self> {
        if transport.channel_count() < layout.total() {
            log::error!(
                "bpmp: {} transport has {} channels, layout needs {}",
                transport.name(),
                transport.channel_count(),
                layout.total()
            );
            return Err(MailboxError::InvalidArgument(
                "shared area smaller than channel layout",
            ));
        }

        let channels = (0..layout.total())
            .map(|index| {
                let frames = transport.map_channel(index)?;
                let role = layout
                    .role(index)
                    .ok_or(MailboxError::InvalidArgument("channel outside layout"))?;
                Ok(ChannelDescriptor {
                    index,
                    role,
                    inbound: frames.inbound,
                    outbound: frames.outbound,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            layout,
            channels: channels.into_boxed_slice(),
        })
    }

    pub fn layout(&self) -> ChannelLayout {
        self.layout
    }

    pub fn get(&self, channel: usize) -> Option<&ChannelDescriptor> {
        self.channels.get(channel)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelDescriptor> {
        self.channels.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawTransport;
    use bpmp_ipc::RawSharedArea;
    use std::sync::Arc;

    fn raw(channels: usize) -> RawTransport {
        let area = Arc::new(RawSharedArea::new(channels).unwrap());
        RawTransport::new(area, Arc::new(|_: usize| {})).unwrap()
    }

    #[test]
    fn test_build_assigns_roles() {
        let layout = ChannelLayout {
            cpu_count: 2,
            thread_count: 2,
        };
        let table = ChannelTable::build(layout, &raw(5)).unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.get(0).unwrap().role, ChannelRole::PerCpu { cpu: 0 });
        assert_eq!(table.get(3).unwrap().role, ChannelRole::Thread { slot: 1 });
        assert_eq!(table.get(4).unwrap().role, ChannelRole::Inbound);
        assert!(table.get(5).is_none());
    }

    #[test]
    fn test_build_rejects_small_area() {
        let layout = ChannelLayout {
            cpu_count: 4,
            thread_count: 4,
        };
        assert!(matches!(
            ChannelTable::build(layout, &raw(8)),
            Err(MailboxError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_descriptor_frame_access() {
        let layout = ChannelLayout {
            cpu_count: 1,
            thread_count: 1,
        };
        let table = ChannelTable::build(layout, &raw(3)).unwrap();
        let desc = table.get(0).unwrap();

        desc.write_outbound(7, FrameFlags::DO_ACK, &[1, 2, 3]).unwrap();
        assert_eq!(desc.outbound.code(), 7);
        assert_eq!(desc.outbound.flags(), FrameFlags::DO_ACK);

        desc.inbound
            .store(&MessageFrame::new(-2, FrameFlags::empty(), &[4, 5]).unwrap());
        let mut out = [0u8; 2];
        assert_eq!(desc.read_inbound(&mut out), -2);
        assert_eq!(out, [4, 5]);

        assert!(matches!(
            desc.write_outbound(0, FrameFlags::empty(), &[0; MAX_PAYLOAD + 1]),
            Err(MailboxError::InvalidArgument(_))
        ));
    }
}
