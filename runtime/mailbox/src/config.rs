//! Mailbox configuration and static channel numbering

use core::time::Duration;

use crate::error::{MailboxError, Result};

/// Default number of CPUs with a synchronous channel
pub const DEFAULT_CPU_COUNT: usize = 4;

/// Default size of the thread-channel pool
pub const DEFAULT_THREAD_CHANNELS: usize = 7;

/// Upper bound on thread channels (allocator bitmaps are 32 bits wide)
pub const MAX_THREAD_CHANNELS: usize = 32;

/// Target the mailbox runs on; pre-silicon models are much slower
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    #[default]
    Silicon,
    PreSilicon,
}

/// Bounded waits used by every call discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Channel free / ack / completion / pool slot wait
    pub channel: Duration,
    /// Initial handshake busy-wait
    pub handshake: Duration,
}

impl Timeouts {
    pub const fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Silicon => Self {
                channel: Duration::from_secs(1),
                handshake: Duration::from_secs(5),
            },
            Platform::PreSilicon => Self {
                channel: Duration::from_secs(60),
                handshake: Duration::from_secs(120),
            },
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::for_platform(Platform::Silicon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxConfig {
    pub cpu_count: usize,
    pub thread_channels: usize,
    pub timeouts: Timeouts,
}

impl MailboxConfig {
    /// Defaults with timeouts chosen for `platform`
    pub fn for_platform(platform: Platform) -> Self {
        Self {
            timeouts: Timeouts::for_platform(platform),
            ..Self::default()
        }
    }

    /// Override the channel timeout
    pub fn with_channel_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.channel = timeout;
        self
    }

    /// Override the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake = timeout;
        self
    }

    /// # Errors
    /// Returns `MailboxError::InvalidArgument` if the layout is empty or
    /// the pool exceeds the allocator width
    pub fn validate(&self) -> Result<()> {
        if self.cpu_count == 0 {
            return Err(MailboxError::InvalidArgument("cpu_count must be non-zero"));
        }
        if self.thread_channels == 0 || self.thread_channels > MAX_THREAD_CHANNELS {
            return Err(MailboxError::InvalidArgument(
                "thread_channels must be between 1 and 32",
            ));
        }
        if self.timeouts.channel.is_zero() || self.timeouts.handshake.is_zero() {
            return Err(MailboxError::InvalidArgument("timeouts must be non-zero"));
        }
        Ok(())
    }

    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout {
            cpu_count: self.cpu_count,
            thread_count: self.thread_channels,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            cpu_count: DEFAULT_CPU_COUNT,
            thread_channels: DEFAULT_THREAD_CHANNELS,
            timeouts: Timeouts::default(),
        }
    }
}

/// Role a channel index is statically assigned to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// Synchronous channel owned by one CPU
    PerCpu { cpu: usize },
    /// Pool channel for blocking calls
    Thread { slot: usize },
    /// Remote-initiated requests
    Inbound,
}

/// Static numbering: per-CPU channels, then thread channels, then inbound
///
/// ```text
/// | cpu 0 .. cpu C-1 | thread 0 .. thread N-1 | inbound |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub cpu_count: usize,
    pub thread_count: usize,
}

impl ChannelLayout {
    pub fn total(&self) -> usize {
        self.cpu_count + self.thread_count + 1
    }

    pub fn per_cpu(&self, cpu: usize) -> Result<usize> {
        if cpu >= self.cpu_count {
            return Err(MailboxError::CpuOutOfRange { cpu });
        }
        Ok(cpu)
    }

    pub fn thread(&self, slot: usize) -> usize {
        debug_assert!(slot < self.thread_count);
        self.cpu_count + slot
    }

    pub fn first_thread(&self) -> usize {
        self.cpu_count
    }

    pub fn inbound(&self) -> usize {
        self.cpu_count + self.thread_count
    }

    pub fn role(&self, channel: usize) -> Option<ChannelRole> {
        if channel < self.cpu_count {
            Some(ChannelRole::PerCpu { cpu: channel })
        } else if channel < self.inbound() {
            Some(ChannelRole::Thread {
                slot: channel - self.cpu_count,
            })
        } else if channel == self.inbound() {
            Some(ChannelRole::Inbound)
        } else {
            None
        }
    }

    /// Channels the local side writes requests into
    pub fn outbound_channels(&self) -> core::ops::Range<usize> {
        0..self.inbound()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = MailboxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.layout().total(), 12);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let mut config = MailboxConfig::default();
        config.cpu_count = 0;
        assert!(config.validate().is_err());

        let mut config = MailboxConfig::default();
        config.thread_channels = MAX_THREAD_CHANNELS + 1;
        assert!(config.validate().is_err());

        let config = MailboxConfig::default().with_channel_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_platform_timeouts() {
        let silicon = Timeouts::for_platform(Platform::Silicon);
        let presilicon = Timeouts::for_platform(Platform::PreSilicon);
        assert_eq!(silicon.channel, Duration::from_secs(1));
        assert!(presilicon.channel > silicon.channel);
        assert_eq!(
            MailboxConfig::for_platform(Platform::PreSilicon).timeouts,
            presilicon
        );
    }

    #[test]
    fn test_layout_roles() {
        let layout = ChannelLayout {
            cpu_count: 2,
            thread_count: 3,
        };
        assert_eq!(layout.per_cpu(1), Ok(1));
        assert_eq!(layout.per_cpu(2), Err(MailboxError::CpuOutOfRange { cpu: 2 }));
        assert_eq!(layout.thread(0), 2);
        assert_eq!(layout.inbound(), 5);
        assert_eq!(layout.total(), 6);

        assert_eq!(layout.role(0), Some(ChannelRole::PerCpu { cpu: 0 }));
        assert_eq!(layout.role(4), Some(ChannelRole::Thread { slot: 2 }));
        assert_eq!(layout.role(5), Some(ChannelRole::Inbound));
        assert_eq!(layout.role(6), None);
        assert_eq!(layout.outbound_channels(), 0..5);
    }
}
