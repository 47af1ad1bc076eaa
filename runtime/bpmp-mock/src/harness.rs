//! Simulated system: shared area, mock firmware and a mailbox wired together

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use bpmp_ipc::{IvcSharedArea, RawSharedArea};
use bpmp_mailbox::{
    probe, CpuContext, HostCpu, Mailbox, MailboxConfig, MailboxError, SharedArea,
};

use crate::{MockBpmp, MockBuilder};

/// Which shared-area scheme the simulated device uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Raw,
    Ivc,
}

impl TransportKind {
    pub const ALL: [TransportKind; 2] = [TransportKind::Raw, TransportKind::Ivc];

    /// Devicetree compatible the device advertises
    pub fn compatible(self) -> &'static str {
        match self {
            TransportKind::Raw => "nvidia,tegra210-bpmp",
            TransportKind::Ivc => "nvidia,tegra186-bpmp",
        }
    }

    fn allocate(self, channels: usize) -> Result<SharedArea, MailboxError> {
        Ok(match self {
            TransportKind::Raw => SharedArea::Raw(Arc::new(RawSharedArea::new(channels)?)),
            TransportKind::Ivc => SharedArea::Ivc(Arc::new(IvcSharedArea::new(channels))),
        })
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Raw => f.write_str("raw"),
            TransportKind::Ivc => f.write_str("ivc"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(TransportKind::Raw),
            "ivc" => Ok(TransportKind::Ivc),
            other => Err(format!("unknown transport {:?} (expected raw or ivc)", other)),
        }
    }
}

/// A mailbox talking to mock firmware over a fresh shared area
///
/// The firmware's interrupt calls `Mailbox::handle_irq` through a weak
/// reference, so dropping the system tears everything down. Interrupts are
/// taken on `irq_cpu`, the highest CPU of the layout, whichever thread the
/// firmware raises them from.
pub struct SimSystem {
    pub kind: TransportKind,
    pub mailbox: Arc<Mailbox>,
    pub bpmp: MockBpmp,
    pub irq_cpu: usize,
}

impl SimSystem {
    /// Build and connect
    pub fn start(
        kind: TransportKind,
        config: MailboxConfig,
        firmware: MockBuilder,
    ) -> Result<Self, MailboxError> {
        let system = Self::assemble(kind, config, firmware)?;
        system.mailbox.connect()?;
        Ok(system)
    }

    /// Build without connecting
    pub fn assemble(
        kind: TransportKind,
        config: MailboxConfig,
        firmware: MockBuilder,
    ) -> Result<Self, MailboxError> {
        config.validate()?;
        let layout = config.layout();
        let area = kind.allocate(layout.total())?;

        let bpmp = firmware.build(layout, area.clone());
        let transport = probe(&[kind.compatible()], area, bpmp.doorbell())?;
        let mailbox = Arc::new(Mailbox::new(config, transport, Arc::new(HostCpu))?);

        let irq_cpu = layout.cpu_count - 1;
        let weak = Arc::downgrade(&mailbox);
        bpmp.set_irq_handler(move || {
            if let Some(mailbox) = weak.upgrade() {
                let _cpu = CpuBinding::enter(irq_cpu);
                mailbox.handle_irq();
            }
        });

        Ok(Self {
            kind,
            mailbox,
            bpmp,
            irq_cpu,
        })
    }
}

/// Runs the current thread as `cpu` until dropped
struct CpuBinding {
    previous: usize,
}

impl CpuBinding {
    fn enter(cpu: usize) -> Self {
        let previous = HostCpu.current_cpu();
        HostCpu::bind_current(cpu);
        Self { previous }
    }
}

impl Drop for CpuBinding {
    fn drop(&mut self) {
        HostCpu::bind_current(self.previous);
    }
}
