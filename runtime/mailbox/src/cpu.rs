//! Local CPU identity and interrupt masking
//!
//! The atomic call discipline is only sound while the caller cannot be
//! preempted or interrupted on its CPU, and the pool lock is shared with the
//! doorbell interrupt handler. Both needs go through `CpuContext` so a
//! platform can plug in its real `DAIF`/`cli` handling while host builds
//! model each thread as a CPU with its own interrupt mask.

use std::cell::Cell;

/// Per-CPU state the mailbox needs from the platform
pub trait CpuContext: Send + Sync {
    /// Index of the CPU executing the caller
    fn current_cpu(&self) -> usize;

    /// Whether local interrupts are masked on the current CPU
    fn irqs_disabled(&self) -> bool;

    /// Mask local interrupts, returning whether they were already masked
    fn disable_irqs(&self) -> bool;

    /// Restore the mask saved by `disable_irqs`
    fn restore_irqs(&self, was_disabled: bool);
}

/// Interrupts masked for the lifetime of the guard
pub struct IrqGuard<'a> {
    cpu: &'a dyn CpuContext,
    was_disabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(cpu: &'a dyn CpuContext) -> Self {
        let was_disabled = cpu.disable_irqs();
        Self { cpu, was_disabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.cpu.restore_irqs(self.was_disabled);
    }
}

thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static IRQS_OFF: Cell<bool> = const { Cell::new(false) };
}

/// Host model: every OS thread is a CPU with its own interrupt mask
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCpu;

impl HostCpu {
    /// Make the calling thread act as CPU `cpu`
    pub fn bind_current(cpu: usize) {
        CPU_ID.with(|id| id.set(cpu));
    }
}

impl CpuContext for HostCpu {
    fn current_cpu(&self) -> usize {
        CPU_ID.with(Cell::get)
    }

    fn irqs_disabled(&self) -> bool {
        IRQS_OFF.with(Cell::get)
    }

    fn disable_irqs(&self) -> bool {
        IRQS_OFF.with(|off| off.replace(true))
    }

    fn restore_irqs(&self, was_disabled: bool) {
        IRQS_OFF.with(|off| off.set(was_disabled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nests() {
        let cpu = HostCpu;
        assert!(!cpu.irqs_disabled());
        {
            let _outer = IrqGuard::new(&cpu);
            assert!(cpu.irqs_disabled());
            {
                let _inner = IrqGuard::new(&cpu);
                assert!(cpu.irqs_disabled());
            }
            assert!(cpu.irqs_disabled());
        }
        assert!(!cpu.irqs_disabled());
    }

    #[test]
    fn test_bind_is_per_thread() {
        HostCpu::bind_current(2);
        assert_eq!(HostCpu.current_cpu(), 2);
        let other = std::thread::spawn(|| HostCpu.current_cpu()).join().unwrap();
        assert_eq!(other, 0);
    }
}
