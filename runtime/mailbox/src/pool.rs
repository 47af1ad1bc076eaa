//! Thread-channel pool for the blocking call discipline
//!
//! A counting semaphore (a bounded channel pre-filled with one permit per
//! channel) limits how many callers can hold a thread channel; a bitmap under
//! a spin lock picks which one. The same lock guards the "awaiting
//! completion" mask that the doorbell interrupt scans, so a channel cannot be
//! completed while another CPU is allocating it.
//!
//! Every permit carries the pool epoch it was issued under. A reset drains
//! the semaphore and issues a fresh set, so a permit or lease from before the
//! reset can never be returned into the new generation.
//!
//! Invariant: free permits + allocated bits == pool size, except while a
//! caller sits between taking a permit and setting its bit.

use std::time::Instant;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use spin::Mutex;

use crate::cpu::{CpuContext, IrqGuard};
use crate::error::{MailboxError, Result, WaitPhase};
use crate::transport::Transport;

/// One-shot wakeup for a single in-flight request
struct Completion {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Completion {
    fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    fn complete(&self) {
        // A full channel already holds a wakeup
        let _ = self.tx.try_send(());
    }

    fn reset(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn wait(&self, deadline: Instant) -> bool {
        self.rx.recv_deadline(deadline).is_ok()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PoolState {
    /// Slot owned by a caller (or quarantined)
    allocated: u32,
    /// Request handed off, waiting for the remote
    awaiting: u32,
    /// Timed out; returned to the pool once the late reply is consumed
    stale: u32,
    /// Found busy at allocation; returned once the transport reports it free
    blocked: u32,
    /// Bumped on every reset so permits and leases from before a firmware
    /// reload are ignored
    epoch: u32,
}

/// Right to allocate one thread channel in the current pool generation
#[derive(Debug)]
pub(crate) struct Permit {
    epoch: u32,
}

/// Allocated thread channel
#[derive(Debug)]
pub(crate) struct Lease {
    pub slot: usize,
    pub channel: usize,
    epoch: u32,
}

/// Point-in-time view of the thread-channel pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub free_permits: usize,
    /// Slots held by callers or quarantined
    pub allocated: u32,
}

pub(crate) struct ThreadPool {
    first_channel: usize,
    size: usize,
    state: Mutex<PoolState>,
    permit_tx: Sender<u32>,
    permit_rx: Receiver<u32>,
    completions: Box<[Completion]>,
}

impl ThreadPool {
    pub fn new(first_channel: usize, size: usize) -> Self {
        debug_assert!(size > 0 && size <= 32);
        let (permit_tx, permit_rx) = bounded(size);
        let pool = Self {
            first_channel,
            size,
            state: Mutex::new(PoolState::default()),
            permit_tx,
            permit_rx,
            completions: (0..size).map(|_| Completion::new()).collect(),
        };
        for _ in 0..size {
            pool.release_permit(0);
        }
        pool
    }

    fn mask(&self) -> u32 {
        if self.size >= 32 {
            u32::MAX
        } else {
            (1u32 << self.size) - 1
        }
    }

    /// Block until a permit of the current generation is available or
    /// `deadline` passes
    pub fn acquire_permit(&self, cpu: &dyn CpuContext, deadline: Instant) -> Result<Permit> {
        loop {
            let epoch = self
                .permit_rx
                .recv_deadline(deadline)
                .map_err(|_| MailboxError::Timeout(WaitPhase::PoolSlot))?;
            let current = {
                let _irq = IrqGuard::new(cpu);
                self.state.lock().epoch
            };
            if epoch == current {
                return Ok(Permit { epoch });
            }
            log::debug!("bpmp: dropped thread pool permit from epoch {}", epoch);
        }
    }

    /// Return one permit tagged with `epoch`
    ///
    /// Callers hold the pool lock, so `epoch` is the live one and the
    /// semaphore can never already be full.
    fn release_permit(&self, epoch: u32) {
        match self.permit_tx.try_send(epoch) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::error!("bpmp: thread pool permit returned to a full pool");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::error!("bpmp: thread pool semaphore closed");
            }
        }
    }

    /// Allocate a channel and hand a request to the remote
    ///
    /// `start` writes the frame and signals the remote; it runs under the
    /// pool lock. The caller rings the doorbell after this returns. A permit
    /// from before a reset is consumed and the call fails with
    /// `NotConnected`.
    pub fn start<F>(
        &self,
        cpu: &dyn CpuContext,
        transport: &dyn Transport,
        permit: Permit,
        start: F,
    ) -> Result<Lease>
    where
        F: FnOnce(usize) -> Result<()>,
    {
        let _irq = IrqGuard::new(cpu);
        let mut st = self.state.lock();
        if st.epoch != permit.epoch {
            // The reset that bumped the epoch already issued a full set
            return Err(MailboxError::NotConnected);
        }
        self.reclaim_locked(&mut st, transport);

        let free = !st.allocated & self.mask();
        if free == 0 {
            self.release_permit(st.epoch);
            log::error!("bpmp: thread pool permit held but no free slot");
            return Err(MailboxError::ConsistencyFault {
                channel: self.first_channel,
            });
        }

        let slot = free.trailing_zeros() as usize;
        let bit = 1u32 << slot;
        let channel = self.first_channel + slot;

        if !transport.outbound_free(channel) {
            // Keep the slot out of circulation until the transport agrees
            st.allocated |= bit;
            st.blocked |= bit;
            log::error!(
                "bpmp: thread channel {} free in allocator but busy in transport",
                channel
            );
            return Err(MailboxError::ConsistencyFault { channel });
        }

        st.allocated |= bit;
        self.completions[slot].reset();
        if let Err(err) = start(channel) {
            st.allocated &= !bit;
            self.release_permit(st.epoch);
            return Err(err);
        }
        st.awaiting |= bit;

        Ok(Lease {
            slot,
            channel,
            epoch: st.epoch,
        })
    }

    /// Sleep until the interrupt handler completes `lease` or `deadline` passes
    ///
    /// On timeout the channel is quarantined rather than freed: the remote
    /// may still write the reply. A reset wakes the waiter with `NotConnected`.
    pub fn wait(&self, cpu: &dyn CpuContext, lease: &Lease, deadline: Instant) -> Result<()> {
        let woken = self.completions[lease.slot].wait(deadline);

        let bit = 1u32 << lease.slot;
        let _irq = IrqGuard::new(cpu);
        let mut st = self.state.lock();
        if st.epoch != lease.epoch {
            return Err(MailboxError::NotConnected);
        }
        if woken {
            return Ok(());
        }
        if st.awaiting & bit == 0 {
            // Completed between the timeout and taking the lock
            self.completions[lease.slot].reset();
            return Ok(());
        }
        st.awaiting &= !bit;
        st.stale |= bit;
        log::warn!(
            "bpmp: thread channel {} timed out, quarantined until the remote acks",
            lease.channel
        );
        Err(MailboxError::Timeout(WaitPhase::Completion))
    }

    /// Consume a completed lease's reply with `read`, then return the slot
    /// and permit
    ///
    /// `read` runs under the pool lock so a concurrent reset cannot hand the
    /// channel to a new caller midway. If it fails the slot stays out of
    /// circulation until the transport reports the channel free.
    pub fn finish<T, F>(&self, cpu: &dyn CpuContext, lease: Lease, read: F) -> Result<T>
    where
        F: FnOnce(usize) -> Result<T>,
    {
        let bit = 1u32 << lease.slot;
        let _irq = IrqGuard::new(cpu);
        let mut st = self.state.lock();
        if st.epoch != lease.epoch {
            return Err(MailboxError::NotConnected);
        }
        let result = read(lease.channel);
        if result.is_ok() {
            st.allocated &= !bit;
            self.release_permit(st.epoch);
        } else {
            st.blocked |= bit;
        }
        result
    }

    /// Interrupt-context scan: complete every awaiting channel the remote acked
    ///
    /// Returns the number of completions signalled.
    pub fn complete_acked(&self, transport: &dyn Transport) -> usize {
        let mut st = self.state.lock();
        let mut completed = 0;

        let mut pending = st.awaiting;
        while pending != 0 {
            let slot = pending.trailing_zeros() as usize;
            let bit = 1u32 << slot;
            pending &= !bit;

            if st.allocated & bit == 0 {
                log::error!(
                    "bpmp: thread channel {} awaiting but not allocated",
                    self.first_channel + slot
                );
                st.awaiting &= !bit;
                continue;
            }

            if transport.outbound_acked(self.first_channel + slot) {
                st.awaiting &= !bit;
                self.completions[slot].complete();
                completed += 1;
            }
        }

        self.reclaim_locked(&mut st, transport);
        completed
    }

    /// Put quarantined channels back once the remote is done with them
    fn reclaim_locked(&self, st: &mut PoolState, transport: &dyn Transport) -> usize {
        let mut reclaimed = 0;
        let mut pending = st.stale | st.blocked;
        while pending != 0 {
            let slot = pending.trailing_zeros() as usize;
            let bit = 1u32 << slot;
            pending &= !bit;
            let channel = self.first_channel + slot;

            // A timed-out request only settles with its reply; anything
            // else could hand the late reply to the next caller
            let settled = if st.stale & bit != 0 {
                transport.outbound_acked(channel) && transport.release_after_read(channel).is_ok()
            } else {
                transport.outbound_free(channel)
            };

            if settled {
                st.stale &= !bit;
                st.blocked &= !bit;
                st.allocated &= !bit;
                self.release_permit(st.epoch);
                reclaimed += 1;
                log::info!("bpmp: reclaimed thread channel {}", channel);
            }
        }
        reclaimed
    }

    /// Forget every allocation; used when the remote was reset
    ///
    /// Waiters of the old generation are woken and fail with `NotConnected`.
    pub fn reset(&self, cpu: &dyn CpuContext) {
        let _irq = IrqGuard::new(cpu);
        let mut st = self.state.lock();
        let epoch = st.epoch.wrapping_add(1);
        *st = PoolState {
            epoch,
            ..PoolState::default()
        };
        while self.permit_rx.try_recv().is_ok() {}
        for _ in 0..self.size {
            self.release_permit(epoch);
        }
        // `start` drains a slot's completion before reusing it
        for completion in self.completions.iter() {
            completion.reset();
            completion.complete();
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size,
            free_permits: self.free_permits(),
            allocated: self.allocated(),
        }
    }

    /// Allocated slot bitmap, for diagnostics
    pub fn allocated(&self) -> u32 {
        self.state.lock().allocated
    }

    pub fn free_permits(&self) -> usize {
        self.permit_rx.len()
    }
}
