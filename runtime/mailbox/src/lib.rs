//! BPMP Mailbox - CPU side of the CPU↔BPMP message channel protocol
//!
//! # Purpose
//! Lets any component exchange fixed-size messages with the BPMP: post a
//! message, make a round trip from interrupt context, or make a round trip
//! that sleeps. Requests the BPMP starts are routed to registered handlers.
//!
//! # Integration Points
//! - Depends on: `bpmp-ipc` shared memory, a platform `CpuContext`
//! - Provides to: `bpmp-services` and any driver that talks to the BPMP
//! - IPC endpoints: per-CPU channels, a thread-channel pool, one inbound channel
//! - Capabilities required: shared memory mapping plus a doorbell interrupt
//!
//! # Architecture
//! ```text
//! caller ─▶ Mailbox ─▶ ChannelTable ─▶ dyn Transport (raw | ivc) ─▶ shared area
//!              ▲                                                       │
//!              └──── handle_irq ◀── doorbell ◀──────── remote ◀────────┘
//! ```
//! `Mailbox` is an explicit handle created once at startup; there is no
//! global state.
//!
//! # Testing Strategy
//! - Unit tests: state transitions, pool accounting, dispatch routing
//! - Integration tests: full protocol against `bpmp-mock` for both transports
//! - Benchmarks: round-trip latency per call discipline (`benches/round_trip.rs`)

mod channel;
mod config;
mod cpu;
mod dispatch;
mod error;
mod mailbox;
mod mrq;
mod pool;
pub mod transport;

pub use channel::{ChannelDescriptor, ChannelTable};
pub use config::{
    ChannelLayout, ChannelRole, MailboxConfig, Platform, Timeouts, DEFAULT_CPU_COUNT,
    DEFAULT_THREAD_CHANNELS, MAX_THREAD_CHANNELS,
};
pub use cpu::{CpuContext, HostCpu, IrqGuard};
pub use dispatch::{
    in_dispatch, DispatchRegistry, InboundRequest, ModuleBase, ModuleHandler, MrqHandler,
    Responder, MAX_HANDLERS,
};
pub use error::{check_code, MailboxError, Result, WaitPhase};
pub use mailbox::{Mailbox, MailboxStats};
pub use pool::PoolStatus;
pub use mrq::{errno, Mrq, MAX_MRQ};
pub use transport::{probe, SharedArea, Transport};

pub use bpmp_ipc::{FrameFlags, MessageFrame, MAX_PAYLOAD};
