//! Java Debug Wire Protocol support for jinject.
//!
//! Two layers live here:
//! - [`wire`]: the binary protocol itself (framing, command/reply correlation,
//!   event delivery) on top of tokio.
//! - [`session`]: a debug session facade that caches class and method lookups
//!   and turns method-entry breakpoints into awaitable checkpoints.
//!
//! The injector only needs a narrow slice of JDWP, so only the commands it (and
//! its diagnostics) use are implemented.

mod poison;
pub mod session;
pub mod wire;

pub use session::{argument_count, BreakpointHit, ClassDescriptor, DebugSession, MethodDescriptor};
pub use wire::{JdwpClient, JdwpClientConfig, JdwpError};

/// Length of a JDWP packet header (`length`, `id`, `flags`, and either
/// `command_set`/`command` or `error_code`).
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound on a single packet. Anything larger is treated as a corrupt
/// stream rather than allocated.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;
