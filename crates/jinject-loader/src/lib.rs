//! Native library injection into debuggable Android processes.
//!
//! The process must have been started waiting for a debugger
//! (`am start -D`). [`Injector::inject`] attaches over a forwarded JDWP port,
//! suspends the app at its startup checkpoints, and loads the interceptor and
//! instrumentation libraries from inside the app before any of its own code
//! runs.

mod abi;
mod back_channel;
mod checkpoint;
mod exec;
mod inject;
mod tooling;

pub use abi::{Abi, UnknownAbi};
pub use back_channel::{BackChannel, BackChannelError, BackChannelListener, TcpBackChannel};
pub use checkpoint::{
    wait_for_checkpoint, wait_for_on_create, wait_for_vulkan_load, Checkpoint, CheckpointOutcome,
    CheckpointPolicy,
};
pub use exec::{with_suspended_thread, Arg, ExecError, MethodSelector, Outcome, Slot, Transaction};
pub use inject::{
    Degradation, ForwardError, InjectError, InjectErrorKind, InjectOptions, Injection, Injector,
    Stage,
};
pub use tooling::{
    LibraryDescriptors, LibraryPaths, LibsDirEntry, ToolingError, ToolingPaths,
    DEFAULT_INSTRUMENTATION_LIBRARY, DEFAULT_INTERCEPTOR_LIBRARY,
};
