//! Wire-level JDWP implementation.
//!
//! Speaks the JDWP binary protocol over TCP. Async (`tokio`) and
//! cancellation-aware: every pending reply is failed when the connection or
//! the client shuts down.

mod client;
mod codec;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use codec::class_name_to_signature;
pub use types::{
    ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes,
    JdwpValue, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result, ThreadId,
    VariableInfo, VmVersion,
};

// The mock VM is only needed for tests. It is always compiled for this crate's
// own unit tests and exported to downstream crates behind `test-support`.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
