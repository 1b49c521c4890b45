use std::io;

use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;

pub const EVENT_KIND_SINGLE_STEP: u8 = 1;
pub const EVENT_KIND_BREAKPOINT: u8 = 2;
pub const EVENT_KIND_CLASS_PREPARE: u8 = 8;
pub const EVENT_KIND_METHOD_ENTRY: u8 = 40;
pub const EVENT_KIND_VM_START: u8 = 90;
pub const EVENT_KIND_VM_DEATH: u8 = 99;

pub const SUSPEND_POLICY_NONE: u8 = 0;
pub const SUSPEND_POLICY_EVENT_THREAD: u8 = 1;
pub const SUSPEND_POLICY_ALL: u8 = 2;

pub const EVENT_MODIFIER_KIND_COUNT: u8 = 1;
pub const EVENT_MODIFIER_KIND_THREAD_ONLY: u8 = 3;
pub const EVENT_MODIFIER_KIND_CLASS_ONLY: u8 = 4;
pub const EVENT_MODIFIER_KIND_CLASS_MATCH: u8 = 5;
pub const EVENT_MODIFIER_KIND_LOCATION_ONLY: u8 = 7;

/// `InvokeOptions.INVOKE_SINGLE_THREADED`: only the invoking thread is resumed
/// for the duration of the call.
pub const INVOKE_SINGLE_THREADED: u32 = 0x01;

pub const TYPE_TAG_CLASS: u8 = 1;

/// Value tags (`JDWP.Tag`) for reference values.
pub const TAG_OBJECT: u8 = b'L';
pub const TAG_STRING: u8 = b's';
pub const TAG_THREAD: u8 = b't';
pub const TAG_ARRAY: u8 = b'[';

pub const ERROR_INVALID_THREAD: u16 = 10;
pub const ERROR_THREAD_NOT_SUSPENDED: u16 = 13;
pub const ERROR_INVALID_OBJECT: u16 = 20;
pub const ERROR_INVALID_CLASS: u16 = 21;
pub const ERROR_INVALID_METHODID: u16 = 23;
pub const ERROR_INVALID_FIELDID: u16 = 25;
pub const ERROR_INVALID_FRAMEID: u16 = 30;
pub const ERROR_INVALID_SLOT: u16 = 35;
pub const ERROR_NOT_IMPLEMENTED: u16 = 99;
pub const ERROR_ABSENT_INFORMATION: u16 = 101;

/// Sizes (in bytes) of the variable-width identifiers, as reported by
/// `VirtualMachine.IDSizes`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Any reference value; `tag` keeps the JDWP tag (`L`, `s`, `t`, `[`...).
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub const fn null() -> Self {
        Self::Object {
            tag: TAG_OBJECT,
            id: 0,
        }
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        match *self {
            Self::Object { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Object { id: 0, .. })
    }

    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
            JdwpValue::Void => b'V',
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    /// Whether the variable is live at `index` within its method.
    pub fn in_scope_at(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index + u64::from(self.length)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmVersion {
    pub description: String,
    pub jdwp_major: i32,
    pub jdwp_minor: i32,
    pub vm_version: String,
    pub vm_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JdwpEvent {
    SingleStep {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    MethodEntry {
        request_id: i32,
        thread: ThreadId,
        location: Location,
    },
    ClassPrepare {
        request_id: i32,
        thread: ThreadId,
        ref_type_tag: u8,
        type_id: ReferenceTypeId,
        signature: String,
        status: u32,
    },
    VmStart {
        request_id: i32,
        thread: ThreadId,
    },
    VmDeath,
}

impl JdwpEvent {
    pub fn request_id(&self) -> Option<i32> {
        match self {
            JdwpEvent::SingleStep { request_id, .. }
            | JdwpEvent::Breakpoint { request_id, .. }
            | JdwpEvent::MethodEntry { request_id, .. }
            | JdwpEvent::ClassPrepare { request_id, .. }
            | JdwpEvent::VmStart { request_id, .. } => Some(*request_id),
            JdwpEvent::VmDeath => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for the VM")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("the VM exited")]
    VmDeath,
    #[error("VM replied with error code {0}")]
    VmError(u16),
    #[error("class {signature} is not loaded in the target VM")]
    ClassNotFound { signature: String },
    #[error("method {name}{} not found on {class}", .signature.as_deref().unwrap_or(""))]
    MethodNotFound {
        class: String,
        name: String,
        signature: Option<String>,
    },
}

impl JdwpError {
    /// Errors that mean "the target does not expose this class/method", as
    /// opposed to transport or VM failures.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            JdwpError::ClassNotFound { .. } | JdwpError::MethodNotFound { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JdwpError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_not_found_mentions_the_descriptor() {
        let err = JdwpError::MethodNotFound {
            class: "Landroid/app/Application;".into(),
            name: "onCreate".into(),
            signature: Some("()V".into()),
        };
        assert_eq!(
            err.to_string(),
            "method onCreate()V not found on Landroid/app/Application;"
        );
        assert!(err.is_resolution());
        assert!(!JdwpError::Timeout.is_resolution());
    }

    #[test]
    fn variable_scope_is_half_open() {
        let var = VariableInfo {
            code_index: 4,
            name: "x".into(),
            signature: "I".into(),
            length: 2,
            slot: 1,
        };
        assert!(!var.in_scope_at(3));
        assert!(var.in_scope_at(4));
        assert!(var.in_scope_at(5));
        assert!(!var.in_scope_at(6));
    }
}
