//! Ordered batches of evaluation steps run on one suspended thread.
//!
//! A [`Transaction`] is built up front and then committed as a unit: each step
//! may refer to the results of earlier steps through a [`Slot`], steps run
//! strictly in order, and the first failing step aborts the rest.

use std::{collections::HashMap, fmt};

use jinject_jdwp::{
    argument_count,
    wire::{
        types::INVOKE_SINGLE_THREADED, FrameInfo, JdwpError, JdwpValue, MethodInfo, ObjectId,
        ReferenceTypeId, ThreadId, VariableInfo,
    },
    DebugSession,
};
use tokio_util::sync::CancellationToken;

use crate::{abi::UnknownAbi, tooling::ToolingError};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error(transparent)]
    Jdwp(#[from] JdwpError),
    #[error("no static field {field} on {class}")]
    FieldNotFound { class: String, field: String },
    #[error("no local variable {name} in scope")]
    LocalNotFound { name: String },
    #[error("no method {name} on {class} matching {wanted}")]
    MethodNotFound {
        class: String,
        name: String,
        wanted: String,
    },
    #[error("thread {0:#x} has no frames")]
    NoFrames(ThreadId),
    #[error("{method} threw exception object {exception:#x}")]
    Exception { method: String, exception: ObjectId },
    #[error("{0} does not hold a non-null object")]
    NotAnObject(Slot),
    #[error("{0} was not produced by this transaction")]
    InvalidSlot(Slot),
    #[error("{what} failed: {message}")]
    Rejected { what: String, message: String },
    #[error(transparent)]
    UnknownAbi(#[from] UnknownAbi),
    #[error(transparent)]
    Tooling(#[from] ToolingError),
    #[error("transaction cancelled")]
    Cancelled,
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled | ExecError::Jdwp(JdwpError::Cancelled))
    }
}

/// Handle to the value produced by a transaction step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Slot(usize);

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot #{}", self.0)
    }
}

/// An argument to an invocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Arg {
    Slot(Slot),
    Null,
    Value(JdwpValue),
}

impl From<Slot> for Arg {
    fn from(slot: Slot) -> Self {
        Arg::Slot(slot)
    }
}

/// Selects a method by name and, optionally, its exact JNI descriptor.
/// Without a descriptor, the first method of that name whose parameter count
/// matches the call's arguments is used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSelector {
    pub name: String,
    pub descriptor: Option<String>,
}

impl MethodSelector {
    pub fn exact(name: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descriptor: Some(descriptor.into()),
        }
    }

    fn select<'a>(&self, methods: &'a [MethodInfo], args: usize) -> Option<&'a MethodInfo> {
        methods.iter().find(|m| {
            m.name == self.name
                && match &self.descriptor {
                    Some(descriptor) => &m.signature == descriptor,
                    None => argument_count(&m.signature) == Some(args),
                }
        })
    }

    fn wanted(&self, args: usize) -> String {
        match &self.descriptor {
            Some(descriptor) => descriptor.clone(),
            None => format!("{args} argument(s)"),
        }
    }
}

impl From<&str> for MethodSelector {
    fn from(name: &str) -> Self {
        Self {
            name: name.to_string(),
            descriptor: None,
        }
    }
}

type Derive = Box<dyn FnOnce(&str) -> Result<String, ExecError> + Send>;

enum Op {
    StaticField {
        class: String,
        field: String,
    },
    Local {
        name: String,
    },
    SetLocal {
        name: String,
        value: Slot,
    },
    NewString {
        text: String,
    },
    DeriveString {
        source: Slot,
        derive: Derive,
    },
    InvokeStatic {
        class: String,
        method: MethodSelector,
        args: Vec<Arg>,
    },
    Invoke {
        receiver: Slot,
        method: MethodSelector,
        args: Vec<Arg>,
    },
    ExpectNull {
        value: Slot,
        what: String,
    },
}

impl Op {
    fn describe(&self) -> String {
        match self {
            Op::StaticField { class, field } => format!("read {class}.{field}"),
            Op::Local { name } => format!("read local {name}"),
            Op::SetLocal { name, value } => format!("set local {name} = {value}"),
            Op::NewString { text } => format!("new string {text:?}"),
            Op::DeriveString { source, .. } => format!("derive string from {source}"),
            Op::InvokeStatic { class, method, .. } => format!("invoke {class}.{}", method.name),
            Op::Invoke {
                receiver, method, ..
            } => format!("invoke {receiver}.{}", method.name),
            Op::ExpectNull { what, .. } => format!("check {what}"),
        }
    }
}

/// Builder for an ordered batch of evaluation steps.
#[derive(Default)]
pub struct Transaction {
    ops: Vec<Op>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.ops.iter().map(Op::describe))
            .finish()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn push(&mut self, op: Op) -> Slot {
        self.ops.push(op);
        Slot(self.ops.len() - 1)
    }

    /// Reads a static field. `class` is a binary name or a JNI signature.
    pub fn static_field(&mut self, class: &str, field: &str) -> Slot {
        self.push(Op::StaticField {
            class: class.to_string(),
            field: field.to_string(),
        })
    }

    /// Reads a named local of the thread's top frame.
    pub fn local(&mut self, name: &str) -> Slot {
        self.push(Op::Local {
            name: name.to_string(),
        })
    }

    pub fn set_local(&mut self, name: &str, value: Slot) -> Slot {
        self.push(Op::SetLocal {
            name: name.to_string(),
            value,
        })
    }

    pub fn new_string(&mut self, text: impl Into<String>) -> Slot {
        self.push(Op::NewString { text: text.into() })
    }

    /// Creates a string in the target computed on the host from the string
    /// held by `source`. The decoded source text is kept in the [`Outcome`].
    pub fn derive_string<F>(&mut self, source: Slot, derive: F) -> Slot
    where
        F: FnOnce(&str) -> Result<String, ExecError> + Send + 'static,
    {
        self.push(Op::DeriveString {
            source,
            derive: Box::new(derive),
        })
    }

    pub fn invoke_static(
        &mut self,
        class: &str,
        method: impl Into<MethodSelector>,
        args: impl IntoIterator<Item = Arg>,
    ) -> Slot {
        self.push(Op::InvokeStatic {
            class: class.to_string(),
            method: method.into(),
            args: args.into_iter().collect(),
        })
    }

    pub fn invoke(
        &mut self,
        receiver: Slot,
        method: impl Into<MethodSelector>,
        args: impl IntoIterator<Item = Arg>,
    ) -> Slot {
        self.push(Op::Invoke {
            receiver,
            method: method.into(),
            args: args.into_iter().collect(),
        })
    }

    /// Fails the transaction if `value` is not null. A string value becomes
    /// the error message.
    pub fn expect_null(&mut self, value: Slot, what: impl Into<String>) -> Slot {
        self.push(Op::ExpectNull {
            value,
            what: what.into(),
        })
    }

    /// Runs every step against `thread`, which must be suspended.
    pub async fn commit(
        self,
        session: &DebugSession,
        thread: ThreadId,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ExecError> {
        let mut exec = Executor {
            session,
            thread,
            frame: None,
            variables: None,
            outcome: Outcome::default(),
            pinned: Vec::new(),
        };
        let result = exec.run(self.ops, cancel).await;
        exec.release().await;
        result.map(|()| exec.outcome)
    }
}

/// Values produced by a committed transaction.
#[derive(Clone, Debug, Default)]
pub struct Outcome {
    values: Vec<JdwpValue>,
    strings: HashMap<Slot, String>,
}

impl Outcome {
    pub fn value(&self, slot: Slot) -> Option<&JdwpValue> {
        self.values.get(slot.0)
    }

    /// Host-side text of a string slot, if the transaction decoded it.
    pub fn string(&self, slot: Slot) -> Option<&str> {
        self.strings.get(&slot).map(String::as_str)
    }
}

/// Builds a transaction with `build` and commits it on `thread`.
pub async fn with_suspended_thread<R>(
    session: &DebugSession,
    thread: ThreadId,
    cancel: &CancellationToken,
    build: impl FnOnce(&mut Transaction) -> R,
) -> Result<(R, Outcome), ExecError> {
    let mut tx = Transaction::new();
    let handle = build(&mut tx);
    tracing::debug!(target: "jinject.loader", thread, steps = tx.len(), "committing transaction");
    let outcome = tx.commit(session, thread, cancel).await?;
    Ok((handle, outcome))
}

struct Executor<'a> {
    session: &'a DebugSession,
    thread: ThreadId,
    frame: Option<FrameInfo>,
    variables: Option<Vec<VariableInfo>>,
    outcome: Outcome,
    pinned: Vec<ObjectId>,
}

impl Executor<'_> {
    async fn run(&mut self, ops: Vec<Op>, cancel: &CancellationToken) -> Result<(), ExecError> {
        for (index, op) in ops.into_iter().enumerate() {
            let step = op.describe();
            tracing::trace!(target: "jinject.loader", index, %step, "transaction step");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ExecError::Cancelled),
                value = self.step(op) => value,
            };
            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    tracing::debug!(
                        target: "jinject.loader",
                        index,
                        %step,
                        error = %err,
                        "transaction step failed"
                    );
                    return Err(err);
                }
            };
            if let Some(id) = value.object_id().filter(|id| *id != 0) {
                self.pin(id, cancel).await?;
            }
            self.outcome.values.push(value);
        }
        Ok(())
    }

    async fn step(&mut self, op: Op) -> Result<JdwpValue, ExecError> {
        let client = self.session.client();
        match op {
            Op::StaticField { class, field } => {
                let class = self.session.resolve_class(&class).await?;
                let fields = self.session.fields(class.class_id).await?;
                let info = fields
                    .iter()
                    .find(|f| f.name == field)
                    .ok_or_else(|| ExecError::FieldNotFound {
                        class: class.signature.clone(),
                        field,
                    })?;
                client
                    .reference_type_get_values(class.class_id, &[info.field_id])
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| JdwpError::Protocol("empty GetValues reply".into()).into())
            }
            Op::Local { name } => {
                let (frame, var) = self.variable(&name).await?;
                let slots = [(var.slot, var.signature.as_str())];
                client
                    .stack_frame_get_values(self.thread, frame.frame_id, &slots)
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| JdwpError::Protocol("empty GetValues reply".into()).into())
            }
            Op::SetLocal { name, value } => {
                let value = self.slot(value)?;
                let (frame, var) = self.variable(&name).await?;
                client
                    .stack_frame_set_values(self.thread, frame.frame_id, &[(var.slot, value)])
                    .await?;
                Ok(JdwpValue::Void)
            }
            Op::NewString { text } => self.create_string(&text).await,
            Op::DeriveString { source, derive } => {
                let text = self.decode_string(source).await?;
                let derived = derive(&text)?;
                self.create_string(&derived).await
            }
            Op::InvokeStatic {
                class,
                method,
                args,
            } => {
                let class = self.session.resolve_class(&class).await?;
                let methods = self.session.methods(class.class_id).await?;
                let info = method.select(&methods, args.len()).ok_or_else(|| {
                    ExecError::MethodNotFound {
                        class: class.signature.clone(),
                        name: method.name.clone(),
                        wanted: method.wanted(args.len()),
                    }
                })?;
                let args = self.args(&args)?;
                let (value, exception) = client
                    .class_type_invoke_method(
                        class.class_id,
                        self.thread,
                        info.method_id,
                        &args,
                        INVOKE_SINGLE_THREADED,
                    )
                    .await?;
                check_exception(&info.name, value, exception)
            }
            Op::Invoke {
                receiver,
                method,
                args,
            } => {
                let object = self.object(receiver)?;
                let class_id = client.object_reference_reference_type(object).await?;
                let methods = self.session.methods(class_id).await?;
                let Some(info) = method.select(&methods, args.len()) else {
                    return Err(ExecError::MethodNotFound {
                        class: self.class_name(class_id).await,
                        name: method.name.clone(),
                        wanted: method.wanted(args.len()),
                    });
                };
                let args = self.args(&args)?;
                let (value, exception) = client
                    .object_reference_invoke_method(
                        object,
                        self.thread,
                        class_id,
                        info.method_id,
                        &args,
                        INVOKE_SINGLE_THREADED,
                    )
                    .await?;
                check_exception(&info.name, value, exception)
            }
            Op::ExpectNull { value, what } => {
                if self.slot(value)?.is_null() {
                    return Ok(JdwpValue::Void);
                }
                let message = match self.decode_string(value).await {
                    Ok(message) => message,
                    Err(_) => "returned a non-null value".to_string(),
                };
                Err(ExecError::Rejected { what, message })
            }
        }
    }

    fn slot(&self, slot: Slot) -> Result<JdwpValue, ExecError> {
        self.outcome
            .values
            .get(slot.0)
            .copied()
            .ok_or(ExecError::InvalidSlot(slot))
    }

    fn object(&self, slot: Slot) -> Result<ObjectId, ExecError> {
        self.slot(slot)?
            .object_id()
            .filter(|id| *id != 0)
            .ok_or(ExecError::NotAnObject(slot))
    }

    fn args(&self, args: &[Arg]) -> Result<Vec<JdwpValue>, ExecError> {
        args.iter()
            .map(|arg| match *arg {
                Arg::Slot(slot) => self.slot(slot),
                Arg::Null => Ok(JdwpValue::null()),
                Arg::Value(value) => Ok(value),
            })
            .collect()
    }

    async fn create_string(&self, text: &str) -> Result<JdwpValue, ExecError> {
        let id = self.session.client().vm_create_string(text).await?;
        Ok(JdwpValue::Object {
            tag: jinject_jdwp::wire::types::TAG_STRING,
            id,
        })
    }

    async fn decode_string(&mut self, slot: Slot) -> Result<String, ExecError> {
        if let Some(text) = self.outcome.strings.get(&slot) {
            return Ok(text.clone());
        }
        let id = self.object(slot)?;
        let text = self.session.client().string_reference_value(id).await?;
        self.outcome.strings.insert(slot, text.clone());
        Ok(text)
    }

    async fn top_frame(&mut self) -> Result<FrameInfo, ExecError> {
        if let Some(frame) = self.frame {
            return Ok(frame);
        }
        let frame = self
            .session
            .client()
            .frames(self.thread, 0, 1)
            .await?
            .into_iter()
            .next()
            .ok_or(ExecError::NoFrames(self.thread))?;
        self.frame = Some(frame);
        Ok(frame)
    }

    async fn variable(&mut self, name: &str) -> Result<(FrameInfo, VariableInfo), ExecError> {
        let frame = self.top_frame().await?;
        if self.variables.is_none() {
            let (_, vars) = self
                .session
                .client()
                .method_variable_table(frame.location.class_id, frame.location.method_id)
                .await?;
            self.variables = Some(vars);
        }
        self.variables
            .iter()
            .flatten()
            .find(|var| var.name == name && var.in_scope_at(frame.location.index))
            .cloned()
            .map(|var| (frame, var))
            .ok_or_else(|| ExecError::LocalNotFound {
                name: name.to_string(),
            })
    }

    async fn class_name(&self, class_id: ReferenceTypeId) -> String {
        self.session
            .client()
            .reference_type_signature(class_id)
            .await
            .unwrap_or_else(|_| format!("class {class_id:#x}"))
    }

    async fn pin(&mut self, object: ObjectId, cancel: &CancellationToken) -> Result<(), ExecError> {
        if self.pinned.contains(&object) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExecError::Cancelled),
            res = self.session.client().object_reference_disable_collection(object) => res?,
        }
        self.pinned.push(object);
        Ok(())
    }

    /// Lets the VM collect everything this transaction pinned. Failures are
    /// only logged; the objects are released when the session ends anyway.
    async fn release(&mut self) {
        for object in self.pinned.drain(..) {
            if let Err(err) = self
                .session
                .client()
                .object_reference_enable_collection(object)
                .await
            {
                tracing::debug!(
                    target: "jinject.loader",
                    object,
                    error = %err,
                    "failed to release pinned object"
                );
            }
        }
    }
}

fn check_exception(
    method: &str,
    value: JdwpValue,
    exception: ObjectId,
) -> Result<JdwpValue, ExecError> {
    if exception != 0 {
        return Err(ExecError::Exception {
            method: method.to_string(),
            exception,
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use jinject_jdwp::{
        wire::mock::{MockVm, MockVmConfig},
        JdwpClientConfig,
    };

    use super::*;
    use crate::checkpoint::{wait_for_checkpoint, Checkpoint, CheckpointOutcome};

    async fn suspended_at(
        checkpoint: &Checkpoint,
        config: MockVmConfig,
    ) -> (MockVm, DebugSession, ThreadId) {
        let vm = MockVm::spawn_with_config(config).await.unwrap();
        let session = DebugSession::connect(vm.addr(), JdwpClientConfig::default())
            .await
            .unwrap();
        let outcome = wait_for_checkpoint(&session, checkpoint, None, &CancellationToken::new())
            .await
            .unwrap();
        let CheckpointOutcome::Hit(hit) = outcome else {
            panic!("expected a hit, got {outcome:?}");
        };
        (vm, session, hit.thread)
    }

    #[tokio::test]
    async fn patches_a_local_through_concat() {
        let (vm, session, thread) =
            suspended_at(&Checkpoint::VULKAN_LOAD, MockVmConfig::default()).await;

        let cancel = CancellationToken::new();
        let (abi, outcome) = with_suspended_thread(&session, thread, &cancel, |tx| {
            let abi = tx.static_field("android.os.Build", "CPU_ABI");
            let suffix = tx.derive_string(abi, |abi| Ok(format!(":/tools/lib/{abi}")));
            let current = tx.local("librarySearchPath");
            let patched = tx.invoke(current, "concat", [Arg::Slot(suffix)]);
            tx.set_local("librarySearchPath", patched);
            abi
        })
        .await
        .unwrap();

        assert_eq!(outcome.string(abi), Some("arm64-v8a"));
        assert_eq!(
            vm.library_search_path().await.as_deref(),
            Some("/data/app/com.example.app-1/lib/arm64:/tools/lib/arm64-v8a")
        );
        assert!(vm
            .invoke_options()
            .await
            .iter()
            .all(|options| *options == INVOKE_SINGLE_THREADED));
        assert!(vm.pinned_object_ids().await.is_empty());
    }

    #[tokio::test]
    async fn selects_overloads_by_argument_count() {
        let (vm, session, thread) =
            suspended_at(&Checkpoint::ON_CREATE, MockVmConfig::default()).await;

        with_suspended_thread(&session, thread, &CancellationToken::new(), |tx| {
            let runtime = tx.invoke_static("java.lang.Runtime", "getRuntime", []);
            let path = tx.new_string("/tools/lib/libfoo.so");
            let result = tx.invoke(runtime, "doLoad", [Arg::Slot(path), Arg::Null]);
            tx.expect_null(result, "loading libfoo.so");
        })
        .await
        .unwrap();

        let loaded = vm.loaded_libraries().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].path, "/tools/lib/libfoo.so");
        assert_eq!(loaded[0].thread, MockVm::MAIN_THREAD);
    }

    #[tokio::test]
    async fn first_failure_aborts_the_rest() {
        let (vm, session, thread) = suspended_at(
            &Checkpoint::ON_CREATE,
            MockVmConfig {
                fail_library_loads: true,
                ..MockVmConfig::default()
            },
        )
        .await;

        let err = with_suspended_thread(&session, thread, &CancellationToken::new(), |tx| {
            for lib in ["/tools/lib/liba.so", "/tools/lib/libb.so"] {
                let runtime = tx.invoke_static("java.lang.Runtime", "getRuntime", []);
                let path = tx.new_string(lib);
                let result = tx.invoke(runtime, "doLoad", [Arg::Slot(path), Arg::Null]);
                tx.expect_null(result, format!("loading {lib}"));
            }
        })
        .await
        .unwrap_err();

        match err {
            ExecError::Rejected { what, message } => {
                assert_eq!(what, "loading /tools/lib/liba.so");
                assert!(message.contains("dlopen failed"), "{message}");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(vm.loaded_libraries().await.len(), 1);
        assert!(vm.pinned_object_ids().await.is_empty());
    }

    #[tokio::test]
    async fn exceptions_fail_the_invocation() {
        let (_vm, session, thread) =
            suspended_at(&Checkpoint::ON_CREATE, MockVmConfig::default()).await;

        let err = with_suspended_thread(&session, thread, &CancellationToken::new(), |tx| {
            let text = tx.new_string("abc");
            tx.invoke(text, "concat", [Arg::Null]);
        })
        .await
        .unwrap_err();
        assert!(
            matches!(&err, ExecError::Exception { method, .. } if method == "concat"),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn missing_members_are_reported() {
        let (_vm, session, thread) =
            suspended_at(&Checkpoint::ON_CREATE, MockVmConfig::default()).await;
        let cancel = CancellationToken::new();

        let err = with_suspended_thread(&session, thread, &cancel, |tx| {
            tx.static_field("android.os.Build", "SUPPORTED_ABIS");
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::FieldNotFound { .. }), "{err:?}");

        let err = with_suspended_thread(&session, thread, &cancel, |tx| {
            tx.local("librarySearchPath");
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::LocalNotFound { .. }), "{err:?}");

        let err = with_suspended_thread(&session, thread, &cancel, |tx| {
            tx.invoke_static(
                "java.lang.Runtime",
                MethodSelector::exact("getRuntime", "(I)Ljava/lang/Runtime;"),
                [],
            );
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ExecError::MethodNotFound { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn derive_errors_abort_the_transaction() {
        let (vm, session, thread) = suspended_at(
            &Checkpoint::VULKAN_LOAD,
            MockVmConfig {
                cpu_abi: "sparc".to_string(),
                ..MockVmConfig::default()
            },
        )
        .await;

        let err = with_suspended_thread(&session, thread, &CancellationToken::new(), |tx| {
            let abi = tx.static_field("android.os.Build", "CPU_ABI");
            let suffix = tx.derive_string(abi, |name| {
                let abi = name.parse::<crate::Abi>()?;
                Ok(format!(":/tools/lib/{abi}"))
            });
            let current = tx.local("librarySearchPath");
            let patched = tx.invoke(current, "concat", [Arg::Slot(suffix)]);
            tx.set_local("librarySearchPath", patched);
        })
        .await
        .unwrap_err();

        assert!(matches!(err, ExecError::UnknownAbi(_)), "{err:?}");
        assert_eq!(
            vm.library_search_path().await.as_deref(),
            Some("/data/app/com.example.app-1/lib/arm64")
        );
    }

    #[tokio::test]
    async fn cancelled_transactions_stop() {
        let (_vm, session, thread) =
            suspended_at(&Checkpoint::ON_CREATE, MockVmConfig::default()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = with_suspended_thread(&session, thread, &cancel, |tx| {
            tx.new_string("never created");
        })
        .await
        .unwrap_err();
        assert!(err.is_cancelled(), "{err:?}");
    }
}
