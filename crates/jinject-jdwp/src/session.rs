//! Debug session facade over [`JdwpClient`].
//!
//! A [`DebugSession`] is owned by exactly one injection. It caches class,
//! method, and field lookups for its lifetime and turns method-entry event
//! requests into a single awaitable call that always clears its request.

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use tokio::{net::TcpStream, sync::broadcast};
use tokio_util::sync::CancellationToken;

use crate::{
    poison,
    wire::{
        class_name_to_signature,
        types::{EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_ALL},
        EventModifier, FieldInfo, JdwpClient, JdwpClientConfig, JdwpError, JdwpEvent, Location,
        MethodId, MethodInfo, ReferenceTypeId, Result, ThreadId,
    },
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassDescriptor {
    pub signature: String,
    pub class_id: ReferenceTypeId,
    pub ref_type_tag: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

impl MethodDescriptor {
    fn new(class_id: ReferenceTypeId, info: &MethodInfo) -> Self {
        Self {
            class_id,
            method_id: info.method_id,
            name: info.name.clone(),
            signature: info.signature.clone(),
            mod_bits: info.mod_bits,
        }
    }
}

/// A suspended method-entry event. All threads of the VM are suspended when
/// this is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BreakpointHit {
    pub request_id: i32,
    pub thread: ThreadId,
    pub location: Location,
}

/// Number of parameters declared by a JNI method descriptor such as
/// `(Ljava/lang/String;IZ)V`. Returns `None` for malformed descriptors.
pub fn argument_count(descriptor: &str) -> Option<usize> {
    let params = descriptor.strip_prefix('(')?;
    let end = params.find(')')?;
    let mut chars = params[..end].chars();
    let mut count = 0;
    while let Some(c) = chars.next() {
        let mut c = c;
        while c == '[' {
            c = chars.next()?;
        }
        match c {
            'L' => loop {
                if chars.next()? == ';' {
                    break;
                }
            },
            'Z' | 'B' | 'C' | 'S' | 'I' | 'J' | 'F' | 'D' => {}
            _ => return None,
        }
        count += 1;
    }
    Some(count)
}

#[derive(Debug)]
pub struct DebugSession {
    client: JdwpClient,
    classes: Mutex<HashMap<String, ClassDescriptor>>,
    methods: Mutex<HashMap<ReferenceTypeId, Arc<[MethodInfo]>>>,
    fields: Mutex<HashMap<ReferenceTypeId, Arc<[FieldInfo]>>>,
    active_requests: Mutex<BTreeSet<i32>>,
}

impl DebugSession {
    pub async fn connect(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let client = JdwpClient::connect_with_config(addr, config).await?;
        Ok(Self::from_client(client).await)
    }

    /// Opens a session over an already dialed stream. The stream is dropped
    /// (and therefore closed) if the handshake fails.
    pub async fn open(stream: TcpStream, config: JdwpClientConfig) -> Result<Self> {
        let client = JdwpClient::open(stream, config).await?;
        Ok(Self::from_client(client).await)
    }

    async fn from_client(client: JdwpClient) -> Self {
        match client.version().await {
            Ok(version) => tracing::debug!(
                target: "jinject.jdwp",
                vm = %version.vm_name,
                vm_version = %version.vm_version,
                jdwp = format!("{}.{}", version.jdwp_major, version.jdwp_minor),
                "attached to VM"
            ),
            Err(err) => {
                tracing::debug!(
                    target: "jinject.jdwp",
                    error = %err,
                    "VM did not report its version"
                )
            }
        }
        Self {
            client,
            classes: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            fields: Mutex::new(HashMap::new()),
            active_requests: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn client(&self) -> &JdwpClient {
        &self.client
    }

    /// Looks up a loaded class. Accepts either a JNI signature
    /// (`Landroid/app/Application;`) or a binary name (`android.app.Application`).
    pub async fn resolve_class(&self, class: &str) -> Result<ClassDescriptor> {
        let signature = class_name_to_signature(class);
        if let Some(hit) = poison::lock(&self.classes, "DebugSession.classes").get(&signature) {
            return Ok(hit.clone());
        }

        let info = self
            .client
            .classes_by_signature(&signature)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JdwpError::ClassNotFound {
                signature: signature.clone(),
            })?;

        let descriptor = ClassDescriptor {
            signature: signature.clone(),
            class_id: info.type_id,
            ref_type_tag: info.ref_type_tag,
        };
        poison::lock(&self.classes, "DebugSession.classes").insert(signature, descriptor.clone());
        Ok(descriptor)
    }

    pub async fn methods(&self, class_id: ReferenceTypeId) -> Result<Arc<[MethodInfo]>> {
        if let Some(hit) = poison::lock(&self.methods, "DebugSession.methods").get(&class_id) {
            return Ok(hit.clone());
        }
        let methods: Arc<[MethodInfo]> = self.client.reference_type_methods(class_id).await?.into();
        poison::lock(&self.methods, "DebugSession.methods").insert(class_id, methods.clone());
        Ok(methods)
    }

    pub async fn fields(&self, class_id: ReferenceTypeId) -> Result<Arc<[FieldInfo]>> {
        if let Some(hit) = poison::lock(&self.fields, "DebugSession.fields").get(&class_id) {
            return Ok(hit.clone());
        }
        let fields: Arc<[FieldInfo]> = self.client.reference_type_fields(class_id).await?.into();
        poison::lock(&self.fields, "DebugSession.fields").insert(class_id, fields.clone());
        Ok(fields)
    }

    /// Finds `name` on `class`. With a descriptor the match is exact; without
    /// one the first method of that name wins.
    pub async fn resolve_method(
        &self,
        class: &ClassDescriptor,
        name: &str,
        descriptor: Option<&str>,
    ) -> Result<MethodDescriptor> {
        let methods = self.methods(class.class_id).await?;
        methods
            .iter()
            .find(|m| m.name == name && descriptor.map_or(true, |d| m.signature == d))
            .map(|m| MethodDescriptor::new(class.class_id, m))
            .ok_or_else(|| JdwpError::MethodNotFound {
                class: class.signature.clone(),
                name: name.to_string(),
                signature: descriptor.map(str::to_string),
            })
    }

    /// Event requests set by this session that have not been cleared yet.
    pub fn active_requests(&self) -> Vec<i32> {
        poison::lock(&self.active_requests, "DebugSession.active_requests")
            .iter()
            .copied()
            .collect()
    }

    /// Resumes the VM and waits until `method` is entered, optionally only on
    /// `thread_filter`. On return the VM is suspended at the hit.
    ///
    /// The event request is cleared before this returns, whether it returns a
    /// hit, an error, or [`JdwpError::Cancelled`]. Prefer cancelling through
    /// `cancel` over dropping the future, which skips the clear.
    pub async fn await_method_entry(
        &self,
        method: &MethodDescriptor,
        thread_filter: Option<ThreadId>,
        cancel: &CancellationToken,
    ) -> Result<BreakpointHit> {
        // Subscribe before the request exists so the hit cannot be missed.
        let mut events = self.client.subscribe_events();

        let mut modifiers = vec![EventModifier::ClassOnly {
            class_id: method.class_id,
        }];
        if let Some(thread) = thread_filter {
            modifiers.push(EventModifier::ThreadOnly { thread });
        }
        let request = self
            .client
            .event_request_set(EVENT_KIND_METHOD_ENTRY, SUSPEND_POLICY_ALL, modifiers);
        let request_id = tokio::select! {
            _ = cancel.cancelled() => return Err(JdwpError::Cancelled),
            res = request => res?,
        };
        poison::lock(&self.active_requests, "DebugSession.active_requests").insert(request_id);

        tracing::debug!(
            target: "jinject.jdwp",
            request_id,
            method = %method.name,
            thread = ?thread_filter,
            "waiting for method entry"
        );

        let result = self
            .wait_for_entry(&mut events, request_id, method.method_id, cancel)
            .await;

        if let Err(err) = self
            .client
            .event_request_clear(EVENT_KIND_METHOD_ENTRY, request_id)
            .await
        {
            tracing::debug!(
                target: "jinject.jdwp",
                request_id,
                error = %err,
                "failed to clear method entry request"
            );
        }
        poison::lock(&self.active_requests, "DebugSession.active_requests").remove(&request_id);

        result
    }

    async fn wait_for_entry(
        &self,
        events: &mut broadcast::Receiver<JdwpEvent>,
        request_id: i32,
        method_id: MethodId,
        cancel: &CancellationToken,
    ) -> Result<BreakpointHit> {
        let closed = self.client.shutdown_token();
        self.resume(cancel).await?;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Err(JdwpError::Cancelled),
                _ = closed.cancelled() => return Err(JdwpError::ConnectionClosed),
                event = events.recv() => event,
            };
            match event {
                Ok(JdwpEvent::MethodEntry {
                    request_id: id,
                    thread,
                    location,
                }) if id == request_id => {
                    if location.method_id == method_id {
                        return Ok(BreakpointHit {
                            request_id,
                            thread,
                            location,
                        });
                    }
                    // ClassOnly reports every method of the class.
                    self.resume(cancel).await?;
                }
                Ok(JdwpEvent::VmDeath) => return Err(JdwpError::VmDeath),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        target: "jinject.jdwp",
                        request_id,
                        skipped,
                        "event receiver lagged"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(JdwpError::ConnectionClosed)
                }
            }
        }
    }

    async fn resume(&self, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(JdwpError::Cancelled),
            res = self.client.vm_resume() => res,
        }
    }

    /// Releases all event requests, lets the VM run, and closes the connection.
    pub async fn close(&self) {
        if !self.client.is_closed() {
            if let Err(err) = self.client.dispose().await {
                tracing::debug!(target: "jinject.jdwp", error = %err, "VM dispose failed");
            }
        }
        self.client.shutdown();
        poison::lock(&self.active_requests, "DebugSession.active_requests").clear();
    }
}
