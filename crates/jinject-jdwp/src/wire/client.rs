use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        encode_command, signature_to_tag, JdwpReader, JdwpWriter, PacketHeader, EVENT_COMMAND,
        EVENT_COMMAND_SET, HANDSHAKE, HEADER_LEN,
    },
    types::{
        ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, JdwpError, JdwpEvent, JdwpIdSizes,
        JdwpValue, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, Result, ThreadId,
        VariableInfo, VmVersion, EVENT_KIND_BREAKPOINT, EVENT_KIND_CLASS_PREPARE,
        EVENT_KIND_METHOD_ENTRY, EVENT_KIND_SINGLE_STEP, EVENT_KIND_VM_DEATH, EVENT_KIND_VM_START,
        EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_CLASS_ONLY, EVENT_MODIFIER_KIND_COUNT,
        EVENT_MODIFIER_KIND_LOCATION_ONLY, EVENT_MODIFIER_KIND_THREAD_ONLY,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    pub reply_timeout: Duration,
    pub pending_channel_size: usize,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            pending_channel_size: 256,
            event_channel_size: 64,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingReply = oneshot::Sender<std::result::Result<Reply, JdwpError>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u32, PendingReply>>,
    next_id: AtomicU32,
    id_sizes: Mutex<JdwpIdSizes>,
    events: broadcast::Sender<JdwpEvent>,
    shutdown: CancellationToken,
    config: JdwpClientConfig,
}

/// A connected JDWP debugger endpoint.
///
/// Cloning is cheap; all clones share the same connection. Replies are
/// correlated by packet id, and VM events are fanned out over a broadcast
/// channel (see [`JdwpClient::subscribe_events`]).
#[derive(Clone, Debug)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let stream = tokio::time::timeout(config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| JdwpError::Timeout)??;
        Self::open(stream, config).await
    }

    /// Performs the JDWP handshake on an already connected stream and starts
    /// the reader task.
    pub async fn open(mut stream: TcpStream, config: JdwpClientConfig) -> Result<Self> {
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)?
            .map_err(handshake_io_error)?;

        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)?
            .map_err(handshake_io_error)?;

        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::with_capacity(config.pending_channel_size)),
            next_id: AtomicU32::new(1),
            id_sizes: Mutex::new(JdwpIdSizes::default()),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        // Every id-bearing reply depends on these.
        client.idsizes().await?;
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled when the client is shut down, either explicitly or because the
    /// connection closed.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEvent> {
        self.inner.events.subscribe()
    }

    async fn send_command_raw(
        &self,
        command_set: u8,
        command: u8,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_all(&packet).await
        };
        if let Err(err) = written {
            self.remove_pending(id).await;
            return Err(err.into());
        }

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::ConnectionClosed);
            }
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(r)) => r,
                    Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(JdwpError::Timeout);
                    }
                }
            }
        }?;

        if reply.error_code != 0 {
            tracing::debug!(
                target: "jinject.jdwp",
                command_set,
                command,
                error_code = reply.error_code,
                "command rejected by VM"
            );
            return Err(JdwpError::VmError(reply.error_code));
        }

        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    pub async fn id_sizes(&self) -> JdwpIdSizes {
        *self.inner.id_sizes.lock().await
    }

    /// VirtualMachine.Version (1, 1)
    pub async fn version(&self) -> Result<VmVersion> {
        let payload = self.send_command_raw(1, 1, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        Ok(VmVersion {
            description: r.read_string()?,
            jdwp_major: r.read_i32()?,
            jdwp_minor: r.read_i32()?,
            vm_version: r.read_string()?,
            vm_name: r.read_string()?,
        })
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec()).await?;
        let sizes = self.id_sizes().await;
        let mut r = JdwpReader::new(&payload);

        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    /// VirtualMachine.Dispose (1, 6)
    ///
    /// Releases every event request and resumes the VM.
    pub async fn dispose(&self) -> Result<()> {
        self.send_command_raw(1, 6, Vec::new()).await?;
        Ok(())
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *self.inner.id_sizes.lock().await = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.Resume (1, 9)
    pub async fn vm_resume(&self) -> Result<()> {
        self.send_command_raw(1, 9, Vec::new()).await?;
        Ok(())
    }

    /// VirtualMachine.CreateString (1, 11)
    pub async fn vm_create_string(&self, value: &str) -> Result<ObjectId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_string(value);
        let payload = self.send_command_raw(1, 11, w.into_vec()).await?;
        JdwpReader::new(&payload).read_object_id(&sizes)
    }

    /// ReferenceType.Signature (2, 1)
    pub async fn reference_type_signature(&self, class_id: ReferenceTypeId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ReferenceType.Fields (2, 4)
    pub async fn reference_type_fields(&self, class_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 4, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id(sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(fields)
    }

    /// ReferenceType.Methods (2, 5)
    pub async fn reference_type_methods(
        &self,
        class_id: ReferenceTypeId,
    ) -> Result<Vec<MethodInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        let payload = self.send_command_raw(2, 5, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ReferenceType.GetValues (2, 6): static field values.
    pub async fn reference_type_get_values(
        &self,
        class_id: ReferenceTypeId,
        field_ids: &[FieldId],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_u32(field_ids.len() as u32);
        for field_id in field_ids {
            w.write_id(*field_id, sizes.field_id);
        }
        let payload = self.send_command_raw(2, 6, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// ClassType.InvokeMethod (3, 3)
    ///
    /// Returns the method's return value and the thrown exception object (0
    /// when the call completed normally).
    pub async fn class_type_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<(JdwpValue, ObjectId)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(3, 3, w.into_vec()).await?;
        read_invoke_reply(&payload, &sizes)
    }

    /// Method.VariableTable (6, 2): `(arg_count, variables)`.
    pub async fn method_variable_table(
        &self,
        class_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<(u32, Vec<VariableInfo>)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        let payload = self.send_command_raw(6, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let arg_count = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok((arg_count, vars))
    }

    /// ObjectReference.ReferenceType (9, 1)
    pub async fn object_reference_reference_type(
        &self,
        object_id: ObjectId,
    ) -> Result<ReferenceTypeId> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        let payload = self.send_command_raw(9, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&sizes)
    }

    /// ObjectReference.InvokeMethod (9, 6)
    pub async fn object_reference_invoke_method(
        &self,
        object_id: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<(JdwpValue, ObjectId)> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_reference_type_id(class_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_tagged_value(arg, &sizes);
        }
        w.write_u32(options);
        let payload = self.send_command_raw(9, 6, w.into_vec()).await?;
        read_invoke_reply(&payload, &sizes)
    }

    /// ObjectReference.DisableCollection (9, 7)
    pub async fn object_reference_disable_collection(&self, object_id: ObjectId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        self.send_command_raw(9, 7, w.into_vec()).await?;
        Ok(())
    }

    /// ObjectReference.EnableCollection (9, 8)
    pub async fn object_reference_enable_collection(&self, object_id: ObjectId) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(object_id, &sizes);
        self.send_command_raw(9, 8, w.into_vec()).await?;
        Ok(())
    }

    /// StringReference.Value (10, 1)
    pub async fn string_reference_value(&self, string_id: ObjectId) -> Result<String> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(string_id, &sizes);
        let payload = self.send_command_raw(10, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_string()
    }

    /// ThreadReference.Frames (11, 6)
    pub async fn frames(
        &self,
        thread: ThreadId,
        start: i32,
        length: i32,
    ) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    /// EventRequest.Set (15, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<i32> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        self.send_command_raw(15, 2, w.into_vec()).await?;
        Ok(())
    }

    /// StackFrame.GetValues (16, 1). `slots` pairs a slot index with the
    /// variable's type signature.
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, &str)],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for (slot, signature) in slots {
            w.write_u32(*slot);
            w.write_u8(signature_to_tag(signature));
        }
        let payload = self.send_command_raw(16, 1, w.into_vec()).await?;
        read_tagged_values(&payload, &sizes)
    }

    /// StackFrame.SetValues (16, 2)
    pub async fn stack_frame_set_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        values: &[(u32, JdwpValue)],
    ) -> Result<()> {
        let sizes = self.id_sizes().await;
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(values.len() as u32);
        for (slot, value) in values {
            w.write_u32(*slot);
            w.write_tagged_value(value, &sizes);
        }
        self.send_command_raw(16, 2, w.into_vec()).await?;
        Ok(())
    }
}

/// A forwarded port whose far end has no debuggable process accepts the TCP
/// connection and then drops it.
fn handshake_io_error(err: std::io::Error) -> JdwpError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe => JdwpError::ConnectionClosed,
        _ => JdwpError::Io(err),
    }
}

fn read_tagged_values(payload: &[u8], sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>> {
    let mut r = JdwpReader::new(payload);
    let count = r.read_u32()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.read_tagged_value(sizes)?);
    }
    Ok(values)
}

fn read_invoke_reply(payload: &[u8], sizes: &JdwpIdSizes) -> Result<(JdwpValue, ObjectId)> {
    let mut r = JdwpReader::new(payload);
    let value = r.read_tagged_value(sizes)?;
    let (_tag, exception) = r.read_tagged_object_id(sizes)?;
    Ok((value, exception))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventModifier {
    Count { count: i32 },
    ThreadOnly { thread: ThreadId },
    ClassOnly { class_id: ReferenceTypeId },
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

impl EventModifier {
    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        match self {
            EventModifier::Count { count } => {
                w.write_u8(EVENT_MODIFIER_KIND_COUNT);
                w.write_i32(count);
            }
            EventModifier::ThreadOnly { thread } => {
                w.write_u8(EVENT_MODIFIER_KIND_THREAD_ONLY);
                w.write_object_id(thread, sizes);
            }
            EventModifier::ClassOnly { class_id } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_ONLY);
                w.write_reference_type_id(class_id, sizes);
            }
            EventModifier::ClassMatch { pattern } => {
                w.write_u8(EVENT_MODIFIER_KIND_CLASS_MATCH);
                w.write_string(&pattern);
            }
            EventModifier::LocationOnly { location } => {
                w.write_u8(EVENT_MODIFIER_KIND_LOCATION_ONLY);
                w.write_location(&location, sizes);
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inner: Arc<Inner>) {
    let reason = loop {
        let mut raw = [0u8; HEADER_LEN];
        let header_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            res = reader.read_exact(&mut raw) => res,
        };
        if let Err(err) = header_read {
            break Some(JdwpError::from(err));
        }

        let header = match PacketHeader::decode(&raw) {
            Ok(header) => header,
            Err(err) => break Some(err),
        };

        let mut payload = vec![0u8; header.payload_len()];
        let payload_read = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            res = reader.read_exact(&mut payload) => res,
        };
        if let Err(err) = payload_read {
            break Some(JdwpError::from(err));
        }

        match header {
            PacketHeader::Reply { id, error_code, .. } => {
                let tx = inner.pending.lock().await.remove(&id);
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(Reply {
                        error_code,
                        payload,
                    }));
                }
            }
            PacketHeader::Command {
                command_set: EVENT_COMMAND_SET,
                command: EVENT_COMMAND,
                ..
            } => {
                if let Err(err) = handle_event_packet(&inner, &payload).await {
                    break Some(err);
                }
            }
            PacketHeader::Command {
                command_set,
                command,
                ..
            } => {
                tracing::trace!(
                    target: "jinject.jdwp",
                    command_set,
                    command,
                    "ignoring VM command packet"
                );
            }
        }
    };

    if let Some(err) = &reason {
        tracing::debug!(target: "jinject.jdwp", error = %err, "JDWP connection terminated");
    }
    inner.shutdown.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

async fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let sizes = *inner.id_sizes.lock().await;
    let mut r = JdwpReader::new(payload);
    let _suspend_policy = r.read_u8()?;
    let event_count = r.read_u32()? as usize;
    for _ in 0..event_count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            EVENT_KIND_SINGLE_STEP => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_METHOD_ENTRY => JdwpEvent::MethodEntry {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            EVENT_KIND_CLASS_PREPARE => JdwpEvent::ClassPrepare {
                request_id,
                thread: r.read_object_id(&sizes)?,
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: r.read_string()?,
                status: r.read_u32()?,
            },
            EVENT_KIND_VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            EVENT_KIND_VM_DEATH => JdwpEvent::VmDeath,
            other => {
                // Layout of unknown kinds is unknown, so the rest of the
                // composite packet cannot be parsed.
                tracing::trace!(target: "jinject.jdwp", kind = other, "unsupported event kind");
                return Ok(());
            }
        };
        let _ = inner.events.send(event);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{
        mock::{DelayedReply, MockVm, MockVmConfig},
        types::{ERROR_THREAD_NOT_SUSPENDED, TAG_STRING},
    };

    #[tokio::test]
    async fn handshake_and_basic_commands() {
        let vm = MockVm::spawn().await.unwrap();
        let client = JdwpClient::connect(vm.addr()).await.unwrap();

        let version = client.version().await.unwrap();
        assert_eq!(version.vm_name, "Dalvik");

        let classes = client
            .classes_by_signature("Landroid/os/Build;")
            .await
            .unwrap();
        assert_eq!(classes.len(), 1);
        let build = classes[0].type_id;

        let fields = client.reference_type_fields(build).await.unwrap();
        let cpu_abi = fields.iter().find(|f| f.name == "CPU_ABI").unwrap();
        let values = client
            .reference_type_get_values(build, &[cpu_abi.field_id])
            .await
            .unwrap();
        let id = values[0].object_id().unwrap();
        assert_eq!(values[0].tag(), TAG_STRING);
        assert_eq!(client.string_reference_value(id).await.unwrap(), "arm64-v8a");
    }

    #[tokio::test]
    async fn non_default_id_sizes_are_honoured() {
        let vm = MockVm::spawn_with_config(MockVmConfig {
            id_sizes: JdwpIdSizes {
                field_id: 4,
                method_id: 4,
                object_id: 4,
                reference_type_id: 4,
                frame_id: 4,
            },
            ..MockVmConfig::default()
        })
        .await
        .unwrap();
        let client = JdwpClient::connect(vm.addr()).await.unwrap();
        assert_eq!(client.id_sizes().await.object_id, 4);

        let id = client.vm_create_string("hello").await.unwrap();
        assert_eq!(client.string_reference_value(id).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn closed_before_handshake_is_connection_closed() {
        let vm = MockVm::spawn_with_config(MockVmConfig {
            reject_connections: 1,
            ..MockVmConfig::default()
        })
        .await
        .unwrap();

        let err = JdwpClient::connect(vm.addr()).await.unwrap_err();
        assert!(matches!(err, JdwpError::ConnectionClosed), "{err:?}");
        JdwpClient::connect(vm.addr()).await.unwrap();
        assert_eq!(vm.connections(), 2);
    }

    #[tokio::test]
    async fn slow_reply_times_out() {
        let vm = MockVm::spawn_with_config(MockVmConfig {
            delayed_replies: vec![DelayedReply {
                command_set: 1,
                command: 1,
                delay: Duration::from_secs(5),
            }],
            ..MockVmConfig::default()
        })
        .await
        .unwrap();
        let config = JdwpClientConfig {
            reply_timeout: Duration::from_millis(100),
            ..JdwpClientConfig::default()
        };
        let client = JdwpClient::connect_with_config(vm.addr(), config)
            .await
            .unwrap();

        let err = client.version().await.unwrap_err();
        assert!(matches!(err, JdwpError::Timeout), "{err:?}");
        // The connection stays usable after a timed out request.
        client.idsizes().await.unwrap();
    }

    #[tokio::test]
    async fn invoking_on_a_running_thread_is_rejected() {
        let vm = MockVm::spawn().await.unwrap();
        let client = JdwpClient::connect(vm.addr()).await.unwrap();
        let runtime = client
            .classes_by_signature("Ljava/lang/Runtime;")
            .await
            .unwrap()[0]
            .type_id;
        let methods = client.reference_type_methods(runtime).await.unwrap();
        let get_runtime = methods.iter().find(|m| m.name == "getRuntime").unwrap();

        let err = client
            .class_type_invoke_method(runtime, MockVm::MAIN_THREAD, get_runtime.method_id, &[], 0)
            .await
            .unwrap_err();
        assert!(
            matches!(err, JdwpError::VmError(ERROR_THREAD_NOT_SUSPENDED)),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn shutdown_fails_new_requests() {
        let vm = MockVm::spawn().await.unwrap();
        let client = JdwpClient::connect(vm.addr()).await.unwrap();
        client.shutdown();
        assert!(client.is_closed());
        let err = client.version().await.unwrap_err();
        assert!(matches!(err, JdwpError::ConnectionClosed), "{err:?}");
    }
}
