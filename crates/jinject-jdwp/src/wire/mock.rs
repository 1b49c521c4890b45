use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use super::{
    codec::{
        encode_command, encode_reply, JdwpReader, JdwpWriter, PacketHeader, EVENT_COMMAND,
        EVENT_COMMAND_SET, HANDSHAKE, HEADER_LEN,
    },
    types::{
        FieldId, FieldInfo, JdwpError, JdwpIdSizes, JdwpValue, Location, MethodId, MethodInfo,
        ObjectId, ReferenceTypeId, ThreadId, VariableInfo, ERROR_ABSENT_INFORMATION,
        ERROR_INVALID_CLASS, ERROR_INVALID_FIELDID, ERROR_INVALID_FRAMEID,
        ERROR_INVALID_METHODID, ERROR_INVALID_OBJECT, ERROR_INVALID_SLOT, ERROR_INVALID_THREAD,
        ERROR_NOT_IMPLEMENTED, ERROR_THREAD_NOT_SUSPENDED, EVENT_KIND_METHOD_ENTRY,
        EVENT_MODIFIER_KIND_CLASS_MATCH, EVENT_MODIFIER_KIND_CLASS_ONLY, EVENT_MODIFIER_KIND_COUNT,
        EVENT_MODIFIER_KIND_LOCATION_ONLY, EVENT_MODIFIER_KIND_THREAD_ONLY, SUSPEND_POLICY_ALL,
        TAG_OBJECT, TAG_STRING, TYPE_TAG_CLASS,
    },
};

const ERROR_ILLEGAL_ARGUMENT: u16 = 103;

const APPLICATION_CLASS_ID: ReferenceTypeId = 0x1001;
const ON_CREATE_METHOD_ID: MethodId = 0x1101;

const APPLICATION_LOADERS_CLASS_ID: ReferenceTypeId = 0x1002;
const GET_DEFAULT_METHOD_ID: MethodId = 0x1201;
const GET_CLASS_LOADER_METHOD_ID: MethodId = 0x1202;

const BUILD_CLASS_ID: ReferenceTypeId = 0x1003;
const CPU_ABI_FIELD_ID: FieldId = 0x1301;
const MODEL_FIELD_ID: FieldId = 0x1302;

const RUNTIME_CLASS_ID: ReferenceTypeId = 0x1004;
const GET_RUNTIME_METHOD_ID: MethodId = 0x1401;
const DO_LOAD_METHOD_ID: MethodId = 0x1402;
const DO_LOAD_WITH_CALLER_METHOD_ID: MethodId = 0x1403;

const STRING_CLASS_ID: ReferenceTypeId = 0x1005;
const CONCAT_METHOD_ID: MethodId = 0x1501;

const RUNTIME_OBJECT_ID: ObjectId = 0x3001;
const NULL_POINTER_EXCEPTION_ID: ObjectId = 0x3002;
const FIRST_STRING_ID: ObjectId = 0x1_0000;

/// Slot of `librarySearchPath` in the `getClassLoader` frame.
const LIBRARY_SEARCH_PATH_SLOT: u32 = 4;

const GET_CLASS_LOADER_SIGNATURE: &str =
    "(Ljava/lang/String;IZLjava/lang/String;Ljava/lang/String;Ljava/lang/ClassLoader;)Ljava/lang/ClassLoader;";

/// An in-process stand-in for an Android app waiting for a debugger.
///
/// Speaks JDWP over TCP and models just enough of ART's startup for
/// injection tests: `ApplicationLoaders.getDefault`, then
/// `ApplicationLoaders.getClassLoader`, then `Application.onCreate`, all on
/// the main thread. Each stage "runs" on `VirtualMachine.Resume` and stops
/// with a method-entry event if an active request matches it.
pub struct MockVm {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockVmConfig {
    /// Reply delays keyed by `(command_set, command)`.
    pub delayed_replies: Vec<DelayedReply>,
    pub id_sizes: JdwpIdSizes,
    /// Value of `android.os.Build.CPU_ABI`.
    pub cpu_abi: String,
    /// Initial value of the `librarySearchPath` local in `getClassLoader`.
    pub library_search_path: String,
    /// When false, `Landroid/app/ApplicationLoaders;` is not loaded.
    pub has_application_loaders: bool,
    /// When false, `Landroid/app/Application;` is not loaded.
    pub has_application: bool,
    /// When false, startup stalls before `Application.onCreate`.
    pub reaches_on_create: bool,
    /// Number of connections closed right after accept, before the handshake.
    /// This is what a forwarded port looks like before the debug agent is up.
    pub reject_connections: usize,
    /// Where the instrumentation library dials back once loaded.
    pub back_channel: Option<SocketAddr>,
    pub back_channel_greeting: Vec<u8>,
    /// File name whose load triggers the back-channel dial.
    pub back_channel_library: String,
    /// Make every `doLoad` return an error message.
    pub fail_library_loads: bool,
}

impl Default for MockVmConfig {
    fn default() -> Self {
        Self {
            delayed_replies: Vec::new(),
            id_sizes: JdwpIdSizes::default(),
            cpu_abi: "arm64-v8a".to_string(),
            library_search_path: "/data/app/com.example.app-1/lib/arm64".to_string(),
            has_application_loaders: true,
            has_application: true,
            reaches_on_create: true,
            reject_connections: 0,
            back_channel: None,
            back_channel_greeting: Vec::new(),
            back_channel_library: "libgapii.so".to_string(),
            fail_library_loads: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command_set: u8,
    pub command: u8,
    pub delay: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockEventRequest {
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub request_id: i32,
    pub modifiers: Vec<MockEventModifier>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockEventModifier {
    Count { count: i32 },
    ThreadOnly { thread: ThreadId },
    ClassOnly { class_id: ReferenceTypeId },
    ClassMatch { pattern: String },
    LocationOnly { location: Location },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedLibrary {
    pub path: String,
    pub thread: ThreadId,
    pub at: Instant,
}

impl MockVm {
    pub const MAIN_THREAD: ThreadId = 0x2001;

    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockVmConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockVmConfig) -> std::io::Result<Self> {
        let listener =
            TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(State::new(config));

        tokio::spawn(run(listener, state.clone(), shutdown.clone()));

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepted TCP connections, including rejected ones.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn resume_calls(&self) -> u32 {
        self.state.resume_calls.load(Ordering::SeqCst)
    }

    pub fn disposed(&self) -> bool {
        self.state.disposed.load(Ordering::SeqCst)
    }

    /// Event requests that are currently set.
    pub async fn event_requests(&self) -> Vec<MockEventRequest> {
        self.state.vm.lock().await.requests.clone()
    }

    pub async fn cleared_requests(&self) -> Vec<i32> {
        self.state.vm.lock().await.cleared.clone()
    }

    pub async fn loaded_libraries(&self) -> Vec<LoadedLibrary> {
        self.state.vm.lock().await.loaded.clone()
    }

    /// Current value of `librarySearchPath` in the `getClassLoader` frame.
    pub async fn library_search_path(&self) -> Option<String> {
        let vm = self.state.vm.lock().await;
        let frame = vm
            .current
            .iter()
            .chain(vm.finished.iter())
            .find(|stage| stage.method_id == GET_CLASS_LOADER_METHOD_ID)?;
        let id = frame.locals.get(&LIBRARY_SEARCH_PATH_SLOT)?.object_id()?;
        vm.strings.get(&id).cloned()
    }

    pub async fn pinned_object_ids(&self) -> BTreeSet<ObjectId> {
        self.state.vm.lock().await.pinned.clone()
    }

    /// Options passed to every `InvokeMethod`, in call order.
    pub async fn invoke_options(&self) -> Vec<u32> {
        self.state.vm.lock().await.invoke_options.clone()
    }

    pub fn back_channel_dials(&self) -> usize {
        self.state.back_channel_dials.load(Ordering::SeqCst)
    }

    pub fn back_channel_dial_failures(&self) -> usize {
        self.state.back_channel_dial_failures.load(Ordering::SeqCst)
    }
}

impl Drop for MockVm {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Clone, Debug)]
struct Stage {
    class_id: ReferenceTypeId,
    method_id: MethodId,
    thread: ThreadId,
    frame_id: u64,
    locals: HashMap<u32, JdwpValue>,
}

impl Stage {
    fn location(&self) -> Location {
        Location {
            type_tag: TYPE_TAG_CLASS,
            class_id: self.class_id,
            method_id: self.method_id,
            index: 0,
        }
    }
}

struct MockClass {
    signature: &'static str,
    methods: Vec<MethodInfo>,
    fields: Vec<FieldInfo>,
}

struct State {
    config: MockVmConfig,
    classes: HashMap<ReferenceTypeId, MockClass>,
    connections: AtomicUsize,
    resume_calls: AtomicU32,
    disposed: AtomicBool,
    next_packet_id: AtomicU32,
    back_channel_dials: AtomicUsize,
    back_channel_dial_failures: AtomicUsize,
    vm: Mutex<VmState>,
}

struct VmState {
    stages: VecDeque<Stage>,
    current: Option<Stage>,
    finished: Vec<Stage>,
    strings: HashMap<ObjectId, String>,
    next_object_id: ObjectId,
    requests: Vec<MockEventRequest>,
    next_request_id: i32,
    cleared: Vec<i32>,
    pinned: BTreeSet<ObjectId>,
    loaded: Vec<LoadedLibrary>,
    invoke_options: Vec<u32>,
}

impl VmState {
    fn new_string(&mut self, value: String) -> ObjectId {
        let id = self.next_object_id;
        self.next_object_id += 1;
        self.strings.insert(id, value);
        id
    }

    fn suspended_frame(&self, thread: ThreadId) -> Result<&Stage, u16> {
        if thread != MockVm::MAIN_THREAD {
            return Err(ERROR_INVALID_THREAD);
        }
        self.current.as_ref().ok_or(ERROR_THREAD_NOT_SUSPENDED)
    }

    fn string_arg(&self, value: Option<&JdwpValue>) -> Result<Option<String>, u16> {
        match value {
            Some(JdwpValue::Object { id: 0, .. }) => Ok(None),
            Some(JdwpValue::Object { id, .. }) => self
                .strings
                .get(id)
                .cloned()
                .map(Some)
                .ok_or(ERROR_INVALID_OBJECT),
            _ => Err(ERROR_ILLEGAL_ARGUMENT),
        }
    }
}

fn method(method_id: MethodId, name: &str, signature: &str, mod_bits: u32) -> MethodInfo {
    MethodInfo {
        method_id,
        name: name.to_string(),
        signature: signature.to_string(),
        mod_bits,
    }
}

const ACC_PUBLIC: u32 = 0x0001;
const ACC_STATIC: u32 = 0x0008;

impl State {
    fn new(config: MockVmConfig) -> Self {
        let mut classes = HashMap::new();
        if config.has_application {
            classes.insert(
                APPLICATION_CLASS_ID,
                MockClass {
                    signature: "Landroid/app/Application;",
                    methods: vec![method(ON_CREATE_METHOD_ID, "onCreate", "()V", ACC_PUBLIC)],
                    fields: Vec::new(),
                },
            );
        }
        if config.has_application_loaders {
            classes.insert(
                APPLICATION_LOADERS_CLASS_ID,
                MockClass {
                    signature: "Landroid/app/ApplicationLoaders;",
                    methods: vec![
                        method(
                            GET_DEFAULT_METHOD_ID,
                            "getDefault",
                            "()Landroid/app/ApplicationLoaders;",
                            ACC_PUBLIC | ACC_STATIC,
                        ),
                        method(
                            GET_CLASS_LOADER_METHOD_ID,
                            "getClassLoader",
                            GET_CLASS_LOADER_SIGNATURE,
                            ACC_PUBLIC,
                        ),
                    ],
                    fields: Vec::new(),
                },
            );
        }
        classes.insert(
            BUILD_CLASS_ID,
            MockClass {
                signature: "Landroid/os/Build;",
                methods: Vec::new(),
                fields: vec![
                    FieldInfo {
                        field_id: MODEL_FIELD_ID,
                        name: "MODEL".to_string(),
                        signature: "Ljava/lang/String;".to_string(),
                        mod_bits: ACC_PUBLIC | ACC_STATIC,
                    },
                    FieldInfo {
                        field_id: CPU_ABI_FIELD_ID,
                        name: "CPU_ABI".to_string(),
                        signature: "Ljava/lang/String;".to_string(),
                        mod_bits: ACC_PUBLIC | ACC_STATIC,
                    },
                ],
            },
        );
        classes.insert(
            RUNTIME_CLASS_ID,
            MockClass {
                signature: "Ljava/lang/Runtime;",
                methods: vec![
                    method(
                        GET_RUNTIME_METHOD_ID,
                        "getRuntime",
                        "()Ljava/lang/Runtime;",
                        ACC_PUBLIC | ACC_STATIC,
                    ),
                    method(
                        DO_LOAD_WITH_CALLER_METHOD_ID,
                        "doLoad",
                        "(Ljava/lang/String;Ljava/lang/ClassLoader;Ljava/lang/Class;)Ljava/lang/String;",
                        0,
                    ),
                    method(
                        DO_LOAD_METHOD_ID,
                        "doLoad",
                        "(Ljava/lang/String;Ljava/lang/ClassLoader;)Ljava/lang/String;",
                        0,
                    ),
                ],
                fields: Vec::new(),
            },
        );
        classes.insert(
            STRING_CLASS_ID,
            MockClass {
                signature: "Ljava/lang/String;",
                methods: vec![method(
                    CONCAT_METHOD_ID,
                    "concat",
                    "(Ljava/lang/String;)Ljava/lang/String;",
                    ACC_PUBLIC,
                )],
                fields: Vec::new(),
            },
        );

        let mut vm = VmState {
            stages: VecDeque::new(),
            current: None,
            finished: Vec::new(),
            strings: HashMap::new(),
            next_object_id: FIRST_STRING_ID,
            requests: Vec::new(),
            next_request_id: 1,
            cleared: Vec::new(),
            pinned: BTreeSet::new(),
            loaded: Vec::new(),
            invoke_options: Vec::new(),
        };

        let mut frame_id = 0x5001;
        let mut stage = |class_id, method_id, locals| {
            frame_id += 1;
            Stage {
                class_id,
                method_id,
                thread: MockVm::MAIN_THREAD,
                frame_id,
                locals,
            }
        };
        if config.has_application_loaders {
            let search_path = vm.new_string(config.library_search_path.clone());
            let zip = vm.new_string("/data/app/com.example.app-1/base.apk".to_string());
            let locals = HashMap::from([
                (0, JdwpValue::Object { tag: TAG_OBJECT, id: 0x3100 }),
                (1, JdwpValue::Object { tag: TAG_STRING, id: zip }),
                (2, JdwpValue::Int(29)),
                (3, JdwpValue::Boolean(false)),
                (
                    LIBRARY_SEARCH_PATH_SLOT,
                    JdwpValue::Object {
                        tag: TAG_STRING,
                        id: search_path,
                    },
                ),
                (5, JdwpValue::null()),
                (6, JdwpValue::null()),
            ]);
            vm.stages.push_back(stage(
                APPLICATION_LOADERS_CLASS_ID,
                GET_DEFAULT_METHOD_ID,
                HashMap::new(),
            ));
            vm.stages
                .push_back(stage(APPLICATION_LOADERS_CLASS_ID, GET_CLASS_LOADER_METHOD_ID, locals));
        }
        if config.has_application && config.reaches_on_create {
            let this = HashMap::from([(0, JdwpValue::Object { tag: TAG_OBJECT, id: 0x3200 })]);
            vm.stages
                .push_back(stage(APPLICATION_CLASS_ID, ON_CREATE_METHOD_ID, this));
        }

        Self {
            config,
            classes,
            connections: AtomicUsize::new(0),
            resume_calls: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
            next_packet_id: AtomicU32::new(1),
            back_channel_dials: AtomicUsize::new(0),
            back_channel_dial_failures: AtomicUsize::new(0),
            vm: Mutex::new(vm),
        }
    }

    fn reply_delay(&self, command_set: u8, command: u8) -> Option<Duration> {
        self.config
            .delayed_replies
            .iter()
            .find(|d| d.command_set == command_set && d.command == command)
            .map(|d| d.delay)
    }

    fn class_by_signature(&self, signature: &str) -> Option<ReferenceTypeId> {
        self.classes
            .iter()
            .find(|(_, class)| class.signature == signature)
            .map(|(id, _)| *id)
    }
}

async fn run(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let Ok((socket, _)) = accepted else {
            return;
        };
        let seen = state.connections.fetch_add(1, Ordering::SeqCst);
        if seen < state.config.reject_connections {
            drop(socket);
            continue;
        }
        tokio::spawn(serve(socket, state.clone(), shutdown.clone()));
    }
}

async fn serve(
    mut socket: TcpStream,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut hs = [0u8; HANDSHAKE.len()];
    socket.read_exact(&mut hs).await?;
    if hs != *HANDSHAKE {
        return Ok(());
    }
    socket.write_all(HANDSHAKE).await?;

    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));

    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = read_packet(&mut reader) => res?,
        };
        let Some(packet) = packet else {
            return Ok(());
        };
        handle_packet(&writer, &state, packet, shutdown.clone()).await?;
    }
}

struct Packet {
    id: u32,
    command_set: u8,
    command: u8,
    payload: Vec<u8>,
}

async fn read_packet(socket: &mut OwnedReadHalf) -> std::io::Result<Option<Packet>> {
    let mut raw = [0u8; HEADER_LEN];
    match socket.read_exact(&mut raw).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let Ok(PacketHeader::Command {
        id,
        command_set,
        command,
        length,
    }) = PacketHeader::decode(&raw)
    else {
        // Only commands are expected from the debugger.
        return Ok(None);
    };
    let mut payload = vec![0u8; length - HEADER_LEN];
    socket.read_exact(&mut payload).await?;
    Ok(Some(Packet {
        id,
        command_set,
        command,
        payload,
    }))
}

#[derive(Default)]
struct Dispatch {
    payload: Vec<u8>,
    /// Event packet written right after the reply.
    event: Option<Vec<u8>>,
    /// Library path whose load dials the back channel.
    dial: bool,
}

impl Dispatch {
    fn reply(w: JdwpWriter) -> Self {
        Self {
            payload: w.into_vec(),
            ..Self::default()
        }
    }

    fn empty() -> Self {
        Self::default()
    }
}

fn illegal(_: JdwpError) -> u16 {
    ERROR_ILLEGAL_ARGUMENT
}

async fn handle_packet(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    state: &Arc<State>,
    packet: Packet,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let result = {
        let mut vm = state.vm.lock().await;
        dispatch(state, &mut vm, &packet)
    };

    let (reply, event) = match result {
        Ok(dispatch) => {
            if dispatch.dial {
                spawn_back_channel_dial(state.clone(), shutdown.clone());
            }
            (encode_reply(packet.id, 0, &dispatch.payload), dispatch.event)
        }
        Err(code) => (encode_reply(packet.id, code, &[]), None),
    };

    write_reply(
        writer,
        reply,
        event,
        state.reply_delay(packet.command_set, packet.command),
        shutdown,
    )
    .await
}

fn dispatch(state: &State, vm: &mut VmState, packet: &Packet) -> Result<Dispatch, u16> {
    let sizes = &state.config.id_sizes;
    let mut r = JdwpReader::new(&packet.payload);
    let mut w = JdwpWriter::new();

    match (packet.command_set, packet.command) {
        // VirtualMachine.Version
        (1, 1) => {
            w.write_string("Android Runtime 2.1.0");
            w.write_i32(1);
            w.write_i32(6);
            w.write_string("2.1.0");
            w.write_string("Dalvik");
            Ok(Dispatch::reply(w))
        }
        // VirtualMachine.ClassesBySignature
        (1, 2) => {
            let signature = r.read_string().map_err(illegal)?;
            match state.class_by_signature(&signature) {
                Some(id) => {
                    w.write_u32(1);
                    w.write_u8(TYPE_TAG_CLASS);
                    w.write_reference_type_id(id, sizes);
                    w.write_u32(7); // VERIFIED | PREPARED | INITIALIZED
                }
                None => w.write_u32(0),
            }
            Ok(Dispatch::reply(w))
        }
        // VirtualMachine.Dispose
        (1, 6) => {
            state.disposed.store(true, Ordering::SeqCst);
            vm.requests.clear();
            Ok(Dispatch::empty())
        }
        // VirtualMachine.IDSizes
        (1, 7) => {
            w.write_u32(sizes.field_id as u32);
            w.write_u32(sizes.method_id as u32);
            w.write_u32(sizes.object_id as u32);
            w.write_u32(sizes.reference_type_id as u32);
            w.write_u32(sizes.frame_id as u32);
            Ok(Dispatch::reply(w))
        }
        // VirtualMachine.Resume
        (1, 9) => {
            state.resume_calls.fetch_add(1, Ordering::SeqCst);
            let event = advance(state, vm);
            Ok(Dispatch {
                event,
                ..Dispatch::empty()
            })
        }
        // VirtualMachine.CreateString
        (1, 11) => {
            let value = r.read_string().map_err(illegal)?;
            let id = vm.new_string(value);
            w.write_object_id(id, sizes);
            Ok(Dispatch::reply(w))
        }
        // ReferenceType.Signature
        (2, 1) => {
            let class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let class = state.classes.get(&class_id).ok_or(ERROR_INVALID_CLASS)?;
            w.write_string(class.signature);
            Ok(Dispatch::reply(w))
        }
        // ReferenceType.Fields
        (2, 4) => {
            let class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let class = state.classes.get(&class_id).ok_or(ERROR_INVALID_CLASS)?;
            w.write_u32(class.fields.len() as u32);
            for field in &class.fields {
                w.write_id(field.field_id, sizes.field_id);
                w.write_string(&field.name);
                w.write_string(&field.signature);
                w.write_u32(field.mod_bits);
            }
            Ok(Dispatch::reply(w))
        }
        // ReferenceType.Methods
        (2, 5) => {
            let class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let class = state.classes.get(&class_id).ok_or(ERROR_INVALID_CLASS)?;
            w.write_u32(class.methods.len() as u32);
            for method in &class.methods {
                w.write_id(method.method_id, sizes.method_id);
                w.write_string(&method.name);
                w.write_string(&method.signature);
                w.write_u32(method.mod_bits);
            }
            Ok(Dispatch::reply(w))
        }
        // ReferenceType.GetValues
        (2, 6) => {
            let class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            if !state.classes.contains_key(&class_id) {
                return Err(ERROR_INVALID_CLASS);
            }
            let count = r.read_u32().map_err(illegal)?;
            let mut values = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let field_id = r.read_id(sizes.field_id).map_err(illegal)?;
                let value = match (class_id, field_id) {
                    (BUILD_CLASS_ID, CPU_ABI_FIELD_ID) => {
                        vm.new_string(state.config.cpu_abi.clone())
                    }
                    (BUILD_CLASS_ID, MODEL_FIELD_ID) => vm.new_string("Mock Device".to_string()),
                    _ => return Err(ERROR_INVALID_FIELDID),
                };
                values.push(JdwpValue::Object {
                    tag: TAG_STRING,
                    id: value,
                });
            }
            w.write_u32(values.len() as u32);
            for value in &values {
                w.write_tagged_value(value, sizes);
            }
            Ok(Dispatch::reply(w))
        }
        // ClassType.InvokeMethod
        (3, 3) => {
            let class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let thread = r.read_object_id(sizes).map_err(illegal)?;
            let method_id = r.read_id(sizes.method_id).map_err(illegal)?;
            let _args = read_args(&mut r, sizes)?;
            let options = r.read_u32().map_err(illegal)?;
            vm.suspended_frame(thread)?;
            vm.invoke_options.push(options);
            match (class_id, method_id) {
                (RUNTIME_CLASS_ID, GET_RUNTIME_METHOD_ID) => {
                    write_invoke_reply(
                        &mut w,
                        JdwpValue::Object {
                            tag: TAG_OBJECT,
                            id: RUNTIME_OBJECT_ID,
                        },
                        0,
                        sizes,
                    );
                    Ok(Dispatch::reply(w))
                }
                _ => Err(ERROR_INVALID_METHODID),
            }
        }
        // Method.VariableTable
        (6, 2) => {
            let _class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let method_id = r.read_id(sizes.method_id).map_err(illegal)?;
            let (arg_count, vars) = variable_table(method_id)?;
            w.write_u32(arg_count);
            w.write_u32(vars.len() as u32);
            for var in vars {
                w.write_u64(var.code_index);
                w.write_string(&var.name);
                w.write_string(&var.signature);
                w.write_u32(var.length);
                w.write_u32(var.slot);
            }
            Ok(Dispatch::reply(w))
        }
        // ObjectReference.ReferenceType
        (9, 1) => {
            let object_id = r.read_object_id(sizes).map_err(illegal)?;
            let class_id = object_class(vm, object_id)?;
            w.write_u8(TYPE_TAG_CLASS);
            w.write_reference_type_id(class_id, sizes);
            Ok(Dispatch::reply(w))
        }
        // ObjectReference.InvokeMethod
        (9, 6) => {
            let object_id = r.read_object_id(sizes).map_err(illegal)?;
            let thread = r.read_object_id(sizes).map_err(illegal)?;
            let _class_id = r.read_reference_type_id(sizes).map_err(illegal)?;
            let method_id = r.read_id(sizes.method_id).map_err(illegal)?;
            let args = read_args(&mut r, sizes)?;
            let options = r.read_u32().map_err(illegal)?;
            vm.suspended_frame(thread)?;
            vm.invoke_options.push(options);
            invoke_instance(state, vm, object_id, thread, method_id, &args, w)
        }
        // ObjectReference.DisableCollection
        (9, 7) => {
            let object_id = r.read_object_id(sizes).map_err(illegal)?;
            object_class(vm, object_id)?;
            vm.pinned.insert(object_id);
            Ok(Dispatch::empty())
        }
        // ObjectReference.EnableCollection
        (9, 8) => {
            let object_id = r.read_object_id(sizes).map_err(illegal)?;
            vm.pinned.remove(&object_id);
            Ok(Dispatch::empty())
        }
        // StringReference.Value
        (10, 1) => {
            let object_id = r.read_object_id(sizes).map_err(illegal)?;
            let value = vm.strings.get(&object_id).ok_or(ERROR_INVALID_OBJECT)?;
            w.write_string(value);
            Ok(Dispatch::reply(w))
        }
        // ThreadReference.Frames
        (11, 6) => {
            let thread = r.read_object_id(sizes).map_err(illegal)?;
            let start = r.read_i32().map_err(illegal)?;
            let frame = vm.suspended_frame(thread)?;
            if start == 0 {
                w.write_u32(1);
                w.write_id(frame.frame_id, sizes.frame_id);
                w.write_location(&frame.location(), sizes);
            } else {
                w.write_u32(0);
            }
            Ok(Dispatch::reply(w))
        }
        // EventRequest.Set
        (15, 1) => {
            let request = read_event_request(&mut r, sizes, vm.next_request_id)?;
            vm.next_request_id += 1;
            w.write_i32(request.request_id);
            vm.requests.push(request);
            Ok(Dispatch::reply(w))
        }
        // EventRequest.Clear
        (15, 2) => {
            let event_kind = r.read_u8().map_err(illegal)?;
            let request_id = r.read_i32().map_err(illegal)?;
            let before = vm.requests.len();
            vm.requests
                .retain(|req| !(req.event_kind == event_kind && req.request_id == request_id));
            if vm.requests.len() != before {
                vm.cleared.push(request_id);
            }
            Ok(Dispatch::empty())
        }
        // StackFrame.GetValues
        (16, 1) => {
            let thread = r.read_object_id(sizes).map_err(illegal)?;
            let frame_id = r.read_id(sizes.frame_id).map_err(illegal)?;
            let frame = vm.suspended_frame(thread)?;
            if frame.frame_id != frame_id {
                return Err(ERROR_INVALID_FRAMEID);
            }
            let count = r.read_u32().map_err(illegal)?;
            w.write_u32(count);
            for _ in 0..count {
                let slot = r.read_u32().map_err(illegal)?;
                let _tag = r.read_u8().map_err(illegal)?;
                let value = frame.locals.get(&slot).ok_or(ERROR_INVALID_SLOT)?;
                w.write_tagged_value(value, sizes);
            }
            Ok(Dispatch::reply(w))
        }
        // StackFrame.SetValues
        (16, 2) => {
            let thread = r.read_object_id(sizes).map_err(illegal)?;
            let frame_id = r.read_id(sizes.frame_id).map_err(illegal)?;
            vm.suspended_frame(thread)?;
            let count = r.read_u32().map_err(illegal)?;
            let mut updates = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let slot = r.read_u32().map_err(illegal)?;
                let value = r.read_tagged_value(sizes).map_err(illegal)?;
                updates.push((slot, value));
            }
            let frame = vm.current.as_mut().ok_or(ERROR_THREAD_NOT_SUSPENDED)?;
            if frame.frame_id != frame_id {
                return Err(ERROR_INVALID_FRAMEID);
            }
            for (slot, value) in updates {
                if !frame.locals.contains_key(&slot) {
                    return Err(ERROR_INVALID_SLOT);
                }
                frame.locals.insert(slot, value);
            }
            Ok(Dispatch::empty())
        }
        _ => Err(ERROR_NOT_IMPLEMENTED),
    }
}

fn read_args(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes) -> Result<Vec<JdwpValue>, u16> {
    let count = r.read_u32().map_err(illegal)? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(r.read_tagged_value(sizes).map_err(illegal)?);
    }
    Ok(args)
}

fn write_invoke_reply(
    w: &mut JdwpWriter,
    value: JdwpValue,
    exception: ObjectId,
    sizes: &JdwpIdSizes,
) {
    w.write_tagged_value(&value, sizes);
    w.write_tagged_object_id(TAG_OBJECT, exception, sizes);
}

fn object_class(vm: &VmState, object_id: ObjectId) -> Result<ReferenceTypeId, u16> {
    if object_id == RUNTIME_OBJECT_ID {
        Ok(RUNTIME_CLASS_ID)
    } else if vm.strings.contains_key(&object_id) {
        Ok(STRING_CLASS_ID)
    } else {
        Err(ERROR_INVALID_OBJECT)
    }
}

fn invoke_instance(
    state: &State,
    vm: &mut VmState,
    object_id: ObjectId,
    thread: ThreadId,
    method_id: MethodId,
    args: &[JdwpValue],
    mut w: JdwpWriter,
) -> Result<Dispatch, u16> {
    let sizes = &state.config.id_sizes;
    match method_id {
        CONCAT_METHOD_ID => {
            let receiver = vm.strings.get(&object_id).cloned().ok_or(ERROR_INVALID_OBJECT)?;
            match vm.string_arg(args.first())? {
                Some(suffix) => {
                    let id = vm.new_string(receiver + &suffix);
                    write_invoke_reply(&mut w, JdwpValue::Object { tag: TAG_STRING, id }, 0, sizes);
                }
                None => {
                    write_invoke_reply(&mut w, JdwpValue::null(), NULL_POINTER_EXCEPTION_ID, sizes)
                }
            }
            Ok(Dispatch::reply(w))
        }
        DO_LOAD_METHOD_ID if object_id == RUNTIME_OBJECT_ID => {
            let Some(path) = vm.string_arg(args.first())? else {
                write_invoke_reply(&mut w, JdwpValue::null(), NULL_POINTER_EXCEPTION_ID, sizes);
                return Ok(Dispatch::reply(w));
            };
            vm.loaded.push(LoadedLibrary {
                path: path.clone(),
                thread,
                at: Instant::now(),
            });
            if state.config.fail_library_loads {
                let id = vm.new_string(format!("dlopen failed: library \"{path}\" not found"));
                write_invoke_reply(&mut w, JdwpValue::Object { tag: TAG_STRING, id }, 0, sizes);
                return Ok(Dispatch::reply(w));
            }
            write_invoke_reply(&mut w, JdwpValue::null(), 0, sizes);
            let dial = path.rsplit('/').next() == Some(state.config.back_channel_library.as_str());
            Ok(Dispatch {
                payload: w.into_vec(),
                event: None,
                dial,
            })
        }
        _ => Err(ERROR_INVALID_METHODID),
    }
}

fn variable_table(method_id: MethodId) -> Result<(u32, Vec<VariableInfo>), u16> {
    let var = |name: &str, signature: &str, slot: u32| VariableInfo {
        code_index: 0,
        name: name.to_string(),
        signature: signature.to_string(),
        length: 64,
        slot,
    };
    match method_id {
        GET_CLASS_LOADER_METHOD_ID => Ok((
            7,
            vec![
                var("this", "Landroid/app/ApplicationLoaders;", 0),
                var("zip", "Ljava/lang/String;", 1),
                var("targetSdkVersion", "I", 2),
                var("isBundled", "Z", 3),
                var("librarySearchPath", "Ljava/lang/String;", LIBRARY_SEARCH_PATH_SLOT),
                var("libraryPermittedPath", "Ljava/lang/String;", 5),
                var("parent", "Ljava/lang/ClassLoader;", 6),
            ],
        )),
        ON_CREATE_METHOD_ID => Ok((1, vec![var("this", "Landroid/app/Application;", 0)])),
        _ => Err(ERROR_ABSENT_INFORMATION),
    }
}

fn read_event_request(
    r: &mut JdwpReader<'_>,
    sizes: &JdwpIdSizes,
    request_id: i32,
) -> Result<MockEventRequest, u16> {
    let event_kind = r.read_u8().map_err(illegal)?;
    let suspend_policy = r.read_u8().map_err(illegal)?;
    let count = r.read_u32().map_err(illegal)?;
    let mut modifiers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let modifier = match r.read_u8().map_err(illegal)? {
            EVENT_MODIFIER_KIND_COUNT => MockEventModifier::Count {
                count: r.read_i32().map_err(illegal)?,
            },
            EVENT_MODIFIER_KIND_THREAD_ONLY => MockEventModifier::ThreadOnly {
                thread: r.read_object_id(sizes).map_err(illegal)?,
            },
            EVENT_MODIFIER_KIND_CLASS_ONLY => MockEventModifier::ClassOnly {
                class_id: r.read_reference_type_id(sizes).map_err(illegal)?,
            },
            EVENT_MODIFIER_KIND_CLASS_MATCH => MockEventModifier::ClassMatch {
                pattern: r.read_string().map_err(illegal)?,
            },
            EVENT_MODIFIER_KIND_LOCATION_ONLY => MockEventModifier::LocationOnly {
                location: r.read_location(sizes).map_err(illegal)?,
            },
            _ => return Err(ERROR_NOT_IMPLEMENTED),
        };
        modifiers.push(modifier);
    }
    Ok(MockEventRequest {
        event_kind,
        suspend_policy,
        request_id,
        modifiers,
    })
}

fn request_matches(request: &MockEventRequest, stage: &Stage) -> bool {
    request.event_kind == EVENT_KIND_METHOD_ENTRY
        && request.modifiers.iter().all(|modifier| match modifier {
            MockEventModifier::Count { .. } => true,
            MockEventModifier::ThreadOnly { thread } => *thread == stage.thread,
            MockEventModifier::ClassOnly { class_id } => *class_id == stage.class_id,
            MockEventModifier::ClassMatch { .. } => false,
            MockEventModifier::LocationOnly { location } => {
                location.class_id == stage.class_id && location.method_id == stage.method_id
            }
        })
}

/// Runs startup until the next stage that an active request stops at.
fn advance(state: &State, vm: &mut VmState) -> Option<Vec<u8>> {
    if let Some(done) = vm.current.take() {
        vm.finished.push(done);
    }
    while let Some(stage) = vm.stages.pop_front() {
        let hit = vm
            .requests
            .iter()
            .find(|request| request_matches(request, &stage))
            .map(|request| request.request_id);
        match hit {
            Some(request_id) => {
                let packet = method_entry_packet(state, request_id, &stage);
                vm.current = Some(stage);
                return Some(packet);
            }
            None => vm.finished.push(stage),
        }
    }
    None
}

fn method_entry_packet(state: &State, request_id: i32, stage: &Stage) -> Vec<u8> {
    let sizes = &state.config.id_sizes;
    let mut w = JdwpWriter::new();
    w.write_u8(SUSPEND_POLICY_ALL);
    w.write_u32(1);
    w.write_u8(EVENT_KIND_METHOD_ENTRY);
    w.write_i32(request_id);
    w.write_object_id(stage.thread, sizes);
    w.write_location(&stage.location(), sizes);
    let id = state.next_packet_id.fetch_add(1, Ordering::Relaxed);
    encode_command(id, EVENT_COMMAND_SET, EVENT_COMMAND, &w.into_vec())
}

fn spawn_back_channel_dial(state: Arc<State>, shutdown: CancellationToken) {
    let Some(addr) = state.config.back_channel else {
        return;
    };
    tokio::spawn(async move {
        state.back_channel_dials.fetch_add(1, Ordering::SeqCst);
        let mut stream = match TcpStream::connect(addr).await {
            Ok(stream) => stream,
            Err(_) => {
                state.back_channel_dial_failures.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        if stream
            .write_all(&state.config.back_channel_greeting)
            .await
            .is_err()
        {
            return;
        }
        // Hold the connection open for the lifetime of the mock.
        shutdown.cancelled().await;
    });
}

async fn write_reply(
    writer: &Arc<Mutex<OwnedWriteHalf>>,
    reply: Vec<u8>,
    event: Option<Vec<u8>>,
    delay: Option<Duration>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Some(delay) = delay.filter(|d| !d.is_zero()) {
        let writer = writer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let mut guard = writer.lock().await;
                    let _ = guard.write_all(&reply).await;
                    if let Some(event) = event {
                        let _ = guard.write_all(&event).await;
                    }
                }
            }
        });
        return Ok(());
    }

    let mut guard = writer.lock().await;
    guard.write_all(&reply).await?;
    if let Some(event) = event {
        guard.write_all(&event).await?;
    }
    Ok(())
}
