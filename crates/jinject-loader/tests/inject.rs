use std::{
    collections::HashMap,
    future::Future,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jinject_adb::{
    local_free_tcp_port, CommandSpec, Device, DeviceError, Forward, RunCommandError,
};
use jinject_jdwp::{
    wire::mock::{DelayedReply, MockVm, MockVmConfig},
    JdwpClientConfig,
};
use jinject_loader::{
    Abi, BackChannel, BackChannelError, BackChannelListener, Degradation, ExecError,
    ForwardError, InjectError, InjectErrorKind, InjectOptions, Injection, Injector,
    LibraryDescriptors, Stage, TcpBackChannel, ToolingError, ToolingPaths,
};
use jinject_scheduler::RequestContext;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const PID: u32 = 4242;
const ARM64_LIBS: &str = "/data/local/tmp/jinject/arm64-v8a";
const GREETING: &[u8] = b"gapii";

#[derive(Clone, Debug, PartialEq, Eq)]
enum Call {
    Forward { local_port: u16, pid: u32 },
    Remove { local_port: u16 },
}

/// Stands in for `adb`: "forwarding" listens on the local port and proxies
/// every connection to the mock VM.
struct RecordingDevice {
    target: SocketAddr,
    fail_forward: bool,
    calls: Arc<Mutex<Vec<Call>>>,
    proxies: Mutex<HashMap<u16, CancellationToken>>,
}

impl RecordingDevice {
    fn new(target: SocketAddr) -> Self {
        Self {
            target,
            fail_forward: false,
            calls: Arc::new(Mutex::new(Vec::new())),
            proxies: Mutex::new(HashMap::new()),
        }
    }

    fn failing(target: SocketAddr) -> Self {
        Self {
            fail_forward: true,
            ..Self::new(target)
        }
    }
}

fn adb_error(source: io::Error) -> DeviceError {
    DeviceError::Command(RunCommandError::Io {
        command: CommandSpec::new("adb").arg("forward"),
        source,
    })
}

#[async_trait]
impl Device for RecordingDevice {
    async fn forward(
        &self,
        forward: Forward,
        _cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let Forward { local_port, pid } = forward;
        self.calls
            .lock()
            .unwrap()
            .push(Call::Forward { local_port, pid });
        if self.fail_forward {
            return Err(adb_error(io::Error::other("device offline")));
        }

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, local_port))
            .await
            .map_err(adb_error)?;
        let stop = CancellationToken::new();
        self.proxies
            .lock()
            .unwrap()
            .insert(local_port, stop.clone());
        let target = self.target;
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = stop.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let Ok((mut inbound, _)) = accepted else {
                    return;
                };
                tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(target).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
            }
        });
        Ok(())
    }

    async fn remove_forward(
        &self,
        forward: Forward,
        _cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let local_port = forward.local_port;
        self.calls.lock().unwrap().push(Call::Remove { local_port });
        if let Some(stop) = self.proxies.lock().unwrap().remove(&local_port) {
            stop.cancel();
        }
        Ok(())
    }
}

/// A TCP back channel that takes a while to start listening and records
/// when it became ready.
#[derive(Clone)]
struct ObservedBackChannel {
    inner: TcpBackChannel,
    startup: Duration,
    listens: Arc<AtomicUsize>,
    ready_at: Arc<Mutex<Option<Instant>>>,
}

impl ObservedBackChannel {
    fn new(addr: SocketAddr) -> Self {
        Self {
            inner: TcpBackChannel::new(addr).with_greeting(GREETING),
            startup: Duration::ZERO,
            listens: Arc::new(AtomicUsize::new(0)),
            ready_at: Arc::new(Mutex::new(None)),
        }
    }

    fn with_startup(mut self, startup: Duration) -> Self {
        self.startup = startup;
        self
    }

    fn listens(&self) -> usize {
        self.listens.load(Ordering::SeqCst)
    }

    fn ready_at(&self) -> Option<Instant> {
        *self.ready_at.lock().unwrap()
    }
}

#[async_trait]
impl BackChannel for ObservedBackChannel {
    async fn listen(&self) -> Result<Box<dyn BackChannelListener>, BackChannelError> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.startup).await;
        let listener = self.inner.listen().await?;
        *self.ready_at.lock().unwrap() = Some(Instant::now());
        Ok(listener)
    }
}

struct Harness {
    vm: MockVm,
    injector: Injector<RecordingDevice, ObservedBackChannel>,
    back_channel: ObservedBackChannel,
    calls: Arc<Mutex<Vec<Call>>>,
}

fn back_channel_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, local_free_tcp_port().unwrap()))
}

fn options() -> InjectOptions {
    InjectOptions {
        connect_attempts: 5,
        connect_delay: Duration::from_millis(50),
        jdwp: JdwpClientConfig::default(),
        accept_timeout: Duration::from_secs(5),
        teardown_timeout: Duration::from_secs(2),
        ..InjectOptions::default()
    }
}

async fn harness_with(
    config: MockVmConfig,
    device: impl FnOnce(SocketAddr) -> RecordingDevice,
    back_channel: impl FnOnce(ObservedBackChannel) -> ObservedBackChannel,
    options: InjectOptions,
) -> Harness {
    let addr = back_channel_addr();
    let vm = MockVm::spawn_with_config(MockVmConfig {
        back_channel: config.back_channel.or(Some(addr)),
        back_channel_greeting: GREETING.to_vec(),
        ..config
    })
    .await
    .unwrap();
    let device = device(vm.addr());
    let calls = device.calls.clone();
    let back_channel = back_channel(ObservedBackChannel::new(addr));
    let injector = Injector::new(device, back_channel.clone(), options);
    Harness {
        vm,
        injector,
        back_channel,
        calls,
    }
}

async fn harness(config: MockVmConfig) -> Harness {
    harness_with(config, RecordingDevice::new, |bc| bc, options()).await
}

impl Harness {
    async fn inject(&self) -> Result<Injection, InjectError> {
        self.inject_with(&RequestContext::default()).await
    }

    async fn inject_with(&self, ctx: &RequestContext) -> Result<Injection, InjectError> {
        self.injector
            .inject(ctx, PID, &tooling(), &LibraryDescriptors::default())
            .await
    }

    /// Injects, cancelling once `ready` reports true, and returns the error.
    async fn inject_cancelled_when<Fut>(&self, ready: impl FnMut() -> Fut) -> InjectError
    where
        Fut: Future<Output = bool>,
    {
        let ctx = RequestContext::default();
        let run = async { tokio::join!(self.inject_with(&ctx), cancel_when(&ctx, ready)).0 };
        match tokio::time::timeout(Duration::from_secs(10), run).await {
            Ok(result) => result.unwrap_err(),
            Err(_) => panic!("injection ignored cancellation"),
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Asserts the port was forwarded exactly once and removed afterwards.
    fn assert_forward_released(&self) {
        let calls = self.calls();
        let [Call::Forward { local_port, pid }, Call::Remove { local_port: removed }] =
            calls.as_slice()
        else {
            panic!("unexpected device calls: {calls:?}");
        };
        assert_eq!(*pid, PID);
        assert_eq!(local_port, removed);
    }

    async fn loaded_paths(&self) -> Vec<String> {
        self.vm
            .loaded_libraries()
            .await
            .into_iter()
            .map(|lib| lib.path)
            .collect()
    }
}

async fn cancel_when<Fut>(ctx: &RequestContext, mut ready: impl FnMut() -> Fut)
where
    Fut: Future<Output = bool>,
{
    while !ready().await {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    ctx.cancel();
}

fn delayed(command_set: u8, command: u8) -> DelayedReply {
    DelayedReply {
        command_set,
        command,
        delay: Duration::from_secs(30),
    }
}

fn tooling() -> ToolingPaths {
    ToolingPaths::new()
        .with_libs_dir(Abi::Arm64V8a, ARM64_LIBS)
        .with_libs_dir(Abi::X86, "/data/local/tmp/jinject/x86")
}

fn expected_loads() -> Vec<String> {
    vec![
        format!("{ARM64_LIBS}/libinterceptor.so"),
        format!("{ARM64_LIBS}/libgapii.so"),
    ]
}

#[tokio::test]
async fn injects_both_libraries_and_returns_the_back_channel() {
    let h = harness(MockVmConfig::default()).await;

    let injection = h.inject().await.unwrap();

    assert_eq!(injection.abi, Abi::Arm64V8a);
    assert_eq!(injection.thread, MockVm::MAIN_THREAD);
    assert!(injection.degradations.is_empty());
    assert!(injection.back_channel.peer_addr().is_ok());

    assert_eq!(
        h.vm.library_search_path().await.as_deref(),
        Some("/data/app/com.example.app-1/lib/arm64:/data/local/tmp/jinject/arm64-v8a")
    );
    let loaded = h.vm.loaded_libraries().await;
    assert_eq!(
        loaded.iter().map(|lib| lib.path.clone()).collect::<Vec<_>>(),
        expected_loads()
    );
    assert!(loaded.iter().all(|lib| lib.thread == MockVm::MAIN_THREAD));
    assert_eq!(h.vm.back_channel_dials(), 1);
    assert_eq!(h.vm.back_channel_dial_failures(), 0);

    assert!(h.vm.pinned_object_ids().await.is_empty());
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn retries_until_the_debug_agent_answers() {
    let h = harness(MockVmConfig {
        reject_connections: 2,
        ..MockVmConfig::default()
    })
    .await;

    let injection = h.inject().await.unwrap();

    assert_eq!(injection.abi, Abi::Arm64V8a);
    assert_eq!(h.vm.connections(), 3);
    h.assert_forward_released();
}

#[tokio::test]
async fn gives_up_after_the_configured_attempts() {
    let h = harness_with(
        MockVmConfig {
            reject_connections: usize::MAX,
            ..MockVmConfig::default()
        },
        RecordingDevice::new,
        |bc| bc,
        InjectOptions {
            connect_attempts: 3,
            ..options()
        },
    )
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::Connect);
    assert!(
        matches!(err.kind, InjectErrorKind::Connection { attempts: 3, .. }),
        "{err}"
    );
    assert_eq!(h.vm.connections(), 3);
    assert_eq!(h.back_channel.listens(), 0);
    h.assert_forward_released();
}

#[tokio::test]
async fn forward_failures_still_release_the_port() {
    let h = harness_with(
        MockVmConfig::default(),
        RecordingDevice::failing,
        |bc| bc,
        options(),
    )
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::Forward);
    assert!(
        matches!(err.kind, InjectErrorKind::Forwarding(ForwardError::Device(_))),
        "{err}"
    );
    assert!(err.to_string().contains("device offline"), "{err}");
    assert_eq!(h.vm.connections(), 0);
    h.assert_forward_released();
}

#[tokio::test]
async fn missing_class_loader_checkpoint_degrades() {
    let h = harness(MockVmConfig {
        has_application_loaders: false,
        ..MockVmConfig::default()
    })
    .await;

    let injection = h.inject().await.unwrap();

    // The ABI comes from Build.CPU_ABI read at onCreate instead.
    assert_eq!(injection.abi, Abi::Arm64V8a);
    assert!(
        matches!(
            injection.degradations.as_slice(),
            [Degradation::LibrarySearchPathUnpatched { reason }]
                if reason.contains("ApplicationLoaders")
        ),
        "{:?}",
        injection.degradations
    );
    assert_eq!(h.vm.library_search_path().await, None);
    assert_eq!(h.loaded_paths().await, expected_loads());
    h.assert_forward_released();
}

#[tokio::test]
async fn missing_application_class_is_fatal() {
    let h = harness(MockVmConfig {
        has_application: false,
        ..MockVmConfig::default()
    })
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::MandatoryCheckpoint);
    assert!(
        matches!(err.kind, InjectErrorKind::Resolution(_)),
        "{err}"
    );
    assert!(h.vm.loaded_libraries().await.is_empty());
    assert_eq!(h.back_channel.listens(), 0);
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn cancelling_while_waiting_for_on_create_tears_down() {
    let h = harness(MockVmConfig {
        reaches_on_create: false,
        ..MockVmConfig::default()
    })
    .await;
    let ctx = RequestContext::default();

    let canceller = {
        let ctx = ctx.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            ctx.cancel();
        }
    };
    let (result, ()) = tokio::join!(h.inject_with(&ctx), canceller);

    let err = result.unwrap_err();
    assert_eq!(err.stage, Stage::MandatoryCheckpoint);
    assert!(err.is_cancelled(), "{err}");
    // The early patch still went through before startup stalled.
    assert_eq!(
        h.vm.library_search_path().await.as_deref(),
        Some("/data/app/com.example.app-1/lib/arm64:/data/local/tmp/jinject/arm64-v8a")
    );
    assert!(h.vm.loaded_libraries().await.is_empty());
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn deadline_interrupts_a_stalled_startup() {
    let h = harness(MockVmConfig {
        reaches_on_create: false,
        ..MockVmConfig::default()
    })
    .await;
    let ctx = RequestContext::default().with_timeout(Duration::from_millis(300));

    let result = tokio::time::timeout(Duration::from_secs(10), h.inject_with(&ctx))
        .await
        .expect("deadline was not enforced");

    let err = result.unwrap_err();
    assert_eq!(err.stage, Stage::MandatoryCheckpoint);
    assert!(err.is_cancelled(), "{err}");
    assert!(ctx.is_cancelled());
    assert!(h.vm.loaded_libraries().await.is_empty());
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn cancelling_between_connection_attempts_tears_down() {
    let h = harness_with(
        MockVmConfig {
            reject_connections: usize::MAX,
            ..MockVmConfig::default()
        },
        RecordingDevice::new,
        |bc| bc,
        InjectOptions {
            connect_attempts: 100,
            connect_delay: Duration::from_secs(30),
            ..options()
        },
    )
    .await;
    let vm = &h.vm;

    let err = h
        .inject_cancelled_when(move || async move { vm.connections() >= 1 })
        .await;

    assert_eq!(err.stage, Stage::Connect);
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(h.vm.connections(), 1);
    assert_eq!(h.back_channel.listens(), 0);
    h.assert_forward_released();
}

#[tokio::test]
async fn cancelling_the_search_path_patch_tears_down() {
    // Build.CPU_ABI is the first thing the patch reads.
    let h = harness(MockVmConfig {
        delayed_replies: vec![delayed(2, 6)],
        ..MockVmConfig::default()
    })
    .await;

    let err = h
        .inject_cancelled_when(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            true
        })
        .await;

    assert_eq!(err.stage, Stage::EarlyCheckpoint);
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(h.vm.library_search_path().await, None);
    assert!(h.vm.loaded_libraries().await.is_empty());
    assert_eq!(h.back_channel.listens(), 0);
    h.assert_forward_released();
}

#[tokio::test]
async fn cancelling_while_loading_tears_down() {
    // Runtime.getRuntime() is the only static invoke, and it opens the load.
    let h = harness(MockVmConfig {
        delayed_replies: vec![delayed(3, 3)],
        ..MockVmConfig::default()
    })
    .await;
    let back_channel = &h.back_channel;

    let err = h
        .inject_cancelled_when(move || async move { back_channel.ready_at().is_some() })
        .await;

    assert_eq!(err.stage, Stage::Load);
    assert!(err.is_cancelled(), "{err}");
    assert!(h.vm.loaded_libraries().await.is_empty());
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn cancelling_while_waiting_for_the_back_channel_tears_down() {
    let nowhere = back_channel_addr();
    let h = harness_with(
        MockVmConfig {
            back_channel: Some(nowhere),
            ..MockVmConfig::default()
        },
        RecordingDevice::new,
        |bc| bc,
        InjectOptions {
            accept_timeout: Duration::from_secs(30),
            ..options()
        },
    )
    .await;
    let vm = &h.vm;

    // The dial comes from the instrumentation library's load; give the load
    // transaction time to finish before cancelling.
    let err = h
        .inject_cancelled_when(move || async move {
            if vm.back_channel_dial_failures() == 0 {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
            true
        })
        .await;

    assert_eq!(err.stage, Stage::Join);
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(h.loaded_paths().await, expected_loads());
    assert!(h.vm.disposed());
    h.assert_forward_released();
}

#[tokio::test]
async fn silent_instrumentation_times_out() {
    // The VM dials an address nobody listens on.
    let nowhere = back_channel_addr();
    let h = harness_with(
        MockVmConfig {
            back_channel: Some(nowhere),
            ..MockVmConfig::default()
        },
        RecordingDevice::new,
        |bc| bc,
        InjectOptions {
            accept_timeout: Duration::from_millis(300),
            ..options()
        },
    )
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::Join);
    assert!(
        matches!(
            err.kind,
            InjectErrorKind::HandshakeTimeout(after) if after == Duration::from_millis(300)
        ),
        "{err}"
    );
    assert_eq!(h.loaded_paths().await, expected_loads());
    assert_eq!(h.vm.back_channel_dial_failures(), 1);
    h.assert_forward_released();
}

#[tokio::test]
async fn listener_is_ready_before_any_library_loads() {
    let h = harness_with(
        MockVmConfig::default(),
        RecordingDevice::new,
        |bc| bc.with_startup(Duration::from_millis(250)),
        options(),
    )
    .await;

    h.inject().await.unwrap();

    let ready_at = h.back_channel.ready_at().expect("listener never became ready");
    let loaded = h.vm.loaded_libraries().await;
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(|lib| lib.at >= ready_at));
    assert_eq!(h.back_channel.listens(), 1);
}

#[tokio::test]
async fn failed_load_reports_the_loader_message() {
    let h = harness(MockVmConfig {
        fail_library_loads: true,
        ..MockVmConfig::default()
    })
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::Load);
    let InjectErrorKind::Transaction(ExecError::Rejected { message, .. }) = &err.kind else {
        panic!("unexpected error: {err}");
    };
    assert!(message.contains("dlopen failed"), "{message}");
    // The instrumentation library is never attempted after the interceptor fails.
    assert_eq!(
        h.loaded_paths().await,
        vec![format!("{ARM64_LIBS}/libinterceptor.so")]
    );
    assert!(h.vm.pinned_object_ids().await.is_empty());
    h.assert_forward_released();
}

#[tokio::test]
async fn unknown_device_abi_fails_the_patch() {
    let h = harness(MockVmConfig {
        cpu_abi: "sparc".to_string(),
        ..MockVmConfig::default()
    })
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::EarlyCheckpoint);
    assert!(
        matches!(err.kind, InjectErrorKind::Transaction(ExecError::UnknownAbi(_))),
        "{err}"
    );
    assert!(h.vm.loaded_libraries().await.is_empty());
    h.assert_forward_released();
}

#[tokio::test]
async fn abi_without_tooling_fails_the_patch() {
    let h = harness(MockVmConfig {
        cpu_abi: "x86_64".to_string(),
        ..MockVmConfig::default()
    })
    .await;

    let err = h.inject().await.unwrap_err();

    assert_eq!(err.stage, Stage::EarlyCheckpoint);
    assert!(
        matches!(
            err.kind,
            InjectErrorKind::Transaction(ExecError::Tooling(ToolingError::NoLibrariesForAbi(
                Abi::X86_64
            )))
        ),
        "{err}"
    );
    h.assert_forward_released();
}
