//! The injection state machine.
//!
//! One call to [`Injector::inject`] forwards a host port to the target's JDWP
//! agent, attaches, waits for the app's startup checkpoints, loads the
//! interceptor and instrumentation libraries from `Application.onCreate`, and
//! returns the connection the instrumentation library opens back to the
//! host. The forward and the session are always torn down before it returns.

use std::{
    fmt,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use jinject_adb::{local_free_tcp_port, Device, DeviceError, Forward};
use jinject_config::InjectConfig;
use jinject_jdwp::{
    wire::{JdwpError, ThreadId},
    DebugSession, JdwpClientConfig,
};
use jinject_scheduler::{retry, RequestContext, RetryError, TaskError};
use tokio::{net::TcpStream, sync::oneshot};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    abi::Abi,
    back_channel::{BackChannel, BackChannelError},
    checkpoint::{wait_for_on_create, wait_for_vulkan_load, Checkpoint, CheckpointOutcome},
    exec::{with_suspended_thread, Arg, ExecError, Outcome, Slot, Transaction},
    tooling::{LibraryDescriptors, ToolingPaths},
};

const BUILD_CLASS: &str = "android.os.Build";
const CPU_ABI_FIELD: &str = "CPU_ABI";
const LIBRARY_SEARCH_PATH: &str = "librarySearchPath";

/// The state the orchestration was in when it failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Forward,
    Connect,
    EarlyCheckpoint,
    MandatoryCheckpoint,
    Load,
    Join,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Forward => "forwarding the JDWP port",
            Stage::Connect => "connecting to JDWP",
            Stage::EarlyCheckpoint => "patching the library search path",
            Stage::MandatoryCheckpoint => "waiting for Application.onCreate",
            Stage::Load => "loading libraries",
            Stage::Join => "waiting for the back channel",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no free local port: {0}")]
    NoFreePort(#[source] io::Error),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

#[derive(Debug, thiserror::Error)]
pub enum InjectErrorKind {
    #[error(transparent)]
    Forwarding(ForwardError),
    #[error("gave up after {attempts} attempt(s): {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: JdwpError,
    },
    /// A mandatory class or method is missing from the target.
    #[error(transparent)]
    Resolution(JdwpError),
    /// The debug session failed after it was established.
    #[error(transparent)]
    Session(JdwpError),
    #[error(transparent)]
    Transaction(ExecError),
    #[error("no back-channel connection within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    BackChannel(BackChannelError),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
#[error("{stage}: {kind}")]
pub struct InjectError {
    pub stage: Stage,
    #[source]
    pub kind: InjectErrorKind,
}

impl InjectError {
    pub fn new(stage: Stage, kind: InjectErrorKind) -> Self {
        Self { stage, kind }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, InjectErrorKind::Cancelled)
    }

    fn cancelled(stage: Stage) -> Self {
        Self::new(stage, InjectErrorKind::Cancelled)
    }

    fn session(stage: Stage, err: JdwpError) -> Self {
        if err.is_cancelled() {
            return Self::cancelled(stage);
        }
        Self::new(stage, InjectErrorKind::Session(err))
    }

    fn transaction(stage: Stage, err: ExecError) -> Self {
        if err.is_cancelled() {
            return Self::cancelled(stage);
        }
        Self::new(stage, InjectErrorKind::Transaction(err))
    }
}

/// Capability lost during an otherwise successful injection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Degradation {
    /// The ABI library directory was not appended to the app's library
    /// search path, so layers loaded through it (Vulkan) are not intercepted.
    LibrarySearchPathUnpatched { reason: String },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::LibrarySearchPathUnpatched { reason } => {
                write!(f, "library search path not patched: {reason}")
            }
        }
    }
}

/// A successful injection.
#[derive(Debug)]
pub struct Injection {
    /// Connection opened by the instrumentation library.
    pub back_channel: TcpStream,
    /// ABI the libraries were loaded for.
    pub abi: Abi,
    /// Thread the libraries were loaded on.
    pub thread: ThreadId,
    pub degradations: Vec<Degradation>,
}

#[derive(Clone, Debug)]
pub struct InjectOptions {
    pub connect_host: IpAddr,
    pub connect_attempts: u32,
    pub connect_delay: Duration,
    pub jdwp: JdwpClientConfig,
    pub accept_timeout: Duration,
    pub teardown_timeout: Duration,
}

impl Default for InjectOptions {
    fn default() -> Self {
        Self::from_config(&InjectConfig::default())
    }
}

impl InjectOptions {
    pub fn from_config(config: &InjectConfig) -> Self {
        Self {
            connect_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            connect_attempts: config.connect.attempts,
            connect_delay: config.connect.delay(),
            jdwp: JdwpClientConfig {
                handshake_timeout: config.jdwp.handshake_timeout(),
                reply_timeout: config.jdwp.reply_timeout(),
                ..JdwpClientConfig::default()
            },
            accept_timeout: config.back_channel.accept_timeout(),
            teardown_timeout: config.teardown.timeout(),
        }
    }
}

pub struct Injector<D, B> {
    device: D,
    back_channel: Arc<B>,
    options: InjectOptions,
}

impl<D, B> Injector<D, B>
where
    D: Device,
    B: BackChannel,
{
    pub fn new(device: D, back_channel: B, options: InjectOptions) -> Self {
        Self {
            device,
            back_channel: Arc::new(back_channel),
            options,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn options(&self) -> &InjectOptions {
        &self.options
    }

    /// Loads `libraries` into process `pid` and waits for the instrumentation
    /// library to connect back.
    ///
    /// `pid` must have been started waiting for a debugger. Cancelling `ctx`,
    /// or reaching its deadline, interrupts whichever step is in flight; the
    /// port forward and the session are still released.
    pub async fn inject(
        &self,
        ctx: &RequestContext,
        pid: u32,
        tooling: &ToolingPaths,
        libraries: &LibraryDescriptors,
    ) -> Result<Injection, InjectError> {
        ctx.ensure_deadline_timer();
        let local_port = local_free_tcp_port().map_err(|err| {
            InjectError::new(
                Stage::Forward,
                InjectErrorKind::Forwarding(ForwardError::NoFreePort(err)),
            )
        })?;
        let forward = Forward { local_port, pid };
        let span = tracing::info_span!(target: "jinject.loader", "inject", pid, local_port);

        async {
            let mut session = None;
            let result = self.run(ctx, forward, &mut session, tooling, libraries).await;
            match &result {
                Ok(injection) => tracing::info!(
                    target: "jinject.loader",
                    abi = injection.abi.name(),
                    degraded = !injection.degradations.is_empty(),
                    "injection complete"
                ),
                Err(err) => {
                    tracing::warn!(target: "jinject.loader", error = %err, "injection failed")
                }
            }
            self.teardown(session, forward).await;
            result
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        ctx: &RequestContext,
        forward: Forward,
        session_slot: &mut Option<DebugSession>,
        tooling: &ToolingPaths,
        libraries: &LibraryDescriptors,
    ) -> Result<Injection, InjectError> {
        let cancel = ctx.token();

        tracing::info!(target: "jinject.loader", %forward, "forwarding jdwp port");
        if let Err(err) = self.device.forward(forward, cancel).await {
            if err.is_cancelled() {
                return Err(InjectError::cancelled(Stage::Forward));
            }
            return Err(InjectError::new(
                Stage::Forward,
                InjectErrorKind::Forwarding(err.into()),
            ));
        }

        tracing::info!(target: "jinject.loader", "connecting to jdwp");
        let session = session_slot.insert(self.connect(cancel, forward.local_port).await?);

        tracing::info!(target: "jinject.loader", "waiting for {}", Checkpoint::VULKAN_LOAD.name);
        let mut degradations = Vec::new();
        let mut early_thread = None;
        let mut abi = None;
        match wait_for_vulkan_load(session, cancel).await {
            Ok(CheckpointOutcome::Hit(hit)) => {
                early_thread = Some(hit.thread);
                let patched = patch_library_search_path(session, hit.thread, tooling, cancel)
                    .await
                    .map_err(|err| InjectError::transaction(Stage::EarlyCheckpoint, err))?;
                tracing::debug!(
                    target: "jinject.loader",
                    abi = patched.name(),
                    "library search path patched"
                );
                abi = Some(patched);
            }
            Ok(CheckpointOutcome::Unsupported(reason)) => {
                degradations.push(degrade(reason.to_string()));
            }
            Err(err) if err.is_cancelled() => {
                return Err(InjectError::cancelled(Stage::EarlyCheckpoint));
            }
            Err(err) => degradations.push(degrade(err.to_string())),
        }

        tracing::info!(target: "jinject.loader", "waiting for {}", Checkpoint::ON_CREATE.name);
        let on_create = match wait_for_on_create(session, early_thread, cancel).await {
            Ok(CheckpointOutcome::Hit(hit)) => hit,
            Ok(CheckpointOutcome::Unsupported(reason)) => {
                return Err(InjectError::new(
                    Stage::MandatoryCheckpoint,
                    InjectErrorKind::Resolution(reason),
                ));
            }
            Err(err) => return Err(InjectError::session(Stage::MandatoryCheckpoint, err)),
        };

        let (back_channel, abi) = self
            .load_and_connect(ctx, session, on_create.thread, abi, tooling, libraries)
            .await?;

        Ok(Injection {
            back_channel,
            abi,
            thread: on_create.thread,
            degradations,
        })
    }

    /// Dials the forwarded port until a JDWP handshake succeeds.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        local_port: u16,
    ) -> Result<DebugSession, InjectError> {
        let addr = SocketAddr::new(self.options.connect_host, local_port);
        let config = self.options.jdwp.clone();
        let connected = retry(
            cancel,
            self.options.connect_attempts,
            self.options.connect_delay,
            |attempt| {
                let config = config.clone();
                async move {
                    tracing::debug!(target: "jinject.loader", attempt, %addr, "dialing jdwp");
                    DebugSession::connect(addr, config).await
                }
            },
        )
        .await;
        match connected {
            Ok(session) => Ok(session),
            Err(RetryError::Cancelled) => Err(InjectError::cancelled(Stage::Connect)),
            Err(RetryError::Exhausted { attempts, last }) => Err(InjectError::new(
                Stage::Connect,
                InjectErrorKind::Connection {
                    attempts,
                    source: last,
                },
            )),
        }
    }

    /// Starts the back-channel listener, loads both libraries once it is
    /// listening, then waits for the instrumentation library to connect.
    async fn load_and_connect(
        &self,
        ctx: &RequestContext,
        session: &DebugSession,
        thread: ThreadId,
        abi: Option<Abi>,
        tooling: &ToolingPaths,
        libraries: &LibraryDescriptors,
    ) -> Result<(TcpStream, Abi), InjectError> {
        let cancel = ctx.token();
        let (ready_tx, ready_rx) = oneshot::channel();
        let listener_token = cancel.child_token();
        let listener = jinject_scheduler::spawn(
            listener_token.clone(),
            listen(
                self.back_channel.clone(),
                ready_tx,
                self.options.accept_timeout,
                listener_token,
            )
            .in_current_span(),
        );

        let ready = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(InjectError::cancelled(Stage::Load)),
            ready = ready_rx => ready,
        };
        let addr = match ready {
            Ok(addr) => addr,
            Err(_) => {
                // The listener ended before it was listening; its result says why.
                let err = match join_listener(listener, Stage::Load).await {
                    Err(err) => err,
                    Ok(_) => InjectError::new(
                        Stage::Load,
                        InjectErrorKind::BackChannel(BackChannelError::ListenerLost),
                    ),
                };
                return Err(err);
            }
        };
        tracing::info!(target: "jinject.loader", addr = ?addr, "back channel listening");

        tracing::info!(target: "jinject.loader", "loading libraries");
        let abi = load_libraries(session, thread, abi, tooling, libraries, cancel)
            .await
            .map_err(|err| InjectError::transaction(Stage::Load, err))?;

        tracing::info!(target: "jinject.loader", "waiting for the back channel");
        let stream = join_listener(listener, Stage::Join).await?;
        Ok((stream, abi))
    }

    async fn teardown(&self, session: Option<DebugSession>, forward: Forward) {
        let ctx = RequestContext::detached(self.options.teardown_timeout);
        if let Some(session) = session {
            if ctx.run(session.close()).await.is_err() {
                tracing::warn!(target: "jinject.loader", "timed out closing the jdwp session");
            }
        }
        if let Err(err) = self.device.remove_forward(forward, ctx.token()).await {
            tracing::warn!(
                target: "jinject.loader",
                error = %err,
                "failed to remove jdwp port forward"
            );
        }
    }
}

fn degrade(reason: String) -> Degradation {
    tracing::warn!(
        target: "jinject.loader",
        reason = %reason,
        "couldn't break in {}; Vulkan will not be supported",
        Checkpoint::VULKAN_LOAD.name
    );
    Degradation::LibrarySearchPathUnpatched { reason }
}

enum ListenError {
    BackChannel(BackChannelError),
    TimedOut(Duration),
}

async fn listen<B: BackChannel>(
    back_channel: Arc<B>,
    ready: oneshot::Sender<Option<SocketAddr>>,
    accept_timeout: Duration,
    cancel: CancellationToken,
) -> Result<TcpStream, ListenError> {
    let listener = back_channel.listen().await.map_err(ListenError::BackChannel)?;
    // Nobody waiting for readiness means the injection is already over.
    if ready.send(listener.local_addr()).is_err() {
        return Err(ListenError::BackChannel(BackChannelError::Cancelled));
    }
    match tokio::time::timeout(accept_timeout, listener.accept(&cancel)).await {
        Ok(accepted) => accepted.map_err(ListenError::BackChannel),
        Err(_) => Err(ListenError::TimedOut(accept_timeout)),
    }
}

async fn join_listener(
    listener: jinject_scheduler::AsyncTask<Result<TcpStream, ListenError>>,
    stage: Stage,
) -> Result<TcpStream, InjectError> {
    match listener.join().await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(ListenError::TimedOut(after))) => Err(InjectError::new(
            stage,
            InjectErrorKind::HandshakeTimeout(after),
        )),
        Ok(Err(ListenError::BackChannel(BackChannelError::Cancelled)))
        | Err(TaskError::Cancelled) => Err(InjectError::cancelled(stage)),
        Ok(Err(ListenError::BackChannel(err))) => Err(InjectError::new(
            stage,
            InjectErrorKind::BackChannel(err),
        )),
        Err(err) => {
            tracing::error!(target: "jinject.loader", error = %err, "back-channel listener failed");
            Err(InjectError::new(
                stage,
                InjectErrorKind::BackChannel(BackChannelError::ListenerLost),
            ))
        }
    }
}

/// Reads `Build.CPU_ABI` and appends that ABI's library directory to the
/// `librarySearchPath` argument of the suspended `getClassLoader` frame.
async fn patch_library_search_path(
    session: &DebugSession,
    thread: ThreadId,
    tooling: &ToolingPaths,
    cancel: &CancellationToken,
) -> Result<Abi, ExecError> {
    let tooling = tooling.clone();
    let (cpu_abi, outcome) = with_suspended_thread(session, thread, cancel, |tx| {
        let cpu_abi = tx.static_field(BUILD_CLASS, CPU_ABI_FIELD);
        let suffix = tx.derive_string(cpu_abi, move |name| {
            let abi: Abi = name.parse()?;
            Ok(format!(":{}", tooling.libs_dir(abi)?))
        });
        let current = tx.local(LIBRARY_SEARCH_PATH);
        let patched = tx.invoke(current, "concat", [Arg::Slot(suffix)]);
        tx.set_local(LIBRARY_SEARCH_PATH, patched);
        cpu_abi
    })
    .await?;
    decoded_abi(&outcome, cpu_abi)
}

/// Loads the interceptor, then the instrumentation library, through
/// `Runtime.getRuntime().doLoad(path, null)`. Without a known ABI the
/// target's `Build.CPU_ABI` is read in the same transaction.
async fn load_libraries(
    session: &DebugSession,
    thread: ThreadId,
    abi: Option<Abi>,
    tooling: &ToolingPaths,
    libraries: &LibraryDescriptors,
    cancel: &CancellationToken,
) -> Result<Abi, ExecError> {
    if let Some(abi) = abi {
        let paths = libraries.paths(tooling, abi)?;
        tracing::debug!(
            target: "jinject.loader",
            abi = abi.name(),
            libraries = %paths,
            "loading libraries"
        );
        with_suspended_thread(session, thread, cancel, |tx| {
            let interceptor = tx.new_string(paths.interceptor);
            let instrumentation = tx.new_string(paths.instrumentation);
            load_both(tx, interceptor, instrumentation);
        })
        .await?;
        return Ok(abi);
    }

    let (cpu_abi, outcome) = with_suspended_thread(session, thread, cancel, |tx| {
        let cpu_abi = tx.static_field(BUILD_CLASS, CPU_ABI_FIELD);
        let interceptor = {
            let (tooling, libraries) = (tooling.clone(), libraries.clone());
            tx.derive_string(cpu_abi, move |name| {
                Ok(libraries.paths(&tooling, name.parse()?)?.interceptor)
            })
        };
        let instrumentation = {
            let (tooling, libraries) = (tooling.clone(), libraries.clone());
            tx.derive_string(cpu_abi, move |name| {
                Ok(libraries.paths(&tooling, name.parse()?)?.instrumentation)
            })
        };
        load_both(tx, interceptor, instrumentation);
        cpu_abi
    })
    .await?;
    decoded_abi(&outcome, cpu_abi)
}

fn load_both(tx: &mut Transaction, interceptor: Slot, instrumentation: Slot) {
    for (what, path) in [
        ("loading the interceptor library", interceptor),
        ("loading the instrumentation library", instrumentation),
    ] {
        let runtime = tx.invoke_static("java.lang.Runtime", "getRuntime", []);
        let result = tx.invoke(runtime, "doLoad", [Arg::Slot(path), Arg::Null]);
        tx.expect_null(result, what);
    }
}

fn decoded_abi(outcome: &Outcome, slot: Slot) -> Result<Abi, ExecError> {
    let name = outcome.string(slot).unwrap_or_default();
    Ok(name.parse()?)
}
