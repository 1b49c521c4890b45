use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use jinject_adb::AdbDevice;
use jinject_config::InjectConfig;
use jinject_loader::{
    InjectOptions, Injector, LibraryDescriptors, LibsDirEntry, TcpBackChannel, ToolingPaths,
    DEFAULT_INSTRUMENTATION_LIBRARY, DEFAULT_INTERCEPTOR_LIBRARY,
};
use jinject_scheduler::{CancellationToken, RequestContext};

/// Load native libraries into a debuggable Android process.
///
/// The process must be waiting for a debugger (`am start -D`). Both libraries
/// are loaded from `Application.onCreate`, before any app code runs, and the
/// command waits for the instrumentation library to connect back.
///
/// The library dials `back_channel.address` from the device. Unless
/// `back_channel.reverse` is turned off in the config, the port is made
/// reachable with `adb reverse tcp:<port> tcp:<port>` for the duration of the
/// command.
#[derive(Debug, Parser)]
#[command(name = "jinject", version, about)]
struct Cli {
    /// Process id of the app on the device.
    #[arg(long)]
    pid: u32,

    /// Device directory holding the libraries for an ABI, as `<abi>=<dir>`.
    /// Repeat for every ABI the tooling ships.
    #[arg(long = "libs-dir", value_name = "ABI=DIR", required = true)]
    libs_dirs: Vec<LibsDirEntry>,

    /// File name of the interceptor library, loaded first.
    #[arg(long, default_value = DEFAULT_INTERCEPTOR_LIBRARY)]
    interceptor: String,

    /// File name of the instrumentation library, loaded second.
    #[arg(long, default_value = DEFAULT_INSTRUMENTATION_LIBRARY)]
    library: String,

    /// adb serial of the target device. Overrides `adb.serial` from the config.
    #[arg(long)]
    serial: Option<String>,

    /// Path to a TOML config file.
    ///
    /// If unset, `JINJECT_CONFIG` is used as a fallback. When neither is
    /// provided the defaults are used.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Copy everything the instrumentation library sends to stdout until it
    /// disconnects.
    #[arg(long)]
    relay: bool,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.clone());
    jinject_config::init_tracing(&config.logging);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(target: "jinject.cli", "interrupted; cleaning up");
                cancel.cancel();
            }
        }
    });

    let serial = cli.serial.clone().or_else(|| config.adb.serial.clone());
    let device = AdbDevice::new(config.adb.program.clone(), serial)
        .with_command_timeout(config.adb.command_timeout());
    let back_channel = TcpBackChannel::from_config(&config.back_channel);
    let injector = Injector::new(device, back_channel, InjectOptions::from_config(&config));

    let reverse_port = config
        .back_channel
        .reverse
        .then_some(config.back_channel.address.port());
    if let Some(port) = reverse_port {
        injector
            .device()
            .reverse(port, &cancel)
            .await
            .with_context(|| format!("failed to reverse back-channel port {port}"))?;
    }

    let result = inject_and_relay(&injector, cli, &cancel).await;

    if let Some(port) = reverse_port {
        let ctx = RequestContext::detached(config.teardown.timeout());
        if let Err(err) = injector.device().remove_reverse(port, ctx.token()).await {
            tracing::warn!(target: "jinject.cli", port, error = %err, "failed to remove reverse");
        }
    }
    result
}

async fn inject_and_relay(
    injector: &Injector<AdbDevice, TcpBackChannel>,
    cli: Cli,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let tooling: ToolingPaths = cli.libs_dirs.into_iter().collect();
    let libraries = LibraryDescriptors {
        interceptor: cli.interceptor,
        instrumentation: cli.library,
    };

    let ctx = RequestContext::new(cancel.clone());
    let mut injection = injector
        .inject(&ctx, cli.pid, &tooling, &libraries)
        .await
        .with_context(|| format!("failed to inject into pid {}", cli.pid))?;

    for degradation in &injection.degradations {
        eprintln!("jinject: warning: {degradation}");
    }
    eprintln!(
        "jinject: injected into pid {} ({}); back channel from {}",
        cli.pid,
        injection.abi,
        injection
            .back_channel
            .peer_addr()
            .map_or_else(|_| "an unknown peer".to_string(), |addr| addr.to_string())
    );

    if cli.relay {
        let mut stdout = tokio::io::stdout();
        tokio::select! {
            _ = cancel.cancelled() => {}
            copied = tokio::io::copy(&mut injection.back_channel, &mut stdout) => {
                let copied = copied.context("back channel relay failed")?;
                tracing::debug!(target: "jinject.cli", bytes = copied, "back channel closed");
            }
        }
    }
    Ok(())
}

fn load_config(cli_path: Option<PathBuf>) -> InjectConfig {
    match jinject_config::load(cli_path.as_deref()) {
        Ok((config, _)) => config,
        Err(err) => {
            eprintln!("jinject: failed to load config: {err}; continuing with defaults");
            InjectConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use jinject_loader::Abi;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_repeated_libs_dirs() {
        let cli = Cli::try_parse_from([
            "jinject",
            "--pid",
            "1234",
            "--libs-dir",
            "arm64-v8a=/data/local/tmp/jinject/arm64",
            "--libs-dir",
            "x86=/data/local/tmp/jinject/x86",
        ])
        .unwrap();
        assert_eq!(cli.pid, 1234);
        assert_eq!(cli.interceptor, DEFAULT_INTERCEPTOR_LIBRARY);
        assert_eq!(cli.library, DEFAULT_INSTRUMENTATION_LIBRARY);

        let tooling: ToolingPaths = cli.libs_dirs.into_iter().collect();
        assert_eq!(
            tooling.libs_dir(Abi::Arm64V8a).unwrap(),
            "/data/local/tmp/jinject/arm64"
        );
        assert_eq!(tooling.libs_dir(Abi::X86).unwrap(), "/data/local/tmp/jinject/x86");
    }

    #[test]
    fn rejects_unknown_abis() {
        let err = Cli::try_parse_from(["jinject", "--pid", "1", "--libs-dir", "sparc=/tmp"])
            .unwrap_err();
        assert!(err.to_string().contains("sparc"), "{err}");
    }

    #[test]
    fn help_explains_the_reverse_requirement() {
        let help = Cli::command().render_long_help().to_string();
        assert!(help.contains("adb reverse"), "{help}");
    }

    #[test]
    fn rejects_a_root_libs_dir() {
        let err = Cli::try_parse_from(["jinject", "--pid", "1", "--libs-dir", "x86=/"])
            .unwrap_err();
        assert!(err.to_string().contains("x86=/"), "{err}");
    }

    #[test]
    fn libs_dir_is_required() {
        assert!(Cli::try_parse_from(["jinject", "--pid", "1"]).is_err());
    }
}
