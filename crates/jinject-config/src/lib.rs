//! Configuration for the `jinject` tools.
//!
//! Every setting has a default, so an empty (or missing) config file yields a
//! working configuration. Durations are stored in milliseconds and exposed as
//! [`Duration`] accessors.

use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriter, MakeWriterExt};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Layer;

/// Environment variable naming a config file to load when none is given
/// explicitly.
pub const JINJECT_CONFIG_ENV_VAR: &str = "JINJECT_CONFIG";

/// Port the instrumentation library dials back to by default.
pub const DEFAULT_BACK_CHANNEL_PORT: u16 = 9286;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InjectConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub adb: AdbConfig,
    #[serde(default)]
    pub jdwp: JdwpConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub back_channel: BackChannelConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Either a simple level (`info`, `debug`, ...) or `EnvFilter` directives.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,

    /// Write logs to stderr.
    #[serde(default = "LoggingConfig::default_stderr")]
    pub stderr: bool,

    /// Append logs to the given file as well.
    ///
    /// If the file cannot be opened, file logging is disabled while other sinks
    /// remain active.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    fn default_stderr() -> bool {
        true
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            "off" | "none" => "off".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// The effective `EnvFilter`: `level` merged with `RUST_LOG` when set.
    ///
    /// Invalid `RUST_LOG` directives are ignored in favour of `level`.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let config_directives = Self::normalize_level_directives(&self.level);

        match env_directives {
            Some(env_directives) => {
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
            stderr: Self::default_stderr(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdbConfig {
    /// `adb` executable; bare names are looked up on `PATH`.
    #[serde(default = "AdbConfig::default_program")]
    pub program: PathBuf,

    /// Device serial passed as `adb -s <serial>`.
    #[serde(default)]
    pub serial: Option<String>,

    #[serde(default = "AdbConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl AdbConfig {
    fn default_program() -> PathBuf {
        PathBuf::from("adb")
    }

    fn default_command_timeout_ms() -> u64 {
        10_000
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            serial: None,
            command_timeout_ms: Self::default_command_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JdwpConfig {
    #[serde(default = "JdwpConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "JdwpConfig::default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl JdwpConfig {
    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_reply_timeout_ms() -> u64 {
        10_000
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            reply_timeout_ms: Self::default_reply_timeout_ms(),
        }
    }
}

/// How hard to try attaching to a freshly forwarded JDWP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectConfig {
    /// Total number of attempts. `0` behaves like `1`.
    #[serde(default = "ConnectConfig::default_attempts")]
    pub attempts: u32,
    #[serde(default = "ConnectConfig::default_delay_ms")]
    pub delay_ms: u64,
}

impl ConnectConfig {
    fn default_attempts() -> u32 {
        10
    }

    fn default_delay_ms() -> u64 {
        1_000
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            delay_ms: Self::default_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackChannelConfig {
    /// Host address the instrumentation library connects back to.
    #[serde(default = "BackChannelConfig::default_address")]
    pub address: SocketAddr,

    #[serde(default = "BackChannelConfig::default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,

    /// Bytes the library must send first on the back channel.
    #[serde(default)]
    pub greeting: Option<String>,

    /// Run `adb reverse tcp:<port> tcp:<port>` for the address's port while
    /// injecting, so the library can reach the host through the device's
    /// loopback. Turn off when the device reaches `address` directly.
    #[serde(default = "BackChannelConfig::default_reverse")]
    pub reverse: bool,
}

impl BackChannelConfig {
    fn default_address() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            DEFAULT_BACK_CHANNEL_PORT,
        ))
    }

    fn default_accept_timeout_ms() -> u64 {
        30_000
    }

    fn default_reverse() -> bool {
        true
    }

    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

impl Default for BackChannelConfig {
    fn default() -> Self {
        Self {
            address: Self::default_address(),
            accept_timeout_ms: Self::default_accept_timeout_ms(),
            greeting: None,
            reverse: Self::default_reverse(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeardownConfig {
    /// Budget for closing the session and removing the port forward. Teardown
    /// ignores the invocation's cancellation but not this deadline.
    #[serde(default = "TeardownConfig::default_timeout_ms")]
    pub timeout_ms: u64,
}

impl TeardownConfig {
    fn default_timeout_ms() -> u64 {
        5_000
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Self::default_timeout_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a snippet of the input; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl InjectConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// Picks the config file to use: `explicit` if given, else
/// [`JINJECT_CONFIG_ENV_VAR`] when set and non-empty.
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    std::env::var_os(JINJECT_CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Loads the discovered config, or the defaults when there is none.
///
/// Returns the path that was loaded alongside the config.
pub fn load(explicit: Option<&Path>) -> Result<(InjectConfig, Option<PathBuf>), ConfigError> {
    match discover_config_path(explicit) {
        Some(path) => {
            let config = InjectConfig::load_from_path(&path)?;
            Ok((config, Some(path)))
        }
        None => Ok((InjectConfig::default(), None)),
    }
}

struct MutexFileMakeWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl<'a> MakeWriter<'a> for MutexFileMakeWriter {
    type Writer = MutexFileWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        MutexFileWriter { guard }
    }
}

struct MutexFileWriter<'a> {
    guard: std::sync::MutexGuard<'a, std::fs::File>,
}

impl Write for MutexFileWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.guard.flush()
    }
}

static TRACING_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber described by `config`.
///
/// Safe to call more than once; only the first call has an effect.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();

        let mut file_open_error = None;
        let file = config.file.as_ref().and_then(|path| {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => Some(Arc::new(Mutex::new(file))),
                Err(err) => {
                    file_open_error = Some((path.clone(), err));
                    None
                }
            }
        });

        let mut make_writer: Option<BoxMakeWriter> = None;
        if config.stderr {
            // `cargo test` only captures output written through the stdlib's print
            // macros, which `TestWriter` uses.
            make_writer = Some(if cfg!(debug_assertions) {
                BoxMakeWriter::new(tracing_subscriber::fmt::writer::TestWriter::with_stderr)
            } else {
                BoxMakeWriter::new(std::io::stderr)
            });
        }
        if let Some(file) = file {
            let file_writer = MutexFileMakeWriter { file };
            make_writer = Some(match make_writer {
                Some(existing) => BoxMakeWriter::new(existing.and(file_writer)),
                None => BoxMakeWriter::new(file_writer),
            });
        }
        let make_writer = make_writer.unwrap_or_else(|| BoxMakeWriter::new(std::io::sink));

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(make_writer)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            if let Some((path, err)) = file_open_error {
                tracing::warn!(
                    target: "jinject.config",
                    path = %path.display(),
                    error = %err,
                    "failed to open log file; file logging disabled"
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = InjectConfig::load_from_str("").unwrap();
        assert_eq!(config, InjectConfig::default());
        assert_eq!(config.connect.attempts, 10);
        assert_eq!(config.connect.delay(), Duration::from_secs(1));
        assert_eq!(config.adb.program, PathBuf::from("adb"));
        assert_eq!(
            config.back_channel.address,
            "127.0.0.1:9286".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(config.teardown.timeout(), Duration::from_secs(5));
        assert!(config.back_channel.reverse);
        assert!(config.logging.stderr);
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config = InjectConfig::load_from_str(
            r#"
[adb]
serial = "emulator-5554"

[connect]
attempts = 3

[back_channel]
address = "127.0.0.1:27039"
greeting = "gapii"
reverse = false
"#,
        )
        .unwrap();

        assert_eq!(config.adb.serial.as_deref(), Some("emulator-5554"));
        assert_eq!(config.adb.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect.attempts, 3);
        assert_eq!(config.connect.delay_ms, 1_000);
        assert_eq!(config.back_channel.address.port(), 27039);
        assert_eq!(config.back_channel.greeting.as_deref(), Some("gapii"));
        assert_eq!(config.back_channel.accept_timeout(), Duration::from_secs(30));
        assert!(!config.back_channel.reverse);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = InjectConfig::load_from_str("[connect]\nattempst = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)), "{err}");
        assert!(err.to_string().contains("attempst"), "{err}");
    }

    #[test]
    fn toml_errors_do_not_echo_the_input() {
        let text = "[adb]\nserial = \"secret-serial\"\ncommand_timeout_ms = \"x\"\n";
        let err = InjectConfig::load_from_str(text).unwrap_err();
        assert!(!err.to_string().contains("secret-serial"), "{err}");
    }

    #[test]
    fn level_directives_are_normalized() {
        assert_eq!(LoggingConfig::normalize_level_directives(""), "info");
        assert_eq!(LoggingConfig::normalize_level_directives(" WARNING "), "warn");
        assert_eq!(LoggingConfig::normalize_level_directives("Debug"), "debug");
        assert_eq!(
            LoggingConfig::normalize_level_directives("jinject_jdwp=trace,info"),
            "jinject_jdwp=trace,info"
        );
    }
}
