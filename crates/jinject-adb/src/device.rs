use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    runner::{run_command_checked, CommandSpec, RunCommandError, RunOptions},
    Forward,
};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Command(#[from] RunCommandError),
    #[error("device operation cancelled")]
    Cancelled,
}

impl DeviceError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            DeviceError::Cancelled => true,
            DeviceError::Command(err) => err.is_cancelled(),
        }
    }
}

/// The pieces of a device an injection needs: forwarding a host port to a
/// process's JDWP agent and removing that forward again.
#[async_trait]
pub trait Device: Send + Sync {
    async fn forward(
        &self,
        forward: Forward,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError>;

    /// Removes the host side of `forward`. Succeeds if there is none.
    async fn remove_forward(
        &self,
        forward: Forward,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError>;
}

/// A device reached through the `adb` executable.
#[derive(Clone, Debug)]
pub struct AdbDevice {
    program: PathBuf,
    serial: Option<String>,
    options: RunOptions,
}

impl AdbDevice {
    pub fn new(program: impl Into<PathBuf>, serial: Option<String>) -> Self {
        Self {
            program: program.into(),
            serial,
            options: RunOptions::default(),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    fn command(&self) -> CommandSpec {
        let spec = CommandSpec::new(&self.program);
        match &self.serial {
            Some(serial) => spec.args(["-s", serial.as_str()]),
            None => spec,
        }
    }

    pub(crate) fn forward_command(&self, forward: Forward) -> CommandSpec {
        self.command()
            .arg("forward")
            .arg(format!("tcp:{}", forward.local_port))
            .arg(format!("jdwp:{}", forward.pid))
    }

    pub(crate) fn remove_forward_command(&self, forward: Forward) -> CommandSpec {
        self.command()
            .args(["forward", "--remove"])
            .arg(format!("tcp:{}", forward.local_port))
    }

    pub(crate) fn reverse_command(&self, port: u16) -> CommandSpec {
        self.command()
            .arg("reverse")
            .arg(format!("tcp:{port}"))
            .arg(format!("tcp:{port}"))
    }

    pub(crate) fn remove_reverse_command(&self, port: u16) -> CommandSpec {
        self.command()
            .args(["reverse", "--remove"])
            .arg(format!("tcp:{port}"))
    }

    /// Makes device-side connections to `127.0.0.1:<port>` reach the same
    /// port on the host (`adb reverse`).
    pub async fn reverse(
        &self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let command = self.reverse_command(port);
        tracing::debug!(target: "jinject.adb", %command, "adding reverse");
        run_command_checked(&command, &self.options, cancel).await?;
        Ok(())
    }

    /// Undoes [`AdbDevice::reverse`]. Succeeds if there is no such reverse.
    pub async fn remove_reverse(
        &self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let command = self.remove_reverse_command(port);
        tracing::debug!(target: "jinject.adb", %command, "removing reverse");
        tolerate_missing(run_command_checked(&command, &self.options, cancel).await, port)
    }
}

// adb: "error: listener 'tcp:1234' not found"
fn tolerate_missing<T>(result: Result<T, RunCommandError>, port: u16) -> Result<(), DeviceError> {
    match result {
        Ok(_) => Ok(()),
        Err(err)
            if err
                .output()
                .is_some_and(|output| output.combined().contains("not found")) =>
        {
            tracing::debug!(target: "jinject.adb", port, "listener already gone");
            Ok(())
        }
        Err(err) if err.is_cancelled() => Err(DeviceError::Cancelled),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl Device for AdbDevice {
    async fn forward(
        &self,
        forward: Forward,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let command = self.forward_command(forward);
        tracing::debug!(target: "jinject.adb", %command, "adding forward");
        run_command_checked(&command, &self.options, cancel).await?;
        Ok(())
    }

    async fn remove_forward(
        &self,
        forward: Forward,
        cancel: &CancellationToken,
    ) -> Result<(), DeviceError> {
        let command = self.remove_forward_command(forward);
        tracing::debug!(target: "jinject.adb", %command, "removing forward");
        tolerate_missing(
            run_command_checked(&command, &self.options, cancel).await,
            forward.local_port,
        )
    }
}
