//! The host end of the connection the injected library dials back on.

use std::{io, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum BackChannelError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to accept back-channel connection: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to read back-channel greeting: {0}")]
    Greeting(#[source] io::Error),
    #[error("unexpected back-channel greeting: expected {expected:?}, got {got:?}")]
    UnexpectedGreeting { expected: Vec<u8>, got: Vec<u8> },
    #[error("back-channel listener stopped unexpectedly")]
    ListenerLost,
    #[error("back-channel listener cancelled")]
    Cancelled,
}

/// Something that can wait for the injected library to connect back.
#[async_trait]
pub trait BackChannel: Send + Sync + 'static {
    /// Starts listening. Once this returns `Ok`, a connection attempt from the
    /// target will be queued for [`BackChannelListener::accept`].
    async fn listen(&self) -> Result<Box<dyn BackChannelListener>, BackChannelError>;
}

#[async_trait]
pub trait BackChannelListener: Send {
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Waits for the first connection and validates it.
    async fn accept(
        self: Box<Self>,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, BackChannelError>;
}

/// Listens on a host TCP address.
///
/// A loopback address is only reachable from the device once
/// `adb reverse tcp:<port> tcp:<port>` is in place for its port; see
/// [`jinject_adb::AdbDevice::reverse`].
#[derive(Clone, Debug)]
pub struct TcpBackChannel {
    addr: SocketAddr,
    greeting: Vec<u8>,
}

impl TcpBackChannel {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            greeting: Vec::new(),
        }
    }

    /// Requires every accepted connection to start with `greeting`.
    pub fn with_greeting(mut self, greeting: impl Into<Vec<u8>>) -> Self {
        self.greeting = greeting.into();
        self
    }

    pub fn from_config(config: &jinject_config::BackChannelConfig) -> Self {
        let channel = Self::new(config.address);
        match &config.greeting {
            Some(greeting) => channel.with_greeting(greeting.as_bytes()),
            None => channel,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl BackChannel for TcpBackChannel {
    async fn listen(&self) -> Result<Box<dyn BackChannelListener>, BackChannelError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| BackChannelError::Bind {
                addr: self.addr,
                source,
            })?;
        Ok(Box::new(TcpBackChannelListener {
            listener,
            greeting: self.greeting.clone(),
        }))
    }
}

struct TcpBackChannelListener {
    listener: TcpListener,
    greeting: Vec<u8>,
}

#[async_trait]
impl BackChannelListener for TcpBackChannelListener {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    async fn accept(
        self: Box<Self>,
        cancel: &CancellationToken,
    ) -> Result<TcpStream, BackChannelError> {
        let (mut stream, peer) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackChannelError::Cancelled),
            accepted = self.listener.accept() => accepted.map_err(BackChannelError::Accept)?,
        };
        tracing::debug!(target: "jinject.loader", %peer, "back channel connected");

        if !self.greeting.is_empty() {
            let mut got = vec![0u8; self.greeting.len()];
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackChannelError::Cancelled),
                read = stream.read_exact(&mut got) => {
                    read.map_err(BackChannelError::Greeting)?;
                }
            }
            if got != self.greeting {
                return Err(BackChannelError::UnexpectedGreeting {
                    expected: self.greeting,
                    got,
                });
            }
        }
        Ok(stream)
    }
}
