/// Producer side of the notification protocol.
///
/// The recorder and the wrapper scripts around the transcoder and uploader
/// use this (through `dashcam-watchdog send`) to report their state.
use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::warn;

use crate::state::DashcamState;

pub struct Reporter {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Reporter {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to watchdog at {addr}"))?;
        // One small token per write; don't let Nagle hold it back.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to disable Nagle on watchdog connection");
        }
        Ok(Self { stream, addr })
    }

    /// Sends `state` as one newline-terminated token in a single write.
    pub async fn send(&mut self, state: DashcamState) -> Result<()> {
        let message = format!("{state}\n");
        self.stream
            .write_all(message.as_bytes())
            .await
            .with_context(|| format!("Failed to send {state} to watchdog at {}", self.addr))?;
        self.stream.flush().await?;
        Ok(())
    }
}
