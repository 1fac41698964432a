/// Notification socket.
///
/// Serves exactly one producer connection at a time. Every way a connection
/// can end (clean close, I/O error, a token that is not a state name) is
/// reported as a [`ConnectionOutcome`], turned into a single `DEAD`
/// notification, and followed by a fresh accept. Nothing a client does can
/// stop the listener.
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::queue::NotificationSender;
use crate::state::{DashcamState, ParseStateError};

/// Size of each socket read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Pause before retrying after `accept` itself fails (e.g. fd exhaustion).
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How the byte stream is cut into tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Every read is split on `\n` on its own. A name fragmented across two
    /// reads arrives as two bad tokens. Producers write each token whole.
    #[default]
    PerRead,
    /// Bytes after the last `\n` are held back and joined with the next read.
    Lines,
}

/// Longest run of bytes the `Lines` framing holds while waiting for a newline.
/// State names are far shorter; anything past this is not a state.
pub const MAX_PENDING_BYTES: usize = READ_BUFFER_SIZE;

/// Input that ends a connection without being a transport failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MalformedInput {
    #[error(transparent)]
    UnknownState(#[from] ParseStateError),
    #[error("no newline within {0} bytes")]
    Overlong(usize),
}

/// Splits incoming bytes into non-empty newline-delimited tokens.
pub struct Tokenizer {
    framing: Framing,
    partial: Vec<u8>,
}

impl Tokenizer {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            partial: Vec::new(),
        }
    }

    /// Returns the complete tokens carried by `chunk`.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        match self.framing {
            Framing::PerRead => String::from_utf8_lossy(chunk)
                .split('\n')
                .filter(|token| !token.is_empty())
                .map(str::to_string)
                .collect(),
            Framing::Lines => {
                // Everything already in `partial` was scanned by an earlier
                // call and holds no newline.
                let mut search_from = self.partial.len();
                self.partial.extend_from_slice(chunk);

                let mut tokens = Vec::new();
                let mut start = 0;
                while let Some(offset) =
                    self.partial[search_from..].iter().position(|&b| b == b'\n')
                {
                    let end = search_from + offset;
                    let line = &self.partial[start..end];
                    if !line.is_empty() {
                        tokens.push(String::from_utf8_lossy(line).into_owned());
                    }
                    start = end + 1;
                    search_from = start;
                }
                self.partial.drain(..start);
                tokens
            }
        }
    }

    /// Bytes still waiting for their newline.
    pub fn pending(&self) -> &[u8] {
        &self.partial
    }

    /// Fails once the unterminated fragment is longer than any token can be.
    pub fn check_pending(&self) -> Result<(), MalformedInput> {
        if self.partial.len() > MAX_PENDING_BYTES {
            return Err(MalformedInput::Overlong(self.partial.len()));
        }
        Ok(())
    }
}

/// Why a producer connection ended.
#[derive(Debug)]
pub enum ConnectionOutcome {
    /// The peer closed the stream.
    Closed,
    /// The peer sent something that is not a state name.
    Malformed(MalformedInput),
    /// Reading from the socket failed.
    Failed(io::Error),
}

/// Reads notifications from `stream` until it ends, queueing every parsed
/// state. The states from one read are queued with a single append.
pub async fn serve_connection<S>(
    stream: &mut S,
    sender: &NotificationSender,
    framing: Framing,
) -> ConnectionOutcome
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut tokenizer = Tokenizer::new(framing);

    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) => {
                if !tokenizer.pending().is_empty() {
                    debug!(
                        bytes = tokenizer.pending().len(),
                        "discarding unterminated token at end of stream"
                    );
                }
                return ConnectionOutcome::Closed;
            }
            Ok(n) => n,
            Err(e) => return ConnectionOutcome::Failed(e),
        };

        let mut parsed = Vec::new();
        let mut malformed: Option<MalformedInput> = None;
        for token in tokenizer.feed(&buf[..n]) {
            match DashcamState::parse(&token) {
                Ok(state) => parsed.push(state),
                Err(e) => {
                    malformed = Some(e.into());
                    break;
                }
            }
        }
        if malformed.is_none() {
            malformed = tokenizer.check_pending().err();
        }

        if !parsed.is_empty() {
            debug!(?parsed, "notifications received");
            sender.append(&parsed);
        }
        if let Some(e) = malformed {
            return ConnectionOutcome::Malformed(e);
        }
    }
}

/// The bound notification socket.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Binds the notification port. Failure here is fatal for the daemon.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind notification socket on {addr}"))?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr()
            .context("Failed to read notification socket address")
    }

    /// Accepts producers one after another, forever.
    pub async fn run(self, sender: NotificationSender, framing: Framing) {
        loop {
            info!("Listening for incoming connection...");
            let (mut stream, peer) = match self.inner.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "accept failed; retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            info!(%peer, "producer connected");

            match serve_connection(&mut stream, &sender, framing).await {
                ConnectionOutcome::Closed => warn!(%peer, "producer disconnected"),
                ConnectionOutcome::Malformed(e) => {
                    warn!(%peer, error = %e, "malformed notification; dropping connection")
                }
                ConnectionOutcome::Failed(e) => warn!(%peer, error = %e, "connection failed"),
            }

            sender.push(DashcamState::Dead);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    use crate::color::Color;
    use crate::dispatcher::Dispatcher;
    use crate::indicator::{Indicator, LineLevels, RecordingIndicator};
    use crate::queue::{self, NotificationReceiver};
    use crate::state::DashcamState::*;

    const WAIT: Duration = Duration::from_secs(5);

    /// Collects queued states until `count` have arrived.
    async fn collect(rx: &Arc<NotificationReceiver>, count: usize) -> Vec<DashcamState> {
        let rx = Arc::clone(rx);
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            while out.len() < count {
                out.extend(rx.drain_timeout(WAIT).expect("timed out waiting for notifications"));
            }
            out
        })
        .await
        .unwrap()
    }

    async fn assert_quiet(rx: &Arc<NotificationReceiver>) {
        let rx = Arc::clone(rx);
        let extra =
            tokio::task::spawn_blocking(move || rx.drain_timeout(Duration::from_millis(100)))
                .await
                .unwrap();
        assert_eq!(extra, None);
    }

    async fn start_listener() -> (SocketAddr, Arc<NotificationReceiver>) {
        let (tx, rx) = queue::channel();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(listener.run(tx, Framing::PerRead));
        (addr, Arc::new(rx))
    }

    // ── Tokenizer ─────────────────────────────────────────────────────────────

    #[test]
    fn per_read_splits_and_skips_empty_tokens() {
        let mut t = Tokenizer::new(Framing::PerRead);
        assert_eq!(t.feed(b"STARTING\nRECORDING\n"), vec!["STARTING", "RECORDING"]);
        assert!(t.feed(b"\n\n").is_empty());
        assert_eq!(t.feed(b"UPLOADING"), vec!["UPLOADING"]);
    }

    #[test]
    fn per_read_does_not_reassemble_fragments() {
        let mut t = Tokenizer::new(Framing::PerRead);
        assert_eq!(t.feed(b"RECOR"), vec!["RECOR"]);
        assert_eq!(t.feed(b"DING\n"), vec!["DING"]);
        assert!(t.pending().is_empty());
    }

    #[test]
    fn lines_reassembles_fragments() {
        let mut t = Tokenizer::new(Framing::Lines);
        assert!(t.feed(b"STARTING\nRECOR").len() == 1);
        assert_eq!(t.pending(), b"RECOR");
        assert_eq!(t.feed(b"DING\n\nCONVERTING\n"), vec!["RECORDING", "CONVERTING"]);
        assert!(t.pending().is_empty());
    }

    #[test]
    fn lines_reassembles_split_utf8() {
        let mut t = Tokenizer::new(Framing::Lines);
        let bytes = "é\n".as_bytes();
        assert!(t.feed(&bytes[..1]).is_empty());
        assert_eq!(t.feed(&bytes[1..]), vec!["é"]);
    }

    #[test]
    fn lines_resumes_after_many_small_reads() {
        let mut t = Tokenizer::new(Framing::Lines);
        for &b in b"FALLING_BEHIND" {
            assert!(t.feed(&[b]).is_empty());
        }
        assert_eq!(t.feed(b"\nUPLOAD"), vec!["FALLING_BEHIND"]);
        assert_eq!(t.pending(), b"UPLOAD");
        assert_eq!(t.feed(b"ING\n"), vec!["UPLOADING"]);
        assert!(t.check_pending().is_ok());
    }

    #[test]
    fn lines_rejects_fragment_longer_than_limit() {
        let mut t = Tokenizer::new(Framing::Lines);
        let chunk = [b'A'; READ_BUFFER_SIZE];
        assert!(t.feed(&chunk).is_empty());
        assert!(t.check_pending().is_ok());
        assert!(t.feed(&chunk).is_empty());
        assert_eq!(
            t.check_pending(),
            Err(MalformedInput::Overlong(2 * READ_BUFFER_SIZE))
        );
    }

    #[test]
    fn lines_limit_applies_to_pending_bytes_only() {
        // Many complete tokens in one long stream never trip the limit.
        let mut t = Tokenizer::new(Framing::Lines);
        for _ in 0..1_000 {
            assert_eq!(t.feed(b"RECORDING\nCONVERTING\n").len(), 2);
            assert!(t.check_pending().is_ok());
        }
    }

    // ── serve_connection ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn serve_connection_queues_tokens_then_reports_close() {
        let (tx, rx) = queue::channel();
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"STARTING\nRECORDING\n").await.unwrap();
        drop(client);

        let outcome = serve_connection(&mut server, &tx, Framing::PerRead).await;
        assert!(matches!(outcome, ConnectionOutcome::Closed));
        assert_eq!(rx.drain_timeout(WAIT), Some(vec![Starting, Recording]));
    }

    #[tokio::test]
    async fn serve_connection_keeps_states_before_malformed_token() {
        let (tx, rx) = queue::channel();
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"CONVERTING\nrecording\nUPLOADING\n").await.unwrap();

        let outcome = serve_connection(&mut server, &tx, Framing::PerRead).await;
        match outcome {
            ConnectionOutcome::Malformed(e) => assert_eq!(
                e,
                MalformedInput::UnknownState(ParseStateError("recording".into()))
            ),
            other => panic!("expected Malformed, got {other:?}"),
        }
        assert_eq!(rx.drain_timeout(WAIT), Some(vec![Converting]));
    }

    #[tokio::test]
    async fn serve_connection_drops_endless_line() {
        let (tx, rx) = queue::channel();
        let (mut client, mut server) = tokio::io::duplex(READ_BUFFER_SIZE);
        let writer = tokio::spawn(async move {
            // Far more than the limit, never a newline. The write stops once
            // the server hangs up.
            let chunk = [b'A'; READ_BUFFER_SIZE];
            for _ in 0..64 {
                if client.write_all(&chunk).await.is_err() {
                    break;
                }
            }
        });

        let outcome = serve_connection(&mut server, &tx, Framing::Lines).await;
        match outcome {
            ConnectionOutcome::Malformed(MalformedInput::Overlong(bytes)) => {
                assert!(bytes > MAX_PENDING_BYTES && bytes <= MAX_PENDING_BYTES + READ_BUFFER_SIZE)
            }
            other => panic!("expected Overlong, got {other:?}"),
        }
        drop(server);
        writer.await.unwrap();
        assert_eq!(rx.drain_timeout(Duration::from_millis(50)), None);
    }

    #[tokio::test]
    async fn serve_connection_keeps_tokens_before_endless_line() {
        let (tx, rx) = queue::channel();
        let (mut client, mut server) = tokio::io::duplex(4 * READ_BUFFER_SIZE);
        let mut payload = b"UPLOADING\n".to_vec();
        payload.extend(std::iter::repeat(b'A').take(2 * READ_BUFFER_SIZE));
        client.write_all(&payload).await.unwrap();

        let outcome = serve_connection(&mut server, &tx, Framing::Lines).await;
        assert!(matches!(
            outcome,
            ConnectionOutcome::Malformed(MalformedInput::Overlong(_))
        ));
        assert_eq!(rx.drain_timeout(WAIT), Some(vec![Uploading]));
    }

    // ── Listener ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bind_fails_when_port_is_taken() {
        let first = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = first.local_addr().unwrap();
        assert!(Listener::bind(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_is_queued_in_order() {
        let (addr, rx) = start_listener().await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"STARTING\nRECORDING\n").await.unwrap();
        assert_eq!(collect(&rx, 2).await, vec![Starting, Recording]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_token_yields_one_dead_and_listener_recovers() {
        let (addr, rx) = start_listener().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"BOGUS\n").await.unwrap();
        assert_eq!(collect(&rx, 1).await, vec![Dead]);
        assert_quiet(&rx).await;

        let mut next = TcpStream::connect(addr).await.unwrap();
        next.write_all(b"UPLOADING\n").await.unwrap();
        assert_eq!(collect(&rx, 1).await, vec![Uploading]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_yields_one_dead_and_listener_recovers() {
        let (addr, rx) = start_listener().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"RECORDING\n").await.unwrap();
        assert_eq!(collect(&rx, 1).await, vec![Recording]);
        drop(client);
        assert_eq!(collect(&rx, 1).await, vec![Dead]);
        assert_quiet(&rx).await;

        let mut next = TcpStream::connect(addr).await.unwrap();
        next.write_all(b"ERROR\n").await.unwrap();
        assert_eq!(collect(&rx, 1).await, vec![Error]);
    }

    // ── End to end ────────────────────────────────────────────────────────────

    async fn wait_for_color(indicator: &RecordingIndicator, color: Color) {
        let want = LineLevels::for_color(color);
        let deadline = tokio::time::Instant::now() + WAIT;
        while indicator.current() != Some(want) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "indicator never showed {color}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn producer_session_drives_indicator() {
        let (tx, rx) = queue::channel();
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let lights = RecordingIndicator::new();
        let mut driver = lights.clone();
        driver.set_color(Color::Red).unwrap();
        let dispatcher = Dispatcher::new(driver, rx);
        std::thread::spawn(move || dispatcher.run());
        tokio::spawn(listener.run(tx, Framing::PerRead));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"STARTING\nRECORDING\n").await.unwrap();
        wait_for_color(&lights, Color::Off).await;

        client.write_all(b"FALLING_BEHIND\n").await.unwrap();
        wait_for_color(&lights, Color::Yellow).await;

        drop(client);
        wait_for_color(&lights, Color::Red).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"RECORDING\n").await.unwrap();
        wait_for_color(&lights, Color::Off).await;
    }
}
