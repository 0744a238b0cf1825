//! Control socket server.
//!
//! Owns the listening socket and every live client connection. Each accepted
//! connection gets its own task and its own bounded line accumulator; bytes
//! from one client never block another. Requests on a single connection are
//! dispatched in receipt order; nothing is ordered across connections and
//! responses go only to the originating connection.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::{MAX_BUFFER_LEN, MAX_LINE_LEN};
use crate::router::Router;

/// How long one write attempt may wait on a stalled client.
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Stalled-write attempts before the connection is dropped.
const WRITE_ATTEMPTS: u32 = 4;

/// Inbound byte accumulator for one client connection.
///
/// Bounded at twice the maximum accepted line length; when a client keeps
/// sending without a newline the oldest excess bytes are discarded so only
/// the most recent window is kept.
pub struct LineAccumulator {
    buf: Vec<u8>,
}

impl LineAccumulator {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly read bytes, enforcing the buffer bound.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_BUFFER_LEN {
            let excess = self.buf.len() - MAX_BUFFER_LEN;
            self.buf.drain(..excess);
        }
    }

    /// Extract the next complete line, truncated to the maximum accepted
    /// length. Call until `None` so every line in one read burst gets
    /// dispatched in the same cycle.
    pub fn next_line(&mut self) -> Option<String> {
        let newline = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
        line.pop(); // trailing '\n'
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line.truncate(MAX_LINE_LEN);
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

/// The listening side of the control channel.
pub struct ControlServer {
    socket_path: PathBuf,
    socket_mode: u32,
    router: Arc<Router>,
}

impl ControlServer {
    pub fn new(socket_path: PathBuf, socket_mode: u32, router: Arc<Router>) -> Self {
        Self {
            socket_path,
            socket_mode,
            router,
        }
    }

    /// Accept and serve connections until the shutdown flag flips.
    ///
    /// On return every connection task has been joined and the socket file
    /// has been unlinked.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).with_context(|| {
                format!("failed to remove stale socket {}", self.socket_path.display())
            })?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        std::fs::set_permissions(
            &self.socket_path,
            std::fs::Permissions::from_mode(self.socket_mode),
        )
        .with_context(|| format!("failed to chmod {}", self.socket_path.display()))?;

        info!(
            socket = %self.socket_path.display(),
            mode = format!("{:o}", self.socket_mode),
            "Control socket listening"
        );

        let mut connections: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            debug!("Client connected");
                            let router = self.router.clone();
                            let shutdown = shutdown.clone();
                            connections.spawn(async move {
                                handle_connection(stream, router, shutdown).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failure; keep serving.
                            warn!(error = %e, "Accept failed");
                        }
                    }
                }
                // Reap finished connection tasks so the set stays small.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Control socket shutting down");
        drop(listener);
        while connections.join_next().await.is_some() {}
        let _ = std::fs::remove_file(&self.socket_path);
        Ok(())
    }
}

/// Serve one client until EOF, error, back-pressure drop, or shutdown.
async fn handle_connection(
    mut stream: UnixStream,
    router: Arc<Router>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut accumulator = LineAccumulator::new();
    let mut read_buf = [0u8; 2048];

    loop {
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) => {
                        debug!("Client closed connection");
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!(error = %e, "Read failed, dropping connection");
                        return;
                    }
                };

                accumulator.push(&read_buf[..n]);
                while let Some(line) = accumulator.next_line() {
                    if let Some(response) = router.dispatch(&line).await {
                        if !write_response(&mut stream, response.as_bytes()).await {
                            warn!("Client not accepting responses, dropping connection");
                            return;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Write a response with a bounded retry budget for stalled clients.
///
/// A slow reader gets a few short write windows; a hard error or an
/// exhausted budget drops the connection without affecting other clients.
async fn write_response(stream: &mut UnixStream, data: &[u8]) -> bool {
    let mut written = 0;
    let mut stalls = 0;

    while written < data.len() {
        match tokio::time::timeout(WRITE_TIMEOUT, stream.write(&data[written..])).await {
            Ok(Ok(0)) => return false,
            Ok(Ok(n)) => {
                written += n;
                stalls = 0;
            }
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed");
                return false;
            }
            Err(_elapsed) => {
                stalls += 1;
                if stalls >= WRITE_ATTEMPTS {
                    return false;
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::StatusHub;
    use crate::router::Capability;
    use async_trait::async_trait;

    #[test]
    fn accumulator_extracts_lines_in_order() {
        let mut acc = LineAccumulator::new();
        acc.push(b"first\nsecond\nthird");
        assert_eq!(acc.next_line().as_deref(), Some("first"));
        assert_eq!(acc.next_line().as_deref(), Some("second"));
        assert_eq!(acc.next_line(), None);
        acc.push(b"\n");
        assert_eq!(acc.next_line().as_deref(), Some("third"));
    }

    #[test]
    fn accumulator_strips_carriage_return() {
        let mut acc = LineAccumulator::new();
        acc.push(b"line\r\n");
        assert_eq!(acc.next_line().as_deref(), Some("line"));
    }

    #[test]
    fn accumulator_never_exceeds_bound() {
        let mut acc = LineAccumulator::new();
        for _ in 0..100 {
            acc.push(&[b'x'; 1000]);
            assert!(acc.buffered() <= MAX_BUFFER_LEN);
        }
        // The newest bytes are the ones kept.
        acc.push(b"tail\n");
        let line = acc.next_line().unwrap();
        assert!(line.ends_with("tail") || line == "tail");
    }

    #[test]
    fn oversized_line_is_truncated() {
        let mut acc = LineAccumulator::new();
        let big = vec![b'a'; MAX_LINE_LEN + 500];
        acc.push(&big);
        acc.push(b"\n");
        let line = acc.next_line().unwrap();
        assert_eq!(line.len(), MAX_LINE_LEN);
    }

    struct Echo;

    #[async_trait]
    impl Capability for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn matches(&self, line: &str) -> bool {
            crate::protocol::is_request(line, "sysutil.echo.request")
        }

        async fn handle(&self, line: &str) -> String {
            let tag = crate::protocol::extract_string_field(line, "tag").unwrap_or_default();
            format!("{{\"type\":\"sysutil.echo.response\",\"tag\":\"{}\"}}\n", tag)
        }
    }

    async fn start_server(path: &std::path::Path) -> (tokio::task::JoinHandle<()>, watch::Sender<bool>) {
        let hub = Arc::new(StatusHub::new());
        let mut router = Router::new(hub);
        router.register(Arc::new(Echo));
        let server = ControlServer::new(path.to_path_buf(), 0o660, Arc::new(router));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            server.run(rx).await.unwrap();
        });
        // Wait for the socket file to appear.
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (handle, tx)
    }

    async fn request(stream: &mut UnixStream, tag: &str) -> String {
        let line = format!("{{\"type\":\"sysutil.echo.request\",\"tag\":\"{}\"}}\n", tag);
        stream.write_all(line.as_bytes()).await.unwrap();
        let mut buf = [0u8; 512];
        let n = stream.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn serves_multiple_clients_independently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysd.sock");
        let (handle, tx) = start_server(&path).await;

        let mut a = UnixStream::connect(&path).await.unwrap();
        let mut b = UnixStream::connect(&path).await.unwrap();
        let mut c = UnixStream::connect(&path).await.unwrap();

        assert!(request(&mut a, "a").await.contains("\"tag\":\"a\""));
        assert!(request(&mut b, "b").await.contains("\"tag\":\"b\""));

        // Closing one client must not disturb the others.
        drop(b);
        assert!(request(&mut a, "a2").await.contains("\"tag\":\"a2\""));
        assert!(request(&mut c, "c").await.contains("\"tag\":\"c\""));

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn several_lines_in_one_write_all_answered() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sysd.sock");
        let (handle, tx) = start_server(&path).await;

        let mut client = UnixStream::connect(&path).await.unwrap();
        let burst = "{\"type\":\"sysutil.echo.request\",\"tag\":\"1\"}\n\
                     {\"type\":\"sysutil.echo.request\",\"tag\":\"2\"}\n";
        client.write_all(burst.as_bytes()).await.unwrap();

        let mut collected = String::new();
        let mut buf = [0u8; 1024];
        while collected.matches('\n').count() < 2 {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            collected.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
        // In-order per connection.
        let first = collected.find("\"tag\":\"1\"").unwrap();
        let second = collected.find("\"tag\":\"2\"").unwrap();
        assert!(first < second);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
