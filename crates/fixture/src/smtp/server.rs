//! Minimal SMTP listener
//!
//! Accepts mail for capture only. Every message is stored verbatim in
//! the [`SmtpStore`] for later inspection over HTTP; nothing is
//! relayed anywhere.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{CapturedMessage, SmtpStore};

/// A running SMTP capture server
pub struct SmtpServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SmtpServer {
    pub async fn start(addr: &str, store: Arc<SmtpStore>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!("smtp capture server listening on {}", addr);

        let (tx, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!("smtp accept failed: {}", e);
                                continue;
                            }
                        };
                        debug!("smtp connection from {}", peer);
                        let store = Arc::clone(&store);
                        tokio::spawn(async move {
                            if let Err(e) = handle_session(stream, store).await {
                                debug!("smtp session from {} ended: {}", peer, e);
                            }
                        });
                    }
                }
            }
        });

        Ok(Self {
            addr,
            shutdown: Some(tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SmtpServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Envelope {
    from: String,
    rcpt: Vec<String>,
}

impl Envelope {
    fn new() -> Self {
        Self {
            from: String::new(),
            rcpt: Vec::new(),
        }
    }
}

async fn handle_session(stream: TcpStream, store: Arc<SmtpStore>) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    write_half.write_all(b"220 apiprobe fixture SMTP\r\n").await?;

    let mut envelope = Envelope::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        let verb = trimmed
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();

        match verb.as_str() {
            "HELO" | "EHLO" => {
                write_half.write_all(b"250 apiprobe\r\n").await?;
            }
            "MAIL" => {
                envelope.from = extract_address(trimmed);
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "RCPT" => {
                envelope.rcpt.push(extract_address(trimmed));
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "DATA" => {
                write_half
                    .write_all(b"354 End data with <CR><LF>.<CR><LF>\r\n")
                    .await?;
                let raw = read_data(&mut reader, &mut line).await?;
                store.push(CapturedMessage {
                    from: std::mem::take(&mut envelope.from),
                    rcpt: std::mem::take(&mut envelope.rcpt),
                    received_at: chrono::Utc::now(),
                    raw,
                });
                write_half.write_all(b"250 OK message captured\r\n").await?;
            }
            "RSET" => {
                envelope = Envelope::new();
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "NOOP" => {
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "QUIT" => {
                write_half.write_all(b"221 Bye\r\n").await?;
                return Ok(());
            }
            _ => {
                write_half
                    .write_all(b"502 Command not implemented\r\n")
                    .await?;
            }
        }
    }
}

/// Read the DATA payload up to the lone-dot terminator, undoing
/// dot-stuffing.
async fn read_data<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    line: &mut String,
) -> std::io::Result<Vec<u8>> {
    let mut raw = Vec::new();
    loop {
        line.clear();
        if reader.read_line(line).await? == 0 {
            return Ok(raw);
        }
        let body_line = line.trim_end_matches(['\r', '\n']);
        if body_line == "." {
            return Ok(raw);
        }
        let unstuffed = if body_line.starts_with("..") {
            &body_line[1..]
        } else {
            body_line
        };
        raw.extend_from_slice(unstuffed.as_bytes());
        raw.extend_from_slice(b"\r\n");
    }
}

/// Pull the `<addr>` part out of `MAIL FROM:<addr>` / `RCPT TO:<addr>`.
fn extract_address(line: &str) -> String {
    match (line.find('<'), line.rfind('>')) {
        (Some(open), Some(close)) if close > open => line[open + 1..close].to_string(),
        _ => line
            .split_once(':')
            .map(|(_, rest)| rest.trim().to_string())
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_extract_address() {
        assert_eq!(extract_address("MAIL FROM:<a@b.test>"), "a@b.test");
        assert_eq!(extract_address("RCPT TO: c@d.test"), "c@d.test");
    }

    #[tokio::test]
    async fn test_full_session_captures_message() {
        let store = Arc::new(SmtpStore::new());
        let mut server = SmtpServer::start("127.0.0.1:0", Arc::clone(&store))
            .await
            .unwrap();

        let mut client = TcpStream::connect(server.addr()).await.unwrap();
        let mut banner = [0u8; 3];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"220");

        let script = b"HELO test\r\nMAIL FROM:<from@test>\r\nRCPT TO:<to@test>\r\nDATA\r\nSubject: hi\r\n\r\n..leading dot\r\n.\r\nQUIT\r\n";
        client.write_all(script).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        let msg = store.get(0).expect("message captured");
        assert_eq!(msg.from, "from@test");
        assert_eq!(msg.rcpt, vec!["to@test"]);
        let raw = String::from_utf8(msg.raw.clone()).unwrap();
        assert!(raw.contains("Subject: hi"));
        assert!(raw.contains("\r\n.leading dot"));

        server.shutdown().await;
    }
}
