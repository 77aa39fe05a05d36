//! TCP Server
//!
//! Newline-delimited JSON over TCP.
//!
//! # Limits
//! - **Connection limit**: excess connections are dropped on accept
//! - **Message limit**: lines over `MAX_MESSAGE_SIZE` get an error and the
//!   connection is closed
//! - **Write timeout**: a client that stops reading is disconnected
//!
//! Clients may stay silent indefinitely; there is no read timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use sh_core::constants::server::WRITE_TIMEOUT;
use sh_protocol::MAX_MESSAGE_SIZE;

use crate::broker::{error_frame, Broker};
use crate::registry::Frame;

/// Accept clients until `shutdown` flips to true
pub async fn run_server(
    listener: TcpListener,
    broker: Arc<Broker>,
    max_connections: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let active = Arc::new(AtomicUsize::new(0));
    let mut total: u64 = 0;

    match listener.local_addr() {
        Ok(addr) => info!("Listening on {}", addr),
        Err(e) => warn!("Listening on unknown address: {}", e),
    }
    info!("Limits: max_conn={}, max_msg={}", max_connections, MAX_MESSAGE_SIZE);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let current = active.load(Ordering::SeqCst);
                        if current >= max_connections {
                            warn!("Connection limit reached ({}), rejecting {}", current, addr);
                            drop(stream);
                            continue;
                        }

                        active.fetch_add(1, Ordering::SeqCst);
                        total += 1;
                        let broker = broker.clone();
                        let active = active.clone();
                        let shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            handle_client(stream, addr, broker, shutdown).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("Server stopped (handled {} total connections)", total);
}

/// Serve one connection: initial snapshot, then one reply batch per line
async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    broker: Arc<Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, "Could not set TCP_NODELAY: {}", e);
    }

    let (reader, writer) = stream.into_split();
    let (id, tx, rx) = broker.registry().register(addr).await;
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut request_count: u64 = 0;

    if let Some(frame) = broker.snapshot_frame() {
        let _ = tx.send(frame).await;
    }

    loop {
        let read_result = tokio::select! {
            r = read_line_bounded(&mut reader, &mut line, MAX_MESSAGE_SIZE) => r,
            _ = shutdown.changed() => break,
        };

        match read_result {
            Ok(0) => {
                debug!(client = id, requests = request_count, "Client closed connection");
                break;
            }
            Ok(n) => {
                request_count += 1;
                trace!(client = id, "Request #{}: {} bytes", request_count, n);

                let text = match std::str::from_utf8(&line) {
                    Ok(s) => s.trim(),
                    Err(e) => {
                        debug!(client = id, "Non-UTF8 request: {}", e);
                        if let Some(frame) = error_frame("Invalid request encoding") {
                            let _ = tx.send(frame).await;
                        }
                        break;
                    }
                };
                if text.is_empty() {
                    continue;
                }

                let mut closed = false;
                for frame in broker.handle_line(id, text).await {
                    if tx.send(frame).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
            Err(e) => {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    warn!(client = id, "Message too large (>{} bytes)", MAX_MESSAGE_SIZE);
                    if let Some(frame) = error_frame("Message too large") {
                        let _ = tx.send(frame).await;
                    }
                } else {
                    debug!(client = id, "Read error: {}", e);
                }
                break;
            }
        }
    }

    broker.registry().unregister(id).await;
    drop(tx);
    // Writer drains what is queued, then exits once every sender is gone
    let _ = writer_task.await;
}

/// Drain a client's queue onto its socket
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if send_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Send one line with timeout
async fn send_frame(writer: &mut OwnedWriteHalf, frame: &str) -> Result<(), ()> {
    let write_result = timeout(WRITE_TIMEOUT, async {
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok::<_, std::io::Error>(())
    })
    .await;

    match write_result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!("Write error: {}", e);
            Err(())
        }
        Err(_) => {
            warn!("Write timeout");
            Err(())
        }
    }
}

/// Read one `\n`-terminated line without buffering more than `max_len` bytes
pub async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<usize> {
    out.clear();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(out.len());
        }

        let mut take_len = available.len();
        let mut found_newline = false;
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            take_len = pos + 1;
            found_newline = true;
        }

        let remaining = max_len.saturating_sub(out.len());
        if take_len > remaining {
            let consume_len = remaining.min(available.len());
            reader.consume(consume_len);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "Message too large",
            ));
        }

        out.extend_from_slice(&available[..take_len]);
        reader.consume(take_len);

        if found_newline {
            return Ok(out.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_bounded_splits_lines() {
        let data: &[u8] = b"{\"a\":1}\n{\"b\":2}\n";
        let mut reader = BufReader::new(data);
        let mut line = Vec::new();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 64).await.unwrap(), 8);
        assert_eq!(line, b"{\"a\":1}\n");
        read_line_bounded(&mut reader, &mut line, 64).await.unwrap();
        assert_eq!(line, b"{\"b\":2}\n");
        assert_eq!(read_line_bounded(&mut reader, &mut line, 64).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_long_line() {
        let data = vec![b'x'; 100];
        let mut reader = BufReader::new(&data[..]);
        let mut line = Vec::new();
        let err = read_line_bounded(&mut reader, &mut line, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_unterminated_final_line_is_returned() {
        let data: &[u8] = b"{\"fan_speed\":5}";
        let mut reader = BufReader::new(data);
        let mut line = Vec::new();
        assert_eq!(read_line_bounded(&mut reader, &mut line, 64).await.unwrap(), 15);
    }
}
