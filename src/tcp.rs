//! TCP bulk transfer
//!
//! The client writes the byte count it wants as a decimal line; the server
//! answers with exactly that many filler bytes and closes its side.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TransferError;
use crate::net;
use crate::protocol::{Protocol, TransferReport};
use crate::stats::TransferSession;

const BUFFER_SIZE: usize = 128 * 1024; // 128 KB
/// Longest size line accepted, newline included
const MAX_REQUEST_LINE: usize = 64;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side: fetch `file_size` bytes from `server` and time it.
///
/// The clock starts right after the request line is written. An early close
/// by the server produces a report with `complete == false`, not an error.
pub async fn download(
    server: SocketAddr,
    file_size: u64,
    connection_id: u32,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError> {
    let mut stream = net::connect_tcp(server, connect_timeout).await?;
    stream.set_nodelay(true)?;

    let mut session = TransferSession::new(Protocol::Tcp, connection_id, file_size);

    stream
        .write_all(format!("{}\n", file_size).as_bytes())
        .await?;
    session.start();

    tokio::select! {
        result = read_exact_count(&mut stream, &mut session) => result?,
        _ = cancel.cancelled() => {
            debug!("TCP #{} cancelled", connection_id);
        }
    }
    session.finish();

    if session.bytes_received < file_size {
        warn!(
            "TCP #{} short transfer: {} of {} bytes",
            connection_id, session.bytes_received, file_size
        );
    }

    Ok(session.into_report())
}

/// Read until `session.requested_bytes` arrived or the peer closed. Never
/// reads past the requested count.
async fn read_exact_count<R>(reader: &mut R, session: &mut TransferSession) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];

    while session.bytes_received < session.requested_bytes {
        let remaining = session.requested_bytes - session.bytes_received;
        let want = remaining.min(BUFFER_SIZE as u64) as usize;

        match reader.read(&mut buffer[..want]).await {
            Ok(0) => {
                debug!("TCP #{} EOF", session.connection_id);
                break;
            }
            Ok(n) => session.add_bytes(n as u64),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

/// Parse a size line such as `"500\n"`
pub fn parse_size_line(line: &str) -> Result<u64, TransferError> {
    let trimmed = line.trim();
    trimmed
        .parse::<u64>()
        .map_err(|e| TransferError::Parse(format!("{:?}: {}", trimmed, e)))
}

/// Read one newline-terminated line of at most [`MAX_REQUEST_LINE`] bytes
async fn read_request_line<R>(reader: &mut BufReader<R>) -> Result<String, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(MAX_REQUEST_LINE);
    let mut limited = reader.take(MAX_REQUEST_LINE as u64);
    limited.read_until(b'\n', &mut raw).await?;

    if raw.last() != Some(&b'\n') {
        return Err(TransferError::Parse(if raw.is_empty() {
            "connection closed before size line".to_string()
        } else if raw.len() >= MAX_REQUEST_LINE {
            format!("size line longer than {} bytes", MAX_REQUEST_LINE)
        } else {
            "size line not terminated".to_string()
        }));
    }

    String::from_utf8(raw).map_err(|_| TransferError::Parse("size line is not UTF-8".into()))
}

/// Write `count` filler bytes
pub async fn write_filler<W>(writer: &mut W, count: u64) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buffer = vec![0u8; BUFFER_SIZE];
    let mut remaining = count;

    while remaining > 0 {
        let len = remaining.min(BUFFER_SIZE as u64) as usize;
        writer.write_all(&buffer[..len]).await?;
        remaining -= len as u64;
    }

    writer.flush().await
}

/// Server side: answer one connection's size request. Returns bytes sent.
pub async fn serve_request(
    stream: TcpStream,
    cancel: CancellationToken,
) -> Result<u64, TransferError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let line = tokio::select! {
        line = read_request_line(&mut reader) => line?,
        _ = cancel.cancelled() => {
            debug!("TCP request read cancelled");
            return Ok(0);
        }
    };
    let file_size = parse_size_line(&line)?;
    debug!("Size request: {} bytes", file_size);

    tokio::select! {
        result = write_filler(&mut writer, file_size) => result?,
        _ = cancel.cancelled() => {
            debug!("TCP send cancelled");
            return Ok(0);
        }
    }

    writer.shutdown().await?;
    Ok(file_size)
}
