//! Stream framing for the file transfer channels.
//!
//! Request frames are whole-stream JSON (read to EOF); decline and
//! metadata frames are single newline-terminated JSON lines; file bytes
//! follow the metadata line raw, in fixed-size chunks, ended by stream
//! close. The metadata's `file_size` is the only truncation guard.

use std::path::{Path, PathBuf};

use futures::io::BufReader;
use futures::prelude::*;
use orcanet_core::{DeclineFrame, FileMetadata, OrcanetError, Result, TransferRequest};
use tracing::debug;

/// Chunk size for file bytes on the wire and for disk writes.
pub const CHUNK_SIZE: usize = 4096;

/// Cap on a single newline-terminated frame.
const MAX_FRAME: usize = 8192;

/// Cap on a serialized request read to EOF.
const MAX_REQUEST: usize = 64 * 1024;

/// Write a download request and flush. The caller closes the stream —
/// the request channel is half-duplex.
pub async fn write_transfer_request<W: AsyncWrite + Unpin>(
    io: &mut W,
    request: &TransferRequest,
) -> Result<()> {
    let payload =
        serde_json::to_vec(request).map_err(|e| OrcanetError::Protocol(e.to_string()))?;
    io.write_all(&payload)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    io.flush()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    Ok(())
}

/// Read a download request: everything until the peer closes its write side.
pub async fn read_transfer_request<R: AsyncRead + Unpin>(io: &mut R) -> Result<TransferRequest> {
    let mut payload = Vec::new();
    io.take(MAX_REQUEST as u64 + 1)
        .read_to_end(&mut payload)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    if payload.len() > MAX_REQUEST {
        return Err(OrcanetError::Protocol("request frame too large".into()));
    }
    serde_json::from_slice(&payload)
        .map_err(|e| OrcanetError::Protocol(format!("malformed transfer request: {e}")))
}

/// Write one decline frame, newline-terminated, and flush.
pub async fn write_decline<W: AsyncWrite + Unpin>(io: &mut W, frame: &DeclineFrame) -> Result<()> {
    write_json_line(io, frame).await
}

/// Read one newline-terminated decline frame.
pub async fn read_decline<R: AsyncRead + Unpin>(io: &mut R) -> Result<DeclineFrame> {
    read_json_line(io).await
}

/// Stream a file: metadata line first, then the bytes in `CHUNK_SIZE`
/// chunks until the source is exhausted. The caller closes the stream to
/// signal end-of-transfer.
pub async fn send_file<W, R>(io: &mut W, metadata: &FileMetadata, source: &mut R) -> Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    let mut line =
        serde_json::to_vec(metadata).map_err(|e| OrcanetError::Protocol(e.to_string()))?;
    line.push(b'\n');
    io.write_all(&line)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;

    let mut buffer = [0u8; CHUNK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        io.write_all(&buffer[..n])
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        sent += n as u64;
    }
    io.flush()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    debug!(file = %metadata.file_name, bytes = sent, "file sent");
    Ok(sent)
}

/// Receive a file into `dest_dir`: read the metadata line, create (or
/// truncate) the destination file, then copy chunks until the stream
/// closes. A short stream (fewer bytes than `file_size` announced) fails
/// the transfer and leaves the partial file on disk.
pub async fn receive_file<R: AsyncRead + Unpin>(
    io: &mut R,
    dest_dir: &Path,
) -> Result<(FileMetadata, PathBuf, u64)> {
    let mut reader = BufReader::new(io);
    let line = read_frame_line(&mut reader).await?;
    let metadata: FileMetadata = serde_json::from_slice(&line)
        .map_err(|e| OrcanetError::Protocol(format!("malformed file metadata: {e}")))?;

    // The sender controls file_name; keep only the terminal component so a
    // hostile name cannot escape the download directory.
    let file_name = Path::new(&metadata.file_name)
        .file_name()
        .ok_or_else(|| OrcanetError::Protocol("empty file name".into()))?;
    tokio::fs::create_dir_all(dest_dir).await?;
    let dest_path = dest_dir.join(file_name);
    let mut file = tokio::fs::File::create(&dest_path).await?;

    use tokio::io::AsyncWriteExt;
    let mut buffer = [0u8; CHUNK_SIZE];
    let mut received = 0u64;
    loop {
        let n = reader
            .read(&mut buffer)
            .await
            .map_err(|e| OrcanetError::Transport(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buffer[..n]).await?;
        received += n as u64;
    }
    file.flush().await?;

    if metadata.file_size > 0 && received != metadata.file_size {
        return Err(OrcanetError::Transport(format!(
            "stream closed after {} of {} bytes for {}",
            received, metadata.file_size, metadata.file_name
        )));
    }
    debug!(file = %metadata.file_name, bytes = received, dest = %dest_path.display(), "file received");
    Ok((metadata, dest_path, received))
}

/// Write any serializable value as one newline-terminated JSON frame.
/// Shared by the decline, refresh and peer-exchange channels.
pub async fn write_json_line<W, T>(io: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut payload =
        serde_json::to_vec(value).map_err(|e| OrcanetError::Protocol(e.to_string()))?;
    payload.push(b'\n');
    io.write_all(&payload)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    io.flush()
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    Ok(())
}

/// Read one newline-terminated JSON frame into `T`.
pub async fn read_json_line<R, T>(io: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut reader = BufReader::new(io);
    let line = read_frame_line(&mut reader).await?;
    serde_json::from_slice(&line)
        .map_err(|e| OrcanetError::Protocol(format!("malformed frame: {e}")))
}

/// Read one newline-terminated frame, capped at `MAX_FRAME` bytes.
/// EOF before the newline is a protocol error.
async fn read_frame_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::new();
    let n = reader
        .take(MAX_FRAME as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| OrcanetError::Transport(e.to_string()))?;
    if n == 0 || line.last() != Some(&b'\n') {
        if line.len() > MAX_FRAME {
            return Err(OrcanetError::Protocol("frame too large".into()));
        }
        return Err(OrcanetError::Protocol("stream closed before frame end".into()));
    }
    line.pop();
    Ok(line)
}
