//! Chunk send path and the receive worker.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use p2pft_core::{chunk, encode_chunk_frame, ChunkReceiveResult, PieceTracker};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::NodeError;

/// One `fileRequest` being served. Owned by the send task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendJob {
    /// Id stamped on every frame; the requester's id for the file.
    pub file_id: u32,
    pub path: PathBuf,
    pub start: u32,
    pub count: u32,
}

/// Stream chunks `start..start+count` of `job.path` as frames. Returns the number of frames sent.
///
/// The range is clamped to the file (`start` 0 means the first chunk, `count` 0 means through
/// the last). The writer is locked per frame so other traffic can go out between frames.
pub async fn send_chunk_range<W>(
    writer: &Mutex<W>,
    job: &SendJob,
    chunk_size: usize,
    pacing: Duration,
) -> Result<u32, NodeError>
where
    W: AsyncWrite + Unpin,
{
    let chunk_size = chunk_size.max(1);
    let mut file = tokio::fs::File::open(&job.path).await?;
    let size = file.metadata().await?.len();
    let total = chunk::total_chunks(size, chunk_size);
    let mut buf = vec![0u8; chunk_size];
    let mut sent = 0;
    for index in chunk::clamp_range(job.start, job.count, total) {
        file.seek(SeekFrom::Start(chunk::chunk_offset(index, chunk_size)))
            .await?;
        let len = read_up_to(&mut file, &mut buf).await?;
        let frame = encode_chunk_frame(job.file_id, index, total, &buf[..len]);
        write_all_counted(&mut *writer.lock().await, &frame).await?;
        sent += 1;
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }
    debug!(file_id = job.file_id, path = %job.path.display(), sent, total, "chunk range streamed");
    Ok(sent)
}

/// Fill `buf` unless end of file comes first. Returns the bytes read.
async fn read_up_to<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Write every byte or fail with `IncompleteWrite`; a zero-length write is never retried.
pub async fn write_all_counted<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<(), NodeError> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]).await? {
            0 => {
                return Err(NodeError::IncompleteWrite {
                    written,
                    expected: bytes.len(),
                })
            }
            n => written += n,
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Receive worker body: verify and persist one frame. Failures are logged and the chunk is
/// left for the monitor to re-request.
pub fn receive_chunk(tracker: &PieceTracker, frame: &[u8]) -> Option<PathBuf> {
    match tracker.receive_frame(frame) {
        Ok(ChunkReceiveResult::Stored(path)) => Some(path),
        Ok(ChunkReceiveResult::IntegrityFailed(mismatch)) => {
            warn!(
                expected = %mismatch.expected,
                computed = %mismatch.computed,
                "checksum mismatch, chunk dropped"
            );
            None
        }
        Err(e) => {
            warn!(error = %e, "chunk not stored");
            None
        }
    }
}
