//! File content framing: exactly `size` bytes, copied chunk by chunk with progress updates.

use crate::protocol::{CHUNK_SIZE, Error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

fn chunk_buffer(size: u64) -> Vec<u8> {
    let len = usize::try_from(size).unwrap_or(CHUNK_SIZE).clamp(1, CHUNK_SIZE);
    vec![0; len]
}

/// Copies exactly `size` bytes from a local `source` into the channel.
///
/// A source that ends early (file shrank after it was announced) fails with
/// [`Error::ShortContent`]; the peer is left waiting for the rest and the caller tears the channel
/// down.
pub async fn send_content<R, W>(
    source: &mut R,
    channel: &mut W,
    size: u64,
    name: &str,
    progress: &dyn common::progress::ProgressSink,
) -> Result<u64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = chunk_buffer(size);
    let mut copied = 0u64;
    while copied < size {
        let want = (size - copied).min(buffer.len() as u64) as usize;
        let count = source
            .read(&mut buffer[..want])
            .await
            .map_err(|source| Error::Local {
                name: name.to_string(),
                source,
            })?;
        if count == 0 {
            return Err(Error::ShortContent {
                name: name.to_string(),
                expected: size,
                actual: copied,
            });
        }
        channel
            .write_all(&buffer[..count])
            .await
            .map_err(Error::Channel)?;
        copied += count as u64;
        progress.advance(name, count as u64);
    }
    channel.flush().await.map_err(Error::Channel)?;
    Ok(copied)
}

/// Copies exactly `size` bytes from the channel into a local `destination`.
///
/// Never reads past `size`, so the channel stays positioned at the following status byte. A
/// channel that ends early fails with [`Error::ShortContent`].
pub async fn recv_content<R, W>(
    channel: &mut R,
    destination: &mut W,
    size: u64,
    name: &str,
    progress: &dyn common::progress::ProgressSink,
) -> Result<u64, Error>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let local_error = |source| Error::Local {
        name: name.to_string(),
        source,
    };
    let mut buffer = chunk_buffer(size);
    let mut copied = 0u64;
    while copied < size {
        let want = (size - copied).min(buffer.len() as u64) as usize;
        let count = channel
            .read(&mut buffer[..want])
            .await
            .map_err(Error::Channel)?;
        if count == 0 {
            return Err(Error::ShortContent {
                name: name.to_string(),
                expected: size,
                actual: copied,
            });
        }
        destination
            .write_all(&buffer[..count])
            .await
            .map_err(local_error)?;
        copied += count as u64;
        progress.advance(name, count as u64);
    }
    destination.flush().await.map_err(local_error)?;
    Ok(copied)
}
