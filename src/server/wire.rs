//! String framing for the gateway protocol.
//! Every value on the wire is a 4-byte big-endian length followed by that many
//! bytes of UTF-8. Commands and their fields are sent as consecutive frames.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; larger declared lengths are a protocol error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const CMD_AUTH: &str = "AUTH";
pub const CMD_QUERY: &str = "QUERY";
pub const CMD_EXIT: &str = "EXIT";

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Peer closed the stream cleanly before the first byte of a frame.
    #[error("connection closed by peer")]
    Closed,
    #[error("frame of {0} bytes exceeds limit of {MAX_FRAME_LEN} bytes")]
    TooLarge(usize),
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

async fn read_len<R: AsyncRead + Unpin>(reader: &mut R) -> Result<usize, FrameError> {
    let mut b = [0u8; 4];
    let mut filled = 0;
    while filled < b.len() {
        let n = reader.read(&mut b[filled..]).await?;
        if n == 0 {
            if filled == 0 { return Err(FrameError::Closed); }
            return Err(FrameError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    Ok(u32::from_be_bytes(b) as usize)
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, FrameError> {
    let len = read_len(reader).await?;
    if len > MAX_FRAME_LEN { return Err(FrameError::TooLarge(len)); }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| FrameError::InvalidUtf8)
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, value: &str) -> Result<(), FrameError> {
    write_frames(writer, &[value]).await
}

/// Write several frames back to back with a single flush.
pub async fn write_frames<W: AsyncWrite + Unpin>(writer: &mut W, values: &[&str]) -> Result<(), FrameError> {
    let mut payload = Vec::with_capacity(values.iter().map(|v| v.len() + 4).sum());
    for v in values {
        if v.len() > MAX_FRAME_LEN { return Err(FrameError::TooLarge(v.len())); }
        payload.extend_from_slice(&(v.len() as u32).to_be_bytes());
        payload.extend_from_slice(v.as_bytes());
    }
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}
