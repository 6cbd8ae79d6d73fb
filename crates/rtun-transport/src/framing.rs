//! 4-byte length-prefix framing for transports that don't deliver message boundaries
//! natively (raw QUIC streams). WebSocket and gRPC already hand us one complete
//! message per read, so they don't use this.

use rtun_core::frame::MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub async fn write_framed<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds MAX_FRAME_LEN"));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed message, or `None` on a clean EOF before any bytes of the
/// next frame arrive.
pub async fn read_framed<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "peer announced an oversized frame"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_a_message() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"hello").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read = read_framed(&mut cursor).await.unwrap();
        assert_eq!(read.as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn clean_eof_before_a_frame_is_not_an_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert_eq!(read_framed(&mut cursor).await.unwrap(), None);
    }
}
