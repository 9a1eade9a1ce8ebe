//! Length-prefixed framing: a 4-byte big-endian length, then the body.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Read-side cap unless configured otherwise.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("connection closed mid-frame")]
    Closed,
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_exact(reader, &mut header).await?;

    let len = u32::from_be_bytes(header) as usize;
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    let mut body = vec![0u8; len];
    read_exact(reader, &mut body).await?;
    Ok(body)
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), FrameError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FrameError::Closed),
        Err(e) => Err(FrameError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_carry_their_length_big_endian() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"{\"x\":1}").await.unwrap();

        let mut header = [0u8; 4];
        server.read_exact(&mut header).await.unwrap();
        assert_eq!(header, [0, 0, 0, 7]);

        let mut body = vec![0u8; 7];
        server.read_exact(&mut body).await.unwrap();
        assert_eq!(body, b"{\"x\":1}");
    }

    #[tokio::test]
    async fn oversized_frames_are_refused_before_reading_the_body() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&1024u32.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { len: 1024, max: 16 }));
    }

    #[tokio::test]
    async fn a_truncated_frame_reports_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);

        assert!(matches!(
            read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await,
            Err(FrameError::Closed)
        ));
    }

    #[tokio::test]
    async fn empty_bodies_are_valid_frames() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_frame(&mut client, b"").await.unwrap();
        assert!(read_frame(&mut server, 8).await.unwrap().is_empty());
    }
}
