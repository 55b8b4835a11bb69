//! Reading and writing whole frames over async streams.

use crate::header::{decode_header, encode_header, Status, HEADER_LENGTH};
use bytes::{BufMut, Bytes, BytesMut};
use spine_types::{SpineError, SpineResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One header plus its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub status: Status,
    pub payload: Vec<u8>,
}

/// Encode a complete frame into a single buffer.
pub fn encode_frame(status: Status, payload: &[u8]) -> SpineResult<Bytes> {
    let header = encode_header(status, payload)?;
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    buf.put_slice(&header);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, status: Status, payload: &[u8]) -> SpineResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(status, payload)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, consuming exactly the declared payload length.
///
/// EOF before any header byte is [`SpineError::ConnectionClosed`]; EOF in
/// the middle of a payload is [`SpineError::CorruptPayload`].
pub async fn read_frame<R>(reader: &mut R, max_size: u32) -> SpineResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LENGTH];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SpineError::ConnectionClosed);
        }
        Err(e) => return Err(SpineError::Io(e)),
    }

    let header = decode_header(&header)?;
    if header.payload_length > max_size {
        return Err(SpineError::MessageTooLarge {
            size: header.payload_length.into(),
            max: max_size,
        });
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(SpineError::CorruptPayload(format!(
                "stream ended before {} payload bytes",
                header.payload_length
            )));
        }
        Err(e) => return Err(SpineError::Io(e)),
    }

    Ok(Frame {
        status: header.status,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, Status::Ok, b"hello").await.unwrap();
        write_frame(&mut client, Status::LayoutProbe, b"").await.unwrap();

        let first = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(first.status, Status::Ok);
        assert_eq!(first.payload, b"hello");

        let second = read_frame(&mut server, 1024).await.unwrap();
        assert_eq!(second.status, Status::LayoutProbe);
        assert!(second.payload.is_empty());
    }

    #[tokio::test]
    async fn test_header_split_across_reads() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0, 0, 0])
            .read(&[0, 4, b'p'])
            .read(b"ing")
            .build();
        let frame = read_frame(&mut reader, 1024).await.unwrap();
        assert_eq!(frame.status, Status::Ok);
        assert_eq!(frame.payload, b"ping");
    }

    #[tokio::test]
    async fn test_write_is_header_then_payload() {
        let mut writer = tokio_test::io::Builder::new()
            .write(&[254, 0, 0, 0, 2, b'n', b'o'])
            .build();
        write_frame(&mut writer, Status::CorruptPayload, b"no")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reads_exactly_declared_length() {
        let mut bytes = encode_frame(Status::Ok, b"abc").unwrap().to_vec();
        bytes.extend_from_slice(b"trailing");
        let mut reader = &bytes[..];

        let frame = read_frame(&mut reader, 1024).await.unwrap();
        assert_eq!(frame.payload, b"abc");
        assert_eq!(reader, b"trailing");
    }

    #[tokio::test]
    async fn test_clean_eof_is_connection_closed() {
        let mut reader: &[u8] = &[];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, SpineError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let bytes = [0u8, 0, 0, 0, 10, 1, 2, 3];
        let mut reader = &bytes[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, SpineError::CorruptPayload(_)));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let bytes = [0u8, 0, 1, 0, 0];
        let mut reader = &bytes[..];
        match read_frame(&mut reader, 1024).await {
            Err(SpineError::MessageTooLarge { size, max }) => {
                assert_eq!(size, 65536);
                assert_eq!(max, 1024);
            }
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }
}
