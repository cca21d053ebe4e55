//! RFC 5531 record marking for RPC over stream transports.
//!
//! Each message is sent as one or more fragments, each preceded by a
//! 4-byte header holding the fragment length in the low 31 bits and a
//! last-fragment flag in the high bit.
use crate::{
    result::{Error, Result},
    transport::Transport,
    xdr::Packer,
};
use bytes::{Bytes, BytesMut};
use std::borrow::BorrowMut;
use tokio::io::{AsyncRead, AsyncWrite};

pub const LAST_FRAGMENT: u32 = 0x80000000;

/// Largest fragment the 31-bit length field can describe
pub const MAX_FRAGMENT_SIZE: u32 = !LAST_FRAGMENT;

/// Constructs a new buffer with placeholder for the record mark
pub fn new_buf() -> BytesMut {
    let mut buf = BytesMut::new();
    buf.pack_uint(0); // placeholder for frag

    buf
}

/// Consumes `buf` created by [`new_buf`] and fills in the record mark,
/// making the whole message a single last fragment.
pub fn finalize(mut buf: BytesMut) -> Result<Bytes> {
    let frag_size = buf.len().saturating_sub(4);
    if frag_size == 0 || frag_size > MAX_FRAGMENT_SIZE as usize {
        return Err(Error::protocol(format!(
            "cannot frame a message of {} bytes",
            frag_size
        )));
    }

    {
        let borrow: &mut [u8] = buf.borrow_mut();
        (&mut borrow[0..4]).pack_uint(frag_size as u32 | LAST_FRAGMENT);
    }

    Ok(buf.freeze())
}

/// Sends a message built with [`new_buf`]
pub async fn write_record<S: AsyncWrite + Unpin>(
    transport: &mut Transport<S>,
    buf: BytesMut,
) -> Result<()> {
    let record = finalize(buf)?;
    transport.send(&record).await
}

/// Reads one message, potentially comprised of multiple fragments.
/// Allows at most `max_size` bytes in total.
pub async fn read_record<S: AsyncRead + Unpin>(
    transport: &mut Transport<S>,
    max_size: u32,
) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    let mut record_mark_buf: [u8; 4] = [0; 4];
    let mut read_last = false;
    let mut len: u32 = 0;
    while !read_last {
        transport.receive_exact(&mut record_mark_buf).await?;
        let record_mark = u32::from_be_bytes(record_mark_buf);
        read_last = (record_mark & LAST_FRAGMENT) != 0;

        let fragment_size = record_mark & !LAST_FRAGMENT;
        if fragment_size == 0 {
            return Err(Error::protocol("zero-length fragment"));
        }

        let total = len
            .checked_add(fragment_size)
            .filter(|total| *total <= max_size)
            .ok_or_else(|| {
                Error::protocol(format!(
                    "record of {} bytes exceeds max {}",
                    len as u64 + fragment_size as u64,
                    max_size
                ))
            })?;

        let start = buf.len();
        buf.resize(total as usize, 0);
        transport.receive_exact(&mut buf[start..]).await?;
        len = total;
    }

    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xdr::Unpacker;
    use tokio::io::{self, AsyncWriteExt};

    #[test]
    fn test_finalize_sets_last_fragment() {
        let mut buf = new_buf();
        buf.pack_uint(0xdeadbeef);
        let record = finalize(buf).unwrap();
        assert_eq!(
            record.as_ref(),
            &[0x80, 0, 0, 4, 0xde, 0xad, 0xbe, 0xef]
        );
    }

    #[test]
    fn test_finalize_rejects_empty_message() {
        assert!(matches!(finalize(new_buf()), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (a, b) = io::duplex(1024);
        let mut writer = Transport::from_stream(a, "w");
        let mut reader = Transport::from_stream(b, "r");

        let mut buf = new_buf();
        buf.pack_string("hello");
        write_record(&mut writer, buf).await.unwrap();

        let mut msg = read_record(&mut reader, 1024).await.unwrap();
        assert_eq!(msg.unpack_string().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_reassembles_fragments() {
        let (mut a, b) = io::duplex(1024);
        let mut reader = Transport::from_stream(b, "r");

        a.write_all(&[0, 0, 0, 3, b'a', b'b', b'c']).await.unwrap();
        a.write_all(&[0x80, 0, 0, 2, b'd', b'e']).await.unwrap();

        let msg = read_record(&mut reader, 1024).await.unwrap();
        assert_eq!(msg.as_ref(), b"abcde");
    }

    #[tokio::test]
    async fn test_partial_reads() {
        let (mut a, b) = io::duplex(1024);
        let mut reader = Transport::from_stream(b, "r");

        let writer = tokio::spawn(async move {
            for byte in [0x80, 0, 0, 4, 1, 2, 3, 4] {
                a.write_all(&[byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
            a
        });

        let msg = read_record(&mut reader, 1024).await.unwrap();
        assert_eq!(msg.as_ref(), &[1, 2, 3, 4]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_length_fragment() {
        let (mut a, b) = io::duplex(1024);
        let mut reader = Transport::from_stream(b, "r");

        a.write_all(&[0x80, 0, 0, 0]).await.unwrap();
        assert!(matches!(
            read_record(&mut reader, 1024).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_record() {
        let (mut a, b) = io::duplex(1024);
        let mut reader = Transport::from_stream(b, "r");

        a.write_all(&[0, 0, 0, 8, 0, 0, 0, 0, 0, 0, 0, 0]).await.unwrap();
        a.write_all(&[0x80, 0, 0, 8]).await.unwrap();
        let err = read_record(&mut reader, 12).await.unwrap_err();
        assert!(err.to_string().contains("exceeds max"), "{}", err);
    }

    #[tokio::test]
    async fn test_eof_mid_fragment() {
        let (mut a, b) = io::duplex(1024);
        let mut reader = Transport::from_stream(b, "r");

        a.write_all(&[0x80, 0, 0, 8, 1, 2]).await.unwrap();
        drop(a);
        match read_record(&mut reader, 1024).await {
            Err(Error::Io(err)) => assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected {:?}", other),
        }
    }
}
