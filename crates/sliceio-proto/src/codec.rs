//! Length-prefixed framing for [`Message`]
//!
//! Wire format (all integers big-endian):
//! ```text
//! +-------------+----------+---------+----------+---------+-----
//! | frame count | length 0 | frame 0 | length 1 | frame 1 | ...
//! | 4B          | 4B       | var     | 4B       | var     |
//! +-------------+----------+---------+----------+---------+-----
//! ```

use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use sliceio_common::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Most frames accepted in one message
pub const MAX_FRAMES: usize = 64;

/// Serialize a message into one contiguous buffer
#[must_use]
pub fn encode(msg: &Message) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + msg.len() * 4 + msg.byte_len());
    buf.put_u32(msg.len() as u32);
    for frame in msg.frames() {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf
}

/// Write one message and flush it
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if msg.len() > MAX_FRAMES {
        return Err(Error::protocol(format!(
            "message has {} frames (max {MAX_FRAMES})",
            msg.len()
        )));
    }
    if let Some(size) = msg.frames().map(Bytes::len).find(|&len| len > MAX_FRAME_SIZE) {
        return Err(Error::FrameTooLarge {
            size,
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&encode(msg)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly on a
/// message boundary; EOF anywhere else is an error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let count = match reader.read_u32().await {
        Ok(count) => count as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if count > MAX_FRAMES {
        return Err(Error::protocol(format!(
            "message announces {count} frames (max {MAX_FRAMES})"
        )));
    }

    let mut msg = Message::new();
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let mut frame = BytesMut::zeroed(len);
        reader.read_exact(&mut frame).await?;
        msg.push_back(frame.freeze());
    }
    Ok(Some(msg))
}
