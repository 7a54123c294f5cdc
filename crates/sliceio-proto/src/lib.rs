//! SliceIO Protocol - multi-frame messages exchanged between clients, the
//! broker and datanode channels.
//!
//! A message is an ordered list of opaque frames. The first frame of a
//! payload is a two-byte message type, the second a two-byte tag naming the
//! status, heartbeat or action it carries. Routers prepend an identity
//! envelope (`[identity][empty]`) so replies can find their way back.

pub mod codec;
pub mod message;

pub use codec::{MAX_FRAME_SIZE, MAX_FRAMES, encode, read_message, write_message};
pub use message::{Message, MsgType, Tag, action, actor, heartbeat, status};
