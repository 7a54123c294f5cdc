//! Multi-frame message model and protocol tags

use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;

/// Message type carried in the first payload frame (big-endian u16)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Unknown = 0x00FF,
    Status = 0x00FE,
    Data = 0x00FD,
    Heartbeat = 0x00FC,
    Action = 0x00FB,
}

impl MsgType {
    /// Decode a message-type frame; anything unrecognised is `Unknown`
    #[must_use]
    pub fn from_frame(frame: &[u8]) -> Self {
        if frame.len() != 2 {
            return Self::Unknown;
        }
        match u16::from_be_bytes([frame[0], frame[1]]) {
            0x00FE => Self::Status,
            0x00FD => Self::Data,
            0x00FC => Self::Heartbeat,
            0x00FB => Self::Action,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_frame(self) -> Bytes {
        Bytes::copy_from_slice(&(self as u16).to_be_bytes())
    }
}

/// Two-byte tag naming a status, heartbeat or action
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 2]);

impl Tag {
    #[must_use]
    pub fn to_frame(self) -> Bytes {
        Bytes::copy_from_slice(&self.0)
    }

    /// True when `frame` holds exactly this tag
    #[must_use]
    pub fn matches(self, frame: &[u8]) -> bool {
        frame == self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag({:02X}{:02X})", self.0[0], self.0[1])
    }
}

/// Heartbeat tags
pub mod heartbeat {
    use super::Tag;

    pub const WORKER: Tag = Tag([0x00, 0x0A]);
    pub const BROKER: Tag = Tag([0x00, 0x0B]);
    pub const CLIENT: Tag = Tag([0x00, 0x0C]);
}

/// Status tags
pub mod status {
    use super::Tag;

    pub const WORKER_READY: Tag = Tag([0x0A, 0x00]);
    pub const WORKER_ACK: Tag = Tag([0x0A, 0x01]);
    pub const WORKER_NOTFOUND: Tag = Tag([0x0A, 0x02]);
    pub const WORKER_PENDING: Tag = Tag([0x0A, 0xFE]);
    pub const WORKER_ERROR: Tag = Tag([0x0A, 0xFF]);

    pub const BROKER_READY: Tag = Tag([0x0B, 0x00]);
    pub const BROKER_ACK: Tag = Tag([0x0B, 0x01]);
    pub const BROKER_PENDING: Tag = Tag([0x0B, 0xFE]);
    pub const BROKER_ERROR: Tag = Tag([0x0B, 0xFF]);

    pub const CLIENT_READY: Tag = Tag([0x0C, 0x00]);
    pub const CLIENT_ACK: Tag = Tag([0x0C, 0x01]);
    pub const CLIENT_PENDING: Tag = Tag([0x0C, 0xFE]);
    pub const CLIENT_ERROR: Tag = Tag([0x0C, 0xFF]);
}

/// Actor lifecycle tags
pub mod actor {
    use super::Tag;

    pub const READY: Tag = Tag([0x01, 0x01]);
    pub const OVER: Tag = Tag([0x01, 0xFF]);
}

/// Action tags
pub mod action {
    use super::Tag;

    pub const PUT: Tag = Tag([0x02, 0x01]);
    pub const GET: Tag = Tag([0x02, 0x02]);
    pub const DEL: Tag = Tag([0x02, 0x03]);
}

/// An ordered list of frames
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: VecDeque<Bytes>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_frames(frames: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    fn typed(msgtype: MsgType, tag: Tag) -> Self {
        let mut msg = Self::new();
        msg.push_back(msgtype.to_frame());
        msg.push_back(tag.to_frame());
        msg
    }

    /// `[STATUS][tag]`
    #[must_use]
    pub fn status(tag: Tag) -> Self {
        Self::typed(MsgType::Status, tag)
    }

    /// `[HEARTBEAT][tag]`
    #[must_use]
    pub fn heartbeat(tag: Tag) -> Self {
        Self::typed(MsgType::Heartbeat, tag)
    }

    /// `[STATUS][WORKER_READY][datanode][bucket][channel]`, ids as big-endian u32
    #[must_use]
    pub fn worker_ready(datanode: u32, bucket: u32, channel: u32) -> Self {
        let mut msg = Self::status(status::WORKER_READY);
        for id in [datanode, bucket, channel] {
            msg.push_back(Bytes::copy_from_slice(&id.to_be_bytes()));
        }
        msg
    }

    /// `[ACTION][tag][key]` plus `[payload]` when given
    #[must_use]
    pub fn action(tag: Tag, key: impl Into<Bytes>, payload: Option<Bytes>) -> Self {
        let mut msg = Self::typed(MsgType::Action, tag);
        msg.push_back(key.into());
        if let Some(payload) = payload {
            msg.push_back(payload);
        }
        msg
    }

    /// `[DATA][key][payload]`
    #[must_use]
    pub fn key_data(key: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        let mut msg = Self::new();
        msg.push_back(MsgType::Data.to_frame());
        msg.push_back(key.into());
        msg.push_back(payload.into());
        msg
    }

    /// Empty reply carrying the same identity envelope as `self`
    #[must_use]
    pub fn sendback(&self) -> Self {
        let mut msg = Self::new();
        if let Some(identity) = self.frames.front() {
            msg.push_back(identity.clone());
            if self.frames.get(1).is_some_and(Bytes::is_empty) {
                msg.push_back(Bytes::new());
            }
        }
        msg
    }

    pub fn push_back(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_back(frame.into());
    }

    pub fn push_front(&mut self, frame: impl Into<Bytes>) {
        self.frames.push_front(frame.into());
    }

    pub fn pop_front(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    /// Append a status tag to a message (typically one built by [`Message::sendback`])
    pub fn add_status(&mut self, tag: Tag) {
        self.push_back(MsgType::Status.to_frame());
        self.push_back(tag.to_frame());
    }

    /// Prepend an identity envelope: `[identity][empty]`
    pub fn wrap(&mut self, identity: impl Into<Bytes>) {
        self.frames.push_front(Bytes::new());
        self.frames.push_front(identity.into());
    }

    /// Remove the identity envelope, returning the identity frame
    pub fn unwrap_identity(&mut self) -> Option<Bytes> {
        let identity = self.frames.pop_front()?;
        if self.frames.front().is_some_and(Bytes::is_empty) {
            self.frames.pop_front();
        }
        Some(identity)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.frames.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter()
    }

    /// Total payload bytes across all frames
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }

    /// Message type of an unwrapped payload
    #[must_use]
    pub fn msgtype(&self) -> MsgType {
        self.frames
            .front()
            .map_or(MsgType::Unknown, |f| MsgType::from_frame(f))
    }

    fn check(&self, msgtype: MsgType, tag: Tag) -> bool {
        self.msgtype() == msgtype && self.frames.get(1).is_some_and(|f| tag.matches(f))
    }

    #[must_use]
    pub fn is_status(&self, tag: Tag) -> bool {
        self.check(MsgType::Status, tag)
    }

    #[must_use]
    pub fn is_heartbeat(&self, tag: Tag) -> bool {
        self.check(MsgType::Heartbeat, tag)
    }

    #[must_use]
    pub fn is_action(&self, tag: Tag) -> bool {
        self.check(MsgType::Action, tag)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for frame in &self.frames {
            if frame.len() <= 16 {
                list.entry(&format_args!("{:02X?}", &frame[..]));
            } else {
                list.entry(&format_args!("<{} bytes>", frame.len()));
            }
        }
        list.finish()
    }
}
