use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{Metadata, Result, Shape, Status};

const MAGIC_NUM: u32 = u32::from_be_bytes(*b"RUA!");
pub(crate) const MAX_MSG_SIZE: usize = 64 << 20;

/// Frame flags of the TCP transport.
///
/// - `IsReq` / `IsRsp`: the frame travels caller to handler, or back.
/// - `UseMessagePack`: metadata and payloads use MessagePack instead of JSON.
/// - `Open`: first frame of a call, carrying method, shape and metadata.
/// - `End`: last frame of one direction, carrying its status.
/// - `Cancel`: the caller gave up on the call.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        const IsReq = 1;
        const IsRsp = 2;
        const UseMessagePack = 4;
        const Open = 8;
        const End = 16;
        const Cancel = 32;
    }
}

/// Routing and control information at the head of every frame.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    /// The fully qualified method name (e.g. "Greeter/say_hello"), only set
    /// on `Open` frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    pub flags: MsgFlags,
    /// Identifies the call on its connection.
    pub stream_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Shape>,
    /// Time left before the caller's deadline, in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_us: Option<u64>,
    /// Caller metadata on `Open` frames, handler metadata on the first
    /// response frame.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Outcome of the direction an `End` frame closes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl MsgMeta {
    /// # Examples
    ///
    /// ```rust
    /// # use greetrpc::{MsgMeta, MsgFlags};
    /// let meta = MsgMeta {
    ///     flags: MsgFlags::IsReq | MsgFlags::Open,
    ///     ..Default::default()
    /// };
    /// assert!(meta.is_req());
    /// assert!(meta.has(MsgFlags::Open));
    /// ```
    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn is_rsp(&self) -> bool {
        self.flags.contains(MsgFlags::IsRsp)
    }

    #[must_use]
    pub fn has(&self, flag: MsgFlags) -> bool {
        self.flags.contains(flag)
    }
}

/// One frame on a TCP connection.
///
/// On the wire a frame is laid out as:
///
/// ```text
/// | 4 bytes | 4 bytes   | 4 bytes  | N bytes  | M bytes |
/// | "RUA!"  | total_len | meta_len | metadata | payload |
/// ```
///
/// `total_len` counts everything after it. The metadata is JSON or
/// MessagePack, told apart by its first byte; the payload is an already
/// encoded message, or empty.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Bytes,
}

impl Message {
    pub fn new(meta: MsgMeta, payload: Bytes) -> Self {
        Self { meta, payload }
    }

    /// Serializes the frame, header included.
    ///
    /// # Errors
    ///
    /// Fails with `Internal` if the metadata cannot be serialized or the
    /// frame exceeds the size limit.
    pub fn encode(&self) -> Result<Bytes> {
        const S: usize = std::mem::size_of::<u32>();
        let mut buf = BytesMut::with_capacity(128 + self.payload.len());
        buf.put_u32(MAGIC_NUM);
        buf.put_u32(0);
        buf.put_u32(0);

        let mut writer = buf.writer();
        if self.meta.has(MsgFlags::UseMessagePack) {
            rmp_serde::encode::write_named(&mut writer, &self.meta)?;
        } else {
            serde_json::to_writer(&mut writer, &self.meta)
                .map_err(|e| Status::internal(e.to_string()))?;
        }
        let mut buf = writer.into_inner();
        let meta_len = u32::try_from(buf.len() - 3 * S)?;
        buf.extend_from_slice(&self.payload);

        if buf.len() >= MAX_MSG_SIZE {
            return Err(Status::internal(format!("msg is too long: {}", buf.len())));
        }
        let total_len = u32::try_from(buf.len() - 2 * S)?;
        buf[S..2 * S].copy_from_slice(&total_len.to_be_bytes());
        buf[2 * S..3 * S].copy_from_slice(&meta_len.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Splits one complete frame body off the front of `buffer`, leaving
    /// incomplete data in place.
    ///
    /// # Errors
    ///
    /// Fails with `Internal` on a bad magic number or an oversized frame.
    pub fn split_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
        const S: usize = std::mem::size_of::<u64>();
        let Some(header) = buffer.get(..S) else {
            return Ok(None);
        };
        let mut header = header;
        let header = header.get_u64();
        if (header >> 32) as u32 != MAGIC_NUM {
            return Err(Status::internal(format!("invalid header: {header:016X}")));
        }

        let len = usize::try_from(header & u64::from(u32::MAX))?;
        if S + len >= MAX_MSG_SIZE {
            return Err(Status::internal(format!("msg is too long: {len}")));
        }

        if buffer.len() < S + len {
            Ok(None)
        } else {
            buffer.advance(S);
            Ok(Some(buffer.split_to(len).freeze()))
        }
    }

    /// Parses a frame body produced by [`split_frame`](Self::split_frame).
    ///
    /// # Errors
    ///
    /// Fails with `Internal` if the lengths are inconsistent, and with
    /// `InvalidArgument` if the metadata does not deserialize.
    pub fn parse(mut body: Bytes) -> Result<Self> {
        const S: usize = std::mem::size_of::<u32>();
        let len = body.len();
        if len < S {
            return Err(Status::internal(format!("invalid msg length: {len}")));
        }
        let meta_len = body.get_u32() as usize;
        if meta_len == 0 || meta_len > body.len() {
            return Err(Status::internal(format!(
                "invalid meta length: {meta_len}, msg length: {len}"
            )));
        }

        let raw_meta = body.split_to(meta_len);
        let meta: MsgMeta = if raw_meta[0] == b'{' {
            serde_json::from_slice(&raw_meta)?
        } else {
            rmp_serde::from_slice(&raw_meta)?
        };
        Ok(Message {
            meta,
            payload: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    fn open_meta(flags: MsgFlags) -> MsgMeta {
        MsgMeta {
            method: "Greeter/say_hello".into(),
            flags: flags | MsgFlags::IsReq | MsgFlags::Open,
            stream_id: 7,
            shape: Some(Shape::Unary),
            timeout_us: Some(2_000_000),
            metadata: [("x-client", "test")].into_iter().collect(),
            status: None,
        }
    }

    #[test]
    fn test_frame() {
        for flags in [MsgFlags::empty(), MsgFlags::UseMessagePack] {
            let msg = Message::new(open_meta(flags), Bytes::from_static(b"{\"name\":\"Ada\"}"));
            let bytes = msg.encode().unwrap();

            // two frames back to back, the second one arriving in pieces.
            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(&bytes);
            buffer.extend_from_slice(&bytes[..10]);

            let body = Message::split_frame(&mut buffer).unwrap().unwrap();
            assert_eq!(Message::parse(body).unwrap(), msg);
            assert!(Message::split_frame(&mut buffer).unwrap().is_none());

            buffer.extend_from_slice(&bytes[10..]);
            let body = Message::split_frame(&mut buffer).unwrap().unwrap();
            assert_eq!(Message::parse(body).unwrap(), msg);
            assert!(buffer.is_empty());
        }
    }

    #[test]
    fn test_end_frame_carries_status() {
        let meta = MsgMeta {
            flags: MsgFlags::IsRsp | MsgFlags::End,
            stream_id: 3,
            status: Some(Status::invalid_argument("name must not be empty")),
            ..Default::default()
        };
        let bytes = Message::new(meta, Bytes::new()).encode().unwrap();
        let mut buffer = BytesMut::from(&bytes[..]);
        let msg = Message::parse(Message::split_frame(&mut buffer).unwrap().unwrap()).unwrap();
        let status = msg.meta.status.unwrap();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "name must not be empty");
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_bad_frames() {
        let mut buffer = BytesMut::from(&b"HTTP/1.1 200 OK\r\n"[..]);
        let err = Message::split_frame(&mut buffer).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let err = Message::parse(Bytes::from_static(&[0, 0])).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let err = Message::parse(Bytes::from_static(&[0, 0, 0, 0, b'{'])).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let err = Message::parse(Bytes::from_static(&[0, 0, 0, 9, b'{'])).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let err = Message::parse(Bytes::from_static(&[0, 0, 0, 2, b'{', b'x'])).unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
