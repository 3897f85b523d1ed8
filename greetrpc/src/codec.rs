use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{MsgFlags, Result};

/// Serialization format of the messages of one call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    #[must_use]
    pub fn from_flags(flags: MsgFlags) -> Self {
        if flags.contains(MsgFlags::UseMessagePack) {
            Codec::MessagePack
        } else {
            Codec::Json
        }
    }

    #[must_use]
    pub fn flags(self) -> MsgFlags {
        match self {
            Codec::Json => MsgFlags::empty(),
            Codec::MessagePack => MsgFlags::UseMessagePack,
        }
    }

    /// # Errors
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        let mut writer = BytesMut::new().writer();
        match self {
            Codec::Json => serde_json::to_writer(&mut writer, value)?,
            Codec::MessagePack => rmp_serde::encode::write_named(&mut writer, value)?,
        }
        Ok(writer.into_inner().freeze())
    }

    /// # Errors
    ///
    /// Fails with `InvalidArgument` on a malformed payload.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        if bytes.is_empty() {
            // an empty payload is a null value, so unit requests need no body.
            return Ok(serde_json::from_value(serde_json::Value::Null)?);
        }
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
            Codec::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
