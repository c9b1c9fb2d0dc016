//! Wire codec for repair traffic.
//!
//! Transport is an external collaborator; this module only fixes the byte
//! format: a u32 big-endian length prefix followed by the postcard-encoded
//! [`Message`]. The resolve payload blob codec lives here as well.

use std::marker::PhantomData;

use anyhow::{ensure, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::{Message, PeerId};

/// Upper bound on a single frame.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Length-prefixed postcard framing for [`Message`]s.
#[derive(Debug)]
pub struct RepairCodec<PA>(PhantomData<PA>);

impl<PA> Default for RepairCodec<PA> {
    fn default() -> Self {
        RepairCodec(PhantomData)
    }
}

impl<PA: PeerId> Decoder for RepairCodec<PA> {
    type Item = Message<PA>;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("sliced to 4 bytes");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        ensure!(
            frame_len <= MAX_MESSAGE_SIZE,
            "received message that is too large: {frame_len}"
        );
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let message = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(message))
    }
}

impl<PA: PeerId> Encoder<Message<PA>> for RepairCodec<PA> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: Message<PA>, dst: &mut BytesMut) -> Result<()> {
        let body = postcard::to_stdvec(&item)?;
        ensure!(
            body.len() <= MAX_MESSAGE_SIZE,
            "attempting to send message that is too large: {}",
            body.len()
        );
        dst.reserve(4 + body.len());
        dst.put_u32(u32::try_from(body.len()).expect("bounded by MAX_MESSAGE_SIZE"));
        dst.put_slice(&body);
        Ok(())
    }
}

/// Encode a resolve value blob together with its version.
pub fn encode_blob<T: Serialize>(value: &T, version: u64) -> Result<Bytes> {
    Ok(postcard::to_stdvec(&(value, version))?.into())
}

/// Decode a resolve value blob, returning the value and its version.
pub fn decode_blob<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, u64)> {
    Ok(postcard::from_bytes(bytes)?)
}
