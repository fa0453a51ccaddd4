//! Codec for encoding/decoding RPC frames
//!
//! Frames are JSON values terminated by a newline, so the same byte stream can
//! be produced by any JSON encoder that writes one value per line.

use crate::messages::{RpcRequest, RpcResponse};
use crate::MAX_MESSAGE_SIZE;
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for CodecError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::MessageTooLarge(MAX_MESSAGE_SIZE),
            LinesCodecError::Io(e) => CodecError::Io(e),
        }
    }
}

/// Newline-delimited JSON codec decoding `D` and encoding `E`
pub struct JsonLinesCodec<D, E> {
    lines: LinesCodec,
    _marker: PhantomData<fn() -> (D, E)>,
}

/// Codec used by the side issuing calls
pub type ClientCodec = JsonLinesCodec<RpcResponse, RpcRequest>;

/// Codec used by the side serving calls
pub type ServerCodec = JsonLinesCodec<RpcRequest, RpcResponse>;

impl<D, E> JsonLinesCodec<D, E> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(MAX_MESSAGE_SIZE),
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for JsonLinesCodec<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: DeserializeOwned, E> Decoder for JsonLinesCodec<D, E> {
    type Item = D;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<D>, CodecError> {
        while let Some(line) = self.lines.decode(buf)? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<D>, CodecError> {
        while let Some(line) = self.lines.decode_eof(buf)? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}

impl<D, E: Serialize> Encoder<E> for JsonLinesCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(&item)?;

        if payload.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(payload.len() + 1);
        dst.extend_from_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RpcMethod;

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(RpcRequest::new(RpcMethod::ResetProfile, 1), &mut buf)
            .unwrap();

        assert_eq!(buf.last(), Some(&b'\n'));
        assert_eq!(buf.iter().filter(|b| **b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_incomplete() {
        let mut codec = ServerCodec::new();
        let mut buf = BytesMut::from(&br#"{"method":"Agent.GetProfile","par"#[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ams\":[],\"id\":9}\n");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.id, 9);
        assert_eq!(req.method, "Agent.GetProfile");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple_and_blank_lines() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"id\":1,\"result\":\"a\",\"error\":null}\n\n{\"id\":2,\"result\":null,\"error\":\"boom\"}\n"[..],
        );

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.error.as_deref(), Some("boom"));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_eof_without_trailing_newline() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::from(&b"{\"id\":4,\"result\":true}"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        let resp = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(resp.id, 4);
    }

    #[test]
    fn test_decode_garbage_is_error() {
        let mut codec = ClientCodec::new();
        let mut buf = BytesMut::from(&b"not json\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::SerializationError(_))
        ));
    }
}
