// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Length-prefixed message framing and typed message adapters.
//!
//! A gRPC message travels over HTTP/2 DATA frames as
//! `[compressed flag: u8][length: u32 big endian][payload]`. DATA frame
//! boundaries are unrelated to message boundaries, so the decoder buffers
//! until a whole message is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::Status;

/// Size of the prefix in front of every message.
pub const FRAME_HEADER_LEN: usize = 5;

/// Prefix a message with its frame header.
pub fn encode_frame(message: &[u8]) -> Result<Bytes, Status> {
    let len = u32::try_from(message.len()).map_err(|_| {
        Status::internal(format!(
            "message of {} bytes does not fit in a frame",
            message.len()
        ))
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + message.len());
    buf.put_u8(0);
    buf.put_u32(len);
    buf.put_slice(message);

    Ok(buf.freeze())
}

/// Incremental decoder turning arbitrary DATA chunks into whole messages.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_size,
        }
    }

    /// Feed a chunk and return every message it completes, in order.
    ///
    /// Bytes belonging to an incomplete message stay buffered for the next
    /// call. Any error is final: the call has to be failed with it.
    pub fn decode(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, Status> {
        self.buf.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while self.buf.len() >= FRAME_HEADER_LEN {
            let flag = self.buf[0];
            match flag {
                0 => {}
                1 => return Err(Status::internal("compressed messages are not supported")),
                other => return Err(Status::internal(format!("invalid frame flag {:#04x}", other))),
            }

            let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
            if len > self.max_message_size {
                return Err(Status::internal(format!(
                    "message of {} bytes exceeds the limit of {} bytes",
                    len, self.max_message_size
                )));
            }

            if self.buf.len() < FRAME_HEADER_LEN + len {
                // leave room for the rest of the message
                self.buf.reserve(FRAME_HEADER_LEN + len - self.buf.len());
                break;
            }

            self.buf.advance(FRAME_HEADER_LEN);
            messages.push(self.buf.split_to(len).freeze());
        }

        Ok(messages)
    }

    /// True while part of a message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Check that the stream did not end in the middle of a message.
    pub fn finish(&self) -> Result<(), Status> {
        if self.has_partial() {
            return Err(Status::internal(format!(
                "stream ended with {} bytes of an incomplete message",
                self.buf.len()
            )));
        }
        Ok(())
    }
}

/// Trait for encoding messages to bytes
pub trait Encoder {
    fn encode(&self) -> Result<Bytes, Status>;
}

/// Trait for decoding messages from bytes
pub trait Decoder: Sized {
    fn decode(buf: Bytes) -> Result<Self, Status>;
}

/// Types that can travel in both directions
pub trait Codec: Encoder + Decoder {}

impl<T: Encoder + Decoder> Codec for T {}

// opaque payloads pass through untouched

impl Encoder for Bytes {
    fn encode(&self) -> Result<Bytes, Status> {
        Ok(self.clone())
    }
}

impl Decoder for Bytes {
    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf)
    }
}

impl Encoder for Vec<u8> {
    fn encode(&self) -> Result<Bytes, Status> {
        Ok(Bytes::copy_from_slice(self))
    }
}

impl Decoder for Vec<u8> {
    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[test]
    fn test_encode_frame_layout() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..], &[0, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o']);

        let empty = encode_frame(b"").unwrap();
        assert_eq!(&empty[..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_decode_split_at_every_byte() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"").unwrap());
        wire.extend_from_slice(&encode_frame(b"third message").unwrap());

        let mut decoder = FrameDecoder::new(1024);
        let mut messages = Vec::new();
        for byte in &wire {
            messages.extend(decoder.decode(std::slice::from_ref(byte)).unwrap());
        }

        assert_eq!(
            messages,
            vec![
                Bytes::from_static(b"first"),
                Bytes::new(),
                Bytes::from_static(b"third message"),
            ]
        );
        assert!(!decoder.has_partial());
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decode_several_frames_in_one_chunk() {
        let mut wire = Vec::new();
        for i in 0..4 {
            wire.extend_from_slice(&encode_frame(format!("m{}", i).as_bytes()).unwrap());
        }
        // plus the header of a fifth message
        wire.extend_from_slice(&[0, 0, 0, 0, 2, b'x']);

        let mut decoder = FrameDecoder::new(1024);
        let messages = decoder.decode(&wire).unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3], Bytes::from_static(b"m3"));

        // no partial message is ever surfaced
        assert!(decoder.has_partial());
        let err = decoder.finish().unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let messages = decoder.decode(b"y").unwrap();
        assert_eq!(messages, vec![Bytes::from_static(b"xy")]);
    }

    #[test]
    fn test_decode_rejects_oversized_message() {
        let mut decoder = FrameDecoder::new(4);
        let err = decoder.decode(&encode_frame(b"too long").unwrap()).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        // the header alone is enough to reject it
        let mut decoder = FrameDecoder::new(4);
        assert!(decoder.decode(&[0, 0, 0, 1, 0]).is_err());
    }

    #[test]
    fn test_decode_rejects_compressed_and_bad_flags() {
        let mut decoder = FrameDecoder::new(1024);
        let err = decoder.decode(&[1, 0, 0, 0, 1, 0]).unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let mut decoder = FrameDecoder::new(1024);
        assert!(decoder.decode(&[7, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_passthrough_codecs() {
        let raw = Bytes::from_static(b"\x00\x01opaque");
        assert_eq!(raw.encode().unwrap(), raw);
        assert_eq!(<Vec<u8>>::decode(raw.clone()).unwrap(), raw.to_vec());
    }
}
