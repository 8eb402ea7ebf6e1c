//! The framed JSON link peer sessions are built on: one JSON object per line,
//! grounded on `yuv_p2p::client::stream`'s incremental-decode-loop idiom but speaking
//! newline-delimited JSON instead of the Bitcoin wire format.
use bytes::BytesMut;
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Errors decoding/encoding frames on the wire.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer sent a line that wasn't valid JSON.
    #[error("malformed JSON frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),
    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A newline-delimited JSON codec: each [`Value`] is one line on the wire.
#[derive(Debug, Default)]
pub struct JsonLineCodec {
    next_line_start: usize,
}

impl Decoder for JsonLineCodec {
    type Item = Value;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, Error> {
        let newline_offset = src[self.next_line_start..]
            .iter()
            .position(|b| *b == b'\n');

        match newline_offset {
            Some(offset) => {
                let newline_index = self.next_line_start + offset;
                let line = src.split_to(newline_index + 1);
                let line = &line[..line.len() - 1];
                self.next_line_start = 0;

                if line.is_empty() {
                    return Ok(None);
                }
                let value = serde_json::from_slice(line)?;
                Ok(Some(value))
            }
            None => {
                self.next_line_start = src.len();
                Ok(None)
            }
        }
    }
}

impl Encoder<Value> for JsonLineCodec {
    type Error = Error;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), Error> {
        let mut bytes = serde_json::to_vec(&item)?;
        bytes.push(b'\n');
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}

/// Decode every complete frame currently buffered in `buf`, advancing it past what was
/// consumed. Used by the in-memory transport in tests, where there's no `AsyncRead`
/// to drive a real `FramedRead`.
pub fn decode_all(codec: &mut JsonLineCodec, buf: &mut BytesMut) -> Result<Vec<Value>, Error> {
    let mut frames = Vec::new();
    while let Some(value) = codec.decode(buf)? {
        frames.push(value);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encodes_and_decodes_a_single_frame() {
        let mut codec = JsonLineCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(json!({"id": 1, "method": "server.version"}), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded["id"], 1);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decodes_multiple_frames_arriving_together() {
        let mut codec = JsonLineCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(json!({"id": 1}), &mut buf).unwrap();
        codec.encode(json!({"id": 2}), &mut buf).unwrap();

        let frames = decode_all(&mut codec, &mut buf).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["id"], 1);
        assert_eq!(frames[1]["id"], 2);
    }

    #[test]
    fn holds_partial_frame_until_newline_arrives() {
        let mut codec = JsonLineCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"id\":1");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"}\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap()["id"], 1);
    }

    #[test]
    fn rejects_malformed_json() {
        let mut codec = JsonLineCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"not json\n");
        assert!(codec.decode(&mut buf).is_err());
    }
}
