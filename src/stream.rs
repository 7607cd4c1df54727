//! Decoder for NovelAI's msgpack generation stream.
//!
//! The body is a sequence of frames, each a 4-byte big-endian length followed
//! by that many bytes of msgpack. Frames may be split across transport chunks
//! arbitrarily; the decoder buffers until a whole frame is available.

use bytes::{Buf, BytesMut};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::StreamEvent;

/// Largest frame we accept. Anything above means the stream is desynchronized.
pub const MAX_FRAME_LEN: u32 = 10_000_000;

const LENGTH_PREFIX: usize = 4;

/// Shape of one decoded frame. Unknown fields (sigma, gen_id, ...) are ignored.
#[derive(Debug, Deserialize)]
struct RawFrame {
    event_type: Option<String>,
    step_ix: Option<u32>,
    samp_ix: Option<u32>,
    image: Option<ByteBuf>,
    error: Option<Value>,
    message: Option<Value>,
}

impl RawFrame {
    fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .or(self.message.as_ref())
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
    }
}

/// Percentage for a step index, rounded and capped at 100.
pub fn progress_percent(step: u32, total_steps: u32) -> u8 {
    if total_steps == 0 {
        return 0;
    }
    ((step as f64 / total_steps as f64) * 100.0).round().min(100.0) as u8
}

/// Incremental frame decoder for one generation stream.
///
/// Feed chunks as they arrive and drain the returned iterator before feeding
/// the next one. After a terminal event or a protocol error the decoder is
/// finished and ignores further input.
///
/// # Example
/// ```
/// use novelai_rs::StreamDecoder;
///
/// let mut decoder = StreamDecoder::new(28);
/// // half a length prefix: nothing to yield yet
/// assert_eq!(decoder.feed(&[0, 0]).count(), 0);
/// assert!(decoder.finish().is_err());
/// ```
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: BytesMut,
    total_steps: u32,
    last_step: Option<u32>,
    last_surfaced: Option<u32>,
    finished: bool,
    terminal: bool,
}

impl StreamDecoder {
    pub fn new(total_steps: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            total_steps,
            last_step: None,
            last_surfaced: None,
            finished: false,
            terminal: false,
        }
    }

    /// Append a chunk and iterate over every event it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Frames<'_> {
        if !self.finished {
            self.buffer.extend_from_slice(chunk);
        }
        Frames { decoder: self }
    }

    /// Whether a terminal event or protocol error has been produced.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn progress(&self, step: u32) -> u8 {
        progress_percent(step, self.total_steps)
    }

    /// Call once the transport is exhausted. Errors with
    /// [`ProtocolError::IncompleteStream`] unless a final or error event was seen.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.terminal {
            Ok(())
        } else {
            Err(ProtocolError::IncompleteStream)
        }
    }

    fn next_event(&mut self) -> Option<Result<StreamEvent, ProtocolError>> {
        if self.finished || self.buffer.len() < LENGTH_PREFIX {
            return None;
        }

        let length = (&self.buffer[..LENGTH_PREFIX]).get_u32();
        if length == 0 || length > MAX_FRAME_LEN {
            self.finished = true;
            self.buffer.clear();
            return Some(Err(ProtocolError::MalformedFrame { length }));
        }

        if self.buffer.len() < LENGTH_PREFIX + length as usize {
            return None;
        }

        self.buffer.advance(LENGTH_PREFIX);
        let payload = self.buffer.split_to(length as usize);

        match rmp_serde::from_slice::<RawFrame>(&payload) {
            Ok(raw) => Some(Ok(self.interpret(raw))),
            Err(e) => {
                self.finished = true;
                self.buffer.clear();
                Some(Err(ProtocolError::Decode(e.to_string())))
            }
        }
    }

    fn interpret(&mut self, raw: RawFrame) -> StreamEvent {
        if let Some(message) = raw.error_message() {
            self.end();
            return StreamEvent::Error { message };
        }

        let step = raw
            .step_ix
            .or(raw.samp_ix)
            .map(|s| s.max(self.last_step.unwrap_or(0)));
        let image = raw.image.map(ByteBuf::into_vec);

        if raw.event_type.as_deref() == Some("final") {
            self.end();
            return StreamEvent::Final { step, image };
        }

        let step = step.unwrap_or_else(|| self.last_step.unwrap_or(0));
        self.last_step = Some(step);

        let fresh = self.last_surfaced.map_or(true, |last| step > last);
        let image = match image {
            Some(bytes) if fresh => {
                self.last_surfaced = Some(step);
                Some(bytes)
            }
            _ => None,
        };

        StreamEvent::Intermediate { step, image }
    }

    fn end(&mut self) {
        self.finished = true;
        self.terminal = true;
        self.buffer.clear();
    }
}

/// Events completed by the most recent [`StreamDecoder::feed`].
pub struct Frames<'a> {
    decoder: &'a mut StreamDecoder,
}

impl Iterator for Frames<'_> {
    type Item = Result<StreamEvent, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decoder.next_event()
    }
}
