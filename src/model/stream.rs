//! Newline-delimited JSON decoding for streamed generations.

use std::collections::VecDeque;

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use super::{ChunkStream, InferenceError};

/// One fragment of a streamed generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub done: bool,
}

struct Decoder {
    bytes: BoxStream<'static, Result<Bytes, InferenceError>>,
    buffer: Vec<u8>,
    ready: VecDeque<StreamChunk>,
    finished: bool,
    cancel: CancellationToken,
    // Released when the stream is dropped.
    _permit: Option<OwnedSemaphorePermit>,
}

enum Step {
    Cancelled,
    Next(Option<Result<Bytes, InferenceError>>),
}

impl Decoder {
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.push_line(&line);
        }
    }

    fn drain_rest(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        self.push_line(&rest);
    }

    fn push_line(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<StreamChunk>(text) {
            Ok(chunk) => self.ready.push_back(chunk),
            Err(e) => debug!("Skipping malformed stream fragment: {}", e),
        }
    }
}

/// Turns a raw byte stream into a lazy, forward-only stream of chunks.
///
/// Lines may be split across byte chunks; they are reassembled before
/// decoding. Lines that are not valid JSON are dropped. The stream ends with
/// `Cancelled` if `cancel` fires first.
pub(crate) fn decode_ndjson(
    bytes: BoxStream<'static, Result<Bytes, InferenceError>>,
    cancel: CancellationToken,
    permit: Option<OwnedSemaphorePermit>,
) -> ChunkStream {
    let decoder = Decoder {
        bytes,
        buffer: Vec::new(),
        ready: VecDeque::new(),
        finished: false,
        cancel,
        _permit: permit,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(chunk) = decoder.ready.pop_front() {
                return Some((Ok(chunk), decoder));
            }
            if decoder.finished {
                return None;
            }

            let step = tokio::select! {
                biased;
                _ = decoder.cancel.cancelled() => Step::Cancelled,
                next = decoder.bytes.next() => Step::Next(next),
            };

            match step {
                Step::Cancelled => {
                    decoder.finished = true;
                    decoder.ready.clear();
                    return Some((Err(InferenceError::Cancelled), decoder));
                }
                Step::Next(Some(Ok(bytes))) => {
                    decoder.buffer.extend_from_slice(&bytes);
                    decoder.drain_lines();
                }
                Step::Next(Some(Err(e))) => {
                    decoder.finished = true;
                    return Some((Err(e), decoder));
                }
                Step::Next(None) => {
                    decoder.finished = true;
                    decoder.drain_rest();
                }
            }
        }
    })
    .boxed()
}
