//! tokio-util decoder for the device byte stream.
//!
//! Wraps the pure scanner from `dny-core`: a single connection interleaves
//! framed DNY messages, `"link"` keep-alives, and bare ICCIDs, with
//! pipelining. Unrecognized prefix bytes are discarded one at a time so a
//! garbage burst cannot desynchronize the stream.

use bytes::{Buf, BytesMut};
use dny_core::frame::{self, Frame, Scan};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::codec::Decoder;
use tracing::trace;

/// Frame decoder state shared with the session for statistics.
#[derive(Debug, Default)]
pub struct CodecStats {
    pub frames: AtomicU64,
    pub skipped_bytes: AtomicU64,
}

/// Streaming decoder producing [`Frame`]s.
pub struct DnyCodec {
    stats: Arc<CodecStats>,
}

impl DnyCodec {
    pub fn new() -> Self {
        DnyCodec {
            stats: Arc::new(CodecStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CodecStats> {
        self.stats.clone()
    }
}

impl Default for DnyCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for DnyCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        loop {
            match frame::scan(src) {
                Scan::Match { frame, consumed } => {
                    src.advance(consumed);
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(frame));
                }
                Scan::Skip => {
                    let byte = src[0];
                    src.advance(1);
                    self.stats.skipped_bytes.fetch_add(1, Ordering::Relaxed);
                    trace!(byte = format_args!("0x{byte:02X}"), "discarding unrecognized byte");
                }
                Scan::NeedMore => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        // A trailing partial frame at EOF is dropped, not an error.
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    self.stats
                        .skipped_bytes
                        .fetch_add(src.len() as u64, Ordering::Relaxed);
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}
