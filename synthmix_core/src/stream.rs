//! Chunking of raw PCM byte streams produced by an external decoder.

use std::io::{ErrorKind, Read};

use log::{debug, trace, warn};

/// Reads fixed-size chunks from a raw PCM stream that is already in the
/// mixer's format. The final partial chunk is zero-padded.
///
/// `Ok(0)` from the reader is the only end of stream. A reader that returns
/// `WouldBlock` has no data ready yet: the chunk is handed out as far as it
/// got, padded with silence, and reading resumes on the next chunk. Bytes of
/// a frame cut off by `WouldBlock` are held back so frames stay aligned.
///
/// Any other read error ends the stream; it is logged rather than returned
/// so the chunks can feed the mixer directly.
pub struct PcmStreamChunks<R: Read> {
    reader: R,
    chunksize: usize,
    frame_size: usize,
    /// Leading bytes of a frame that was not complete when the reader blocked.
    carry: Vec<u8>,
    finished: bool,
}

enum Fill {
    Full,
    Blocked,
    Ended,
}

impl<R: Read> PcmStreamChunks<R> {
    pub fn new(reader: R, chunksize: usize) -> Self {
        Self {
            reader,
            chunksize,
            frame_size: 1,
            carry: Vec::new(),
            finished: chunksize == 0,
        }
    }

    /// Keeps chunks aligned to whole frames of `frame_size` bytes when the
    /// reader blocks mid-frame. Ignored unless it divides the chunk size.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        if frame_size > 0 && self.chunksize % frame_size == 0 {
            self.frame_size = frame_size;
        }
        self
    }

    fn fill(&mut self, chunk: &mut [u8], filled: &mut usize) -> Fill {
        while *filled < chunk.len() {
            match self.reader.read(&mut chunk[*filled..]) {
                Ok(0) => {
                    self.finished = true;
                    return Fill::Ended;
                }
                Ok(n) => *filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Fill::Blocked,
                Err(e) => {
                    warn!("pcm stream read failed, ending stream: {e}");
                    self.finished = true;
                    return Fill::Ended;
                }
            }
        }
        Fill::Full
    }
}

impl<R: Read> Iterator for PcmStreamChunks<R> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        if self.finished {
            return None;
        }
        let mut chunk = vec![0u8; self.chunksize];
        let mut filled = self.carry.len();
        chunk[..filled].copy_from_slice(&self.carry);
        self.carry.clear();
        match self.fill(&mut chunk, &mut filled) {
            Fill::Full => {}
            Fill::Blocked => {
                let whole = filled - filled % self.frame_size;
                self.carry.extend_from_slice(&chunk[whole..filled]);
                chunk[whole..filled].fill(0);
                trace!("pcm stream not ready, {whole} of {} bytes", self.chunksize);
            }
            Fill::Ended if filled == 0 => {
                debug!("pcm stream exhausted");
                return None;
            }
            Fill::Ended => {}
        }
        Some(chunk)
    }
}
