use std::io::{ErrorKind, Read};

use bytes::Bytes;

use super::error::{Result, SegmentError};
use super::types::{Segment, SegmentState};

pub const DEFAULT_SEGMENT_SIZE: usize = 768_000;

/// Splits byte streams into fixed-size, BLAKE3-hashed chunks.
#[derive(Debug, Clone, Copy)]
pub struct Segmenter {
    segment_size: usize,
}

impl Segmenter {
    pub fn new(segment_size: usize) -> Result<Self> {
        if segment_size == 0 {
            return Err(SegmentError::InvalidSegmentSize(
                "segment size must be > 0".into(),
            ));
        }
        Ok(Self { segment_size })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Number of segments a stream of `size` bytes produces. Never zero.
    pub fn segment_count(&self, size: u64) -> Result<u32> {
        let size_per = self.segment_size as u64;
        u32::try_from(size.div_ceil(size_per).max(1)).map_err(|_| {
            SegmentError::TooManySegments {
                size,
                segment_size: self.segment_size,
            }
        })
    }

    /// Lazily yields `(index, bytes, hash)` in order. The final chunk may be
    /// short; an empty reader yields a single zero-length chunk.
    pub fn segments<R: Read>(&self, reader: R) -> SegmentIter<R> {
        SegmentIter {
            reader,
            segment_size: self.segment_size,
            index: 0,
            done: false,
        }
    }

    /// Segments an in-memory buffer into full `Segment` values.
    pub fn segment_bytes(&self, file_id: &str, data: &Bytes) -> Result<Vec<Segment>> {
        let total = self.segment_count(data.len() as u64)?;
        if data.is_empty() {
            return Ok(vec![Self::build(file_id, 0, total, 0, Bytes::new())]);
        }

        Ok((0..total)
            .map(|i| {
                let start = i as usize * self.segment_size;
                let end = (start + self.segment_size).min(data.len());
                Self::build(file_id, i, total, start as u64, data.slice(start..end))
            })
            .collect())
    }

    fn build(file_id: &str, index: u32, total: u32, offset: u64, data: Bytes) -> Segment {
        Segment {
            file_id: file_id.to_string(),
            segment_index: index,
            total_segments: total,
            size: data.len(),
            content_hash: *blake3::hash(&data).as_bytes(),
            redundancy_index: 0,
            data_offset: offset,
            state: SegmentState::Pending,
            data,
        }
    }
}

pub struct SegmentIter<R> {
    reader: R,
    segment_size: usize,
    index: u32,
    done: bool,
}

impl<R: Read> SegmentIter<R> {
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for SegmentIter<R> {
    type Item = Result<(u32, Bytes, [u8; 32])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buf = vec![0u8; self.segment_size];
        let n = match self.fill(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e.into()));
            }
        };

        if n < self.segment_size {
            self.done = true;
        }
        if n == 0 && self.index > 0 {
            return None;
        }

        buf.truncate(n);
        let hash = *blake3::hash(&buf).as_bytes();
        let index = self.index;
        let Some(next) = self.index.checked_add(1) else {
            self.done = true;
            return Some(Err(SegmentError::TooManySegments {
                size: u64::from(index) * self.segment_size as u64 + n as u64,
                segment_size: self.segment_size,
            }));
        };
        self.index = next;
        Some(Ok((index, Bytes::from(buf), hash)))
    }
}
