//! Segment loader - streams image regions to the device.
//!
//! Each region is selected, sent in frame-sized chunks, flushed and then
//! checked with a CRC-16 over its whole content. A SHA-256 over every chunk
//! sent is returned so callers can compare it against a signed manifest.

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::channel::padded_len;
use crate::crc::crc16;
use crate::error::LoaderError;
use crate::events::{LoaderEvent, LoaderObserver};
use crate::image::ImageProvider;
use crate::protocol::constants::{
    LOAD_SEGMENT_CHUNK_HEADER_LENGTH, MAX_APDU_DATA, MAX_SEGMENT_SIZE, MIN_PADDING_LENGTH,
};
use crate::session::LoaderSession;

/// Chunk bytes that fit in one `loadSegmentChunk` frame of `max_frame` bytes.
pub fn chunk_capacity(max_frame: usize, secure: bool) -> Result<usize, LoaderError> {
    let overhead = LOAD_SEGMENT_CHUNK_HEADER_LENGTH + MIN_PADDING_LENGTH;
    if max_frame <= overhead {
        return Err(LoaderError::InvalidFrameSize {
            max_frame,
            reason: "no room for chunk data",
        });
    }
    if max_frame > MAX_APDU_DATA {
        return Err(LoaderError::InvalidFrameSize {
            max_frame,
            reason: "exceeds the 255-byte APDU payload",
        });
    }
    let capacity = max_frame - overhead;
    // Opcode, offset and chunk, padded to the block size.
    if secure && padded_len(1 + 2 + capacity) > MAX_APDU_DATA {
        return Err(LoaderError::InvalidFrameSize {
            max_frame,
            reason: "padded secure frame exceeds 255 bytes",
        });
    }
    Ok(capacity)
}

/// Iterator over a region's chunks, yielding each chunk with its offset.
pub struct SegmentChunks<'a> {
    data: &'a [u8],
    chunk_size: usize,
    offset: usize,
}

impl<'a> SegmentChunks<'a> {
    pub fn new(data: &'a [u8], chunk_size: usize) -> Self {
        Self {
            data,
            chunk_size: chunk_size.max(1),
            offset: 0,
        }
    }

    /// Number of chunks, counting a trailing partial one.
    pub fn total(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }
}

impl<'a> Iterator for SegmentChunks<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let start = self.offset;
        let end = (start + self.chunk_size).min(self.data.len());
        self.offset = end;
        Some((start, &self.data[start..end]))
    }
}

impl<O: LoaderObserver> LoaderSession<O> {
    /// Transfer every region of `image` and return the lowercase hex SHA-256
    /// of the bytes sent.
    ///
    /// Regions are sent in provider order. Empty regions are selected but
    /// carry no chunks and no CRC. A region larger than one segment aborts the
    /// load after it has been selected.
    #[instrument(skip_all, fields(regions = image.regions().len(), relative = self.relative))]
    pub fn load<I: ImageProvider + ?Sized>(&mut self, image: &I) -> Result<String, LoaderError> {
        let capacity = chunk_capacity(self.max_frame, self.channel.is_enabled())?;
        let origin = self.origin(image);
        let mut hasher = Sha256::new();
        let mut bytes = 0u64;

        info!(
            origin = %format!("0x{:08X}", origin),
            capacity,
            "Starting image load"
        );

        for (index, region) in image.regions().iter().enumerate() {
            let address = region
                .start
                .checked_sub(origin)
                .ok_or(LoaderError::BelowOrigin {
                    start: region.start,
                    origin,
                })?;

            self.select_segment(address)?;
            self.emit(LoaderEvent::SegmentSelected {
                index,
                address,
                len: region.len(),
            });

            if region.is_empty() {
                debug!(index, "Empty region, nothing to send");
                continue;
            }
            if region.len() > MAX_SEGMENT_SIZE {
                return Err(LoaderError::SegmentTooLarge {
                    address: region.start,
                    len: region.len(),
                });
            }

            let crc = crc16(&region.data);
            let chunks = SegmentChunks::new(&region.data, capacity);
            debug!(index, chunks = chunks.total(), crc = %format!("0x{:04X}", crc), "Sending segment");

            let total = region.len() as u64;
            for (offset, chunk) in chunks {
                hasher.update(chunk);
                // Offsets stay below MAX_SEGMENT_SIZE, checked above.
                self.load_segment_chunk(offset as u16, chunk)?;
                self.emit(LoaderEvent::Progress {
                    index,
                    current: (offset + chunk.len()) as u64,
                    total,
                });
            }

            self.flush_segment()?;
            self.crc_segment(0, region.len() as u32, crc)?;
            self.emit(LoaderEvent::SegmentVerified {
                index,
                address,
                crc,
            });
            bytes += total;
        }

        let digest = hex::encode(hasher.finalize());
        self.emit(LoaderEvent::LoadComplete {
            digest: digest.clone(),
            bytes,
        });
        Ok(digest)
    }
}
