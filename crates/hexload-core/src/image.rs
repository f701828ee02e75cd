//! Address-tagged memory regions to load.
//!
//! The loader only needs an ordered list of regions and the lowest start
//! address; `ImageProvider` is that contract. `SegmentedImage` is the
//! in-memory provider used by the CLI and tests.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

use crate::protocol::constants::MAX_SEGMENT_SIZE;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("Region 0x{start:08X}+{len} overlaps an existing region")]
    Overlap { start: u32, len: usize },

    #[error("Region 0x{start:08X}+{len} extends past the 32-bit address space")]
    AddressOverflow { start: u32, len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One contiguous block of image bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u32,
    pub data: Vec<u8>,
}

impl MemoryRegion {
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// One past the last address, widened so a region ending at 4 GiB fits.
    pub fn end(&self) -> u64 {
        self.start as u64 + self.data.len() as u64
    }
}

/// Source of the regions to transfer.
pub trait ImageProvider {
    /// Regions in transfer order.
    fn regions(&self) -> &[MemoryRegion];

    /// Lowest start address, the origin for relative addressing.
    fn min_address(&self) -> u32 {
        self.regions().iter().map(|r| r.start).min().unwrap_or(0)
    }
}

/// In-memory image made of non-overlapping regions.
#[derive(Debug, Clone, Default)]
pub struct SegmentedImage {
    regions: Vec<MemoryRegion>,
}

impl SegmentedImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region, keeping insertion order as transfer order.
    pub fn push(&mut self, start: u32, data: Vec<u8>) -> Result<(), ImageError> {
        let region = MemoryRegion::new(start, data);
        if region.end() > u32::MAX as u64 + 1 {
            return Err(ImageError::AddressOverflow {
                start,
                len: region.len(),
            });
        }
        let overlaps = self
            .regions
            .iter()
            .filter(|r| !r.is_empty())
            .any(|r| (region.start as u64) < r.end() && (r.start as u64) < region.end());
        if overlaps && !region.is_empty() {
            return Err(ImageError::Overlap {
                start,
                len: region.len(),
            });
        }
        self.regions.push(region);
        Ok(())
    }

    /// Lay a flat binary out at `base`, split into protocol-sized segments.
    pub fn from_binary(base: u32, data: &[u8]) -> Result<Self, ImageError> {
        let mut image = Self::new();
        if data.is_empty() {
            image.push(base, Vec::new())?;
            return Ok(image);
        }
        for (i, segment) in data.chunks(MAX_SEGMENT_SIZE).enumerate() {
            let offset = (i * MAX_SEGMENT_SIZE) as u64;
            let start = u32::try_from(base as u64 + offset).map_err(|_| {
                ImageError::AddressOverflow {
                    start: base,
                    len: data.len(),
                }
            })?;
            image.push(start, segment.to_vec())?;
        }
        Ok(image)
    }

    /// Read a flat binary file and lay it out at `base`.
    pub fn from_file<P: AsRef<Path>>(path: P, base: u32) -> Result<Self, ImageError> {
        let data = std::fs::read(path.as_ref())?;
        debug!(path = %path.as_ref().display(), bytes = data.len(), "Read binary image");
        Self::from_binary(base, &data)
    }

    /// Total payload bytes across all regions.
    pub fn total_len(&self) -> usize {
        self.regions.iter().map(MemoryRegion::len).sum()
    }
}

impl ImageProvider for SegmentedImage {
    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }
}
