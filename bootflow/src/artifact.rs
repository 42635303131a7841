//! # System Artifacts and Address Mapping
//!
//! A [`SystemArtifact`] is any addressable byte blob taking part in a
//! simulation (a firmware image, a register dump). Ranges are expressed in
//! some coordinate system; an [`AddressMapper`] translates them into the
//! artifact's native byte offsets and back.
//!
//! | Mapper             | Input coordinates                         |
//! |--------------------|-------------------------------------------|
//! | [`IdentityMapper`] | native offsets                            |
//! | [`PhysMemMapper`]  | physical memory (BIOS region below 4 GiB) |

use crate::firmware::{FlashRegion, RegionKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Top of the 32-bit physical address space where the BIOS region is mapped
pub const BIOS_REGION_TOP: u64 = 0x1_0000_0000;

// ============================================================================
// ERRORS
// ============================================================================

/// Failure translating ranges between coordinate systems
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("no BIOS region found in artifact")]
    NoBiosRegion,
    #[error("range {range} is not mapped by the {mapper} mapper")]
    Unmapped { range: Range, mapper: &'static str },
}

/// Failure reading bytes out of an artifact
#[derive(Debug, Error)]
pub enum ArtifactReadError {
    #[error("range {range} is out of bounds (artifact size {size:#x})")]
    OutOfBounds { range: Range, size: u64 },
    #[error("short read at {range}: got {read} bytes")]
    ShortRead { range: Range, read: usize },
    #[error("I/O error reading artifact: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Read(#[from] ArtifactReadError),
}

// ============================================================================
// RANGES
// ============================================================================

/// A contiguous byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub offset: u64,
    pub length: u64,
}

impl Range {
    pub const fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whether `other` lies entirely within this range
    pub const fn contains_range(&self, other: &Range) -> bool {
        other.offset >= self.offset && other.end() <= self.end()
    }

    /// Whether the two ranges overlap or touch each other
    pub const fn touches(&self, other: &Range) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.offset, self.end())
    }
}

/// An ordered list of ranges within one coordinate system
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ranges(pub Vec<Range>);

impl Ranges {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn single(range: Range) -> Self {
        Self(vec![range])
    }

    pub fn push(&mut self, range: Range) {
        self.0.push(range);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Range::is_empty)
    }

    /// Sum of lengths (overlaps counted twice unless merged first)
    pub fn total_length(&self) -> u64 {
        self.0.iter().map(|r| r.length).sum()
    }

    /// Sort, drop empty ranges and coalesce overlapping or adjacent ones
    pub fn sort_and_merge(&mut self) {
        self.0.retain(|r| !r.is_empty());
        self.0.sort();
        let mut merged: Vec<Range> = Vec::with_capacity(self.0.len());
        for range in self.0.drain(..) {
            match merged.last_mut() {
                Some(last) if last.touches(&range) => {
                    let end = last.end().max(range.end());
                    last.length = end - last.offset;
                }
                _ => merged.push(range),
            }
        }
        self.0 = merged;
    }

    pub fn merged(&self) -> Ranges {
        let mut copy = self.clone();
        copy.sort_and_merge();
        copy
    }

    /// Whether every byte of `self` is covered by `other`
    pub fn is_subset_of(&self, other: &Ranges) -> bool {
        let other = other.merged();
        self.merged()
            .iter()
            .all(|r| other.iter().any(|o| o.contains_range(r)))
    }

    /// Bytes of `self` not covered by `other`
    pub fn subtract(&self, other: &Ranges) -> Ranges {
        let other = other.merged();
        let mut out = Ranges::new();
        for range in self.merged().iter() {
            let mut cursor = range.offset;
            for hole in other.iter() {
                if hole.end() <= cursor || hole.offset >= range.end() {
                    continue;
                }
                if hole.offset > cursor {
                    out.push(Range::new(cursor, hole.offset - cursor));
                }
                cursor = cursor.max(hole.end());
            }
            if cursor < range.end() {
                out.push(Range::new(cursor, range.end() - cursor));
            }
        }
        out
    }
}

impl From<Vec<Range>> for Ranges {
    fn from(v: Vec<Range>) -> Self {
        Self(v)
    }
}

impl FromIterator<Range> for Ranges {
    fn from_iter<T: IntoIterator<Item = Range>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Ranges {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// ============================================================================
// ARTIFACTS
// ============================================================================

/// Which artifact of the simulation a reference points into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// The firmware (flash) image
    Firmware,
    /// The register snapshot (TXT public space, AMD C2P mailbox)
    Registers,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactKind::Firmware => write!(f, "firmware"),
            ArtifactKind::Registers => write!(f, "registers"),
        }
    }
}

/// An addressable byte blob
pub trait SystemArtifact: fmt::Debug + Send + Sync {
    /// Size in bytes
    fn size(&self) -> u64;

    /// Read bytes at `offset`; returns the number of bytes read
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Flash regions, when the artifact is a firmware image
    fn flash_regions(&self) -> &[FlashRegion] {
        &[]
    }
}

/// Read exactly `range` out of an artifact
///
/// Out-of-bounds or short reads are errors, never partial results.
pub fn read_range(artifact: &dyn SystemArtifact, range: Range) -> Result<Vec<u8>, ArtifactReadError> {
    let size = artifact.size();
    if range.end() > size || range.offset.checked_add(range.length).is_none() {
        return Err(ArtifactReadError::OutOfBounds { range, size });
    }
    let mut buf = vec![0u8; range.length as usize];
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = artifact.read_at(&mut buf[filled..], range.offset + filled as u64)?;
        if n == 0 {
            return Err(ArtifactReadError::ShortRead { range, read: filled });
        }
        filled += n;
    }
    Ok(buf)
}

/// In-memory artifact
#[derive(Clone, PartialEq, Eq)]
pub struct BytesArtifact(Vec<u8>);

impl BytesArtifact {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BytesArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BytesArtifact({} bytes)", self.0.len())
    }
}

impl SystemArtifact for BytesArtifact {
    fn size(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.0.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.0.len() - start);
        buf[..n].copy_from_slice(&self.0[start..start + n]);
        Ok(n)
    }
}

/// File-backed artifact (e.g. a flash dump on disk)
#[derive(Debug)]
pub struct FileArtifact {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
}

impl FileArtifact {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SystemArtifact for FileArtifact {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "artifact file lock poisoned"))?;
        file.seek(SeekFrom::Start(offset))?;
        file.read(buf)
    }
}

// ============================================================================
// ADDRESS MAPPERS
// ============================================================================

/// Bidirectional mapping between a coordinate system and native offsets
pub trait AddressMapper: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Convert ranges in this mapper's coordinates into native offsets
    fn resolve(&self, artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError>;

    /// Convert native offsets back into this mapper's coordinates
    fn unresolve(&self, artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl AddressMapper for IdentityMapper {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn resolve(&self, _artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError> {
        Ok(ranges.clone())
    }

    fn unresolve(&self, _artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError> {
        Ok(ranges.clone())
    }
}

/// Physical memory <-> flash offset mapper
///
/// The BIOS region is mapped so that its last byte sits at `0xFFFF_FFFF`.
/// An artifact without flash region descriptors is a BIOS-only image.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhysMemMapper;

impl PhysMemMapper {
    fn bios_region(artifact: &dyn SystemArtifact) -> Result<Range, MappingError> {
        let regions = artifact.flash_regions();
        if regions.is_empty() {
            return Ok(Range::new(0, artifact.size()));
        }
        regions
            .iter()
            .find(|r| r.kind == RegionKind::Bios)
            .map(|r| r.range)
            .ok_or(MappingError::NoBiosRegion)
    }

    /// Physical address of the first byte of the BIOS region
    pub fn bios_base(artifact: &dyn SystemArtifact) -> Result<u64, MappingError> {
        let bios = Self::bios_region(artifact)?;
        Ok(BIOS_REGION_TOP.saturating_sub(bios.length))
    }
}

impl AddressMapper for PhysMemMapper {
    fn name(&self) -> &'static str {
        "physical memory"
    }

    fn resolve(&self, artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError> {
        let bios = Self::bios_region(artifact)?;
        let base = BIOS_REGION_TOP.saturating_sub(bios.length);
        ranges
            .iter()
            .map(|r| {
                if r.offset < base || r.end() > BIOS_REGION_TOP {
                    return Err(MappingError::Unmapped { range: *r, mapper: self.name() });
                }
                Ok(Range::new(bios.offset + (r.offset - base), r.length))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Ranges)
    }

    fn unresolve(&self, artifact: &dyn SystemArtifact, ranges: &Ranges) -> Result<Ranges, MappingError> {
        let bios = Self::bios_region(artifact)?;
        let base = BIOS_REGION_TOP.saturating_sub(bios.length);
        ranges
            .iter()
            .map(|r| {
                if !bios.contains_range(r) {
                    return Err(MappingError::Unmapped { range: *r, mapper: self.name() });
                }
                Ok(Range::new(base + (r.offset - bios.offset), r.length))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Ranges)
    }
}
