//! Grid-sequence files.
//!
//! A grid sequence is a fixed header followed by `count` grids stored back to
//! back. All values are little-endian:
//!
//! | Offset | Field                                   |
//! |--------|-----------------------------------------|
//! | 0      | min corner x, y (f32)                   |
//! | 8      | size x, y (f32)                         |
//! | 16     | columns, rows (i32)                     |
//! | 24     | element type id (i32)                   |
//! | 28     | grid count (i32)                        |
//! | 32     | range min, max (element type)           |
//!
//! The writer emits the count and range as zeros and patches them once the
//! last grid is written. A count of zero therefore marks a sequence whose
//! writer never finished.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FieldError, Result};
use crate::grid::{Grid, GridDomain};

/// Byte offset of the grid count in the header.
pub const COUNT_OFFSET: u64 = 28;

/// Header bytes before the value range.
const FIXED_HEADER_BYTES: usize = 32;

/// Element types a sequence can declare, in id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    F32,
    F64,
    F96,
    I8,
    I16,
    I32,
    I64,
}

impl ElementType {
    pub fn all() -> Vec<ElementType> {
        vec![
            ElementType::F32,
            ElementType::F64,
            ElementType::F96,
            ElementType::I8,
            ElementType::I16,
            ElementType::I32,
            ElementType::I64,
        ]
    }

    pub fn id(&self) -> i32 {
        match self {
            ElementType::F32 => 0,
            ElementType::F64 => 1,
            ElementType::F96 => 2,
            ElementType::I8 => 3,
            ElementType::I16 => 4,
            ElementType::I32 => 5,
            ElementType::I64 => 6,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::all().into_iter().find(|t| t.id() == id)
    }

    pub fn size(&self) -> usize {
        match self {
            ElementType::I8 => 1,
            ElementType::I16 => 2,
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F64 | ElementType::I64 => 8,
            ElementType::F96 => 12,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::F96 => "f96",
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
        }
    }

    fn is_readable(&self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }

    fn decode(&self, bytes: &[u8]) -> f32 {
        match self {
            ElementType::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes[..8]);
                f64::from_le_bytes(raw) as f32
            }
            _ => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

/// Header fields plus the derived sizes a reader needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSummary {
    pub min_corner: [f32; 2],
    pub size: [f32; 2],
    pub resolution: (usize, usize),
    pub element_type: ElementType,
    pub grid_count: usize,
    pub range: (f32, f32),
}

impl SequenceSummary {
    pub fn domain(&self) -> Result<GridDomain> {
        GridDomain::new(
            Vector2::new(self.min_corner[0], self.min_corner[1]),
            Vector2::new(self.size[0], self.size[1]),
            self.resolution,
        )
    }

    pub fn header_bytes(&self) -> usize {
        FIXED_HEADER_BYTES + 2 * self.element_type.size()
    }

    pub fn grid_bytes(&self) -> usize {
        self.resolution.0 * self.resolution.1 * self.element_type.size()
    }
}

impl std::fmt::Display for SequenceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Grid file sequence")?;
        writeln!(f, "  Minimum corner: ({:.2}, {:.2})", self.min_corner[0], self.min_corner[1])?;
        writeln!(f, "  Size:           ({:.2}, {:.2})", self.size[0], self.size[1])?;
        writeln!(f, "  Resolution:     ({}, {})", self.resolution.0, self.resolution.1)?;
        writeln!(f, "  Grid count:     {}", self.grid_count)?;
        writeln!(f, "  Data type:      {}", self.element_type.name())?;
        write!(f, "  Data range:     ({}, {})", self.range.0, self.range.1)
    }
}

/// Streams grids to a sequence file and patches the header on finish.
#[derive(Debug)]
pub struct SequenceWriter<W: Write + Seek = BufWriter<File>> {
    out: W,
    domain: GridDomain,
    grid_count: usize,
    observed: Option<(f32, f32)>,
}

impl SequenceWriter<BufWriter<File>> {
    /// Creates `path` and writes a placeholder header.
    pub fn create(path: impl AsRef<Path>, domain: GridDomain) -> Result<Self> {
        let path = path.as_ref();
        debug!("Creating grid sequence {}", path.display());
        Self::new(BufWriter::new(File::create(path)?), domain)
    }
}

impl<W: Write + Seek> SequenceWriter<W> {
    pub fn new(mut out: W, domain: GridDomain) -> Result<Self> {
        let min = domain.min_corner();
        let size = domain.size();
        let (cols, rows) = domain.resolution();

        let mut header = Vec::with_capacity(FIXED_HEADER_BYTES + 8);
        for v in [min.x, min.y, size.x, size.y] {
            header.extend_from_slice(&v.to_le_bytes());
        }
        for v in [cols as i32, rows as i32, ElementType::F32.id(), 0] {
            header.extend_from_slice(&v.to_le_bytes());
        }
        header.extend_from_slice(&0f32.to_le_bytes());
        header.extend_from_slice(&0f32.to_le_bytes());
        out.write_all(&header)?;

        Ok(Self {
            out,
            domain,
            grid_count: 0,
            observed: None,
        })
    }

    pub fn domain(&self) -> &GridDomain {
        &self.domain
    }

    pub fn grid_count(&self) -> usize {
        self.grid_count
    }

    /// Min and max over every value written so far.
    pub fn observed_range(&self) -> Option<(f32, f32)> {
        self.observed
    }

    /// Appends one grid.
    pub fn write_grid(&mut self, grid: &Grid) -> Result<()> {
        if grid.resolution() != self.domain.resolution() {
            return Err(FieldError::ResolutionMismatch {
                expected: self.domain.resolution(),
                found: grid.resolution(),
            });
        }
        grid.write_le(&mut self.out)?;

        let (lo, hi) = (grid.min_value(), grid.max_value());
        self.observed = Some(match self.observed {
            Some((min, max)) => (min.min(lo), max.max(hi)),
            None => (lo, hi),
        });
        self.grid_count += 1;
        Ok(())
    }

    /// Patches the header with the count and the observed range.
    pub fn finish(self) -> Result<SequenceSummary> {
        let range = self.observed.unwrap_or((0.0, 0.0));
        self.finish_with_range(range)
    }

    /// Patches the header with the count and an explicit range.
    pub fn finish_with_range(mut self, range: (f32, f32)) -> Result<SequenceSummary> {
        self.out.seek(SeekFrom::Start(COUNT_OFFSET))?;
        self.out.write_all(&(self.grid_count as i32).to_le_bytes())?;
        self.out.write_all(&range.0.to_le_bytes())?;
        self.out.write_all(&range.1.to_le_bytes())?;
        self.out.seek(SeekFrom::End(0))?;
        self.out.flush()?;

        info!(
            "Wrote {} grids, range [{}, {}]",
            self.grid_count, range.0, range.1
        );

        let min = self.domain.min_corner();
        let size = self.domain.size();
        Ok(SequenceSummary {
            min_corner: [min.x, min.y],
            size: [size.x, size.y],
            resolution: self.domain.resolution(),
            element_type: ElementType::F32,
            grid_count: self.grid_count,
            range,
        })
    }
}

/// Which grids a reader hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    /// First stored grid, mapped to index 0
    pub start: usize,

    /// Cap on grids returned (None = all)
    pub max_frames: Option<usize>,

    /// Stride between returned grids
    pub step: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            start: 0,
            max_frames: None,
            step: 1,
        }
    }
}

impl ReaderConfig {
    pub fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = Some(max_frames);
        self
    }

    pub fn with_step(mut self, step: usize) -> Self {
        self.step = step;
        self
    }
}

/// Reads grids back from a sequence file.
#[derive(Debug)]
pub struct SequenceReader<R: Read + Seek = BufReader<File>> {
    inner: R,
    summary: SequenceSummary,
    config: ReaderConfig,
    next_index: usize,
}

impl SequenceReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>, config: ReaderConfig) -> Result<Self> {
        Self::new(BufReader::new(File::open(path.as_ref())?), config)
    }
}

impl<R: Read + Seek> SequenceReader<R> {
    /// Parses the header and positions the reader at index 0.
    pub fn new(mut inner: R, config: ReaderConfig) -> Result<Self> {
        if config.step == 0 {
            return Err(FieldError::invalid_config("grid step must be at least 1"));
        }

        let mut fixed = [0u8; FIXED_HEADER_BYTES];
        inner.seek(SeekFrom::Start(0))?;
        inner.read_exact(&mut fixed)?;
        let f = |i: usize| f32::from_le_bytes([fixed[i], fixed[i + 1], fixed[i + 2], fixed[i + 3]]);
        let n = |i: usize| i32::from_le_bytes([fixed[i], fixed[i + 1], fixed[i + 2], fixed[i + 3]]);

        let type_id = n(24);
        let element_type = ElementType::from_id(type_id)
            .filter(ElementType::is_readable)
            .ok_or(FieldError::UnsupportedElementType(type_id))?;

        let (cols, rows, count) = (n(16), n(20), n(28));
        if cols <= 0 || rows <= 0 {
            return Err(FieldError::invalid_config(format!(
                "sequence resolution {cols}x{rows} is not positive"
            )));
        }
        if count <= 0 {
            return Err(FieldError::IncompleteSequence);
        }

        let mut range = vec![0u8; 2 * element_type.size()];
        inner.read_exact(&mut range)?;
        let summary = SequenceSummary {
            min_corner: [f(0), f(4)],
            size: [f(8), f(12)],
            resolution: (cols as usize, rows as usize),
            element_type,
            grid_count: count as usize,
            range: (
                element_type.decode(&range),
                element_type.decode(&range[element_type.size()..]),
            ),
        };

        let mut reader = Self {
            inner,
            summary,
            config,
            next_index: 0,
        };
        reader.set_next(0)?;
        Ok(reader)
    }

    /// The header as stored in the file.
    pub fn summary(&self) -> &SequenceSummary {
        &self.summary
    }

    pub fn domain(&self) -> Result<GridDomain> {
        self.summary.domain()
    }

    /// Number of grids this reader returns from index 0.
    pub fn grid_count(&self) -> usize {
        let available = self
            .summary
            .grid_count
            .saturating_sub(self.config.start)
            .div_ceil(self.config.step);
        self.config
            .max_frames
            .map_or(available, |max| available.min(max))
    }

    /// Positions the reader so the next grid returned is `index`.
    pub fn set_next(&mut self, index: usize) -> Result<()> {
        let raw = (self.config.start + index * self.config.step) as u64;
        let offset = self.summary.header_bytes() as u64 + raw * self.summary.grid_bytes() as u64;
        self.inner.seek(SeekFrom::Start(offset))?;
        self.next_index = index;
        Ok(())
    }

    /// Returns the next grid's values (column-major) and its index.
    pub fn next_grid(&mut self) -> Result<Option<(Vec<f32>, usize)>> {
        let index = self.next_index;
        if index >= self.grid_count() {
            return Ok(None);
        }

        let mut raw = vec![0u8; self.summary.grid_bytes()];
        if let Err(e) = self.inner.read_exact(&mut raw) {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => FieldError::TruncatedSequence {
                    index,
                    declared: self.summary.grid_count,
                },
                _ => FieldError::Io(e),
            });
        }
        let element = self.summary.element_type;
        let values = raw.chunks_exact(element.size()).map(|c| element.decode(c)).collect();

        self.next_index += 1;
        if self.config.step > 1 && self.next_index < self.grid_count() {
            let skip = (self.config.step - 1) * self.summary.grid_bytes();
            self.inner.seek(SeekFrom::Current(skip as i64))?;
        }
        Ok(Some((values, index)))
    }

    /// Reads the next grid into a [`Grid`].
    pub fn next_as_grid(&mut self) -> Result<Option<(Grid, usize)>> {
        let domain = self.domain()?;
        Ok(self.next_grid()?.map(|(values, index)| {
            let mut grid = Grid::new(domain);
            grid.values_mut().copy_from_slice(&values);
            (grid, index)
        }))
    }
}

impl<R: Read + Seek> Iterator for SequenceReader<R> {
    type Item = Result<(Vec<f32>, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_grid().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Cursor;

    fn domain() -> GridDomain {
        GridDomain::new(Vector2::new(-1.0, 2.0), Vector2::new(3.0, 2.0), (3, 2)).unwrap()
    }

    fn writer_bytes(count: usize) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = SequenceWriter::new(&mut out, domain()).unwrap();
            for i in 0..count {
                let mut grid = Grid::new(domain());
                grid.set(0, 0, i as f32);
                grid.set(2, 1, -(i as f32));
                writer.write_grid(&grid).unwrap();
            }
            writer.finish().unwrap();
        }
        out.into_inner()
    }

    #[test]
    fn test_header_layout() {
        let bytes = writer_bytes(3);
        assert_eq!(bytes.len(), 40 + 3 * 6 * 4);
        assert_eq!(i32::from_le_bytes(bytes[16..20].try_into().unwrap()), 3);
        assert_eq!(i32::from_le_bytes(bytes[24..28].try_into().unwrap()), 0);
        assert_eq!(i32::from_le_bytes(bytes[28..32].try_into().unwrap()), 3);
        assert_relative_eq!(f32::from_le_bytes(bytes[32..36].try_into().unwrap()), -2.0);
        assert_relative_eq!(f32::from_le_bytes(bytes[36..40].try_into().unwrap()), 2.0);
    }

    #[test]
    fn test_read_back_with_stride() {
        let bytes = writer_bytes(7);
        let config = ReaderConfig::default().with_start(1).with_step(2);
        let mut reader = SequenceReader::new(Cursor::new(bytes), config).unwrap();
        assert_eq!(reader.grid_count(), 3);

        let firsts: Vec<f32> = reader.by_ref().map(|r| r.unwrap().0[0]).collect();
        assert_eq!(firsts, vec![1.0, 3.0, 5.0]);

        reader.set_next(1).unwrap();
        let (grid, index) = reader.next_as_grid().unwrap().unwrap();
        assert_eq!(index, 1);
        assert_relative_eq!(grid.get(2, 1), -3.0);
    }

    #[test]
    fn test_unfinished_header_is_incomplete() {
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = SequenceWriter::new(&mut out, domain()).unwrap();
            writer.write_grid(&Grid::new(domain())).unwrap();
            // dropped without finish
        }
        let result = SequenceReader::new(Cursor::new(out.into_inner()), ReaderConfig::default());
        assert!(matches!(result, Err(FieldError::IncompleteSequence)));
    }

    #[test]
    fn test_short_body_is_truncated() {
        let mut bytes = writer_bytes(2);
        bytes.truncate(bytes.len() - 4);
        let mut reader = SequenceReader::new(Cursor::new(bytes), ReaderConfig::default()).unwrap();
        reader.next_grid().unwrap().unwrap();
        assert!(matches!(
            reader.next_grid(),
            Err(FieldError::TruncatedSequence { index: 1, declared: 2 })
        ));
    }

    #[test]
    fn test_f64_sequences_are_readable() {
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.0, 1.0, 1.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in [1i32, 2, ElementType::F64.id(), 1] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for v in [0.5f64, 7.25, 0.5, 7.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }

        let mut reader = SequenceReader::new(Cursor::new(bytes), ReaderConfig::default()).unwrap();
        assert_eq!(reader.summary().header_bytes(), 48);
        assert_eq!(reader.summary().range, (0.5, 7.25));
        let (values, _) = reader.next_grid().unwrap().unwrap();
        assert_eq!(values, vec![0.5, 7.25]);
    }

    #[test]
    fn test_integer_element_type_rejected() {
        let mut bytes = writer_bytes(1);
        bytes[24..28].copy_from_slice(&ElementType::I16.id().to_le_bytes());
        let result = SequenceReader::new(Cursor::new(bytes), ReaderConfig::default());
        assert!(matches!(result, Err(FieldError::UnsupportedElementType(4))));
    }

    #[test]
    fn test_resolution_mismatch_rejected() {
        let mut writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();
        let other = GridDomain::new(Vector2::zeros(), Vector2::new(1.0, 1.0), (2, 2)).unwrap();
        assert!(matches!(
            writer.write_grid(&Grid::new(other)),
            Err(FieldError::ResolutionMismatch { .. })
        ));
    }
}
