//! Image readers: raw, TIFF and plain-text frame stacks (component R of
//! `SPEC_FULL.md` §2, §6). An HDF5 frame reader lives behind the `archive`
//! feature in [`crate::archive`] instead of here, since it shares the
//! feature-gated `hdf5` dependency with the experiment archive.

use super::DataReaderParameters;
use crate::dataset::Frame;
use crate::error::{OhklError, Result};
use std::path::Path;

/// Common contract for every on-disk frame format: decode one file into a
/// single [`Frame`]. `nrows`/`ncols` come from `DataReaderParameters`
/// (raw/text) or the file itself (Tiff, after `rebin_size`).
pub trait FrameReader: Send + Sync {
    fn read_frame(&self, path: &Path) -> Result<Frame>;
}

/// Row- vs column-major pixel ordering for a raw frame file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLayout {
    RowMajor,
    ColumnMajor,
}

/// `u16`/`u32` binary frames with optional column-major layout and
/// byte-swapped endianness, matching the original's raw reader.
pub struct RawReader {
    params: DataReaderParameters,
}

impl RawReader {
    pub fn new(params: DataReaderParameters) -> Self {
        Self { params }
    }

    fn layout(&self) -> RawLayout {
        if self.params.row_major { RawLayout::RowMajor } else { RawLayout::ColumnMajor }
    }
}

impl FrameReader for RawReader {
    fn read_frame(&self, path: &Path) -> Result<Frame> {
        let bytes = std::fs::read(path).map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        let (nrows, ncols) = (self.params.nrows, self.params.ncols);
        let expected_pixels = nrows * ncols;
        let expected_bytes = expected_pixels * self.params.bytes_per_pixel;
        if bytes.len() < expected_bytes {
            return Err(OhklError::Reader(format!(
                "{}: expected at least {expected_bytes} bytes for a {nrows}x{ncols} frame, got {}",
                path.display(),
                bytes.len()
            ))
            .into());
        }

        let mut counts = vec![0u32; expected_pixels];
        for (i, chunk) in bytes.chunks_exact(self.params.bytes_per_pixel).take(expected_pixels).enumerate() {
            counts[i] = decode_pixel(chunk, self.params.swap_endian);
        }

        let frame = match self.layout() {
            RawLayout::RowMajor => Frame::from_counts(nrows, ncols, counts)?,
            RawLayout::ColumnMajor => {
                let mut row_major = vec![0u32; expected_pixels];
                for col in 0..ncols {
                    for row in 0..nrows {
                        row_major[row * ncols + col] = counts[col * nrows + row];
                    }
                }
                Frame::from_counts(nrows, ncols, row_major)?
            }
        };
        Ok(frame)
    }
}

fn decode_pixel(bytes: &[u8], swap_endian: bool) -> u32 {
    match bytes.len() {
        2 => {
            let mut b = [bytes[0], bytes[1]];
            if swap_endian {
                b.swap(0, 1);
            }
            u16::from_le_bytes(b) as u32
        }
        4 => {
            let mut b = [bytes[0], bytes[1], bytes[2], bytes[3]];
            if swap_endian {
                b.reverse();
            }
            u32::from_le_bytes(b)
        }
        _ => 0,
    }
}

/// TIFF frames via the `image` crate, with optional integer rebinning
/// (summing `rebin_size x rebin_size` pixel blocks into one output pixel).
pub struct TiffReader {
    params: DataReaderParameters,
}

impl TiffReader {
    pub fn new(params: DataReaderParameters) -> Self {
        Self { params }
    }
}

impl FrameReader for TiffReader {
    fn read_frame(&self, path: &Path) -> Result<Frame> {
        let img = image::open(path)
            .map_err(|e| OhklError::Reader(format!("{}: {e}", path.display())))?
            .into_luma16();
        let (ncols, nrows) = (img.width() as usize, img.height() as usize);
        let counts: Vec<u32> = img.into_raw().into_iter().map(u32::from).collect();
        let frame = Frame::from_counts(nrows, ncols, counts)?;
        Ok(rebin(&frame, self.params.rebin_size.max(1)))
    }
}

/// Sums `factor x factor` blocks of a frame into a single output pixel;
/// `factor == 1` returns the frame unchanged. Trailing rows/columns that
/// don't fill a full block are dropped, matching an integer `rebin_size`
/// with no partial-bin accumulation.
fn rebin(frame: &Frame, factor: usize) -> Frame {
    if factor <= 1 {
        return frame.clone();
    }
    let nrows = frame.nrows / factor;
    let ncols = frame.ncols / factor;
    let mut out = Frame::zeros(nrows, ncols);
    for oy in 0..nrows {
        for ox in 0..ncols {
            let mut sum = 0u32;
            for dy in 0..factor {
                for dx in 0..factor {
                    sum += frame.get(ox * factor + dx, oy * factor + dy);
                }
            }
            out.set(ox, oy, sum);
        }
    }
    out
}

/// Whitespace-separated integer counts, one frame per file, `nrows` lines
/// of `ncols` values each.
pub struct TextReader {
    params: DataReaderParameters,
}

impl TextReader {
    pub fn new(params: DataReaderParameters) -> Self {
        Self { params }
    }
}

impl FrameReader for TextReader {
    fn read_frame(&self, path: &Path) -> Result<Frame> {
        let contents = std::fs::read_to_string(path).map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        let counts: Vec<u32> = contents
            .split_whitespace()
            .map(|tok| tok.parse::<u32>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| OhklError::Reader(format!("{}: non-integer token: {e}", path.display())))?;
        Frame::from_counts(self.params.nrows, self.params.ncols, counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(nrows: usize, ncols: usize) -> DataReaderParameters {
        DataReaderParameters { nrows, ncols, ..Default::default() }
    }

    #[test]
    fn raw_reader_decodes_row_major_u16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.raw");
        let pixels: [u16; 4] = [1, 2, 3, 4];
        let bytes: Vec<u8> = pixels.iter().flat_map(|p| p.to_le_bytes()).collect();
        std::fs::write(&path, bytes).unwrap();

        let reader = RawReader::new(params(2, 2));
        let frame = reader.read_frame(&path).unwrap();
        assert_eq!(frame.get(0, 0), 1);
        assert_eq!(frame.get(1, 1), 4);
    }

    #[test]
    fn raw_reader_rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.raw");
        std::fs::write(&path, [0u8, 1]).unwrap();
        let reader = RawReader::new(params(4, 4));
        assert!(reader.read_frame(&path).is_err());
    }

    #[test]
    fn text_reader_parses_whitespace_separated_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.txt");
        std::fs::write(&path, "1 2\n3 4\n").unwrap();
        let reader = TextReader::new(params(2, 2));
        let frame = reader.read_frame(&path).unwrap();
        assert_eq!(frame.get(0, 1), 3);
    }

    #[test]
    fn rebin_sums_pixel_blocks() {
        let mut frame = Frame::zeros(4, 4);
        for y in 0..4 {
            for x in 0..4 {
                frame.set(x, y, 1);
            }
        }
        let binned = rebin(&frame, 2);
        assert_eq!(binned.nrows, 2);
        assert_eq!(binned.ncols, 2);
        assert_eq!(binned.get(0, 0), 4);
    }
}
