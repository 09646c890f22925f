//! Frame readers and peak exporters (components R and S of `SPEC_FULL.md`
//! §2, §6).

pub mod reader;
pub mod writer;

pub use reader::{FrameReader, RawLayout, RawReader, TextReader, TiffReader};
pub use writer::{FullProfWriter, MtzWriter, PeakExporter, ScalepackWriter, ShelxWriter};

use crate::dataset::Frame;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Which on-disk format a [`reader::FrameReader`] expects, selected by the
/// `DataReader` section of the YAML config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataReaderFormat {
    Raw,
    Tiff,
    Text,
}

impl Default for DataReaderFormat {
    fn default() -> Self {
        DataReaderFormat::Tiff
    }
}

/// Geometry and encoding parameters needed to read a stack of raw detector
/// images, mirroring the original's `DataReaderParameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReaderParameters {
    pub format: DataReaderFormat,
    pub nrows: usize,
    pub ncols: usize,
    pub nframes: usize,
    /// `u16` vs `u32` raw pixel encoding; ignored for Tiff/Text.
    pub bytes_per_pixel: usize,
    pub row_major: bool,
    pub swap_endian: bool,
    /// Integer downsampling applied to Tiff frames on read (`1` = none).
    pub rebin_size: usize,
}

impl Default for DataReaderParameters {
    fn default() -> Self {
        Self {
            format: DataReaderFormat::default(),
            nrows: 0,
            ncols: 0,
            nframes: 0,
            bytes_per_pixel: 2,
            row_major: true,
            swap_endian: false,
            rebin_size: 1,
        }
    }
}

/// Builds the `FrameReader` selected by `params.format`.
pub fn reader_for(params: &DataReaderParameters) -> Box<dyn FrameReader> {
    match params.format {
        DataReaderFormat::Raw => Box::new(RawReader::new(params.clone())),
        DataReaderFormat::Tiff => Box::new(TiffReader::new(params.clone())),
        DataReaderFormat::Text => Box::new(TextReader::new(params.clone())),
    }
}

/// Reads every frame of a dataset from `paths`, one path per frame, in
/// order. Individual readers may also support reading a whole multi-frame
/// file from a single path (see [`FrameReader::read_stack`]).
pub fn read_frames(reader: &dyn FrameReader, paths: &[std::path::PathBuf]) -> Result<Vec<Frame>> {
    paths.iter().map(|p| reader.read_frame(p)).collect()
}
