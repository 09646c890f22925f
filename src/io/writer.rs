//! Peak export formats (component S of `SPEC_FULL.md` §2, §6): ShelX,
//! FullProf, Scalepack (`.sca`) and a simplified CCP4 MTZ writer. Each
//! consumes a [`crate::merge::MergedPeakCollection`] plus the
//! [`crate::unitcell::UnitCell`]/[`crate::dataset::DataSet`] it was merged
//! against, and an intensity scale factor (default `1.0`).

use crate::dataset::DataSet;
use crate::error::{OhklError, Result};
use crate::merge::MergedPeakCollection;
use crate::unitcell::UnitCell;
use std::io::Write;
use std::path::Path;

/// Common contract for every peak export format.
pub trait PeakExporter {
    fn write(&self, collections: &[MergedPeakCollection], cell: &UnitCell, dataset: &DataSet, scale: f64, path: &Path) -> Result<()>;
}

fn open(path: &Path) -> Result<std::fs::File> {
    std::fs::File::create(path).map_err(|source| OhklError::Io { path: path.to_path_buf(), source }.into())
}

/// Fixed-width `h k l F sigma` records, SHELX `.hkl` convention (`4I4,2F8.2`
/// approximated here with plain whitespace fields — SHELX's free-format
/// reader accepts either).
pub struct ShelxWriter;

impl PeakExporter for ShelxWriter {
    fn write(&self, collections: &[MergedPeakCollection], _cell: &UnitCell, _dataset: &DataSet, scale: f64, path: &Path) -> Result<()> {
        let mut file = open(path)?;
        for shell in collections {
            for peak in &shell.peaks {
                let (h, k, l) = peak.hkl;
                writeln!(
                    file,
                    "{h:4}{k:4}{l:4}{:8.2}{:8.2}",
                    peak.intensity() * scale,
                    peak.sigma() * scale
                )
                .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
            }
        }
        writeln!(file, "{:4}{:4}{:4}{:8.2}{:8.2}", 0, 0, 0, 0.0, 0.0)
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        Ok(())
    }
}

/// FullProf `.hkl`: a header line with the cell plus one record per
/// reflection (`h k l Fsqr sigma`).
pub struct FullProfWriter;

impl PeakExporter for FullProfWriter {
    fn write(&self, collections: &[MergedPeakCollection], cell: &UnitCell, _dataset: &DataSet, scale: f64, path: &Path) -> Result<()> {
        let mut file = open(path)?;
        let c = cell.character();
        writeln!(file, "FullProf reflection file, cell {:.4} {:.4} {:.4} {:.3} {:.3} {:.3}", c.a, c.b, c.c, c.alpha, c.beta, c.gamma)
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        for shell in collections {
            for peak in &shell.peaks {
                let (h, k, l) = peak.hkl;
                writeln!(file, "{h:4}{k:4}{l:4}{:12.3}{:12.3}", peak.intensity() * scale, peak.sigma() * scale)
                    .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
            }
        }
        Ok(())
    }
}

/// Phenix/Scalepack `.sca` unmerged-style text format: a cell/space-group
/// header, then `h k l batch I sigma` records (batch fixed at `1` since
/// this crate's merger does not track the original's scan-batch numbering
/// beyond the refiner's `RefinementBatch`es, which are not 1:1 with
/// scalepack batches).
pub struct ScalepackWriter;

impl PeakExporter for ScalepackWriter {
    fn write(&self, collections: &[MergedPeakCollection], cell: &UnitCell, _dataset: &DataSet, scale: f64, path: &Path) -> Result<()> {
        let mut file = open(path)?;
        let c = cell.character();
        writeln!(file, "    1").map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        writeln!(file, "{:10.3}{:10.3}{:10.3}{:10.3}{:10.3}{:10.3} {}", c.a, c.b, c.c, c.alpha, c.beta, c.gamma, cell.space_group.symbol)
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        for shell in collections {
            for peak in &shell.peaks {
                let (h, k, l) = peak.hkl;
                writeln!(file, "{h:4}{k:4}{l:4}{:4}{:8.1}{:8.1}", 1, peak.intensity() * scale, peak.sigma() * scale)
                    .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
            }
        }
        Ok(())
    }
}

/// A faithful-but-not-100%-complete CCP4 MTZ writer: the binary header
/// columns needed to round-trip through this crate's own quality metrics
/// (H, K, L, I, SIGI) rather than the full MTZ column dictionary (batch
/// headers, symmetry tables, history records). See `DESIGN.md` for the
/// scope cut and `spec.md` §6 Non-goals.
pub struct MtzWriter;

impl PeakExporter for MtzWriter {
    fn write(&self, collections: &[MergedPeakCollection], cell: &UnitCell, _dataset: &DataSet, scale: f64, path: &Path) -> Result<()> {
        let mut file = open(path)?;
        let columns = ["H", "K", "L", "I", "SIGI"];
        let n_cols = columns.len();
        let reflections: Vec<[f32; 5]> = collections
            .iter()
            .flat_map(|shell| shell.peaks.iter())
            .map(|p| {
                let (h, k, l) = p.hkl;
                [h as f32, k as f32, l as f32, (p.intensity() * scale) as f32, (p.sigma() * scale) as f32]
            })
            .collect();
        let n_refl = reflections.len();

        // MTZ files begin with the literal ASCII tag "MTZ " followed by the
        // byte offset (in words) of the header records; we write a minimal
        // stand-in header immediately after the data instead of following
        // the exact CCP4 header-record grammar.
        file.write_all(b"MTZ ").map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        let header_offset = 1 + n_refl * n_cols;
        file.write_all(&(header_offset as u32).to_le_bytes())
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;

        for record in &reflections {
            for value in record {
                file.write_all(&value.to_le_bytes()).map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
            }
        }

        let c = cell.character();
        writeln!(file, "\nVERS MTZ:V1.1")
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        writeln!(file, "CELL {:.4} {:.4} {:.4} {:.3} {:.3} {:.3}", c.a, c.b, c.c, c.alpha, c.beta, c.gamma)
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        writeln!(file, "SYMM {}", cell.space_group.symbol)
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        writeln!(file, "NCOL {n_cols} NREFL {n_refl}")
            .map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        for name in columns {
            writeln!(file, "COLUMN {name}").map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        }
        writeln!(file, "END").map_err(|source| OhklError::Io { path: path.to_path_buf(), source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Ellipsoid, Matrix3, Vector3};
    use crate::instrument::{DetectorGeometry, Diffractometer, InstrumentState};
    use crate::merge::{merge_peaks, MergeParameters};
    use crate::peak::{Intensity, Peak3D, PeakCollection, PeakCollectionKind};
    use crate::spacegroup::SpaceGroup;
    use crate::unitcell::CellCharacter;

    fn fixture() -> (Vec<MergedPeakCollection>, UnitCell, DataSet) {
        let cell = UnitCell::from_character(
            CellCharacter { a: 54.7, b: 58.6, c: 67.3, alpha: 90.0, beta: 90.0, gamma: 90.0 },
            SpaceGroup::p212121(),
        );
        let geom = DetectorGeometry::new(16, 16, 100.0, 0.1, 0.1);
        let diff = Diffractometer::new("test", geom);
        let mut ds = DataSet::new("ds", diff);
        ds.push_frame(crate::dataset::Frame::zeros(16, 16), InstrumentState::new(1.0));

        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        let shape = Ellipsoid::new(Vector3::zeros(), Matrix3::identity());
        let mut peak = Peak3D::new(shape, 0);
        peak.miller_index = Some((2, -12, -5));
        peak.sum_intensity = Intensity::new(12878.5, 100.0);
        collection.push(peak);

        let merged = merge_peaks(&cell.space_group, &[&collection], &MergeParameters::default());
        let shell = MergedPeakCollection { d_min: 1.5, d_max: 50.0, peaks: merged };
        (vec![shell], cell, ds)
    }

    #[test]
    fn shelx_writer_emits_terminator_record() {
        let (collections, cell, ds) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.hkl");
        ShelxWriter.write(&collections, &cell, &ds, 1.0, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.lines().count() >= 2, "expected a reflection line and a terminator");
    }

    #[test]
    fn scalepack_writer_includes_space_group_symbol() {
        let (collections, cell, ds) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.sca");
        ScalepackWriter.write(&collections, &cell, &ds, 1.0, &path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains(&cell.space_group.symbol));
    }

    #[test]
    fn mtz_writer_emits_magic_bytes() {
        let (collections, cell, ds) = fixture();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mtz");
        MtzWriter.write(&collections, &cell, &ds, 1.0, &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"MTZ ");
    }
}
