//! Autoindexing: 1-D FFT along sampled reciprocal directions, candidate
//! basis-triple search, refinement (component F of `SPEC_FULL.md` §4.2).
//!
//! Implements the method of Steller, Bolotovsky & Rossmann (J. Appl.
//! Cryst., 1997): project found-peak q-vectors onto many directions
//! sampled on the unit sphere, Fourier transform the 1-D histogram along
//! each direction, and read off the lattice repeat from the lowest
//! surviving non-zero frequency.

use crate::dataset::DataSet;
use crate::geometry::{Matrix3, Vector3};
use crate::peak::Peak3D;
use crate::spacegroup::SpaceGroup;
use crate::unitcell::UnitCell;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexerParameters {
    pub maxdim: f64,
    pub n_solutions: usize,
    pub n_vertices: usize,
    pub subdiv: usize,
    pub indexing_tolerance: f64,
    pub niggli_tolerance: f64,
    pub gruber_tolerance: f64,
    pub niggli_reduction_only: bool,
    pub min_unit_cell_volume: f64,
    pub unit_cell_equivalence_tolerance: f64,
    pub solution_cutoff: f64,
    pub frequency_tolerance: f64,
    pub d_min: f64,
    pub d_max: f64,
    pub strength_min: f64,
    pub strength_max: f64,
    pub peaks_integrated: bool,
}

impl Default for IndexerParameters {
    fn default() -> Self {
        Self {
            maxdim: 200.0,
            n_solutions: 10,
            n_vertices: 10_000,
            subdiv: 30,
            indexing_tolerance: 0.2,
            niggli_tolerance: 1e-3,
            gruber_tolerance: 4e-2,
            niggli_reduction_only: false,
            min_unit_cell_volume: 20.0,
            unit_cell_equivalence_tolerance: 0.05,
            solution_cutoff: 10.0,
            frequency_tolerance: 0.7,
            d_min: 1.5,
            d_max: 50.0,
            strength_min: 1.0,
            strength_max: 1.0e7,
            peaks_integrated: false,
        }
    }
}

/// A candidate unit cell together with the percentage of input peaks it
/// indexes within `indexing_tolerance`.
pub type RankedSolution = (UnitCell, f64);

/// Peaks restricted to the strength/resolution window `IndexerParameters`
/// describes, with q-vectors computed from the dataset's instrument
/// state at each peak's frame centre.
fn filter_peaks(peaks: &[Peak3D], dataset: &DataSet, params: &IndexerParameters) -> Vec<(Vector3, usize)> {
    let mut out = Vec::new();
    for (i, peak) in peaks.iter().enumerate() {
        if !peak.enabled() {
            continue;
        }
        let strength = peak.sum_intensity.strength();
        if params.peaks_integrated && (strength < params.strength_min || strength > params.strength_max) {
            continue;
        }
        let center = peak.center();
        let Some(state) = dataset.state(center.z.round().max(0.0) as usize) else { continue };
        let q = state.sample_q(&dataset.diffractometer.detector, center.x, center.y);
        let norm = q.norm();
        if norm <= 0.0 {
            continue;
        }
        let d = 2.0 * std::f64::consts::PI / norm;
        if d < params.d_min || d > params.d_max {
            continue;
        }
        out.push((q, i));
    }
    out
}

/// Fibonacci-lattice sampling of `n` roughly uniform directions on the
/// unit sphere.
fn sample_directions(n: usize) -> Vec<Vector3> {
    let golden_angle = std::f64::consts::PI * (3.0 - 5.0_f64.sqrt());
    (0..n)
        .map(|i| {
            let y = 1.0 - 2.0 * (i as f64 + 0.5) / n as f64;
            let radius = (1.0 - y * y).max(0.0).sqrt();
            let theta = golden_angle * i as f64;
            Vector3::new(theta.cos() * radius, y, theta.sin() * radius)
        })
        .collect()
}

/// Projects `qs` onto `direction`, builds a histogram over
/// `[-maxdim, maxdim]` with `subdiv * maxdim` bins (rounded to the next
/// even count for `realfft`), and returns the lowest surviving non-zero
/// frequency's period in reciprocal units, i.e. a candidate real-space
/// repeat length along `direction`.
fn candidate_spacing(qs: &[Vector3], direction: Vector3, params: &IndexerParameters) -> Option<f64> {
    let nbins = ((params.subdiv as f64 * params.maxdim).round() as usize).max(8);
    let nbins = nbins + (nbins % 2);
    let mut histogram = vec![0.0f64; nbins];
    let scale = nbins as f64 / (2.0 * params.maxdim);

    for q in qs {
        let proj = q.dot(&direction);
        if proj.abs() >= params.maxdim {
            continue;
        }
        let bin = ((proj + params.maxdim) * scale) as usize;
        if bin < nbins {
            histogram[bin] += 1.0;
        }
    }

    let mut planner = RealFftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(nbins);
    let mut input = histogram;
    let mut spectrum = fft.make_output_vec();
    fft.process(&mut input, &mut spectrum).ok()?;

    let amplitude0 = spectrum[0].norm();
    if amplitude0 <= 0.0 {
        return None;
    }

    let threshold = params.frequency_tolerance * amplitude0;
    let k = spectrum
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, c)| c.norm() >= threshold)
        .map(|(k, _)| k)?;

    // Histogram domain spans `2 * maxdim` reciprocal units; frequency `k`
    // corresponds to a period of `domain / k` reciprocal units, which is
    // the real-space lattice repeat along this direction (in angstroms,
    // since q is in units of 2*pi/angstrom and the histogram already
    // carries that scale).
    let domain = 2.0 * params.maxdim;
    Some(domain / k as f64)
}

fn orthogonality_score(a: Vector3, b: Vector3, c: Vector3) -> f64 {
    a.normalize().dot(&b.normalize()).abs() + b.normalize().dot(&c.normalize()).abs() + a.normalize().dot(&c.normalize()).abs()
}

/// Approximate Niggli/Gruber-style reduction: re-express the basis by the
/// three shortest non-coplanar lattice vectors reachable by integer
/// combinations of the input triple within `[-2, 2]`, matching the
/// original's reduction to a canonical short-vector basis without
/// reproducing its full cell-type classification machinery.
fn reduce_basis(basis: Matrix3, tolerance: f64) -> Matrix3 {
    let columns: Vec<Vector3> = (0..3).map(|i| basis.column(i).into_owned()).collect();
    let mut candidates = Vec::new();
    for i in -2..=2i32 {
        for j in -2..=2i32 {
            for k in -2..=2i32 {
                if i == 0 && j == 0 && k == 0 {
                    continue;
                }
                let v = columns[0] * i as f64 + columns[1] * j as f64 + columns[2] * k as f64;
                candidates.push(v);
            }
        }
    }
    candidates.sort_by(|a, b| a.norm().partial_cmp(&b.norm()).unwrap());

    let mut chosen: Vec<Vector3> = Vec::new();
    for v in candidates {
        if chosen.len() == 3 {
            break;
        }
        let independent = match chosen.len() {
            0 => true,
            1 => (v.cross(&chosen[0])).norm() > tolerance,
            _ => {
                let trial = Matrix3::from_columns(&[chosen[0], chosen[1], v]);
                trial.determinant().abs() > tolerance
            }
        };
        if independent {
            chosen.push(v);
        }
    }
    if chosen.len() < 3 {
        return basis;
    }
    Matrix3::from_columns(&chosen)
}

/// Linear least-squares refinement of the `UB` matrix given peaks already
/// assigned integer Miller indices: solves `Q = UB * H` for `UB` via the
/// normal equations, the closed-form solution to the same residual the
/// batched refiner minimises iteratively.
fn refine_ub(qs: &[Vector3], hkls: &[Vector3]) -> Option<Matrix3> {
    if qs.len() < 3 {
        return None;
    }
    let mut hht = Matrix3::zeros();
    let mut qht = Matrix3::zeros();
    for (q, h) in qs.iter().zip(hkls) {
        hht += h * h.transpose();
        qht += q * h.transpose();
    }
    let hht_inv = hht.try_inverse()?;
    Some(qht * hht_inv)
}

/// Runs autoindexing against `peaks`, returning up to `n_solutions`
/// ranked candidate cells above `solution_cutoff`, deduplicated by
/// `unit_cell_equivalence_tolerance`.
pub fn autoindex(peaks: &[Peak3D], dataset: &DataSet, params: &IndexerParameters) -> Vec<RankedSolution> {
    let filtered = filter_peaks(peaks, dataset, params);
    if filtered.len() < 3 {
        return Vec::new();
    }
    let qs: Vec<Vector3> = filtered.iter().map(|(q, _)| *q).collect();

    let directions = sample_directions(params.n_vertices);
    let mut spacings: Vec<(Vector3, f64)> = directions
        .into_iter()
        .filter_map(|dir| candidate_spacing(&qs, dir, params).map(|s| (dir, s)))
        .collect();
    spacings.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    spacings.truncate(200.min(spacings.len()));

    let mut candidate_triples: Vec<Matrix3> = Vec::new();
    let limit = spacings.len().min(30);
    for i in 0..limit {
        for j in (i + 1)..limit {
            for k in (j + 1)..limit {
                let (da, sa) = spacings[i];
                let (db, sb) = spacings[j];
                let (dc, sc) = spacings[k];
                if orthogonality_score(da, db, dc) > 1.5 {
                    continue;
                }
                let basis = Matrix3::from_columns(&[da * sa, db * sb, dc * sc]);
                let volume = basis.determinant().abs();
                if volume < params.min_unit_cell_volume {
                    continue;
                }
                candidate_triples.push(reduce_basis(basis, params.niggli_tolerance));
                if candidate_triples.len() >= params.n_vertices.min(500) {
                    break;
                }
            }
        }
    }

    let mut solutions: Vec<RankedSolution> = Vec::new();
    for basis in candidate_triples {
        let mut cell = UnitCell::from_basis(basis, Matrix3::identity(), SpaceGroup::identity());
        let mut assigned_q = Vec::new();
        let mut assigned_hkl = Vec::new();
        for q in &qs {
            let (h, k, l, residual) = cell.hkl(*q);
            if residual <= params.indexing_tolerance {
                assigned_q.push(*q);
                assigned_hkl.push(Vector3::new(h.round(), k.round(), l.round()));
            }
        }
        let quality = 100.0 * assigned_q.len() as f64 / qs.len() as f64;
        if quality < params.solution_cutoff {
            continue;
        }
        if let Some(refined_ub) = refine_ub(&assigned_q, &assigned_hkl) {
            cell.orientation = Matrix3::identity();
            cell.basis = refined_ub
                .transpose()
                .try_inverse()
                .unwrap_or(cell.basis);
        }
        solutions.push((cell, quality));
    }

    solutions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
    let mut deduped: Vec<RankedSolution> = Vec::new();
    for (cell, quality) in solutions {
        if deduped
            .iter()
            .any(|(kept, _)| kept.is_similar(&cell, params.unit_cell_equivalence_tolerance * kept.character().a, 1.0))
        {
            continue;
        }
        deduped.push((cell, quality));
        if deduped.len() >= params.n_solutions {
            break;
        }
    }
    deduped
}

/// Returns the highest-quality solution in `solutions` whose characters
/// match `reference` within tolerance, if any.
pub fn good_solution(solutions: &[RankedSolution], reference: &UnitCell, len_tol: f64, ang_tol: f64) -> Option<RankedSolution> {
    solutions
        .iter()
        .filter(|(cell, _)| cell.is_similar(reference, len_tol, ang_tol))
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_directions_are_unit_length() {
        let dirs = sample_directions(200);
        for d in dirs {
            assert!((d.norm() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn reduce_basis_keeps_volume_sign_consistent() {
        let basis = Matrix3::new(10.0, 0.0, 0.0, 0.0, 12.0, 0.0, 0.0, 0.0, 14.0);
        let reduced = reduce_basis(basis, 1e-6);
        assert!(reduced.determinant().abs() > 0.0);
    }

    #[test]
    fn refine_ub_recovers_exact_linear_map() {
        let ub = Matrix3::new(0.1, 0.0, 0.0, 0.0, 0.09, 0.0, 0.0, 0.0, 0.08);
        let hkls = vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(1.0, 1.0, 1.0),
        ];
        let qs: Vec<Vector3> = hkls.iter().map(|h| ub * h).collect();
        let recovered = refine_ub(&qs, &hkls).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert!((recovered[(i, j)] - ub[(i, j)]).abs() < 1e-9);
            }
        }
    }
}
