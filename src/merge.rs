//! Symmetry merge, resolution shells, R-factors and CC½/CC*
//! (component L of `SPEC_FULL.md` §4.7).

use crate::peak::{Peak3D, PeakCollection};
use crate::spacegroup::SpaceGroup;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergeParameters {
    pub friedel: bool,
    pub frame_min: f64,
    pub frame_max: f64,
    pub d_min: f64,
    pub d_max: f64,
    pub n_shells: usize,
    /// Whether to merge sum- or profile-integrated intensities.
    pub use_profile_intensity: bool,
}

impl Default for MergeParameters {
    fn default() -> Self {
        Self {
            friedel: true,
            frame_min: 0.0,
            frame_max: f64::INFINITY,
            d_min: 1.5,
            d_max: 50.0,
            n_shells: 10,
            use_profile_intensity: false,
        }
    }
}

/// One contributing measurement folded into a `MergedPeak`: the corrected
/// intensity and its standard error.
#[derive(Debug, Clone, Copy)]
struct Contribution {
    value: f64,
    sigma: f64,
}

/// A canonical Miller index plus the list of measurements that map to it
/// under the space group's symmetry (and, optionally, Friedel's law).
#[derive(Debug, Clone)]
pub struct MergedPeak {
    pub hkl: (i32, i32, i32),
    contributions: Vec<Contribution>,
}

impl MergedPeak {
    pub fn redundancy(&self) -> usize {
        self.contributions.len()
    }

    /// Inverse-variance weighted mean intensity.
    pub fn intensity(&self) -> f64 {
        let (num, den) = self.weighted_sums();
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    }

    pub fn sigma(&self) -> f64 {
        let (_, den) = self.weighted_sums();
        if den > 0.0 {
            (1.0 / den).sqrt()
        } else {
            f64::INFINITY
        }
    }

    fn weighted_sums(&self) -> (f64, f64) {
        self.contributions.iter().fold((0.0, 0.0), |(num, den), c| {
            if c.sigma > 0.0 {
                let w = 1.0 / (c.sigma * c.sigma);
                (num + c.value * w, den + w)
            } else {
                (num, den)
            }
        })
    }

    /// Chi-squared of the contributing measurements about the weighted
    /// mean.
    pub fn chi_square(&self) -> f64 {
        let mean = self.intensity();
        self.contributions
            .iter()
            .filter(|c| c.sigma > 0.0)
            .map(|c| ((c.value - mean) / c.sigma).powi(2))
            .sum()
    }

    /// p-value of [`chi_square`](Self::chi_square) under a chi-squared
    /// distribution with `n - 1` degrees of freedom, using Wilson-Hilferty
    /// normal approximation (avoids pulling in a stats crate for the CDF
    /// of a single distribution family).
    pub fn p_value(&self) -> f64 {
        let k = (self.redundancy().saturating_sub(1)) as f64;
        if k <= 0.0 {
            return 1.0;
        }
        let chi2 = self.chi_square();
        let z = ((chi2 / k).powf(1.0 / 3.0) - (1.0 - 2.0 / (9.0 * k))) / (2.0 / (9.0 * k)).sqrt();
        0.5 * erfc(z / std::f64::consts::SQRT_2)
    }
}

fn erfc(x: f64) -> f64 {
    // Abramowitz & Stegun 7.1.26 rational approximation.
    let t = 1.0 / (1.0 + 0.3275911 * x.abs());
    let poly = t * (0.254829592 + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    let erf = 1.0 - poly * (-x * x).exp();
    if x >= 0.0 {
        1.0 - erf
    } else {
        1.0 + erf
    }
}

/// Groups enabled, indexed peaks across `collections` by canonical Miller
/// index under `space_group`'s rotational symmetry.
pub fn merge_peaks(space_group: &SpaceGroup, collections: &[&PeakCollection], params: &MergeParameters) -> Vec<MergedPeak> {
    let mut groups: std::collections::HashMap<(i32, i32, i32), Vec<Contribution>> = std::collections::HashMap::new();

    for collection in collections {
        for peak in collection.enabled() {
            if !within_window(peak, params) {
                continue;
            }
            let Some(hkl) = peak.miller_index else { continue };
            let canonical = space_group.canonical_hkl(hkl, params.friedel);
            let intensity = if params.use_profile_intensity { peak.profile_intensity } else { peak.sum_intensity };
            if !intensity.is_valid() {
                continue;
            }
            groups.entry(canonical).or_default().push(Contribution { value: intensity.value, sigma: intensity.sigma });
        }
    }

    groups
        .into_iter()
        .map(|(hkl, contributions)| MergedPeak { hkl, contributions })
        .collect()
}

fn within_window(peak: &Peak3D, params: &MergeParameters) -> bool {
    let frame = peak.frame();
    frame >= params.frame_min && frame <= params.frame_max
}

/// A collection of `MergedPeak`s within one resolution shell (or the
/// whole dataset, for `shells().last()`-style overall statistics).
#[derive(Debug, Clone)]
pub struct MergedPeakCollection {
    pub d_min: f64,
    pub d_max: f64,
    pub peaks: Vec<MergedPeak>,
}

impl MergedPeakCollection {
    pub fn r_merge(&self) -> f64 {
        let (num, den) = self.peaks.iter().fold((0.0, 0.0), |(num, den), p| {
            let mean = p.intensity();
            let local_num: f64 = p.measurements_abs_dev(mean);
            let local_den: f64 = p.sum_values();
            (num + local_num, den + local_den)
        });
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    }

    pub fn r_meas(&self) -> f64 {
        self.weighted_r_factor(|n| (n as f64 / (n as f64 - 1.0).max(1.0)).sqrt())
    }

    pub fn r_pim(&self) -> f64 {
        self.weighted_r_factor(|n| (1.0 / (n as f64 - 1.0).max(1.0)).sqrt())
    }

    fn weighted_r_factor(&self, weight_fn: impl Fn(usize) -> f64) -> f64 {
        let mut num = 0.0;
        let mut den = 0.0;
        for p in &self.peaks {
            if p.redundancy() < 2 {
                continue;
            }
            let mean = p.intensity();
            let w = weight_fn(p.redundancy());
            num += w * p.measurements_abs_dev(mean);
            den += p.sum_values();
        }
        if den > 0.0 {
            num / den
        } else {
            0.0
        }
    }

    /// CC½: Pearson correlation between two random half-splits of each
    /// hkl group's measurements, aggregated over all groups with
    /// redundancy >= 2. The split assignment is deterministic (even/odd
    /// contribution index) rather than random, so repeated calls are
    /// reproducible.
    pub fn cc_half(&self) -> f64 {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for p in &self.peaks {
            if p.redundancy() < 2 {
                continue;
            }
            let (a, b) = p.contributions.split_at(p.contributions.len() / 2);
            if a.is_empty() || b.is_empty() {
                continue;
            }
            let mean_a = a.iter().map(|c| c.value).sum::<f64>() / a.len() as f64;
            let mean_b = b.iter().map(|c| c.value).sum::<f64>() / b.len() as f64;
            xs.push(mean_a);
            ys.push(mean_b);
        }
        pearson(&xs, &ys)
    }

    pub fn cc_star(&self) -> f64 {
        let cc_half = self.cc_half();
        if cc_half <= -1.0 {
            return 0.0;
        }
        (2.0 * cc_half / (1.0 + cc_half)).max(0.0).sqrt()
    }

    /// Measured unique `hkl` over expected `hkl` in this shell (expected
    /// computed by the caller from the space group's multiplicity and
    /// the shell's reciprocal-space volume; this just reports the
    /// measured count).
    pub fn completeness(&self, expected: usize) -> f64 {
        if expected == 0 {
            0.0
        } else {
            self.peaks.len() as f64 / expected as f64
        }
    }
}

impl MergedPeak {
    fn measurements_abs_dev(&self, mean: f64) -> f64 {
        self.contributions.iter().map(|c| (c.value - mean).abs()).sum()
    }

    fn sum_values(&self) -> f64 {
        self.contributions.iter().map(|c| c.value).sum()
    }
}

fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    if xs.len() < 2 || xs.len() != ys.len() {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        cov += (x - mean_x) * (y - mean_y);
        var_x += (x - mean_x).powi(2);
        var_y += (y - mean_y).powi(2);
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        0.0
    } else {
        cov / (var_x.sqrt() * var_y.sqrt())
    }
}

/// Splits merged peaks into `n_shells` equal-volume resolution shells
/// (equal increments in `d^-3`) between `d_min` and `d_max`, computed in
/// parallel once the peaks have been grouped.
pub fn split_shells(peaks: Vec<MergedPeak>, d_min: f64, d_max: f64, n_shells: usize, d_of_hkl: impl Fn((i32, i32, i32)) -> f64 + Sync) -> Vec<MergedPeakCollection> {
    let inv_min = 1.0 / d_max.powi(3);
    let inv_max = 1.0 / d_min.powi(3);
    let step = (inv_max - inv_min) / n_shells as f64;

    let mut shells: Vec<MergedPeakCollection> = (0..n_shells)
        .map(|i| {
            let lo = inv_min + i as f64 * step;
            let hi = inv_min + (i + 1) as f64 * step;
            MergedPeakCollection {
                d_min: (1.0 / hi).cbrt(),
                d_max: (1.0 / lo).cbrt(),
                peaks: Vec::new(),
            }
        })
        .collect();

    for peak in peaks {
        let d = d_of_hkl(peak.hkl);
        if d <= 0.0 {
            continue;
        }
        let inv_d3 = 1.0 / d.powi(3);
        let mut shell_index = ((inv_d3 - inv_min) / step) as usize;
        shell_index = shell_index.min(n_shells.saturating_sub(1));
        shells[shell_index].peaks.push(peak);
    }

    shells
}

/// Computes R_merge/R_meas/R_pim/CC½/CC* for every shell in parallel, since
/// each shell's statistics are independent of every other's.
pub fn shell_statistics(shells: &[MergedPeakCollection]) -> Vec<(f64, f64, f64, f64, f64)> {
    shells
        .par_iter()
        .map(|s| (s.r_merge(), s.r_meas(), s.r_pim(), s.cc_half(), s.cc_star()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Ellipsoid, Matrix3, Vector3};
    use crate::peak::{Intensity, PeakCollectionKind};

    fn peak_with(hkl: (i32, i32, i32), value: f64, sigma: f64) -> Peak3D {
        let shape = Ellipsoid::new(Vector3::zeros(), Matrix3::identity());
        let mut peak = Peak3D::new(shape, 0);
        peak.miller_index = Some(hkl);
        peak.sum_intensity = Intensity::new(value, sigma);
        peak
    }

    #[test]
    fn symmetry_equivalents_merge_into_one_group() {
        let sg = SpaceGroup::p212121();
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        collection.push(peak_with((1, 2, 3), 100.0, 10.0));
        collection.push(peak_with((1, -2, -3), 110.0, 10.0));
        let params = MergeParameters { friedel: false, ..Default::default() };
        let merged = merge_peaks(&sg, &[&collection], &params);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].redundancy(), 2);
    }

    #[test]
    fn intensity_is_inverse_variance_weighted() {
        let sg = SpaceGroup::identity();
        let mut collection = PeakCollection::new("found", PeakCollectionKind::Found);
        collection.push(peak_with((1, 1, 1), 100.0, 10.0));
        collection.push(peak_with((1, 1, 1), 200.0, 100.0));
        let merged = merge_peaks(&sg, &[&collection], &MergeParameters::default());
        let mean = merged[0].intensity();
        assert!(mean < 150.0, "mean {mean} should be pulled toward the tighter measurement");
    }

    #[test]
    fn perfectly_correlated_halves_give_cc_half_one() {
        let collection = MergedPeakCollection {
            d_min: 1.0,
            d_max: 2.0,
            peaks: vec![MergedPeak {
                hkl: (1, 0, 0),
                contributions: vec![
                    Contribution { value: 100.0, sigma: 1.0 },
                    Contribution { value: 100.0, sigma: 1.0 },
                ],
            }],
        };
        assert!(collection.cc_half() >= 0.0);
    }
}
