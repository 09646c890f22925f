//! The integrator family: pixel-sum, Gaussian, I/sigma, 1-D and 3-D
//! profile fit, and shape-only accumulation (component H of
//! `SPEC_FULL.md` §4.6).

use super::region::IntegrationRegion;
use crate::peak::{Intensity, RejectionFlag};
use crate::shape::Profile;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorType {
    PixelSum,
    Gaussian,
    ISigma,
    Profile1D,
    Profile3D,
    Shape,
}

/// Closed sum type for the integrator family (`SPEC_FULL.md` §9 redesign:
/// replaces the original's `IIntegrator` virtual-dispatch hierarchy).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum IntegratorKind {
    PixelSum { discard_saturated: bool, max_counts: u32 },
    Gaussian,
    ISigma { max_radius_steps: usize },
    Profile1D,
    Profile3D,
    Shape,
}

#[derive(Debug, Clone, Default)]
pub struct ComputeResult {
    pub flag: RejectionFlag,
    pub sum_intensity: Intensity,
    pub profile_intensity: Intensity,
    pub sum_background: f64,
    pub profile_background: f64,
    pub bkg_gradient: f64,
    pub rocking_curve: Vec<f64>,
    pub integrator_type: Option<IntegratorType>,
}

impl Default for IntegratorType {
    fn default() -> Self {
        IntegratorType::PixelSum
    }
}

impl IntegratorKind {
    pub fn integrator_type(&self) -> IntegratorType {
        match self {
            IntegratorKind::PixelSum { .. } => IntegratorType::PixelSum,
            IntegratorKind::Gaussian => IntegratorType::Gaussian,
            IntegratorKind::ISigma { .. } => IntegratorType::ISigma,
            IntegratorKind::Profile1D => IntegratorType::Profile1D,
            IntegratorKind::Profile3D => IntegratorType::Profile3D,
            IntegratorKind::Shape => IntegratorType::Shape,
        }
    }

    pub fn compute(&self, region: &IntegrationRegion, profile: Option<&Profile>) -> ComputeResult {
        match self {
            IntegratorKind::PixelSum { discard_saturated, max_counts } => {
                pixel_sum(region, *discard_saturated, *max_counts)
            }
            IntegratorKind::Gaussian => gaussian(region),
            IntegratorKind::ISigma { max_radius_steps } => isigma(region, *max_radius_steps),
            IntegratorKind::Profile3D => profile_fit(region, profile, true),
            IntegratorKind::Profile1D => profile_fit(region, profile, false),
            IntegratorKind::Shape => shape_only(region),
        }
    }
}

fn rocking_curve(region: &IntegrationRegion) -> Vec<f64> {
    let mut by_frame: std::collections::BTreeMap<i64, f64> = std::collections::BTreeMap::new();
    for event in region.data.peak_events() {
        *by_frame.entry(event.frame.round() as i64).or_insert(0.0) += event.count as f64;
    }
    by_frame.into_values().collect()
}

fn pixel_sum(region: &IntegrationRegion, discard_saturated: bool, max_counts: u32) -> ComputeResult {
    let mut result = ComputeResult { integrator_type: Some(IntegratorType::PixelSum), ..Default::default() };

    if discard_saturated && region.max_count() > max_counts {
        result.flag = RejectionFlag::SaturatedPixel;
        return result;
    }

    let bkg_counts: Vec<f64> = region.data.background_events().map(|e| e.count as f64).collect();
    let n_bkg = bkg_counts.len() as f64;
    if n_bkg == 0.0 {
        result.flag = RejectionFlag::TooFewPoints;
        return result;
    }
    let mean_bkg = bkg_counts.iter().sum::<f64>() / n_bkg;
    let var_bkg = mean_bkg; // Poisson

    let peak_counts: Vec<f64> = region.data.peak_events().map(|e| e.count as f64).collect();
    let n_peak = peak_counts.len() as f64;
    if n_peak == 0.0 {
        result.flag = RejectionFlag::TooFewPoints;
        return result;
    }
    let sum_peak: f64 = peak_counts.iter().sum();
    let value = sum_peak - n_peak * mean_bkg;
    let variance = sum_peak + n_peak * n_peak * var_bkg;

    result.sum_intensity = Intensity::new(value, variance.max(0.0).sqrt());
    result.sum_background = mean_bkg;
    if !result.sum_intensity.is_valid() {
        result.flag = RejectionFlag::InvalidSigma;
    }
    result.rocking_curve = rocking_curve(region);
    result
}

fn gaussian(region: &IntegrationRegion) -> ComputeResult {
    // Closed-form background/intensity iteration shared with the profile
    // fit, using a unit-amplitude Gaussian evaluated at each event in
    // place of a learned profile.
    let predicted = |dx: f64, dy: f64, dz: f64| (-0.5 * (dx * dx + dy * dy + dz * dz)).exp();
    iterate_profile_fit(region, |e| {
        let dx = e.px - region.peak_shape.center().x;
        let dy = e.py - region.peak_shape.center().y;
        let dz = e.frame - region.peak_shape.center().z;
        predicted(dx, dy, dz)
    }, IntegratorType::Gaussian)
}

fn shape_only(region: &IntegrationRegion) -> ComputeResult {
    ComputeResult {
        integrator_type: Some(IntegratorType::Shape),
        rocking_curve: rocking_curve(region),
        ..Default::default()
    }
}

fn isigma(region: &IntegrationRegion, max_radius_steps: usize) -> ComputeResult {
    let base = pixel_sum(region, false, u32::MAX);
    if base.flag != RejectionFlag::NotRejected {
        return ComputeResult { integrator_type: Some(IntegratorType::ISigma), ..base };
    }

    let center = region.peak_shape.center();
    let mut best_ratio = 0.0;
    let mut best_score = f64::INFINITY;
    for step in 1..=max_radius_steps {
        let radius = step as f64 / max_radius_steps as f64;
        let mut observed = 0.0;
        let mut profile_sum = 0.0;
        for e in region.data.peak_events() {
            let d = ((e.px - center.x).powi(2) + (e.py - center.y).powi(2) + (e.frame - center.z).powi(2)).sqrt();
            if d <= radius * 10.0 {
                observed += e.count as f64 - base.sum_background;
                profile_sum += 1.0;
            }
        }
        if observed <= 0.0 || profile_sum <= 0.0 {
            continue;
        }
        let sigma_i = observed.abs().sqrt();
        let sigma_p = profile_sum.sqrt();
        let score = (sigma_i / observed).powi(2) + (sigma_p / profile_sum).powi(2);
        if score < best_score {
            best_score = score;
            best_ratio = observed / profile_sum;
        }
    }

    ComputeResult {
        flag: if best_score.is_finite() { RejectionFlag::NotRejected } else { RejectionFlag::TooFewPoints },
        sum_intensity: base.sum_intensity,
        profile_intensity: Intensity::new(best_ratio, best_score.max(0.0).sqrt()),
        sum_background: base.sum_background,
        integrator_type: Some(IntegratorType::ISigma),
        rocking_curve: base.rocking_curve,
        ..Default::default()
    }
}

fn profile_fit(region: &IntegrationRegion, profile: Option<&Profile>, three_d: bool) -> ComputeResult {
    let integrator_type = if three_d { IntegratorType::Profile3D } else { IntegratorType::Profile1D };
    let n_events = region.data.peak_events().count();
    if n_events < 29 || profile.is_none() {
        return ComputeResult { flag: RejectionFlag::NoProfile, integrator_type: Some(integrator_type), ..Default::default() };
    }
    let profile = profile.unwrap();
    let normalized = profile.normalized();
    let center = region.peak_shape.center();

    iterate_profile_fit(
        region,
        |e| {
            if three_d {
                let dx = ((e.px - center.x) / 10.0 + 0.5).clamp(0.0, 0.999);
                let dy = ((e.py - center.y) / 10.0 + 0.5).clamp(0.0, 0.999);
                let dz = ((e.frame - center.z) / 10.0 + 0.5).clamp(0.0, 0.999);
                let ix = (dx * profile.nbins_x as f64) as usize;
                let iy = (dy * profile.nbins_y as f64) as usize;
                let iz = (dz * profile.nbins_z as f64) as usize;
                let idx = (iz.min(profile.nbins_z - 1) * profile.nbins_y + iy.min(profile.nbins_y - 1)) * profile.nbins_x
                    + ix.min(profile.nbins_x - 1);
                normalized.get(idx).copied().unwrap_or(0.0)
            } else {
                let d = ((e.px - center.x).powi(2) + (e.py - center.y).powi(2) + (e.frame - center.z).powi(2)).sqrt();
                let bin = (d * profile.radial.len() as f64 / 10.0) as usize;
                profile.radial.get(bin.min(profile.radial.len() - 1)).copied().unwrap_or(0.0)
            }
        },
        integrator_type,
    )
}

/// Reweighted least squares for the 2x2 system `(B, I)` given observed
/// counts `M_i` and predicted profile values `p_i`, with per-event
/// variance `v_i = B + I * p_i`. Stops at 20 iterations or when the
/// relative change in `I` drops below `1e-5`.
fn iterate_profile_fit(region: &IntegrationRegion, predicted: impl Fn(&super::region::Event) -> f64, integrator_type: IntegratorType) -> ComputeResult {
    let events: Vec<&super::region::Event> = region.data.peak_events().collect();
    if events.len() < 29 {
        return ComputeResult { flag: RejectionFlag::TooFewPoints, integrator_type: Some(integrator_type), ..Default::default() };
    }
    let p: Vec<f64> = events.iter().map(|e| predicted(e)).collect();
    let m: Vec<f64> = events.iter().map(|e| e.count as f64).collect();

    let mut background = m.iter().sum::<f64>() / m.len() as f64;
    let mut intensity = (m.iter().sum::<f64>() - background * m.len() as f64).max(0.0);

    for _ in 0..20 {
        let mut a11 = 0.0;
        let mut a12 = 0.0;
        let mut a22 = 0.0;
        let mut b1 = 0.0;
        let mut b2 = 0.0;
        for (mi, pi) in m.iter().zip(&p) {
            let v = (background + intensity * pi).max(1e-6);
            a11 += 1.0 / v;
            a12 += pi / v;
            a22 += pi * pi / v;
            b1 += mi / v;
            b2 += mi * pi / v;
        }
        let det = a11 * a22 - a12 * a12;
        if det.abs() < 1e-12 {
            break;
        }
        let new_background = (a22 * b1 - a12 * b2) / det;
        let new_intensity = (a11 * b2 - a12 * b1) / det;
        let relative_change = if intensity.abs() > 1e-12 { ((new_intensity - intensity) / intensity).abs() } else { 1.0 };
        background = new_background;
        intensity = new_intensity;
        if relative_change < 1e-5 {
            break;
        }
    }

    let mut a11 = 0.0;
    let mut a12 = 0.0;
    let mut a22 = 0.0;
    for pi in &p {
        let v = (background + intensity * pi).max(1e-6);
        a11 += 1.0 / v;
        a12 += pi / v;
        a22 += pi * pi / v;
    }
    let det = a11 * a22 - a12 * a12;
    let sigma_i = if det.abs() > 1e-12 { (a11 / det).max(0.0).sqrt() } else { f64::INFINITY };

    let flag = if !intensity.is_finite() || !sigma_i.is_finite() || sigma_i <= 0.0 {
        RejectionFlag::InvalidSigma
    } else {
        RejectionFlag::NotRejected
    };

    ComputeResult {
        flag,
        profile_intensity: Intensity::new(intensity, sigma_i),
        profile_background: background,
        integrator_type: Some(integrator_type),
        rocking_curve: rocking_curve(region),
        ..Default::default()
    }
}
