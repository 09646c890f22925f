//! Unit cell: real-space basis, derived reciprocal basis, cell characters,
//! orientation and space group (component of `SPEC_FULL.md` §3).

use crate::geometry::{Matrix3, Vector3};
use crate::spacegroup::SpaceGroup;
use serde::{Deserialize, Serialize};

/// The six scalar lattice parameters, angles in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellCharacter {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl CellCharacter {
    pub fn volume(&self) -> f64 {
        let (alpha, beta, gamma) = (
            self.alpha.to_radians(),
            self.beta.to_radians(),
            self.gamma.to_radians(),
        );
        let cos_sum = alpha.cos().powi(2) + beta.cos().powi(2) + gamma.cos().powi(2);
        let term = 1.0 - cos_sum + 2.0 * alpha.cos() * beta.cos() * gamma.cos();
        self.a * self.b * self.c * term.max(0.0).sqrt()
    }
}

/// A unit cell: real-space basis `B` (rows are the real-space basis
/// vectors a, b, c in the lab frame, i.e. `B` such that `x_lab = U * B *
/// (u,v,w)^T` for fractional coordinates), its orientation `U`, the
/// derived reciprocal basis, cell characters, and space group.
///
/// Many peaks may share one `UnitCell` (by `CellId`, see
/// [`crate::experiment::handlers::UnitCellHandler`]); a peak's cell
/// reference can be swapped in O(1) by rewriting the id it stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitCell {
    /// Real-space basis matrix in the crystal frame (rows = a, b, c).
    pub basis: Matrix3,
    /// Orientation matrix mapping crystal frame to lab frame.
    pub orientation: Matrix3,
    pub space_group: SpaceGroup,
    pub indexed_by: Option<String>,
}

impl UnitCell {
    pub fn from_basis(basis: Matrix3, orientation: Matrix3, space_group: SpaceGroup) -> Self {
        Self {
            basis,
            orientation,
            space_group,
            indexed_by: None,
        }
    }

    /// Build from the six scalar characters, with identity orientation, by
    /// the standard crystallographic convention (a along x, b in the xy
    /// plane).
    pub fn from_character(character: CellCharacter, space_group: SpaceGroup) -> Self {
        let (alpha, beta, gamma) = (
            character.alpha.to_radians(),
            character.beta.to_radians(),
            character.gamma.to_radians(),
        );
        let a_vec = Vector3::new(character.a, 0.0, 0.0);
        let b_vec = Vector3::new(character.b * gamma.cos(), character.b * gamma.sin(), 0.0);
        let cx = character.c * beta.cos();
        let cy = character.c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
        let cz2 = character.c * character.c - cx * cx - cy * cy;
        let cz = cz2.max(0.0).sqrt();
        let c_vec = Vector3::new(cx, cy, cz);

        let basis = Matrix3::from_rows(&[a_vec.transpose(), b_vec.transpose(), c_vec.transpose()]);
        Self::from_basis(basis, Matrix3::identity(), space_group)
    }

    /// The `UB` matrix mapping fractional Miller indices to lab-frame q
    /// vectors: `q = U * B^{-T} * hkl` (reciprocal basis is `B^{-T}`).
    pub fn ub(&self) -> Matrix3 {
        self.orientation * self.reciprocal_basis()
    }

    pub fn reciprocal_basis(&self) -> Matrix3 {
        self.basis
            .transpose()
            .try_inverse()
            .expect("unit cell basis must be invertible")
    }

    pub fn character(&self) -> CellCharacter {
        let a = self.basis.row(0).transpose();
        let b = self.basis.row(1).transpose();
        let c = self.basis.row(2).transpose();
        let len_a = a.norm();
        let len_b = b.norm();
        let len_c = c.norm();
        let angle = |u: Vector3, v: Vector3| (u.dot(&v) / (u.norm() * v.norm())).clamp(-1.0, 1.0).acos().to_degrees();
        CellCharacter {
            a: len_a,
            b: len_b,
            c: len_c,
            alpha: angle(b, c),
            beta: angle(a, c),
            gamma: angle(a, b),
        }
    }

    pub fn volume(&self) -> f64 {
        self.basis.determinant().abs()
    }

    /// `q` (lab-frame, in units of 2*pi/length) to fractional Miller
    /// indices plus the residual distance to the nearest integer triple
    /// (the quantity the autoindexer/predictor threshold against
    /// `indexing_tolerance`).
    pub fn hkl(&self, q: Vector3) -> (f64, f64, f64, f64) {
        let ub_inv = self
            .ub()
            .try_inverse()
            .unwrap_or_else(Matrix3::identity);
        let hkl = ub_inv * q;
        let rounded = Vector3::new(hkl.x.round(), hkl.y.round(), hkl.z.round());
        let residual = (hkl - rounded).norm();
        (hkl.x, hkl.y, hkl.z, residual)
    }

    /// Whether this cell's characters match `other`'s within the given
    /// length (Å) and angle (degrees) tolerances, trying all 24 proper
    /// axis permutations/sign choices is out of scope: this compares the
    /// characters directly, as the original does for the common case of
    /// cells already reduced to the same setting.
    pub fn is_similar(&self, other: &UnitCell, len_tol: f64, ang_tol: f64) -> bool {
        let a = self.character();
        let b = other.character();
        (a.a - b.a).abs() < len_tol
            && (a.b - b.b).abs() < len_tol
            && (a.c - b.c).abs() < len_tol
            && (a.alpha - b.alpha).abs() < ang_tol
            && (a.beta - b.beta).abs() < ang_tol
            && (a.gamma - b.gamma).abs() < ang_tol
    }

    /// Candidate space groups compatible with this cell's metric symmetry.
    /// A cell with all angles ~90 degrees is compatible with (at least)
    /// P1, P-1 and the orthorhombic point groups; lower-symmetry cells are
    /// only compatible with P1/P-1.
    pub fn compatible_space_groups(&self, ang_tol: f64) -> Vec<SpaceGroup> {
        let c = self.character();
        let is_90 = |x: f64| (x - 90.0).abs() < ang_tol;
        let mut groups = vec![SpaceGroup::identity(), SpaceGroup::p_minus_1()];
        if is_90(c.alpha) && is_90(c.beta) && is_90(c.gamma) {
            groups.push(SpaceGroup::p212121());
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn orthorhombic(a: f64, b: f64, c: f64) -> UnitCell {
        UnitCell::from_character(
            CellCharacter { a, b, c, alpha: 90.0, beta: 90.0, gamma: 90.0 },
            SpaceGroup::p212121(),
        )
    }

    #[test]
    fn character_round_trips_through_basis() {
        let cell = orthorhombic(54.7, 58.6, 67.3);
        let c = cell.character();
        assert_relative_eq!(c.a, 54.7, epsilon = 1e-6);
        assert_relative_eq!(c.b, 58.6, epsilon = 1e-6);
        assert_relative_eq!(c.c, 67.3, epsilon = 1e-6);
        assert_relative_eq!(c.alpha, 90.0, epsilon = 1e-6);
    }

    #[test]
    fn hkl_recovers_integer_indices_for_exact_q() {
        let cell = orthorhombic(54.7, 58.6, 67.3);
        let hkl_in = Vector3::new(2.0, -12.0, -5.0);
        let q = cell.ub() * hkl_in;
        let (h, k, l, residual) = cell.hkl(q);
        assert_relative_eq!(h, 2.0, epsilon = 1e-6);
        assert_relative_eq!(k, -12.0, epsilon = 1e-6);
        assert_relative_eq!(l, -5.0, epsilon = 1e-6);
        assert!(residual < 1e-6);
    }

    #[test]
    fn is_similar_within_tolerance() {
        let a = orthorhombic(54.7, 58.6, 67.3);
        let b = orthorhombic(54.8, 58.5, 67.35);
        assert!(a.is_similar(&b, 1.0, 0.1));
        let c = orthorhombic(60.0, 58.6, 67.3);
        assert!(!a.is_similar(&c, 1.0, 0.1));
    }

    #[test]
    fn orthorhombic_cell_is_compatible_with_222() {
        let cell = orthorhombic(54.7, 58.6, 67.3);
        let groups = cell.compatible_space_groups(0.1);
        assert!(groups.iter().any(|g| g.symbol == "P 21 21 21"));
    }
}
