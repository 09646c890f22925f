//! A minimal space-group table.
//!
//! `spec.md` §1 treats the full isotope/space-group database as an external
//! black-box service; this module implements just the *operations* the
//! reduction pipeline needs (`spec.md` §4.7, §3 UnitCell) against a small
//! built-in table covering the space groups exercised by the test
//! scenarios in `spec.md` §8 (triclinic through orthorhombic, including
//! P2₁2₁2₁).

use crate::geometry::Matrix3;
use serde::{Deserialize, Serialize};

/// A symmetry operator's rotational part (the translational part does not
/// affect reciprocal-space indexing, since `h' = h . R` for a rotation `R`
/// is unaffected by any translation component of the operator).
pub type SymOp = Matrix3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceGroup {
    pub symbol: String,
    pub operators: Vec<SymOp>,
    /// Whether the group is centrosymmetric (Friedel's law always holds
    /// physically; this flags whether the group's rotational part already
    /// includes the inversion, so merging with `friedel=true` would be a
    /// no-op on top of the group operators).
    pub centrosymmetric: bool,
}

fn rot(rows: [[f64; 3]; 3]) -> SymOp {
    Matrix3::new(
        rows[0][0], rows[0][1], rows[0][2],
        rows[1][0], rows[1][1], rows[1][2],
        rows[2][0], rows[2][1], rows[2][2],
    )
}

impl SpaceGroup {
    pub fn identity() -> Self {
        Self {
            symbol: "P 1".to_string(),
            operators: vec![Matrix3::identity()],
            centrosymmetric: false,
        }
    }

    /// `P -1`: identity and inversion.
    pub fn p_minus_1() -> Self {
        Self {
            symbol: "P -1".to_string(),
            operators: vec![Matrix3::identity(), -Matrix3::identity()],
            centrosymmetric: true,
        }
    }

    /// `P 2₁ 2₁ 2₁`: the orthorhombic space group used by `spec.md` §8's
    /// trypsin scenario. Point group 222: identity plus the three
    /// 2-fold rotations about a, b, c.
    pub fn p212121() -> Self {
        let c2x = rot([[1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, -1.0]]);
        let c2y = rot([[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]]);
        let c2z = rot([[-1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, 1.0]]);
        Self {
            symbol: "P 21 21 21".to_string(),
            operators: vec![Matrix3::identity(), c2x, c2y, c2z],
            centrosymmetric: false,
        }
    }

    pub fn by_symbol(symbol: &str) -> Option<Self> {
        let normalized = symbol.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.as_str() {
            "P 1" => Some(Self::identity()),
            "P -1" => Some(Self::p_minus_1()),
            "P 21 21 21" | "P 2₁ 2₁ 2₁" => Some(Self::p212121()),
            _ => None,
        }
    }

    /// Reduce `(h,k,l)` to the canonical representative of its orbit under
    /// the group's rotational part, optionally including Friedel's law
    /// (`-1`). Used by the merger (`spec.md` §4.7) to group
    /// symmetry-equivalent reflections.
    pub fn canonical_hkl(&self, hkl: (i32, i32, i32), friedel: bool) -> (i32, i32, i32) {
        let mut ops: Vec<SymOp> = self.operators.clone();
        if friedel && !self.centrosymmetric {
            let extra: Vec<SymOp> = self.operators.iter().map(|o| -o).collect();
            ops.extend(extra);
        }

        let v = nalgebra::Vector3::new(hkl.0 as f64, hkl.1 as f64, hkl.2 as f64);
        ops.iter()
            .map(|op| {
                let r = op * v;
                (
                    r.x.round() as i32,
                    r.y.round() as i32,
                    r.z.round() as i32,
                )
            })
            .min()
            .unwrap_or(hkl)
    }

    pub fn multiplicity(&self, friedel: bool) -> usize {
        let base = self.operators.len();
        if friedel && !self.centrosymmetric {
            base * 2
        } else {
            base
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p1_canonical_is_identity() {
        let sg = SpaceGroup::identity();
        assert_eq!(sg.canonical_hkl((1, 2, 3), false), (1, 2, 3));
    }

    #[test]
    fn friedel_pairs_collapse_to_one_canonical() {
        let sg = SpaceGroup::identity();
        let a = sg.canonical_hkl((1, 2, 3), true);
        let b = sg.canonical_hkl((-1, -2, -3), true);
        assert_eq!(a, b);
    }

    #[test]
    fn p212121_symmetry_equivalents_collapse() {
        let sg = SpaceGroup::p212121();
        let a = sg.canonical_hkl((1, 2, 3), false);
        let b = sg.canonical_hkl((1, -2, -3), false);
        let c = sg.canonical_hkl((-1, 2, -3), false);
        let d = sg.canonical_hkl((-1, -2, 3), false);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
    }

    #[test]
    fn unknown_symbol_returns_none() {
        assert!(SpaceGroup::by_symbol("Fm-3m").is_none());
    }
}
