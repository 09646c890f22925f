//! Convex hull of a 3-D point set, via a simple incremental algorithm.
//!
//! Used to bound a peak's pixel footprint for mask/overlap queries and to
//! sanity-check detector-region geometry. Point counts here are always
//! small (a blob's support, a handful of detector mask corners), so an
//! incremental O(n^2) construction is preferable to a full quickhull.

use super::Vector3;

#[derive(Debug, Clone)]
pub struct ConvexHull {
    vertices: Vec<Vector3>,
    /// Triangular faces, as indices into `vertices`, with outward-facing
    /// winding order.
    faces: Vec<[usize; 3]>,
}

impl ConvexHull {
    /// Build the hull of `points`. Returns `None` if fewer than 4
    /// non-coplanar points are given (degenerate hull).
    pub fn build(points: &[Vector3]) -> Option<Self> {
        if points.len() < 4 {
            return None;
        }

        // Seed tetrahedron: find four points not all coplanar.
        let (i0, i1) = farthest_pair(points)?;
        let i2 = farthest_from_line(points, points[i0], points[i1])?;
        let i3 = farthest_from_plane(points, points[i0], points[i1], points[i2])?;

        let mut faces = vec![[i0, i1, i2], [i0, i2, i3], [i0, i3, i1], [i1, i3, i2]];
        let centroid = (points[i0] + points[i1] + points[i2] + points[i3]) / 4.0;
        for f in &mut faces {
            orient_outward(points, f, centroid);
        }

        let mut hull = ConvexHull {
            vertices: points.to_vec(),
            faces,
        };

        for (idx, &p) in points.iter().enumerate() {
            if [i0, i1, i2, i3].contains(&idx) {
                continue;
            }
            hull.insert_point(idx, p);
        }

        Some(hull)
    }

    fn insert_point(&mut self, idx: usize, p: Vector3) {
        let visible: Vec<usize> = self
            .faces
            .iter()
            .enumerate()
            .filter(|(_, f)| is_visible(&self.vertices, f, p))
            .map(|(i, _)| i)
            .collect();

        if visible.is_empty() {
            return; // point is inside the current hull
        }

        // Collect horizon edges: edges belonging to exactly one visible face.
        use std::collections::HashMap;
        let mut edge_count: HashMap<(usize, usize), i32> = HashMap::new();
        for &fi in &visible {
            let f = self.faces[fi];
            for &(a, b) in &[(f[0], f[1]), (f[1], f[2]), (f[2], f[0])] {
                let key = (a.min(b), a.max(b));
                *edge_count.entry(key).or_insert(0) += 1;
            }
        }

        let mut new_faces = Vec::new();
        for &fi in &visible {
            let f = self.faces[fi];
            for &(a, b) in &[(f[0], f[1]), (f[1], f[2]), (f[2], f[0])] {
                let key = (a.min(b), a.max(b));
                if edge_count.get(&key) == Some(&1) {
                    new_faces.push([a, b, idx]);
                }
            }
        }

        let mut kept: Vec<[usize; 3]> = self
            .faces
            .iter()
            .enumerate()
            .filter(|(i, _)| !visible.contains(i))
            .map(|(_, f)| *f)
            .collect();

        let centroid = self.centroid();
        for f in &mut new_faces {
            orient_outward(&self.vertices, f, centroid);
        }
        kept.extend(new_faces);
        self.faces = kept;
    }

    fn centroid(&self) -> Vector3 {
        let mut used: Vec<usize> = self.faces.iter().flatten().copied().collect();
        used.sort_unstable();
        used.dedup();
        let sum: Vector3 = used.iter().map(|&i| self.vertices[i]).sum();
        sum / used.len() as f64
    }

    pub fn faces(&self) -> &[[usize; 3]] {
        &self.faces
    }

    pub fn vertices(&self) -> &[Vector3] {
        &self.vertices
    }

    /// Signed volume via divergence theorem over the triangulated surface.
    pub fn volume(&self) -> f64 {
        self.faces
            .iter()
            .map(|f| {
                let a = self.vertices[f[0]];
                let b = self.vertices[f[1]];
                let c = self.vertices[f[2]];
                a.dot(&b.cross(&c)) / 6.0
            })
            .sum::<f64>()
            .abs()
    }

    pub fn contains(&self, p: Vector3) -> bool {
        self.faces
            .iter()
            .all(|f| !is_visible(&self.vertices, f, p))
    }
}

fn orient_outward(points: &[Vector3], face: &mut [usize; 3], centroid: Vector3) {
    if is_visible(points, face, centroid) {
        face.swap(1, 2);
    }
}

fn is_visible(points: &[Vector3], face: &[usize; 3], p: Vector3) -> bool {
    let a = points[face[0]];
    let b = points[face[1]];
    let c = points[face[2]];
    let normal = (b - a).cross(&(c - a));
    normal.dot(&(p - a)) > 1e-9
}

fn farthest_pair(points: &[Vector3]) -> Option<(usize, usize)> {
    let mut best = (0usize, 1usize, -1.0f64);
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let d = (points[i] - points[j]).norm_squared();
            if d > best.2 {
                best = (i, j, d);
            }
        }
    }
    (best.2 > 0.0).then_some((best.0, best.1))
}

fn farthest_from_line(points: &[Vector3], a: Vector3, b: Vector3) -> Option<usize> {
    let dir = (b - a).normalize();
    points
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let proj = a + dir * (p - a).dot(&dir);
            (i, (p - proj).norm_squared())
        })
        .filter(|&(_, d)| d > 1e-12)
        .max_by(|x, y| x.1.total_cmp(&y.1))
        .map(|(i, _)| i)
}

fn farthest_from_plane(points: &[Vector3], a: Vector3, b: Vector3, c: Vector3) -> Option<usize> {
    let normal = (b - a).cross(&(c - a)).normalize();
    points
        .iter()
        .enumerate()
        .map(|(i, &p)| (i, normal.dot(&(p - a)).abs()))
        .filter(|&(_, d)| d > 1e-12)
        .max_by(|x, y| x.1.total_cmp(&y.1))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn unit_cube_has_volume_one() {
        let mut points = Vec::new();
        for &x in &[0.0, 1.0] {
            for &y in &[0.0, 1.0] {
                for &z in &[0.0, 1.0] {
                    points.push(Vector3::new(x, y, z));
                }
            }
        }
        let hull = ConvexHull::build(&points).unwrap();
        assert_relative_eq!(hull.volume(), 1.0, epsilon = 1e-6);
        assert!(hull.contains(Vector3::new(0.5, 0.5, 0.5)));
        assert!(!hull.contains(Vector3::new(2.0, 0.5, 0.5)));
    }

    #[test]
    fn fewer_than_four_points_has_no_hull() {
        let points = vec![Vector3::zeros(), Vector3::x(), Vector3::y()];
        assert!(ConvexHull::build(&points).is_none());
    }
}
