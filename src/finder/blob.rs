//! 3-D connected-component blob tracking across a frame stack
//! (`SPEC_FULL.md` §4.1).

use crate::geometry::{Aabb3, Matrix3, Vector3};

/// A disjoint-set forest used both for per-frame 2-D labelling and for
/// closing cross-frame blob equivalences at the end of each frame.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            self.parent[x] = self.find(self.parent[x]);
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra] = rb;
        }
    }
}

/// Running first+second moments of a blob's weighted pixel positions,
/// accumulated incrementally as 2-D per-frame components are merged into
/// it. `(px, py, frame)` is the coordinate triple; weights are raw pixel
/// counts.
#[derive(Debug, Clone, Copy)]
pub struct Blob3D {
    pub n: f64,
    sum: Vector3,
    sum2: Matrix3,
    pub min_frame: i64,
    pub max_frame: i64,
    pub pixel_count: usize,
}

impl Blob3D {
    fn empty() -> Self {
        Self {
            n: 0.0,
            sum: Vector3::zeros(),
            sum2: Matrix3::zeros(),
            min_frame: i64::MAX,
            max_frame: i64::MIN,
            pixel_count: 0,
        }
    }

    fn add_pixel(&mut self, px: f64, py: f64, frame: i64, weight: f64) {
        let p = Vector3::new(px, py, frame as f64);
        self.n += weight;
        self.sum += p * weight;
        self.sum2 += p * p.transpose() * weight;
        self.min_frame = self.min_frame.min(frame);
        self.max_frame = self.max_frame.max(frame);
        self.pixel_count += 1;
    }

    fn merge(&mut self, other: &Blob3D) {
        self.n += other.n;
        self.sum += other.sum;
        self.sum2 += other.sum2;
        self.min_frame = self.min_frame.min(other.min_frame);
        self.max_frame = self.max_frame.max(other.max_frame);
        self.pixel_count += other.pixel_count;
    }

    pub fn mean(&self) -> Vector3 {
        if self.n > 0.0 {
            self.sum / self.n
        } else {
            Vector3::zeros()
        }
    }

    /// Sample covariance of the weighted pixel distribution, `E[xx^T] -
    /// mean mean^T`.
    pub fn covariance(&self) -> Matrix3 {
        if self.n <= 0.0 {
            return Matrix3::zeros();
        }
        let mean = self.mean();
        self.sum2 / self.n - mean * mean.transpose()
    }

    pub fn frame_span(&self) -> i64 {
        if self.max_frame >= self.min_frame {
            self.max_frame - self.min_frame + 1
        } else {
            0
        }
    }

    pub fn aabb(&self) -> Aabb3 {
        let cov = self.covariance();
        let half = Vector3::new(cov[(0, 0)].sqrt().max(0.5), cov[(1, 1)].sqrt().max(0.5), 0.5);
        let mean = self.mean();
        Aabb3::new(mean - half, mean + half)
    }
}

/// Label the pixels of one filtered frame exceeding `threshold`, using
/// 4-connectivity, and fold each labelled component's raw-count moments
/// into a fresh per-frame [`Blob3D`].
fn label_frame(response: &[f64], counts: &[u32], nrows: usize, ncols: usize, frame: i64, threshold: f64) -> Vec<Blob3D> {
    let mut labels = vec![-1i32; nrows * ncols];
    let mut uf = UnionFind::new(nrows * ncols);

    for y in 0..nrows {
        for x in 0..ncols {
            let idx = y * ncols + x;
            if response[idx] <= threshold {
                continue;
            }
            labels[idx] = 1;
            if x > 0 && response[idx - 1] > threshold {
                uf.union(idx, idx - 1);
            }
            if y > 0 && response[idx - ncols] > threshold {
                uf.union(idx, idx - ncols);
            }
        }
    }

    let mut blobs: std::collections::HashMap<usize, Blob3D> = std::collections::HashMap::new();
    for y in 0..nrows {
        for x in 0..ncols {
            let idx = y * ncols + x;
            if labels[idx] < 0 {
                continue;
            }
            let root = uf.find(idx);
            let blob = blobs.entry(root).or_insert_with(Blob3D::empty);
            blob.add_pixel(x as f64, y as f64, frame, counts[idx] as f64);
        }
    }
    blobs.into_values().collect()
}

/// Builds the 3-D blobs across `frames`/`responses` (one filtered
/// response buffer per frame, matching the order of `raw_counts`),
/// merging per-frame 2-D components into running blobs whenever
/// consecutive frames' bounding boxes overlap. Equivalences close
/// transitively within a frame (`spec.md` §4.1 step 3): if one frame
/// blob's bounding box bridges two previously-disjoint running blobs,
/// all three are unified into a single blob rather than the bridge
/// being claimed by only one side.
pub fn track_blobs(
    responses: &[Vec<f64>],
    raw_counts: &[&[u32]],
    nrows: usize,
    ncols: usize,
    first_frame: i64,
    threshold: f64,
) -> Vec<Blob3D> {
    let mut running: Vec<Blob3D> = Vec::new();

    for (offset, (response, counts)) in responses.iter().zip(raw_counts.iter()).enumerate() {
        let frame = first_frame + offset as i64;
        let frame_blobs = label_frame(response, counts, nrows, ncols, frame, threshold);

        // Which running blobs each frame blob's bounding box overlaps.
        let mut claims: Vec<Vec<usize>> = vec![Vec::new(); frame_blobs.len()];
        for (ri, running_blob) in running.iter().enumerate() {
            let prev_aabb = running_blob.aabb();
            for (fi, fb) in frame_blobs.iter().enumerate() {
                if prev_aabb.overlaps_2d(&fb.aabb()) {
                    claims[fi].push(ri);
                }
            }
        }

        // Union running blobs that share a frame-blob bridge, closing
        // the equivalence transitively before any merge happens.
        let mut uf = UnionFind::new(running.len());
        for group in &claims {
            for pair in group.windows(2) {
                uf.union(pair[0], pair[1]);
            }
        }

        let mut groups: std::collections::HashMap<usize, Vec<usize>> = std::collections::HashMap::new();
        for ri in 0..running.len() {
            groups.entry(uf.find(ri)).or_default().push(ri);
        }

        let mut claimed = vec![false; frame_blobs.len()];
        let mut new_running = Vec::with_capacity(groups.len());
        for members in groups.into_values() {
            let mut merged = running[members[0]];
            for &m in &members[1..] {
                merged.merge(&running[m]);
            }
            let root = uf.find(members[0]);
            for (fi, claim_list) in claims.iter().enumerate() {
                if claim_list.iter().any(|&ri| uf.find(ri) == root) {
                    merged.merge(&frame_blobs[fi]);
                    claimed[fi] = true;
                }
            }
            new_running.push(merged);
        }
        for (fi, fb) in frame_blobs.into_iter().enumerate() {
            if !claimed[fi] {
                new_running.push(fb);
            }
        }
        running = new_running;
    }

    running
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_bright_spot(nrows: usize, ncols: usize, cx: usize, cy: usize) -> (Vec<f64>, Vec<u32>) {
        let mut response = vec![0.0; nrows * ncols];
        let mut counts = vec![0u32; nrows * ncols];
        for dy in -1i64..=1 {
            for dx in -1i64..=1 {
                let x = (cx as i64 + dx) as usize;
                let y = (cy as i64 + dy) as usize;
                response[y * ncols + x] = 10.0;
                counts[y * ncols + x] = 50;
            }
        }
        (response, counts)
    }

    #[test]
    fn single_frame_spot_is_one_blob() {
        let (response, counts) = single_bright_spot(20, 20, 10, 10);
        let blobs = track_blobs(&[response], &[&counts], 20, 20, 0, 1.0);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].pixel_count, 9);
    }

    #[test]
    fn overlapping_spots_across_frames_merge() {
        let (r0, c0) = single_bright_spot(20, 20, 10, 10);
        let (r1, c1) = single_bright_spot(20, 20, 10, 10);
        let blobs = track_blobs(&[r0, r1], &[&c0, &c1], 20, 20, 0, 1.0);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].frame_span(), 2);
    }

    #[test]
    fn disjoint_spots_across_frames_stay_separate() {
        let (r0, c0) = single_bright_spot(30, 30, 5, 5);
        let (r1, c1) = single_bright_spot(30, 30, 25, 25);
        let blobs = track_blobs(&[r0, r1], &[&c0, &c1], 30, 30, 0, 1.0);
        assert_eq!(blobs.len(), 2);
    }

    #[test]
    fn bridging_frame_blob_unifies_two_running_blobs_transitively() {
        let nrows = 20;
        let ncols = 20;

        let (r0a, c0a) = single_bright_spot(nrows, ncols, 5, 5);
        let (r0b, c0b) = single_bright_spot(nrows, ncols, 11, 5);
        let mut r0 = vec![0.0; nrows * ncols];
        let mut c0 = vec![0u32; nrows * ncols];
        for i in 0..r0.len() {
            r0[i] = r0a[i].max(r0b[i]);
            c0[i] = c0a[i].max(c0b[i]);
        }

        // One wide blob on the next frame, whose bounding box bridges both
        // of the previous frame's running blobs at once.
        let mut r1 = vec![0.0; nrows * ncols];
        let mut c1 = vec![0u32; nrows * ncols];
        for x in 3..=13usize {
            let idx = 5 * ncols + x;
            r1[idx] = 10.0;
            c1[idx] = 50;
        }

        let blobs = track_blobs(&[r0, r1], &[&c0, &c1], nrows, ncols, 0, 1.0);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].frame_span(), 2);
    }
}
