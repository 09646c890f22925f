//! Geometry primitives shared by the rest of the pipeline: 3-D vectors and
//! matrices (re-exported from `nalgebra`), ellipsoids, axis-aligned bounding
//! boxes, axis-angle rotations and convex hulls.

pub mod aabb;
pub mod ellipsoid;
pub mod hull;
pub mod rotation;

pub use aabb::Aabb3;
pub use ellipsoid::Ellipsoid;
pub use hull::ConvexHull;
pub use rotation::homogeneous;

/// 3-component real vector, used throughout for both lab-space positions and
/// detector-space (px, py, frame) coordinates.
pub type Vector3 = nalgebra::Vector3<f64>;
/// 3x3 real matrix: rotations, metrics, covariances, UB matrices.
pub type Matrix3 = nalgebra::Matrix3<f64>;
/// Unit quaternion used for sample/detector orientation.
pub type UnitQuaternion = nalgebra::UnitQuaternion<f64>;
