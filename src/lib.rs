//! BVH acceleration structures for CPU ray tracing.
//!
//! Primitive bounds go in, a spatial hierarchy comes out: a binary BVH built
//! with binned SAH and flattened into a contiguous node array, or a 4-wide
//! BVH derived from the same binary tree for SIMD box tests. Both answer
//! closest-hit and any-hit ray queries; the actual primitive intersection is
//! supplied by the caller as a closure, so the hierarchy never depends on a
//! concrete geometry representation.

pub mod aabb;
pub mod bvh2;
pub mod bvh4;
pub mod interval;
pub mod mesh;
pub mod primitive;
pub mod ray;
pub mod scene;

pub use aabb::Aabb;
pub use bvh2::{Bvh2, FlatContent, FlatNode};
pub use bvh4::{Bvh4, QuadNode};
pub use interval::Interval;
pub use mesh::{SurfaceHit, TriangleMesh};
pub use primitive::{PrimitiveKind, PrimitiveRef};
pub use ray::Ray;
pub use scene::{AccelKind, Geometry, Scene};
