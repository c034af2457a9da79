//! Triangle-mesh geometry: the concrete primitive-intersection capability
//! the hierarchies invoke through closures.

use crate::aabb::Aabb;
use crate::interval::Interval;
use crate::ray::Ray;
use glam::{Vec2, Vec3};

const DET_EPSILON: f32 = 1e-8;

/// Surface intersection record produced by a closest-hit query.
#[derive(Clone, Copy, Debug)]
pub struct SurfaceHit {
    pub point: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub t: f32,
    pub front_face: bool,
}

impl SurfaceHit {
    /// Orients the shading normal against the ray and records which side
    /// was hit.
    #[inline]
    pub fn set_face_normal(&mut self, ray: &Ray, n: Vec3) {
        self.front_face = ray.direction.dot(n) < 0.0;
        self.normal = if self.front_face { n } else { -n };
    }
}

/// Indexed triangle mesh. Normals and UVs are optional; an empty array
/// falls back to the face normal and barycentric coordinates respectively.
pub struct TriangleMesh {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    uvs: Vec<Vec2>,
    indices: Vec<[u32; 3]>,
}

impl TriangleMesh {
    pub fn new(
        positions: Vec<Vec3>,
        normals: Vec<Vec3>,
        uvs: Vec<Vec2>,
        indices: Vec<[u32; 3]>,
    ) -> Self {
        Self {
            positions,
            normals,
            uvs,
            indices,
        }
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    fn vertices(&self, index: usize) -> (Vec3, Vec3, Vec3) {
        let tri = self.indices[index];
        (
            self.positions[tri[0] as usize],
            self.positions[tri[1] as usize],
            self.positions[tri[2] as usize],
        )
    }

    pub fn triangle_bounds(&self, index: usize) -> Aabb {
        let (v0, v1, v2) = self.vertices(index);
        let mut bounds = Aabb::new(v0, v1);
        bounds.grow_point(v2);
        bounds
    }

    pub fn triangle_area(&self, index: usize) -> f32 {
        let (v0, v1, v2) = self.vertices(index);
        0.5 * (v1 - v0).cross(v2 - v0).length()
    }

    /// Möller–Trumbore intersection. Accepts a root only when `t` strictly
    /// surrounds it.
    pub fn closest_hit(&self, ray: &Ray, t: Interval, index: usize) -> Option<SurfaceHit> {
        let (v0, v1, v2) = self.vertices(index);
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let pvec = ray.direction.cross(edge2);
        let det = edge1.dot(pvec);

        if det.abs() < DET_EPSILON {
            return None;
        }

        let inv_det = 1.0 / det;
        let tvec = ray.origin - v0;

        let b1 = tvec.dot(pvec) * inv_det;
        if !(0.0..=1.0).contains(&b1) {
            return None;
        }

        let qvec = tvec.cross(edge1);
        let b2 = ray.direction.dot(qvec) * inv_det;
        if b2 < 0.0 || b1 + b2 > 1.0 {
            return None;
        }

        let root = edge2.dot(qvec) * inv_det;
        if !t.surrounds(root) {
            return None;
        }

        let b0 = 1.0 - b1 - b2;
        let tri = self.indices[index];

        let n = if self.normals.is_empty() {
            edge1.cross(edge2)
        } else {
            b0 * self.normals[tri[0] as usize]
                + b1 * self.normals[tri[1] as usize]
                + b2 * self.normals[tri[2] as usize]
        };

        let uv = if self.uvs.is_empty() {
            Vec2::new(b1, b2)
        } else {
            self.uvs[tri[0] as usize] * b0
                + self.uvs[tri[1] as usize] * b1
                + self.uvs[tri[2] as usize] * b2
        };

        let mut hit = SurfaceHit {
            point: ray.at(root),
            normal: Vec3::ZERO,
            uv,
            t: root,
            front_face: false,
        };
        // Interpolated vertex normals can cancel to zero length; fall back
        // to the face normal, which the determinant cutoff keeps nonzero.
        hit.set_face_normal(ray, n.normalize_or(edge1.cross(edge2).normalize()));

        Some(hit)
    }

    /// Möller–Trumbore predicate without shading data.
    pub fn any_hit(&self, ray: &Ray, t: Interval, index: usize) -> bool {
        let (v0, v1, v2) = self.vertices(index);
        let edge1 = v1 - v0;
        let edge2 = v2 - v0;
        let pvec = ray.direction.cross(edge2);
        let det = edge1.dot(pvec);

        if det.abs() < DET_EPSILON {
            return false;
        }

        let inv_det = 1.0 / det;
        let tvec = ray.origin - v0;

        let u = tvec.dot(pvec) * inv_det;
        if !(0.0..=1.0).contains(&u) {
            return false;
        }

        let qvec = tvec.cross(edge1);
        let v = ray.direction.dot(qvec) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return false;
        }

        t.surrounds(edge2.dot(qvec) * inv_det)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_triangle() -> TriangleMesh {
        // Right triangle in the z = 0 plane.
        TriangleMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            Vec::new(),
            Vec::new(),
            vec![[0, 1, 2]],
        )
    }

    #[test]
    fn hits_interior_point() {
        let mesh = unit_triangle();
        let ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        let t = Interval::new(0.001, f32::INFINITY);

        let hit = mesh.closest_hit(&ray, t, 0).expect("should hit");
        assert!((hit.t - 1.0).abs() < 1e-5);
        assert!((hit.point - Vec3::new(0.25, 0.25, 0.0)).length() < 1e-5);
        assert_eq!(hit.uv, Vec2::new(0.25, 0.25));
        assert!(mesh.any_hit(&ray, t, 0));
    }

    #[test]
    fn misses_outside_barycentric_range() {
        let mesh = unit_triangle();
        let t = Interval::new(0.001, f32::INFINITY);
        let ray = Ray::new(Vec3::new(0.9, 0.9, -1.0), Vec3::Z);
        assert!(mesh.closest_hit(&ray, t, 0).is_none());
        assert!(!mesh.any_hit(&ray, t, 0));
    }

    #[test]
    fn parallel_ray_misses() {
        let mesh = unit_triangle();
        let t = Interval::new(0.001, f32::INFINITY);
        let ray = Ray::new(Vec3::new(-1.0, 0.25, 0.0), Vec3::X);
        assert!(mesh.closest_hit(&ray, t, 0).is_none());
    }

    #[test]
    fn interval_bounds_are_exclusive() {
        let mesh = unit_triangle();
        let ray = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        // Root is exactly 1.0; surrounds() requires strict inequality.
        assert!(mesh.closest_hit(&ray, Interval::new(0.0, 1.0), 0).is_none());
        assert!(mesh.closest_hit(&ray, Interval::new(1.0, 2.0), 0).is_none());
        assert!(mesh.closest_hit(&ray, Interval::new(0.5, 1.5), 0).is_some());
    }

    #[test]
    fn face_normal_flips_toward_ray() {
        let mesh = unit_triangle();
        let t = Interval::new(0.001, f32::INFINITY);

        let front = Ray::new(Vec3::new(0.25, 0.25, -1.0), Vec3::Z);
        let hit = mesh.closest_hit(&front, t, 0).unwrap();
        assert!(hit.normal.dot(front.direction) < 0.0);

        let back = Ray::new(Vec3::new(0.25, 0.25, 1.0), -Vec3::Z);
        let hit = mesh.closest_hit(&back, t, 0).unwrap();
        assert!(hit.normal.dot(back.direction) < 0.0);
        assert_ne!(hit.front_face, mesh.closest_hit(&front, t, 0).unwrap().front_face);
    }

    #[test]
    fn shading_normals_interpolate() {
        let n = Vec3::new(0.0, 0.0, 1.0);
        let mesh = TriangleMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![n, n, n],
            vec![Vec2::ZERO, Vec2::X, Vec2::Y],
            vec![[0, 1, 2]],
        );
        let ray = Ray::new(Vec3::new(0.5, 0.25, -1.0), Vec3::Z);
        let hit = mesh
            .closest_hit(&ray, Interval::new(0.001, f32::INFINITY), 0)
            .unwrap();
        // Ray travels with the vertex normals, so the shading normal flips.
        assert!((hit.normal + n).length() < 1e-5);
        assert!(!hit.front_face);
        assert!((hit.uv - Vec2::new(0.5, 0.25)).length() < 1e-5);
    }

    #[test]
    fn cancelling_vertex_normals_fall_back_to_face_normal() {
        let mesh = TriangleMesh::new(
            vec![Vec3::ZERO, Vec3::X, Vec3::Y],
            vec![Vec3::Z, -Vec3::Z, Vec3::Z],
            Vec::new(),
            vec![[0, 1, 2]],
        );
        // Hits the v0-v1 edge midpoint, where the vertex normals sum to
        // zero; the geometric normal (flipped against the ray) stands in.
        let ray = Ray::new(Vec3::new(0.5, 0.0, -1.0), Vec3::Z);
        let hit = mesh
            .closest_hit(&ray, Interval::new(0.001, f32::INFINITY), 0)
            .unwrap();
        assert!(hit.normal.is_finite());
        assert!((hit.normal + Vec3::Z).length() < 1e-5);
    }

    #[test]
    fn bounds_and_area() {
        let mesh = unit_triangle();
        let b = mesh.triangle_bounds(0);
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::new(1.0, 1.0, 0.0));
        assert!((mesh.triangle_area(0) - 0.5).abs() < 1e-6);
    }
}
