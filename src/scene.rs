//! Geometry aggregation: meshes, the per-triangle handle table, and the
//! accelerator chosen at construction time.

use crate::bvh2::Bvh2;
use crate::bvh4::Bvh4;
use crate::interval::Interval;
use crate::mesh::{SurfaceHit, TriangleMesh};
use crate::primitive::{PrimitiveKind, PrimitiveRef};
use crate::ray::Ray;

/// Stable handle of one triangle: which mesh owns it and where.
#[derive(Clone, Copy, Debug)]
pub struct TriangleRef {
    pub mesh_index: u32,
    pub index: u32,
}

/// Collection of meshes with a flat triangle-handle table. The table index
/// is what `PrimitiveRef::index` refers to.
#[derive(Default)]
pub struct Geometry {
    meshes: Vec<TriangleMesh>,
    triangles: Vec<TriangleRef>,
}

impl Geometry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_mesh(&mut self, mesh: TriangleMesh) -> u32 {
        let mesh_index = self.meshes.len() as u32;
        for index in 0..mesh.triangle_count() as u32 {
            self.triangles.push(TriangleRef { mesh_index, index });
        }
        self.meshes.push(mesh);
        mesh_index
    }

    #[inline]
    pub fn primitive_count(&self) -> usize {
        self.triangles.len()
    }

    /// One reference per triangle, bounds resolved through the owning mesh.
    pub fn primitive_refs(&self) -> Vec<PrimitiveRef> {
        self.triangles
            .iter()
            .enumerate()
            .map(|(i, tri)| {
                let bounds =
                    self.meshes[tri.mesh_index as usize].triangle_bounds(tri.index as usize);
                PrimitiveRef::new(PrimitiveKind::Triangle, i as u32, bounds)
            })
            .collect()
    }

    /// Resolves a primitive reference to its closest-hit routine.
    pub fn closest_hit_primitive(
        &self,
        prim: &PrimitiveRef,
        ray: &Ray,
        t: Interval,
    ) -> Option<SurfaceHit> {
        match prim.kind {
            PrimitiveKind::Triangle => {
                let tri = self.triangles[prim.index as usize];
                self.meshes[tri.mesh_index as usize].closest_hit(ray, t, tri.index as usize)
            }
            // No sphere geometry ships yet; the tag exists for the handle
            // format.
            PrimitiveKind::Sphere => None,
        }
    }

    /// Resolves a primitive reference to its any-hit routine.
    pub fn any_hit_primitive(&self, prim: &PrimitiveRef, ray: &Ray, t: Interval) -> bool {
        match prim.kind {
            PrimitiveKind::Triangle => {
                let tri = self.triangles[prim.index as usize];
                self.meshes[tri.mesh_index as usize].any_hit(ray, t, tri.index as usize)
            }
            PrimitiveKind::Sphere => false,
        }
    }
}

/// Which hierarchy a [`Scene`] builds. A query session uses exactly one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccelKind {
    Binary,
    Quad,
}

enum TraceAccel {
    Binary(Bvh2),
    Quad(Bvh4),
}

/// Immutable geometry plus its accelerator. Queries take `&self` and may
/// run from any number of threads once construction returns.
pub struct Scene {
    geometry: Geometry,
    accel: TraceAccel,
}

impl Scene {
    pub fn build(geometry: Geometry, kind: AccelKind, max_leaf_size: usize) -> Self {
        let refs = geometry.primitive_refs();
        let accel = match kind {
            AccelKind::Binary => TraceAccel::Binary(Bvh2::build(refs, max_leaf_size)),
            AccelKind::Quad => TraceAccel::Quad(Bvh4::build(refs, max_leaf_size)),
        };
        Scene { geometry, accel }
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn closest_hit(&self, ray: &Ray, t: Interval) -> Option<SurfaceHit> {
        let test = |prim: &PrimitiveRef, ray: &Ray, t: Interval| {
            self.geometry
                .closest_hit_primitive(prim, ray, t)
                .map(|hit| (hit.t, hit))
        };
        match &self.accel {
            TraceAccel::Binary(bvh) => bvh.traverse_closest(ray, t, test),
            TraceAccel::Quad(bvh) => bvh.traverse_closest(ray, t, test),
        }
    }

    pub fn any_hit(&self, ray: &Ray, t: Interval) -> bool {
        let test = |prim: &PrimitiveRef, ray: &Ray, t: Interval| {
            self.geometry.any_hit_primitive(prim, ray, t)
        };
        match &self.accel {
            TraceAccel::Binary(bvh) => bvh.traverse_any(ray, t, test),
            TraceAccel::Quad(bvh) => bvh.traverse_any(ray, t, test),
        }
    }
}
