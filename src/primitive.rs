use crate::aabb::Aabb;
use glam::Vec3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    Sphere,
    Triangle,
}

/// Lightweight handle to a primitive in the owning geometry collection.
///
/// `index` refers into that collection, never into the hierarchy. Builders
/// reorder a working array of these; the reordered array is what leaves
/// address as contiguous ranges.
#[derive(Clone, Copy, Debug)]
pub struct PrimitiveRef {
    pub kind: PrimitiveKind,
    pub index: u32,
    pub bounds: Aabb,
}

impl PrimitiveRef {
    #[inline]
    pub fn new(kind: PrimitiveKind, index: u32, bounds: Aabb) -> Self {
        PrimitiveRef { kind, index, bounds }
    }

    #[inline]
    pub fn centroid(&self) -> Vec3 {
        0.5 * self.bounds.min + 0.5 * self.bounds.max
    }
}
