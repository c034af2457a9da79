//! Quad BVH: two binary levels collapsed into one 4-wide node whose child
//! boxes are tested against a ray in parallel lanes.
//!
//! Leaf children are packed into a negative integer: sign bit set, the next
//! 4 bits hold the primitive count divided by 4, and the low 27 bits hold
//! the offset into the quad hierarchy's own ordered-primitive array. Leaf
//! ranges are padded to a multiple of 4 by repeating their last reference,
//! so the count field is always exact; a duplicated reference only repeats
//! an intersection test and never changes a query result. `i32::MIN` marks
//! an unused lane.

use crate::aabb::Aabb;
use crate::bvh2::{build_tree, BuildContent, BuildTree};
use crate::interval::Interval;
use crate::primitive::PrimitiveRef;
use crate::ray::Ray;

const PRIMITIVE_MASK: u32 = 0xF;
const INDICES_MASK: u32 = 0x7FF_FFFF;
const EMPTY_SLOT: i32 = i32::MIN;
// A popped node can push up to four lanes, so stack occupancy is bounded
// by three entries per level of descent, not one.
const STACK_DEPTH: usize = 192;

/// Largest leaf the 4-bit quad count field can describe (15 * 4).
pub const MAX_LEAF_PRIMS: usize = 60;

/// Four child bounding boxes in structure-of-arrays layout, one float lane
/// per child, plus packed child descriptors and the split axes of the
/// merged binary nodes (-1 where the corresponding side was a leaf).
#[derive(Clone, Debug)]
#[repr(C, align(128))]
pub struct QuadNode {
    pub min: [[f32; 4]; 3],
    pub max: [[f32; 4]; 3],
    pub children: [i32; 4],
    pub axis: [i32; 3],
}

impl Default for QuadNode {
    fn default() -> Self {
        Self {
            min: [[f32::INFINITY; 4]; 3],
            max: [[f32::NEG_INFINITY; 4]; 3],
            children: [EMPTY_SLOT; 4],
            axis: [-1; 3],
        }
    }
}

impl QuadNode {
    #[inline]
    pub fn is_leaf(&self, lane: usize) -> bool {
        self.children[lane] < 0
    }

    #[inline]
    pub fn is_inner(&self, lane: usize) -> bool {
        self.children[lane] >= 0
    }

    #[inline]
    pub fn is_empty(&self, lane: usize) -> bool {
        self.children[lane] == EMPTY_SLOT
    }

    /// Primitive count of a leaf lane. Does not check the lane is a leaf.
    #[inline]
    pub fn leaf_count(&self, lane: usize) -> usize {
        decode_count(self.children[lane])
    }

    /// Primitive offset of a leaf lane. Does not check the lane is a leaf.
    #[inline]
    pub fn leaf_offset(&self, lane: usize) -> usize {
        decode_offset(self.children[lane])
    }

    #[inline]
    fn set_child_bounds(&mut self, lane: usize, bounds: &Aabb) {
        for a in 0..3 {
            self.min[a][lane] = bounds.min[a];
            self.max[a][lane] = bounds.max[a];
        }
    }

    /// Slab-tests the four child boxes at once; returns the 4-bit hit mask
    /// and the per-lane entry distances.
    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    pub fn intersect(&self, ray: &Ray, t: Interval) -> (u8, [f32; 4]) {
        unsafe { self.intersect_sse2(ray, t) }
    }

    #[cfg(target_arch = "x86_64")]
    #[inline]
    unsafe fn intersect_sse2(&self, ray: &Ray, t: Interval) -> (u8, [f32; 4]) {
        use std::arch::x86_64::*;

        unsafe {
            let mut t_enter = _mm_set1_ps(t.min);
            let mut t_exit = _mm_set1_ps(t.max);

            for a in 0..3 {
                let origin = _mm_set1_ps(ray.origin[a]);
                let inv_dir = _mm_set1_ps(ray.inv_direction[a]);
                let lo = _mm_mul_ps(_mm_sub_ps(_mm_loadu_ps(self.min[a].as_ptr()), origin), inv_dir);
                let hi = _mm_mul_ps(_mm_sub_ps(_mm_loadu_ps(self.max[a].as_ptr()), origin), inv_dir);
                t_enter = _mm_max_ps(t_enter, _mm_min_ps(lo, hi));
                t_exit = _mm_min_ps(t_exit, _mm_max_ps(lo, hi));
            }

            let hit_mask = _mm_movemask_ps(_mm_cmple_ps(t_enter, t_exit)) as u8;
            let mut entries = [0.0f32; 4];
            _mm_storeu_ps(entries.as_mut_ptr(), t_enter);

            (hit_mask, entries)
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    pub fn intersect(&self, ray: &Ray, t: Interval) -> (u8, [f32; 4]) {
        use wide::{f32x4, CmpLe};

        let mut t_enter = f32x4::splat(t.min);
        let mut t_exit = f32x4::splat(t.max);

        for a in 0..3 {
            let origin = f32x4::splat(ray.origin[a]);
            let inv_dir = f32x4::splat(ray.inv_direction[a]);
            let lo = (f32x4::from(self.min[a]) - origin) * inv_dir;
            let hi = (f32x4::from(self.max[a]) - origin) * inv_dir;
            t_enter = t_enter.max(lo.min(hi));
            t_exit = t_exit.min(lo.max(hi));
        }

        let hit_mask = t_enter.cmp_le(t_exit).move_mask() as u8;
        (hit_mask, t_enter.to_array())
    }
}

#[inline]
fn encode_leaf(count: usize, offset: usize) -> i32 {
    debug_assert_eq!(count % 4, 0, "quad leaf counts are padded to a multiple of 4");
    let quads = (count / 4) as u32;
    assert!(
        quads <= PRIMITIVE_MASK,
        "quad leaf of {} primitives overflows the 4-bit count field",
        count
    );
    assert!(
        offset as u32 <= INDICES_MASK,
        "quad leaf offset {} overflows the 27-bit field",
        offset
    );
    (0x8000_0000u32 | (quads << 27) | offset as u32) as i32
}

#[inline]
fn decode_count(child: i32) -> usize {
    (((child as u32 >> 27) & PRIMITIVE_MASK) * 4) as usize
}

#[inline]
fn decode_offset(child: i32) -> usize {
    (child as u32 & INDICES_MASK) as usize
}

/// 4-ary BVH with SIMD node tests, derived from the same binary build tree
/// as [`crate::Bvh2`].
pub struct Bvh4 {
    nodes: Vec<QuadNode>,
    primitives: Vec<PrimitiveRef>,
}

impl Bvh4 {
    pub fn build(primitives: Vec<PrimitiveRef>, max_leaf_size: usize) -> Self {
        // The cap force-splits degenerate ranges that would otherwise
        // overflow the 4-bit count field.
        let (tree, ordered) = build_tree(primitives, max_leaf_size, MAX_LEAF_PRIMS);
        if tree.nodes.is_empty() {
            return Bvh4 {
                nodes: Vec::new(),
                primitives: Vec::new(),
            };
        }

        let mut collapser = Collapser {
            tree: &tree,
            ordered: &ordered,
            nodes: Vec::with_capacity(tree.nodes.len() / 2 + 1),
            primitives: Vec::with_capacity(ordered.len() + ordered.len() / 2 + 4),
        };

        match tree.nodes[tree.root as usize].content {
            BuildContent::Leaf { first, count } => {
                // Degenerate hierarchy: the whole scene is one leaf. Emit a
                // single node carrying it in lane 0.
                let bounds = tree.nodes[tree.root as usize].bounds;
                let child = collapser.emit_leaf(first, count);
                let mut node = QuadNode::default();
                node.set_child_bounds(0, &bounds);
                node.children[0] = child;
                collapser.nodes.push(node);
            }
            BuildContent::Interior { .. } => {
                collapser.collapse_node(tree.root);
            }
        }

        Bvh4 {
            nodes: collapser.nodes,
            primitives: collapser.primitives,
        }
    }

    #[inline]
    pub fn nodes(&self) -> &[QuadNode] {
        &self.nodes
    }

    /// Primitive references in quad-leaf order, including padding
    /// duplicates.
    #[inline]
    pub fn primitives(&self) -> &[PrimitiveRef] {
        &self.primitives
    }

    /// Closest-hit query. Lanes are visited nearest entry distance first;
    /// padding duplicates may hand the same reference to `test_primitive`
    /// more than once.
    pub fn traverse_closest<T, F>(&self, ray: &Ray, t: Interval, mut test_primitive: F) -> Option<T>
    where
        F: FnMut(&PrimitiveRef, &Ray, Interval) -> Option<(f32, T)>,
    {
        if self.nodes.is_empty() {
            return None;
        }

        let mut t = t;
        let mut closest = None;
        let mut stack = [(0u32, 0.0f32); STACK_DEPTH];
        stack[0] = (0, t.min);
        let mut stack_len = 1usize;

        while stack_len > 0 {
            stack_len -= 1;
            let (index, entry) = stack[stack_len];
            if entry > t.max {
                continue;
            }

            let node = &self.nodes[index as usize];
            let (hit_mask, entries) = node.intersect(ray, t);

            // Leaf lanes are resolved immediately; surviving inner lanes are
            // gathered so the nearest one is descended into next.
            let mut inner = [(0.0f32, 0u32); 4];
            let mut inner_len = 0;

            for lane in 0..4 {
                if hit_mask & (1 << lane) == 0 {
                    continue;
                }
                let child = node.children[lane];
                if child == EMPTY_SLOT || entries[lane] > t.max {
                    continue;
                }
                if child < 0 {
                    let offset = decode_offset(child);
                    let count = decode_count(child);
                    for prim in &self.primitives[offset..offset + count] {
                        if let Some((hit_t, data)) = test_primitive(prim, ray, t) {
                            t.max = hit_t;
                            closest = Some(data);
                        }
                    }
                } else {
                    inner[inner_len] = (entries[lane], child as u32);
                    inner_len += 1;
                }
            }

            // Push farthest first so the nearest lane pops next.
            inner[..inner_len].sort_unstable_by(|a, b| {
                b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
            });
            for &(lane_entry, child) in &inner[..inner_len] {
                stack[stack_len] = (child, lane_entry);
                stack_len += 1;
            }
        }

        closest
    }

    /// Any-hit query: true on the first primitive intersection found.
    pub fn traverse_any<F>(&self, ray: &Ray, t: Interval, mut test_primitive: F) -> bool
    where
        F: FnMut(&PrimitiveRef, &Ray, Interval) -> bool,
    {
        if self.nodes.is_empty() {
            return false;
        }

        let mut stack = [0u32; STACK_DEPTH];
        stack[0] = 0;
        let mut stack_len = 1usize;

        while stack_len > 0 {
            stack_len -= 1;
            let node = &self.nodes[stack[stack_len] as usize];
            let (hit_mask, _) = node.intersect(ray, t);

            for lane in 0..4 {
                if hit_mask & (1 << lane) == 0 {
                    continue;
                }
                let child = node.children[lane];
                if child == EMPTY_SLOT {
                    continue;
                }
                if child < 0 {
                    let offset = decode_offset(child);
                    let count = decode_count(child);
                    for prim in &self.primitives[offset..offset + count] {
                        if test_primitive(prim, ray, t) {
                            return true;
                        }
                    }
                } else {
                    stack[stack_len] = child as u32;
                    stack_len += 1;
                }
            }
        }

        false
    }
}

struct Collapser<'a> {
    tree: &'a BuildTree,
    ordered: &'a [PrimitiveRef],
    nodes: Vec<QuadNode>,
    primitives: Vec<PrimitiveRef>,
}

impl Collapser<'_> {
    /// Copies a binary leaf's range into the quad-ordered array, padded to
    /// a multiple of 4, and returns the packed descriptor.
    fn emit_leaf(&mut self, first: u32, count: u32) -> i32 {
        let offset = self.primitives.len();
        let range = &self.ordered[first as usize..(first + count) as usize];
        self.primitives.extend_from_slice(range);

        let last = range[range.len() - 1];
        let padded = (count as usize).next_multiple_of(4);
        for _ in count as usize..padded {
            self.primitives.push(last);
        }

        encode_leaf(padded, offset)
    }

    /// Collapses the binary subtree at `index` (an interior node) into quad
    /// nodes, returning the quad-node array index.
    fn collapse_node(&mut self, index: u32) -> i32 {
        let (left, right, axis) = match self.tree.nodes[index as usize].content {
            BuildContent::Interior { children, axis } => (children[0], children[1], axis),
            BuildContent::Leaf { .. } => unreachable!("leaves are encoded by the parent"),
        };

        // A leaf child occupies one lane itself; an interior child
        // contributes its two children, collapsing a level.
        let (lanes_left, left_axis) = self.child_lanes(left);
        let (lanes_right, right_axis) = self.child_lanes(right);
        let lanes = [lanes_left[0], lanes_left[1], lanes_right[0], lanes_right[1]];

        let node_index = self.nodes.len();
        self.nodes.push(QuadNode::default());
        self.nodes[node_index].axis = [axis as i32, left_axis, right_axis];

        for (lane, slot) in lanes.into_iter().enumerate() {
            let Some(tree_index) = slot else {
                continue;
            };
            let bounds = self.tree.nodes[tree_index as usize].bounds;
            let content = self.tree.nodes[tree_index as usize].content;
            let child = match content {
                BuildContent::Leaf { first, count } => self.emit_leaf(first, count),
                BuildContent::Interior { .. } => self.collapse_node(tree_index),
            };
            self.nodes[node_index].set_child_bounds(lane, &bounds);
            self.nodes[node_index].children[lane] = child;
        }

        node_index as i32
    }

    fn child_lanes(&self, index: u32) -> ([Option<u32>; 2], i32) {
        match self.tree.nodes[index as usize].content {
            BuildContent::Leaf { .. } => ([Some(index), None], -1),
            BuildContent::Interior { children, axis } => {
                ([Some(children[0]), Some(children[1])], axis as i32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bvh2::Bvh2;
    use crate::primitive::PrimitiveKind;
    use crate::test_rng::Rng;
    use glam::Vec3;

    fn boxed_prim(index: u32, center: Vec3, half: f32) -> PrimitiveRef {
        PrimitiveRef::new(
            PrimitiveKind::Triangle,
            index,
            Aabb::new(center - Vec3::splat(half), center + Vec3::splat(half)),
        )
    }

    fn box_entry(prim: &PrimitiveRef, ray: &Ray, t: Interval) -> Option<f32> {
        let t1 = (prim.bounds.min - ray.origin) * ray.inv_direction;
        let t2 = (prim.bounds.max - ray.origin) * ray.inv_direction;
        let t_near = t1.min(t2);
        let t_far = t1.max(t2);
        let t_enter = t.min.max(t_near.x).max(t_near.y).max(t_near.z);
        let t_exit = t.max.min(t_far.x).min(t_far.y).min(t_far.z);
        (t_enter <= t_exit).then_some(t_enter)
    }

    #[test]
    fn leaf_flag_is_the_sign_bit() {
        let mut node = QuadNode::default();
        node.children[0] = (1u32 << 31) as i32;
        node.children[1] = 0;

        assert!(node.is_leaf(0));
        assert!(!node.is_leaf(1));
        assert!(!node.is_inner(0));
        assert!(node.is_inner(1));
    }

    #[test]
    fn leaf_count_occupies_four_bits_after_sign() {
        let mut node = QuadNode::default();
        node.children[0] = (16 / 4) << 27;
        assert_eq!(node.leaf_count(0), 16);
    }

    #[test]
    fn leaf_offset_occupies_low_bits() {
        let mut node = QuadNode::default();
        node.children[0] = 1493;
        assert_eq!(node.leaf_offset(0), 1493);
    }

    #[test]
    fn encode_decode_round_trip() {
        let child = encode_leaf(24, 90_123);
        assert!(child < 0);
        assert_eq!(decode_count(child), 24);
        assert_eq!(decode_offset(child), 90_123);
    }

    #[test]
    fn default_lanes_are_empty() {
        let node = QuadNode::default();
        for lane in 0..4 {
            assert!(node.is_empty(lane));
            assert!(node.is_leaf(lane), "empty sentinel has the sign bit set");
        }
    }

    #[test]
    fn single_primitive_occupies_lane_zero() {
        let bvh = Bvh4::build(vec![boxed_prim(0, Vec3::ZERO, 1.0)], 4);
        assert_eq!(bvh.nodes().len(), 1);
        let node = &bvh.nodes()[0];
        assert!(node.is_leaf(0) && !node.is_empty(0));
        assert_eq!(node.leaf_count(0), 4, "1 primitive pads to 4");
        for lane in 1..4 {
            assert!(node.is_empty(lane));
        }
        // Padding repeats the same reference.
        assert!(bvh.primitives().iter().all(|p| p.index == 0));
    }

    #[test]
    fn two_binary_levels_collapse_into_one_quad_node() {
        let prims = vec![
            boxed_prim(0, Vec3::new(-100.0, -1.0, 0.0), 0.5),
            boxed_prim(1, Vec3::new(-100.0, 1.0, 0.0), 0.5),
            boxed_prim(2, Vec3::new(100.0, -1.0, 0.0), 0.5),
            boxed_prim(3, Vec3::new(100.0, 1.0, 0.0), 0.5),
        ];
        // The binary tree has 7 nodes (see the bvh2 tests); its three
        // interior levels collapse into a single 4-lane node.
        let bvh = Bvh4::build(prims, 1);
        assert_eq!(bvh.nodes().len(), 1);

        let node = &bvh.nodes()[0];
        assert_eq!(node.axis[0], 0, "root split separates the pairs along x");
        for lane in 0..4 {
            assert!(node.is_leaf(lane) && !node.is_empty(lane));
            assert_eq!(node.leaf_count(lane), 4);
        }
    }

    #[test]
    fn leaf_child_contributes_one_lane() {
        // Three primitives: one isolated, one close pair. The binary tree
        // is root -> (leaf, interior), so the quad node has a used lane, an
        // empty lane, and two lanes from the interior side.
        let prims = vec![
            boxed_prim(0, Vec3::new(-100.0, 0.0, 0.0), 0.5),
            boxed_prim(1, Vec3::new(100.0, -1.0, 0.0), 0.5),
            boxed_prim(2, Vec3::new(100.0, 1.0, 0.0), 0.5),
        ];
        let bvh = Bvh4::build(prims, 1);
        assert_eq!(bvh.nodes().len(), 1);

        let node = &bvh.nodes()[0];
        let empty = (0..4).filter(|&l| node.is_empty(l)).count();
        let used = (0..4).filter(|&l| node.is_leaf(l) && !node.is_empty(l)).count();
        assert_eq!(empty, 1);
        assert_eq!(used, 3);
    }

    #[test]
    fn coincident_centroids_respect_leaf_capacity() {
        // 64 identical-bounds primitives cannot sit in one quad leaf; the
        // builder cuts the range at its midpoint instead of overflowing
        // the count field.
        let prims: Vec<_> = (0..64)
            .map(|i| boxed_prim(i, Vec3::new(3.0, -2.0, 5.0), 1.0))
            .collect();
        let bvh = Bvh4::build(prims, 4);

        let mut total = 0usize;
        for node in bvh.nodes() {
            for lane in 0..4 {
                if node.is_leaf(lane) && !node.is_empty(lane) {
                    assert!(node.leaf_count(lane) <= MAX_LEAF_PRIMS);
                    total += node.leaf_count(lane);
                }
            }
        }
        assert_eq!(total, 64, "two 32-primitive leaves, no padding needed");

        let ray = Ray::new(Vec3::new(3.0, -2.0, -5.0), Vec3::Z);
        let t = Interval::new(0.001, f32::INFINITY);
        let hit = bvh.traverse_closest(&ray, t, |p, r, t| box_entry(p, r, t).map(|d| (d, d)));
        assert!(hit.is_some());
    }

    #[test]
    fn skewed_cluster_chain_matches_brute_force() {
        // Exponentially spaced clusters build a deep, lopsided tree; a ray
        // down the chain keeps every lane of every visited node alive.
        let mut prims = Vec::new();
        for i in 0..24u32 {
            let x = (1u32 << (i + 2)) as f32;
            for j in 0..4u32 {
                let y = -0.6 + 0.4 * j as f32;
                prims.push(boxed_prim(i * 4 + j, Vec3::new(x, y, 0.0), 0.5));
            }
        }
        let bvh = Bvh4::build(prims.clone(), 1);
        let t = Interval::new(0.001, f32::INFINITY);
        let ray = Ray::new(Vec3::ZERO, Vec3::X);

        let brute = prims
            .iter()
            .filter_map(|p| box_entry(p, &ray, t))
            .fold(f32::INFINITY, f32::min);
        let traversed = bvh
            .traverse_closest(&ray, t, |p, r, t| box_entry(p, r, t).map(|d| (d, d)))
            .expect("chain lies on the ray");
        assert!((brute - traversed).abs() <= 1e-4 * brute.max(1.0));
        assert!(bvh.traverse_any(&ray, t, |p, r, t| box_entry(p, r, t).is_some()));
    }

    #[test]
    fn matches_binary_hierarchy_on_random_scenes() {
        let mut rng = Rng::new(71);
        let prims: Vec<_> = (0..220)
            .map(|i| {
                let center = Vec3::new(
                    rng.in_range(-20.0, 20.0),
                    rng.in_range(-20.0, 20.0),
                    rng.in_range(-20.0, 20.0),
                );
                boxed_prim(i as u32, center, rng.in_range(0.1, 1.5))
            })
            .collect();

        let bvh2 = Bvh2::build(prims.clone(), 4);
        let bvh4 = Bvh4::build(prims, 4);
        let t = Interval::new(0.001, f32::INFINITY);

        for _ in 0..200 {
            let origin = Vec3::new(
                rng.in_range(-40.0, 40.0),
                rng.in_range(-40.0, 40.0),
                rng.in_range(-40.0, 40.0),
            );
            let dir = Vec3::new(
                rng.in_range(-1.0, 1.0),
                rng.in_range(-1.0, 1.0),
                rng.in_range(-1.0, 1.0),
            );
            if dir.length_squared() < 1e-6 {
                continue;
            }
            let ray = Ray::new(origin, dir.normalize());

            let binary =
                bvh2.traverse_closest(&ray, t, |p, r, t| box_entry(p, r, t).map(|d| (d, d)));
            let quad =
                bvh4.traverse_closest(&ray, t, |p, r, t| box_entry(p, r, t).map(|d| (d, d)));

            match (binary, quad) {
                (None, None) => {}
                (Some(a), Some(b)) => assert!((a - b).abs() <= 1e-4 * a.abs().max(1.0)),
                other => panic!("binary and quad hierarchies disagree: {:?}", other),
            }

            let binary_any = bvh2.traverse_any(&ray, t, |p, r, t| box_entry(p, r, t).is_some());
            let quad_any = bvh4.traverse_any(&ray, t, |p, r, t| box_entry(p, r, t).is_some());
            assert_eq!(binary_any, quad_any);
        }
    }
}
