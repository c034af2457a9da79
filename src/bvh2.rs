//! Binary SAH BVH: arena-based build, depth-first flattening, and
//! stack-based closest/any-hit traversal over the flattened array.

use crate::aabb::Aabb;
use crate::interval::Interval;
use crate::primitive::PrimitiveRef;
use crate::ray::Ray;

const NUM_BUCKETS: usize = 12;
const NUM_SPLITS: usize = NUM_BUCKETS - 1;
const STACK_DEPTH: usize = 64;

/// Build-time tree node, addressed by arena index.
#[derive(Clone, Debug)]
pub(crate) struct BuildNode {
    pub bounds: Aabb,
    pub content: BuildContent,
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum BuildContent {
    Leaf { first: u32, count: u32 },
    Interior { children: [u32; 2], axis: u8 },
}

/// Pointer-free build tree. Dropping it is the whole teardown.
pub(crate) struct BuildTree {
    pub nodes: Vec<BuildNode>,
    pub root: u32,
}

/// Array-resident node of the flattened hierarchy. For an interior node the
/// first child sits at the next array slot; the second child is addressed
/// explicitly.
#[derive(Clone, Copy, Debug)]
#[repr(align(32))]
pub struct FlatNode {
    pub bounds: Aabb,
    pub content: FlatContent,
}

#[derive(Clone, Copy, Debug)]
pub enum FlatContent {
    Leaf { offset: u32, count: u16 },
    Interior { second_child: u32, axis: u8 },
}

/// Binary BVH in flattened form, plus the primitive references permuted into
/// leaf order.
pub struct Bvh2 {
    nodes: Vec<FlatNode>,
    primitives: Vec<PrimitiveRef>,
}

impl Bvh2 {
    pub fn build(primitives: Vec<PrimitiveRef>, max_leaf_size: usize) -> Self {
        let (tree, ordered) = build_tree(primitives, max_leaf_size, u16::MAX as usize);
        let nodes = flatten(&tree);
        Bvh2 {
            nodes,
            primitives: ordered,
        }
    }

    #[inline]
    pub fn nodes(&self) -> &[FlatNode] {
        &self.nodes
    }

    /// Primitive references in hierarchy-leaf order.
    #[inline]
    pub fn primitives(&self) -> &[PrimitiveRef] {
        &self.primitives
    }

    /// Closest-hit query. `test_primitive` reports a hit only when its
    /// parameter lies inside the interval it is given; each reported hit
    /// narrows the search interval for everything visited afterwards.
    pub fn traverse_closest<T, F>(&self, ray: &Ray, t: Interval, mut test_primitive: F) -> Option<T>
    where
        F: FnMut(&PrimitiveRef, &Ray, Interval) -> Option<(f32, T)>,
    {
        if self.nodes.is_empty() {
            return None;
        }

        let dir_is_neg = [
            ray.inv_direction.x < 0.0,
            ray.inv_direction.y < 0.0,
            ray.inv_direction.z < 0.0,
        ];

        let mut t = t;
        let mut closest = None;
        let mut stack = [0u32; STACK_DEPTH];
        let mut stack_len = 0usize;
        let mut current = 0u32;

        loop {
            let node = &self.nodes[current as usize];
            if node.bounds.hit(ray, t) {
                match node.content {
                    FlatContent::Leaf { offset, count } => {
                        let range = offset as usize..offset as usize + count as usize;
                        for prim in &self.primitives[range] {
                            if let Some((hit_t, data)) = test_primitive(prim, ray, t) {
                                t.max = hit_t;
                                closest = Some(data);
                            }
                        }
                        if stack_len == 0 {
                            break;
                        }
                        stack_len -= 1;
                        current = stack[stack_len];
                    }
                    FlatContent::Interior { second_child, axis } => {
                        // Descend into the near child first so leaf hits
                        // shrink t.max before the far child's box test.
                        if dir_is_neg[axis as usize] {
                            stack[stack_len] = current + 1;
                            current = second_child;
                        } else {
                            stack[stack_len] = second_child;
                            current += 1;
                        }
                        stack_len += 1;
                    }
                }
            } else {
                if stack_len == 0 {
                    break;
                }
                stack_len -= 1;
                current = stack[stack_len];
            }
        }

        closest
    }

    /// Any-hit query: true as soon as one primitive intersects within `t`,
    /// not necessarily the nearest.
    pub fn traverse_any<F>(&self, ray: &Ray, t: Interval, mut test_primitive: F) -> bool
    where
        F: FnMut(&PrimitiveRef, &Ray, Interval) -> bool,
    {
        if self.nodes.is_empty() {
            return false;
        }

        let dir_is_neg = [
            ray.inv_direction.x < 0.0,
            ray.inv_direction.y < 0.0,
            ray.inv_direction.z < 0.0,
        ];

        let mut stack = [0u32; STACK_DEPTH];
        let mut stack_len = 0usize;
        let mut current = 0u32;

        loop {
            let node = &self.nodes[current as usize];
            if node.bounds.hit(ray, t) {
                match node.content {
                    FlatContent::Leaf { offset, count } => {
                        let range = offset as usize..offset as usize + count as usize;
                        for prim in &self.primitives[range] {
                            if test_primitive(prim, ray, t) {
                                return true;
                            }
                        }
                        if stack_len == 0 {
                            break;
                        }
                        stack_len -= 1;
                        current = stack[stack_len];
                    }
                    FlatContent::Interior { second_child, axis } => {
                        if dir_is_neg[axis as usize] {
                            stack[stack_len] = current + 1;
                            current = second_child;
                        } else {
                            stack[stack_len] = second_child;
                            current += 1;
                        }
                        stack_len += 1;
                    }
                }
            } else {
                if stack_len == 0 {
                    break;
                }
                stack_len -= 1;
                current = stack[stack_len];
            }
        }

        false
    }
}

/// Builds the binary tree into an arena and emits the ordered-primitive
/// permutation as a side effect. Shared by the binary and quad hierarchies.
///
/// `leaf_cap` is the hard bound no leaf may exceed, set by what the caller's
/// leaf encoding can count. Degenerate ranges larger than it are split at
/// the index midpoint rather than emitted whole.
pub(crate) fn build_tree(
    mut primitives: Vec<PrimitiveRef>,
    max_leaf_size: usize,
    leaf_cap: usize,
) -> (BuildTree, Vec<PrimitiveRef>) {
    if primitives.is_empty() {
        return (
            BuildTree {
                nodes: Vec::new(),
                root: 0,
            },
            Vec::new(),
        );
    }

    let max_leaf_size = max_leaf_size.min(leaf_cap);
    let count = primitives.len();
    let mut nodes = Vec::with_capacity(2 * count);
    let mut ordered = Vec::with_capacity(count);

    let root = build_recursive(&mut primitives, &mut nodes, &mut ordered, max_leaf_size, leaf_cap);
    debug_assert_eq!(ordered.len(), count);

    (BuildTree { nodes, root }, ordered)
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    count: u32,
    bounds: Aabb,
}

fn build_recursive(
    prims: &mut [PrimitiveRef],
    nodes: &mut Vec<BuildNode>,
    ordered: &mut Vec<PrimitiveRef>,
    max_leaf_size: usize,
    leaf_cap: usize,
) -> u32 {
    let mut bounds = Aabb::EMPTY;
    for p in prims.iter() {
        bounds.grow(&p.bounds);
    }

    if prims.len() == 1 {
        return push_leaf(nodes, ordered, prims, bounds);
    }

    let mut centroid_bounds = Aabb::EMPTY;
    for p in prims.iter() {
        centroid_bounds.grow_point(p.centroid());
    }
    let axis = centroid_bounds.longest_axis();

    let mid = if bounds.surface_area() == 0.0
        || centroid_bounds.min[axis] == centroid_bounds.max[axis]
    {
        // Degenerate geometry routes to a leaf, never an error. A range
        // larger than the leaf cap is cut at its index midpoint instead;
        // with no centroid spread to bucket, any position is as good.
        if prims.len() <= leaf_cap {
            return push_leaf(nodes, ordered, prims, bounds);
        }
        prims.len() / 2
    } else if prims.len() == 2 {
        let mid = prims.len() / 2;
        prims.select_nth_unstable_by(mid, |a, b| {
            a.centroid()[axis]
                .partial_cmp(&b.centroid()[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        mid
    } else {
        let mut buckets = [Bucket::default(); NUM_BUCKETS];
        for p in prims.iter() {
            let b = bucket_index(&centroid_bounds, p, axis);
            buckets[b].count += 1;
            buckets[b].bounds.grow(&p.bounds);
        }

        let mut costs = [0.0f32; NUM_SPLITS];

        let mut count_below = 0u32;
        let mut bounds_below = Aabb::EMPTY;
        for i in 0..NUM_SPLITS {
            count_below += buckets[i].count;
            bounds_below.grow(&buckets[i].bounds);
            costs[i] += count_below as f32 * bounds_below.surface_area();
        }

        let mut count_above = 0u32;
        let mut bounds_above = Aabb::EMPTY;
        for i in (1..NUM_BUCKETS).rev() {
            count_above += buckets[i].count;
            bounds_above.grow(&buckets[i].bounds);
            costs[i - 1] += count_above as f32 * bounds_above.surface_area();
        }

        let mut min_bucket = 0;
        let mut min_cost = f32::INFINITY;
        for (i, &cost) in costs.iter().enumerate() {
            if cost < min_cost {
                min_cost = cost;
                min_bucket = i;
            }
        }

        let leaf_cost = prims.len() as f32;
        let split_cost = 0.5 + min_cost / bounds.surface_area();

        if prims.len() > max_leaf_size || split_cost < leaf_cost {
            partition_by_bucket(prims, &centroid_bounds, axis, min_bucket)
        } else {
            return push_leaf(nodes, ordered, prims, bounds);
        }
    };

    let node_index = nodes.len() as u32;
    nodes.push(BuildNode {
        bounds,
        content: BuildContent::Leaf { first: 0, count: 0 },
    });

    let (left_prims, right_prims) = prims.split_at_mut(mid);
    let left = build_recursive(left_prims, nodes, ordered, max_leaf_size, leaf_cap);
    let right = build_recursive(right_prims, nodes, ordered, max_leaf_size, leaf_cap);

    let joined = Aabb::join(&nodes[left as usize].bounds, &nodes[right as usize].bounds);
    nodes[node_index as usize] = BuildNode {
        bounds: joined,
        content: BuildContent::Interior {
            children: [left, right],
            axis: axis as u8,
        },
    };

    node_index
}

fn push_leaf(
    nodes: &mut Vec<BuildNode>,
    ordered: &mut Vec<PrimitiveRef>,
    prims: &[PrimitiveRef],
    bounds: Aabb,
) -> u32 {
    let node_index = nodes.len() as u32;
    let first = ordered.len() as u32;
    ordered.extend_from_slice(prims);
    nodes.push(BuildNode {
        bounds,
        content: BuildContent::Leaf {
            first,
            count: prims.len() as u32,
        },
    });
    node_index
}

#[inline]
fn bucket_index(centroid_bounds: &Aabb, prim: &PrimitiveRef, axis: usize) -> usize {
    let b = (NUM_BUCKETS as f32 * centroid_bounds.offset(prim.centroid())[axis]) as usize;
    b.min(NUM_BUCKETS - 1)
}

/// In-place partition: primitives whose bucket is at or below the chosen
/// split go left. The extreme buckets are never empty, so neither side is.
fn partition_by_bucket(
    prims: &mut [PrimitiveRef],
    centroid_bounds: &Aabb,
    axis: usize,
    min_bucket: usize,
) -> usize {
    let mut left = 0;
    let mut right = prims.len();

    while left < right {
        if bucket_index(centroid_bounds, &prims[left], axis) <= min_bucket {
            left += 1;
        } else {
            right -= 1;
            prims.swap(left, right);
        }
    }

    left
}

/// Depth-first pre-order linearization. Reserving the output slot before
/// recursing pins the first child of every interior node at `self + 1`.
fn flatten(tree: &BuildTree) -> Vec<FlatNode> {
    if tree.nodes.is_empty() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(tree.nodes.len());
    flatten_node(tree, tree.root, &mut out);
    assert_eq!(
        out.len(),
        tree.nodes.len(),
        "flattened node count diverged from build arena"
    );
    out
}

fn flatten_node(tree: &BuildTree, index: u32, out: &mut Vec<FlatNode>) -> u32 {
    let node = &tree.nodes[index as usize];
    let slot = out.len() as u32;

    match node.content {
        BuildContent::Leaf { first, count } => {
            assert!(
                count <= u16::MAX as u32,
                "leaf of {} primitives overflows the 16-bit count field",
                count
            );
            out.push(FlatNode {
                bounds: node.bounds,
                content: FlatContent::Leaf {
                    offset: first,
                    count: count as u16,
                },
            });
        }
        BuildContent::Interior { children, axis } => {
            out.push(FlatNode {
                bounds: node.bounds,
                content: FlatContent::Interior {
                    second_child: 0,
                    axis,
                },
            });
            flatten_node(tree, children[0], out);
            let second = flatten_node(tree, children[1], out);
            if let FlatContent::Interior { second_child, .. } = &mut out[slot as usize].content {
                *second_child = second;
            }
        }
    }

    slot
}
