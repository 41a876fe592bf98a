use crate::config;
use crate::domain::{BoundingBox, Domain};
use crate::error::{HaloError, Result};
use crate::particle::{Particle, ParticleId};
use nalgebra::Vector3;
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, info_span};

// Initial capacity of the traversal stacks; deeper trees just grow them.
const TRAVERSAL_STACK_CAPACITY: usize = 64;

/// A particle found by a query, addressed by its position in the particle
/// slice the index was built over.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance_squared: f64,
}

impl Neighbor {
    pub fn distance(&self) -> f64 {
        self.distance_squared.sqrt()
    }
}

#[derive(Clone, Copy, Debug)]
struct KdNode {
    /// Bounds of the wrapped positions under this node.
    bounds: BoundingBox,
    /// Slot range into `KdTree::order`.
    start: usize,
    end: usize,
    split_dim: usize,
    split_value: f64,
    /// Arena indices of the (left, right) children; `None` for leaves.
    children: Option<(usize, usize)>,
}

impl KdNode {
    fn leaf(bounds: BoundingBox, start: usize, end: usize) -> Self {
        Self {
            bounds,
            start,
            end,
            split_dim: 0,
            split_value: 0.0,
            children: None,
        }
    }

    fn relocated(mut self, base: usize) -> Self {
        if let Some((left, right)) = self.children {
            self.children = Some((left + base, right + base));
        }
        self
    }
}

struct KdTree {
    /// Node arena, root at 0.
    nodes: Vec<KdNode>,
    /// order[slot] = particle index
    order: Vec<usize>,
    /// Wrapped positions in slot order.
    positions: Vec<Vector3<f64>>,
}

/// Balanced kd-tree over a borrowed particle slice.
///
/// The tree stores particle indices, never particle records. In a periodic
/// domain positions are wrapped into the box and queries also visit the
/// periodic images of the query point that reach into the box.
pub struct SpatialIndex<'a> {
    particles: &'a [Particle],
    domain: Domain,
    tree: Option<KdTree>,
}

impl<'a> SpatialIndex<'a> {
    /// Creates an index that must be `build()`-ed before it can be queried.
    pub fn new(particles: &'a [Particle], domain: Domain) -> Self {
        Self {
            particles,
            domain,
            tree: None,
        }
    }

    pub fn from_particles(particles: &'a [Particle], box_size: Option<f64>) -> Result<Self> {
        let mut index = Self::new(particles, Domain::from_box_size(box_size)?);
        index.build()?;
        Ok(index)
    }

    pub fn build(&mut self) -> Result<()> {
        let _span = info_span!("SpatialIndex::build", n_particles = self.particles.len()).entered();
        validate_particles(self.particles)?;

        let domain = self.domain;
        let wrapped: Vec<Vector3<f64>> = self
            .particles
            .par_iter()
            .map(|p| domain.wrap(&p.position))
            .collect();

        let mut order: Vec<usize> = (0..self.particles.len()).collect();
        let builder = TreeBuilder {
            positions: &wrapped,
            particles: self.particles,
            leaf_size: config::get_leaf_size(),
            parallel_threshold: config::get_parallel_threshold(),
        };
        let nodes = {
            let _s = info_span!("partition").entered();
            builder.build_subtree(&mut order, 0)
        };
        let positions = order.par_iter().map(|&i| wrapped[i]).collect();

        debug!(n_nodes = nodes.len(), "kd-tree built");
        self.tree = Some(KdTree {
            nodes,
            order,
            positions,
        });
        Ok(())
    }

    pub fn is_built(&self) -> bool {
        self.tree.is_some()
    }

    pub fn particles(&self) -> &'a [Particle] {
        self.particles
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    fn tree(&self) -> Result<&KdTree> {
        self.tree.as_ref().ok_or(HaloError::NotInitialized)
    }

    /// Number of levels from the root to the deepest leaf.
    pub fn depth(&self) -> Result<usize> {
        let tree = self.tree()?;
        let mut deepest = 0;
        let mut stack = vec![(0usize, 1usize)];
        while let Some((ni, level)) = stack.pop() {
            deepest = deepest.max(level);
            if let Some((left, right)) = tree.nodes[ni].children {
                stack.push((left, level + 1));
                stack.push((right, level + 1));
            }
        }
        Ok(deepest)
    }

    /// Volume of the domain: the periodic cube, or the bounds of the particles.
    pub fn volume(&self) -> Result<f64> {
        let tree = self.tree()?;
        match self.domain.box_size() {
            Some(_) => self.domain.volume(std::iter::empty::<&Vector3<f64>>()),
            None => {
                let v = tree.nodes[0].bounds.volume();
                if !(v > 0.0) {
                    return Err(HaloError::DegenerateGeometry(
                        "particles span zero volume".to_string(),
                    ));
                }
                Ok(v)
            }
        }
    }

    /// Mean inter-particle spacing `(V / N)^(1/3)`.
    pub fn mean_spacing(&self) -> Result<f64> {
        Ok((self.volume()? / self.len() as f64).cbrt())
    }

    /// Total particle mass over the domain volume.
    pub fn mean_density(&self) -> Result<f64> {
        let total: f64 = self.particles.par_iter().map(Particle::mass).sum();
        Ok(total / self.volume()?)
    }

    /// Ids of all particles within `radius` (inclusive) of `point`, ascending.
    pub fn query_radius(&self, point: &Vector3<f64>, radius: f64) -> Result<Vec<ParticleId>> {
        let mut found = Vec::new();
        self.neighbors_within(point, radius, &mut found)?;
        let mut ids: Vec<ParticleId> = found
            .iter()
            .map(|n| self.particles[n.index].id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// The `k` closest particles as `(id, distance)`, nearest first, equal
    /// distances ordered by ascending id. Returns every particle when `k`
    /// exceeds the particle count.
    pub fn query_k_nearest(&self, point: &Vector3<f64>, k: usize) -> Result<Vec<(ParticleId, f64)>> {
        Ok(self
            .nearest_neighbors(point, k)?
            .into_iter()
            .map(|n| (self.particles[n.index].id, n.distance()))
            .collect())
    }

    /// Fills `out` with every particle within `radius` of `point`, one entry
    /// per particle carrying its closest periodic image.
    pub fn neighbors_within(
        &self,
        point: &Vector3<f64>,
        radius: f64,
        out: &mut Vec<Neighbor>,
    ) -> Result<()> {
        let tree = self.tree()?;
        if !radius.is_finite() || radius < 0.0 {
            return Err(HaloError::InvalidInput(format!(
                "query radius must be non-negative and finite, got {}",
                radius
            )));
        }
        out.clear();
        let center = self.domain.wrap(point);
        let r2 = radius * radius;
        let offsets = self.domain.image_offsets(&center, radius);
        for offset in &offsets {
            tree.collect_within(&(center + offset), r2, out);
        }
        if offsets.len() > 1 {
            out.sort_unstable_by(|a, b| {
                a.index
                    .cmp(&b.index)
                    .then(a.distance_squared.total_cmp(&b.distance_squared))
            });
            out.dedup_by_key(|n| n.index);
        }
        Ok(())
    }

    /// The `k` nearest particles to `point` (itself included when `point` is a
    /// particle position), ordered by (distance, id).
    pub fn nearest_neighbors(&self, point: &Vector3<f64>, k: usize) -> Result<Vec<Neighbor>> {
        let tree = self.tree()?;
        if k == 0 {
            return Err(HaloError::InvalidInput(
                "number of neighbors must be positive".to_string(),
            ));
        }
        let k = k.min(self.len());
        let center = self.domain.wrap(point);
        let mut buffer = KnnBuffer::new(k);
        tree.collect_nearest(&center, self.particles, &mut buffer);

        if self.domain.is_periodic() {
            // Only images closer than the current k-th neighbor can contribute.
            let radius = buffer.bound().sqrt();
            let offsets = self.domain.image_offsets(&center, radius);
            buffer.dedup = true;
            for offset in offsets.iter().skip(1) {
                tree.collect_nearest(&(center + offset), self.particles, &mut buffer);
            }
        }
        Ok(buffer.into_neighbors())
    }
}

fn validate_particles(particles: &[Particle]) -> Result<()> {
    if particles.is_empty() {
        return Err(HaloError::InvalidInput("empty particle set".to_string()));
    }
    if let Some(p) = particles
        .par_iter()
        .find_any(|p| !p.position.iter().all(|x| x.is_finite()))
    {
        return Err(HaloError::InvalidInput(format!(
            "particle {} has a non-finite position",
            p.id
        )));
    }
    if let Some(p) = particles
        .par_iter()
        .find_any(|p| p.mass.is_some_and(|m| !m.is_finite() || m < 0.0))
    {
        return Err(HaloError::InvalidInput(format!(
            "particle {} has an invalid mass",
            p.id
        )));
    }
    let mut ids: Vec<ParticleId> = particles.par_iter().map(|p| p.id).collect();
    ids.par_sort_unstable();
    if let Some(w) = ids.windows(2).find(|w| w[0] == w[1]) {
        return Err(HaloError::InvalidInput(format!(
            "duplicate particle id {}",
            w[0]
        )));
    }
    Ok(())
}

struct TreeBuilder<'b> {
    positions: &'b [Vector3<f64>],
    particles: &'b [Particle],
    leaf_size: usize,
    parallel_threshold: usize,
}

impl TreeBuilder<'_> {
    /// Builds the subtree over `order` (whose first slot is `offset`) into a
    /// fresh arena rooted at 0.
    fn build_subtree(&self, order: &mut [usize], offset: usize) -> Vec<KdNode> {
        let n = order.len();
        let bounds = BoundingBox::from_points(order.iter().map(|&i| &self.positions[i]));
        let spread = bounds.span();
        let split_dim = spread.imax();

        if n <= self.leaf_size {
            return vec![KdNode::leaf(bounds, offset, offset + n)];
        }
        if spread[split_dim] <= 0.0 {
            debug!(n_points = n, "coincident points, keeping an unsplit leaf");
            return vec![KdNode::leaf(bounds, offset, offset + n)];
        }

        let mid = n / 2;
        order.select_nth_unstable_by(mid, |&a, &b| self.compare_along(split_dim, a, b));
        let split_value = self.positions[order[mid]][split_dim];

        let (left_order, right_order) = order.split_at_mut(mid);
        let (left, right) = if n >= self.parallel_threshold {
            rayon::join(
                || self.build_subtree(left_order, offset),
                || self.build_subtree(right_order, offset + mid),
            )
        } else {
            (
                self.build_subtree(left_order, offset),
                self.build_subtree(right_order, offset + mid),
            )
        };

        let left_root = 1;
        let right_root = 1 + left.len();
        let mut nodes = Vec::with_capacity(1 + left.len() + right.len());
        nodes.push(KdNode {
            bounds,
            start: offset,
            end: offset + n,
            split_dim,
            split_value,
            children: Some((left_root, right_root)),
        });
        nodes.extend(left.into_iter().map(|node| node.relocated(left_root)));
        nodes.extend(right.into_iter().map(|node| node.relocated(right_root)));
        nodes
    }

    fn compare_along(&self, dim: usize, a: usize, b: usize) -> Ordering {
        self.positions[a][dim]
            .total_cmp(&self.positions[b][dim])
            .then(self.particles[a].id.cmp(&self.particles[b].id))
    }
}

impl KdTree {
    fn collect_within(&self, query: &Vector3<f64>, r2: f64, out: &mut Vec<Neighbor>) {
        let mut stack = Vec::with_capacity(TRAVERSAL_STACK_CAPACITY);
        stack.push(0usize);
        while let Some(ni) = stack.pop() {
            let node = &self.nodes[ni];
            if node.bounds.distance_squared(query) > r2 {
                continue;
            }
            match node.children {
                Some((left, right)) => {
                    stack.push(right);
                    stack.push(left);
                }
                None => {
                    for slot in node.start..node.end {
                        let d2 = (self.positions[slot] - query).norm_squared();
                        if d2 <= r2 {
                            out.push(Neighbor {
                                index: self.order[slot],
                                distance_squared: d2,
                            });
                        }
                    }
                }
            }
        }
    }

    fn collect_nearest(&self, query: &Vector3<f64>, particles: &[Particle], buffer: &mut KnnBuffer) {
        let mut stack = Vec::with_capacity(TRAVERSAL_STACK_CAPACITY);
        stack.push((0usize, self.nodes[0].bounds.distance_squared(query)));
        while let Some((ni, min_d2)) = stack.pop() {
            // Equal distances are still visited: they may win on id.
            if min_d2 > buffer.bound() {
                continue;
            }
            let node = &self.nodes[ni];
            match node.children {
                Some((left, right)) => {
                    let dl = self.nodes[left].bounds.distance_squared(query);
                    let dr = self.nodes[right].bounds.distance_squared(query);
                    // Pushed last is visited first.
                    if query[node.split_dim] < node.split_value {
                        stack.push((right, dr));
                        stack.push((left, dl));
                    } else {
                        stack.push((left, dl));
                        stack.push((right, dr));
                    }
                }
                None => {
                    for slot in node.start..node.end {
                        let d2 = (self.positions[slot] - query).norm_squared();
                        if d2 <= buffer.bound() {
                            let index = self.order[slot];
                            buffer.offer(d2, particles[index].id, index);
                        }
                    }
                }
            }
        }
    }
}

/// Bounded candidate list kept sorted by (squared distance, id).
struct KnnBuffer {
    k: usize,
    items: Vec<(f64, ParticleId, usize)>,
    /// Set once the same particle can be reached through several images.
    dedup: bool,
}

fn knn_key_cmp(a: (f64, ParticleId), b: (f64, ParticleId)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

impl KnnBuffer {
    fn new(k: usize) -> Self {
        Self {
            k,
            items: Vec::with_capacity(k + 1),
            dedup: false,
        }
    }

    fn bound(&self) -> f64 {
        if self.items.len() < self.k {
            f64::INFINITY
        } else {
            self.items[self.k - 1].0
        }
    }

    fn offer(&mut self, d2: f64, id: ParticleId, index: usize) {
        if self.items.len() == self.k {
            let (wd, wid, _) = self.items[self.k - 1];
            if knn_key_cmp((d2, id), (wd, wid)) != Ordering::Less {
                return;
            }
        }
        if self.dedup
            && let Some(pos) = self.items.iter().position(|it| it.2 == index)
        {
            if d2 >= self.items[pos].0 {
                return;
            }
            self.items.remove(pos);
        }
        let at = self
            .items
            .partition_point(|it| knn_key_cmp((it.0, it.1), (d2, id)) == Ordering::Less);
        self.items.insert(at, (d2, id, index));
        self.items.truncate(self.k);
    }

    fn into_neighbors(self) -> Vec<Neighbor> {
        self.items
            .into_iter()
            .map(|(distance_squared, _, index)| Neighbor {
                index,
                distance_squared,
            })
            .collect()
    }
}
