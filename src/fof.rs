use crate::config::{self, LinkingLength};
use crate::error::{HaloError, Result};
use crate::group::GroupAssignment;
use crate::kdtree::{Neighbor, SpatialIndex};
use crate::union_find::UnionFind;
use rayon::prelude::*;
use tracing::{debug, info_span};

const PARALLEL_TASKS_PER_THREAD: usize = 64;

/// Friends-of-friends linker: particles closer than the linking length
/// (inclusive) end up in the same group, transitively.
pub struct FofLinker<'i, 'a> {
    index: &'i SpatialIndex<'a>,
    linking_length: f64,
}

impl<'i, 'a> FofLinker<'i, 'a> {
    pub fn new(index: &'i SpatialIndex<'a>, linking_length: LinkingLength) -> Result<Self> {
        if !index.is_built() {
            return Err(HaloError::NotInitialized);
        }
        let linking_length = linking_length.resolve(|| index.mean_spacing())?;
        Ok(Self {
            index,
            linking_length,
        })
    }

    /// Absolute linking length after resolving a mean-spacing fraction.
    pub fn linking_length(&self) -> f64 {
        self.linking_length
    }

    /// Links every particle and returns the full partition, singletons included.
    pub fn link(&self) -> Result<GroupAssignment> {
        let n = self.index.len();
        let _span = info_span!("run_fof", n_particles = n, linking_length = self.linking_length)
            .entered();

        let threshold = config::get_parallel_threshold().max(1);
        let parallel = n >= threshold;
        let mut uf = UnionFind::new(n);
        let mut n_links = 0usize;

        // Queries run against a frozen forest; unions are applied between chunks.
        for start in (0..n).step_by(threshold) {
            let end = (start + threshold).min(n);
            let pairs: Vec<(usize, usize)> = if parallel {
                let num_threads = rayon::current_num_threads();
                let min_len = ((end - start) / (num_threads * PARALLEL_TASKS_PER_THREAD)).max(1);
                (start..end)
                    .into_par_iter()
                    .with_min_len(min_len)
                    .map_init(Vec::new, |scratch, i| self.unlinked_pairs(i, &uf, scratch))
                    .collect::<Result<Vec<_>>>()?
                    .into_iter()
                    .flatten()
                    .collect()
            } else {
                let mut scratch = Vec::new();
                let mut pairs = Vec::new();
                for i in start..end {
                    pairs.extend(self.unlinked_pairs(i, &uf, &mut scratch)?);
                }
                pairs
            };
            for (i, j) in pairs {
                uf.union(i, j);
                n_links += 1;
            }
        }

        let keys: Vec<Option<usize>> = uf.roots().into_iter().map(Some).collect();
        let assignment = GroupAssignment::from_keys(self.index.particles(), &keys)?
            .with_domain(*self.index.domain());
        debug!(n_links, n_groups = assignment.num_groups(), "fof linking done");
        Ok(assignment)
    }

    /// Neighbors `j > i` of particle `i` not yet in its set.
    fn unlinked_pairs(
        &self,
        i: usize,
        uf: &UnionFind,
        scratch: &mut Vec<Neighbor>,
    ) -> Result<Vec<(usize, usize)>> {
        let position = &self.index.particles()[i].position;
        self.index
            .neighbors_within(position, self.linking_length, scratch)?;
        let root_i = uf.root(i);
        Ok(scratch
            .iter()
            .filter(|n| n.index > i && uf.root(n.index) != root_i)
            .map(|n| (i, n.index))
            .collect())
    }
}

/// Friends-of-friends over a built index.
pub fn run_fof(index: &SpatialIndex, linking_length: LinkingLength) -> Result<GroupAssignment> {
    FofLinker::new(index, linking_length)?.link()
}
