use crate::domain::Domain;
use crate::error::{HaloError, Result};
use crate::particle::{Particle, ParticleId};
use std::collections::HashMap;

/// Particle → group labels produced by a linker.
///
/// Labels are canonical: groups are numbered `0..num_groups` in ascending
/// order of their smallest member id, so two runs over the same particles in
/// a different order agree label for label. `None` marks an unassigned
/// particle.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupAssignment {
    ids: Vec<ParticleId>,
    labels: Vec<Option<usize>>,
    num_groups: usize,
    /// Domain the linker ran in.
    domain: Domain,
    /// Per-particle density, present when the linker estimated one.
    densities: Option<Vec<f64>>,
}

impl GroupAssignment {
    /// Builds canonical labels from arbitrary per-particle set keys. Keys must
    /// be particle indices (`< particles.len()`), e.g. union-find roots.
    pub fn from_keys(particles: &[Particle], keys: &[Option<usize>]) -> Result<Self> {
        let n = particles.len();
        if keys.len() != n {
            return Err(HaloError::InvalidInput(format!(
                "{} group keys for {} particles",
                keys.len(),
                n
            )));
        }
        if let Some(k) = keys.iter().flatten().find(|&&k| k >= n) {
            return Err(HaloError::InvalidInput(format!(
                "group key {} is not a particle index (n = {})",
                k, n
            )));
        }

        let mut min_id: Vec<Option<ParticleId>> = vec![None; n];
        for (p, key) in particles.iter().zip(keys) {
            if let Some(k) = *key {
                let slot = &mut min_id[k];
                *slot = Some(slot.map_or(p.id, |m| m.min(p.id)));
            }
        }

        let mut order: Vec<(ParticleId, usize)> = min_id
            .iter()
            .enumerate()
            .filter_map(|(k, m)| m.map(|id| (id, k)))
            .collect();
        order.sort_unstable();

        let mut relabel = vec![usize::MAX; n];
        for (label, &(_, key)) in order.iter().enumerate() {
            relabel[key] = label;
        }

        Ok(Self {
            ids: particles.iter().map(|p| p.id).collect(),
            labels: keys.iter().map(|k| k.map(|k| relabel[k])).collect(),
            num_groups: order.len(),
            domain: Domain::open(),
            densities: None,
        })
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub(crate) fn with_densities(mut self, densities: Vec<f64>) -> Self {
        debug_assert_eq!(densities.len(), self.ids.len());
        self.densities = Some(densities);
        self
    }

    /// Number of particles covered, assigned or not.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Ids of the labelled particles, in the order they were linked.
    pub fn ids(&self) -> &[ParticleId] {
        &self.ids
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }

    pub fn group_of(&self, index: usize) -> Option<usize> {
        self.labels.get(index).copied().flatten()
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn densities(&self) -> Option<&[f64]> {
        self.densities.as_deref()
    }

    pub fn num_unassigned(&self) -> usize {
        self.labels.iter().filter(|l| l.is_none()).count()
    }

    pub fn group_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_groups];
        for label in self.labels.iter().flatten() {
            sizes[*label] += 1;
        }
        sizes
    }

    /// Particle indices of every group, ascending within each group.
    pub fn members(&self) -> Vec<Vec<usize>> {
        let mut members: Vec<Vec<usize>> = self
            .group_sizes()
            .into_iter()
            .map(Vec::with_capacity)
            .collect();
        for (i, label) in self.labels.iter().enumerate() {
            if let Some(g) = label {
                members[*g].push(i);
            }
        }
        members
    }

    /// Drops groups with fewer than `min_size` members; their particles become
    /// unassigned and the surviving groups are renumbered in the same order.
    pub fn with_min_group_size(mut self, min_size: usize) -> Self {
        let sizes = self.group_sizes();
        let mut relabel = vec![None; self.num_groups];
        let mut next = 0;
        for (g, &size) in sizes.iter().enumerate() {
            if size >= min_size {
                relabel[g] = Some(next);
                next += 1;
            }
        }
        for label in self.labels.iter_mut() {
            *label = label.and_then(|g| relabel[g]);
        }
        self.num_groups = next;
        self
    }

    /// Particle id → group label; unassigned particles are absent.
    pub fn to_id_map(&self) -> HashMap<ParticleId, usize> {
        self.ids
            .iter()
            .zip(&self.labels)
            .filter_map(|(&id, label)| label.map(|g| (id, g)))
            .collect()
    }
}
