use crate::cancel::{CancelToken, Phase};
use crate::config::HopConfig;
use crate::density::{DensityEstimator, DensityField, density_order};
use crate::error::{HaloError, Result};
use crate::group::GroupAssignment;
use crate::kdtree::SpatialIndex;
use crate::particle::ParticleId;
use crate::union_find::UnionFind;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info_span};

const PARALLEL_TASKS_PER_THREAD: usize = 64;

/// A local density maximum reached by one or more hop chains.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Peak {
    index: usize,
    id: ParticleId,
    density: f64,
}

/// Highest boundary density seen between two peak groups, by peak slot.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Saddle {
    a: usize,
    b: usize,
    density: f64,
}

/// HOP: hop every particle to its densest neighbor, group particles by the
/// peak their chain ends on, then merge peaks across dense saddles.
pub struct HopGrouper<'i, 'a> {
    index: &'i SpatialIndex<'a>,
    config: HopConfig,
}

impl<'i, 'a> HopGrouper<'i, 'a> {
    pub fn new(index: &'i SpatialIndex<'a>, config: &HopConfig) -> Result<Self> {
        config.validate()?;
        if !index.is_built() {
            return Err(HaloError::NotInitialized);
        }
        Ok(Self {
            index,
            config: *config,
        })
    }

    pub fn group(&self) -> Result<GroupAssignment> {
        self.group_with_cancel(&CancelToken::new())
    }

    pub fn group_with_cancel(&self, cancel: &CancelToken) -> Result<GroupAssignment> {
        let (outer, peak_threshold) = self.thresholds()?;
        let field = DensityEstimator::new(self.index, self.config.num_neighbors, self.config.kernel)?
            .with_retained_neighbors(self.config.num_hop.max(self.config.num_merge))
            .estimate()?;
        cancel.check(Phase::DensityEstimation)?;

        let peak_of = self.chain(&field);
        cancel.check(Phase::ChainStep)?;

        let keys = self.regroup(&field, &peak_of, outer, peak_threshold);
        let assignment = GroupAssignment::from_keys(self.index.particles(), &keys)?
            .with_domain(*self.index.domain())
            .with_min_group_size(self.config.min_group_size)
            .with_densities(field.into_densities());
        debug!(
            n_groups = assignment.num_groups(),
            n_unassigned = assignment.num_unassigned(),
            "hop grouping done"
        );
        Ok(assignment)
    }

    /// Resolved (outer, peak) density thresholds.
    fn thresholds(&self) -> Result<(f64, f64)> {
        let mean_density = if self.config.requires_mean_density() {
            self.index.mean_density()?
        } else {
            0.0
        };
        let outer = self.config.outer_density_threshold.resolve(mean_density);
        let peak = self
            .config
            .peak_density_threshold
            .map_or(outer, |p| p.resolve(mean_density));
        debug!(mean_density, outer, peak, "density thresholds");
        Ok((outer, peak))
    }

    /// Index of the peak each particle's chain ends on.
    fn chain(&self, field: &DensityField) -> Vec<usize> {
        let n = field.len();
        let _span = info_span!("HopGrouper::chain", n_particles = n).entered();
        let particles = self.index.particles();
        let rho = field.densities();
        let num_hop = self.config.num_hop;

        let num_threads = rayon::current_num_threads();
        let min_len = (n / (num_threads * PARALLEL_TASKS_PER_THREAD)).max(1);
        let links: Vec<usize> = (0..n)
            .into_par_iter()
            .with_min_len(min_len)
            .map(|i| {
                field.neighbors_of(i).take(num_hop).fold(i, |best, j| {
                    match density_order(rho[j], particles[j].id, rho[best], particles[best].id) {
                        Ordering::Greater => j,
                        _ => best,
                    }
                })
            })
            .collect();

        // Links strictly ascend in density order, so every tree has exactly
        // one self-linked particle.
        let mut uf = UnionFind::new(n);
        for (i, &link) in links.iter().enumerate() {
            uf.union(i, link);
        }
        let mut peak_of_root = vec![usize::MAX; n];
        let mut n_peaks = 0usize;
        for (i, &link) in links.iter().enumerate() {
            if link == i {
                peak_of_root[uf.find(i)] = i;
                n_peaks += 1;
            }
        }
        debug!(n_peaks, "chain step done");
        (0..n).map(|i| peak_of_root[uf.find(i)]).collect()
    }

    /// Final set key (surviving peak index) per particle.
    fn regroup(
        &self,
        field: &DensityField,
        peak_of: &[usize],
        outer: f64,
        peak_threshold: f64,
    ) -> Vec<Option<usize>> {
        let n = field.len();
        let _span = info_span!("HopGrouper::regroup", n_particles = n).entered();
        let particles = self.index.particles();
        let rho = field.densities();

        let mut slot_of = vec![usize::MAX; n];
        let mut peaks = Vec::new();
        for i in 0..n {
            if peak_of[i] == i {
                slot_of[i] = peaks.len();
                peaks.push(Peak {
                    index: i,
                    id: particles[i].id,
                    density: rho[i],
                });
            }
        }

        let saddles = self.collect_saddles(field, peak_of, &slot_of, outer);
        debug!(n_peaks = peaks.len(), n_saddles = saddles.len(), "boundaries collected");
        let survivors = merge_peaks(
            &peaks,
            saddles,
            self.config.merging_threshold,
            peak_threshold,
        );

        (0..n)
            .map(|i| {
                if rho[i] < outer {
                    return None;
                }
                survivors[slot_of[peak_of[i]]].map(|s| peaks[s].index)
            })
            .collect()
    }

    /// Boundary density of every pair of peak groups that share a neighbor
    /// pair above the outer threshold.
    fn collect_saddles(
        &self,
        field: &DensityField,
        peak_of: &[usize],
        slot_of: &[usize],
        outer: f64,
    ) -> Vec<Saddle> {
        let n = field.len();
        let rho = field.densities();
        let num_merge = self.config.num_merge;
        let num_threads = rayon::current_num_threads();
        let min_len = (n / (num_threads * PARALLEL_TASKS_PER_THREAD)).max(1);

        let boundaries: HashMap<(usize, usize), f64> = (0..n)
            .into_par_iter()
            .with_min_len(min_len)
            .filter(|&i| rho[i] >= outer)
            .fold(HashMap::new, |mut acc, i| {
                let gi = slot_of[peak_of[i]];
                for j in field.neighbors_of(i).take(num_merge) {
                    if rho[j] < outer {
                        continue;
                    }
                    let gj = slot_of[peak_of[j]];
                    if gi == gj {
                        continue;
                    }
                    keep_max(&mut acc, (gi.min(gj), gi.max(gj)), 0.5 * (rho[i] + rho[j]));
                }
                acc
            })
            .reduce(HashMap::new, |mut a, b| {
                for (key, density) in b {
                    keep_max(&mut a, key, density);
                }
                a
            });

        boundaries
            .into_iter()
            .map(|((a, b), density)| Saddle { a, b, density })
            .collect()
    }
}

fn keep_max(map: &mut HashMap<(usize, usize), f64>, key: (usize, usize), density: f64) {
    map.entry(key)
        .and_modify(|d| *d = d.max(density))
        .or_insert(density);
}

/// Applies merges in one pass, densest saddle first, and returns for every
/// peak slot the slot of the peak it ends up under (`None` if discarded).
///
/// Two groups merge when their saddle exceeds `merging_threshold` times the
/// lower of their peaks, or when either peak lies below `peak_threshold`.
/// Groups still peaking below `peak_threshold` afterwards are discarded.
fn merge_peaks(
    peaks: &[Peak],
    mut saddles: Vec<Saddle>,
    merging_threshold: f64,
    peak_threshold: f64,
) -> Vec<Option<usize>> {
    let pair_ids = |s: &Saddle| {
        let (x, y) = (peaks[s.a].id, peaks[s.b].id);
        (x.min(y), x.max(y))
    };
    saddles.sort_unstable_by(|s, t| {
        t.density
            .total_cmp(&s.density)
            .then_with(|| pair_ids(s).cmp(&pair_ids(t)))
    });

    let mut uf = UnionFind::new(peaks.len());
    // Densest peak slot of every set, valid at set roots.
    let mut top: Vec<usize> = (0..peaks.len()).collect();
    let mut n_merges = 0usize;
    for saddle in &saddles {
        let (ra, rb) = (uf.find(saddle.a), uf.find(saddle.b));
        if ra == rb {
            continue;
        }
        let (pa, pb) = (peaks[top[ra]], peaks[top[rb]]);
        let weak = pa.density < peak_threshold || pb.density < peak_threshold;
        if weak || saddle.density > merging_threshold * pa.density.min(pb.density) {
            let densest = match density_order(pa.density, pa.id, pb.density, pb.id) {
                Ordering::Greater => top[ra],
                _ => top[rb],
            };
            let root = uf.union(ra, rb);
            top[root] = densest;
            n_merges += 1;
        }
    }
    debug!(n_merges, "peak merging done");

    (0..peaks.len())
        .map(|slot| {
            let t = top[uf.find(slot)];
            (peaks[t].density >= peak_threshold).then_some(t)
        })
        .collect()
}

/// HOP over a built index.
pub fn run_hop(index: &SpatialIndex, config: &HopConfig) -> Result<GroupAssignment> {
    HopGrouper::new(index, config)?.group()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DensityKernel, DensityThreshold};
    use crate::domain::Domain;
    use crate::particle::{Particle, particles_from_positions};
    use nalgebra::Vector3;

    fn peak(index: usize, density: f64) -> Peak {
        Peak {
            index,
            id: index as ParticleId,
            density,
        }
    }

    fn clump(center: Vector3<f64>, spacing: f64) -> Vec<Vector3<f64>> {
        let mut positions = Vec::new();
        for i in -1..=1 {
            for j in -1..=1 {
                for k in -1..=1 {
                    positions.push(center + Vector3::new(i as f64, j as f64, k as f64) * spacing);
                }
            }
        }
        positions
    }

    fn small_config() -> HopConfig {
        HopConfig {
            num_neighbors: 8,
            num_hop: 8,
            num_merge: 8,
            kernel: DensityKernel::Spline,
            merging_threshold: 0.01,
            outer_density_threshold: DensityThreshold::Absolute(0.0),
            peak_density_threshold: None,
            min_group_size: 5,
        }
    }

    #[test]
    fn test_saddle_below_threshold_keeps_peaks_apart() {
        let peaks = [peak(0, 10.0), peak(1, 8.0)];
        let saddles = vec![Saddle {
            a: 0,
            b: 1,
            density: 3.0,
        }];
        assert_eq!(
            merge_peaks(&peaks, saddles.clone(), 0.5, 0.0),
            vec![Some(0), Some(1)]
        );
        assert_eq!(merge_peaks(&peaks, saddles, 0.25, 0.0), vec![Some(0), Some(0)]);
    }

    #[test]
    fn test_merged_group_compares_against_densest_peak() {
        // 0 and 1 merge first; the merged group then peaks at 10, so the
        // boundary to 2 is judged against min(10, 6).
        let peaks = [peak(0, 10.0), peak(1, 9.0), peak(2, 6.0)];
        let saddles = vec![
            Saddle {
                a: 0,
                b: 1,
                density: 8.0,
            },
            Saddle {
                a: 1,
                b: 2,
                density: 2.5,
            },
        ];
        assert_eq!(
            merge_peaks(&peaks, saddles.clone(), 0.5, 0.0),
            vec![Some(0), Some(0), Some(2)]
        );
        assert_eq!(
            merge_peaks(&peaks, saddles, 0.4, 0.0),
            vec![Some(0), Some(0), Some(0)]
        );
    }

    #[test]
    fn test_weak_peaks_attach_or_vanish() {
        let peaks = [peak(0, 10.0), peak(1, 2.0), peak(2, 1.5)];
        let saddles = vec![Saddle {
            a: 0,
            b: 1,
            density: 1.0,
        }];
        // Peak 1 is below the peak threshold and joins 0; peak 2 is isolated.
        assert_eq!(
            merge_peaks(&peaks, saddles, 0.5, 5.0),
            vec![Some(0), Some(0), None]
        );
    }

    #[test]
    fn test_equal_saddles_resolved_by_id() {
        let peaks = [peak(0, 10.0), peak(1, 10.0), peak(2, 10.0)];
        let saddles = vec![
            Saddle {
                a: 1,
                b: 2,
                density: 6.0,
            },
            Saddle {
                a: 0,
                b: 1,
                density: 6.0,
            },
        ];
        // Equal densities: the lower id is the denser peak.
        assert_eq!(
            merge_peaks(&peaks, saddles, 0.5, 0.0),
            vec![Some(0), Some(0), Some(0)]
        );
    }

    #[test]
    fn test_chain_follows_density() {
        let particles = particles_from_positions(&[
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::new(3.0, 0.0, 0.0),
        ]);
        let index = SpatialIndex::from_particles(&particles, None).unwrap();
        let grouper = HopGrouper::new(&index, &small_config()).unwrap();
        // Particle 0 is a local maximum; 1 climbs through 2 to 3.
        let densities = vec![2.0, 1.0, 3.0, 4.0];
        let neighbors = vec![0, 1, 1, 2, 2, 3, 3, 2];
        let field = DensityField::from_parts(densities, neighbors, 2);
        assert_eq!(grouper.chain(&field), vec![0, 3, 3, 3]);
    }

    #[test]
    fn test_separate_clumps() {
        let mut positions = clump(Vector3::new(0.25, 0.25, 0.25), 0.01);
        positions.extend(clump(Vector3::new(0.75, 0.75, 0.75), 0.01));
        let particles = particles_from_positions(&positions);
        let index = SpatialIndex::from_particles(&particles, Some(1.0)).unwrap();
        let assignment = run_hop(&index, &small_config()).unwrap();

        assert_eq!(assignment.num_groups(), 2);
        assert_eq!(assignment.num_unassigned(), 0);
        assert!((0..27).all(|i| assignment.group_of(i) == Some(0)));
        assert!((27..54).all(|i| assignment.group_of(i) == Some(1)));
        assert!(assignment.densities().is_some());
    }

    #[test]
    fn test_outer_threshold_unassigns_sparse_particles() {
        let mut positions = clump(Vector3::new(0.3, 0.3, 0.3), 0.01);
        positions.extend([
            Vector3::new(0.9, 0.1, 0.5),
            Vector3::new(0.1, 0.9, 0.7),
            Vector3::new(0.6, 0.6, 0.05),
        ]);
        let particles = particles_from_positions(&positions);
        let index = SpatialIndex::from_particles(&particles, Some(1.0)).unwrap();
        let config = small_config();
        let densities =
            crate::density::estimate_densities(&index, config.num_neighbors, config.kernel).unwrap();
        let clump_min = densities[..27].iter().cloned().fold(f64::INFINITY, f64::min);

        let config = HopConfig {
            outer_density_threshold: DensityThreshold::Absolute(0.5 * clump_min),
            ..config
        };
        let assignment = run_hop(&index, &config).unwrap();
        assert_eq!(assignment.num_groups(), 1);
        assert_eq!(assignment.num_unassigned(), 3);
        assert!((27..30).all(|i| assignment.group_of(i).is_none()));
    }

    #[test]
    fn test_min_group_size_drops_small_groups() {
        let mut positions = clump(Vector3::new(0.3, 0.3, 0.3), 0.01);
        positions.extend(clump(Vector3::new(0.7, 0.7, 0.7), 0.01));
        let particles = particles_from_positions(&positions);
        let index = SpatialIndex::from_particles(&particles, Some(1.0)).unwrap();
        let config = HopConfig {
            min_group_size: 28,
            ..small_config()
        };
        let assignment = run_hop(&index, &config).unwrap();
        assert_eq!(assignment.num_groups(), 0);
        assert_eq!(assignment.num_unassigned(), 54);
    }

    #[test]
    fn test_order_independent() {
        let mut positions = clump(Vector3::new(0.25, 0.25, 0.25), 0.012);
        positions.extend(clump(Vector3::new(0.6, 0.3, 0.4), 0.015));
        let particles: Vec<Particle> = positions
            .iter()
            .enumerate()
            .map(|(i, p)| Particle::new(1000 - i as ParticleId, *p))
            .collect();
        let mut reversed = particles.clone();
        reversed.reverse();

        let a = SpatialIndex::from_particles(&particles, Some(1.0)).unwrap();
        let b = SpatialIndex::from_particles(&reversed, Some(1.0)).unwrap();
        let ga = run_hop(&a, &small_config()).unwrap().to_id_map();
        let gb = run_hop(&b, &small_config()).unwrap().to_id_map();
        assert_eq!(ga, gb);
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        let particles = particles_from_positions(&clump(Vector3::new(0.5, 0.5, 0.5), 0.1));
        let index = SpatialIndex::from_particles(&particles, None).unwrap();
        let config = HopConfig {
            merging_threshold: 1.5,
            ..small_config()
        };
        assert!(matches!(
            run_hop(&index, &config),
            Err(HaloError::InvalidInput(_))
        ));
        let config = HopConfig {
            num_hop: 9,
            ..small_config()
        };
        assert!(matches!(
            run_hop(&index, &config),
            Err(HaloError::Configuration(_))
        ));

        let unbuilt = SpatialIndex::new(&particles, Domain::open());
        assert!(matches!(
            run_hop(&unbuilt, &small_config()),
            Err(HaloError::NotInitialized)
        ));
    }

    #[test]
    fn test_cancel_after_density_estimation() {
        let particles = particles_from_positions(&clump(Vector3::new(0.5, 0.5, 0.5), 0.1));
        let index = SpatialIndex::from_particles(&particles, None).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = HopGrouper::new(&index, &small_config())
            .unwrap()
            .group_with_cancel(&cancel);
        assert_eq!(
            result,
            Err(HaloError::Cancelled(Phase::DensityEstimation))
        );
    }
}
