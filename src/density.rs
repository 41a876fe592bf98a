use crate::config::{self, DensityKernel};
use crate::error::{HaloError, Result};
use crate::kdtree::{Neighbor, SpatialIndex};
use crate::particle::{Particle, ParticleId};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::f64::consts::PI;
use tracing::{debug, info_span};

const PARALLEL_TASKS_PER_THREAD: usize = 64;

/// Total order on particles by density; `Greater` means `a` is denser.
/// Equal densities rank the lower id as denser.
pub fn density_order(rho_a: f64, id_a: ParticleId, rho_b: f64, id_b: ParticleId) -> Ordering {
    rho_a.total_cmp(&rho_b).then(id_b.cmp(&id_a))
}

/// Per-particle densities plus the leading entries of each particle's
/// neighbor list (nearest first, the particle itself included).
#[derive(Clone, Debug)]
pub struct DensityField {
    densities: Vec<f64>,
    /// Row-major, `stride` entries per particle.
    neighbors: Vec<u32>,
    stride: usize,
}

impl DensityField {
    #[cfg(test)]
    pub(crate) fn from_parts(densities: Vec<f64>, neighbors: Vec<u32>, stride: usize) -> Self {
        debug_assert_eq!(densities.len() * stride, neighbors.len());
        Self {
            densities,
            neighbors,
            stride,
        }
    }

    pub fn len(&self) -> usize {
        self.densities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.densities.is_empty()
    }

    pub fn densities(&self) -> &[f64] {
        &self.densities
    }

    pub fn into_densities(self) -> Vec<f64> {
        self.densities
    }

    /// Number of neighbors kept per particle.
    pub fn retained(&self) -> usize {
        self.stride
    }

    /// Particle indices of the retained neighbors of `i`, nearest first.
    pub fn neighbors_of(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        self.neighbors[i * self.stride..(i + 1) * self.stride]
            .iter()
            .map(|&j| j as usize)
    }
}

/// k-nearest-neighbor density estimate at every particle.
pub struct DensityEstimator<'i, 'a> {
    index: &'i SpatialIndex<'a>,
    num_neighbors: usize,
    kernel: DensityKernel,
    retain: usize,
}

impl<'i, 'a> DensityEstimator<'i, 'a> {
    pub fn new(index: &'i SpatialIndex<'a>, num_neighbors: usize, kernel: DensityKernel) -> Result<Self> {
        if !index.is_built() {
            return Err(HaloError::NotInitialized);
        }
        if num_neighbors == 0 {
            return Err(HaloError::InvalidInput(
                "num_neighbors must be positive".to_string(),
            ));
        }
        if index.len() > u32::MAX as usize {
            return Err(HaloError::InvalidInput(format!(
                "{} particles exceed the supported maximum of {}",
                index.len(),
                u32::MAX
            )));
        }
        Ok(Self {
            index,
            num_neighbors,
            kernel,
            retain: 1,
        })
    }

    /// Keeps the `count` nearest neighbors of every particle in the result.
    pub fn with_retained_neighbors(mut self, count: usize) -> Self {
        self.retain = count;
        self
    }

    pub fn estimate(&self) -> Result<DensityField> {
        let n = self.index.len();
        let k = self.num_neighbors.min(n);
        let stride = self.retain.clamp(1, k);
        let _span = info_span!("estimate_densities", n_particles = n, k, kernel = ?self.kernel)
            .entered();

        let mut densities = vec![0.0; n];
        let mut neighbors = vec![0u32; n * stride];

        if n >= config::get_parallel_threshold() {
            let num_threads = rayon::current_num_threads();
            let min_len = (n / (num_threads * PARALLEL_TASKS_PER_THREAD)).max(1);
            densities
                .par_iter_mut()
                .zip(neighbors.par_chunks_mut(stride))
                .enumerate()
                .with_min_len(min_len)
                .try_for_each(|(i, (rho, slot))| {
                    *rho = self.estimate_one(i, k, slot)?;
                    Ok::<(), HaloError>(())
                })?;
        } else {
            for (i, (rho, slot)) in densities
                .iter_mut()
                .zip(neighbors.chunks_mut(stride))
                .enumerate()
            {
                *rho = self.estimate_one(i, k, slot)?;
            }
        }

        let n_infinite = densities.iter().filter(|d| d.is_infinite()).count();
        if n_infinite > 0 {
            debug!(n_infinite, "particles with coincident neighbor sets");
        }
        Ok(DensityField {
            densities,
            neighbors,
            stride,
        })
    }

    fn estimate_one(&self, i: usize, k: usize, slot: &mut [u32]) -> Result<f64> {
        let particles = self.index.particles();
        let found = self.index.nearest_neighbors(&particles[i].position, k)?;
        for (dst, n) in slot.iter_mut().zip(&found) {
            *dst = n.index as u32;
        }
        Ok(match self.kernel {
            DensityKernel::Spline => spline_density(&found, particles),
            DensityKernel::TopHat => top_hat_density(&found, particles),
        })
    }
}

/// Densities only, for callers that do not need neighbor lists.
pub fn estimate_densities(
    index: &SpatialIndex,
    num_neighbors: usize,
    kernel: DensityKernel,
) -> Result<Vec<f64>> {
    Ok(DensityEstimator::new(index, num_neighbors, kernel)?
        .estimate()?
        .into_densities())
}

/// Cubic-spline (M4) SPH kernel in units of `1 / (pi h^3)`, with `q = r / h`.
fn spline_kernel(q2: f64) -> f64 {
    let q = q2.sqrt();
    if q < 1.0 {
        1.0 - 1.5 * q2 + 0.75 * q2 * q
    } else if q < 2.0 {
        let t = 2.0 - q;
        0.25 * t * t * t
    } else {
        0.0
    }
}

// The smoothing length is half the distance to the farthest neighbor, so the
// kernel support ends exactly there.
fn spline_density(found: &[Neighbor], particles: &[Particle]) -> f64 {
    let r_max2 = found.last().map_or(0.0, |n| n.distance_squared);
    if r_max2 <= 0.0 {
        return f64::INFINITY;
    }
    let h2 = 0.25 * r_max2;
    let h = h2.sqrt();
    let sum: f64 = found
        .iter()
        .map(|n| particles[n.index].mass() * spline_kernel(n.distance_squared / h2))
        .sum();
    sum / (PI * h2 * h)
}

fn top_hat_density(found: &[Neighbor], particles: &[Particle]) -> f64 {
    let r_max2 = found.last().map_or(0.0, |n| n.distance_squared);
    if r_max2 <= 0.0 {
        return f64::INFINITY;
    }
    let mass: f64 = found.iter().map(|n| particles[n.index].mass()).sum();
    mass / (4.0 / 3.0 * PI * r_max2 * r_max2.sqrt())
}
