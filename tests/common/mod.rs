#![allow(dead_code)]

use halofinder_rs::{Particle, ParticleId};
use nalgebra::Vector3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

pub const BLOB_CENTERS: [[f64; 3]; 3] = [[0.2, 0.2, 0.2], [0.8, 0.2, 0.2], [0.5, 0.8, 0.5]];

pub fn uniform_particles(n: usize, seed: u64) -> Vec<Particle> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let p = Vector3::new(rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0));
            Particle::new(i as ParticleId, p)
        })
        .collect()
}

/// Gaussian blobs in the unit box; returns the particles and each particle's blob.
pub fn gaussian_blobs(
    centers: &[[f64; 3]],
    sigma: f64,
    total: usize,
    seed: u64,
) -> (Vec<Particle>, Vec<usize>) {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).unwrap();
    let mut particles = Vec::with_capacity(total);
    let mut blob_of = Vec::with_capacity(total);
    for i in 0..total {
        let blob = i % centers.len();
        let c = centers[blob];
        let p = Vector3::new(
            (c[0] + normal.sample(&mut rng)).rem_euclid(1.0),
            (c[1] + normal.sample(&mut rng)).rem_euclid(1.0),
            (c[2] + normal.sample(&mut rng)).rem_euclid(1.0),
        );
        particles.push(Particle::new(i as ParticleId, p));
        blob_of.push(blob);
    }
    (particles, blob_of)
}

/// Fraction of each blob's particles found in the single halo that holds most of it.
pub fn blob_recovery(
    halos: &[halofinder_rs::Halo],
    blob_of: &[usize],
    n_blobs: usize,
) -> Vec<(usize, f64)> {
    let mut blob_sizes = vec![0usize; n_blobs];
    for &b in blob_of {
        blob_sizes[b] += 1;
    }
    (0..n_blobs)
        .map(|b| {
            let (best_halo, best_count) = halos
                .iter()
                .map(|h| {
                    let count = h
                        .particle_ids
                        .iter()
                        .filter(|&&id| blob_of[id as usize] == b)
                        .count();
                    (h.id, count)
                })
                .max_by_key(|&(_, count)| count)
                .unwrap_or((usize::MAX, 0));
            (best_halo, best_count as f64 / blob_sizes[b] as f64)
        })
        .collect()
}
