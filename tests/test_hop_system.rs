mod common;

use halofinder_rs::density::estimate_densities;
use halofinder_rs::{
    DensityThreshold, HaloFinderConfig, HopConfig, assemble_halos, build_index, find_halos,
    run_hop,
};
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

const TWO_PEAK_CENTERS: [[f64; 3]; 2] = [[0.35, 0.5, 0.5], [0.65, 0.5, 0.5]];

#[test]
fn test_three_blobs_with_defaults() {
    let (particles, blob_of) = common::gaussian_blobs(&common::BLOB_CENTERS, 0.02, 1000, 3);
    let config = HaloFinderConfig::hop(HopConfig::default()).with_box_size(1.0);
    let halos = find_halos(&particles, &config).unwrap();

    assert_eq!(halos.len(), 3);
    let recovery = common::blob_recovery(&halos, &blob_of, 3);
    for (_, fraction) in &recovery {
        assert!(*fraction >= 0.95, "recovered {}", fraction);
    }
    assert_ne!(recovery[0].0, recovery[1].0);
    assert_ne!(recovery[1].0, recovery[2].0);
    assert_ne!(recovery[0].0, recovery[2].0);
    assert!(halos.iter().all(|h| h.peak.is_some()));
}

#[test]
fn test_single_peak_is_one_halo() {
    let (particles, _) = common::gaussian_blobs(&[[0.5, 0.5, 0.5]], 0.05, 2000, 21);
    let index = build_index(&particles, Some(1.0)).unwrap();
    let config = HopConfig::default();
    let densities = estimate_densities(&index, config.num_neighbors, config.kernel).unwrap();
    let max_density = densities.iter().cloned().fold(0.0, f64::max);
    let outer = 0.1 * max_density;

    let config = HopConfig {
        outer_density_threshold: DensityThreshold::Absolute(outer),
        ..config
    };
    let assignment = run_hop(&index, &config).unwrap();
    assert_eq!(assignment.num_groups(), 1);
    for (i, rho) in densities.iter().enumerate() {
        if *rho >= outer {
            assert_eq!(assignment.group_of(i), Some(0));
        } else {
            assert_eq!(assignment.group_of(i), None);
        }
    }
}

#[test]
fn test_merging_threshold_controls_saddle_merges() {
    let (particles, blob_of) = common::gaussian_blobs(&TWO_PEAK_CENTERS, 0.05, 4000, 17);
    let index = build_index(&particles, Some(1.0)).unwrap();
    let base = HopConfig {
        outer_density_threshold: DensityThreshold::Absolute(0.0),
        min_group_size: 20,
        ..HopConfig::default()
    };

    let distinct = run_hop(&index, &base).unwrap();
    assert_eq!(distinct.num_groups(), 2);
    let halos = assemble_halos(&particles, &distinct).unwrap();
    let recovery = common::blob_recovery(&halos, &blob_of, 2);
    assert_ne!(recovery[0].0, recovery[1].0);

    let merged = run_hop(
        &index,
        &HopConfig {
            merging_threshold: 1e-6,
            ..base
        },
    )
    .unwrap();
    assert_eq!(merged.num_groups(), 1);
}

#[test]
fn test_hop_is_reproducible_under_shuffling() {
    let (particles, _) = common::gaussian_blobs(&common::BLOB_CENTERS, 0.03, 1500, 31);
    let mut shuffled = particles.clone();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(32));

    let config = HopConfig::default();
    let a = run_hop(&build_index(&particles, Some(1.0)).unwrap(), &config).unwrap();
    let b = run_hop(&build_index(&shuffled, Some(1.0)).unwrap(), &config).unwrap();
    assert_eq!(a.to_id_map(), b.to_id_map());
    assert_eq!(a.num_groups(), b.num_groups());
}

#[test]
fn test_overdensity_threshold_needs_volume() {
    use halofinder_rs::{HaloError, Particle};
    use nalgebra::Vector3;

    // Collinear particles in an open domain span no volume.
    let particles: Vec<Particle> = (0..20)
        .map(|i| Particle::new(i, Vector3::new(i as f64, 0.0, 0.0)))
        .collect();
    let index = build_index(&particles, None).unwrap();
    let config = HopConfig {
        num_neighbors: 8,
        num_hop: 4,
        num_merge: 4,
        ..HopConfig::default()
    };
    assert!(matches!(
        run_hop(&index, &config),
        Err(HaloError::DegenerateGeometry(_))
    ));
}
