mod common;

use halofinder_rs::{Domain, HaloError, Particle, ParticleId, SpatialIndex, build_index};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;

#[test]
fn test_periodic_neighbors_across_boundary() {
    let l = 1.0;
    let particles = vec![
        Particle::new(0, Vector3::new(0.001, 0.3, 0.7)),
        Particle::new(1, Vector3::new(l - 0.001, 0.3, 0.7)),
    ];
    let index = build_index(&particles, Some(l)).unwrap();

    for radius in [0.0021, 0.01, 0.3] {
        let ids = index.query_radius(&particles[0].position, radius).unwrap();
        assert_eq!(ids, vec![0, 1], "radius {}", radius);
    }

    let open = build_index(&particles, None).unwrap();
    assert_eq!(open.query_radius(&particles[0].position, 0.01).unwrap(), vec![0]);
}

#[test]
fn test_queries_match_brute_force() {
    let particles = common::uniform_particles(2000, 7);
    let index = build_index(&particles, Some(1.0)).unwrap();
    let domain = Domain::periodic(1.0).unwrap();
    let probes = common::uniform_particles(20, 8);

    for probe in &probes {
        let mut expected: Vec<ParticleId> = particles
            .iter()
            .filter(|p| domain.distance(&probe.position, &p.position) <= 0.08)
            .map(|p| p.id)
            .collect();
        expected.sort_unstable();
        assert_eq!(index.query_radius(&probe.position, 0.08).unwrap(), expected);

        let mut by_distance: Vec<(ParticleId, f64)> = particles
            .iter()
            .map(|p| (p.id, domain.distance(&probe.position, &p.position)))
            .collect();
        by_distance.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        let nearest = index.query_k_nearest(&probe.position, 10).unwrap();
        let nearest_ids: Vec<ParticleId> = nearest.iter().map(|n| n.0).collect();
        let expected_ids: Vec<ParticleId> = by_distance[..10].iter().map(|n| n.0).collect();
        assert_eq!(nearest_ids, expected_ids);
        assert!(nearest.windows(2).all(|w| w[0].1 <= w[1].1));
    }
}

#[test]
fn test_insertion_order_does_not_matter() {
    let particles = common::uniform_particles(1500, 11);
    let mut shuffled = particles.clone();
    shuffled.shuffle(&mut ChaCha8Rng::seed_from_u64(12));

    for box_size in [None, Some(1.0)] {
        let a = build_index(&particles, box_size).unwrap();
        let b = build_index(&shuffled, box_size).unwrap();
        for probe in particles.iter().step_by(50) {
            assert_eq!(
                a.query_radius(&probe.position, 0.1).unwrap(),
                b.query_radius(&probe.position, 0.1).unwrap()
            );
            assert_eq!(
                a.query_k_nearest(&probe.position, 16).unwrap(),
                b.query_k_nearest(&probe.position, 16).unwrap()
            );
        }
    }
}

#[test]
fn test_unbuilt_index_reports_not_initialized() {
    let particles = common::uniform_particles(10, 1);
    let mut index = SpatialIndex::new(&particles, Domain::open());
    assert_eq!(
        index.query_radius(&Vector3::zeros(), 0.5),
        Err(HaloError::NotInitialized)
    );
    index.build().unwrap();
    assert!(index.is_built());
    assert_eq!(index.query_k_nearest(&Vector3::zeros(), 3).unwrap().len(), 3);
}

#[test]
fn test_all_coincident_particles_still_build() {
    let particles: Vec<Particle> = (0..500)
        .map(|i| Particle::new(i, Vector3::new(0.25, 0.25, 0.25)))
        .collect();
    let index = build_index(&particles, Some(1.0)).unwrap();
    assert_eq!(index.query_radius(&Vector3::new(0.25, 0.25, 0.25), 0.0).unwrap().len(), 500);
    let nearest = index.query_k_nearest(&Vector3::new(0.3, 0.3, 0.3), 4).unwrap();
    assert_eq!(nearest.iter().map(|n| n.0).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
}
