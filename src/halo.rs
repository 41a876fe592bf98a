use crate::density::density_order;
use crate::domain::Domain;
use crate::error::{HaloError, Result};
use crate::group::GroupAssignment;
use crate::particle::{Particle, ParticleId};
use nalgebra::Vector3;
use rayon::prelude::*;
use std::cmp::Ordering;
use tracing::{debug, info_span};

/// Densest member of a HOP halo.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DensityPeak {
    pub particle_id: ParticleId,
    pub density: f64,
    pub position: Vector3<f64>,
}

/// One catalog entry.
#[derive(Clone, Debug, PartialEq)]
pub struct Halo {
    pub id: usize,
    /// Member ids, ascending.
    pub particle_ids: Vec<ParticleId>,
    pub total_mass: f64,
    /// Mass-weighted mean position, wrapped into the box when periodic.
    pub center_of_mass: Vector3<f64>,
    /// Present only when every input particle carries a velocity.
    pub bulk_velocity: Option<Vector3<f64>>,
    /// Mass-weighted rms of member velocities about the bulk velocity.
    pub rms_velocity: Option<f64>,
    /// Largest distance from the center of mass to a member.
    pub maximum_radius: f64,
    pub peak: Option<DensityPeak>,
}

impl Halo {
    pub fn num_particles(&self) -> usize {
        self.particle_ids.len()
    }
}

/// Turns a group assignment into a sorted halo catalog.
pub struct HaloAssembler<'p> {
    particles: &'p [Particle],
    id_offset: usize,
}

impl<'p> HaloAssembler<'p> {
    pub fn new(particles: &'p [Particle]) -> Self {
        Self {
            particles,
            id_offset: 0,
        }
    }

    pub fn with_id_offset(mut self, id_offset: usize) -> Self {
        self.id_offset = id_offset;
        self
    }

    pub fn assemble(&self, assignment: &GroupAssignment) -> Result<Vec<Halo>> {
        let _span = info_span!(
            "assemble_halos",
            n_particles = self.particles.len(),
            n_groups = assignment.num_groups()
        )
        .entered();
        if self.particles.is_empty() {
            return Err(HaloError::InvalidInput("empty particle set".to_string()));
        }
        if assignment.len() != self.particles.len() {
            return Err(HaloError::InvalidInput(format!(
                "group assignment covers {} particles, expected {}",
                assignment.len(),
                self.particles.len()
            )));
        }
        if let Some((i, (p, &id))) = self
            .particles
            .iter()
            .zip(assignment.ids())
            .enumerate()
            .find(|(_, (p, id))| p.id != **id)
        {
            return Err(HaloError::InvalidInput(format!(
                "particle {} has id {}, but the group assignment was built with id {} there",
                i, p.id, id
            )));
        }

        let with_velocities = self.particles.par_iter().all(|p| p.velocity.is_some());
        let domain = *assignment.domain();
        let densities = assignment.densities();

        let mut halos: Vec<Halo> = assignment
            .members()
            .par_iter()
            .map(|members| self.build_halo(members, &domain, densities, with_velocities))
            .collect();

        halos.par_sort_unstable_by(compare_halos);
        for (rank, halo) in halos.iter_mut().enumerate() {
            halo.id = self.id_offset + rank;
        }
        debug!(n_halos = halos.len(), "halos assembled");
        Ok(halos)
    }

    fn build_halo(
        &self,
        members: &[usize],
        domain: &Domain,
        densities: Option<&[f64]>,
        with_velocities: bool,
    ) -> Halo {
        let particles = self.particles;
        let mut particle_ids: Vec<ParticleId> = members.iter().map(|&i| particles[i].id).collect();
        particle_ids.sort_unstable();

        // Positions are unwrapped around the member with the smallest id.
        let anchor = members
            .iter()
            .copied()
            .min_by_key(|&i| particles[i].id)
            .map_or_else(Vector3::zeros, |i| domain.wrap(&particles[i].position));
        let unwrapped = |i: usize| anchor + domain.displacement(&anchor, &particles[i].position);

        let total_mass: f64 = members.iter().map(|&i| particles[i].mass()).sum();
        // Massless groups fall back to equal weights.
        let weight = |i: usize| {
            if total_mass > 0.0 {
                particles[i].mass()
            } else {
                1.0
            }
        };
        let total_weight = if total_mass > 0.0 {
            total_mass
        } else {
            members.len() as f64
        };

        let weighted_position: Vector3<f64> = members.iter().map(|&i| unwrapped(i) * weight(i)).sum();
        let center_of_mass = domain.wrap(&(weighted_position / total_weight));

        let maximum_radius = members
            .iter()
            .map(|&i| domain.distance(&center_of_mass, &particles[i].position))
            .fold(0.0, f64::max);

        let (bulk_velocity, rms_velocity) = if with_velocities {
            let velocity = |i: usize| particles[i].velocity.unwrap_or_else(Vector3::zeros);
            let bulk: Vector3<f64> =
                members.iter().map(|&i| velocity(i) * weight(i)).sum::<Vector3<f64>>() / total_weight;
            let dispersion: f64 = members
                .iter()
                .map(|&i| weight(i) * (velocity(i) - bulk).norm_squared())
                .sum();
            (Some(bulk), Some((dispersion / total_weight).sqrt()))
        } else {
            (None, None)
        };

        let peak = densities.and_then(|rho| {
            members
                .iter()
                .copied()
                .max_by(|&a, &b| density_order(rho[a], particles[a].id, rho[b], particles[b].id))
                .map(|i| DensityPeak {
                    particle_id: particles[i].id,
                    density: rho[i],
                    position: domain.wrap(&particles[i].position),
                })
        });

        Halo {
            id: 0,
            particle_ids,
            total_mass,
            center_of_mass,
            bulk_velocity,
            rms_velocity,
            maximum_radius,
            peak,
        }
    }
}

/// Halo catalog for `assignment`, heaviest first, ids from 0.
pub fn assemble_halos(particles: &[Particle], assignment: &GroupAssignment) -> Result<Vec<Halo>> {
    HaloAssembler::new(particles).assemble(assignment)
}

/// Catalog order: heavier first, then more particles, then smallest member id.
pub fn compare_halos(a: &Halo, b: &Halo) -> Ordering {
    b.total_mass
        .total_cmp(&a.total_mass)
        .then(b.num_particles().cmp(&a.num_particles()))
        .then(a.particle_ids.first().cmp(&b.particle_ids.first()))
}
