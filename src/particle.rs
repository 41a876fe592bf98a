use nalgebra::Vector3;

pub type ParticleId = i64;

/// Mass assumed for particles that carry none.
pub const DEFAULT_PARTICLE_MASS: f64 = 1.0;

/// One simulation particle. Never mutated by the halo finder.
#[derive(Clone, Debug, PartialEq)]
pub struct Particle {
    pub id: ParticleId,
    pub position: Vector3<f64>,
    pub velocity: Option<Vector3<f64>>,
    pub mass: Option<f64>,
}

impl Particle {
    pub fn new(id: ParticleId, position: Vector3<f64>) -> Self {
        Self {
            id,
            position,
            velocity: None,
            mass: None,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = Some(velocity);
        self
    }

    pub fn with_mass(mut self, mass: f64) -> Self {
        self.mass = Some(mass);
        self
    }

    pub fn mass(&self) -> f64 {
        self.mass.unwrap_or(DEFAULT_PARTICLE_MASS)
    }
}

/// Builds particles with sequential ids from bare positions.
pub fn particles_from_positions(positions: &[Vector3<f64>]) -> Vec<Particle> {
    positions
        .iter()
        .enumerate()
        .map(|(i, p)| Particle::new(i as ParticleId, *p))
        .collect()
}
