use crate::cancel::{CancelToken, Phase};
use crate::config::{HaloFinderConfig, HaloFinderMethod};
use crate::error::Result;
use crate::halo::{Halo, HaloAssembler};
use crate::hop::HopGrouper;
use crate::kdtree::SpatialIndex;
use crate::particle::Particle;
use tracing::{info, info_span};

pub use crate::fof::run_fof;
pub use crate::halo::assemble_halos;
pub use crate::hop::run_hop;

/// Builds a kd-tree over `particles`; `box_size` makes the domain a periodic cube.
pub fn build_index(particles: &[Particle], box_size: Option<f64>) -> Result<SpatialIndex<'_>> {
    SpatialIndex::from_particles(particles, box_size)
}

/// Runs the whole pipeline: index, linker, minimum-size filter, catalog.
pub fn find_halos(particles: &[Particle], config: &HaloFinderConfig) -> Result<Vec<Halo>> {
    find_halos_with_cancel(particles, config, &CancelToken::new())
}

/// As `find_halos`, checking `cancel` at every phase boundary.
pub fn find_halos_with_cancel(
    particles: &[Particle],
    config: &HaloFinderConfig,
    cancel: &CancelToken,
) -> Result<Vec<Halo>> {
    let _span = info_span!("find_halos", n_particles = particles.len()).entered();
    config.validate()?;

    let index = build_index(particles, config.box_size)?;
    cancel.check(Phase::IndexBuild)?;

    let assignment = match &config.method {
        HaloFinderMethod::Fof(fof) => {
            let assignment =
                run_fof(&index, fof.linking_length)?.with_min_group_size(fof.min_group_size);
            cancel.check(Phase::Linking)?;
            assignment
        }
        HaloFinderMethod::Hop(hop) => {
            let assignment = HopGrouper::new(&index, hop)?.group_with_cancel(cancel)?;
            cancel.check(Phase::Regroup)?;
            assignment
        }
    };

    let halos = HaloAssembler::new(particles)
        .with_id_offset(config.id_offset)
        .assemble(&assignment)?;
    info!(
        n_halos = halos.len(),
        n_unassigned = assignment.num_unassigned(),
        "halo finding done"
    );
    Ok(halos)
}
