pub mod api;
pub mod cancel;
pub mod config;
pub mod density;
pub mod domain;
pub mod error;
pub mod fof;
pub mod group;
pub mod halo;
pub mod hop;
pub mod kdtree;
pub mod particle;
pub mod union_find;

#[cfg(feature = "python")]
mod python_api;

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

pub use api::{
    assemble_halos, build_index, find_halos, find_halos_with_cancel, run_fof, run_hop,
};
pub use cancel::{CancelToken, Phase};
pub use config::{
    DensityKernel, DensityThreshold, FofConfig, HaloFinderConfig, HaloFinderMethod, HopConfig,
    LinkingLength,
};
pub use domain::Domain;
pub use error::{HaloError, Result};
pub use group::GroupAssignment;
pub use halo::{DensityPeak, Halo};
pub use kdtree::SpatialIndex;
pub use particle::{Particle, ParticleId};

use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber; `RUST_LOG` wins over `level`. Later calls are no-ops.
pub fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .with_thread_ids(true)
        .try_init();
}
