use crate::error::{HaloError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

include!(concat!(env!("OUT_DIR"), "/tuned_constants.rs"));

/// Smallest bucket the kd-tree will accept as a leaf.
pub const MIN_LEAF_SIZE: usize = 1;

static LEAF_SIZE: AtomicUsize = AtomicUsize::new(TUNED_LEAF_SIZE);
static PARALLEL_THRESHOLD: AtomicUsize = AtomicUsize::new(TUNED_PARALLEL_THRESHOLD);

pub fn get_leaf_size() -> usize {
    LEAF_SIZE.load(Ordering::Relaxed)
}

pub fn set_leaf_size(val: usize) {
    LEAF_SIZE.store(val.max(MIN_LEAF_SIZE), Ordering::Relaxed);
}

pub fn get_parallel_threshold() -> usize {
    PARALLEL_THRESHOLD.load(Ordering::Relaxed)
}

pub fn set_parallel_threshold(val: usize) {
    PARALLEL_THRESHOLD.store(val, Ordering::Relaxed);
}

/// FOF linking length, either absolute or relative to the mean
/// inter-particle spacing `(V / N)^(1/3)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LinkingLength {
    Absolute(f64),
    MeanSpacingFraction(f64),
}

impl LinkingLength {
    pub fn validate(&self) -> Result<()> {
        let value = match self {
            Self::Absolute(b) | Self::MeanSpacingFraction(b) => *b,
        };
        if !value.is_finite() || value <= 0.0 {
            return Err(HaloError::InvalidInput(format!(
                "linking length must be positive and finite, got {}",
                value
            )));
        }
        Ok(())
    }

    /// Converts to an absolute distance given the mean inter-particle spacing.
    pub fn resolve(&self, mean_spacing: impl FnOnce() -> Result<f64>) -> Result<f64> {
        self.validate()?;
        match *self {
            Self::Absolute(b) => Ok(b),
            Self::MeanSpacingFraction(f) => Ok(f * mean_spacing()?),
        }
    }
}

impl Default for LinkingLength {
    fn default() -> Self {
        Self::MeanSpacingFraction(0.2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FofConfig {
    pub linking_length: LinkingLength,
    /// Groups with fewer members are dropped from the catalog.
    pub min_group_size: usize,
}

impl Default for FofConfig {
    fn default() -> Self {
        Self {
            linking_length: LinkingLength::default(),
            min_group_size: 8,
        }
    }
}

impl FofConfig {
    pub fn validate(&self) -> Result<()> {
        self.linking_length.validate()?;
        if self.min_group_size == 0 {
            return Err(HaloError::Configuration(
                "min_group_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Smoothing kernel used to turn a k-nearest-neighbor set into a density.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DensityKernel {
    /// Cubic-spline SPH kernel with support equal to the k-th neighbor distance.
    #[default]
    Spline,
    /// Neighbor mass divided by the volume of the sphere reaching the k-th neighbor.
    TopHat,
}

/// A density level, absolute or in units of the mean density of the domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DensityThreshold {
    Absolute(f64),
    Overdensity(f64),
}

impl DensityThreshold {
    fn raw(&self) -> f64 {
        match self {
            Self::Absolute(v) | Self::Overdensity(v) => *v,
        }
    }

    pub fn resolve(&self, mean_density: f64) -> f64 {
        match *self {
            Self::Absolute(v) => v,
            Self::Overdensity(delta) => delta * mean_density,
        }
    }

    fn requires_mean_density(&self) -> bool {
        matches!(self, Self::Overdensity(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HopConfig {
    /// Neighbors used for the density estimate.
    pub num_neighbors: usize,
    /// Neighbors scanned when hopping to the densest neighbor.
    pub num_hop: usize,
    /// Neighbors scanned when looking for boundary pairs between groups.
    pub num_merge: usize,
    pub kernel: DensityKernel,
    /// Two groups merge when their saddle density reaches this fraction of
    /// the lower of their peak densities.
    pub merging_threshold: f64,
    /// Particles below this density are left unassigned.
    pub outer_density_threshold: DensityThreshold,
    /// Groups peaking below this density cannot stand alone. `None` uses the
    /// outer threshold.
    pub peak_density_threshold: Option<DensityThreshold>,
    pub min_group_size: usize,
}

impl Default for HopConfig {
    fn default() -> Self {
        Self {
            num_neighbors: 64,
            num_hop: 16,
            num_merge: 4,
            kernel: DensityKernel::default(),
            merging_threshold: 0.5,
            outer_density_threshold: DensityThreshold::Overdensity(40.0),
            peak_density_threshold: None,
            min_group_size: 10,
        }
    }
}

impl HopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_neighbors == 0 {
            return Err(HaloError::InvalidInput(
                "num_neighbors must be positive".to_string(),
            ));
        }
        if self.num_hop == 0 || self.num_merge == 0 {
            return Err(HaloError::InvalidInput(
                "num_hop and num_merge must be positive".to_string(),
            ));
        }
        if !self.merging_threshold.is_finite()
            || self.merging_threshold <= 0.0
            || self.merging_threshold > 1.0
        {
            return Err(HaloError::InvalidInput(format!(
                "merging_threshold must lie in (0, 1], got {}",
                self.merging_threshold
            )));
        }
        let outer = self.outer_density_threshold.raw();
        if !outer.is_finite() || outer < 0.0 {
            return Err(HaloError::InvalidInput(format!(
                "outer density threshold must be non-negative and finite, got {}",
                outer
            )));
        }
        if self.min_group_size == 0 {
            return Err(HaloError::Configuration(
                "min_group_size must be at least 1".to_string(),
            ));
        }
        if self.num_hop > self.num_neighbors || self.num_merge > self.num_neighbors {
            return Err(HaloError::Configuration(format!(
                "num_hop ({}) and num_merge ({}) cannot exceed num_neighbors ({})",
                self.num_hop, self.num_merge, self.num_neighbors
            )));
        }
        if let Some(peak) = self.peak_density_threshold {
            let raw = peak.raw();
            if !raw.is_finite() || raw < 0.0 {
                return Err(HaloError::InvalidInput(format!(
                    "peak density threshold must be non-negative and finite, got {}",
                    raw
                )));
            }
            let same_units = std::mem::discriminant(&peak)
                == std::mem::discriminant(&self.outer_density_threshold);
            if same_units && raw < outer {
                return Err(HaloError::Configuration(format!(
                    "peak density threshold ({}) is below the outer threshold ({})",
                    raw, outer
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn requires_mean_density(&self) -> bool {
        self.outer_density_threshold.requires_mean_density()
            || self
                .peak_density_threshold
                .is_some_and(|p| p.requires_mean_density())
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum HaloFinderMethod {
    Fof(FofConfig),
    Hop(HopConfig),
}

impl Default for HaloFinderMethod {
    fn default() -> Self {
        Self::Hop(HopConfig::default())
    }
}

/// Everything `find_halos` needs for one run.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HaloFinderConfig {
    /// Edge of the periodic cube; `None` for an open domain.
    pub box_size: Option<f64>,
    pub method: HaloFinderMethod,
    /// First halo id handed out by the assembler.
    pub id_offset: usize,
}

impl HaloFinderConfig {
    pub fn fof(config: FofConfig) -> Self {
        Self {
            method: HaloFinderMethod::Fof(config),
            ..Default::default()
        }
    }

    pub fn hop(config: HopConfig) -> Self {
        Self {
            method: HaloFinderMethod::Hop(config),
            ..Default::default()
        }
    }

    pub fn with_box_size(mut self, box_size: f64) -> Self {
        self.box_size = Some(box_size);
        self
    }

    pub fn validate(&self) -> Result<()> {
        match &self.method {
            HaloFinderMethod::Fof(c) => c.validate(),
            HaloFinderMethod::Hop(c) => c.validate(),
        }
    }
}
