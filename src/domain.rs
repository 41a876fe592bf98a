use crate::error::{HaloError, Result};
use nalgebra::Vector3;

/// Axis-aligned bounds of a point set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub min: Vector3<f64>,
    pub max: Vector3<f64>,
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            min: Vector3::repeat(f64::INFINITY),
            max: Vector3::repeat(f64::NEG_INFINITY),
        }
    }

    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Vector3<f64>>) -> Self {
        let mut bb = Self::empty();
        for p in points {
            bb.include(p);
        }
        bb
    }

    pub fn include(&mut self, p: &Vector3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    pub fn span(&self) -> Vector3<f64> {
        (self.max - self.min).map(|s| s.max(0.0))
    }

    pub fn volume(&self) -> f64 {
        let s = self.span();
        s.x * s.y * s.z
    }

    /// Squared distance from `p` to the box; zero when inside.
    pub fn distance_squared(&self, p: &Vector3<f64>) -> f64 {
        let mut d2 = 0.0;
        for dim in 0..3 {
            let below = self.min[dim] - p[dim];
            let above = p[dim] - self.max[dim];
            let d = below.max(above).max(0.0);
            d2 += d * d;
        }
        d2
    }
}

/// The simulation volume: either open, or a periodic cube of edge `box_size`
/// with its origin at zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Domain {
    box_size: Option<f64>,
}

impl Domain {
    pub fn open() -> Self {
        Self { box_size: None }
    }

    pub fn periodic(box_size: f64) -> Result<Self> {
        if !box_size.is_finite() || box_size <= 0.0 {
            return Err(HaloError::InvalidInput(format!(
                "box size must be positive and finite, got {}",
                box_size
            )));
        }
        Ok(Self {
            box_size: Some(box_size),
        })
    }

    pub fn from_box_size(box_size: Option<f64>) -> Result<Self> {
        match box_size {
            Some(l) => Self::periodic(l),
            None => Ok(Self::open()),
        }
    }

    pub fn box_size(&self) -> Option<f64> {
        self.box_size
    }

    pub fn is_periodic(&self) -> bool {
        self.box_size.is_some()
    }

    /// Maps a position into `[0, L)` on every axis of a periodic domain.
    pub fn wrap(&self, p: &Vector3<f64>) -> Vector3<f64> {
        match self.box_size {
            Some(l) => p.map(|x| {
                let w = x.rem_euclid(l);
                // rem_euclid can round up to exactly l for tiny negative inputs
                if w >= l { 0.0 } else { w }
            }),
            None => *p,
        }
    }

    /// Minimum-image displacement from `from` to `to`.
    pub fn displacement(&self, from: &Vector3<f64>, to: &Vector3<f64>) -> Vector3<f64> {
        let d = to - from;
        match self.box_size {
            Some(l) => d.map(|x| x - l * (x / l).round()),
            None => d,
        }
    }

    pub fn distance(&self, a: &Vector3<f64>, b: &Vector3<f64>) -> f64 {
        self.displacement(a, b).norm()
    }

    /// Offsets of the periodic images of `point` (assumed wrapped) whose
    /// `radius`-ball reaches into the box. The zero offset always comes first;
    /// at most 27 offsets are produced.
    pub fn image_offsets(&self, point: &Vector3<f64>, radius: f64) -> Vec<Vector3<f64>> {
        let Some(l) = self.box_size else {
            return vec![Vector3::zeros()];
        };
        let mut per_axis: [Vec<f64>; 3] = Default::default();
        for dim in 0..3 {
            let p = point[dim];
            per_axis[dim].push(0.0);
            if p <= radius {
                per_axis[dim].push(l);
            }
            if p >= l - radius {
                per_axis[dim].push(-l);
            }
        }
        let mut offsets = Vec::with_capacity(per_axis.iter().map(Vec::len).product());
        for &ox in &per_axis[0] {
            for &oy in &per_axis[1] {
                for &oz in &per_axis[2] {
                    offsets.push(Vector3::new(ox, oy, oz));
                }
            }
        }
        offsets
    }

    /// Volume used for mean density and mean spacing: the cube for periodic
    /// domains, the bounding box of the points otherwise.
    pub fn volume<'a>(&self, positions: impl IntoIterator<Item = &'a Vector3<f64>>) -> Result<f64> {
        let volume = match self.box_size {
            Some(l) => l * l * l,
            None => BoundingBox::from_points(positions).volume(),
        };
        if !(volume > 0.0) {
            return Err(HaloError::DegenerateGeometry(
                "particles span zero volume".to_string(),
            ));
        }
        Ok(volume)
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::open()
    }
}
