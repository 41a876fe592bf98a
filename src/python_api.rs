use crate::config::{
    self, DensityKernel, DensityThreshold, FofConfig, HaloFinderConfig, HopConfig, LinkingLength,
};
use crate::error::HaloError;
use crate::halo::Halo;
use crate::particle::{Particle, ParticleId};
use nalgebra::Vector3;
use numpy::{PyArrayMethods, PyReadonlyArray1, PyReadonlyArray2, PyUntypedArrayMethods};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::collections::HashMap;

fn to_py_err(e: HaloError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

enum VectorData<'a> {
    Slice(&'a [Vector3<f64>]),
    Owned(Vec<Vector3<f64>>),
}

impl<'a> std::ops::Deref for VectorData<'a> {
    type Target = [Vector3<f64>];
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Slice(s) => s,
            Self::Owned(v) => v,
        }
    }
}

fn get_vectors<'a>(array: &'a PyReadonlyArray2<'a, f64>, what: &str) -> PyResult<VectorData<'a>> {
    if array.shape()[1] != 3 {
        return Err(PyValueError::new_err(format!("{} must be (N, 3)", what)));
    }

    if let Ok(slice) = array.as_slice()
        && let Ok(cast_slice) = bytemuck::try_cast_slice(slice)
    {
        return Ok(VectorData::Slice(cast_slice));
    }

    // Fallback: Copy
    let view = array.as_array();
    let mut vectors = Vec::with_capacity(view.shape()[0]);
    for row in view.rows() {
        vectors.push(Vector3::new(row[0], row[1], row[2]));
    }
    Ok(VectorData::Owned(vectors))
}

fn build_particles(
    positions: &PyReadonlyArray2<'_, f64>,
    ids: Option<&PyReadonlyArray1<'_, i64>>,
    masses: Option<&PyReadonlyArray1<'_, f64>>,
    velocities: Option<&PyReadonlyArray2<'_, f64>>,
) -> PyResult<Vec<Particle>> {
    let pos_data = get_vectors(positions, "positions")?;
    let n = pos_data.len();

    let ids: Vec<ParticleId> = match ids {
        Some(a) if a.len() != n => {
            return Err(PyValueError::new_err("ids must have one entry per particle"));
        }
        Some(a) => a.as_array().iter().copied().collect(),
        None => (0..n as ParticleId).collect(),
    };
    let masses: Option<Vec<f64>> = match masses {
        Some(a) if a.len() != n => {
            return Err(PyValueError::new_err(
                "masses must have one entry per particle",
            ));
        }
        Some(a) => Some(a.as_array().iter().copied().collect()),
        None => None,
    };
    let vel_data = velocities.map(|v| get_vectors(v, "velocities")).transpose()?;
    if vel_data.as_ref().is_some_and(|v| v.len() != n) {
        return Err(PyValueError::new_err(
            "velocities must have one row per particle",
        ));
    }

    Ok((0..n)
        .map(|i| {
            let mut p = Particle::new(ids[i], pos_data[i]);
            if let Some(m) = &masses {
                p = p.with_mass(m[i]);
            }
            if let Some(v) = &vel_data {
                p = p.with_velocity(v[i]);
            }
            p
        })
        .collect())
}

fn catalog_to_dict<'py>(
    py: Python<'py>,
    particles: &[Particle],
    halos: &[Halo],
) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    let n_halos = halos.len();

    let index_of: HashMap<ParticleId, usize> = particles
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id, i))
        .collect();
    let mut halo_of = vec![-1i64; particles.len()];
    for halo in halos {
        for id in &halo.particle_ids {
            if let Some(&i) = index_of.get(id) {
                halo_of[i] = halo.id as i64;
            }
        }
    }
    dict.set_item("halo_id", numpy::PyArray1::from_vec(py, halo_of))?;

    let num_particles: Vec<i64> = halos.iter().map(|h| h.num_particles() as i64).collect();
    dict.set_item("num_particles", numpy::PyArray1::from_vec(py, num_particles))?;
    let mass: Vec<f64> = halos.iter().map(|h| h.total_mass).collect();
    dict.set_item("mass", numpy::PyArray1::from_vec(py, mass))?;
    let radius: Vec<f64> = halos.iter().map(|h| h.maximum_radius).collect();
    dict.set_item("maximum_radius", numpy::PyArray1::from_vec(py, radius))?;

    let com: Vec<f64> = halos
        .iter()
        .flat_map(|h| {
            let c = h.center_of_mass;
            [c.x, c.y, c.z]
        })
        .collect();
    dict.set_item(
        "center_of_mass",
        numpy::PyArray1::from_vec(py, com).reshape((n_halos, 3))?,
    )?;

    if halos.iter().all(|h| h.bulk_velocity.is_some()) {
        let bulk: Vec<f64> = halos
            .iter()
            .flat_map(|h| {
                let v = h.bulk_velocity.unwrap_or_else(Vector3::zeros);
                [v.x, v.y, v.z]
            })
            .collect();
        dict.set_item(
            "bulk_velocity",
            numpy::PyArray1::from_vec(py, bulk).reshape((n_halos, 3))?,
        )?;
        let rms: Vec<f64> = halos.iter().map(|h| h.rms_velocity.unwrap_or(0.0)).collect();
        dict.set_item("rms_velocity", numpy::PyArray1::from_vec(py, rms))?;
    }

    if halos.iter().all(|h| h.peak.is_some()) {
        let density: Vec<f64> = halos
            .iter()
            .map(|h| h.peak.map_or(0.0, |p| p.density))
            .collect();
        dict.set_item("peak_density", numpy::PyArray1::from_vec(py, density))?;
    }
    Ok(dict)
}

#[pyfunction]
#[pyo3(signature = (positions, linking_length=0.2, relative=true, min_group_size=8, box_size=None, ids=None, masses=None, velocities=None))]
#[allow(clippy::too_many_arguments)]
fn find_halos_fof<'py>(
    py: Python<'py>,
    positions: PyReadonlyArray2<'_, f64>,
    linking_length: f64,
    relative: bool,
    min_group_size: usize,
    box_size: Option<f64>,
    ids: Option<PyReadonlyArray1<'_, i64>>,
    masses: Option<PyReadonlyArray1<'_, f64>>,
    velocities: Option<PyReadonlyArray2<'_, f64>>,
) -> PyResult<Bound<'py, PyDict>> {
    let particles = build_particles(&positions, ids.as_ref(), masses.as_ref(), velocities.as_ref())?;
    let linking_length = if relative {
        LinkingLength::MeanSpacingFraction(linking_length)
    } else {
        LinkingLength::Absolute(linking_length)
    };
    let config = HaloFinderConfig {
        box_size,
        ..HaloFinderConfig::fof(FofConfig {
            linking_length,
            min_group_size,
        })
    };
    let halos = crate::find_halos(&particles, &config).map_err(to_py_err)?;
    catalog_to_dict(py, &particles, &halos)
}

#[pyfunction]
#[pyo3(signature = (positions, num_neighbors=64, num_hop=16, num_merge=4, kernel="spline", merging_threshold=0.5, outer_threshold=40.0, peak_threshold=None, relative=true, min_group_size=10, box_size=None, ids=None, masses=None, velocities=None))]
#[allow(clippy::too_many_arguments)]
fn find_halos_hop<'py>(
    py: Python<'py>,
    positions: PyReadonlyArray2<'_, f64>,
    num_neighbors: usize,
    num_hop: usize,
    num_merge: usize,
    kernel: &str,
    merging_threshold: f64,
    outer_threshold: f64,
    peak_threshold: Option<f64>,
    relative: bool,
    min_group_size: usize,
    box_size: Option<f64>,
    ids: Option<PyReadonlyArray1<'_, i64>>,
    masses: Option<PyReadonlyArray1<'_, f64>>,
    velocities: Option<PyReadonlyArray2<'_, f64>>,
) -> PyResult<Bound<'py, PyDict>> {
    let kernel = match kernel {
        "spline" => DensityKernel::Spline,
        "tophat" => DensityKernel::TopHat,
        other => {
            return Err(PyValueError::new_err(format!(
                "Unknown kernel '{}', expected 'spline' or 'tophat'",
                other
            )));
        }
    };
    let threshold = |v: f64| {
        if relative {
            DensityThreshold::Overdensity(v)
        } else {
            DensityThreshold::Absolute(v)
        }
    };
    let particles = build_particles(&positions, ids.as_ref(), masses.as_ref(), velocities.as_ref())?;
    let config = HaloFinderConfig {
        box_size,
        ..HaloFinderConfig::hop(HopConfig {
            num_neighbors,
            num_hop,
            num_merge,
            kernel,
            merging_threshold,
            outer_density_threshold: threshold(outer_threshold),
            peak_density_threshold: peak_threshold.map(threshold),
            min_group_size,
        })
    };
    let halos = crate::find_halos(&particles, &config).map_err(to_py_err)?;
    catalog_to_dict(py, &particles, &halos)
}

#[pyfunction]
fn get_num_threads() -> usize {
    rayon::current_num_threads()
}

#[pyfunction]
fn set_num_threads(n: usize) -> PyResult<()> {
    // Note: build_global can only be called once.
    // If it fails, we ignore it (already initialized).
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(n)
        .build_global();
    Ok(())
}

#[pyfunction]
fn get_leaf_size() -> usize {
    config::get_leaf_size()
}

#[pyfunction]
fn set_leaf_size(val: usize) {
    config::set_leaf_size(val);
}

#[pyfunction]
fn get_parallel_threshold() -> usize {
    config::get_parallel_threshold()
}

#[pyfunction]
fn set_parallel_threshold(val: usize) {
    config::set_parallel_threshold(val);
}

#[pyfunction]
#[pyo3(signature = (level=None))]
fn init_logging(level: Option<String>) {
    crate::init_logging(level.as_deref());
}

#[pymodule]
fn halofinder_rs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(find_halos_fof, m)?)?;
    m.add_function(wrap_pyfunction!(find_halos_hop, m)?)?;
    m.add_function(wrap_pyfunction!(get_num_threads, m)?)?;
    m.add_function(wrap_pyfunction!(set_num_threads, m)?)?;
    m.add_function(wrap_pyfunction!(get_leaf_size, m)?)?;
    m.add_function(wrap_pyfunction!(set_leaf_size, m)?)?;
    m.add_function(wrap_pyfunction!(get_parallel_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(set_parallel_threshold, m)?)?;
    m.add_function(wrap_pyfunction!(init_logging, m)?)?;
    Ok(())
}
