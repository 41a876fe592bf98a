use nalgebra::Vector3;
use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use wide::{CmpLe, f64x4};

fn main() {
    let out_dir = env::var("OUT_DIR").unwrap();
    let dest_path = Path::new(&out_dir).join("tuned_constants.rs");
    let mut f = File::create(&dest_path).unwrap();

    let mut leaf_size = 16;
    let mut parallel_threshold = 4096;

    // Calibration: cost of scanning leaf buckets against a cloud of queries
    let n_test = 512;
    let mut pos = Vec::with_capacity(n_test);
    for i in 0..n_test {
        let t = i as f64 / n_test as f64;
        pos.push(Vector3::new(t, (t * 7.0).fract(), (t * 13.0).fract()));
    }
    let radius = 0.1;

    let start = Instant::now();
    for _ in 0..5 {
        let _ = bucket_scan_simd(&pos, radius);
    }
    let duration = start.elapsed() / 5;
    let micros = duration.as_micros();

    if micros < 200 {
        leaf_size = 32;
        parallel_threshold = 2048;
    } else if micros > 2000 {
        leaf_size = 8;
        parallel_threshold = 8192;
    }

    writeln!(f, "pub const TUNED_LEAF_SIZE: usize = {};", leaf_size).unwrap();
    writeln!(
        f,
        "pub const TUNED_PARALLEL_THRESHOLD: usize = {};",
        parallel_threshold
    )
    .unwrap();

    println!(
        "cargo:warning=Auto-tuning: LEAF_SIZE={}, PARALLEL_THRESHOLD={}",
        leaf_size, parallel_threshold
    );
    println!("cargo:rerun-if-changed=build.rs");
}

/// Counts pairs within `radius`, scanning every point as a query against the
/// whole set four candidates at a time.
fn bucket_scan_simd(positions: &[Vector3<f64>], radius: f64) -> usize {
    let n = positions.len();
    let r2 = radius * radius;
    let r2_v = f64x4::from(r2);
    let mut count = 0;

    let mut px = Vec::with_capacity(n);
    let mut py = Vec::with_capacity(n);
    let mut pz = Vec::with_capacity(n);
    for p in positions {
        px.push(p.x);
        py.push(p.y);
        pz.push(p.z);
    }

    for i in 0..n {
        let qx = f64x4::from(px[i]);
        let qy = f64x4::from(py[i]);
        let qz = f64x4::from(pz[i]);
        let mut j = 0;
        while j + 4 <= n {
            let dx = f64x4::from(&px[j..j + 4]) - qx;
            let dy = f64x4::from(&py[j..j + 4]) - qy;
            let dz = f64x4::from(&pz[j..j + 4]) - qz;
            let d2 = dx * dx + dy * dy + dz * dz;
            count += d2.cmp_le(r2_v).move_mask().count_ones() as usize;
            j += 4;
        }
        for k in j..n {
            let dx = px[k] - px[i];
            let dy = py[k] - py[i];
            let dz = pz[k] - pz[i];
            if dx * dx + dy * dy + dz * dz <= r2 {
                count += 1;
            }
        }
    }
    count
}
