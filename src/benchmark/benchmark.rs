use std::time::Instant;

use crate::simulation::mode::AnalysisMode;
use crate::simulation::params::WakeParameters;
use crate::simulation::states::{NVec3, VortexId};
use crate::simulation::trailing_vortex::{TrailingVortex, INFINITY_FACTOR};

/// Helper to build a rolled-up looking filament with `n` sub-vortices
fn make_vortex(n: usize) -> TrailingVortex {
    let params = WakeParameters { num_sub_vortices: n, far_dist: 10.0, ..Default::default() };
    let mut tv = TrailingVortex::new(VortexId::default(), params, AnalysisMode::Steady);

    tv.setup(n, 10.0, NVec3::zeros(), NVec3::new(10.0 * INFINITY_FACTOR, 0.0, 0.0));
    tv.set_gamma(1.0);

    // deterministic droop and sideways drift
    for i in 1..=n {
        let x = tv.wake_node(i).x;
        tv.set_wake_node(i, NVec3::new(x, 0.05 * (0.3 * x).sin(), -0.02 * x));
    }

    tv
}

/// Helper to build `m` field points spread around the filament
fn make_points(m: usize) -> Vec<NVec3> {
    (0..m)
        .map(|i| {
            let i_f = i as f64;
            NVec3::new((i_f * 0.37).sin() * 12.0 + 5.0, (i_f * 0.13).cos() * 6.0, (i_f * 0.07).sin() * 6.0)
        })
        .collect()
}

/// Time finest-level against agglomerated induced velocity for a range of
/// filament sizes. Paste output directly into a spreadsheet to graph.
pub fn bench_induced_velocity() {
    println!("N,finest_ms,agglomerated_ms,max_rel_diff");

    let points = make_points(2000);

    for n in [16, 32, 64, 128, 256, 512, 1024] {
        let tv = make_vortex(n);

        // Warm up, also builds the search tree
        let _ = tv.induced_velocity(&points[0]);

        // Finest level
        let t0 = Instant::now();
        let finest: Vec<NVec3> = points.iter().map(|p| tv.induced_velocity_at_level(p, 1)).collect();
        let ms_finest = t0.elapsed().as_secs_f64() * 1000.0;

        // Level picked by distance
        let t1 = Instant::now();
        let agglomerated: Vec<NVec3> = points.iter().map(|p| tv.induced_velocity(p)).collect();
        let ms_agglomerated = t1.elapsed().as_secs_f64() * 1000.0;

        let max_rel = finest
            .iter()
            .zip(agglomerated.iter())
            .filter(|(f, _)| f.norm() > 0.0)
            .map(|(f, a)| (f - a).norm() / f.norm())
            .fold(0.0, f64::max);

        println!("{},{:.6},{:.6},{:.3e}", n, ms_finest, ms_agglomerated, max_rel);
    }
}

/// Time one nearest-distance query against a linear scan of the wake nodes
pub fn bench_search() {
    let points = make_points(2000);

    for n in [64, 256, 1024, 4096] {
        let mut tv = make_vortex(n);
        tv.create_search_tree();

        let t0 = Instant::now();
        let tree: f64 = points.iter().map(|p| tv.distance_to(p)).sum();
        let dt_tree = t0.elapsed().as_secs_f64();

        let t1 = Instant::now();
        let scan: f64 = points
            .iter()
            .map(|p| (0..tv.number_of_nodes()).map(|i| (tv.wake_node(i) - p).norm()).fold(f64::INFINITY, f64::min))
            .sum();
        let dt_scan = t1.elapsed().as_secs_f64();

        println!(
            "N = {n:5}, tree = {:8.6} s, scan = {:8.6} s, checksum diff = {:.1e}",
            dt_tree,
            dt_scan,
            (tree - scan).abs()
        );
    }
}
