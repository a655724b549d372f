use std::f64::consts::{FRAC_PI_2, PI};
use std::io::Cursor;

use approx::assert_relative_eq;
use nalgebra::{UnitQuaternion, Vector3};

use wakesim::error::{GridIssue, WakeError};
use wakesim::mesh::elements::{Loop, Node, Surface, SurfaceKind};
use wakesim::mesh::gradient::Gradient;
use wakesim::mesh::grid::Grid;
use wakesim::mesh::merge_sort::{merge_sort_by_key, sort_edges};
use wakesim::simulation::integrator::WakeSolver;
use wakesim::simulation::mode::{AnalysisMode, ConvectType, RotorKinematics, WakeStep};
use wakesim::simulation::params::WakeParameters;
use wakesim::simulation::scenario::Scenario;
use wakesim::simulation::search::SearchTree;
use wakesim::simulation::states::{NVec3, VortexEdge, VortexId};
use wakesim::simulation::trailing_vortex::{TrailingVortex, VortexState, INFINITY_FACTOR};
use wakesim::simulation::velocity::{segment_velocity, semi_infinite_velocity, OnsetFlow, VelocitySet, VelocitySource};
use wakesim::ScenarioConfig;

/// Wake parameters without damping so geometry updates are easy to predict
pub fn test_params(n: usize, far_dist: f64) -> WakeParameters {
    WakeParameters {
        num_sub_vortices: n,
        far_dist,
        core_size: 0.0,
        sigma: 0.01,
        wake_damping: false,
        ..Default::default()
    }
}

/// Straight filament from the origin along +x carrying `gamma`
pub fn straight_vortex(n: usize, far_dist: f64, gamma: f64, mode: AnalysisMode) -> TrailingVortex {
    let mut tv = TrailingVortex::new(VortexId::default(), test_params(n, far_dist), mode);
    tv.setup(n, far_dist, NVec3::zeros(), NVec3::new(far_dist * INFINITY_FACTOR, 0.0, 0.0));
    tv.set_gamma(gamma);
    tv
}

/// Bend a filament downward like a rolled-up wake
pub fn droop(tv: &mut TrailingVortex, sag: f64) {
    let far = tv.far_dist();
    for i in 1..tv.number_of_nodes() {
        let x = tv.wake_node(i).x;
        tv.set_wake_node(i, NVec3::new(x, 0.1 * sag * (x / far), -sag * (x / far).powi(2)));
    }
}

pub const RECT_GAMMAS: [f64; 8] = [0.18, 0.30, 0.30, 0.50, 0.30, 0.50, 0.18, 0.30];

/// Flat rectangular wing, chord 1 (x), span 4 (y), 2 x 4 quads. Node
/// `3 * j + i` sits at chordwise column `i`, spanwise row `j`; the trailing
/// edge is column 2.
pub fn rect_wing_grid(gammas: [f64; 8]) -> Grid<'static> {
    let mut grid = Grid::new("rect");
    grid.add_surface(Surface { component: 0, kind: SurfaceKind::Wing, periodic: false });

    grid.size_node_list(15);
    for j in 0..5 {
        for i in 0..3 {
            grid.nodes_mut()[3 * j + i] = Node::new(NVec3::new(0.5 * i as f64, j as f64 - 2.0, 0.0), 0);
        }
    }

    grid.size_loop_list(8);
    for j in 0..4 {
        for i in 0..2 {
            let a = 3 * j + i;
            grid.loops_mut()[2 * j + i] = Loop::new(vec![a, a + 1, a + 4, a + 3], 0, gammas[2 * j + i]);
        }
    }

    assert!(grid.create_tri_edges().is_empty());
    assert!(grid.calculate_tri_normals_and_centroids().is_empty());
    for j in 0..4 {
        assert!(grid.mark_trailing_edge(3 * j + 2, 3 * j + 5));
    }
    grid.find_kutta_nodes();
    grid.update_edge_circulation();
    grid
}

/// Regular octahedron with outward-facing triangles
pub fn octahedron_grid() -> Grid<'static> {
    let mut grid = Grid::new("octahedron");
    grid.add_surface(Surface { component: 0, kind: SurfaceKind::Body, periodic: false });

    let points = [
        [1.0, 0.0, 0.0],
        [-1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, -1.0, 0.0],
        [0.0, 0.0, 1.0],
        [0.0, 0.0, -1.0],
    ];
    grid.size_node_list(points.len());
    for (i, p) in points.iter().enumerate() {
        grid.nodes_mut()[i] = Node::new(NVec3::new(p[0], p[1], p[2]), 0);
    }

    let faces = [[0, 2, 4], [1, 4, 2], [0, 4, 3], [0, 5, 2], [1, 3, 4], [1, 2, 5], [0, 3, 5], [1, 5, 3]];
    grid.size_loop_list(faces.len());
    for (l, f) in faces.iter().enumerate() {
        grid.loops_mut()[l] = Loop::new(f.to_vec(), 0, 0.0);
    }

    grid
}

fn linear_field(p: &NVec3) -> f64 {
    2.0 * p.x - p.y + 3.0 * p.z
}

fn edge_index(grid: &Grid, a: usize, b: usize) -> usize {
    let key = (a.min(b), a.max(b));
    grid.edges().iter().position(|e| e.key() == key).unwrap()
}

// ==================================================================================
// Kernel tests
// ==================================================================================

#[test]
fn segment_reversal_negates_velocity() {
    let a = NVec3::new(0.0, 0.0, 0.0);
    let b = NVec3::new(1.0, 0.5, 0.0);
    let p = NVec3::new(0.3, 1.0, 0.7);

    let forward = segment_velocity(&a, &b, 1.3, 0.01, &p);
    let backward = segment_velocity(&b, &a, 1.3, 0.01, &p);

    assert_relative_eq!(forward, -backward, epsilon = 1e-15);
    assert!(forward.norm() > 0.0);
}

#[test]
fn segment_velocity_is_finite_on_the_segment() {
    let a = NVec3::zeros();
    let b = NVec3::new(1.0, 0.0, 0.0);

    // on the axis, inside the segment, and exactly on an end point
    for p in [NVec3::new(0.5, 0.0, 0.0), NVec3::new(2.0, 0.0, 0.0), a] {
        let v = segment_velocity(&a, &b, 1.0, 0.05, &p);
        assert!(v.iter().all(|c| c.is_finite()));
        assert_relative_eq!(v.norm(), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn long_segment_approaches_semi_infinite() {
    let a = NVec3::zeros();
    let dir = NVec3::x();
    let p = NVec3::new(0.5, 0.0, 1.0);

    let semi = semi_infinite_velocity(&a, &dir, 1.0, 0.0, &p);
    let long = segment_velocity(&a, &(dir * 1.0e6), 1.0, 0.0, &p);

    assert_relative_eq!(semi, long, max_relative = 1e-9);
}

#[test]
fn velocity_set_sums_sources() {
    let onset = OnsetFlow { free_stream: NVec3::new(1.0, 0.0, 0.0), mode: AnalysisMode::Steady };
    let tv = straight_vortex(8, 5.0, 1.0, AnalysisMode::Steady);
    let p = NVec3::new(2.0, 0.5, 0.5);

    let set = VelocitySet::new().with(&onset).with(&tv);
    assert_eq!(set.len(), 2);
    assert_relative_eq!(set.velocity_at(&p), onset.velocity(&p) + tv.induced_velocity(&p), epsilon = 1e-15);

    let points = vec![p, NVec3::new(-1.0, 0.0, 2.0)];
    let mut out = vec![NVec3::zeros(); 2];
    set.accumulate_velocities(&points, &mut out);
    assert_eq!(out[1], set.velocity_at(&points[1]));
}

// ==================================================================================
// Trailing vortex: induced velocity
// ==================================================================================

#[test]
fn straight_filament_matches_biot_savart() {
    let gamma = 1.0;
    let tv = straight_vortex(64, 100.0, gamma, AnalysisMode::Steady);

    let (x, d) = (50.0, 1.0);
    let v = tv.induced_velocity(&NVec3::new(x, 0.0, d));

    // semi-infinite line from the origin
    let exact = gamma / (4.0 * PI * d) * (1.0 + x / (x * x + d * d).sqrt());
    assert_relative_eq!(-v.y, exact, max_relative = 1e-3);
    assert_relative_eq!(v.x, 0.0, epsilon = 1e-12);
    assert_relative_eq!(v.z, 0.0, epsilon = 1e-12);

    // far from both ends it is the infinite line value
    assert_relative_eq!(v.norm(), gamma / (2.0 * PI * d), max_relative = 1e-3);
}

#[test]
fn core_override_scales_straight_filament() {
    let tv = straight_vortex(32, 50.0, 1.0, AnalysisMode::Steady);
    let p = NVec3::new(25.0, 0.0, 1.0);

    let v = tv.induced_velocity_at_level(&p, 1);
    let v_core = tv.induced_velocity_with_core(&p, 1.0);

    // every segment sees h^2 / (h^2 + core^2)
    let scale = (1.0 + 0.01 * 0.01) / (1.0 + 1.0);
    assert_relative_eq!(v_core, v * scale, max_relative = 1e-9);
}

#[test]
fn agglomerated_far_field_matches_finest_level() {
    let mut tv = straight_vortex(64, 10.0, 1.0, AnalysisMode::Steady);
    droop(&mut tv, 0.5);

    let p = NVec3::new(5.0, 60.0, 10.0);
    let sample = tv.evaluate_at(&p, None);
    let finest = tv.induced_velocity_at_level(&p, 1);

    assert_eq!(sample.level, tv.number_of_levels());
    assert!(sample.distance >= tv.far_away_ratio() * tv.max_sub_vortex_length(sample.level));
    assert_relative_eq!(sample.velocity, finest, max_relative = 0.05);
}

#[test]
fn level_selection_coarsens_with_distance() {
    let mut tv = straight_vortex(64, 10.0, 1.0, AnalysisMode::Steady);
    droop(&mut tv, 0.5);

    assert_eq!(tv.select_level(0.0), 1);
    assert_eq!(tv.select_level(1.0e6), tv.number_of_levels());

    let mut last = 1;
    for k in 0..200 {
        let level = tv.select_level(0.25 * k as f64);
        assert!(level >= last);
        last = level;
    }
}

#[test]
#[should_panic(expected = "trailing vortex used before setup")]
fn induced_velocity_before_setup_panics() {
    let tv = TrailingVortex::new(VortexId::default(), WakeParameters::default(), AnalysisMode::Steady);
    tv.induced_velocity(&NVec3::new(1.0, 0.0, 0.0));
}

#[test]
fn total_velocity_adds_free_stream_once() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    tv.set_free_stream(NVec3::new(2.0, 0.0, 0.0));
    let p = NVec3::new(3.0, 1.0, 0.0);

    assert_relative_eq!(tv.total_velocity(&p), tv.induced_velocity(&p) + NVec3::new(2.0, 0.0, 0.0));
    assert_relative_eq!(tv.free_stream_direction(), NVec3::x());
}

// ==================================================================================
// Trailing vortex: agglomeration levels
// ==================================================================================

#[test]
fn agglomeration_levels_halve_down_to_one() {
    let tv = straight_vortex(64, 10.0, 1.0, AnalysisMode::Steady);

    assert_eq!(tv.number_of_sub_vortices_at(1), 64);
    assert_eq!(tv.number_of_agglomerations(), 6);
    assert_eq!(tv.number_of_levels(), 7);
    for l in 2..=tv.number_of_levels() {
        assert_eq!(tv.number_of_sub_vortices_at(l) * 2, tv.number_of_sub_vortices_at(l - 1));
    }
    assert_eq!(tv.number_of_sub_vortices_at(tv.number_of_levels()), 1);
    assert_eq!(tv.total_number_of_sub_vortices(), 127);
}

#[test]
fn coarse_edges_join_every_other_fine_node() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    droop(&mut tv, 1.0);

    for l in 1..=tv.number_of_levels() {
        let stride = 1 << (l - 1);
        for j in 0..tv.number_of_sub_vortices_at(l) {
            let edge = tv.vortex_edge(l, j);
            assert_eq!(edge.node1, tv.wake_node(j * stride));
            assert_eq!(edge.node2, tv.wake_node((j + 1) * stride));
        }
    }

    // far segment leaves the last node along the wake direction
    assert_eq!(tv.far_edge().node1, tv.wake_node(16));
    assert_eq!(tv.far_edge().direction, NVec3::x());
}

#[test]
fn coarse_gamma_is_length_weighted() {
    let mut tv = straight_vortex(2, 10.0, 1.0, AnalysisMode::Steady);
    tv.set_gamma_at(1, 3.0);

    let (l0, l1) = (tv.vortex_edge(1, 0).length, tv.vortex_edge(1, 1).length);
    assert_relative_eq!(tv.vortex_edge(2, 0).gamma, (l0 + 3.0 * l1) / (l0 + l1), epsilon = 1e-14);
}

#[test]
#[should_panic(expected = "power of two")]
fn setup_rejects_non_power_of_two() {
    let mut tv = TrailingVortex::new(VortexId::default(), WakeParameters::default(), AnalysisMode::Steady);
    tv.setup(24, 10.0, NVec3::zeros(), NVec3::new(1.0e5, 0.0, 0.0));
}

#[test]
fn update_keeps_shape_of_every_array() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    let levels = tv.number_of_levels();

    tv.update(20.0, NVec3::new(0.0, 1.0, 0.0), NVec3::new(0.0, 1.0, 1.0e5));
    assert_eq!(tv.number_of_levels(), levels);
    assert_eq!(tv.number_of_nodes(), 17);
    assert_relative_eq!(tv.wake_node(16), NVec3::new(0.0, 1.0, 20.0), epsilon = 1e-12);

    tv.update_new(NVec3::new(1.0, 1.0, 0.0));
    assert_relative_eq!(tv.wake_node(16), NVec3::new(1.0, 1.0, 20.0), epsilon = 1e-12);
    assert_relative_eq!(tv.s(16), 20.0);
}

#[test]
fn steady_wake_nodes_cluster_at_trailing_edge() {
    let tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    let first = tv.s(1) - tv.s(0);
    let last = tv.s(16) - tv.s(15);
    assert!(first < last);
    assert_relative_eq!(tv.s(16), 10.0);

    let uniform = straight_vortex(16, 10.0, 1.0, AnalysisMode::TimeAccurate { time_step: 0.1, convect: ConvectType::Implicit });
    assert_relative_eq!(uniform.s(1), 10.0 / 16.0);
}

// ==================================================================================
// Trailing vortex: search
// ==================================================================================

#[test]
fn search_tree_matches_brute_force() {
    let points: Vec<NVec3> = (0..200)
        .map(|i| {
            let f = i as f64;
            NVec3::new((f * 0.37).sin() * 5.0, (f * 0.13).cos() * 5.0, (f * 0.07).sin() * 5.0)
        })
        .collect();
    let tree = SearchTree::build(&points, 7);
    assert_eq!(tree.version(), 7);
    assert_eq!(tree.len(), 200);

    for k in 0..50 {
        let f = k as f64;
        let q = NVec3::new((f * 1.1).cos() * 7.0, (f * 0.7).sin() * 7.0, f * 0.1 - 2.5);
        let brute = points.iter().map(|p| (p - q).norm()).fold(f64::INFINITY, f64::min);
        let (i, d) = tree.nearest(&q).unwrap();

        assert_relative_eq!(d, brute, max_relative = 1e-14);
        assert_relative_eq!((points[i] - q).norm(), brute, max_relative = 1e-14);
    }
}

#[test]
fn empty_search_tree_is_infinitely_far() {
    let tree = SearchTree::build(&[], 0);
    assert!(tree.is_empty());
    assert_eq!(tree.nearest_distance(&NVec3::zeros()), f64::INFINITY);
}

#[test]
fn search_marks_vortex_and_is_invalidated_by_motion() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    let p = NVec3::new(5.0, 0.0, 2.0);

    assert!(!tv.searched());
    let d = tv.search(&p);
    assert!(tv.searched());
    assert_eq!(tv.distance(), d);
    assert_eq!(d, tv.distance_to(&p));

    let version = tv.search_tree().version();
    tv.set_wake_node(3, tv.wake_node(3) + NVec3::new(0.0, 0.0, 0.5));
    assert!(!tv.searched());
    assert!(tv.search_tree().version() > version);
}

#[test]
fn node_at_infinity_is_not_searched() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    tv.create_search_tree();

    let d = tv.distance_to(&tv.infinity_node());
    assert_relative_eq!(d, (tv.infinity_node() - tv.wake_node(16)).norm(), max_relative = 1e-12);
    assert_eq!(tv.search_tree().len(), tv.number_of_nodes());
}

// ==================================================================================
// Trailing vortex: wake update
// ==================================================================================

#[test]
fn still_air_and_zero_circulation_do_not_move_wake() {
    let mut tv = straight_vortex(32, 10.0, 0.0, AnalysisMode::Steady);
    let mut damped = TrailingVortex::new(VortexId::default(), WakeParameters::default(), AnalysisMode::Steady);
    damped.setup(32, 10.0, NVec3::zeros(), NVec3::new(1.0e5, 0.0, 0.0));

    for v in [&mut tv, &mut damped] {
        v.zero_edge_velocities();
        let before: Vec<NVec3> = (0..v.number_of_nodes()).map(|i| v.wake_node(i)).collect();

        assert_eq!(v.update_wake_location(), 0.0);
        for (i, x) in before.iter().enumerate() {
            assert_eq!(v.wake_node(i), *x);
        }
        assert_eq!(v.state(), VortexState::Converged);
    }
}

#[test]
fn steady_update_relaxes_toward_streamline() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    tv.set_wake_relax(1.0);

    // uniform flow tilted 45 degrees up
    let q = NVec3::new(1.0, 0.0, 1.0);
    for i in 0..8 {
        *tv.edge_velocity_mut(1, i) = q;
    }
    let movement = tv.update_wake_location();
    assert!(movement > 0.0);

    // with full relaxation every node lands on the streamline from the TE
    for i in 1..=8 {
        let s = tv.s(i);
        assert_relative_eq!(tv.wake_node(i), q.normalize() * s, epsilon = 1e-12);
    }
    assert_eq!(tv.wake_node(0), NVec3::zeros());
}

#[test]
fn limit_velocity_caps_speed_and_upstream_flow() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    tv.set_free_stream(NVec3::new(1.0, 0.0, 0.0));

    let mut fast = NVec3::new(10.0, 0.0, 0.0);
    tv.limit_velocity(&mut fast);
    assert_relative_eq!(fast, NVec3::new(2.0, 0.0, 0.0));

    let mut upstream = NVec3::new(-1.0, 0.0, 0.0);
    tv.limit_velocity(&mut upstream);
    assert_relative_eq!(upstream, NVec3::new(0.1, 0.0, 0.0), epsilon = 1e-15);
}

#[test]
fn prolongation_adds_coarse_velocities_to_children() {
    let mut tv = straight_vortex(4, 4.0, 1.0, AnalysisMode::Steady);
    tv.zero_edge_velocities();

    *tv.edge_velocity_mut(3, 0) = NVec3::new(1.0, 0.0, 0.0);
    *tv.edge_velocity_mut(2, 0) = NVec3::new(0.0, 1.0, 0.0);
    *tv.edge_velocity_mut(2, 1) = NVec3::new(0.0, 2.0, 0.0);
    tv.prolongate_edge_velocities();

    assert_eq!(tv.edge_velocity(1, 0), NVec3::new(1.0, 1.0, 0.0));
    assert_eq!(tv.edge_velocity(1, 1), NVec3::new(1.0, 1.0, 0.0));
    assert_eq!(tv.edge_velocity(1, 2), NVec3::new(1.0, 2.0, 0.0));
    assert_eq!(tv.edge_velocity(1, 3), NVec3::new(1.0, 2.0, 0.0));
}

#[test]
fn rigid_rotation_rotates_induced_velocity() {
    let mut tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    droop(&mut tv, 1.0);

    let p = NVec3::new(3.0, 1.0, 0.5);
    let v0 = tv.induced_velocity_at_level(&p, 1);

    let q = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
    tv.update_geometry_location(&NVec3::zeros(), &NVec3::zeros(), &q);
    let v1 = tv.induced_velocity_at_level(&(q * p), 1);

    assert_relative_eq!(v1, q * v0, epsilon = 1e-10);
    assert_relative_eq!(tv.far_edge().direction, NVec3::y(), epsilon = 1e-15);
}

#[test]
fn trailing_edge_update_moves_only_first_node() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    let second = tv.wake_node(1);

    tv.update_trailing_edge_location(NVec3::new(0.0, 0.0, 0.1));
    assert_eq!(tv.te_node(), NVec3::new(0.0, 0.0, 0.1));
    assert_eq!(tv.wake_node(0), NVec3::new(0.0, 0.0, 0.1));
    assert_eq!(tv.wake_node(1), second);

    let shift = NVec3::new(0.0, 0.5, 0.0);
    tv.update_trailing_edge_geometry_location(&shift, &NVec3::zeros(), &UnitQuaternion::identity());
    assert_eq!(tv.te_node(), NVec3::new(0.0, 0.5, 0.1));
    assert_eq!(tv.wake_node(1), second);
}

// ==================================================================================
// Trailing vortex: checkpoint
// ==================================================================================

#[test]
fn save_then_restore_is_exact() {
    let mut tv = straight_vortex(32, 10.0, 1.5, AnalysisMode::Steady);
    droop(&mut tv, 0.7);
    let before = tv.clone();

    tv.save_vortex_state();
    assert_eq!(tv.state(), VortexState::Checkpointed);

    // a wild update and a circulation change
    tv.set_wake_relax(1.0);
    for i in 0..32 {
        *tv.edge_velocity_mut(1, i) = NVec3::new(1.0, (i as f64).sin(), 2.0);
    }
    tv.update_wake_location();
    tv.set_gamma(-4.0);

    tv.restore_wake_shape_state();

    for i in 0..tv.number_of_nodes() {
        assert_eq!(tv.wake_node(i), before.wake_node(i));
        assert_eq!(tv.gamma_at(i), before.gamma_at(i));
    }
    for l in 1..=tv.number_of_levels() {
        for j in 0..tv.number_of_sub_vortices_at(l) {
            assert_eq!(tv.vortex_edge(l, j), before.vortex_edge(l, j));
        }
    }
    assert_eq!(tv.far_edge(), before.far_edge());
    assert_eq!(tv.te_node(), before.te_node());
}

#[test]
fn shape_checkpoint_leaves_circulation_alone() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    let node = tv.wake_node(4);

    tv.save_wake_shape_state();
    tv.set_wake_node(4, node + NVec3::new(0.0, 0.0, 1.0));
    tv.set_gamma(3.0);
    tv.restore_wake_shape_state();

    assert_eq!(tv.wake_node(4), node);
    assert_eq!(tv.gamma(), 3.0);
}

#[test]
fn shape_save_supersedes_earlier_full_save() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    tv.save_vortex_state();

    tv.set_gamma(2.0);
    let node = tv.wake_node(3);
    tv.save_wake_shape_state();

    tv.set_gamma(3.0);
    tv.set_wake_node(3, node + NVec3::new(0.0, 0.5, 0.0));
    tv.restore_wake_shape_state();

    // shape from the latest save, circulation untouched
    assert_eq!(tv.wake_node(3), node);
    assert_eq!(tv.gamma(), 3.0);
    assert_eq!(tv.gamma_at(1), 3.0);

    // a full save after that brings circulation back again
    tv.save_vortex_state();
    tv.set_gamma(5.0);
    tv.restore_wake_shape_state();
    assert_eq!(tv.gamma(), 3.0);
}

#[test]
#[should_panic(expected = "restore requested before any wake state was saved")]
fn restore_without_checkpoint_panics() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Steady);
    tv.restore_wake_shape_state();
}

// ==================================================================================
// Trailing vortex: unsteady
// ==================================================================================

fn unsteady_mode(convect: ConvectType) -> AnalysisMode {
    AnalysisMode::TimeAccurate { time_step: 0.5, convect }
}

#[test]
fn implicit_convection_shifts_one_sub_vortex() {
    let mut tv = straight_vortex(8, 4.0, 0.0, unsteady_mode(ConvectType::Implicit));

    tv.set_gamma(1.0);
    assert_eq!(tv.gamma_at(1), 0.0);
    tv.convect_wake_vorticity(ConvectType::Implicit);
    assert_eq!(tv.current_time_step(), 1);

    tv.set_gamma(2.0);
    tv.convect_wake_vorticity(ConvectType::Implicit);
    assert_eq!(tv.current_time_step(), 2);

    assert_eq!(tv.gamma_at(0), 2.0);
    assert_eq!(tv.gamma_at(1), 2.0);
    assert_eq!(tv.gamma_at(2), 1.0);
    assert_eq!(tv.gamma_at(3), 0.0);
}

#[test]
fn explicit_convection_at_wake_speed_matches_shift() {
    let n = 8;
    let far = 4.0;
    let dt = 0.5;
    let mut tv = straight_vortex(n, far, 0.0, unsteady_mode(ConvectType::Explicit));
    for i in 0..=n {
        tv.set_gamma_at(i, i as f64);
    }

    // packets travel exactly one sub-vortex per step
    let speed = far / n as f64 / dt;
    for i in 0..n {
        *tv.edge_velocity_mut(1, i) = NVec3::new(speed, 0.0, 0.0);
    }
    tv.convect_wake_vorticity(ConvectType::Explicit);

    assert_eq!(tv.gamma_at(0), 0.0);
    for i in 1..n {
        assert_relative_eq!(tv.gamma_at(i), (i - 1) as f64, epsilon = 1e-9);
    }
}

#[test]
fn wake_age_grows_with_time_steps() {
    let mut tv = straight_vortex(8, 4.0, 1.0, unsteady_mode(ConvectType::Implicit));
    tv.update_wake_age();
    tv.update_wake_age();

    assert_eq!(tv.wake_age(0), 0.0);
    assert_relative_eq!(tv.wake_age(1), 0.5);
    assert_relative_eq!(tv.wake_age(2), 1.0);
}

#[test]
fn core_grows_with_wake_age() {
    let params = WakeParameters {
        num_sub_vortices: 8,
        far_dist: 4.0,
        core_size: 0.1,
        core_growth_rate: 0.01,
        wake_damping: true,
        ..Default::default()
    };
    let mut tv = TrailingVortex::new(VortexId::default(), params, unsteady_mode(ConvectType::Implicit));
    tv.setup(8, 4.0, NVec3::zeros(), NVec3::new(1.0e5, 0.0, 0.0));

    assert_relative_eq!(tv.vortex_edge(1, 1).core, 0.1);
    tv.update_wake_age();
    assert_relative_eq!(tv.vortex_edge(1, 0).core, 0.1);
    assert_relative_eq!(tv.vortex_edge(1, 1).core, (0.01f64 + 0.01 * 0.5).sqrt(), epsilon = 1e-15);
}

#[test]
fn unsteady_convection_with_free_stream_keeps_straight_wake() {
    let n = 8;
    let far = 4.0;
    let dt = far / n as f64;
    let mode = AnalysisMode::TimeAccurate { time_step: dt, convect: ConvectType::Implicit };
    let mut tv = straight_vortex(n, far, 1.0, mode);
    tv.set_free_stream(NVec3::new(1.0, 0.0, 0.0));

    for i in 0..n {
        *tv.edge_velocity_mut(1, i) = NVec3::new(1.0, 0.0, 0.0);
    }
    let movement = tv.update_wake_location();

    assert!(movement < 1e-12);
    assert_eq!(tv.state(), VortexState::Ready);
}

// ==================================================================================
// Trailing vortex: adjoint
// ==================================================================================

#[test]
fn wake_equations_are_numbered_consecutively() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Adjoint);

    assert_eq!(tv.number_of_wake_residual_nodes(), 8);
    assert_eq!(tv.number_wake_equations(10), 34);
    assert_eq!(tv.wake_residual_equation_numbers(1), [10, 11, 12]);
    assert_eq!(tv.wake_residual_equation_numbers(8), [31, 32, 33]);
}

#[test]
fn adjoint_update_exposes_residual_without_moving() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Adjoint);
    let before: Vec<NVec3> = (0..9).map(|i| tv.wake_node(i)).collect();

    let q = NVec3::new(1.0, 1.0, 0.0);
    for i in 0..8 {
        *tv.edge_velocity_mut(1, i) = q;
    }
    let largest = tv.update_wake_location();
    assert!(largest > 0.0);

    for (i, x) in before.iter().enumerate() {
        assert_eq!(tv.wake_node(i), *x);
    }

    // node 1 should sit ds along the velocity from the trailing edge
    let ds = tv.s(1);
    let expected = NVec3::new(ds, 0.0, 0.0) - ds * q.normalize();
    assert_relative_eq!(tv.wake_residual(1), expected, epsilon = 1e-12);
}

#[test]
fn aligned_wake_has_zero_adjoint_residual() {
    let mut tv = straight_vortex(8, 8.0, 1.0, AnalysisMode::Adjoint);
    for i in 0..8 {
        *tv.edge_velocity_mut(1, i) = NVec3::new(3.0, 0.0, 0.0);
    }
    assert!(tv.compute_wake_residual() < 1e-12);

    tv.update_geometry_location_for_adjoint_solve(NVec3::new(0.0, 0.0, 0.2));
    assert_eq!(tv.number_of_wake_residual_nodes(), 8);
    assert_relative_eq!(tv.wake_residual(1).z, -0.2, epsilon = 1e-12);
}

// ==================================================================================
// Analysis mode tests
// ==================================================================================

#[test]
fn rotor_onset_includes_blade_frame_velocity() {
    let rotor = RotorKinematics { rpm: 60.0, origin: NVec3::zeros(), thrust_axis: NVec3::z() };
    let mode = AnalysisMode::Rotor { rotor, time_step: 0.01, convect: ConvectType::Implicit };

    let v = mode.onset_velocity(&NVec3::new(0.0, 0.0, -1.0), &NVec3::new(1.0, 0.0, 0.0));
    assert_relative_eq!(v, NVec3::new(0.0, -2.0 * PI, -1.0), epsilon = 1e-12);
    assert_eq!(mode.time_step(), Some(0.01));
}

#[test]
fn wake_step_follows_mode() {
    assert_eq!(AnalysisMode::Steady.wake_step(0.3), WakeStep::Relax(0.3));
    assert_eq!(AnalysisMode::Adjoint.wake_step(0.3), WakeStep::Residual);
    assert_eq!(
        unsteady_mode(ConvectType::Explicit).wake_step(0.3),
        WakeStep::Convect { time_step: 0.5, convect: ConvectType::Explicit }
    );
    assert!(!AnalysisMode::Steady.is_time_accurate());
    assert!(AnalysisMode::Adjoint.is_adjoint());
}

// ==================================================================================
// Grid tests
// ==================================================================================

#[test]
fn rect_wing_edges_and_geometry() {
    let grid = rect_wing_grid(RECT_GAMMAS);

    assert_eq!(grid.number_of_edges(), 22);
    assert_eq!(grid.edges().iter().filter(|e| e.is_boundary()).count(), 12);
    assert!(grid.issues().is_empty());

    for lp in grid.loops() {
        assert_relative_eq!(lp.normal, NVec3::z(), epsilon = 1e-15);
        assert_relative_eq!(lp.area, 0.5, epsilon = 1e-15);
        assert_eq!(lp.edges.len(), 4);
    }
    assert_relative_eq!(grid.min_loop_area(), 0.5, epsilon = 1e-15);
    assert!(grid.check_orientation().is_empty());
}

#[test]
fn edges_are_in_canonical_order() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let keys: Vec<(usize, usize)> = grid.edges().iter().map(|e| e.key()).collect();

    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(sort_edges(grid.edges()), (0..keys.len()).collect::<Vec<_>>());

    // every loop side points at an edge joining those two nodes
    for lp in grid.loops() {
        for (k, &e) in lp.edges.iter().enumerate() {
            let (a, b) = (lp.nodes[k], lp.nodes[(k + 1) % lp.nodes.len()]);
            assert_eq!(grid.edges()[e].key(), (a.min(b), a.max(b)));
        }
    }
}

#[test]
fn kutta_nodes_follow_trailing_edge() {
    let grid = rect_wing_grid(RECT_GAMMAS);

    let nodes: Vec<usize> = grid.kutta_nodes().iter().map(|k| k.node).collect();
    assert_eq!(nodes, vec![2, 5, 8, 11, 14]);

    let tips: Vec<bool> = grid.kutta_nodes().iter().map(|k| k.wingtip).collect();
    assert_eq!(tips, vec![true, false, false, false, true]);

    for (k, kn) in grid.kutta_nodes().iter().enumerate() {
        assert_relative_eq!(kn.s_over_b, 0.25 * k as f64, epsilon = 1e-15);
        assert_eq!(kn.trailing_edge, grid.nodes()[kn.node].xyz);
        assert!(grid.nodes()[kn.node].is_kutta_node);
    }
}

#[test]
fn kutta_node_circulation_from_trailing_edge_jumps() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let shed: Vec<f64> = (0..5).map(|k| grid.kutta_node_circulation(k)).collect();

    let expected = [-0.3, -0.2, 0.0, 0.2, 0.3];
    for (s, e) in shed.iter().zip(expected.iter()) {
        assert_relative_eq!(*s, *e, epsilon = 1e-15);
    }
    assert_relative_eq!(shed.iter().sum::<f64>(), 0.0, epsilon = 1e-15);
}

#[test]
fn interior_edge_carries_circulation_difference() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let e = edge_index(&grid, 1, 4);

    assert_eq!(grid.edges()[e].node1, 1);
    assert_relative_eq!(grid.edges()[e].gamma, 0.18 - 0.30, epsilon = 1e-15);
}

#[test]
fn periodic_surface_has_no_wingtips() {
    let mut grid = Grid::new("ring");
    grid.add_surface(Surface { component: 3, kind: SurfaceKind::Wing, periodic: true });

    // four quads around a square duct, trailing edge at x = 1
    let corners = [(1.0, 0.0), (0.0, 1.0), (-1.0, 0.0), (0.0, -1.0)];
    grid.size_node_list(8);
    for (k, (y, z)) in corners.iter().enumerate() {
        grid.nodes_mut()[k] = Node::new(NVec3::new(0.0, *y, *z), 3);
        grid.nodes_mut()[k + 4] = Node::new(NVec3::new(1.0, *y, *z), 3);
    }
    grid.size_loop_list(4);
    for k in 0..4 {
        let next = (k + 1) % 4;
        grid.loops_mut()[k] = Loop::new(vec![k, k + 4, next + 4, next], 0, 1.0);
    }
    grid.create_tri_edges();
    grid.calculate_tri_normals_and_centroids();
    for k in 0..4 {
        assert!(grid.mark_trailing_edge(k + 4, (k + 1) % 4 + 4));
    }

    assert_eq!(grid.find_kutta_nodes(), 4);
    assert!(grid.kutta_nodes().iter().all(|k| !k.wingtip && k.periodic && k.component == 3));
}

#[test]
fn degenerate_loops_are_flagged_not_fatal() {
    let mut grid = Grid::new("bad");
    grid.add_surface(Surface::default());
    grid.size_node_list(5);
    let points = [(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (0.0, 1.0), (1.0, 1.0)];
    for (i, (x, y)) in points.iter().enumerate() {
        grid.nodes_mut()[i] = Node::new(NVec3::new(*x, *y, 0.0), 0);
    }

    // a good triangle, a collinear one and one repeating a node
    grid.size_loop_list(3);
    grid.loops_mut()[0] = Loop::new(vec![0, 1, 3], 0, 0.0);
    grid.loops_mut()[1] = Loop::new(vec![2, 1, 0], 0, 0.0);
    grid.loops_mut()[2] = Loop::new(vec![1, 4, 4, 3], 0, 0.0);

    let edge_issues = grid.create_tri_edges();
    assert!(edge_issues.contains(&GridIssue::ZeroLengthEdge { loop_id: 2, node1: 4, node2: 4 }));

    let normal_issues = grid.calculate_tri_normals_and_centroids();
    assert_eq!(normal_issues.len(), 1);
    assert!(matches!(normal_issues[0], GridIssue::ZeroNormal { loop_id: 1, .. }));

    assert!(!grid.loops()[0].degenerate);
    assert!(grid.loops()[1].degenerate);
    assert!(grid.loops()[2].degenerate);
    assert_relative_eq!(grid.loops()[0].normal, NVec3::z(), epsilon = 1e-15);
    assert_eq!(grid.issues().len(), edge_issues.len() + normal_issues.len());
}

#[test]
fn inconsistent_orientation_is_reported() {
    let mut grid = Grid::new("flipped");
    grid.size_node_list(4);
    let points = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, -1.0)];
    for (i, (x, y)) in points.iter().enumerate() {
        grid.nodes_mut()[i] = Node::new(NVec3::new(*x, *y, 0.0), 0);
    }
    grid.size_loop_list(2);
    grid.loops_mut()[0] = Loop::new(vec![0, 1, 2], 0, 0.0);
    grid.loops_mut()[1] = Loop::new(vec![0, 1, 3], 0, 0.0);

    let issues = grid.create_tri_edges();
    assert_eq!(issues.len(), 1);
    assert!(matches!(issues[0], GridIssue::InconsistentOrientation { loop1: 0, loop2: 1, .. }));
}

#[test]
fn upwind_edges_face_the_flow() {
    let mut grid = rect_wing_grid(RECT_GAMMAS);
    grid.calculate_upwind_edges(&NVec3::new(1.0, 0.0, 0.1));
    grid.create_upwind_edge_data();

    let leading = &grid.loops()[0];
    assert_eq!(grid.edges()[leading.upwind_edge.unwrap()].key(), (0, 3));
    assert_eq!(leading.upwind_loop, None);
    assert_relative_eq!(leading.upwind_offset, NVec3::new(-0.25, 0.0, 0.0), epsilon = 1e-15);

    let aft = &grid.loops()[1];
    assert_eq!(grid.edges()[aft.upwind_edge.unwrap()].key(), (1, 4));
    assert_eq!(aft.upwind_loop, Some(0));
    assert_relative_eq!(aft.upwind_offset, NVec3::new(-0.5, 0.0, 0.0), epsilon = 1e-15);
}

#[test]
fn upwind_tie_picks_lowest_edge() {
    let mut grid = Grid::new("square");
    grid.size_node_list(4);
    for (i, (x, y)) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)].iter().enumerate() {
        grid.nodes_mut()[i] = Node::new(NVec3::new(*x, *y, 0.0), 0);
    }
    grid.size_loop_list(1);
    grid.loops_mut()[0] = Loop::new(vec![0, 1, 2, 3], 0, 0.0);
    grid.create_tri_edges();
    grid.calculate_tri_normals_and_centroids();

    // diagonal flow: the x = 0 and y = 0 sides are equally upwind
    grid.calculate_upwind_edges(&NVec3::new(1.0, 1.0, 0.0));
    assert_eq!(grid.loops()[0].upwind_edge, Some(0));
    assert_eq!(grid.edges()[0].key(), (0, 1));

    // no tangential flow, no upwind edge
    grid.calculate_upwind_edges(&NVec3::new(0.0, 0.0, 1.0));
    assert_eq!(grid.loops()[0].upwind_edge, None);
}

#[test]
fn borrowed_node_list_is_moved_in_place() {
    let mut nodes = vec![Node::new(NVec3::new(1.0, 2.0, 3.0), 0), Node::new(NVec3::new(4.0, 5.0, 6.0), 1)];
    {
        let mut grid = Grid::new("view");
        grid.use_this_node_list(&mut nodes);
        grid.update_geometry_location(
            &NVec3::new(1.0, 0.0, 0.0),
            &NVec3::zeros(),
            &UnitQuaternion::identity(),
            &[true, false],
        );
    }
    assert_eq!(nodes[0].xyz, NVec3::new(2.0, 2.0, 3.0));
    assert_eq!(nodes[1].xyz, NVec3::new(4.0, 5.0, 6.0));
}

#[test]
fn identity_motion_changes_nothing() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let mut solver = WakeSolver::new(grid, test_params(16, 5.0), AnalysisMode::Steady, NVec3::new(1.0, 0.0, 0.1));
    let field_points = [NVec3::new(0.5, 0.3, 0.2), NVec3::new(3.0, 1.0, -0.5), NVec3::new(1.0, 2.0, 0.0)];

    let nodes: Vec<NVec3> = solver.grid.nodes().iter().map(|n| n.xyz).collect();
    let normals: Vec<NVec3> = solver.grid.loops().iter().map(|l| l.normal).collect();
    let wake: Vec<NVec3> = solver.vortices.iter().flat_map(|tv| (0..17).map(move |i| tv.wake_node(i))).collect();
    let velocities: Vec<NVec3> = field_points.iter().map(|p| solver.velocity_at(p)).collect();

    solver.update_geometry_location(&NVec3::zeros(), &NVec3::new(1.0, 2.0, 3.0), &UnitQuaternion::identity(), &[true]);

    let nodes_after: Vec<NVec3> = solver.grid.nodes().iter().map(|n| n.xyz).collect();
    let normals_after: Vec<NVec3> = solver.grid.loops().iter().map(|l| l.normal).collect();
    let wake_after: Vec<NVec3> = solver.vortices.iter().flat_map(|tv| (0..17).map(move |i| tv.wake_node(i))).collect();
    let velocities_after: Vec<NVec3> = field_points.iter().map(|p| solver.velocity_at(p)).collect();

    assert_eq!(nodes, nodes_after);
    assert_eq!(normals, normals_after);
    assert_eq!(wake, wake_after);
    assert_eq!(velocities, velocities_after);
}

// ==================================================================================
// Gradient tests
// ==================================================================================

#[test]
fn gradient_of_linear_field_is_exact() {
    let offsets = [
        NVec3::new(1.0, 0.0, 0.0),
        NVec3::new(0.0, 1.0, 0.0),
        NVec3::new(0.0, 0.0, 1.0),
        NVec3::new(1.0, 1.0, 1.0),
    ];

    let mut g = Gradient::new();
    g.size_list(5, 4, 3);
    for (eq, r) in offsets.iter().enumerate() {
        g.set_row(eq, r);
        g.set_b(eq, linear_field(r));
    }
    g.lu();
    g.solve();

    assert_relative_eq!(g.dv_dx(), 2.0, epsilon = 1e-12);
    assert_relative_eq!(g.dv_dy(), -1.0, epsilon = 1e-12);
    assert_relative_eq!(g.dv_dz(), 3.0, epsilon = 1e-12);

    // same factors, second field
    for (eq, r) in offsets.iter().enumerate() {
        g.set_b(eq, r.x + r.y + r.z);
    }
    assert_relative_eq!(g.solve(), NVec3::new(1.0, 1.0, 1.0), epsilon = 1e-12);
}

#[test]
fn gradient_on_octahedron_loops() {
    let mut grid = octahedron_grid();
    assert!(grid.create_tri_edges().is_empty());
    assert!(grid.calculate_tri_normals_and_centroids().is_empty());
    assert_eq!(grid.number_of_edges(), 12);

    for lp in grid.loops() {
        assert!(lp.normal.dot(&lp.centroid) > 0.0);
    }

    let field: Vec<f64> = grid.loops().iter().map(|l| linear_field(&l.centroid)).collect();
    for l in 0..grid.number_of_loops() {
        let mut g = Gradient::for_loop(&grid, l);
        assert_eq!(g.number_of_equations(), 6);
        assert_eq!(g.loop_list(0), l);

        g.load_field(&field);
        assert_relative_eq!(g.solve(), NVec3::new(2.0, -1.0, 3.0), epsilon = 1e-10);
    }
}

#[test]
fn collinear_stencil_gives_nan_gradient() {
    let mut g = Gradient::new();
    g.size_list(4, 3, 3);
    for eq in 0..3 {
        let r = NVec3::new(eq as f64 + 1.0, 0.0, 0.0);
        g.set_row(eq, &r);
        g.set_b(eq, linear_field(&r));
    }
    g.lu();

    assert!(g.solve().iter().all(|c| c.is_nan()));
}

#[test]
#[should_panic(expected = "3 degrees of freedom")]
fn gradient_requires_three_degrees_of_freedom() {
    Gradient::new().size_list(4, 3, 2);
}

#[test]
#[should_panic(expected = "before the normal matrix was factored")]
fn gradient_solve_before_lu_panics() {
    let mut g = Gradient::new();
    g.size_list(4, 3, 3);
    g.solve();
}

// ==================================================================================
// Merge sort tests
// ==================================================================================

#[test]
fn merge_sort_is_stable() {
    let items = [(3, 'a'), (1, 'b'), (3, 'c'), (2, 'd'), (1, 'e')];
    assert_eq!(merge_sort_by_key(&items, |t| t.0), vec![1, 4, 3, 0, 2]);

    let empty: [(i32, char); 0] = [];
    assert!(merge_sort_by_key(&empty, |t| t.0).is_empty());
}

#[test]
fn merge_sort_orders_odd_lengths() {
    let items: Vec<i64> = (0..37).map(|i| (i * 17) % 11).collect();
    let order = merge_sort_by_key(&items, |v| *v);
    assert!(order.windows(2).all(|w| items[w[0]] < items[w[1]] || (items[w[0]] == items[w[1]] && w[0] < w[1])));
}

// ==================================================================================
// Record stream tests
// ==================================================================================

#[test]
fn vortex_record_restores_state() {
    let mut tv = straight_vortex(16, 10.0, 0.8, AnalysisMode::Steady);
    droop(&mut tv, 0.4);
    tv.set_s_over_b(0.75);

    let mut buf = Vec::new();
    tv.write_to_file(&mut buf).unwrap();

    let mut other = straight_vortex(16, 3.0, 0.0, AnalysisMode::Steady);
    other.read_in_file(&mut Cursor::new(&buf)).unwrap();

    for i in 0..tv.number_of_nodes() {
        assert_eq!(other.wake_node(i), tv.wake_node(i));
        assert_eq!(other.gamma_at(i), tv.gamma_at(i));
    }
    assert_eq!(other.s_over_b(), 0.75);
    assert_eq!(other.far_dist(), 10.0);
    assert_eq!(other.vortex_edge(5, 0), tv.vortex_edge(5, 0));
}

#[test]
fn vortex_record_size_mismatch_is_an_error() {
    let tv = straight_vortex(16, 10.0, 1.0, AnalysisMode::Steady);
    let mut buf = Vec::new();
    tv.write_to_file(&mut buf).unwrap();

    let mut other = straight_vortex(8, 10.0, 1.0, AnalysisMode::Steady);
    let err = other.read_in_file(&mut Cursor::new(&buf)).unwrap_err();
    assert!(matches!(err, WakeError::RecordMismatch { expected: 8, found: 16, .. }));
}

#[test]
fn records_can_be_skipped() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let first = straight_vortex(8, 10.0, 1.0, AnalysisMode::Steady);
    let second = straight_vortex(8, 20.0, 2.0, AnalysisMode::Steady);

    let mut buf = Vec::new();
    grid.write_to_file(&mut buf).unwrap();
    first.write_to_file(&mut buf).unwrap();
    second.write_to_file(&mut buf).unwrap();

    let mut reader = Cursor::new(&buf);
    Grid::skip_read_in_file(&mut reader).unwrap();
    TrailingVortex::skip_read_in_file(&mut reader).unwrap();

    let mut target = straight_vortex(8, 1.0, 0.0, AnalysisMode::Steady);
    target.read_in_file(&mut reader).unwrap();
    assert_eq!(target.gamma(), 2.0);
    assert_eq!(target.wake_node(8), second.wake_node(8));

    // wrong record type
    let mut reader = Cursor::new(&buf);
    let err = target.read_in_file(&mut reader).unwrap_err();
    assert!(matches!(err, WakeError::RecordTag { .. }));
}

/// Shorten the body of the first record in `buf` to `keep` bytes, optionally
/// rewriting the header length to match
fn truncate_record(buf: &[u8], keep: usize, fix_header: bool) -> Vec<u8> {
    let mut out = buf[..12 + keep].to_vec();
    if fix_header {
        out[4..12].copy_from_slice(&(keep as u64).to_le_bytes());
    }
    out
}

#[test]
fn truncated_vortex_record_leaves_vortex_untouched() {
    let mut source = straight_vortex(16, 10.0, 0.8, AnalysisMode::Steady);
    droop(&mut source, 0.4);
    let mut buf = Vec::new();
    source.write_to_file(&mut buf).unwrap();
    let body = buf.len() - 12;

    let mut tv = straight_vortex(16, 3.0, 0.2, AnalysisMode::Steady);
    tv.create_search_tree();
    let before = tv.clone();
    let p = NVec3::new(1.3, 0.4, 0.0);

    // consistent header, body ends part-way through the nodes
    let cut = truncate_record(&buf, 2 * body / 3, true);
    let err = tv.read_in_file(&mut Cursor::new(&cut)).unwrap_err();
    assert!(matches!(err, WakeError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof));

    // header promises more than the stream holds
    let cut = truncate_record(&buf, body / 2, false);
    let err = tv.read_in_file(&mut Cursor::new(&cut)).unwrap_err();
    assert!(matches!(err, WakeError::RecordLength { declared, available, .. }
        if declared == body as u64 && available == (body / 2) as u64));

    assert_eq!(tv.id(), before.id());
    assert_eq!(tv.far_dist(), 3.0);
    assert_eq!(tv.gamma(), 0.2);
    for i in 0..tv.number_of_nodes() {
        assert_eq!(tv.wake_node(i), before.wake_node(i));
    }

    // cached tree still matches the nodes
    let brute = (0..tv.number_of_nodes()).map(|i| (tv.wake_node(i) - p).norm()).fold(f64::INFINITY, f64::min);
    assert_relative_eq!(tv.distance_to(&p), brute, epsilon = 1e-12);
    assert_eq!(tv.distance_to(&p), before.distance_to(&p));
}

#[test]
fn truncated_grid_record_leaves_grid_untouched() {
    let mut moved = rect_wing_grid(RECT_GAMMAS);
    moved.update_geometry_location(&NVec3::new(0.0, 0.0, 1.0), &NVec3::zeros(), &UnitQuaternion::identity(), &[true]);
    moved.loops_mut()[2].gamma = 0.7;
    let mut buf = Vec::new();
    moved.write_to_file(&mut buf).unwrap();

    // node record intact, loop record cut short
    buf.truncate(buf.len() - 8);

    let mut grid = rect_wing_grid(RECT_GAMMAS);
    let reference = rect_wing_grid(RECT_GAMMAS);
    let err = grid.read_in_file(&mut Cursor::new(&buf)).unwrap_err();
    assert!(matches!(err, WakeError::RecordLength { .. }));

    for (a, b) in grid.nodes().iter().zip(reference.nodes().iter()) {
        assert_eq!(a.xyz, b.xyz);
    }
    assert_eq!(grid.loops()[2].gamma, RECT_GAMMAS[2]);
}

#[test]
fn oversized_record_length_is_an_error() {
    let mut buf = b"WKTV".to_vec();
    buf.extend_from_slice(&u64::MAX.to_le_bytes());
    buf.extend_from_slice(&[0u8; 64]);

    let mut tv = straight_vortex(8, 4.0, 1.0, AnalysisMode::Steady);
    let err = tv.read_in_file(&mut Cursor::new(&buf)).unwrap_err();
    assert!(matches!(err, WakeError::RecordLength { declared: u64::MAX, available: 64, .. }));

    let mut reader = Cursor::new(&buf);
    let err = TrailingVortex::skip_read_in_file(&mut reader).unwrap_err();
    assert!(matches!(err, WakeError::RecordLength { declared: u64::MAX, available: 64, .. }));
    assert_eq!(reader.position(), 12);
}

#[test]
fn grid_record_restores_positions_and_circulation() {
    let mut moved = rect_wing_grid(RECT_GAMMAS);
    moved.loops_mut()[3].gamma = 0.9;
    let rotation = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.1);
    moved.update_geometry_location(&NVec3::new(0.0, 0.0, 1.0), &NVec3::zeros(), &rotation, &[true]);

    let mut buf = Vec::new();
    moved.write_to_file(&mut buf).unwrap();

    let mut grid = rect_wing_grid(RECT_GAMMAS);
    grid.read_in_file(&mut Cursor::new(&buf)).unwrap();

    for (a, b) in grid.nodes().iter().zip(moved.nodes().iter()) {
        assert_eq!(a.xyz, b.xyz);
    }
    assert_eq!(grid.loops()[3].gamma, 0.9);
    assert_relative_eq!(grid.loops()[0].normal, moved.loops()[0].normal, epsilon = 1e-15);
    assert_eq!(grid.kutta_node(0).trailing_edge, moved.nodes()[2].xyz);
}

// ==================================================================================
// Solver tests
// ==================================================================================

#[test]
fn solver_sheds_one_vortex_per_kutta_node() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let solver = WakeSolver::new(grid, test_params(16, 5.0), AnalysisMode::Steady, NVec3::new(1.0, 0.0, 0.0));

    assert_eq!(solver.vortices.len(), 5);
    let expected = [-0.3, -0.2, 0.0, 0.2, 0.3];
    for (k, tv) in solver.vortices.iter().enumerate() {
        assert_relative_eq!(tv.gamma(), expected[k], epsilon = 1e-15);
        assert_eq!(tv.te_node(), solver.grid.kutta_node(k).trailing_edge);
        assert_eq!(tv.id().node, solver.grid.kutta_node(k).node);
        assert!(solver.grid.edges()[tv.id().edge].trailing_edge);
    }
}

#[test]
fn solver_in_still_air_converges_immediately() {
    let grid = rect_wing_grid([0.0; 8]);
    let mut solver = WakeSolver::new(grid, test_params(16, 5.0), AnalysisMode::Steady, NVec3::zeros());

    solver.evaluate_edge_velocities();
    assert_eq!(solver.update_wake(), 0.0);

    let report = solver.solve_steady();
    assert!(report.converged);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.rollbacks, 0);
}

#[test]
fn steady_rollup_keeps_wake_attached() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let mut params = test_params(16, 5.0);
    params.max_iterations = 5;
    let mut solver = WakeSolver::new(grid, params, AnalysisMode::Steady, NVec3::new(1.0, 0.0, 0.0));

    let report = solver.solve_steady();
    assert!(report.iterations >= 1);
    assert!(report.residual.is_finite());

    for (k, tv) in solver.vortices.iter().enumerate() {
        assert_eq!(tv.wake_node(0), solver.grid.kutta_node(k).trailing_edge);
        assert!((0..tv.number_of_nodes()).all(|i| tv.wake_node(i).iter().all(|c| c.is_finite())));
        // the wake still trails downstream
        assert!(tv.wake_node(16).x > 2.5);
    }
}

#[test]
fn parallel_and_serial_velocity_agree() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let solver = WakeSolver::new(grid, test_params(16, 5.0), AnalysisMode::Steady, NVec3::new(1.0, 0.0, 0.0));

    let points: Vec<NVec3> = (0..20).map(|i| NVec3::new(0.3 * i as f64 - 1.0, 0.1 * i as f64 - 1.0, 0.4)).collect();
    let batch = solver.velocities_at(&points);
    for (p, v) in points.iter().zip(batch.iter()) {
        assert_eq!(*v, solver.velocity_at(p));
    }
}

#[test]
fn unsteady_steps_shed_circulation() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let mode = AnalysisMode::TimeAccurate { time_step: 5.0 / 16.0, convect: ConvectType::Implicit };
    let mut solver = WakeSolver::new(grid, test_params(16, 5.0), mode, NVec3::new(1.0, 0.0, 0.0));

    // impulsive start: only the newest packet carries circulation
    assert_eq!(solver.vortices[0].gamma_at(1), 0.0);

    solver.advance_time_step();
    solver.advance_time_step();

    assert_relative_eq!(solver.time, 2.0 * 5.0 / 16.0);
    let tip = &solver.vortices[0];
    assert_eq!(tip.current_time_step(), 2);
    assert_relative_eq!(tip.gamma_at(1), -0.3, epsilon = 1e-15);
    assert_relative_eq!(tip.gamma_at(2), -0.3, epsilon = 1e-15);
    assert_eq!(tip.gamma_at(3), 0.0);
}

#[test]
fn rotor_step_turns_the_blade() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let rotor = RotorKinematics { rpm: 60.0, origin: NVec3::new(0.0, -2.0, 0.0), thrust_axis: NVec3::z() };
    let mode = AnalysisMode::Rotor { rotor, time_step: 0.01, convect: ConvectType::Implicit };
    let mut solver = WakeSolver::new(grid, test_params(8, 2.0), mode, NVec3::zeros());

    let tip_before = solver.grid.kutta_node(4).trailing_edge;
    solver.advance_time_step();
    let tip_after = solver.grid.kutta_node(4).trailing_edge;

    // rotated about the hub, same radius
    let r0 = (tip_before - rotor.origin).norm();
    let r1 = (tip_after - rotor.origin).norm();
    assert_relative_eq!(r0, r1, epsilon = 1e-12);
    assert!((tip_after - tip_before).norm() > 0.0);
    assert_eq!(solver.vortices[4].te_node(), tip_after);
}

#[test]
fn rotor_wake_stays_where_it_was_shed() {
    // no circulation and no free stream: nothing moves the shed nodes
    let grid = rect_wing_grid([0.0; 8]);
    let rotor = RotorKinematics { rpm: 60.0, origin: NVec3::zeros(), thrust_axis: NVec3::z() };
    let mode = AnalysisMode::Rotor { rotor, time_step: 0.01, convect: ConvectType::Implicit };
    let mut solver = WakeSolver::new(grid, test_params(8, 2.0), mode, NVec3::zeros());

    let mut tips = vec![solver.grid.kutta_node(4).trailing_edge];
    for _ in 0..3 {
        solver.advance_time_step();
        tips.push(solver.grid.kutta_node(4).trailing_edge);
    }

    // node k is the trailing edge as it was k steps ago
    let tv = &solver.vortices[4];
    for k in 0..=3 {
        assert_relative_eq!(tv.wake_node(k), tips[3 - k], epsilon = 1e-12);
        assert_relative_eq!(tv.wake_node(k).norm(), tips[0].norm(), epsilon = 1e-12);
    }

    // the blade advanced by omega * dt per step
    let angle = (tips[0].normalize().dot(&tips[3].normalize())).acos();
    assert_relative_eq!(angle, 3.0 * 2.0 * PI * 0.01, epsilon = 1e-9);
}

#[test]
fn adjoint_residuals_cover_every_wake_node() {
    let grid = rect_wing_grid(RECT_GAMMAS);
    let mut solver = WakeSolver::new(grid, test_params(8, 4.0), AnalysisMode::Adjoint, NVec3::new(1.0, 0.0, 0.0));

    let (next, largest) = solver.assemble_wake_residuals(100);
    assert_eq!(next, 100 + 5 * 8 * 3);
    assert!(largest.is_finite());
    assert_eq!(solver.vortices[1].wake_residual_equation_numbers(1), [124, 125, 126]);
}

// ==================================================================================
// Scenario tests
// ==================================================================================

const SMALL_SCENARIO: &str = r#"
wake:
  num_sub_vortices: 8
  far_dist: 4.0
  sigma: 0.05
  wake_relax: 0.5
  tolerance: 1.0e-5
  max_iterations: 3
free_stream:
  speed: 2.0
  alpha_deg: 0.0
  beta_deg: 0.0
analysis:
  mode: "time_accurate"
  time_step: 0.5
  num_steps: 4
  convect: "explicit"
mesh:
  nodes:
    - [0.0, 0.0, 0.0]
    - [1.0, 0.0, 0.0]
    - [1.0, 1.0, 0.0]
    - [0.0, 1.0, 0.0]
  surfaces:
    - component: 0
      kind: "wing"
  loops:
    - nodes: [0, 1, 2, 3]
      surface: 0
      gamma: 1.0
  trailing_edge:
    - [1, 2]
"#;

#[test]
fn scenario_builds_from_yaml() {
    let cfg: ScenarioConfig = serde_yaml::from_str(SMALL_SCENARIO).unwrap();
    let scenario = Scenario::build_scenario(cfg).unwrap();

    assert_eq!(scenario.num_steps, 4);
    assert_eq!(
        scenario.mode,
        AnalysisMode::TimeAccurate { time_step: 0.5, convect: ConvectType::Explicit }
    );
    assert_relative_eq!(scenario.free_stream, NVec3::new(2.0, 0.0, 0.0), epsilon = 1e-15);
    assert_eq!(scenario.grid.number_of_kutta_nodes(), 2);

    let solver = scenario.into_solver();
    assert_eq!(solver.vortices.len(), 2);
    assert_relative_eq!(solver.vortices[0].gamma() + solver.vortices[1].gamma(), 0.0);
}

#[test]
fn scenario_rejects_bad_parameters() {
    let text = SMALL_SCENARIO.replace("num_sub_vortices: 8", "num_sub_vortices: 12");
    let cfg: ScenarioConfig = serde_yaml::from_str(&text).unwrap();
    assert!(matches!(Scenario::build_scenario(cfg), Err(WakeError::InvalidConfig(_))));

    let text = SMALL_SCENARIO.replace("- [1, 2]", "- [0, 2]");
    let cfg: ScenarioConfig = serde_yaml::from_str(&text).unwrap();
    assert!(matches!(Scenario::build_scenario(cfg), Err(WakeError::InvalidConfig(_))));
}

#[test]
fn bundled_scenario_parses() {
    let path = std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios").join("rect_wing.yaml");
    let text = std::fs::read_to_string(path).unwrap();
    let cfg: ScenarioConfig = serde_yaml::from_str(&text).unwrap();
    let scenario = Scenario::build_scenario(cfg).unwrap();

    assert_eq!(scenario.grid.number_of_kutta_nodes(), 5);
    assert_eq!(scenario.params.num_sub_vortices, 32);
}

#[test]
fn vortex_edge_default_is_inert() {
    let edge = VortexEdge::default();
    assert_eq!(edge.induced_velocity(&NVec3::new(1.0, 0.0, 0.0), None), NVec3::zeros());
}
