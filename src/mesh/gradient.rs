//! Least-squares gradient reconstruction on a loop stencil
//!
//! For a loop `i` with stencil neighbors `j`, minimizes
//! `Σ (φ_j - φ_i - ∇φ_i · r_ij)²` through the normal equations
//! `(Aᵗ A) ∇φ = Aᵗ b`, with one row `r_ij` per neighbor.
//!
//! The normal matrix is factored once ([`Gradient::lu`]) and the factors are
//! reused by every [`Gradient::solve`], so several scalar fields can share
//! one stencil. A singular stencil surfaces as a NaN gradient.

use nalgebra::{DMatrix, DVector, Dyn, LU};

use super::grid::Grid;
use crate::simulation::states::NVec3;

/// Gradient components, always x/y/z
pub const GRADIENT_DOF: usize = 3;

#[derive(Debug, Clone)]
pub struct Gradient {
    number_of_loops: usize,
    number_of_equations: usize,
    loop_list: Vec<usize>, // loop_list[0] is the center loop, then one neighbor per equation
    a: DMatrix<f64>,
    at: DMatrix<f64>,
    aa: DMatrix<f64>,
    lu: Option<LU<f64, Dyn, Dyn>>,
    b: DVector<f64>,
    gradient: NVec3,
    sized: bool,
}

impl Default for Gradient {
    fn default() -> Self {
        Self {
            number_of_loops: 0,
            number_of_equations: 0,
            loop_list: Vec::new(),
            a: DMatrix::zeros(0, GRADIENT_DOF),
            at: DMatrix::zeros(GRADIENT_DOF, 0),
            aa: DMatrix::zeros(GRADIENT_DOF, GRADIENT_DOF),
            lu: None,
            b: DVector::zeros(0),
            gradient: NVec3::zeros(),
            sized: false,
        }
    }
}

impl Gradient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the stencil system.
    ///
    /// # Panics
    /// If `number_of_degrees_of_freedom` is not 3.
    pub fn size_list(&mut self, number_of_loops: usize, number_of_equations: usize, number_of_degrees_of_freedom: usize) {
        assert_eq!(
            number_of_degrees_of_freedom, GRADIENT_DOF,
            "gradient reconstruction always has 3 degrees of freedom"
        );

        self.number_of_loops = number_of_loops;
        self.number_of_equations = number_of_equations;
        self.loop_list = vec![0; number_of_loops];
        self.a = DMatrix::zeros(number_of_equations, GRADIENT_DOF);
        self.at = DMatrix::zeros(GRADIENT_DOF, number_of_equations);
        self.aa = DMatrix::zeros(GRADIENT_DOF, GRADIENT_DOF);
        self.lu = None;
        self.b = DVector::zeros(number_of_equations);
        self.gradient = NVec3::zeros();
        self.sized = true;
    }

    /// Stencil of `loop_id` and its vertex neighbors on `grid`, with the
    /// rows filled from centroid offsets and the normal matrix factored
    pub fn for_loop(grid: &Grid, loop_id: usize) -> Self {
        let neighbors = grid.loop_neighbors(loop_id);
        let center = grid.loops()[loop_id].centroid;

        let mut gradient = Self::new();
        gradient.size_list(neighbors.len() + 1, neighbors.len(), GRADIENT_DOF);
        gradient.loop_list[0] = loop_id;
        for (eq, &j) in neighbors.iter().enumerate() {
            gradient.loop_list[eq + 1] = j;
            gradient.set_row(eq, &(grid.loops()[j].centroid - center));
        }
        gradient.lu();
        gradient
    }

    pub fn number_of_loops(&self) -> usize {
        self.number_of_loops
    }

    pub fn number_of_equations(&self) -> usize {
        self.number_of_equations
    }

    pub fn number_of_degrees_of_freedom(&self) -> usize {
        GRADIENT_DOF
    }

    pub fn loop_list(&self, i: usize) -> usize {
        self.loop_list[i]
    }

    pub fn set_loop(&mut self, i: usize, loop_id: usize) {
        self.loop_list[i] = loop_id;
    }

    /// Offset from the center sample to the sample of equation `eq`
    pub fn set_row(&mut self, eq: usize, offset: &NVec3) {
        self.assert_sized();
        for k in 0..GRADIENT_DOF {
            self.a[(eq, k)] = offset[k];
        }
        self.lu = None;
    }

    /// Right-hand side of equation `eq`: sample difference `φ_j - φ_i`
    pub fn set_b(&mut self, eq: usize, value: f64) {
        self.b[eq] = value;
    }

    pub fn b(&self, eq: usize) -> f64 {
        self.b[eq]
    }

    /// Fill the right-hand side from a per-loop field using the loop list
    pub fn load_field(&mut self, field: &[f64]) {
        let center = field[self.loop_list[0]];
        for eq in 0..self.number_of_equations {
            self.b[eq] = field[self.loop_list[eq + 1]] - center;
        }
    }

    /// Assemble `AᵗA` and factor it
    pub fn lu(&mut self) {
        self.assert_sized();
        self.at = self.a.transpose();
        self.aa = &self.at * &self.a;
        self.lu = Some(self.aa.clone().lu());
    }

    /// Gradient for the current right-hand side, reusing the factors.
    /// A singular stencil gives a NaN gradient.
    ///
    /// # Panics
    /// If [`Gradient::lu`] was not called since the rows last changed.
    pub fn solve(&mut self) -> NVec3 {
        let Some(lu) = self.lu.as_ref() else {
            panic!("gradient solve requested before the normal matrix was factored");
        };

        let rhs = &self.at * &self.b;
        self.gradient = match lu.solve(&rhs) {
            Some(x) if x.iter().all(|v| v.is_finite()) => NVec3::new(x[0], x[1], x[2]),
            _ => NVec3::repeat(f64::NAN),
        };
        self.gradient
    }

    pub fn dv_dx(&self) -> f64 {
        self.gradient.x
    }

    pub fn dv_dy(&self) -> f64 {
        self.gradient.y
    }

    pub fn dv_dz(&self) -> f64 {
        self.gradient.z
    }

    pub fn vector(&self) -> NVec3 {
        self.gradient
    }

    pub fn a(&self) -> &DMatrix<f64> {
        &self.a
    }

    pub fn at(&self) -> &DMatrix<f64> {
        &self.at
    }

    pub fn aa(&self) -> &DMatrix<f64> {
        &self.aa
    }

    fn assert_sized(&self) {
        assert!(self.sized, "gradient system used before size_list");
    }
}
