#[cfg(feature = "faer")]
mod faer;
#[cfg(feature = "faer")]
pub use faer::*;

#[cfg(feature = "rsparse")]
mod rsparse;
#[cfg(feature = "rsparse")]
pub use rsparse::*;

use super::error::SolverError;
use super::model::{Backend, SolverConfig};

#[cfg(feature = "rsparse")]
pub type DefaultSolver = RSparseSolver;

#[cfg(all(not(feature = "rsparse"), feature = "faer"))]
pub type DefaultSolver = FaerSolver;

/// A pluggable sparse-LU backend.
///
/// One factor-and-solve per Newton iteration, no iterative refinement.
/// Construction (`Default`) is the initialization hook; `allocate` sizes
/// working structures, `factor_and_solve` consumes one compressed-column
/// system, and `release` drops transient factorization state between
/// iterations.
pub trait Solve {
    /// Prepare working structures for a system of dimension `dim` with
    /// `nnz` non-zeros. `rebuild` is set when the sparsity pattern may
    /// have changed since the previous call, invalidating any cached
    /// symbolic analysis.
    fn allocate(&mut self, dim: usize, nnz: usize, rebuild: bool) -> Result<(), SolverError>;

    /// Factor the matrix `(col_ptr, row_ind, values)` and solve in
    /// place: on success `rhs` holds the solution vector.
    fn factor_and_solve(
        &mut self,
        col_ptr: &[usize],
        row_ind: &[usize],
        values: &[f64],
        rhs: &mut [f64],
    ) -> Result<(), SolverError>;

    /// Drop per-iteration factorization state. `will_iterate` is false
    /// on the final call of a solve, allowing cached analysis to be
    /// released as well.
    fn release(&mut self, will_iterate: bool);
}

impl<T: Solve + ?Sized> Solve for Box<T> {
    fn allocate(&mut self, dim: usize, nnz: usize, rebuild: bool) -> Result<(), SolverError> {
        (**self).allocate(dim, nnz, rebuild)
    }

    fn factor_and_solve(
        &mut self,
        col_ptr: &[usize],
        row_ind: &[usize],
        values: &[f64],
        rhs: &mut [f64],
    ) -> Result<(), SolverError> {
        (**self).factor_and_solve(col_ptr, row_ind, values, rhs)
    }

    fn release(&mut self, will_iterate: bool) {
        (**self).release(will_iterate)
    }
}

/// Instantiate the backend named by the configuration.
///
/// Panics if the chosen backend's cargo feature is not enabled; backend
/// choice is a deployment decision, not a recoverable condition.
pub fn backend_solver(config: &SolverConfig) -> Box<dyn Solve> {
    match config.backend {
        #[cfg(feature = "rsparse")]
        Backend::RSparse => Box::new(RSparseSolver::default()),
        #[cfg(feature = "faer")]
        Backend::Faer => Box::new(FaerSolver::default()),
        #[allow(unreachable_patterns)]
        other => panic!("solver backend {other:?} is not compiled in"),
    }
}
