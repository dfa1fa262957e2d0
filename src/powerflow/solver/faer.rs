use faer::{
    MatMut,
    linalg::solvers::Solve as FaerSolve,
    sparse::{
        SparseColMatRef, SymbolicSparseColMatRef,
        linalg::solvers::{Lu, SymbolicLu},
    },
};

use super::Solve;
use crate::powerflow::error::SolverError;

/// Swappable external LU backend.
#[derive(Default)]
pub struct FaerSolver {
    lu: Option<Lu<usize, f64>>,
    symbolic: Option<SymbolicLu<usize>>,
}

impl Solve for FaerSolver {
    fn allocate(&mut self, _dim: usize, _nnz: usize, rebuild: bool) -> Result<(), SolverError> {
        if rebuild {
            self.symbolic = None;
            self.lu = None;
        }
        Ok(())
    }

    fn factor_and_solve(
        &mut self,
        col_ptr: &[usize],
        row_ind: &[usize],
        values: &[f64],
        rhs: &mut [f64],
    ) -> Result<(), SolverError> {
        let n = col_ptr.len() - 1;
        let s = unsafe { SymbolicSparseColMatRef::new_unchecked(n, n, col_ptr, None, row_ind) };
        let mat = SparseColMatRef::new(s, values);
        if self.symbolic.is_none() {
            self.symbolic = Some(
                SymbolicLu::try_new(s)
                    .map_err(|_| SolverError::Backend("faer symbolic analysis failed"))?,
            );
        }
        self.lu = Some(
            Lu::try_new_with_symbolic(self.symbolic.as_ref().unwrap().clone(), mat)
                .map_err(|_| SolverError::Singular)?,
        );
        let mat_ref = MatMut::from_column_major_slice_mut(rhs, n, 1);
        self.lu.as_ref().unwrap().solve_in_place(mat_ref);
        Ok(())
    }

    fn release(&mut self, will_iterate: bool) {
        // Numeric factors are transient; the symbolic analysis survives
        // while the pattern does.
        self.lu = None;
        if !will_iterate {
            self.symbolic = None;
        }
    }
}
