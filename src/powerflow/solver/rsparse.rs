use rsparse::{
    self,
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use super::Solve;
use crate::powerflow::error::SolverError;

/// In-process sparse LU backend. The symbolic ordering is computed once
/// per sparsity pattern and reused across iterations; the numeric
/// factorization is transient.
#[derive(Default)]
pub struct RSparseSolver {
    x: Option<Vec<f64>>,
    symbolic: Option<Symb>,
}

impl Solve for RSparseSolver {
    fn allocate(&mut self, dim: usize, _nnz: usize, rebuild: bool) -> Result<(), SolverError> {
        if rebuild {
            self.symbolic = None;
            self.x = None;
        }
        match self.x.as_mut() {
            Some(x) if x.len() == dim => {}
            _ => self.x = Some(vec![0.0; dim]),
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
        let p: Vec<isize> = col_ptr.iter().map(|&v| v as isize).collect();
        let a = data::Sprs {
            m: n,
            n,
            i: row_ind.to_vec(),
            p,
            x: values.to_vec(),
            nzmax: values.len(),
        };
        if self.symbolic.is_none() {
            self.symbolic = Some(sqr(&a, 1, false));
        }
        if self.x.as_ref().map(|x| x.len()) != Some(n) {
            self.x = Some(vec![0.0; n]);
        }
        let mut x = self.x.as_mut().unwrap();
        let mut s = self.symbolic.as_mut().unwrap();
        let numeric = lu(&a, &mut s, 1e-6).map_err(|_| SolverError::Singular)?;
        ipvec(&numeric.pinv, rhs, &mut x[..]); // x = P*b
        lsolve(&numeric.l, &mut x); // x = L\x
        usolve(&numeric.u, &mut x); // x = U\x
        ipvec(&s.q, x, &mut rhs[..]); // b = Q*x

        Ok(())
    }

    fn release(&mut self, will_iterate: bool) {
        // The numeric factors drop with the iteration scope; only the
        // cached ordering outlives a solve while iterating.
        if !will_iterate {
            self.symbolic = None;
        }
    }
}

fn ipvec_identity<T: Numeric<T>>(b: &[T], x: &mut [T]) {
    x.copy_from_slice(b);
}

fn ipvec_perm<T: Numeric<T>>(p: &[isize], b: &[T], x: &mut [T]) {
    for k in 0..b.len() {
        x[p[k] as usize] = b[k];
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => ipvec_perm(pvec, b, x),
        None => ipvec_identity(b, x),
    }
}
