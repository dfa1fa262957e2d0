use nalgebra::Matrix3;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::sparse::Entry;

/// Self-admittance block of one bus: the diagonal of the complex bus
/// admittance matrix, sized 1-3 (2 for split-phase), plus its starting
/// row/column in the assembled system.
#[derive(Debug, Clone)]
pub(crate) struct DiagBlock {
    pub y: Matrix3<Complex64>,
    pub size: usize,
    pub base: usize,
}

impl Default for DiagBlock {
    fn default() -> Self {
        Self {
            y: Matrix3::zeros(),
            size: 0,
            base: 0,
        }
    }
}

/// Reusable solver state. Owned by the caller, handed to every
/// `solve_nr` invocation, and grown (never shrunk) as the topology
/// demands. The caller signals topology edits through
/// [`SolverScratch::invalidate_topology`]; the admittance tables are
/// rebuilt only when the version it bumps differs from the one last
/// built against.
#[derive(Debug, Default)]
pub struct SolverScratch {
    topology_version: u64,
    built_version: Option<u64>,

    /// Per-bus diagonal admittance blocks.
    pub(crate) diag: Vec<DiagBlock>,
    /// Per-bus list of incident branch indices.
    pub(crate) links: Vec<Vec<usize>>,

    /// Fixed off-diagonal entries, from branches.
    pub(crate) offdiag: Vec<Entry>,
    /// Fixed diagonal entries, from the off-diagonal elements of each
    /// bus's self-admittance block.
    pub(crate) diag_fixed: Vec<Entry>,
    /// Iteration-varying diagonal entries (Jacobian and SWING pinning).
    pub(crate) diag_update: Vec<Entry>,
    /// Merge/sort destination for the three pools.
    pub(crate) merged: Vec<Entry>,

    /// Compressed-column system handed to the linear solver.
    pub(crate) col_ptr: Vec<usize>,
    pub(crate) row_ind: Vec<usize>,
    pub(crate) values: Vec<f64>,
    /// Current mismatch vector; overwritten with the solution.
    pub(crate) rhs: Vec<f64>,

    /// Number of scalar per-phase unknowns (half the system dimension).
    pub(crate) total_vars: usize,

    max_offdiag: usize,
    max_diag_fixed: usize,
    max_diag_update: usize,
    max_total_vars: usize,
    prev_dim: usize,
    realloc_needed: bool,

    mismatch_trace: Vec<f64>,
}

impl SolverScratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tell the solver the bus/branch arrays changed shape or admittance
    /// values. The next solve rebuilds every topology-derived table.
    pub fn invalidate_topology(&mut self) {
        self.topology_version += 1;
    }

    /// Maximum voltage-delta magnitude recorded per iteration of the
    /// most recent solve.
    pub fn mismatch_trace(&self) -> &[f64] {
        &self.mismatch_trace
    }

    /// The assembled system of the last iteration as a sparse matrix,
    /// for diagnostics. `None` before the first solve.
    pub fn system_matrix(&self) -> Option<CscMatrix<f64>> {
        if self.col_ptr.len() < 2 {
            return None;
        }
        let dim = self.col_ptr.len() - 1;
        CscMatrix::try_from_csc_data(
            dim,
            dim,
            self.col_ptr.clone(),
            self.row_ind.clone(),
            self.values.clone(),
        )
        .ok()
    }

    pub(crate) fn admittance_stale(&self) -> bool {
        self.built_version != Some(self.topology_version)
    }

    pub(crate) fn mark_built(&mut self) {
        self.built_version = Some(self.topology_version);
    }

    pub(crate) fn clear_trace(&mut self) {
        self.mismatch_trace.clear();
    }

    pub(crate) fn push_trace(&mut self, max_mismatch: f64) {
        self.mismatch_trace.push(max_mismatch);
    }

    /// Track growth of the fixed pools and the unknown count; any growth
    /// forces backend working-storage rebuilds.
    pub(crate) fn note_fixed_sizes(&mut self) {
        if self.total_vars > self.max_total_vars {
            self.max_total_vars = self.total_vars;
            self.realloc_needed = true;
        }
        if self.offdiag.len() > self.max_offdiag {
            self.max_offdiag = self.offdiag.len();
            self.realloc_needed = true;
        }
        if self.diag_fixed.len() > self.max_diag_fixed {
            self.max_diag_fixed = self.diag_fixed.len();
            self.realloc_needed = true;
        }
    }

    pub(crate) fn note_update_size(&mut self) {
        if self.diag_update.len() > self.max_diag_update {
            self.max_diag_update = self.diag_update.len();
            self.realloc_needed = true;
        }
    }

    /// Whether the backend must rebuild for `dim`, consuming the flag.
    pub(crate) fn take_rebuild(&mut self, dim: usize) -> bool {
        let rebuild = self.realloc_needed || dim != self.prev_dim;
        self.realloc_needed = false;
        self.prev_dim = dim;
        rebuild
    }
}
