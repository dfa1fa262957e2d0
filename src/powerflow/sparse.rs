use super::error::ConfigError;
use super::scratch::SolverScratch;

/// One real-valued non-zero of the interleaved 2n x 2n system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Entry {
    pub row: usize,
    pub col: usize,
    pub value: f64,
}

impl Entry {
    #[inline]
    pub fn new(row: usize, col: usize, value: f64) -> Self {
        Entry { row, col, value }
    }
}

/// Merge the three coordinate pools into one column-major sorted list.
///
/// Sorting is stable (merge sort) by column then row. Two entries on the
/// same position are fatal: intentional summation is pre-accumulated
/// upstream, so a collision here means overlapping parallel branches.
pub(crate) fn merge_and_sort(scratch: &mut SolverScratch) -> Result<usize, ConfigError> {
    let SolverScratch {
        offdiag,
        diag_fixed,
        diag_update,
        merged,
        ..
    } = scratch;

    merged.clear();
    merged.reserve(offdiag.len() + diag_fixed.len() + diag_update.len());
    merged.extend_from_slice(offdiag);
    merged.extend_from_slice(diag_fixed);
    merged.extend_from_slice(diag_update);

    merged.sort_by(|a, b| (a.col, a.row).cmp(&(b.col, b.row)));

    for pair in merged.windows(2) {
        if pair[0].row == pair[1].row && pair[0].col == pair[1].col {
            return Err(ConfigError::DuplicateEntry {
                row: pair[0].row,
                col: pair[0].col,
            });
        }
    }
    Ok(merged.len())
}

/// Convert the merged coordinate list to compressed-column form inside
/// the scratch buffers. Columns with no entries get empty ranges.
pub(crate) fn compress(scratch: &mut SolverScratch, dim: usize) {
    let SolverScratch {
        merged,
        col_ptr,
        row_ind,
        values,
        ..
    } = scratch;

    col_ptr.clear();
    row_ind.clear();
    values.clear();
    col_ptr.reserve(dim + 1);
    row_ind.reserve(merged.len());
    values.reserve(merged.len());

    col_ptr.push(0);
    let mut current_col = 0usize;
    for (k, entry) in merged.iter().enumerate() {
        while current_col < entry.col {
            col_ptr.push(k);
            current_col += 1;
        }
        row_ind.push(entry.row);
        values.push(entry.value);
    }
    let nnz = merged.len();
    while current_col < dim {
        col_ptr.push(nnz);
        current_col += 1;
    }
}
