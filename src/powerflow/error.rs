use thiserror::Error;

/// Fatal configuration problems detected while assembling or merging the
/// system. These abort the solve; numerical non-convergence and singular
/// systems are reported through `Outcome` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Two entries landed on the same matrix position. Usually a pair of
    /// parallel lines between the same buses with overlapping phases;
    /// those must be merged into one equivalent branch by the caller.
    #[error("duplicate admittance entry at ({row}, {col}); look for parallel lines with overlapping phases")]
    DuplicateEntry { row: usize, col: usize },

    /// A branch carries a phase that is missing from one of its endpoint
    /// buses.
    #[error("branch {branch} has phases not present on both endpoint buses")]
    PhaseMismatch { branch: usize },

    /// A center-tapped transformer secondary whose primary-side phase
    /// does not line up with the primary bus.
    #[error("center-tapped transformer on branch {branch} has an invalid phase matching")]
    InvalidSecondaryPhase { branch: usize },

    /// Connection shapes the solver does not model, such as a triplex
    /// bus feeding a three-phase bus, or a triplex line joining the
    /// secondaries of two different center-tapped transformers.
    #[error("unsupported connection topology on branch {branch}")]
    UnsupportedTopology { branch: usize },

    /// PV generator buses are not supported by the current-injection
    /// formulation.
    #[error("bus {bus} is a PV bus, which this solver does not support")]
    UnsupportedBusType { bus: usize },

    /// A branch endpoint index outside the bus arena.
    #[error("branch {branch} references bus {bus}, which does not exist")]
    DanglingBranch { branch: usize, bus: usize },

    /// The backend failed to set up working storage for the system.
    #[error("linear solver setup failed: {0}")]
    SolverSetup(#[from] SolverError),
}

/// Failures reported by a sparse-LU backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SolverError {
    #[error("matrix is singular or nearly singular")]
    Singular,
    #[error("solver backend error: {0}")]
    Backend(&'static str),
}
