mod powerflow;
pub mod testcases;
pub mod prelude {
    use crate::powerflow;
    pub use powerflow::error::{ConfigError, SolverError};
    pub use powerflow::model::{
        Backend, Branch, Bus, BusType, MixedLoad, Outcome, SolveMode, SolverConfig,
    };
    pub use powerflow::phases::PhaseSet;
    pub use powerflow::scratch::SolverScratch;
    pub use powerflow::solve_nr;
    #[cfg(any(feature = "rsparse", feature = "faer"))]
    pub use powerflow::solver::DefaultSolver;
    pub use powerflow::solver::{backend_solver, Solve};
}
