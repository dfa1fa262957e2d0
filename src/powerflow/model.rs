use nalgebra::Matrix3;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use super::phases::PhaseSet;

/// Bus classification for the solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusType {
    /// Specified-power bus, solved for voltage.
    #[default]
    Pq,
    /// Specified power and voltage magnitude. Not supported by the
    /// current-injection formulation; rejected at assembly.
    Pv,
    /// Voltage reference, held at its specified value in normal solves.
    Swing,
}

/// Which flavor of power flow the caller wants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveMode {
    /// Standard static power flow with a fixed SWING bus.
    #[default]
    Normal,
    /// First pass of a dynamics run: the SWING current must prove
    /// three-phase symmetric before the bus may act as a plain generator.
    DynamicInit,
    /// Dynamics already running; the SWING bus behaves as a PQ bus with
    /// an imposed generator injection for the whole solve.
    DynamicRun,
}

/// Explicit secondary load spec for a child load connected differently
/// from its parent bus (delta load on a wye bus, or wye on delta).
/// Triples are indexed by phase pair (AB, BC, CA) or phase (A, B, C)
/// depending on which side is the "different" one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MixedLoad {
    /// Constant-power terms.
    pub power: [Complex64; 3],
    /// Constant-impedance terms, as admittances.
    pub shunt: [Complex64; 3],
    /// Constant-current terms.
    pub current: [Complex64; 3],
}

/// A network node. Voltages and the per-iteration load/Jacobian fields
/// are mutated in place by the solver; everything else is caller-owned
/// input, rebuilt only on topology changes.
///
/// Per-phase arrays are indexed by physical phase (0 = A, 1 = B, 2 = C).
/// Split-phase buses use slots 0 and 1 for the two hot legs, with the
/// line-to-line quantities in slot 2 where noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bus {
    pub bus_type: BusType,
    pub phases: PhaseSet,
    /// Present voltage estimate. Entries for absent phases must be zero.
    pub volts: [Complex64; 3],
    /// ZIP constant-power terms. Delta buses index these by phase pair
    /// (AB, BC, CA); split-phase buses use (leg 1, leg 2, line-to-line).
    pub power: [Complex64; 3],
    /// ZIP constant-impedance terms, as admittances. Same indexing as
    /// `power`.
    pub shunt: [Complex64; 3],
    /// ZIP constant-current terms. Same indexing as `power`.
    pub current: [Complex64; 3],
    /// Split-phase line-to-line current draw (triplex only).
    pub current12: Complex64,
    /// Child load connected differently from the bus, if any.
    pub mixed_load: Option<MixedLoad>,
    /// Nominal house-model current contributions (triplex only),
    /// pre-conjugated by the house model.
    pub house_current: Option<[Complex64; 3]>,
    /// Full admittance block of an attached generator or inverter
    /// source, folded into the bus diagonal when dynamics are enabled.
    pub gen_admittance: Option<Matrix3<Complex64>>,
    /// Imposed generator current injection, consumed in dynamic modes.
    pub dyn_current: [Complex64; 3],
    /// Whether an attached source participates in dynamic solves.
    pub dynamics_enabled: bool,
    /// Largest voltage-delta magnitude this bus tolerates before
    /// requesting another iteration, in volts.
    pub max_volt_error: f64,

    /// Computed real load per slot. Split-phase buses store the real
    /// part of the two line currents here instead.
    #[serde(default)]
    pub load_p: [f64; 3],
    /// Computed reactive load per slot (split-phase: imaginary line
    /// current parts).
    #[serde(default)]
    pub load_q: [f64; 3],
    /// Jacobian coefficients, per slot, refreshed every iteration.
    #[serde(default)]
    pub jacob_a: [f64; 3],
    #[serde(default)]
    pub jacob_b: [f64; 3],
    #[serde(default)]
    pub jacob_c: [f64; 3],
    #[serde(default)]
    pub jacob_d: [f64; 3],
    /// First row/column of this bus's block in the assembled system.
    #[serde(default)]
    pub matrix_loc: usize,
}

impl Default for Bus {
    fn default() -> Self {
        Self {
            bus_type: BusType::Pq,
            phases: PhaseSet::NONE,
            volts: Default::default(),
            power: Default::default(),
            shunt: Default::default(),
            current: Default::default(),
            current12: Complex64::default(),
            mixed_load: None,
            house_current: None,
            gen_admittance: None,
            dyn_current: Default::default(),
            dynamics_enabled: false,
            max_volt_error: 1e-4,
            load_p: [0.0; 3],
            load_q: [0.0; 3],
            jacob_a: [0.0; 3],
            jacob_b: [0.0; 3],
            jacob_c: [0.0; 3],
            jacob_d: [0.0; 3],
            matrix_loc: 0,
        }
    }
}

/// A line or transformer between two buses. Immutable during a solve;
/// the caller bumps the scratch topology version after editing any of
/// these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Index of the sending bus.
    pub from: usize,
    /// Index of the receiving bus.
    pub to: usize,
    pub phases: PhaseSet,
    /// Transfer admittance seen from the from side.
    pub y_from: Matrix3<Complex64>,
    /// Transfer admittance seen from the to side.
    pub y_to: Matrix3<Complex64>,
    /// Self admittance on the from side; includes charging/shunt terms,
    /// which is why it is kept separate from `y_from`.
    pub ys_from: Matrix3<Complex64>,
    /// Self admittance on the to side.
    pub ys_to: Matrix3<Complex64>,
    /// Transformer turns ratio (v_from / v_to); 1.0 for lines.
    pub v_ratio: f64,
}

impl Default for Branch {
    fn default() -> Self {
        Self {
            from: 0,
            to: 0,
            phases: PhaseSet::NONE,
            y_from: Matrix3::zeros(),
            y_to: Matrix3::zeros(),
            ys_from: Matrix3::zeros(),
            ys_to: Matrix3::zeros(),
            v_ratio: 1.0,
        }
    }
}

/// Linear-solver backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process pure-Rust sparse LU.
    #[default]
    RSparse,
    /// Swappable external LU implementation.
    Faer,
}

/// Solver tuning knobs. Serializable so runs can be reproduced from a
/// snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Newton-Raphson iteration cap.
    pub iteration_limit: usize,
    /// Relative tolerance of the SWING current symmetry test used by
    /// `SolveMode::DynamicInit`.
    pub swing_symmetry_tolerance: f64,
    pub backend: Backend,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iteration_limit: 50,
            swing_symmetry_tolerance: 1e-2,
            backend: Backend::default(),
        }
    }
}

/// How a solve ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    /// Converged; `iterations` counts linear solves performed (an
    /// already-converged system reports 1).
    Converged { iterations: usize },
    /// Hit the iteration cap while at least one bus still moved more
    /// than its threshold.
    IterationLimit { iterations: usize, max_mismatch: f64 },
    /// The backend reported a singular (or numerically unusable) system.
    Singular,
    /// Nothing to solve: no bus contributed a single matrix entry.
    Empty,
}

impl Outcome {
    pub fn converged(&self) -> bool {
        matches!(self, Outcome::Converged { .. })
    }

    /// The legacy failure flag: true only for a singular system.
    pub fn bad_computations(&self) -> bool {
        matches!(self, Outcome::Singular)
    }

    /// The legacy integer contract: positive iterations on success,
    /// negated iterations on hitting the limit, zero otherwise.
    pub fn iteration_count(&self) -> i64 {
        match self {
            Outcome::Converged { iterations } => *iterations as i64,
            Outcome::IterationLimit { iterations, .. } => -(*iterations as i64),
            Outcome::Singular | Outcome::Empty => 0,
        }
    }
}
