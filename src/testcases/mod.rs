//! Small reference feeders used by the solver tests.

use nalgebra::Matrix3;
use num_complex::Complex64;
use std::f64::consts::PI;

use crate::prelude::*;

/// Line-to-neutral magnitude of the three-phase test feeders.
pub const NOMINAL_VOLTS: f64 = 2400.0;
/// Leg magnitude of the triplex secondary cases.
pub const TRIPLEX_VOLTS: f64 = 120.0;

/// Balanced A/B/C phasors at the given magnitude.
pub fn balanced_voltages(mag: f64) -> [Complex64; 3] {
    [
        Complex64::from_polar(mag, 0.0),
        Complex64::from_polar(mag, -2.0 * PI / 3.0),
        Complex64::from_polar(mag, 2.0 * PI / 3.0),
    ]
}

/// Rotate per-phase quantities one step along A -> B -> C -> A.
pub fn rotate_phase_arrays<T: Copy>(values: [T; 3]) -> [T; 3] {
    [values[2], values[0], values[1]]
}

fn diag3(y: Complex64) -> Matrix3<Complex64> {
    Matrix3::from_diagonal(&nalgebra::Vector3::new(y, y, y))
}

/// Uncoupled three-phase line section with per-phase admittance `y`.
pub fn three_phase_line(from: usize, to: usize, y: Complex64) -> Branch {
    let block = diag3(y);
    Branch {
        from,
        to,
        phases: PhaseSet::ABC,
        y_from: block,
        y_to: block,
        ys_from: block,
        ys_to: block,
        ..Default::default()
    }
}

/// Uncoupled triplex line with per-leg admittance `y`. The second row
/// is negated, matching the reversed polarity of the leg-2 voltage.
pub fn triplex_line(from: usize, to: usize, y: Complex64) -> Branch {
    let mut block = Matrix3::zeros();
    block[(0, 0)] = y;
    block[(1, 1)] = -y;
    Branch {
        from,
        to,
        phases: PhaseSet::SPLIT,
        y_from: block,
        y_to: block,
        ys_from: block,
        ys_to: block,
        ..Default::default()
    }
}

/// Center-tapped transformer from a single primary phase onto a
/// split-phase secondary. `winding_y` is the admittance of each
/// half-secondary winding referred to the low side; the primary winding
/// is treated as ideal with turns ratio `ratio`. The secondary self
/// block and the coupling columns carry the leg-2 sign flip.
pub fn center_tap_transformer(
    from: usize,
    to: usize,
    primary: PhaseSet,
    ratio: f64,
    winding_y: Complex64,
) -> Branch {
    let p = primary
        .phase_of_slot(0)
        .expect("primary side must carry one phase");
    let yw = winding_y;
    let mut ys_to = Matrix3::zeros();
    ys_to[(0, 0)] = -yw;
    ys_to[(1, 1)] = yw;
    let mut y_to = Matrix3::zeros();
    y_to[(0, p)] = -yw / ratio;
    y_to[(1, p)] = yw / ratio;
    let mut ys_from = Matrix3::zeros();
    ys_from[(p, p)] = 2.0 * yw / (ratio * ratio);
    let mut y_from = Matrix3::zeros();
    y_from[(p, 0)] = yw / ratio;
    y_from[(p, 1)] = yw / ratio;
    Branch {
        from,
        to,
        phases: PhaseSet::SPLIT | primary,
        y_from,
        y_to,
        ys_from,
        ys_to,
        v_ratio: ratio,
    }
}

fn three_phase_bus(bus_type: BusType) -> Bus {
    Bus {
        bus_type,
        phases: PhaseSet::ABC,
        volts: balanced_voltages(NOMINAL_VOLTS),
        max_volt_error: 1e-6,
        ..Default::default()
    }
}

/// SWING source, one line, one constant-impedance load bus. Returns the
/// per-phase line and load admittances so tests can evaluate the
/// voltage-divider closed form.
pub fn balanced_line_with_impedance_load() -> (Vec<Bus>, Vec<Branch>, Complex64, Complex64) {
    let line_y = Complex64::new(0.5, -1.5);
    let load_y = Complex64::new(0.016, -0.008);
    let mut load_bus = three_phase_bus(BusType::Pq);
    load_bus.shunt = [load_y; 3];
    let buses = vec![three_phase_bus(BusType::Swing), load_bus];
    let branches = vec![three_phase_line(0, 1, line_y)];
    (buses, branches, line_y, load_y)
}

/// Four-bus radial feeder with one load of each ZIP flavor.
pub fn radial_feeder() -> (Vec<Bus>, Vec<Branch>) {
    let mut power_bus = three_phase_bus(BusType::Pq);
    power_bus.power = [Complex64::new(120e3, 40e3); 3];
    let mut current_bus = three_phase_bus(BusType::Pq);
    current_bus.current = [Complex64::new(30.0, -10.0); 3];
    let mut impedance_bus = three_phase_bus(BusType::Pq);
    impedance_bus.shunt = [Complex64::new(0.016, -0.008); 3];

    let buses = vec![
        three_phase_bus(BusType::Swing),
        power_bus,
        current_bus,
        impedance_bus,
    ];
    let branches = vec![
        three_phase_line(0, 1, Complex64::new(4.0, -12.0)),
        three_phase_line(1, 2, Complex64::new(3.0, -9.0)),
        three_phase_line(2, 3, Complex64::new(2.0, -6.0)),
    ];
    (buses, branches)
}

/// SWING source feeding a balanced delta-connected constant-power load.
pub fn delta_load_system() -> (Vec<Bus>, Vec<Branch>) {
    let mut load_bus = three_phase_bus(BusType::Pq);
    load_bus.phases = PhaseSet::ABC | PhaseSet::DELTA;
    load_bus.power = [Complex64::new(90e3, 30e3); 3];
    let buses = vec![three_phase_bus(BusType::Swing), load_bus];
    let branches = vec![three_phase_line(0, 1, Complex64::new(4.0, -12.0))];
    (buses, branches)
}

/// SWING source with an attached generator admittance, feeding a wye
/// load carried by phase A only. Returns the line and generator
/// admittances for injection bookkeeping in the dynamic-mode tests.
pub fn unbalanced_line_load_system() -> (Vec<Bus>, Vec<Branch>, Complex64, Complex64) {
    let line_y = Complex64::new(4.0, -12.0);
    let gen_y = Complex64::new(0.05, -0.15);
    let mut source = three_phase_bus(BusType::Swing);
    source.dynamics_enabled = true;
    source.gen_admittance = Some(diag3(gen_y));
    let mut load_bus = three_phase_bus(BusType::Pq);
    load_bus.power[0] = Complex64::new(150e3, 50e3);
    let buses = vec![source, load_bus];
    let branches = vec![three_phase_line(0, 1, line_y)];
    (buses, branches, line_y, gen_y)
}

/// Split-phase source, triplex line, split-phase ZIP load. Returns the
/// per-leg line admittance.
pub fn triplex_secondary() -> (Vec<Bus>, Vec<Branch>, Complex64) {
    let leg_y = Complex64::new(20.0, -60.0);
    // Leg 2 carries the sign convention that makes V12 = V1 + V2.
    let volts = [
        Complex64::new(TRIPLEX_VOLTS, 0.0),
        Complex64::new(TRIPLEX_VOLTS, 0.0),
        Complex64::default(),
    ];
    let source = Bus {
        bus_type: BusType::Swing,
        phases: PhaseSet::SPLIT,
        volts,
        max_volt_error: 1e-6,
        ..Default::default()
    };
    let mut load = Bus {
        bus_type: BusType::Pq,
        phases: PhaseSet::SPLIT,
        volts,
        max_volt_error: 1e-6,
        ..Default::default()
    };
    load.power = [
        Complex64::new(1200.0, 400.0),
        Complex64::new(1200.0, 400.0),
        Complex64::new(7200.0, 2400.0),
    ];
    let buses = vec![source, load];
    let branches = vec![triplex_line(0, 1, leg_y)];
    (buses, branches, leg_y)
}

/// Three-phase SWING primary, center-tapped transformer hung off phase
/// A, one triplex line, split-phase ZIP load. Returns the winding and
/// line leg admittances and the turns ratio.
pub fn center_tap_secondary() -> (Vec<Bus>, Vec<Branch>, Complex64, Complex64, f64) {
    let primary_volts = 7200.0;
    let ratio = primary_volts / TRIPLEX_VOLTS;
    let winding_y = Complex64::new(33.0, -66.0);
    let line_y = Complex64::new(80.0, -40.0);

    let mut source = three_phase_bus(BusType::Swing);
    source.volts = balanced_voltages(primary_volts);

    let triplex_volts = [
        Complex64::new(TRIPLEX_VOLTS, 0.0),
        Complex64::new(TRIPLEX_VOLTS, 0.0),
        Complex64::default(),
    ];
    let secondary = Bus {
        bus_type: BusType::Pq,
        phases: PhaseSet::SPLIT | PhaseSet::SECONDARY_TO | PhaseSet::A,
        volts: triplex_volts,
        max_volt_error: 1e-6,
        ..Default::default()
    };
    let mut load = Bus {
        bus_type: BusType::Pq,
        phases: PhaseSet::SPLIT | PhaseSet::A,
        volts: triplex_volts,
        max_volt_error: 1e-6,
        ..Default::default()
    };
    load.power = [
        Complex64::new(1500.0, 500.0),
        Complex64::new(1500.0, 500.0),
        Complex64::new(3000.0, 1000.0),
    ];

    let buses = vec![source, secondary, load];
    let branches = vec![
        center_tap_transformer(0, 1, PhaseSet::A, ratio, winding_y),
        triplex_line(1, 2, line_y),
    ];
    (buses, branches, winding_y, line_y, ratio)
}

/// One PQ bus with no connectivity and no load: structurally singular.
pub fn isolated_bus_system() -> (Vec<Bus>, Vec<Branch>) {
    (vec![three_phase_bus(BusType::Pq)], Vec::new())
}
