use log::{debug, warn};
use num_complex::Complex64;

use super::admittance;
use super::error::ConfigError;
use super::load;
use super::mismatch;
use super::model::{Branch, Bus, BusType, Outcome, SolveMode, SolverConfig};
use super::phases::PhaseSet;
use super::scratch::SolverScratch;
use super::solver::Solve;
use super::sparse;

/// Run a bounded Newton-Raphson power flow over the caller's bus/branch
/// arena.
///
/// Mutates `bus.volts`, the computed loads and the Jacobian coefficients
/// in place; branches are read-only. `scratch` persists and grows across
/// calls; the caller must invalidate it after topology or admittance
/// edits and must not edit topology between that signal and the next
/// call. Configuration errors abort with `Err`; numerical outcomes
/// (converged, iteration limit, singular, empty) are reported through
/// [`Outcome`].
pub fn solve_nr<S: Solve + ?Sized>(
    buses: &mut [Bus],
    branches: &[Branch],
    scratch: &mut SolverScratch,
    config: &SolverConfig,
    mode: SolveMode,
    solver: &mut S,
) -> Result<Outcome, ConfigError> {
    if let Some(i) = buses.iter().position(|b| b.bus_type == BusType::Pv) {
        return Err(ConfigError::UnsupportedBusType { bus: i });
    }

    if scratch.admittance_stale() {
        admittance::assemble(buses, branches, scratch)?;
    }
    scratch.clear_trace();

    // Whether the SWING bus still acts as the voltage reference.
    let mut swing_is_swing = mode != SolveMode::DynamicRun;
    let swing_is_three_phase = buses
        .iter()
        .find(|b| b.bus_type == BusType::Swing)
        .map(|b| b.phases.abc() == PhaseSet::ABC)
        .unwrap_or(false);

    let mut max_mismatch = 0.0f64;

    for pass in 1..=config.iteration_limit {
        load::update_loads(buses, mode);
        let swing_injection = mismatch::build_rhs(buses, branches, scratch, mode, swing_is_swing);
        load::build_variable_diagonal(buses, scratch, swing_is_swing);

        let entry_count =
            scratch.offdiag.len() + scratch.diag_fixed.len() + scratch.diag_update.len();
        if entry_count == 0 {
            warn!("empty powerflow connectivity matrix, the system has nothing to solve");
            return Ok(Outcome::Empty);
        }

        let nnz = sparse::merge_and_sort(scratch)?;
        let dim = 2 * scratch.total_vars;
        sparse::compress(scratch, dim);

        let rebuild = scratch.take_rebuild(dim);
        solver.allocate(dim, nnz, rebuild)?;

        let solved = {
            let SolverScratch {
                col_ptr,
                row_ind,
                values,
                rhs,
                ..
            } = scratch;
            solver.factor_and_solve(col_ptr, row_ind, values, rhs)
        };
        if let Err(err) = solved {
            solver.release(false);
            debug!("linear solve failed on pass {pass}: {err}");
            return Ok(Outcome::Singular);
        }
        if !scratch.rhs.iter().all(|v| v.is_finite()) {
            // Some backends factor a numerically singular system without
            // reporting it; a non-finite delta is the same failure.
            solver.release(false);
            return Ok(Outcome::Singular);
        }

        let (pass_max, needs_another) = apply_solution(buses, scratch, swing_is_swing);
        max_mismatch = pass_max;
        scratch.push_trace(pass_max);

        if !needs_another {
            if mode == SolveMode::DynamicInit && swing_is_swing && swing_is_three_phase {
                let symmetric = swing_injection
                    .map(|inj| {
                        mismatch::currents_symmetric(&inj, config.swing_symmetry_tolerance)
                    })
                    .unwrap_or(true);
                if !symmetric {
                    // The reference cannot source a balanced current;
                    // from here on it behaves as a generator-backed PQ
                    // bus, for this call only.
                    warn!("swing bus current is asymmetric, demoting to generator bus");
                    swing_is_swing = false;
                    solver.release(true);
                    continue;
                }
            }
            solver.release(false);
            debug!("power flow converged after {pass} iterations");
            return Ok(Outcome::Converged { iterations: pass });
        }
        solver.release(true);
    }

    solver.release(false);
    debug!(
        "iteration limit ({}) reached, max mismatch {max_mismatch}",
        config.iteration_limit
    );
    Ok(Outcome::IterationLimit {
        iterations: config.iteration_limit,
        max_mismatch,
    })
}

/// Add the solved voltage deltas onto every non-pinned bus, tracking the
/// largest delta magnitude and whether any bus still exceeds its own
/// threshold. The solution vector sits in `scratch.rhs`, real parts in
/// the first half of each block.
fn apply_solution(
    buses: &mut [Bus],
    scratch: &SolverScratch,
    swing_is_swing: bool,
) -> (f64, bool) {
    let mut max_delta = 0.0f64;
    let mut needs_another = false;

    for (i, bus) in buses.iter_mut().enumerate() {
        if bus.bus_type == BusType::Swing && swing_is_swing {
            continue;
        }
        let block = &scratch.diag[i];
        let base = 2 * block.base;

        if bus.phases.is_split() {
            for leg in 0..2 {
                let dv = Complex64::new(scratch.rhs[base + leg], scratch.rhs[base + 2 + leg]);
                bus.volts[leg] += dv;
                let mag = dv.norm();
                max_delta = max_delta.max(mag);
                if mag > bus.max_volt_error {
                    needs_another = true;
                }
            }
        } else {
            for (slot, phase) in bus.phases.slots() {
                let dv = Complex64::new(
                    scratch.rhs[base + slot],
                    scratch.rhs[base + block.size + slot],
                );
                bus.volts[phase] += dv;
                let mag = dv.norm();
                max_delta = max_delta.max(mag);
                if mag > bus.max_volt_error {
                    needs_another = true;
                }
            }
        }
    }
    (max_delta, needs_another)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powerflow::solver::DefaultSolver;
    use crate::testcases::*;

    fn run(
        buses: &mut Vec<Bus>,
        branches: &[Branch],
        scratch: &mut SolverScratch,
        mode: SolveMode,
    ) -> Outcome {
        let config = SolverConfig::default();
        let mut solver = DefaultSolver::default();
        solve_nr(buses, branches, scratch, &config, mode, &mut solver).unwrap()
    }

    #[test]
    fn impedance_load_matches_closed_form_in_two_passes() {
        let (mut buses, branches, line_y, load_y) = balanced_line_with_impedance_load();
        let mut scratch = SolverScratch::new();
        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::Normal);

        match outcome {
            Outcome::Converged { iterations } => assert!(iterations <= 2, "took {iterations}"),
            other => panic!("did not converge: {other:?}"),
        }
        // Voltage divider per phase: V_load = V_src * y / (y + y_load).
        let ratio = line_y / (line_y + load_y);
        for p in 0..3 {
            let expected = buses[0].volts[p] * ratio;
            let err = (buses[1].volts[p] - expected).norm();
            assert!(err < 1e-6 * NOMINAL_VOLTS, "phase {p} off by {err}");
        }
    }

    #[test]
    fn converged_start_is_idempotent() {
        let (mut buses, branches, ..) = balanced_line_with_impedance_load();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        let before = buses[1].volts;
        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::Normal);
        assert_eq!(outcome, Outcome::Converged { iterations: 1 });
        for p in 0..3 {
            assert!((buses[1].volts[p] - before[p]).norm() <= buses[1].max_volt_error);
        }
    }

    #[test]
    fn swing_voltage_is_bit_for_bit_unchanged() {
        let (mut buses, branches) = radial_feeder();
        let reference: Vec<u64> = buses[0]
            .volts
            .iter()
            .flat_map(|v| [v.re.to_bits(), v.im.to_bits()])
            .collect();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());
        let after: Vec<u64> = buses[0]
            .volts
            .iter()
            .flat_map(|v| [v.re.to_bits(), v.im.to_bits()])
            .collect();
        assert_eq!(reference, after);
    }

    #[test]
    fn radial_feeder_mismatch_is_monotonic() {
        let (mut buses, branches) = radial_feeder();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        let trace = scratch.mismatch_trace();
        assert!(trace.len() >= 2);
        for pair in trace[1..].windows(2) {
            assert!(
                pair[1] <= pair[0] * (1.0 + 1e-12),
                "mismatch grew: {pair:?}"
            );
        }
    }

    #[test]
    fn phase_relabeling_rotates_the_solution() {
        let (mut buses, branches) = delta_load_system();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        // Relabel A->B->C->A on source and load.
        let (mut rotated, rot_branches) = delta_load_system();
        for bus in rotated.iter_mut() {
            bus.volts = rotate_phase_arrays(bus.volts);
            bus.power = rotate_phase_arrays(bus.power);
            bus.shunt = rotate_phase_arrays(bus.shunt);
            bus.current = rotate_phase_arrays(bus.current);
        }
        let mut scratch2 = SolverScratch::new();
        assert!(run(&mut rotated, &rot_branches, &mut scratch2, SolveMode::Normal).converged());

        for p in 0..3 {
            let original = buses[1].volts[p];
            let relabeled = rotated[1].volts[(p + 1) % 3];
            assert!(
                (original - relabeled).norm() < 1e-6,
                "phase {p}: {original} vs {relabeled}"
            );
            // Same magnitudes across phases, 120 degrees apart.
            let next = buses[1].volts[(p + 1) % 3];
            assert!((original.norm() - next.norm()).abs() < 1e-6);
        }
    }

    #[test]
    fn overlapping_parallel_lines_are_fatal() {
        let (mut buses, mut branches, ..) = balanced_line_with_impedance_load();
        branches.push(branches[0].clone());
        let mut scratch = SolverScratch::new();
        let config = SolverConfig::default();
        let mut solver = DefaultSolver::default();
        let err = solve_nr(
            &mut buses,
            &branches,
            &mut scratch,
            &config,
            SolveMode::Normal,
            &mut solver,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEntry { .. }));
    }

    #[test]
    fn isolated_bus_reports_singular_not_nan() {
        let (mut buses, branches) = isolated_bus_system();
        let mut scratch = SolverScratch::new();
        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::Normal);
        assert_eq!(outcome, Outcome::Singular);
        assert!(outcome.bad_computations());
        assert_eq!(outcome.iteration_count(), 0);
        for v in buses[0].volts {
            assert!(v.re.is_finite() && v.im.is_finite());
        }
    }

    #[test]
    fn empty_system_is_not_an_error() {
        let mut buses: Vec<Bus> = Vec::new();
        let branches: Vec<Branch> = Vec::new();
        let mut scratch = SolverScratch::new();
        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::Normal);
        assert_eq!(outcome, Outcome::Empty);
        assert!(!outcome.bad_computations());
    }

    #[test]
    fn pv_bus_is_rejected() {
        let (mut buses, branches, ..) = balanced_line_with_impedance_load();
        buses[1].bus_type = BusType::Pv;
        let mut scratch = SolverScratch::new();
        let config = SolverConfig::default();
        let mut solver = DefaultSolver::default();
        let err = solve_nr(
            &mut buses,
            &branches,
            &mut scratch,
            &config,
            SolveMode::Normal,
            &mut solver,
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::UnsupportedBusType { bus: 1 });
    }

    #[test]
    fn triplex_secondary_balances_line_and_load_currents() {
        let (mut buses, branches, leg_y) = triplex_secondary();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        // Refresh the load's line currents at the solved voltages, then
        // check the triplex line delivers exactly them.
        crate::powerflow::load::update_loads(&mut buses, SolveMode::Normal);
        let line_current = leg_y * (buses[0].volts[0] - buses[1].volts[0]);
        let drawn = Complex64::new(buses[1].load_p[0], buses[1].load_q[0]);
        assert!(
            (line_current - drawn).norm() < 1e-6 * drawn.norm().max(1.0),
            "line {line_current} vs load {drawn}"
        );
    }

    #[test]
    fn center_tapped_secondary_feeds_triplex_load() {
        let (mut buses, branches, winding_y, line_y, ratio) = center_tap_secondary();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        // Nominal low-side EMF, fixed by the pinned primary.
        let e = buses[0].volts[0] / ratio;
        let vs = [buses[1].volts[0], buses[1].volts[1]];
        let vl = [buses[2].volts[0], buses[2].volts[1]];

        // Voltage sags at every hop on leg 1, but stays near nominal.
        assert!(vl[0].norm() < vs[0].norm() && vs[0].norm() < e.norm());
        assert!(vl[0].norm() > 118.0);

        // KCL at the unloaded secondary bus: each half-winding delivers
        // exactly what its triplex leg carries away.
        let wind1 = winding_y * (e - vs[0]);
        let line1 = line_y * (vs[0] - vl[0]);
        assert!((wind1 - line1).norm() < 1e-4 * line1.norm());
        let wind2 = winding_y * (vs[1] - e);
        let line2 = line_y * (vl[1] - vs[1]);
        assert!((wind2 - line2).norm() < 1e-4 * line2.norm());

        // The line delivers the load's computed leg-1 current.
        crate::powerflow::load::update_loads(&mut buses, SolveMode::Normal);
        let drawn = Complex64::new(buses[2].load_p[0], buses[2].load_q[0]);
        assert!((line1 - drawn).norm() < 1e-4 * drawn.norm());

        // Primary power covers the 6 kW of load plus small series loss.
        let ip = (wind1 - wind2) / ratio;
        let sp = buses[0].volts[0] * ip.conj();
        assert!(sp.re > 6000.0 && sp.re < 6300.0, "primary power {}", sp.re);
    }

    #[test]
    fn balanced_dynamic_init_keeps_the_swing() {
        let (mut buses, branches, ..) = balanced_line_with_impedance_load();
        let reference = buses[0].volts;
        let mut scratch = SolverScratch::new();
        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::DynamicInit);
        assert!(outcome.converged());
        for p in 0..3 {
            assert_eq!(buses[0].volts[p], reference[p]);
        }
    }

    #[test]
    fn unbalanced_dynamic_init_demotes_the_swing() {
        // Solve the unbalanced feeder normally and measure what the
        // swing injects, then hand that current to the dynamic solve.
        let (mut buses, branches, line_y, gen_y) = unbalanced_line_load_system();
        let mut scratch = SolverScratch::new();
        let normal = run(&mut buses, &branches, &mut scratch, SolveMode::Normal);
        let normal_iters = match normal {
            Outcome::Converged { iterations } => iterations,
            other => panic!("normal solve failed: {other:?}"),
        };
        for p in 0..3 {
            buses[0].dyn_current[p] = gen_y * buses[0].volts[p]
                + line_y * (buses[0].volts[p] - buses[1].volts[p]);
        }

        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::DynamicInit);
        match outcome {
            Outcome::Converged { iterations } => {
                // At least one extra pass runs after the demotion.
                assert!(iterations > normal_iters || iterations >= 2);
            }
            other => panic!("dynamic init failed: {other:?}"),
        }
        // The demoted swing still sits near its nominal voltage because
        // the imposed injection reproduces the reference solution.
        for p in 0..3 {
            let drift = (buses[0].volts[p].norm() - NOMINAL_VOLTS).abs();
            assert!(drift < 0.05 * NOMINAL_VOLTS, "phase {p} drifted {drift}");
        }
    }

    #[test]
    fn dynamic_run_solves_with_demoted_swing() {
        let (mut buses, branches, line_y, gen_y) = unbalanced_line_load_system();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());
        let pinned_volts = buses[0].volts;
        for p in 0..3 {
            buses[0].dyn_current[p] = gen_y * buses[0].volts[p]
                + line_y * (buses[0].volts[p] - buses[1].volts[p]);
        }

        let outcome = run(&mut buses, &branches, &mut scratch, SolveMode::DynamicRun);
        assert!(outcome.converged());
        for p in 0..3 {
            // Same operating point, but reached as a solved bus.
            assert!((buses[0].volts[p] - pinned_volts[p]).norm() < 1.0);
        }
    }

    #[test]
    fn network_roundtrips_through_json() {
        let (buses, branches) = radial_feeder();
        let text = serde_json::to_string(&(&buses, &branches)).unwrap();
        let (mut parsed_buses, parsed_branches): (Vec<Bus>, Vec<Branch>) =
            serde_json::from_str(&text).unwrap();

        let mut scratch = SolverScratch::new();
        let outcome = run(
            &mut parsed_buses,
            &parsed_branches,
            &mut scratch,
            SolveMode::Normal,
        );
        assert!(outcome.converged());

        let (mut reference, ref_branches) = radial_feeder();
        let mut scratch2 = SolverScratch::new();
        assert!(run(&mut reference, &ref_branches, &mut scratch2, SolveMode::Normal).converged());
        for (a, b) in parsed_buses.iter().zip(reference.iter()) {
            for p in 0..3 {
                assert!((a.volts[p] - b.volts[p]).norm() < 1e-9);
            }
        }
    }

    #[test]
    fn scratch_reuse_survives_topology_growth() {
        let (mut buses, branches, ..) = balanced_line_with_impedance_load();
        let mut scratch = SolverScratch::new();
        assert!(run(&mut buses, &branches, &mut scratch, SolveMode::Normal).converged());

        // Grow the network and re-solve with the same scratch.
        let (mut bigger, big_branches) = radial_feeder();
        scratch.invalidate_topology();
        assert!(run(&mut bigger, &big_branches, &mut scratch, SolveMode::Normal).converged());
    }
}
