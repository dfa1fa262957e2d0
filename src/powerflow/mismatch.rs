use num_complex::Complex64;

use super::model::{Branch, Bus, BusType, SolveMode};
use super::phases::PhaseSet;
use super::scratch::SolverScratch;

/// Whether this bus contributes an imposed generator injection to the
/// mismatch: dynamics-attached sources in dynamic modes, and the SWING
/// bus once it stops acting as the reference.
fn generator_backed(bus: &Bus, mode: SolveMode) -> bool {
    mode != SolveMode::Normal && (bus.dynamics_enabled || bus.bus_type == BusType::Swing)
}

/// Compute the interleaved current-mismatch vector into `scratch.rhs`.
///
/// Rows of a pinned SWING bus stay exactly zero; the pinning blocks in
/// the variable diagonal hold its voltage in place. In `DynamicInit`,
/// while the SWING is still the reference, its per-phase injected
/// current (network flow plus load) is returned for the symmetry check.
pub(crate) fn build_rhs(
    buses: &[Bus],
    branches: &[Branch],
    scratch: &mut SolverScratch,
    mode: SolveMode,
    swing_is_swing: bool,
) -> Option<[Complex64; 3]> {
    let dim = 2 * scratch.total_vars;
    scratch.rhs.clear();
    scratch.rhs.resize(dim, 0.0);

    let mut swing_injection = None;

    for (i, bus) in buses.iter().enumerate() {
        let pinned = bus.bus_type == BusType::Swing && swing_is_swing;
        let want_injection = pinned && mode == SolveMode::DynamicInit && swing_injection.is_none();
        if pinned && !want_injection {
            continue;
        }

        if bus.phases.is_split() {
            split_rows(buses, branches, scratch, i, pinned);
        } else {
            let injection = phase_rows(buses, branches, scratch, i, mode, pinned);
            if want_injection {
                swing_injection = Some(injection);
            }
        }
    }
    swing_injection
}

/// Mismatch rows for a wye/delta bus. Returns the per-phase injected
/// current (only consumed for a pinned SWING in dynamic init).
fn phase_rows(
    buses: &[Bus],
    branches: &[Branch],
    scratch: &mut SolverScratch,
    i: usize,
    mode: SolveMode,
    pinned: bool,
) -> [Complex64; 3] {
    let bus = &buses[i];
    let block = &scratch.diag[i];
    let size = block.size;
    let base = 2 * block.base;
    let mut injection = [Complex64::default(); 3];

    for j in 0..size {
        let row_phase = match bus.phases.phase_of_slot(j) {
            Some(p) => p,
            None => continue,
        };
        let mut icalc = Complex64::default();

        for k in 0..size {
            let col_phase = match bus.phases.phase_of_slot(k) {
                Some(p) => p,
                None => continue,
            };
            icalc += block.y[(j, k)] * bus.volts[col_phase];

            for &bi in &scratch.links[i] {
                let branch = &branches[bi];
                if branch.from == i {
                    if branch.phases.is_split() {
                        // Center-tapped transformer primary: one row
                        // couples to both secondary legs, once.
                        if k == 0
                            && branch.phases.abc() == PhaseSet::bit_of_phase(row_phase)
                        {
                            let to = &buses[branch.to];
                            icalc += -branch.y_from[(row_phase, 0)] * to.volts[0];
                            icalc += -branch.y_from[(row_phase, 1)] * to.volts[1];
                        }
                    } else {
                        icalc +=
                            -branch.y_from[(row_phase, col_phase)] * buses[branch.to].volts[col_phase];
                    }
                }
                if branch.to == i && !branch.phases.is_split() {
                    icalc +=
                        -branch.y_to[(row_phase, col_phase)] * buses[branch.from].volts[col_phase];
                }
            }
        }

        let v = bus.volts[row_phase];
        let m2 = v.norm_sqr();

        if pinned {
            // Reference bus: record what it must inject, leave the rows
            // pinned at zero.
            let s_load = Complex64::new(bus.load_p[j], bus.load_q[j]);
            let i_load = if m2 != 0.0 {
                (s_load / v).conj()
            } else {
                Complex64::default()
            };
            injection[row_phase] = icalc + i_load;
            continue;
        }

        let temp_p = -bus.load_p[j];
        let temp_q = -bus.load_q[j];
        let inj = if generator_backed(bus, mode) {
            bus.dyn_current[row_phase]
        } else {
            Complex64::default()
        };

        if m2 != 0.0 {
            scratch.rhs[base + size + j] =
                (temp_p * v.re + temp_q * v.im) / m2 + inj.re - icalc.re;
            scratch.rhs[base + j] = (temp_p * v.im - temp_q * v.re) / m2 + inj.im - icalc.im;
        } else {
            scratch.rhs[base + size + j] = 0.0;
            scratch.rhs[base + j] = 0.0;
        }
    }
    injection
}

/// Mismatch rows for a split-phase bus. The stored load is already a
/// pair of line currents, so no power conversion happens here; the
/// secondary bus of a center-tapped transformer carries pre-negated
/// values.
fn split_rows(buses: &[Bus], branches: &[Branch], scratch: &mut SolverScratch, i: usize, pinned: bool) {
    if pinned {
        return;
    }
    let bus = &buses[i];
    let block = &scratch.diag[i];
    let base = 2 * block.base;
    let secondary = bus.phases.is_secondary_to();

    for j in 0..2 {
        let (temp_p, temp_q) = if secondary {
            (bus.load_p[j], bus.load_q[j])
        } else {
            (-bus.load_p[j], -bus.load_q[j])
        };

        let mut icalc =
            block.y[(j, 0)] * bus.volts[0] + block.y[(j, 1)] * bus.volts[1];

        for &bi in &scratch.links[i] {
            let branch = &branches[bi];
            if branch.from == i {
                // Triplex line leaving this bus; leaving a transformer
                // secondary flips the sign convention.
                let sign = if secondary { 1.0 } else { -1.0 };
                let to = &buses[branch.to];
                icalc += sign * branch.y_from[(j, 0)] * to.volts[0];
                icalc += sign * branch.y_from[(j, 1)] * to.volts[1];
            } else if branch.to == i {
                if branch.v_ratio != 1.0 {
                    // Transformer secondary: single primary-phase column.
                    if let Some(primary) = branch.phases.abc().phase_of_slot(0) {
                        icalc += -branch.y_to[(j, primary)] * buses[branch.from].volts[primary];
                    }
                } else {
                    let sign = if secondary { 1.0 } else { -1.0 };
                    let from = &buses[branch.from];
                    icalc += sign * branch.y_to[(j, 0)] * from.volts[0];
                    icalc += sign * branch.y_to[(j, 1)] * from.volts[1];
                }
            }
        }

        scratch.rhs[base + 2 + j] = temp_p - icalc.re;
        scratch.rhs[base + j] = temp_q - icalc.im;
    }
}

/// Sequence-decompose a three-phase current and test it for symmetry:
/// the zero- and negative-sequence content must stay below `tolerance`
/// relative to the positive-sequence component.
pub(crate) fn currents_symmetric(currents: &[Complex64; 3], tolerance: f64) -> bool {
    let a = Complex64::from_polar(1.0, 2.0 * std::f64::consts::PI / 3.0);
    let a2 = a * a;
    let [ia, ib, ic] = *currents;
    let i0 = (ia + ib + ic) / 3.0;
    let i1 = (ia + a * ib + a2 * ic) / 3.0;
    let i2 = (ia + a2 * ib + a * ic) / 3.0;

    let residual = i0.norm() + i2.norm();
    if i1.norm() < 1e-9 {
        residual < 1e-9
    } else {
        residual <= tolerance * i1.norm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powerflow::{admittance, load};
    use nalgebra::Matrix3;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn balanced(mag: f64) -> [Complex64; 3] {
        [
            Complex64::from_polar(mag, 0.0),
            Complex64::from_polar(mag, -2.0 * std::f64::consts::PI / 3.0),
            Complex64::from_polar(mag, 2.0 * std::f64::consts::PI / 3.0),
        ]
    }

    fn two_bus_system(load_y: Complex64) -> (Vec<Bus>, Vec<Branch>) {
        let y = c(5.0, -15.0);
        let mut block = Matrix3::zeros();
        for p in 0..3 {
            block[(p, p)] = y;
        }
        let buses = vec![
            Bus {
                bus_type: BusType::Swing,
                phases: PhaseSet::ABC,
                volts: balanced(2400.0),
                ..Default::default()
            },
            Bus {
                phases: PhaseSet::ABC,
                volts: balanced(2400.0),
                shunt: [load_y; 3],
                ..Default::default()
            },
        ];
        let branches = vec![Branch {
            from: 0,
            to: 1,
            phases: PhaseSet::ABC,
            y_from: block,
            y_to: block,
            ys_from: block,
            ys_to: block,
            ..Default::default()
        }];
        (buses, branches)
    }

    #[test]
    fn flat_start_mismatch_is_load_current() {
        let yl = c(0.08, -0.04);
        let (mut buses, branches) = two_bus_system(yl);
        let mut scratch = SolverScratch::new();
        admittance::assemble(&mut buses, &branches, &mut scratch).unwrap();
        load::update_loads(&mut buses, SolveMode::Normal);
        build_rhs(&buses, &branches, &mut scratch, SolveMode::Normal, true);

        // Equal voltages: no branch flow, mismatch equals -I_load.
        let v = buses[1].volts[0];
        let expected = -(yl * v);
        let base = 2 * buses[1].matrix_loc;
        assert!((scratch.rhs[base + 3] - expected.re).abs() < 1e-9);
        assert!((scratch.rhs[base] - expected.im).abs() < 1e-9);
    }

    #[test]
    fn pinned_swing_rows_are_zero() {
        let (mut buses, branches) = two_bus_system(c(0.1, -0.05));
        let mut scratch = SolverScratch::new();
        admittance::assemble(&mut buses, &branches, &mut scratch).unwrap();
        load::update_loads(&mut buses, SolveMode::Normal);
        build_rhs(&buses, &branches, &mut scratch, SolveMode::Normal, true);
        for r in 0..6 {
            assert_eq!(scratch.rhs[r], 0.0);
        }
    }

    #[test]
    fn symmetry_check_accepts_balanced_rejects_skewed() {
        let balanced_i = balanced(100.0);
        assert!(currents_symmetric(&balanced_i, 0.01));

        let mut skewed = balanced_i;
        skewed[1] *= 1.5;
        assert!(!currents_symmetric(&skewed, 0.01));

        let idle = [Complex64::default(); 3];
        assert!(currents_symmetric(&idle, 0.01));
    }
}
