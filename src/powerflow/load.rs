use std::f64::consts::{FRAC_PI_2, FRAC_PI_6, PI};

use num_complex::Complex64;
use num_traits::Zero;

use super::model::{Bus, BusType, SolveMode};
use super::phases::PhaseSet;
use super::scratch::SolverScratch;
use super::sparse::Entry;

/// Pinning admittance for a SWING bus held at its specified voltage.
pub(crate) const SWING_PIN: f64 = 1e10;

/// Jacobian offset used instead of dividing by a collapsed voltage.
const SINGULARITY_GUARD: f64 = 1e-4;

/// Nominal phase angles of a balanced wye system (A, B, C).
const WYE_ANGLES: [f64; 3] = [0.0, -2.0 * PI / 3.0, 2.0 * PI / 3.0];
/// Nominal line-to-line angles (AB, BC, CA).
const DELTA_ANGLES: [f64; 3] = [FRAC_PI_6, -FRAC_PI_2, FRAC_PI_6 + 2.0 * PI / 3.0];

/// Convert every bus's ZIP spec at the present voltage estimate into
/// accumulated per-slot load (`load_p`/`load_q`) and the Jacobian
/// coefficients `jacob_a..d`. Runs once per Newton iteration.
pub(crate) fn update_loads(buses: &mut [Bus], mode: SolveMode) {
    for bus in buses.iter_mut() {
        let dynamic = mode != SolveMode::Normal && bus.dynamics_enabled;
        if bus.phases.is_delta() && !bus.phases.is_split() {
            update_delta(bus, dynamic);
        } else if bus.phases.is_split() {
            update_split(bus);
        } else {
            update_wye(bus, dynamic);
        }
    }
}

/// Preserve a constant current's magnitude while letting its angle track
/// the voltage's deviation from the nominal reference angle. Used for
/// dynamics-attached sources, which hold current magnitude under
/// voltage-angle perturbation.
fn rotated(current: Complex64, reference: Complex64, nominal_angle: f64) -> Complex64 {
    if current.is_zero() || reference.is_zero() {
        return current;
    }
    current * Complex64::from_polar(1.0, reference.arg() - nominal_angle)
}

/// Line-to-line voltages for the three delta pairs, zero where a pair is
/// incomplete.
fn delta_voltages(bus: &Bus) -> [Complex64; 3] {
    let mut vdel = [Complex64::default(); 3];
    if bus.phases.contains(PhaseSet::A | PhaseSet::B) {
        vdel[0] = bus.volts[0] - bus.volts[1];
    }
    if bus.phases.contains(PhaseSet::B | PhaseSet::C) {
        vdel[1] = bus.volts[1] - bus.volts[2];
    }
    if bus.phases.contains(PhaseSet::C | PhaseSet::A) {
        vdel[2] = bus.volts[2] - bus.volts[0];
    }
    vdel
}

/// Power and impedance terms of one delta pair as an equivalent pair
/// current.
fn delta_pair_current(power: Complex64, shunt: Complex64, vdel: Complex64) -> Complex64 {
    let mut current = if vdel.is_zero() {
        Complex64::default()
    } else {
        (power / vdel).conj()
    };
    current += vdel * shunt;
    current
}

fn update_delta(bus: &mut Bus, dynamic: bool) {
    let vdel = delta_voltages(bus);
    let mut pair = [Complex64::default(); 3];
    for i in 0..3 {
        if !vdel[i].is_zero() {
            pair[i] = delta_pair_current(bus.power[i], bus.shunt[i], vdel[i]);
        }
    }
    let mut cur = [Complex64::default(); 3];
    for i in 0..3 {
        cur[i] = if dynamic {
            rotated(bus.current[i], vdel[i], DELTA_ANGLES[i])
        } else {
            bus.current[i]
        };
    }

    // Un-delta the pair currents into phase currents by subtraction,
    // folding in any wye-connected child load on the way.
    let mut und = [Complex64::default(); 3];
    for phase in 0..3 {
        if !bus.phases.contains(PhaseSet::bit_of_phase(phase)) {
            continue;
        }
        let leading = phase; // pair leaving this phase (A->AB, B->BC, C->CA)
        let trailing = (phase + 2) % 3; // pair arriving (A<-CA, ...)
        und[phase] = (cur[leading] + pair[leading]) - (cur[trailing] + pair[trailing]);

        if let Some(mx) = bus.mixed_load.as_ref() {
            let v = bus.volts[phase];
            if !v.is_zero() {
                und[phase] += (mx.power[phase] / v).conj();
            }
            und[phase] += mx.shunt[phase] * v;
            und[phase] += mx.current[phase];
        }
    }

    let slots: Vec<_> = bus.phases.slots().collect();
    for &(slot, phase) in &slots {
        let v = bus.volts[phase];
        let u = und[phase];
        bus.load_p[slot] = u.re * v.re + u.im * v.im;
        bus.load_q[slot] = u.re * v.im - u.im * v.re;
        current_jacobian(bus, slot, v, u, Complex64::default());
    }
}

fn update_split(bus: &mut Bus) {
    let v1 = bus.volts[0];
    let v2 = bus.volts[1];
    // V2 carries the sign convention that makes V12 a sum.
    let v12 = v1 + v2;

    let mut t = [bus.current[0], bus.current[1], bus.current12];
    for (k, v) in [v1, v2, v12].into_iter().enumerate() {
        if !v.is_zero() {
            t[k] += (bus.power[k] / v).conj();
        }
        t[k] += bus.shunt[k] * v;
    }

    if let Some(house) = bus.house_current {
        // The house model pre-conjugates everything except the voltage
        // phase, so only the unit phasor's conjugate divides here.
        for (k, v) in [v1, v2, v12].into_iter().enumerate() {
            let unit = Complex64::from_polar(1.0, v.arg());
            t[k] += house[k] / unit.conj();
        }
    }

    // Physical line currents.
    let l1 = t[0] + t[2];
    let l2 = -t[1] - t[2];
    bus.load_p[0] = l1.re;
    bus.load_q[0] = l1.im;
    bus.load_p[1] = l2.re;
    bus.load_q[1] = l2.im;
    bus.load_p[2] = 0.0;
    bus.load_q[2] = 0.0;

    // Jacobian works on the negated line currents.
    for (slot, line) in [-l1, -l2].into_iter().enumerate() {
        let v = bus.volts[slot];
        current_jacobian(bus, slot, v, line, Complex64::default());
    }
    bus.jacob_a[2] = 0.0;
    bus.jacob_b[2] = 0.0;
    bus.jacob_c[2] = 0.0;
    bus.jacob_d[2] = 0.0;
}

fn update_wye(bus: &mut Bus, dynamic: bool) {
    // A delta-connected child load converts to phase currents first.
    let mut und = [Complex64::default(); 3];
    if let Some(mx) = bus.mixed_load {
        let vdel = delta_voltages(bus);
        let mut pair = [Complex64::default(); 3];
        for i in 0..3 {
            if !vdel[i].is_zero() {
                pair[i] = delta_pair_current(mx.power[i], mx.shunt[i], vdel[i]);
            }
        }
        und[0] = (mx.current[0] + pair[0]) - (mx.current[2] + pair[2]);
        und[1] = (mx.current[1] + pair[1]) - (mx.current[0] + pair[0]);
        und[2] = (mx.current[2] + pair[2]) - (mx.current[1] + pair[1]);
    }

    let slots: Vec<_> = bus.phases.slots().collect();
    for &(slot, phase) in &slots {
        let v = bus.volts[phase];
        let s = bus.power[phase];
        let y = bus.shunt[phase];
        let i = if dynamic {
            rotated(bus.current[phase], v, WYE_ANGLES[phase])
        } else {
            bus.current[phase]
        };
        let u = und[phase];
        let vm2 = v.re * v.re + v.im * v.im;

        bus.load_p[slot] = s.re
            + i.re * v.re
            + i.im * v.im
            + u.re * v.re
            + u.im * v.im
            + y.re * vm2;
        bus.load_q[slot] = s.im
            + i.re * v.im
            - i.im * v.re
            + u.re * v.im
            - u.im * v.re
            - y.im * vm2;

        let m = v.norm();
        if m != 0.0 {
            let m3 = m * m * m;
            let m4 = m3 * m;
            let (vr, vi) = (v.re, v.im);
            let diff = vr * vr - vi * vi;

            bus.jacob_a[slot] = (s.im * diff - 2.0 * vr * vi * s.re) / m4
                + (vr * vi * i.re + i.im * vi * vi) / m3
                + y.im
                + (vr * vi * u.re + u.im * vi * vi) / m3;
            bus.jacob_b[slot] = (s.re * diff + 2.0 * vr * vi * s.im) / m4
                - (vr * vi * i.im + i.re * vr * vr) / m3
                + y.re
                - (vr * vi * u.im + u.re * vr * vr) / m3;
            bus.jacob_c[slot] = (-s.re * diff - 2.0 * vr * vi * s.im) / m4
                + (vr * vi * i.im - i.re * vi * vi) / m3
                + y.re
                + (vr * vi * u.im - u.re * vi * vi) / m3;
            bus.jacob_d[slot] = (s.im * diff - 2.0 * vr * vi * s.re) / m4
                + (vr * vi * i.re - i.im * vr * vr) / m3
                - y.im
                + (vr * vi * u.re - u.im * vr * vr) / m3;
        } else {
            // Collapsed voltage: fall back to the impedance terms with a
            // small offset so the diagonal never vanishes.
            bus.jacob_a[slot] = y.im - SINGULARITY_GUARD;
            bus.jacob_b[slot] = y.re - SINGULARITY_GUARD;
            bus.jacob_c[slot] = y.re - SINGULARITY_GUARD;
            bus.jacob_d[slot] = -y.im - SINGULARITY_GUARD;
        }
    }
}

/// Jacobian coefficients for a purely current-expressed load (delta and
/// split-phase buses): the diagonal approximation of the current terms,
/// with an optional impedance part.
fn current_jacobian(bus: &mut Bus, slot: usize, v: Complex64, u: Complex64, y: Complex64) {
    let m = v.norm();
    if m != 0.0 {
        let m3 = m * m * m;
        let (vr, vi) = (v.re, v.im);
        bus.jacob_a[slot] = (vr * vi * u.re + u.im * vi * vi) / m3 + y.im;
        bus.jacob_b[slot] = -(vr * vi * u.im + u.re * vr * vr) / m3 + y.re;
        bus.jacob_c[slot] = (vr * vi * u.im - u.re * vi * vi) / m3 + y.re;
        bus.jacob_d[slot] = (vr * vi * u.re - u.im * vr * vr) / m3 - y.im;
    } else {
        bus.jacob_a[slot] = y.im - SINGULARITY_GUARD;
        bus.jacob_b[slot] = y.re - SINGULARITY_GUARD;
        bus.jacob_c[slot] = y.re - SINGULARITY_GUARD;
        bus.jacob_d[slot] = -y.im - SINGULARITY_GUARD;
    }
}

/// Rebuild the iteration-varying diagonal pool: SWING pinning blocks
/// while the reference is active, Jacobian-augmented block diagonals for
/// everything else.
pub(crate) fn build_variable_diagonal(
    buses: &[Bus],
    scratch: &mut SolverScratch,
    swing_is_swing: bool,
) {
    scratch.diag_update.clear();
    for (i, bus) in buses.iter().enumerate() {
        let block = &scratch.diag[i];
        let base = 2 * block.base;
        if bus.bus_type == BusType::Swing && swing_is_swing {
            for j in 0..block.size {
                let q = base + j;
                let p = base + j + block.size;
                scratch.diag_update.push(Entry::new(q, q, SWING_PIN));
                scratch.diag_update.push(Entry::new(q, p, SWING_PIN));
                scratch.diag_update.push(Entry::new(p, q, SWING_PIN));
                scratch.diag_update.push(Entry::new(p, p, -SWING_PIN));
            }
        } else {
            for j in 0..block.size {
                let q = base + j;
                let p = base + j + block.size;
                let yjj = block.y[(j, j)];
                scratch
                    .diag_update
                    .push(Entry::new(q, q, yjj.im + bus.jacob_a[j]));
                scratch
                    .diag_update
                    .push(Entry::new(q, p, yjj.re + bus.jacob_b[j]));
                scratch
                    .diag_update
                    .push(Entry::new(p, q, yjj.re + bus.jacob_c[j]));
                scratch
                    .diag_update
                    .push(Entry::new(p, p, -yjj.im + bus.jacob_d[j]));
            }
        }
    }
    scratch.note_update_size();
}
