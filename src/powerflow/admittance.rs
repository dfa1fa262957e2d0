use nalgebra::Matrix3;
use num_complex::Complex64;

use super::error::ConfigError;
use super::model::{Branch, Bus};
use super::phases::PhaseSet;
use super::scratch::{DiagBlock, SolverScratch};
use super::sparse::Entry;

/// Rebuild every topology-derived table: the per-bus link lists, the
/// diagonal admittance blocks, the bus matrix locations, and the two
/// fixed coordinate pools. Runs only when the caller invalidated the
/// topology.
pub(crate) fn assemble(
    buses: &mut [Bus],
    branches: &[Branch],
    scratch: &mut SolverScratch,
) -> Result<(), ConfigError> {
    for (bi, branch) in branches.iter().enumerate() {
        for end in [branch.from, branch.to] {
            if end >= buses.len() {
                return Err(ConfigError::DanglingBranch {
                    branch: bi,
                    bus: end,
                });
            }
        }
    }

    build_links(buses.len(), branches, scratch);
    build_diagonal(buses, branches, scratch);
    build_offdiagonal(buses, branches, scratch)?;
    build_fixed_diagonal(buses, scratch);

    scratch.note_fixed_sizes();
    scratch.mark_built();
    Ok(())
}

fn build_links(bus_count: usize, branches: &[Branch], scratch: &mut SolverScratch) {
    if scratch.links.len() < bus_count {
        scratch.links.resize_with(bus_count, Vec::new);
    }
    for list in scratch.links.iter_mut() {
        list.clear();
    }
    for (idx, branch) in branches.iter().enumerate() {
        scratch.links[branch.from].push(idx);
        if branch.to != branch.from {
            scratch.links[branch.to].push(idx);
        }
    }
}

/// Accumulate each bus's self-admittance block from its incident
/// branches and any attached generator source, and assign the bus's
/// starting position in the system.
fn build_diagonal(buses: &mut [Bus], branches: &[Branch], scratch: &mut SolverScratch) {
    if scratch.diag.len() < buses.len() {
        scratch.diag.resize_with(buses.len(), DiagBlock::default);
    }

    let mut index_count = 0usize;
    for (i, bus) in buses.iter_mut().enumerate() {
        let size = bus.phases.block_size();
        let mut y = Matrix3::<Complex64>::zeros();

        for &bi in &scratch.links[i] {
            let branch = &branches[bi];
            let ys = if branch.from == i {
                &branch.ys_from
            } else {
                &branch.ys_to
            };

            if bus.phases.abc() == PhaseSet::ABC {
                // Full three-phase: place at physical positions,
                // restricted to the branch's phases.
                for row in 0..3 {
                    if !branch.phases.contains(PhaseSet::bit_of_phase(row)) {
                        continue;
                    }
                    for col in 0..3 {
                        if branch.phases.contains(PhaseSet::bit_of_phase(col)) {
                            y[(row, col)] += ys[(row, col)];
                        }
                    }
                }
            } else if bus.phases.is_split() {
                // 2x2 upper-left block. A triplex line leaving the
                // secondary of a center-tapped transformer enters
                // negated to match that bus's sign convention.
                let negate = branch.from == i && bus.phases.is_secondary_to();
                for row in 0..2 {
                    for col in 0..2 {
                        if negate {
                            y[(row, col)] -= ys[(row, col)];
                        } else {
                            y[(row, col)] += ys[(row, col)];
                        }
                    }
                }
            } else {
                // Single or two-phase bus: pack the intersection of bus
                // and branch phases into the compact upper-left block.
                match bus.phases.abc() {
                    PhaseSet::NONE => {}
                    _ => {
                        for (slot_r, ph_r) in bus.phases.slots() {
                            if !branch.phases.contains(PhaseSet::bit_of_phase(ph_r)) {
                                continue;
                            }
                            for (slot_c, ph_c) in bus.phases.slots() {
                                if branch.phases.contains(PhaseSet::bit_of_phase(ph_c)) {
                                    y[(slot_r, slot_c)] += ys[(ph_r, ph_c)];
                                }
                            }
                        }
                    }
                }
            }
        }

        // Fold in the static admittance of an attached source.
        if bus.dynamics_enabled {
            if let Some(gen_) = bus.gen_admittance.as_ref() {
                if bus.phases.is_split() {
                    for row in 0..2 {
                        for col in 0..2 {
                            y[(row, col)] += gen_[(row, col)];
                        }
                    }
                } else {
                    for (slot_r, ph_r) in bus.phases.slots() {
                        for (slot_c, ph_c) in bus.phases.slots() {
                            y[(slot_r, slot_c)] += gen_[(ph_r, ph_c)];
                        }
                    }
                }
            }
        }

        bus.matrix_loc = index_count;
        scratch.diag[i] = DiagBlock {
            y,
            size,
            base: index_count,
        };
        index_count += size;
    }
    scratch.total_vars = index_count;
}

/// Emit the fixed off-diagonal entries for every branch. Each complex
/// admittance lands in four mirrored real positions; entries whose real
/// or imaginary part is zero are omitted entirely.
fn build_offdiagonal(
    buses: &[Bus],
    branches: &[Branch],
    scratch: &mut SolverScratch,
) -> Result<(), ConfigError> {
    scratch.offdiag.clear();

    for (bi, branch) in branches.iter().enumerate() {
        let a = branch.from;
        let b = branch.to;
        let bus_a = &buses[a];
        let bus_b = &buses[b];
        let base_a = 2 * bus_a.matrix_loc;
        let base_b = 2 * bus_b.matrix_loc;

        if branch.phases.is_split() && branch.v_ratio == 1.0 {
            // Triplex line between two split-phase buses.
            if !bus_a.phases.is_split() || !bus_b.phases.is_split() {
                return Err(ConfigError::UnsupportedTopology { branch: bi });
            }
            if bus_a.phases.is_secondary_to() && bus_b.phases.is_secondary_to() {
                // Joining two transformer secondaries with one triplex
                // line is not modeled.
                return Err(ConfigError::UnsupportedTopology { branch: bi });
            }
            let flip_a = bus_a.phases.is_secondary_to();
            let flip_b = bus_b.phases.is_secondary_to();
            for j in 0..2 {
                for k in 0..2 {
                    push_offdiag(
                        &mut scratch.offdiag,
                        base_a + j,
                        base_a + j + 2,
                        base_b + k,
                        base_b + k + 2,
                        branch.y_from[(j, k)],
                        flip_a,
                    );
                    push_offdiag(
                        &mut scratch.offdiag,
                        base_b + j,
                        base_b + j + 2,
                        base_a + k,
                        base_a + k + 2,
                        branch.y_to[(j, k)],
                        flip_b,
                    );
                }
            }
        } else if branch.phases.is_split() {
            // Center-tapped transformer: three-phase primary on the from
            // side, split-phase secondary on the to side.
            if bus_a.phases.is_split() || !bus_b.phases.is_split() {
                return Err(ConfigError::UnsupportedTopology { branch: bi });
            }
            let primary = branch.phases.abc();
            if primary.phase_count() != 1 {
                return Err(ConfigError::InvalidSecondaryPhase { branch: bi });
            }
            let (offset, _) = bus_a
                .phases
                .offset_within(primary)
                .ok_or(ConfigError::InvalidSecondaryPhase { branch: bi })?;
            let size_a = bus_a.phases.phase_count();
            let phase = primary
                .phase_of_slot(0)
                .ok_or(ConfigError::InvalidSecondaryPhase { branch: bi })?;

            for k in 0..2 {
                push_offdiag(
                    &mut scratch.offdiag,
                    base_a + offset,
                    base_a + offset + size_a,
                    base_b + k,
                    base_b + k + 2,
                    branch.y_from[(phase, k)],
                    false,
                );
                // The secondary-side coupling reads the to-block
                // transposed.
                push_offdiag(
                    &mut scratch.offdiag,
                    base_b + k,
                    base_b + k + 2,
                    base_a + offset,
                    base_a + offset + size_a,
                    branch.y_to[(k, phase)],
                    false,
                );
            }
        } else {
            // Ordinary line or transformer between wye/delta buses.
            if bus_a.phases.is_split() || bus_b.phases.is_split() {
                return Err(ConfigError::UnsupportedTopology { branch: bi });
            }
            let line = branch.phases.abc();
            if line == PhaseSet::NONE {
                // Faulted out; contributes nothing.
                continue;
            }
            if !bus_a.phases.abc().contains(line) || !bus_b.phases.abc().contains(line) {
                return Err(ConfigError::PhaseMismatch { branch: bi });
            }
            let size_a = bus_a.phases.phase_count();
            let size_b = bus_b.phases.phase_count();

            if bus_a.phases.abc() == PhaseSet::ABC && bus_b.phases.abc() == PhaseSet::ABC {
                // Both ends full three-phase: physical placement with
                // per-phase validity.
                for j in 0..3 {
                    if !line.contains(PhaseSet::bit_of_phase(j)) {
                        continue;
                    }
                    for k in 0..3 {
                        if !line.contains(PhaseSet::bit_of_phase(k)) {
                            continue;
                        }
                        push_offdiag(
                            &mut scratch.offdiag,
                            base_a + j,
                            base_a + j + 3,
                            base_b + k,
                            base_b + k + 3,
                            branch.y_from[(j, k)],
                            false,
                        );
                        push_offdiag(
                            &mut scratch.offdiag,
                            base_b + j,
                            base_b + j + 3,
                            base_a + k,
                            base_a + k + 3,
                            branch.y_to[(j, k)],
                            false,
                        );
                    }
                }
            } else {
                // Reduced line: compact sub-block on each end, with a
                // stride gap when an A+C line meets a full ABC bus.
                let (off_a, stride_a) = bus_a
                    .phases
                    .offset_within(line)
                    .ok_or(ConfigError::PhaseMismatch { branch: bi })?;
                let (off_b, stride_b) = bus_b
                    .phases
                    .offset_within(line)
                    .ok_or(ConfigError::PhaseMismatch { branch: bi })?;

                let phases: Vec<usize> = line.slots().map(|(_, phase)| phase).collect();
                for (jj, &ph_j) in phases.iter().enumerate() {
                    for (kk, &ph_k) in phases.iter().enumerate() {
                        let row_a = base_a + off_a + jj * stride_a;
                        let col_b = base_b + off_b + kk * stride_b;
                        push_offdiag(
                            &mut scratch.offdiag,
                            row_a,
                            row_a + size_a,
                            col_b,
                            col_b + size_b,
                            branch.y_from[(ph_j, ph_k)],
                            false,
                        );
                        let row_b = base_b + off_b + jj * stride_b;
                        let col_a = base_a + off_a + kk * stride_a;
                        push_offdiag(
                            &mut scratch.offdiag,
                            row_b,
                            row_b + size_b,
                            col_a,
                            col_a + size_a,
                            branch.y_to[(ph_j, ph_k)],
                            false,
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

/// Fixed diagonal entries: the off-diagonal elements (within the block)
/// of each bus's self admittance. The block diagonal itself is rebuilt
/// every iteration together with the Jacobian.
fn build_fixed_diagonal(buses: &[Bus], scratch: &mut SolverScratch) {
    scratch.diag_fixed.clear();
    for (i, _) in buses.iter().enumerate() {
        let block = &scratch.diag[i];
        let base = 2 * block.base;
        for j in 0..block.size {
            for k in 0..block.size {
                if j == k {
                    continue;
                }
                let y = block.y[(j, k)];
                if y.im != 0.0 {
                    scratch.diag_fixed.push(Entry::new(base + j, base + k, y.im));
                    scratch.diag_fixed.push(Entry::new(
                        base + j + block.size,
                        base + k + block.size,
                        -y.im,
                    ));
                }
                if y.re != 0.0 {
                    scratch
                        .diag_fixed
                        .push(Entry::new(base + j, base + k + block.size, y.re));
                    scratch
                        .diag_fixed
                        .push(Entry::new(base + j + block.size, base + k, y.re));
                }
            }
        }
    }
}

/// Place one complex off-diagonal admittance as its four mirrored real
/// entries. `q_*` index the first (imaginary-equation) half of a block,
/// `p_*` the second (real-equation) half. `flip` inverts every sign for
/// contributions into a center-tapped secondary bus.
fn push_offdiag(
    pool: &mut Vec<Entry>,
    q_row: usize,
    p_row: usize,
    q_col: usize,
    p_col: usize,
    y: Complex64,
    flip: bool,
) {
    let s = if flip { -1.0 } else { 1.0 };
    if y.im != 0.0 {
        pool.push(Entry::new(q_row, q_col, -s * y.im));
        pool.push(Entry::new(p_row, p_col, s * y.im));
    }
    if y.re != 0.0 {
        pool.push(Entry::new(p_row, q_col, -s * y.re));
        pool.push(Entry::new(q_row, p_col, -s * y.re));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::powerflow::model::BusType;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn three_phase_bus(bus_type: BusType) -> Bus {
        Bus {
            bus_type,
            phases: PhaseSet::ABC,
            ..Default::default()
        }
    }

    fn line_between(from: usize, to: usize, phases: PhaseSet, y: Complex64) -> Branch {
        let mut block = Matrix3::zeros();
        for (_, p) in phases.slots() {
            block[(p, p)] = y;
        }
        Branch {
            from,
            to,
            phases,
            y_from: block,
            y_to: block,
            ys_from: block,
            ys_to: block,
            ..Default::default()
        }
    }

    #[test]
    fn diagonal_accumulates_both_ends() {
        let mut buses = vec![
            three_phase_bus(BusType::Swing),
            three_phase_bus(BusType::Pq),
        ];
        let y = c(4.0, -12.0);
        let branches = vec![line_between(0, 1, PhaseSet::ABC, y)];
        let mut scratch = SolverScratch::new();
        assemble(&mut buses, &branches, &mut scratch).unwrap();

        assert_eq!(scratch.total_vars, 6);
        assert_eq!(buses[0].matrix_loc, 0);
        assert_eq!(buses[1].matrix_loc, 3);
        for i in 0..2 {
            for p in 0..3 {
                assert_eq!(scratch.diag[i].y[(p, p)], y);
            }
        }
        // One diagonal complex value per phase per direction, doubled
        // for the real/imaginary mirror: 3 phases * 2 ends * 4 entries.
        assert_eq!(scratch.offdiag.len(), 24);
        // No intra-block coupling on a transposition-free line.
        assert!(scratch.diag_fixed.is_empty());
    }

    #[test]
    fn single_phase_line_on_reduced_bus_packs_compactly() {
        let mut buses = vec![
            Bus {
                phases: PhaseSet::B | PhaseSet::C,
                ..Default::default()
            },
            Bus {
                phases: PhaseSet::C,
                ..Default::default()
            },
        ];
        let y = c(1.0, -3.0);
        let branches = vec![line_between(0, 1, PhaseSet::C, y)];
        let mut scratch = SolverScratch::new();
        assemble(&mut buses, &branches, &mut scratch).unwrap();

        // Phase C sits in slot 1 of the BC bus, slot 0 of the C bus.
        assert_eq!(scratch.diag[0].y[(1, 1)], y);
        assert_eq!(scratch.diag[0].y[(0, 0)], Complex64::default());
        assert_eq!(scratch.diag[1].y[(0, 0)], y);

        // From-side rows: q = 2*0 + 1 = 1, p = 1 + 2 = 3;
        // to-side cols: q = 2*2 + 0 = 4, p = 5.
        let e: Vec<_> = scratch
            .offdiag
            .iter()
            .map(|e| (e.row, e.col, e.value))
            .collect();
        assert!(e.contains(&(1, 4, 3.0))); // -im mirrored
        assert!(e.contains(&(3, 5, -3.0)));
        assert!(e.contains(&(3, 4, -1.0)));
        assert!(e.contains(&(1, 5, -1.0)));
    }

    #[test]
    fn branch_phase_missing_from_endpoint_is_fatal() {
        let mut buses = vec![
            three_phase_bus(BusType::Swing),
            Bus {
                phases: PhaseSet::A | PhaseSet::B,
                ..Default::default()
            },
        ];
        let branches = vec![line_between(0, 1, PhaseSet::ABC, c(1.0, -1.0))];
        let mut scratch = SolverScratch::new();
        let err = assemble(&mut buses, &branches, &mut scratch).unwrap_err();
        assert_eq!(err, ConfigError::PhaseMismatch { branch: 0 });
    }

    #[test]
    fn generator_admittance_folds_into_diagonal() {
        let mut buses = vec![
            three_phase_bus(BusType::Swing),
            three_phase_bus(BusType::Pq),
        ];
        let mut gen_ = Matrix3::zeros();
        gen_[(0, 0)] = c(0.5, -1.0);
        buses[1].dynamics_enabled = true;
        buses[1].gen_admittance = Some(gen_);
        let y = c(2.0, -6.0);
        let branches = vec![line_between(0, 1, PhaseSet::ABC, y)];
        let mut scratch = SolverScratch::new();
        assemble(&mut buses, &branches, &mut scratch).unwrap();
        assert_eq!(scratch.diag[1].y[(0, 0)], y + c(0.5, -1.0));
        assert_eq!(scratch.diag[1].y[(1, 1)], y);
    }

    #[test]
    fn center_tap_secondary_blocks_are_sign_adjusted() {
        let yw = c(33.0, -66.0);
        let ratio = 60.0;
        let mut buses = vec![
            three_phase_bus(BusType::Swing),
            Bus {
                phases: PhaseSet::SPLIT | PhaseSet::SECONDARY_TO | PhaseSet::A,
                ..Default::default()
            },
        ];
        let branches = vec![crate::testcases::center_tap_transformer(
            0,
            1,
            PhaseSet::A,
            ratio,
            yw,
        )];
        let mut scratch = SolverScratch::new();
        assemble(&mut buses, &branches, &mut scratch).unwrap();

        assert_eq!(scratch.total_vars, 5);
        assert_eq!(buses[1].matrix_loc, 3);
        // Secondary self block keeps the leg-2 sign flip; the primary
        // diagonal sees both windings through the squared turns ratio.
        assert_eq!(scratch.diag[1].y[(0, 0)], -yw);
        assert_eq!(scratch.diag[1].y[(1, 1)], yw);
        assert_eq!(scratch.diag[0].y[(0, 0)], 2.0 * yw / (ratio * ratio));

        // Primary phase A couples to both secondary legs (rows 0/3,
        // cols 6..=9) and each leg couples back through one primary
        // column (rows 6..=9, cols 0/3).
        let cpl = yw / ratio;
        let e: Vec<_> = scratch
            .offdiag
            .iter()
            .map(|e| (e.row, e.col, e.value))
            .collect();
        assert!(e.contains(&(0, 6, -cpl.im)));
        assert!(e.contains(&(3, 6, -cpl.re)));
        assert!(e.contains(&(0, 7, -cpl.im)));
        assert!(e.contains(&(6, 0, cpl.im)));
        assert!(e.contains(&(8, 0, cpl.re)));
        assert!(e.contains(&(7, 0, -cpl.im)));
    }

    #[test]
    fn ac_line_into_full_bus_gaps_phase_b() {
        let mut buses = vec![
            three_phase_bus(BusType::Swing),
            Bus {
                phases: PhaseSet::A | PhaseSet::C,
                ..Default::default()
            },
        ];
        let y = c(0.0, -5.0);
        let branches = vec![line_between(0, 1, PhaseSet::A | PhaseSet::C, y)];
        let mut scratch = SolverScratch::new();
        assemble(&mut buses, &branches, &mut scratch).unwrap();

        // ABC-side rows for phase C must sit at local index 2 (stride
        // 2), while the AC bus packs it at local index 1.
        let e: Vec<_> = scratch
            .offdiag
            .iter()
            .map(|e| (e.row, e.col, e.value))
            .collect();
        // from-side phase C imag: rows 2 and 2+3, cols 2*3+1 and +2.
        assert!(e.contains(&(2, 7, 5.0)));
        assert!(e.contains(&(5, 9, -5.0)));
    }
}
