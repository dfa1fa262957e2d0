use derive_more::{BitAnd, BitOr, BitOrAssign};
use serde::{Deserialize, Serialize};

/// Phase/connection bitmask carried by buses and branches.
///
/// Encoding follows the classic distribution-solver byte: bits 0..2 are
/// phases C, B, A, bit 3 marks a delta connection, bit 5 marks the
/// low-voltage bus of a center-tapped transformer secondary and bit 7
/// marks a split-phase (triplex) bus or line.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, BitAnd, BitOr, BitOrAssign, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PhaseSet(pub u8);

impl PhaseSet {
    pub const NONE: PhaseSet = PhaseSet(0x00);
    pub const C: PhaseSet = PhaseSet(0x01);
    pub const B: PhaseSet = PhaseSet(0x02);
    pub const A: PhaseSet = PhaseSet(0x04);
    pub const ABC: PhaseSet = PhaseSet(0x07);
    /// Delta-connected load/bus.
    pub const DELTA: PhaseSet = PhaseSet(0x08);
    /// Low-voltage side of a center-tapped transformer secondary.
    pub const SECONDARY_TO: PhaseSet = PhaseSet(0x20);
    /// Split-phase (triplex) bus or line.
    pub const SPLIT: PhaseSet = PhaseSet(0x80);

    #[inline]
    pub fn contains(self, other: PhaseSet) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: PhaseSet) -> bool {
        self.0 & other.0 != 0
    }

    /// The A/B/C phase bits only.
    #[inline]
    pub fn abc(self) -> PhaseSet {
        PhaseSet(self.0 & 0x07)
    }

    #[inline]
    pub fn is_delta(self) -> bool {
        self.contains(Self::DELTA)
    }

    #[inline]
    pub fn is_split(self) -> bool {
        self.contains(Self::SPLIT)
    }

    #[inline]
    pub fn is_secondary_to(self) -> bool {
        self.contains(Self::SECONDARY_TO)
    }

    /// Number of A/B/C phases present.
    #[inline]
    pub fn phase_count(self) -> usize {
        (self.0 & 0x07).count_ones() as usize
    }

    /// Size of this bus's block in the admittance diagonal: split-phase
    /// buses always occupy two slots, everything else one per phase.
    #[inline]
    pub fn block_size(self) -> usize {
        if self.is_split() { 2 } else { self.phase_count() }
    }

    /// Bit for a physical phase index (0 = A, 1 = B, 2 = C).
    #[inline]
    pub fn bit_of_phase(phase: usize) -> PhaseSet {
        PhaseSet(0x04 >> phase)
    }

    /// Physical phase index (0 = A, 1 = B, 2 = C) stored in compact
    /// slot `slot`. Phases pack top-heavy in A, B, C order, so a B+C bus
    /// maps slot 0 to phase B and slot 1 to phase C.
    pub fn phase_of_slot(self, slot: usize) -> Option<usize> {
        self.slots().nth(slot).map(|(_, phase)| phase)
    }

    /// Iterator over `(slot, phase)` pairs for the phases present.
    pub fn slots(self) -> impl Iterator<Item = (usize, usize)> {
        let abc = self.0 & 0x07;
        (0..3usize)
            .filter(move |p| abc & (0x04 >> p) != 0)
            .enumerate()
    }

    /// Locate a sub-block inside this set's compact layout.
    ///
    /// Returns `(offset, stride)` such that the k-th phase of `sub`
    /// (in A, B, C order) sits at local index `offset + k * stride`.
    /// The stride is 2 only for an A+C sub-block of a full three-phase
    /// bus, where phase B gaps the two. `None` when `sub` carries a
    /// phase this set lacks.
    pub fn offset_within(self, sub: PhaseSet) -> Option<(usize, usize)> {
        let sub = sub.abc();
        if sub == PhaseSet::NONE || !self.abc().contains(sub) {
            return None;
        }
        let first = (0..3).find(|&p| sub.contains(Self::bit_of_phase(p)))?;
        let offset = self
            .slots()
            .find(|&(_, phase)| phase == first)
            .map(|(slot, _)| slot)?;
        let stride = if self.phase_count() == 3 && sub == (PhaseSet::A | PhaseSet::C) {
            2
        } else {
            1
        };
        Some((offset, stride))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_tables_match_phase_layout() {
        // B+C bus: slot 0 is phase B, slot 1 is phase C.
        let bc = PhaseSet::B | PhaseSet::C;
        assert_eq!(bc.phase_of_slot(0), Some(1));
        assert_eq!(bc.phase_of_slot(1), Some(2));
        assert_eq!(bc.phase_of_slot(2), None);

        let ac = PhaseSet::A | PhaseSet::C;
        assert_eq!(ac.phase_of_slot(0), Some(0));
        assert_eq!(ac.phase_of_slot(1), Some(2));

        let abc = PhaseSet::ABC;
        assert_eq!(abc.phase_of_slot(1), Some(1));
        assert_eq!(PhaseSet::C.phase_of_slot(0), Some(2));
    }

    #[test]
    fn block_sizes() {
        assert_eq!(PhaseSet::ABC.block_size(), 3);
        assert_eq!((PhaseSet::A | PhaseSet::B).block_size(), 2);
        assert_eq!((PhaseSet::SPLIT | PhaseSet::C).block_size(), 2);
        assert_eq!(PhaseSet::NONE.block_size(), 0);
    }

    #[test]
    fn sub_block_offsets() {
        let abc = PhaseSet::ABC;
        assert_eq!(abc.offset_within(PhaseSet::A | PhaseSet::C), Some((0, 2)));
        assert_eq!(abc.offset_within(PhaseSet::B | PhaseSet::C), Some((1, 1)));
        assert_eq!(abc.offset_within(PhaseSet::C), Some((2, 1)));

        let bc = PhaseSet::B | PhaseSet::C;
        assert_eq!(bc.offset_within(PhaseSet::C), Some((1, 1)));
        assert_eq!(bc.offset_within(bc), Some((0, 1)));
        // A is not on the bus at all.
        assert_eq!(bc.offset_within(PhaseSet::A), None);
        assert_eq!(bc.offset_within(PhaseSet::A | PhaseSet::B), None);
    }
}
