//! Slot bitmask helpers
//!
//! Multi-node exchanges describe which slots (or responders) take part with a
//! 32-bit mask. A node finds its own position within the exchange from the
//! mask and its own single-bit slot flag.

use core::convert::TryFrom;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

use crate::Error;

/// Returns the number of set bits
pub fn number_of_bits(n: u32) -> u32 {
    n.count_ones()
}

/// Returns the 1-based position of the only set bit in `n`
///
/// Returns `None` unless exactly one bit is set.
///
/// # Example
///
/// ``` rust
/// use uwb_core::slots::bit_position;
///
/// assert_eq!(bit_position(0b1000), Some(4));
/// assert_eq!(bit_position(0b1010), None);
/// assert_eq!(bit_position(0), None);
/// ```
pub fn bit_position(n: u32) -> Option<u32> {
    if n.is_power_of_two() {
        Some(n.trailing_zeros() + 1)
    } else {
        None
    }
}

/// What [`bit_index`] counts
///
/// [`bit_index`]: fn.bit_index.html
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotMode {
    /// 0-based rank of the slot among all slots in the mask
    Position,
    /// Number of slots in the mask after this one
    ///
    /// This is a count, not a 0-based index of the remaining slots: the last
    /// slot in the mask gives 0 and the one before it gives 1.
    Remaining,
}

/// Locates the single-bit slot flag `n` within `mask`
///
/// Returns `None` if `n` doesn't have exactly one bit set, or if that bit is
/// not part of `mask`.
///
/// # Example
///
/// ``` rust
/// use uwb_core::slots::{bit_index, SlotMode};
///
/// let mask = 0b1011_0110;
///
/// assert_eq!(bit_index(mask, 0b0000_0010, SlotMode::Position), Some(0));
/// assert_eq!(bit_index(mask, 0b0010_0000, SlotMode::Position), Some(3));
/// assert_eq!(bit_index(mask, 0b0010_0000, SlotMode::Remaining), Some(1));
/// assert_eq!(bit_index(mask, 0b1000_0000, SlotMode::Remaining), Some(0));
/// assert_eq!(bit_index(mask, 0b0000_1000, SlotMode::Position), None);
/// ```
pub fn bit_index(mask: u32, n: u32, mode: SlotMode) -> Option<u32> {
    let idx = bit_position(n)?;
    if mask & n == 0 {
        return None;
    }

    match mode {
        SlotMode::Position => {
            let below_and_self = u32::MAX >> (32 - idx);
            Some(number_of_bits(mask & below_and_self) - 1)
        }
        SlotMode::Remaining => {
            let above = u32::MAX.checked_shl(idx).unwrap_or(0);
            Some(number_of_bits(mask & above))
        }
    }
}

/// Type tag of a [`SlotPayload`](enum.SlotPayload.html)
#[derive(Clone, Copy, Debug, Eq, IntoPrimitive, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum PayloadType {
    /// Cell network: cell id plus slot mask
    Cell = 0,
    /// Single cell network: plain bitfield
    Bitfield,
    /// Contiguous range of slots
    Range,
}

/// Describes the slots taking part in an exchange
///
/// Packs into one 32-bit word: the type tag in the lowest two bits, the
/// payload in the upper 30.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SlotPayload {
    /// A slot mask within one cell
    Cell {
        /// 14-bit cell id
        cell_id: u16,
        /// Slots within the cell
        slot_mask: u16,
    },
    /// A 30-bit slot bitfield
    Bitfield(u32),
    /// Slots `start..=end`
    Range {
        /// 14-bit first slot id
        start: u16,
        /// Last slot id
        end: u16,
    },
}

const CELL_ID_MASK: u32 = 0x3fff;
const BITFIELD_MASK: u32 = 0x3fff_ffff;

impl SlotPayload {
    /// Packs the payload into its 32-bit wire representation
    ///
    /// Returns `InvalidArgument` if a field doesn't fit its bit width.
    pub fn to_bits(self) -> Result<u32, Error> {
        let (ptype, payload) = match self {
            SlotPayload::Cell { cell_id, slot_mask } => {
                if u32::from(cell_id) > CELL_ID_MASK {
                    return Err(Error::InvalidArgument);
                }
                (PayloadType::Cell, u32::from(cell_id) | u32::from(slot_mask) << 14)
            }
            SlotPayload::Bitfield(bits) => {
                if bits > BITFIELD_MASK {
                    return Err(Error::InvalidArgument);
                }
                (PayloadType::Bitfield, bits)
            }
            SlotPayload::Range { start, end } => {
                if u32::from(start) > CELL_ID_MASK {
                    return Err(Error::InvalidArgument);
                }
                (PayloadType::Range, u32::from(start) | u32::from(end) << 14)
            }
        };

        Ok(u32::from(u8::from(ptype)) | payload << 2)
    }

    /// Unpacks a payload from its 32-bit wire representation
    pub fn from_bits(bits: u32) -> Result<Self, Error> {
        let ptype = PayloadType::try_from((bits & 0b11) as u8).map_err(|_| Error::InvalidArgument)?;
        let payload = bits >> 2;
        let low = (payload & CELL_ID_MASK) as u16;
        let high = (payload >> 14) as u16;

        Ok(match ptype {
            PayloadType::Cell => SlotPayload::Cell {
                cell_id: low,
                slot_mask: high,
            },
            PayloadType::Bitfield => SlotPayload::Bitfield(payload),
            PayloadType::Range => SlotPayload::Range {
                start: low,
                end: high,
            },
        })
    }

    /// Returns `true` if `slot` (0-based) is covered by this payload
    ///
    /// Slots in a cell payload are matched against the slot mask only.
    pub fn contains(&self, slot: u16) -> bool {
        match *self {
            SlotPayload::Cell { slot_mask, .. } => slot < 16 && slot_mask & (1 << slot) != 0,
            SlotPayload::Bitfield(bits) => slot < 30 && bits & (1 << slot) != 0,
            SlotPayload::Range { start, end } => (start..=end).contains(&slot),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_bits() {
        assert_eq!(number_of_bits(0), 0);
        assert_eq!(number_of_bits(0xffff_ffff), 32);
        assert_eq!(number_of_bits(0b1011), 3);
    }

    #[test]
    fn bit_position_of_top_bit() {
        assert_eq!(bit_position(0x8000_0000), Some(32));
        assert_eq!(bit_position(1), Some(1));
    }

    #[test]
    fn bit_index_at_mask_edges() {
        let mask = 0x8000_0001;

        assert_eq!(bit_index(mask, 1, SlotMode::Position), Some(0));
        assert_eq!(bit_index(mask, 1, SlotMode::Remaining), Some(1));
        assert_eq!(bit_index(mask, 0x8000_0000, SlotMode::Position), Some(1));
        assert_eq!(bit_index(mask, 0x8000_0000, SlotMode::Remaining), Some(0));
    }

    #[test]
    fn bit_index_rejects_multiple_bits() {
        assert_eq!(bit_index(0xff, 0b11, SlotMode::Position), None);
    }

    #[test]
    fn payload_packing() {
        let cell = SlotPayload::Cell {
            cell_id: 0x2a,
            slot_mask: 0x8001,
        };
        let bits = cell.to_bits().unwrap();

        assert_eq!(bits & 0b11, 0);
        assert_eq!(bits >> 2 & 0x3fff, 0x2a);
        assert_eq!(bits >> 16, 0x8001);
        assert_eq!(SlotPayload::from_bits(bits).unwrap(), cell);
        assert!(cell.contains(0));
        assert!(cell.contains(15));
        assert!(!cell.contains(1));

        let range = SlotPayload::Range { start: 3, end: 9 };
        assert_eq!(SlotPayload::from_bits(range.to_bits().unwrap()).unwrap(), range);
        assert!(range.contains(9));
        assert!(!range.contains(10));
    }

    #[test]
    fn payload_rejects_oversized_fields() {
        assert!(SlotPayload::Bitfield(0x4000_0000).to_bits().is_err());
        assert!(SlotPayload::Cell { cell_id: 0x4000, slot_mask: 0 }.to_bits().is_err());
        assert!(SlotPayload::from_bits(0b11).is_err());
    }
}
