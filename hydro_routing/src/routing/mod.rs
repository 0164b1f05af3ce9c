/*
This file is part of the Hydrological Routing Tool
Copyright (C) 2022 Novel-T

The Hydrological Routing Tool is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use std::cmp::Ordering;

mod distance;
mod flow_accum;
mod flow_dir;
mod pit_fill;
mod watershed;

pub use distance::*;
pub use flow_accum::*;
pub use flow_dir::*;
pub use pit_fill::*;
pub use watershed::*;

/// D8 neighbor offsets, clockwise from east:
/// 0=E, 1=NE, 2=N, 3=NW, 4=W, 5=SW, 6=S, 7=SE.
pub const D8_DX: [i32; 8] = [1, 1, 0, -1, -1, -1, 0, 1];
pub const D8_DY: [i32; 8] = [0, -1, -1, -1, 0, 1, 1, 1];

/// Direction from the neighbor back to the center pixel.
pub const D8_REVERSE: [u8; 8] = [4, 5, 6, 7, 0, 1, 2, 3];

/// D8 direction rasters are uint8 with nodata 128.
pub const D8_NODATA: f64 = 128.0;

/// MFD direction rasters are int32; an all-zero value means no outflow.
pub const MFD_NODATA: f64 = 0.0;

/// Flow accumulation and distance rasters are float64 with nodata -1.
pub const ACCUM_NODATA: f64 = -1.0;

pub const SQRT2: f64 = std::f64::consts::SQRT_2;
pub const INV_SQRT2: f64 = std::f64::consts::FRAC_1_SQRT_2;

/// Diagonal directions have the low bit set.
#[inline]
pub fn is_diagonal(direction: usize) -> bool {
    direction & 1 != 0
}

/// Travel cost of one step in `direction`.
#[inline]
pub fn step_cost(direction: usize) -> f64 {
    if is_diagonal(direction) {
        SQRT2
    } else {
        1.0
    }
}

/// Slope normaliser: elevation drop across a diagonal is divided by sqrt(2).
#[inline]
pub fn slope_scale(direction: usize) -> f64 {
    if is_diagonal(direction) {
        INV_SQRT2
    } else {
        1.0
    }
}

/// Heap entry for the priority floods.  Ordered by value ascending, ties by
/// the containing block index, so pops are deterministic and tend to stay in
/// the cached block.
#[derive(Clone, Copy, Debug)]
pub struct PixelRecord {
    pub value: f64,
    pub x: i32,
    pub y: i32,
    pub tiebreak: i64,
}

impl PartialEq for PixelRecord {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PixelRecord {}

impl PartialOrd for PixelRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PixelRecord {
    // reversed: BinaryHeap is a max-heap and the floods pop lowest first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .value
            .total_cmp(&self.value)
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
    }
}

/// A suspended step of an explicit-stack flow walk.  `next_neighbor` records
/// how many of the 8 neighbors were already consumed, so a preempted frame
/// resumes without recomputation.
#[derive(Clone, Copy, Debug)]
pub struct FlowWalkFrame {
    pub x: i32,
    pub y: i32,
    pub next_neighbor: usize,
    pub running: f64,
}

/// Reinterprets a managed-raster cell as the packed MFD word.
#[inline]
pub fn mfd_unpack(value: f64) -> u32 {
    value as i64 as u32
}

/// The f64 image of the signed reinterpretation, so GDAL's conversion back
/// to Int32 is lossless even with the top nibble occupied.
#[inline]
pub fn mfd_pack(weights: u32) -> f64 {
    weights as i32 as f64
}

#[inline]
pub fn mfd_weight(packed: u32, direction: usize) -> u32 {
    (packed >> (4 * direction)) & 0xF
}

pub fn mfd_weight_sum(packed: u32) -> u32 {
    (0..8).map(|direction| mfd_weight(packed, direction)).sum()
}

/// Apportions 15 weight units over the positive shares, largest remainder
/// first, ties to the lower direction index.  The nibbles of every defined
/// distribution sum to exactly 15.
pub fn mfd_distribute(shares: &[f64; 8]) -> u32 {
    let total: f64 = shares.iter().filter(|s| **s > 0.0).sum();
    if total <= 0.0 {
        return 0;
    }

    let mut weights = [0u32; 8];
    let mut remainders: Vec<(usize, f64)> = Vec::with_capacity(8);
    let mut assigned = 0u32;
    for direction in 0..8 {
        if shares[direction] <= 0.0 {
            continue;
        }
        let exact = 15.0 * shares[direction] / total;
        let floor = exact.floor();
        weights[direction] = floor as u32;
        assigned += weights[direction];
        remainders.push((direction, exact - floor));
    }

    remainders.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let mut leftover = 15u32.saturating_sub(assigned);
    let mut slot = 0;
    while leftover > 0 {
        let (direction, _) = remainders[slot % remainders.len()];
        weights[direction] += 1;
        leftover -= 1;
        slot += 1;
    }

    let mut packed = 0u32;
    for direction in 0..8 {
        packed |= weights[direction] << (4 * direction);
    }
    packed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_reverse_table() {
        for direction in 0..8 {
            let reverse = D8_REVERSE[direction] as usize;
            assert_eq!(D8_DX[direction], -D8_DX[reverse]);
            assert_eq!(D8_DY[direction], -D8_DY[reverse]);
        }
    }

    #[test]
    fn test_pixel_record_pops_lowest_value_first() {
        let mut heap = BinaryHeap::new();
        heap.push(PixelRecord { value: 5.0, x: 0, y: 0, tiebreak: 0 });
        heap.push(PixelRecord { value: 1.0, x: 1, y: 0, tiebreak: 9 });
        heap.push(PixelRecord { value: 3.0, x: 2, y: 0, tiebreak: 1 });

        let order: Vec<f64> = std::iter::from_fn(|| heap.pop().map(|r| r.value)).collect();
        assert_eq!(vec![1.0, 3.0, 5.0], order);
    }

    #[test]
    fn test_pixel_record_ties_break_on_block_index() {
        let mut heap = BinaryHeap::new();
        heap.push(PixelRecord { value: 2.0, x: 0, y: 0, tiebreak: 7 });
        heap.push(PixelRecord { value: 2.0, x: 1, y: 0, tiebreak: 2 });
        heap.push(PixelRecord { value: 2.0, x: 2, y: 0, tiebreak: 4 });

        let order: Vec<i64> = std::iter::from_fn(|| heap.pop().map(|r| r.tiebreak)).collect();
        assert_eq!(vec![2, 4, 7], order);
    }

    #[test]
    fn test_mfd_pack_round_trip_with_high_nibble() {
        // weight 15 in direction 7 sets the sign bit of the int32 image
        let packed = 15u32 << 28;
        let as_cell = mfd_pack(packed);
        assert!(as_cell < 0.0);
        assert_eq!(packed, mfd_unpack(as_cell));
        assert_eq!(15, mfd_weight(packed, 7));
        assert_eq!(15, mfd_weight_sum(packed));
    }

    #[test]
    fn test_mfd_distribute_sums_to_fifteen() {
        let mut shares = [0.0f64; 8];
        shares[5] = INV_SQRT2;
        shares[6] = 1.0;
        shares[7] = INV_SQRT2;
        let packed = mfd_distribute(&shares);
        assert_eq!(15, mfd_weight_sum(packed));
        assert_eq!(0, mfd_weight(packed, 0));
        assert!(mfd_weight(packed, 5) > 0);
        assert!(mfd_weight(packed, 6) > mfd_weight(packed, 7));

        // two equal shares cannot round to 8 + 8
        let mut halves = [0.0f64; 8];
        halves[0] = 1.0;
        halves[2] = 1.0;
        let packed = mfd_distribute(&halves);
        assert_eq!(15, mfd_weight_sum(packed));
        assert_eq!(8, mfd_weight(packed, 0));
        assert_eq!(7, mfd_weight(packed, 2));
    }

    #[test]
    fn test_mfd_distribute_single_direction() {
        let mut shares = [0.0f64; 8];
        shares[3] = 0.25;
        let packed = mfd_distribute(&shares);
        assert_eq!(15, mfd_weight(packed, 3));
        assert_eq!(15, mfd_weight_sum(packed));
    }

    #[test]
    fn test_mfd_distribute_empty() {
        assert_eq!(0, mfd_distribute(&[0.0; 8]));
    }
}
