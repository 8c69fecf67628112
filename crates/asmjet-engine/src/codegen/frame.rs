//! Frame slot assignment and GC map construction.
//!
//! Frame offsets are assigned left to right with natural alignment: each
//! slot's offset is rounded up to a multiple of its size. A GC map is a
//! bitmap over frame words, one bit per word, set when the word holds a
//! live managed reference; the map itself lives in the owning loop token's
//! data block so the GC can read it by address.

use crate::arch::WORD;
use crate::host::{DataBlock, DataHeap};
use crate::ir::Kind;

/// Byte size of a frame slot of the given kind.
pub fn kind_size(kind: Kind) -> i32 {
    match kind {
        Kind::Float => 8,
        _ => WORD as i32,
    }
}

/// Assign naturally-aligned frame offsets to a sequence of kinds, starting
/// at `offset`. Holes get location -1 and occupy no space. Returns the
/// locations and the offset just past the last slot.
pub fn frame_locations(kinds: &[Kind], offset: i32) -> (Vec<i32>, i32) {
    let mut locations = vec![-1; kinds.len()];
    let mut offset = offset;
    for (i, &kind) in kinds.iter().enumerate() {
        if kind == Kind::Hole {
            continue;
        }
        let size = kind_size(kind);
        let misalign = offset % size;
        if misalign != 0 {
            offset += size - misalign;
        }
        locations[i] = offset;
        offset += size;
    }
    (locations, offset)
}

/// Address and extent of a GC map in the data heap. `addr == 0` is the
/// null map (no references anywhere).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcMapRef {
    pub addr: u32,
    /// Number of 32-bit units.
    pub units: u32,
}

pub const NULL_GCMAP: GcMapRef = GcMapRef { addr: 0, units: 0 };

impl GcMapRef {
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Whether the bit for the given frame word is set.
    pub fn has_bit(&self, heap: &DataHeap, frame_word: u32) -> bool {
        let unit = frame_word / (WORD as u32 * 8);
        if unit >= self.units {
            return false;
        }
        let bit = frame_word % (WORD as u32 * 8);
        heap.read_u32(self.addr + unit * WORD as u32) & (1 << bit) != 0
    }
}

/// Allocate a zeroed GC map covering a frame of `frame_bytes` bytes.
pub fn alloc_gcmap(data: &mut DataBlock, frame_bytes: i32) -> GcMapRef {
    let frame_words = (frame_bytes as u32).div_ceil(WORD as u32);
    let units = frame_words.div_ceil(WORD as u32 * 8).max(1);
    GcMapRef {
        addr: data.malloc(units * WORD as u32),
        units,
    }
}

/// Set the bit for a frame word (given as a byte offset into the frame).
pub fn set_gcmap_bit(data: &DataBlock, map: GcMapRef, byte_ofs: i32) {
    let frame_word = byte_ofs as u32 / WORD as u32;
    let unit = frame_word / (WORD as u32 * 8);
    let bit = frame_word % (WORD as u32 * 8);
    debug_assert!(unit < map.units);
    let addr = map.addr + unit * WORD as u32;
    let old = data.heap().read_u32(addr);
    data.heap().write_u32(addr, old | (1 << bit));
}

/// Build the GC map for `(kinds, locs)` pairs: one bit per `Ref` location.
/// Returns the null map when no location holds a reference.
pub fn gcmap_from_kinds(data: &mut DataBlock, kinds: &[Kind], locs: &[i32]) -> GcMapRef {
    assert_eq!(kinds.len(), locs.len());
    if !kinds.iter().any(|&k| k == Kind::Ref) {
        return NULL_GCMAP;
    }
    let top = kinds
        .iter()
        .zip(locs)
        .filter(|(&k, _)| k != Kind::Hole)
        .map(|(_, &l)| l)
        .max()
        .unwrap_or(0);
    let map = alloc_gcmap(data, top + WORD as i32);
    for (&kind, &loc) in kinds.iter().zip(locs) {
        if kind == Kind::Ref {
            set_gcmap_bit(data, map, loc);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::sync::Arc;

    fn kinds_from_bytes(bytes: &[u8]) -> Vec<Kind> {
        bytes
            .iter()
            .map(|b| match b % 4 {
                0 => Kind::Int,
                1 => Kind::Ref,
                2 => Kind::Float,
                _ => Kind::Hole,
            })
            .collect()
    }

    fn test_block() -> DataBlock {
        DataBlock::new(Arc::new(DataHeap::new()))
    }

    #[test]
    fn test_alignment_pads_doubles() {
        let kinds = [Kind::Int, Kind::Float, Kind::Int];
        let (locs, end) = frame_locations(&kinds, 0);
        assert_eq!(locs, vec![0, 8, 16]);
        assert_eq!(end, 20);
    }

    #[test]
    fn test_holes_occupy_no_space() {
        let kinds = [Kind::Int, Kind::Hole, Kind::Int];
        let (locs, end) = frame_locations(&kinds, 0);
        assert_eq!(locs, vec![0, -1, 4]);
        assert_eq!(end, 8);
    }

    #[quickcheck]
    fn prop_frame_offsets_aligned_and_disjoint(bytes: Vec<u8>, start: u8) -> bool {
        let kinds = kinds_from_bytes(&bytes);
        let start = (start as i32 / 4) * 4;
        let (locs, end) = frame_locations(&kinds, start);
        let mut spans: Vec<(i32, i32)> = Vec::new();
        for (&kind, &loc) in kinds.iter().zip(&locs) {
            if kind == Kind::Hole {
                if loc != -1 {
                    return false;
                }
                continue;
            }
            let size = kind_size(kind);
            if loc < start || loc % size != 0 || loc + size > end {
                return false;
            }
            spans.push((loc, loc + size));
        }
        spans.sort_unstable();
        spans.windows(2).all(|w| w[0].1 <= w[1].0)
    }

    #[quickcheck]
    fn prop_gcmap_bit_set_iff_ref(bytes: Vec<u8>) -> bool {
        let kinds = kinds_from_bytes(&bytes);
        let (locs, _) = frame_locations(&kinds, 0);
        let mut data = test_block();
        let map = gcmap_from_kinds(&mut data, &kinds, &locs);
        if map.is_null() {
            return !kinds.iter().any(|&k| k == Kind::Ref);
        }
        kinds.iter().zip(&locs).all(|(&kind, &loc)| {
            if kind == Kind::Hole {
                return true;
            }
            let word = loc as u32 / WORD as u32;
            map.has_bit(data.heap(), word) == (kind == Kind::Ref)
        })
    }

    #[test]
    fn test_gcmap_null_without_refs() {
        let mut data = test_block();
        let kinds = [Kind::Int, Kind::Float];
        let (locs, _) = frame_locations(&kinds, 0);
        assert!(gcmap_from_kinds(&mut data, &kinds, &locs).is_null());
    }

    #[test]
    fn test_gcmap_covers_high_offsets() {
        let mut data = test_block();
        // 40 int slots then a ref: frame word 40 lives in the second unit.
        let mut kinds = vec![Kind::Int; 40];
        kinds.push(Kind::Ref);
        let (locs, _) = frame_locations(&kinds, 0);
        let map = gcmap_from_kinds(&mut data, &kinds, &locs);
        assert_eq!(map.units, 2);
        assert!(map.has_bit(data.heap(), 40));
        assert!(!map.has_bit(data.heap(), 39));
    }
}
