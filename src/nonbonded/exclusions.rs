// SPDX-License-Identifier: AGPL-3.0-only

//! Compact tile-indexed encoding of excluded particle pairs.
//!
//! A pair listed in the exclusion set must never be evaluated regardless of
//! distance (directly bonded atoms, 1-3 pairs handled by bonded terms, ...).
//! The encoding is a compressed sparse-row layout over tiles: one 32x32
//! bitmask per tile that has any exclusion, an ascending list of tile
//! column indices per block row, and prefix-sum row offsets.
//!
//! Mask convention: for tile `(x, y)` the mask holds [`BLOCK_SIZE`] u32
//! words; word `row` is the local index of the atom within block `x`, bit
//! `col` the local index within block `y`. Diagonal tiles store both
//! orientations, and every diagonal tile is present in the layout with its
//! self-interaction bits (`row == col`) set, so kernels can mask `i == j`
//! through the same path as caller exclusions.

use crate::error::EngineError;
use crate::nonbonded::{block_of, num_blocks, BLOCK_SIZE};
use std::collections::BTreeMap;

/// Immutable-once-built exclusion encoding shared by all exclusion-aware
/// kernels of one engine.
#[derive(Debug, Clone)]
pub struct ExclusionSet {
    num_blocks: u32,
    /// `BLOCK_SIZE` mask words per encoded tile, CSR order.
    masks: Vec<u32>,
    /// Block-column index `x` of each encoded tile, ascending within a row.
    indices: Vec<u32>,
    /// Prefix sums: row `y` occupies `indices[row_indices[y]..row_indices[y+1]]`.
    row_indices: Vec<u32>,
}

impl ExclusionSet {
    /// Encode a per-particle adjacency list. `exclusion_list[i]` holds the
    /// partners of atom `i`; the input may be one-sided, pairs are
    /// symmetrized here. Entries `j == i` and out-of-range partners are
    /// ignored.
    pub fn build(exclusion_list: &[Vec<u32>], num_atoms: usize) -> Self {
        let nb = num_blocks(num_atoms);
        // Keyed (y, x): BTreeMap iteration order is exactly the CSR
        // emission order (rows by y, columns ascending).
        let mut tiles: BTreeMap<(u32, u32), [u32; BLOCK_SIZE as usize]> = BTreeMap::new();

        // Self-interaction bits on every diagonal tile.
        for b in 0..nb {
            let mask = tiles.entry((b, b)).or_insert([0u32; BLOCK_SIZE as usize]);
            for t in 0..BLOCK_SIZE as usize {
                mask[t] |= 1 << t;
            }
        }

        for (i, partners) in exclusion_list.iter().enumerate() {
            let i = i as u32;
            for &j in partners {
                if j as usize >= num_atoms || j == i {
                    continue;
                }
                let (a, b) = (i.max(j), i.min(j));
                let (x, y) = (block_of(a), block_of(b));
                let mask = tiles.entry((y, x)).or_insert([0u32; BLOCK_SIZE as usize]);
                let (la, lb) = (a % BLOCK_SIZE, b % BLOCK_SIZE);
                if x == y {
                    mask[la as usize] |= 1 << lb;
                    mask[lb as usize] |= 1 << la;
                } else {
                    // a sits in block x, b in block y.
                    mask[la as usize] |= 1 << lb;
                }
            }
        }

        let mut masks = Vec::with_capacity(tiles.len() * BLOCK_SIZE as usize);
        let mut indices = Vec::with_capacity(tiles.len());
        let mut row_indices = vec![0u32; nb as usize + 1];
        for (&(y, x), mask) in &tiles {
            indices.push(x);
            masks.extend_from_slice(mask);
            row_indices[y as usize + 1] = indices.len() as u32;
        }
        // Rows with no tiles inherit the previous offset.
        for y in 1..row_indices.len() {
            if row_indices[y] < row_indices[y - 1] {
                row_indices[y] = row_indices[y - 1];
            }
        }

        Self {
            num_blocks: nb,
            masks,
            indices,
            row_indices,
        }
    }

    /// Number of tiles carrying exclusion data.
    pub fn num_tiles(&self) -> usize {
        self.indices.len()
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Tile bitmasks, `BLOCK_SIZE` words per encoded tile, CSR order.
    pub fn masks(&self) -> &[u32] {
        &self.masks
    }

    /// Block-column index per encoded tile.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Row offsets into [`ExclusionSet::indices`] / [`ExclusionSet::masks`].
    pub fn row_indices(&self) -> &[u32] {
        &self.row_indices
    }

    /// Mask words for tile `(x, y)`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidExclusionTile`] for `x < y`,
    /// [`EngineError::ExclusionTileNotFound`] when the tile carries no data.
    pub fn mask_for(&self, x: u32, y: u32) -> Result<&[u32], EngineError> {
        let p = find_exclusion_index(x, y, &self.indices, &self.row_indices)?;
        Ok(&self.masks[p * BLOCK_SIZE as usize..(p + 1) * BLOCK_SIZE as usize])
    }

    /// Whether the unordered pair `(i, j)` is excluded. Self pairs report
    /// true (the diagonal self bits are always encoded).
    pub fn is_excluded(&self, i: u32, j: u32) -> bool {
        let (a, b) = (i.max(j), i.min(j));
        let (x, y) = (block_of(a), block_of(b));
        match self.mask_for(x, y) {
            Ok(mask) => (mask[(a % BLOCK_SIZE) as usize] >> (b % BLOCK_SIZE)) & 1 != 0,
            Err(_) => false,
        }
    }
}

/// Locate tile `(x, y)` in the CSR layout, returning the tile's position
/// (multiply by [`BLOCK_SIZE`] for the mask offset).
///
/// # Errors
///
/// [`EngineError::InvalidExclusionTile`] for `x < y` — only lower-triangular
/// queries are legal. [`EngineError::ExclusionTileNotFound`] when row `y`
/// has no entry for column `x`; callers that cannot rule this out should
/// treat it as "no exclusions for this tile".
pub fn find_exclusion_index(
    x: u32,
    y: u32,
    indices: &[u32],
    row_indices: &[u32],
) -> Result<usize, EngineError> {
    if x < y {
        return Err(EngineError::InvalidExclusionTile { x, y });
    }
    if y as usize + 1 >= row_indices.len() {
        return Err(EngineError::ExclusionTileNotFound { x, y });
    }
    let start = row_indices[y as usize] as usize;
    let end = row_indices[y as usize + 1] as usize;
    // Columns are ascending within a row; rows are short, binary search
    // via the standard library keeps this O(log n) anyway.
    match indices[start..end].binary_search(&x) {
        Ok(offset) => Ok(start + offset),
        Err(_) => Err(EngineError::ExclusionTileNotFound { x, y }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonbonded::tile_flat_index;

    #[test]
    fn diagonal_self_bits_always_present() {
        let set = ExclusionSet::build(&[vec![], vec![], vec![]], 3);
        assert_eq!(set.num_blocks(), 1);
        assert_eq!(set.num_tiles(), 1);
        let mask = set.mask_for(0, 0).unwrap();
        for t in 0..BLOCK_SIZE as usize {
            assert_eq!(mask[t] >> t & 1, 1, "self bit {t}");
        }
        assert!(set.is_excluded(2, 2));
        assert!(!set.is_excluded(0, 1));
    }

    #[test]
    fn one_sided_input_is_symmetrized() {
        // Atom 3 excludes 40, listed only on atom 3's side.
        let mut list = vec![Vec::new(); 64];
        list[3] = vec![40];
        let set = ExclusionSet::build(&list, 64);
        assert!(set.is_excluded(3, 40));
        assert!(set.is_excluded(40, 3));

        // Cross-block tile (x=1, y=0): row = local of atom 40, bit = local of 3.
        let mask = set.mask_for(1, 0).unwrap();
        assert_eq!(mask[40 - 32] >> 3 & 1, 1);
    }

    #[test]
    fn row_indices_are_monotonic_prefix_sums() {
        let mut list = vec![Vec::new(); 200];
        list[0] = vec![150, 199];
        list[70] = vec![71, 140];
        let set = ExclusionSet::build(&list, 200);
        let rows = set.row_indices();
        assert_eq!(rows.len(), set.num_blocks() as usize + 1);
        assert_eq!(rows[0], 0);
        assert_eq!(*rows.last().unwrap() as usize, set.num_tiles());
        for w in rows.windows(2) {
            assert!(w[0] <= w[1]);
        }
        // Columns ascend within each row.
        for y in 0..set.num_blocks() as usize {
            let row = &set.indices()[rows[y] as usize..rows[y + 1] as usize];
            for w in row.windows(2) {
                assert!(w[0] < w[1]);
            }
            for &x in row {
                assert!(x >= y as u32);
            }
        }
    }

    #[test]
    fn find_rejects_upper_triangular_query() {
        let set = ExclusionSet::build(&vec![Vec::new(); 64], 64);
        let err = find_exclusion_index(0, 1, set.indices(), set.row_indices()).unwrap_err();
        match err {
            EngineError::InvalidExclusionTile { x: 0, y: 1 } => {}
            other => panic!("expected InvalidExclusionTile, got {other:?}"),
        }
    }

    #[test]
    fn find_reports_missing_tile() {
        // Two blocks, no cross-block exclusions: tile (1, 0) is absent.
        let set = ExclusionSet::build(&vec![Vec::new(); 64], 64);
        let err = find_exclusion_index(1, 0, set.indices(), set.row_indices()).unwrap_err();
        match err {
            EngineError::ExclusionTileNotFound { x: 1, y: 0 } => {}
            other => panic!("expected ExclusionTileNotFound, got {other:?}"),
        }
    }

    #[test]
    fn found_position_addresses_the_right_mask() {
        let mut list = vec![Vec::new(); 96];
        list[5] = vec![64];
        list[33] = vec![90];
        let set = ExclusionSet::build(&list, 96);
        // Tiles present: (0,0) (1,1) (2,2) diagonals, (2,0) for 5-64, (2,1) for 33-90.
        let p = find_exclusion_index(2, 0, set.indices(), set.row_indices()).unwrap();
        let mask = &set.masks()[p * BLOCK_SIZE as usize..(p + 1) * BLOCK_SIZE as usize];
        assert_eq!(mask[64 - 64] >> 5 & 1, 1);
        let p = find_exclusion_index(2, 1, set.indices(), set.row_indices()).unwrap();
        let mask = &set.masks()[p * BLOCK_SIZE as usize..(p + 1) * BLOCK_SIZE as usize];
        assert_eq!(mask[90 - 64] >> 1 & 1, 1);
    }

    #[test]
    fn out_of_range_and_self_entries_ignored() {
        let mut list = vec![Vec::new(); 8];
        list[2] = vec![2, 500];
        let set = ExclusionSet::build(&list, 8);
        // Only the always-present diagonal remains.
        assert_eq!(set.num_tiles(), 1);
    }

    #[test]
    fn pairs_map_into_lower_triangle() {
        // tile_flat_index is shared with the neighbor list; sanity-check the
        // exclusion convention maps pairs into the lower triangle.
        let (a, b) = (40u32, 3u32);
        let (x, y) = (block_of(a), block_of(b));
        assert!(x >= y);
        assert_eq!(tile_flat_index(x, y), 1);
    }
}
