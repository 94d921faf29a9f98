// SPDX-License-Identifier: AGPL-3.0-only

//! CPU mirror of the tile pipeline, for validation and adapter-free use.
//!
//! Follows the same three phases as the GPU build (block bounds, coarse
//! tile prune, exact per-pair flags) over the same tile enumeration and
//! exclusion encoding, evaluating interactions through a caller closure
//! instead of a synthesized kernel. Math is f64 throughout, so agreement
//! with the GPU path is bounded by the device's f32 arithmetic plus the
//! fixed-point force resolution, not by this module.

use crate::nonbonded::exclusions::ExclusionSet;
use crate::nonbonded::{num_blocks, tile_from_flat, BLOCK_SIZE};
use rayon::prelude::*;

/// Minimum-image displacement `a - b`.
fn min_image(a: [f64; 3], b: [f64; 3], periodic: bool, box_size: [f64; 3]) -> [f64; 3] {
    let mut d = [a[0] - b[0], a[1] - b[1], a[2] - b[2]];
    if periodic {
        for k in 0..3 {
            d[k] -= box_size[k] * (d[k] / box_size[k]).round();
        }
    }
    d
}

/// Host-side counterpart of the GPU engine for one tile range.
#[derive(Debug, Clone)]
pub struct ReferenceEngine {
    pub num_atoms: usize,
    pub periodic: bool,
    pub box_size: [f64; 3],
    pub use_cutoff: bool,
    pub cutoff: f64,
    /// Coarse-test margin, matching the GPU list's reuse padding.
    pub padding: f64,
    pub start_tile: u64,
    pub range_len: u64,
}

impl ReferenceEngine {
    /// Full-range engine with the given geometry.
    pub fn new(num_atoms: usize, periodic: bool, box_size: [f64; 3], cutoff: Option<f64>) -> Self {
        let nb = num_blocks(num_atoms);
        Self {
            num_atoms,
            periodic,
            box_size,
            use_cutoff: cutoff.is_some(),
            cutoff: cutoff.unwrap_or(0.0),
            padding: cutoff.unwrap_or(0.0) * 0.1,
            start_tile: 0,
            range_len: crate::nonbonded::tile_count(nb),
        }
    }

    /// Per-block bounding boxes: center and half-extent, reduced with
    /// min-image deltas against the block's first atom so boxes straddling
    /// the periodic boundary stay tight.
    pub fn block_bounds(&self, positions: &[[f64; 3]]) -> (Vec<[f64; 3]>, Vec<[f64; 3]>) {
        let nb = num_blocks(self.num_atoms) as usize;
        let mut centers = vec![[0.0; 3]; nb];
        let mut extents = vec![[0.0; 3]; nb];
        for b in 0..nb {
            let first = b * BLOCK_SIZE as usize;
            let last = (first + BLOCK_SIZE as usize).min(self.num_atoms);
            let ref_pos = positions[first];
            let mut lo = [0.0f64; 3];
            let mut hi = [0.0f64; 3];
            for &p in &positions[first + 1..last] {
                let d = min_image(p, ref_pos, self.periodic, self.box_size);
                for k in 0..3 {
                    lo[k] = lo[k].min(d[k]);
                    hi[k] = hi[k].max(d[k]);
                }
            }
            for k in 0..3 {
                let mut c = ref_pos[k] + 0.5 * (lo[k] + hi[k]);
                if self.periodic {
                    c -= self.box_size[k] * (c / self.box_size[k]).floor();
                }
                centers[b][k] = c;
                extents[b][k] = 0.5 * (hi[k] - lo[k]);
            }
        }
        (centers, extents)
    }

    /// Coarse prune over this engine's tile range: flat indices of tiles
    /// whose block boxes come within the padded cutoff.
    pub fn interacting_tiles(&self, positions: &[[f64; 3]]) -> Vec<u64> {
        let (centers, extents) = self.block_bounds(positions);
        let padded = self.cutoff + self.padding;
        let padded_sq = padded * padded;
        (self.start_tile..self.start_tile + self.range_len)
            .into_par_iter()
            .filter(|&flat| {
                if !self.use_cutoff {
                    return true;
                }
                let (x, y) = tile_from_flat(flat);
                let d = min_image(
                    centers[x as usize],
                    centers[y as usize],
                    self.periodic,
                    self.box_size,
                );
                let mut gap_sq = 0.0;
                for k in 0..3 {
                    let g = (d[k].abs() - extents[x as usize][k] - extents[y as usize][k]).max(0.0);
                    gap_sq += g * g;
                }
                gap_sq <= padded_sq
            })
            .collect()
    }

    /// Exact per-pair flags for one tile: bit `c` of word `row` set when
    /// atom `x*32+row` and atom `y*32+c` are within the true cutoff.
    /// Distance-only, exclusions are the evaluator's concern.
    pub fn tile_flags(&self, flat: u64, positions: &[[f64; 3]]) -> [u32; BLOCK_SIZE as usize] {
        let (x, y) = tile_from_flat(flat);
        let cutoff_sq = self.cutoff * self.cutoff;
        let mut flags = [0u32; BLOCK_SIZE as usize];
        for row in 0..BLOCK_SIZE {
            let i = (x * BLOCK_SIZE + row) as usize;
            if i >= self.num_atoms {
                continue;
            }
            for c in 0..BLOCK_SIZE {
                let j = (y * BLOCK_SIZE + c) as usize;
                if j >= self.num_atoms || (x == y && c == row) {
                    continue;
                }
                if self.use_cutoff {
                    let d = min_image(positions[i], positions[j], self.periodic, self.box_size);
                    if d[0] * d[0] + d[1] * d[1] + d[2] * d[2] > cutoff_sq {
                        continue;
                    }
                }
                flags[row as usize] |= 1 << c;
            }
        }
        flags
    }

    /// Evaluate an interaction over the pruned tile list.
    ///
    /// `pair` receives `(i, j, r)` for each surviving unordered pair and
    /// returns `(energy, dedr)`; forces apply as `f_i += delta * dedr`,
    /// `f_j -= delta * dedr` with `delta = pos_i - pos_j`, matching the
    /// symmetric kernel convention.
    pub fn evaluate<F>(
        &self,
        positions: &[[f64; 3]],
        exclusions: Option<&ExclusionSet>,
        pair: F,
    ) -> (Vec<[f64; 3]>, f64)
    where
        F: Fn(usize, usize, f64) -> (f64, f64) + Sync,
    {
        let tiles = self.interacting_tiles(positions);
        tiles
            .par_iter()
            .fold(
                || (vec![[0.0f64; 3]; self.num_atoms], 0.0f64),
                |(mut forces, mut energy), &flat| {
                    let (x, y) = tile_from_flat(flat);
                    let flags = self.tile_flags(flat, positions);
                    for row in 0..BLOCK_SIZE {
                        let i = (x * BLOCK_SIZE + row) as usize;
                        let mut mask = flags[row as usize];
                        if let Some(excl) = exclusions {
                            if let Ok(m) = excl.mask_for(x, y) {
                                mask &= !m[row as usize];
                            }
                        }
                        // Diagonal tiles carry both orientations in the
                        // flags; keep c < row's mirror out by evaluating
                        // each unordered pair from the higher local index.
                        if x == y {
                            mask &= (1u32 << row) - 1;
                        }
                        for c in 0..BLOCK_SIZE {
                            if mask >> c & 1 == 0 {
                                continue;
                            }
                            let j = (y * BLOCK_SIZE + c) as usize;
                            let d =
                                min_image(positions[i], positions[j], self.periodic, self.box_size);
                            let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                            let (e, dedr) = pair(i, j, r);
                            energy += e;
                            for k in 0..3 {
                                forces[i][k] += d[k] * dedr;
                                forces[j][k] -= d[k] * dedr;
                            }
                        }
                    }
                    (forces, energy)
                },
            )
            .reduce(
                || (vec![[0.0f64; 3]; self.num_atoms], 0.0f64),
                |(mut fa, ea), (fb, eb)| {
                    for (a, b) in fa.iter_mut().zip(&fb) {
                        for k in 0..3 {
                            a[k] += b[k];
                        }
                    }
                    (fa, ea + eb)
                },
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonbonded::tile_flat_index;

    fn line_positions(n: usize, spacing: f64) -> Vec<[f64; 3]> {
        (0..n).map(|i| [i as f64 * spacing, 0.0, 0.0]).collect()
    }

    #[test]
    fn coarse_prune_keeps_every_in_cutoff_pair() {
        // Pseudo-random cloud; every pair within the cutoff must land in a
        // surviving tile.
        let n = 100;
        let mut positions = Vec::with_capacity(n);
        let mut s = 0x2545f4914f6cdd1du64;
        for _ in 0..n {
            let mut coord = [0.0; 3];
            for c in &mut coord {
                s ^= s << 13;
                s ^= s >> 7;
                s ^= s << 17;
                *c = (s % 1000) as f64 / 100.0;
            }
            positions.push(coord);
        }
        let engine = ReferenceEngine::new(n, false, [0.0; 3], Some(2.0));
        let tiles: std::collections::HashSet<u64> =
            engine.interacting_tiles(&positions).into_iter().collect();
        for i in 0..n {
            for j in 0..i {
                let d = min_image(positions[i], positions[j], false, [0.0; 3]);
                let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                if r2 <= 4.0 {
                    let (a, b) = (i as u32, j as u32);
                    let x = crate::nonbonded::block_of(a.max(b));
                    let y = crate::nonbonded::block_of(a.min(b));
                    assert!(
                        tiles.contains(&tile_flat_index(x, y)),
                        "pair ({i},{j}) at r2={r2} pruned away"
                    );
                }
            }
        }
    }

    #[test]
    fn no_cutoff_keeps_all_tiles() {
        let engine = ReferenceEngine::new(64, false, [0.0; 3], None);
        let positions = line_positions(64, 10.0);
        // 2 blocks -> 3 tiles.
        assert_eq!(engine.interacting_tiles(&positions).len(), 3);
    }

    #[test]
    fn distant_blocks_are_pruned() {
        // Two 32-atom clusters separated far beyond the cutoff: only the
        // two diagonal tiles survive.
        let mut positions = line_positions(32, 0.01);
        positions.extend((0..32).map(|i| [1000.0 + i as f64 * 0.01, 0.0, 0.0]));
        let engine = ReferenceEngine::new(64, false, [0.0; 3], Some(1.0));
        let tiles = engine.interacting_tiles(&positions);
        assert_eq!(tiles, vec![tile_flat_index(0, 0), tile_flat_index(1, 1)]);
    }

    #[test]
    fn flags_respect_exact_cutoff() {
        // Atoms 0 and 1 within the cutoff, atom 2 beyond it.
        let positions = vec![[0.0, 0.0, 0.0], [0.5, 0.0, 0.0], [3.0, 0.0, 0.0]];
        let engine = ReferenceEngine::new(3, false, [0.0; 3], Some(1.0));
        let flags = engine.tile_flags(0, &positions);
        assert_eq!(flags[0], 0b010);
        assert_eq!(flags[1], 0b001);
        assert_eq!(flags[2], 0);
    }

    #[test]
    fn periodic_wraparound_pair_is_found() {
        // Across the boundary of a 10-unit box: separation 0.2, not 9.8.
        let positions = vec![[0.1, 5.0, 5.0], [9.9, 5.0, 5.0]];
        let engine = ReferenceEngine::new(2, true, [10.0; 3], Some(1.0));
        let flags = engine.tile_flags(0, &positions);
        assert_eq!(flags[0] & 0b10, 0b10);
        let (forces, energy) = engine.evaluate(&positions, None, |_, _, r| (1.0 / r, 0.0));
        assert!((energy - 5.0).abs() < 1e-9);
        assert_eq!(forces.len(), 2);
    }

    #[test]
    fn forces_sum_to_zero() {
        let positions = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.2, 0.0],
            [0.3, 1.1, 0.4],
            [1.2, 0.9, 0.8],
        ];
        let engine = ReferenceEngine::new(4, false, [0.0; 3], Some(5.0));
        let (forces, _) = engine.evaluate(&positions, None, |_, _, r| {
            let inv_r = 1.0 / r;
            (inv_r, inv_r * inv_r * inv_r)
        });
        for k in 0..3 {
            let total: f64 = forces.iter().map(|f| f[k]).sum();
            assert!(total.abs() < 1e-12, "net force component {k} = {total}");
        }
    }

    #[test]
    fn each_pair_evaluated_once() {
        // Count evaluations with a side-channel-free trick: energy 1 per
        // pair must total n*(n-1)/2 without a cutoff.
        let n = 50;
        let positions = line_positions(n, 0.5);
        let engine = ReferenceEngine::new(n, false, [0.0; 3], None);
        let (_, energy) = engine.evaluate(&positions, None, |_, _, _| (1.0, 0.0));
        assert!((energy - (n * (n - 1) / 2) as f64).abs() < 1e-9);
    }

    #[test]
    fn exclusions_suppress_pairs() {
        let positions = vec![[0.0; 3], [0.4, 0.0, 0.0], [0.8, 0.0, 0.0]];
        let excl = ExclusionSet::build(&[vec![1], vec![0, 2], vec![1]], 3);
        let engine = ReferenceEngine::new(3, false, [0.0; 3], Some(2.0));
        let (_, energy) = engine.evaluate(&positions, Some(&excl), |_, _, _| (1.0, 0.0));
        // Only the 0-2 pair survives.
        assert!((energy - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tile_range_restriction() {
        let n = 96; // 3 blocks, 6 tiles
        let positions = line_positions(n, 0.1);
        let mut engine = ReferenceEngine::new(n, false, [0.0; 3], None);
        engine.start_tile = 2;
        engine.range_len = 3;
        let tiles = engine.interacting_tiles(&positions);
        assert_eq!(tiles, vec![2, 3, 4]);
    }
}
