// SPDX-License-Identifier: AGPL-3.0-only

//! Tile-based nonbonded interaction engine.
//!
//! Particles are grouped into fixed-size blocks of [`BLOCK_SIZE`]; an
//! unordered pair of blocks `(x, y)` with `x >= y` is a *tile*, the unit of
//! neighbor-list discovery and kernel work. The engine maintains a compact
//! list of tiles that may contain interacting pairs, a per-pair exclusion
//! encoding shared by every registered force term, and one synthesized GPU
//! kernel evaluating all default-kernel terms over that list.
//!
//! Per step: [`engine::NonbondedEngine::prepare_interactions`] rebuilds the
//! neighbor list from current positions, then
//! [`engine::NonbondedEngine::compute_interactions`] launches the combined
//! kernel. Collaborator kernels created via
//! [`engine::NonbondedEngine::create_interaction_kernel`] share the same
//! spatial decomposition.

pub mod engine;
pub mod exclusions;
pub mod kernel;
pub mod neighbor;
pub mod reference;

use std::sync::Arc;

/// Atoms per block — the tile edge, matched to the hardware parallel width.
pub const BLOCK_SIZE: u32 = 32;

/// Block index owning atom `atom`.
#[inline]
pub fn block_of(atom: u32) -> u32 {
    atom / BLOCK_SIZE
}

/// Number of blocks covering `num_atoms` atoms.
#[inline]
pub fn num_blocks(num_atoms: usize) -> u32 {
    (num_atoms as u32).div_ceil(BLOCK_SIZE)
}

/// Total tiles in the lower-triangular enumeration: `nb * (nb + 1) / 2`.
#[inline]
pub fn tile_count(num_blocks: u32) -> u64 {
    u64::from(num_blocks) * (u64::from(num_blocks) + 1) / 2
}

/// Flat index of tile `(x, y)`, `x >= y`.
#[inline]
pub fn tile_flat_index(x: u32, y: u32) -> u64 {
    debug_assert!(x >= y);
    u64::from(x) * (u64::from(x) + 1) / 2 + u64::from(y)
}

/// Inverse of [`tile_flat_index`]: recover `(x, y)` from a flat tile index.
///
/// The float estimate of the triangular root is corrected by at most one
/// step in either direction, so the result is exact for every index that
/// fits the tile space.
#[inline]
pub fn tile_from_flat(flat: u64) -> (u32, u32) {
    let mut x = ((((8.0 * flat as f64 + 1.0).sqrt() - 1.0) / 2.0).floor()) as u64;
    while x * (x + 1) / 2 > flat {
        x -= 1;
    }
    while (x + 1) * (x + 2) / 2 <= flat {
        x += 1;
    }
    let y = flat - x * (x + 1) / 2;
    (x as u32, y as u32)
}

/// Total particle count and periodicity of the simulated system.
#[derive(Debug, Clone)]
pub struct SystemDescription {
    /// Number of particles, indexed `0..num_atoms`.
    pub num_atoms: usize,
    /// Whether periodic boundary conditions apply.
    pub periodic: bool,
    /// Periodic box edge lengths (ignored when `periodic` is false).
    pub box_size: [f64; 3],
}

/// One device-resident per-particle array (or auxiliary argument buffer)
/// that a synthesized kernel may reference by name.
///
/// The backing buffer handle is shared: the engine may replace the
/// allocation on resize while the registered identity (name, type) stays
/// fixed. No size validation is performed — matching the declared component
/// layout to the actual buffer contents is the caller's responsibility.
#[derive(Clone)]
pub struct ParameterInfo {
    name: String,
    component_type: String,
    num_components: usize,
    buffer: Arc<wgpu::Buffer>,
}

impl ParameterInfo {
    /// `component_type` is a WGSL scalar type (`"f32"`, `"u32"`, `"i32"`);
    /// `num_components` in `1..=4` selects scalar vs. `vecN` layout.
    pub fn new(
        name: impl Into<String>,
        component_type: impl Into<String>,
        num_components: usize,
        buffer: Arc<wgpu::Buffer>,
    ) -> Self {
        Self {
            name: name.into(),
            component_type: component_type.into(),
            num_components,
            buffer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn component_type(&self) -> &str {
        &self.component_type
    }

    pub fn num_components(&self) -> usize {
        self.num_components
    }

    /// Composite WGSL type: the component type suffixed into a vector when
    /// there is more than one component.
    pub fn wgsl_type(&self) -> String {
        composite_type_tag(&self.component_type, self.num_components)
    }

    /// Per-element byte size as laid out in a WGSL storage array.
    /// `vec3` elements occupy a 16-byte stride.
    pub fn element_size(&self) -> usize {
        match self.num_components {
            1 => 4,
            2 => 8,
            _ => 16,
        }
    }

    pub fn buffer(&self) -> &Arc<wgpu::Buffer> {
        &self.buffer
    }

    /// Swap the backing allocation, preserving the registered identity.
    pub fn set_buffer(&mut self, buffer: Arc<wgpu::Buffer>) {
        self.buffer = buffer;
    }
}

impl std::fmt::Debug for ParameterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterInfo")
            .field("name", &self.name)
            .field("type", &self.wgsl_type())
            .finish()
    }
}

/// Scalar type plus component count → composite WGSL type tag.
pub(crate) fn composite_type_tag(component_type: &str, num_components: usize) -> String {
    if num_components == 1 {
        component_type.to_string()
    } else {
        format!("vec{num_components}<{component_type}>")
    }
}

/// One registered nonbonded contribution to the default kernel.
#[derive(Debug, Clone)]
pub struct InteractionTerm {
    /// Whether a cutoff distance applies to this term.
    pub uses_cutoff: bool,
    /// Whether periodic boundary conditions apply.
    pub uses_periodic: bool,
    /// Whether the shared exclusion list applies.
    pub uses_exclusions: bool,
    /// Excluded partners per atom for this term. Forwarded into the
    /// engine's shared exclusion set when `uses_exclusions` is set; every
    /// exclusion-using term must carry the same list.
    pub exclusion_list: Vec<Vec<u32>>,
    /// Cutoff distance (ignored when `uses_cutoff` is false).
    pub cutoff_distance: f64,
    /// WGSL statements evaluating the interaction. See
    /// [`kernel::KernelSynthesizer`] for the in-scope symbol contract.
    pub source: String,
    /// Force group tag for staged evaluation by the simulation driver.
    pub force_group: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_arithmetic() {
        assert_eq!(num_blocks(1), 1);
        assert_eq!(num_blocks(32), 1);
        assert_eq!(num_blocks(33), 2);
        assert_eq!(block_of(0), 0);
        assert_eq!(block_of(31), 0);
        assert_eq!(block_of(32), 1);
    }

    #[test]
    fn tile_counts() {
        assert_eq!(tile_count(1), 1);
        assert_eq!(tile_count(2), 3);
        assert_eq!(tile_count(100), 5050);
    }

    #[test]
    fn flat_index_enumeration_order() {
        // (0,0) (1,0) (1,1) (2,0) (2,1) (2,2) ...
        assert_eq!(tile_flat_index(0, 0), 0);
        assert_eq!(tile_flat_index(1, 0), 1);
        assert_eq!(tile_flat_index(1, 1), 2);
        assert_eq!(tile_flat_index(2, 0), 3);
        assert_eq!(tile_flat_index(2, 2), 5);
    }

    #[test]
    fn flat_index_round_trip() {
        for nb in [1u32, 2, 3, 7, 64, 1000] {
            let total = tile_count(nb);
            // Exhaustive for small spaces, strided for large ones.
            let step = (total / 997).max(1);
            let mut flat = 0;
            while flat < total {
                let (x, y) = tile_from_flat(flat);
                assert!(x >= y);
                assert!(x < nb);
                assert_eq!(tile_flat_index(x, y), flat);
                flat += step;
            }
        }
    }

    #[test]
    fn composite_type_tags() {
        assert_eq!(composite_type_tag("f32", 1), "f32");
        assert_eq!(composite_type_tag("f32", 4), "vec4<f32>");
        assert_eq!(composite_type_tag("u32", 2), "vec2<u32>");
    }
}
