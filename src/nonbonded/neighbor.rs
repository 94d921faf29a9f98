// SPDX-License-Identifier: AGPL-3.0-only

//! GPU-resident tile neighbor list.
//!
//! Three-pass build, one compute dispatch per phase, no work done on pairs
//! that fail the coarse test:
//!
//! ```text
//! Pass 1: block_bounds       — per block: center + half-extent box
//! Pass 2: find_tiles         — box/box distance prune + atomic tile append
//! Pass 3: interaction_flags  — exact per-pair cutoff test, one bit per pair
//! ```
//!
//! Pass 2 appends into a fixed-capacity list; the atomic counter keeps
//! counting past capacity, so an overflowed build is detected on readback,
//! capacity grows geometrically, and only pass 2 reruns. Flags are
//! distance-only: exclusions are applied by the interaction kernels, so a
//! kernel compiled without exclusion handling still sees excluded pairs.
//!
//! Buffer handles returned by the accessors are borrows into engine-owned
//! memory and are invalidated by the next capacity growth; callers must not
//! cache them across [`NeighborList::prepare`] calls.

use crate::error::EngineError;
use crate::gpu::GpuContext;
use crate::nonbonded::BLOCK_SIZE;

/// Workgroups per grid-stride dispatch for passes 2 and 3.
const STRIDE_WORKGROUPS: u32 = 256;
const WORKGROUP_SIZE: u32 = 64;

/// Shared WGSL helper: flat lower-triangular tile index -> (x, y).
///
/// The f32 triangular-root estimate is corrected by unit steps, exact for
/// every index below 2^32 (tile spaces up to ~92k blocks). Triangular
/// numbers are evaluated with the even factor halved first so the product
/// never wraps in u32, and `x` is clamped to `TILE_X_MAX` (the largest row
/// whose successor triangular number is still representable; any flat
/// index below 2^32 decodes to a row at or below it).
pub(crate) const WGSL_TILE_DECODE: &str = r#"
const TILE_X_MAX: u32 = 92681u;

fn tri(n: u32) -> u32 {
    return select(n * ((n + 1u) / 2u), (n / 2u) * (n + 1u), (n & 1u) == 0u);
}

fn tile_from_flat(flat: u32) -> vec2<u32> {
    var x = min(u32(floor((sqrt(8.0 * f32(flat) + 1.0) - 1.0) * 0.5)), TILE_X_MAX);
    loop {
        if (tri(x) <= flat) { break; }
        x = x - 1u;
    }
    loop {
        if (x >= TILE_X_MAX || tri(x + 1u) > flat) { break; }
        x = x + 1u;
    }
    return vec2<u32>(x, flat - tri(x));
}
"#;

const WGSL_BLOCK_BOUNDS: &str = r#"
struct Params {
    num_atoms: u32,
    num_blocks: u32,
    periodic: u32,
    _pad: u32,
    box_x: f32,
    box_y: f32,
    box_z: f32,
    _pad2: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> positions: array<f32>;
@group(0) @binding(2) var<storage, read_write> block_centers: array<f32>;
@group(0) @binding(3) var<storage, read_write> block_bounds: array<f32>;

fn load_pos(i: u32) -> vec3<f32> {
    return vec3<f32>(positions[i * 3u], positions[i * 3u + 1u], positions[i * 3u + 2u]);
}

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {
    let b = gid.x;
    if (b >= params.num_blocks) {
        return;
    }
    let first = b * 32u;
    let last = min(first + 32u, params.num_atoms);
    let box_size = vec3<f32>(params.box_x, params.box_y, params.box_z);

    // Reduce relative to the first member atom with min-image deltas, so a
    // block straddling the periodic boundary still gets a tight box.
    let ref_pos = load_pos(first);
    var lo = vec3<f32>(0.0, 0.0, 0.0);
    var hi = vec3<f32>(0.0, 0.0, 0.0);
    for (var i = first + 1u; i < last; i = i + 1u) {
        var d = load_pos(i) - ref_pos;
        if (params.periodic != 0u) {
            d = d - box_size * round(d / box_size);
        }
        lo = min(lo, d);
        hi = max(hi, d);
    }
    var center = ref_pos + 0.5 * (lo + hi);
    if (params.periodic != 0u) {
        center = center - box_size * floor(center / box_size);
    }
    let extent = 0.5 * (hi - lo);
    block_centers[b * 3u] = center.x;
    block_centers[b * 3u + 1u] = center.y;
    block_centers[b * 3u + 2u] = center.z;
    block_bounds[b * 3u] = extent.x;
    block_bounds[b * 3u + 1u] = extent.y;
    block_bounds[b * 3u + 2u] = extent.z;
}
"#;

const WGSL_FIND_TILES_BODY: &str = r#"
struct Params {
    start_tile: u32,
    range_len: u32,
    max_tiles: u32,
    use_cutoff: u32,
    padded_cutoff_sq: f32,
    periodic: u32,
    _pad0: u32,
    _pad1: u32,
    box_x: f32,
    box_y: f32,
    box_z: f32,
    _pad2: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> block_centers: array<f32>;
@group(0) @binding(2) var<storage, read> block_bounds: array<f32>;
@group(0) @binding(3) var<storage, read_write> interaction_count: array<atomic<u32>>;
@group(0) @binding(4) var<storage, read_write> interacting_tiles: array<u32>;

fn load_center(i: u32) -> vec3<f32> {
    return vec3<f32>(block_centers[i * 3u], block_centers[i * 3u + 1u], block_centers[i * 3u + 2u]);
}

fn load_extent(i: u32) -> vec3<f32> {
    return vec3<f32>(block_bounds[i * 3u], block_bounds[i * 3u + 1u], block_bounds[i * 3u + 2u]);
}

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * 64u;
    let box_size = vec3<f32>(params.box_x, params.box_y, params.box_z);
    var t = gid.x;
    loop {
        if (t >= params.range_len) {
            break;
        }
        let flat = params.start_tile + t;
        let tile = tile_from_flat(flat);
        var include = true;
        if (params.use_cutoff != 0u) {
            var d = load_center(tile.x) - load_center(tile.y);
            if (params.periodic != 0u) {
                d = d - box_size * round(d / box_size);
            }
            let ext = load_extent(tile.x) + load_extent(tile.y);
            let gap = max(abs(d) - ext, vec3<f32>(0.0, 0.0, 0.0));
            include = dot(gap, gap) <= params.padded_cutoff_sq;
        }
        if (include) {
            let slot = atomicAdd(&interaction_count[0], 1u);
            // Past capacity the counter still counts: overflow is detected
            // on readback and the pass reruns after growth.
            if (slot < params.max_tiles) {
                interacting_tiles[slot] = flat;
            }
        }
        t = t + stride;
    }
}
"#;

const WGSL_FLAGS_BODY: &str = r#"
struct Params {
    num_atoms: u32,
    use_cutoff: u32,
    periodic: u32,
    max_tiles: u32,
    cutoff_sq: f32,
    box_x: f32,
    box_y: f32,
    box_z: f32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> positions: array<f32>;
@group(0) @binding(2) var<storage, read> interaction_count: array<u32>;
@group(0) @binding(3) var<storage, read> interacting_tiles: array<u32>;
@group(0) @binding(4) var<storage, read_write> interaction_flags: array<u32>;

fn load_pos(i: u32) -> vec3<f32> {
    return vec3<f32>(positions[i * 3u], positions[i * 3u + 1u], positions[i * 3u + 2u]);
}

@compute @workgroup_size(64)
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {
    let stride = nwg.x * 64u;
    let count = min(interaction_count[0], params.max_tiles);
    let total = count * 32u;
    let box_size = vec3<f32>(params.box_x, params.box_y, params.box_z);
    var idx = gid.x;
    loop {
        if (idx >= total) {
            break;
        }
        let slot = idx / 32u;
        let row = idx % 32u;
        let tile = tile_from_flat(interacting_tiles[slot]);
        let i = tile.x * 32u + row;
        var mask = 0u;
        if (i < params.num_atoms) {
            let pi = load_pos(i);
            for (var c = 0u; c < 32u; c = c + 1u) {
                let j = tile.y * 32u + c;
                if (j >= params.num_atoms) {
                    continue;
                }
                if (tile.x == tile.y && c == row) {
                    continue;
                }
                var within = true;
                if (params.use_cutoff != 0u) {
                    var d = pi - load_pos(j);
                    if (params.periodic != 0u) {
                        d = d - box_size * round(d / box_size);
                    }
                    within = dot(d, d) <= params.cutoff_sq;
                }
                if (within) {
                    mask = mask | (1u << c);
                }
            }
        }
        interaction_flags[slot * 32u + row] = mask;
        idx = idx + stride;
    }
}
"#;

/// Configuration captured at neighbor-list construction.
#[derive(Debug, Clone)]
pub struct NeighborListConfig {
    pub num_atoms: usize,
    pub periodic: bool,
    pub box_size: [f32; 3],
    pub use_cutoff: bool,
    /// True cutoff distance used by the exact pair test.
    pub cutoff: f32,
    /// Reuse margin added to the coarse test to amortize rebuild frequency.
    pub padding: f32,
    /// First flat tile index this instance is responsible for.
    pub start_tile: u32,
    /// Number of tiles in this instance's range.
    pub range_len: u32,
}

/// GPU tile neighbor list: block bounds, interacting-tile list with atomic
/// counter, and per-pair interaction flags.
pub struct NeighborList {
    config: NeighborListConfig,
    num_blocks: u32,
    max_tiles: u32,
    last_count: u32,
    /// Bumped on every capacity growth; kernels rebind when it changes.
    generation: u64,

    block_centers: wgpu::Buffer,
    block_bounds: wgpu::Buffer,
    interaction_count: wgpu::Buffer,
    interacting_tiles: wgpu::Buffer,
    interaction_flags: wgpu::Buffer,

    bounds_pipeline: wgpu::ComputePipeline,
    tiles_pipeline: wgpu::ComputePipeline,
    flags_pipeline: wgpu::ComputePipeline,
    bounds_params: wgpu::Buffer,
    tiles_params: wgpu::Buffer,
    flags_params: wgpu::Buffer,
}

fn pack_params(words: &[u32]) -> Vec<u8> {
    bytemuck::cast_slice(words).to_vec()
}

impl NeighborList {
    /// Compile the three passes and allocate tile-indexed storage at
    /// `initial_max_tiles` capacity.
    ///
    /// # Errors
    ///
    /// [`EngineError::KernelCompile`] if a pass shader fails validation
    /// (indicates a build problem, not caller misuse).
    pub fn new(
        gpu: &GpuContext,
        config: NeighborListConfig,
        initial_max_tiles: u32,
    ) -> Result<Self, EngineError> {
        let num_blocks = crate::nonbonded::num_blocks(config.num_atoms);
        let max_tiles = initial_max_tiles.clamp(1, config.range_len.max(1));

        let bounds_src = WGSL_BLOCK_BOUNDS.to_string();
        let tiles_src = format!("{WGSL_TILE_DECODE}{WGSL_FIND_TILES_BODY}");
        let flags_src = format!("{WGSL_TILE_DECODE}{WGSL_FLAGS_BODY}");

        let bounds_pipeline = gpu.create_pipeline(&bounds_src, "nl:block_bounds")?;
        let tiles_pipeline = gpu.create_pipeline(&tiles_src, "nl:find_tiles")?;
        let flags_pipeline = gpu.create_pipeline(&flags_src, "nl:interaction_flags")?;

        let block_centers = gpu.create_output_buffer(num_blocks as usize * 3, "nl:block_centers");
        let block_bounds = gpu.create_output_buffer(num_blocks as usize * 3, "nl:block_bounds");
        let interaction_count = gpu.create_output_buffer(1, "nl:interaction_count");
        let interacting_tiles =
            gpu.create_output_buffer(max_tiles as usize, "nl:interacting_tiles");
        let interaction_flags = gpu.create_output_buffer(
            max_tiles as usize * BLOCK_SIZE as usize,
            "nl:interaction_flags",
        );

        let bounds_params = gpu.create_uniform_buffer(
            &pack_params(&[
                config.num_atoms as u32,
                num_blocks,
                u32::from(config.periodic),
                0,
                config.box_size[0].to_bits(),
                config.box_size[1].to_bits(),
                config.box_size[2].to_bits(),
                0,
            ]),
            "nl:bounds_params",
        );
        let tiles_params = gpu.create_uniform_buffer(&[0u8; 48], "nl:tiles_params");
        let flags_params = gpu.create_uniform_buffer(&[0u8; 32], "nl:flags_params");

        let mut list = Self {
            config,
            num_blocks,
            max_tiles,
            last_count: 0,
            generation: 0,
            block_centers,
            block_bounds,
            interaction_count,
            interacting_tiles,
            interaction_flags,
            bounds_pipeline,
            tiles_pipeline,
            flags_pipeline,
            bounds_params,
            tiles_params,
            flags_params,
        };
        list.write_pass_params(gpu);
        Ok(list)
    }

    fn write_pass_params(&mut self, gpu: &GpuContext) {
        let c = &self.config;
        let padded = c.cutoff + c.padding;
        gpu.queue().write_buffer(
            &self.tiles_params,
            0,
            &pack_params(&[
                c.start_tile,
                c.range_len,
                self.max_tiles,
                u32::from(c.use_cutoff),
                (padded * padded).to_bits(),
                u32::from(c.periodic),
                0,
                0,
                c.box_size[0].to_bits(),
                c.box_size[1].to_bits(),
                c.box_size[2].to_bits(),
                0,
            ]),
        );
        gpu.queue().write_buffer(
            &self.flags_params,
            0,
            &pack_params(&[
                c.num_atoms as u32,
                u32::from(c.use_cutoff),
                u32::from(c.periodic),
                self.max_tiles,
                (c.cutoff * c.cutoff).to_bits(),
                c.box_size[0].to_bits(),
                c.box_size[1].to_bits(),
                c.box_size[2].to_bits(),
            ]),
        );
    }

    /// Grow tile-indexed storage to hold at least `needed` tiles.
    /// Invalidates previously obtained buffer handles.
    fn update_capacity(&mut self, gpu: &GpuContext, needed: u32) {
        let new_cap = needed
            .max(self.max_tiles.saturating_mul(2))
            .min(self.config.range_len.max(1));
        log::debug!(
            "neighbor list overflow: {} tiles > capacity {}, growing to {}",
            needed,
            self.max_tiles,
            new_cap
        );
        self.max_tiles = new_cap;
        self.interacting_tiles =
            gpu.create_output_buffer(new_cap as usize, "nl:interacting_tiles");
        self.interaction_flags =
            gpu.create_output_buffer(new_cap as usize * BLOCK_SIZE as usize, "nl:interaction_flags");
        self.generation += 1;
        self.write_pass_params(gpu);
    }

    /// Rebuild the neighbor list from current positions: bounds, discovery
    /// (with overflow detect-grow-retry), then exact per-pair flags.
    ///
    /// Returns the number of interacting tiles.
    ///
    /// # Errors
    ///
    /// [`EngineError::Readback`] if the interaction counter cannot be read.
    pub fn prepare(&mut self, gpu: &GpuContext, positions: &wgpu::Buffer) -> Result<u32, EngineError> {
        // Pass 1: block bounds.
        let bounds_bg = gpu.create_bind_group(
            &self.bounds_pipeline,
            &[
                &self.bounds_params,
                positions,
                &self.block_centers,
                &self.block_bounds,
            ],
            "nl:bg_bounds",
        );
        gpu.dispatch(
            &self.bounds_pipeline,
            &bounds_bg,
            self.num_blocks.div_ceil(WORKGROUP_SIZE),
            "nl:block_bounds",
        );

        // Pass 2: discovery, retried after growth on overflow. Growth is
        // geometric and capped by the range length, so this terminates.
        let count = loop {
            gpu.zero_buffer(&self.interaction_count, 1);
            let tiles_bg = gpu.create_bind_group(
                &self.tiles_pipeline,
                &[
                    &self.tiles_params,
                    &self.block_centers,
                    &self.block_bounds,
                    &self.interaction_count,
                    &self.interacting_tiles,
                ],
                "nl:bg_tiles",
            );
            gpu.dispatch(
                &self.tiles_pipeline,
                &tiles_bg,
                STRIDE_WORKGROUPS,
                "nl:find_tiles",
            );
            let count = gpu.read_back_u32(&self.interaction_count, 1)?[0];
            if count <= self.max_tiles {
                break count;
            }
            self.update_capacity(gpu, count);
        };

        // Pass 3: exact pair flags for the discovered tiles.
        let flags_bg = gpu.create_bind_group(
            &self.flags_pipeline,
            &[
                &self.flags_params,
                positions,
                &self.interaction_count,
                &self.interacting_tiles,
                &self.interaction_flags,
            ],
            "nl:bg_flags",
        );
        gpu.dispatch(
            &self.flags_pipeline,
            &flags_bg,
            STRIDE_WORKGROUPS,
            "nl:interaction_flags",
        );

        self.last_count = count;
        log::debug!("neighbor list: {count} interacting tiles (capacity {})", self.max_tiles);
        Ok(count)
    }

    pub fn config(&self) -> &NeighborListConfig {
        &self.config
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// Current tile capacity.
    pub fn max_tiles(&self) -> u32 {
        self.max_tiles
    }

    /// Interacting-tile count from the most recent [`NeighborList::prepare`].
    pub fn interaction_count_host(&self) -> u32 {
        self.last_count
    }

    /// Resize generation; changes whenever buffer handles are invalidated.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Per-block bounding-volume centers (3 f32 per block).
    pub fn block_centers(&self) -> &wgpu::Buffer {
        &self.block_centers
    }

    /// Per-block half extents (3 f32 per block).
    pub fn block_bounds(&self) -> &wgpu::Buffer {
        &self.block_bounds
    }

    /// Single-element tile counter (u32).
    pub fn interaction_count(&self) -> &wgpu::Buffer {
        &self.interaction_count
    }

    /// Flat indices of discovered tiles, valid in `0..interaction_count`.
    pub fn interacting_tiles(&self) -> &wgpu::Buffer {
        &self.interacting_tiles
    }

    /// Per-tile pair bitmasks (`BLOCK_SIZE` u32 per tile slot).
    pub fn interaction_flags(&self) -> &wgpu::Buffer {
        &self.interaction_flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::validate_wgsl;

    #[test]
    fn block_bounds_shader_validates() {
        assert!(validate_wgsl(WGSL_BLOCK_BOUNDS).is_ok());
    }

    #[test]
    fn find_tiles_shader_validates() {
        let src = format!("{WGSL_TILE_DECODE}{WGSL_FIND_TILES_BODY}");
        assert!(validate_wgsl(&src).is_ok());
    }

    #[test]
    fn flags_shader_validates() {
        let src = format!("{WGSL_TILE_DECODE}{WGSL_FLAGS_BODY}");
        assert!(validate_wgsl(&src).is_ok());
    }

    #[test]
    fn params_pack_to_expected_sizes() {
        // Uniform blocks are 16-byte aligned: 32 / 48 / 32 bytes.
        assert_eq!(pack_params(&[0; 8]).len(), 32);
        assert_eq!(pack_params(&[0; 12]).len(), 48);
    }

    #[test]
    fn device_decode_is_exact_at_large_indices() {
        use crate::nonbonded::{tile_flat_index, tile_from_flat};

        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        // Rows past 65535 make the naive x*(x+1) product wrap in u32; the
        // decode must stay exact all the way to the last representable row.
        let mut flats: Vec<u32> = Vec::new();
        for x in [0u32, 1, 31, 65534, 65535, 65536, 65537, 80000, 92680, 92681] {
            for y in [0, x / 2, x] {
                let flat = tile_flat_index(x, y);
                if let Ok(flat) = u32::try_from(flat) {
                    flats.push(flat);
                }
            }
        }
        flats.push(u32::MAX - 1);
        flats.push(u32::MAX);
        flats.dedup();

        let src = format!(
            r#"{WGSL_TILE_DECODE}
@group(0) @binding(0) var<storage, read> flats: array<u32>;
@group(0) @binding(1) var<storage, read_write> out: array<u32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) gid: vec3<u32>) {{
    if (gid.x >= arrayLength(&flats)) {{
        return;
    }}
    let t = tile_from_flat(flats[gid.x]);
    out[gid.x * 2u] = t.x;
    out[gid.x * 2u + 1u] = t.y;
}}
"#
        );
        let pipeline = gpu.create_pipeline(&src, "test:tile_decode").unwrap();
        let flats_buf = gpu.create_u32_buffer(&flats, "test:flats");
        let out_buf = gpu.create_output_buffer(flats.len() * 2, "test:decoded");
        let bg = gpu.create_bind_group(&pipeline, &[&flats_buf, &out_buf], "test:bg");
        gpu.dispatch(
            &pipeline,
            &bg,
            (flats.len() as u32).div_ceil(WORKGROUP_SIZE),
            "test:tile_decode",
        );
        let decoded = gpu.read_back_u32(&out_buf, flats.len() * 2).unwrap();
        for (k, &flat) in flats.iter().enumerate() {
            let (x, y) = tile_from_flat(u64::from(flat));
            assert_eq!(
                (decoded[2 * k], decoded[2 * k + 1]),
                (x, y),
                "flat index {flat}"
            );
        }
    }
}
