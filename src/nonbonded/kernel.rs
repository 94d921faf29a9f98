// SPDX-License-Identifier: AGPL-3.0-only

//! Runtime synthesis of the nonbonded interaction kernel.
//!
//! Callers supply only the WGSL statements evaluating one interaction; the
//! synthesizer wraps them in the tile-walk skeleton that loads positions,
//! walks the interacting-tile list, applies interaction flags and exclusion
//! masks, and accumulates forces and energy. Composition is a small code
//! generator over typed declarations, not string patching: every referenced
//! symbol must be declared, and the assembled source is validated by naga
//! before the device compiles it.
//!
//! ## Fragment contract
//!
//! A fragment is a sequence of WGSL statements executed once per candidate
//! ordered pair `(1, 2)`. In scope:
//!
//! - `r2`, `r`, `inv_r`: squared / plain / inverse pair distance
//! - `delta`: `vec3<f32>`, minimum-image `pos1 - pos2`
//! - `pos1`, `pos2`: particle positions
//! - `NAME1` / `NAME2` for every parameter registered with the kernel
//! - every registered argument, as a module-scope array it may index
//! - `temp_energy`, `dedr`: accumulators the fragment must *add* to
//!
//! `temp_energy` is the full energy of the unordered pair in this
//! orientation; `dedr` is the force factor applied as
//! `force_on_1 += delta * dedr`. Each ordered evaluation contributes half
//! its `temp_energy`; symmetric kernels evaluate one orientation per
//! off-diagonal pair, double the energy share, and apply Newton's third law
//! instead of the mirrored evaluation.
//!
//! Forces accumulate in fixed point (`atomic<i32>`, scale 2^20) because
//! WGSL has no floating-point atomics; the host decodes on readback.

use crate::error::EngineError;
use crate::gpu::GpuContext;
use crate::nonbonded::neighbor::{NeighborList, WGSL_TILE_DECODE};
use crate::nonbonded::ParameterInfo;
use std::collections::HashSet;

/// Fixed-point scale for force accumulation: 2^20 gives ~1e-6 resolution
/// over a ±2048 force range in engine units.
pub const FORCE_SCALE: f64 = 1_048_576.0;

/// Workgroup width of interaction kernels (one tile row per invocation).
pub const FORCE_THREAD_BLOCK_SIZE: u32 = 32;

/// Workgroups launched per interaction-kernel dispatch; tiles are walked
/// grid-stride, energy slots are one per launched invocation.
pub const NUM_FORCE_THREAD_BLOCKS: u32 = 128;

/// Decode one fixed-point force accumulator word.
#[inline]
pub fn fixed_to_force(raw: i32) -> f64 {
    f64::from(raw) / FORCE_SCALE
}

/// WGSL keywords, types, and builtins legal inside a fragment without
/// declaration.
const WGSL_ALLOWED: &[&str] = &[
    // keywords / control flow
    "let", "var", "const", "fn", "return", "if", "else", "for", "while", "loop", "break",
    "continue", "switch", "case", "default", "true", "false", "discard", "continuing",
    // types
    "bool", "f32", "i32", "u32", "vec2", "vec3", "vec4", "mat2x2", "mat3x3", "mat4x4", "array",
    // builtins
    "abs", "acos", "asin", "atan", "atan2", "ceil", "clamp", "cos", "cosh", "cross", "degrees",
    "distance", "dot", "exp", "exp2", "floor", "fma", "fract", "inverseSqrt", "length", "log",
    "log2", "max", "min", "mix", "normalize", "pow", "radians", "round", "saturate", "select",
    "sign", "sin", "sinh", "smoothstep", "sqrt", "step", "tan", "tanh", "trunc", "arrayLength",
];

/// Symbols the skeleton always has in scope for fragments.
const CONTRACT_SYMBOLS: &[&str] = &["r", "r2", "inv_r", "delta", "pos1", "pos2", "temp_energy", "dedr"];

/// Split a fragment into identifier tokens, skipping numeric literals and
/// member accesses (`.x`, swizzles).
fn fragment_identifiers(fragment: &str) -> Vec<&str> {
    let bytes = fragment.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() || c == '_' {
            // Identifier start only if the previous char is not part of a
            // word or number (so `0x1f` and `1u` are skipped).
            let prev = if i == 0 { None } else { Some(bytes[i - 1] as char) };
            let word_start = !matches!(prev, Some(p) if p.is_ascii_alphanumeric() || p == '_');
            let start = i;
            while i < bytes.len() && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
            {
                i += 1;
            }
            if !word_start {
                continue;
            }
            let mut back = start;
            while back > 0 && (bytes[back - 1] as char).is_ascii_whitespace() {
                back -= 1;
            }
            if back > 0 && bytes[back - 1] == b'.' {
                continue;
            }
            out.push(&fragment[start..i]);
        } else {
            i += 1;
        }
    }
    out
}

/// Check every identifier a fragment references against the declared
/// symbol table. Locals the fragment itself introduces (the identifier
/// after `let`/`var`/`const`) join the table as the scan proceeds.
///
/// # Errors
///
/// [`EngineError::UndeclaredSymbol`] naming the first unknown identifier.
fn check_fragment_symbols(fragment: &str, declared: &HashSet<String>) -> Result<(), EngineError> {
    let mut locals: HashSet<&str> = HashSet::new();
    let mut declaring = false;
    for ident in fragment_identifiers(fragment) {
        if declaring {
            locals.insert(ident);
            declaring = false;
            continue;
        }
        if matches!(ident, "let" | "var" | "const") {
            declaring = true;
            continue;
        }
        if !declared.contains(ident) && !locals.contains(ident) && !WGSL_ALLOWED.contains(&ident) {
            return Err(EngineError::UndeclaredSymbol(ident.to_string()));
        }
    }
    Ok(())
}

/// Composes interaction fragments and typed declarations into one WGSL
/// compute shader.
pub struct KernelSynthesizer {
    fragments: Vec<String>,
    /// (name, wgsl type) per registered per-particle parameter.
    params: Vec<(String, String)>,
    /// (name, wgsl type) per registered auxiliary argument array.
    arguments: Vec<(String, String)>,
    use_exclusions: bool,
    is_symmetric: bool,
}

impl KernelSynthesizer {
    pub fn new(use_exclusions: bool, is_symmetric: bool) -> Self {
        Self {
            fragments: Vec::new(),
            params: Vec::new(),
            arguments: Vec::new(),
            use_exclusions,
            is_symmetric,
        }
    }

    pub fn add_fragment(&mut self, source: &str) {
        self.fragments.push(source.to_string());
    }

    pub fn add_parameter(&mut self, info: &ParameterInfo) {
        self.params.push((info.name().to_string(), info.wgsl_type()));
    }

    pub fn add_argument(&mut self, info: &ParameterInfo) {
        self.arguments.push((info.name().to_string(), info.wgsl_type()));
    }

    fn declared_symbols(&self) -> HashSet<String> {
        let mut set: HashSet<String> = CONTRACT_SYMBOLS.iter().map(|s| s.to_string()).collect();
        for (name, _) in &self.params {
            set.insert(format!("{name}1"));
            set.insert(format!("{name}2"));
        }
        for (name, _) in &self.arguments {
            set.insert(name.clone());
        }
        set
    }

    /// Assemble the complete shader source.
    ///
    /// # Errors
    ///
    /// [`EngineError::UndeclaredSymbol`] if a fragment references a symbol
    /// that is neither a contract variable, a registered parameter (with
    /// `1`/`2` suffix), a registered argument, nor a WGSL builtin.
    pub fn synthesize(&self) -> Result<String, EngineError> {
        let declared = self.declared_symbols();
        for fragment in &self.fragments {
            check_fragment_symbols(fragment, &declared)?;
        }

        let mut src = String::with_capacity(8 * 1024);
        src.push_str(
            r#"struct Params {
    num_atoms: u32,
    use_cutoff: u32,
    periodic: u32,
    use_exclusions: u32,
    cutoff_sq: f32,
    box_x: f32,
    box_y: f32,
    box_z: f32,
    max_tiles: u32,
    _pad0: u32,
    _pad1: u32,
    _pad2: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> positions: array<f32>;
@group(0) @binding(2) var<storage, read_write> forces: array<atomic<i32>>;
@group(0) @binding(3) var<storage, read_write> energy: array<f32>;
@group(0) @binding(4) var<storage, read> interaction_count: array<u32>;
@group(0) @binding(5) var<storage, read> interacting_tiles: array<u32>;
@group(0) @binding(6) var<storage, read> interaction_flags: array<u32>;
@group(0) @binding(7) var<storage, read> exclusion_masks: array<u32>;
@group(0) @binding(8) var<storage, read> exclusion_indices: array<u32>;
@group(0) @binding(9) var<storage, read> exclusion_row_indices: array<u32>;
"#,
        );

        let mut binding = 10;
        for (name, ty) in self.params.iter().chain(self.arguments.iter()) {
            src.push_str(&format!(
                "@group(0) @binding({binding}) var<storage, read> {name}: array<{ty}>;\n"
            ));
            binding += 1;
        }

        src.push_str(WGSL_TILE_DECODE);
        src.push_str(&format!(
            r#"
const FORCE_SCALE: f32 = {FORCE_SCALE}.0;

fn load_pos(i: u32) -> vec3<f32> {{
    return vec3<f32>(positions[i * 3u], positions[i * 3u + 1u], positions[i * 3u + 2u]);
}}

fn accumulate_force(i: u32, f: vec3<f32>) {{
    atomicAdd(&forces[i * 3u], i32(round(f.x * FORCE_SCALE)));
    atomicAdd(&forces[i * 3u + 1u], i32(round(f.y * FORCE_SCALE)));
    atomicAdd(&forces[i * 3u + 2u], i32(round(f.z * FORCE_SCALE)));
}}

fn exclusion_mask_for(x: u32, y: u32, row: u32) -> u32 {{
    let start = exclusion_row_indices[y];
    let end = exclusion_row_indices[y + 1u];
    for (var p = start; p < end; p = p + 1u) {{
        if (exclusion_indices[p] == x) {{
            return exclusion_masks[p * 32u + row];
        }}
    }}
    return 0u;
}}
"#
        ));

        // Pair evaluation: fragments concatenated into one body, called
        // once per ordered orientation. Parameter values travel as typed
        // function arguments so the mirrored call just swaps them.
        let mut sig = String::from("r2: f32, r: f32, inv_r: f32, delta: vec3<f32>, pos1: vec3<f32>, pos2: vec3<f32>");
        for (name, ty) in &self.params {
            sig.push_str(&format!(", {name}1: {ty}, {name}2: {ty}"));
        }
        src.push_str(&format!(
            "\nfn pair_interaction({sig}) -> vec2<f32> {{\n    var temp_energy = 0.0;\n    var dedr = 0.0;\n"
        ));
        for fragment in &self.fragments {
            src.push_str("    {\n");
            src.push_str(fragment);
            src.push_str("\n    }\n");
        }
        src.push_str("    return vec2<f32>(temp_energy, dedr);\n}\n");

        // Argument lists for the forward and mirrored calls.
        let mut fwd = String::from("r2, r, inv_r, delta, pos1, pos2");
        let mut rev = String::from("r2, r, inv_r, -delta, pos2, pos1");
        for (name, _) in &self.params {
            fwd.push_str(&format!(", {name}_1, {name}_2"));
            rev.push_str(&format!(", {name}_2, {name}_1"));
        }
        let mut param_loads = String::new();
        for (name, _) in &self.params {
            param_loads.push_str(&format!(
                "                let {name}_1 = {name}[i];\n                let {name}_2 = {name}[j];\n"
            ));
        }

        // Arguments a fragment never indexes would be culled from the
        // auto-derived layout; touch each one so the bind slots stay live.
        let mut argument_touch = String::new();
        for (name, _) in &self.arguments {
            argument_touch.push_str(&format!("    let _{name}_len = arrayLength(&{name});\n"));
        }

        // Emitted unconditionally and gated by the uniform flag: the
        // auto-derived pipeline layout only contains bindings the entry
        // point statically reaches, and the exclusion arrays are always
        // bound.
        let exclusion_apply = "            if (params.use_exclusions != 0u) {\n                flags = flags & ~exclusion_mask_for(tile.x, tile.y, row);\n            }\n";

        let off_diagonal = if self.is_symmetric {
            r#"                    energy_acc = energy_acc + out1.x;
                    force1 = force1 + delta * out1.y;
                    accumulate_force(j, -delta * out1.y);"#
                .to_string()
        } else {
            format!(
                r#"                    energy_acc = energy_acc + 0.5 * out1.x;
                    force1 = force1 + delta * out1.y;
                    let out2 = pair_interaction({rev});
                    energy_acc = energy_acc + 0.5 * out2.x;
                    accumulate_force(j, -delta * out2.y);"#
            )
        };

        src.push_str(&format!(
            r#"
@compute @workgroup_size({FORCE_THREAD_BLOCK_SIZE})
fn main(
    @builtin(global_invocation_id) gid: vec3<u32>,
    @builtin(num_workgroups) nwg: vec3<u32>,
) {{
{argument_touch}    let thread_count = nwg.x * {FORCE_THREAD_BLOCK_SIZE}u;
    let count = min(interaction_count[0], params.max_tiles);
    let box_size = vec3<f32>(params.box_x, params.box_y, params.box_z);
    var energy_acc = 0.0;
    var idx = gid.x;
    loop {{
        if (idx >= count * 32u) {{
            break;
        }}
        let slot = idx / 32u;
        let row = idx % 32u;
        let tile = tile_from_flat(interacting_tiles[slot]);
        let i = tile.x * 32u + row;
        if (i < params.num_atoms) {{
            let pos1 = load_pos(i);
            var force1 = vec3<f32>(0.0, 0.0, 0.0);
            var flags = interaction_flags[slot * 32u + row];
{exclusion_apply}            let diagonal = tile.x == tile.y;
            for (var c = 0u; c < 32u; c = c + 1u) {{
                if (((flags >> c) & 1u) == 0u) {{
                    continue;
                }}
                let j = tile.y * 32u + c;
                let pos2 = load_pos(j);
                var delta = pos1 - pos2;
                if (params.periodic != 0u) {{
                    delta = delta - box_size * round(delta / box_size);
                }}
                let r2 = dot(delta, delta);
                let r = sqrt(r2);
                let inv_r = 1.0 / r;
{param_loads}                let out1 = pair_interaction({fwd});
                if (diagonal) {{
                    energy_acc = energy_acc + 0.5 * out1.x;
                    force1 = force1 + delta * out1.y;
                }} else {{
{off_diagonal}
                }}
            }}
            accumulate_force(i, force1);
        }}
        idx = idx + thread_count;
    }}
    energy[gid.x] = energy[gid.x] + energy_acc;
}}
"#
        ));

        Ok(src)
    }
}

/// Neighbor-list and accumulator buffers an interaction kernel binds.
pub struct KernelResources<'a> {
    pub neighbor: &'a NeighborList,
    pub positions: &'a wgpu::Buffer,
    pub forces: &'a wgpu::Buffer,
    pub energy: &'a wgpu::Buffer,
    pub exclusion_masks: &'a wgpu::Buffer,
    pub exclusion_indices: &'a wgpu::Buffer,
    pub exclusion_row_indices: &'a wgpu::Buffer,
}

/// A compiled interaction kernel plus its registered buffers, rebindable
/// after neighbor-list growth.
pub struct CompiledKernel {
    pipeline: wgpu::ComputePipeline,
    uniform: wgpu::Buffer,
    params: Vec<ParameterInfo>,
    arguments: Vec<ParameterInfo>,
    use_exclusions: bool,
}

impl CompiledKernel {
    /// Validate, compile, and bind a synthesized kernel.
    ///
    /// # Errors
    ///
    /// [`EngineError::UndeclaredSymbol`] or [`EngineError::KernelCompile`]
    /// for fragment/source problems.
    pub fn build(
        gpu: &GpuContext,
        synthesizer: &KernelSynthesizer,
        params: Vec<ParameterInfo>,
        arguments: Vec<ParameterInfo>,
        label: &str,
    ) -> Result<Self, EngineError> {
        let source = synthesizer.synthesize()?;
        let pipeline = gpu.create_pipeline(&source, label)?;
        let uniform = gpu.create_uniform_buffer(&[0u8; 48], &format!("{label}:params"));
        Ok(Self {
            pipeline,
            uniform,
            params,
            arguments,
            use_exclusions: synthesizer.use_exclusions,
        })
    }

    /// Launch over the current neighbor list. The caller guarantees
    /// `prepare` ran since the last position change.
    pub fn execute(
        &self,
        gpu: &GpuContext,
        resources: &KernelResources<'_>,
        num_atoms: usize,
        use_cutoff: bool,
        periodic: bool,
        cutoff: f32,
        box_size: [f32; 3],
    ) {
        let words: [u32; 12] = [
            num_atoms as u32,
            u32::from(use_cutoff),
            u32::from(periodic),
            u32::from(self.use_exclusions),
            (cutoff * cutoff).to_bits(),
            box_size[0].to_bits(),
            box_size[1].to_bits(),
            box_size[2].to_bits(),
            resources.neighbor.max_tiles(),
            0,
            0,
            0,
        ];
        gpu.queue()
            .write_buffer(&self.uniform, 0, bytemuck::cast_slice(&words));

        let mut buffers: Vec<&wgpu::Buffer> = vec![
            &self.uniform,
            resources.positions,
            resources.forces,
            resources.energy,
            resources.neighbor.interaction_count(),
            resources.neighbor.interacting_tiles(),
            resources.neighbor.interaction_flags(),
            resources.exclusion_masks,
            resources.exclusion_indices,
            resources.exclusion_row_indices,
        ];
        for info in self.params.iter().chain(self.arguments.iter()) {
            buffers.push(info.buffer());
        }
        let bind_group = gpu.create_bind_group(&self.pipeline, &buffers, "kernel:bg");
        gpu.dispatch(
            &self.pipeline,
            &bind_group,
            NUM_FORCE_THREAD_BLOCKS,
            "kernel:interactions",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::validate_wgsl;

    fn coulomb_like() -> KernelSynthesizer {
        let mut synth = KernelSynthesizer::new(true, true);
        synth.add_fragment(
            "let k = 1.0;\ntemp_energy = temp_energy + k * inv_r;\ndedr = dedr + k * inv_r * inv_r * inv_r;",
        );
        synth
    }

    #[test]
    fn synthesized_source_validates() {
        let src = coulomb_like().synthesize().unwrap();
        assert!(
            validate_wgsl(&src).is_ok(),
            "synthesized WGSL failed validation:\n{src}"
        );
    }

    #[test]
    fn nonsymmetric_source_validates() {
        let mut synth = KernelSynthesizer::new(false, false);
        synth.add_fragment("temp_energy = temp_energy + exp(-r);\ndedr = dedr + exp(-r) * inv_r;");
        let src = synth.synthesize().unwrap();
        assert!(validate_wgsl(&src).is_ok(), "{src}");
    }

    #[test]
    fn parameterized_source_validates() {
        let mut synth = KernelSynthesizer::new(true, true);
        synth.params.push(("charge".into(), "f32".into()));
        synth.add_fragment(
            "let qq = charge1 * charge2;\ntemp_energy = temp_energy + qq * inv_r;\ndedr = dedr + qq * inv_r * inv_r * inv_r;",
        );
        let src = synth.synthesize().unwrap();
        assert!(validate_wgsl(&src).is_ok(), "{src}");
        assert!(src.contains("charge1: f32, charge2: f32"));
    }

    #[test]
    fn untouched_argument_stays_bound() {
        let mut synth = KernelSynthesizer::new(false, true);
        synth.arguments.push(("bond_table".into(), "u32".into()));
        synth.add_fragment("temp_energy = temp_energy + inv_r;");
        let src = synth.synthesize().unwrap();
        assert!(validate_wgsl(&src).is_ok(), "{src}");
        assert!(src.contains("arrayLength(&bond_table)"));
    }

    #[test]
    fn declarations_appear_in_source() {
        let src = coulomb_like().synthesize().unwrap();
        assert!(src.contains("fn pair_interaction("));
        assert!(src.contains("exclusion_row_indices"));
        assert!(src.contains("@workgroup_size(32)"));
    }

    #[test]
    fn undeclared_symbol_is_rejected() {
        let mut synth = KernelSynthesizer::new(false, true);
        synth.add_fragment("temp_energy = temp_energy + sigma1 * inv_r;");
        match synth.synthesize() {
            Err(EngineError::UndeclaredSymbol(name)) => assert_eq!(name, "sigma1"),
            other => panic!("expected UndeclaredSymbol, got {other:?}"),
        }
    }

    #[test]
    fn member_access_and_literals_are_not_symbols() {
        let declared: HashSet<String> = CONTRACT_SYMBOLS.iter().map(|s| s.to_string()).collect();
        assert!(check_fragment_symbols("let a = delta.x + 0x1f + 2u;", &declared).is_ok());
        assert!(check_fragment_symbols("dedr = dedr + sqrt(r2);", &declared).is_ok());
    }

    #[test]
    fn multiple_fragments_concatenate() {
        let mut synth = KernelSynthesizer::new(false, true);
        synth.add_fragment("temp_energy = temp_energy + inv_r;");
        synth.add_fragment("dedr = dedr + inv_r * inv_r * inv_r;");
        let src = synth.synthesize().unwrap();
        assert!(validate_wgsl(&src).is_ok(), "{src}");
        let body_start = src.find("fn pair_interaction").unwrap();
        let body_end = src.find("fn main").unwrap();
        let body = &src[body_start..body_end];
        assert_eq!(body.matches("temp_energy + inv_r").count(), 1);
    }

    #[test]
    fn fixed_point_round_trip() {
        for f in [0.0, 1.0, -3.25, 1017.5, -0.000244140625] {
            let raw = (f * FORCE_SCALE).round() as i32;
            let back = fixed_to_force(raw);
            assert!((back - f).abs() < 1.0 / FORCE_SCALE, "{f} -> {back}");
        }
    }
}
