// SPDX-License-Identifier: AGPL-3.0-only

//! Orchestration of the nonbonded pipeline.
//!
//! [`NonbondedEngine`] collects interaction registrations while a force
//! field is being assembled, then [`NonbondedEngine::initialize`] freezes
//! them into device state: the exclusion encoding, the neighbor list, the
//! accumulator buffers, and one synthesized kernel combining every
//! registered default-kernel term. Per step the driver calls
//! [`NonbondedEngine::prepare_interactions`] after moving particles and
//! [`NonbondedEngine::compute_interactions`] to accumulate forces and
//! energy.
//!
//! Registration order matters only for parameters and arguments (their
//! declaration order fixes bind slots); terms combine commutatively.

use crate::error::EngineError;
use crate::gpu::GpuContext;
use crate::nonbonded::exclusions::ExclusionSet;
use crate::nonbonded::kernel::{
    fixed_to_force, CompiledKernel, KernelResources, KernelSynthesizer, FORCE_THREAD_BLOCK_SIZE,
    NUM_FORCE_THREAD_BLOCKS,
};
use crate::nonbonded::neighbor::{NeighborList, NeighborListConfig};
use crate::nonbonded::{
    num_blocks, tile_count, InteractionTerm, ParameterInfo, SystemDescription,
};
use std::sync::Arc;

/// Fraction of the cutoff added as coarse-test padding so a list stays
/// valid across small particle displacements.
const PADDING_FRACTION: f64 = 0.1;

/// Device state frozen at [`NonbondedEngine::initialize`].
struct DeviceState {
    neighbor: NeighborList,
    exclusions: ExclusionSet,
    exclusion_masks: wgpu::Buffer,
    exclusion_indices: wgpu::Buffer,
    exclusion_row_indices: wgpu::Buffer,
    positions: wgpu::Buffer,
    /// Fixed-point force accumulators, 3 `atomic<i32>` words per atom.
    forces: wgpu::Buffer,
    /// One f32 slot per potential kernel invocation.
    energy: wgpu::Buffer,
    default_kernel: Option<CompiledKernel>,
}

/// Tile-based nonbonded interaction engine for one simulated system.
pub struct NonbondedEngine {
    gpu: Arc<GpuContext>,
    system: SystemDescription,

    terms: Vec<InteractionTerm>,
    parameters: Vec<ParameterInfo>,
    arguments: Vec<ParameterInfo>,
    exclusion_list: Option<Vec<Vec<u32>>>,

    /// Max cutoff across registered terms; negative until a term with a
    /// cutoff is registered (mirrors the "no interactions" sentinel).
    cutoff: f64,
    use_cutoff: bool,
    periodic: bool,
    /// Force group shared by every default-kernel term.
    force_group: i32,

    start_tile: u64,
    /// `None` until [`NonbondedEngine::set_tile_range`]; defaults to the
    /// full tile space at initialization.
    range_len: Option<u64>,

    state: Option<DeviceState>,
}

impl NonbondedEngine {
    pub fn new(gpu: Arc<GpuContext>, system: SystemDescription) -> Self {
        Self {
            gpu,
            system,
            terms: Vec::new(),
            parameters: Vec::new(),
            arguments: Vec::new(),
            exclusion_list: None,
            cutoff: -1.0,
            use_cutoff: false,
            periodic: false,
            force_group: 0,
            start_tile: 0,
            range_len: None,
            state: None,
        }
    }

    fn ensure_mutable(&self) -> Result<(), EngineError> {
        if self.state.is_some() {
            return Err(EngineError::Setup(
                "registration is closed after initialize".into(),
            ));
        }
        Ok(())
    }

    fn state(&self) -> Result<&DeviceState, EngineError> {
        self.state
            .as_ref()
            .ok_or_else(|| EngineError::Setup("engine not initialized".into()))
    }

    /// Register one interaction evaluated by the combined default kernel.
    ///
    /// The effective cutoff is the maximum across registered terms; cutoff
    /// and periodicity usage are the union. A term with `uses_exclusions`
    /// set forwards its `exclusion_list` into the shared exclusion set.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] after [`NonbondedEngine::initialize`] or for
    /// a force group differing from earlier terms,
    /// [`EngineError::ConflictingExclusions`] when the term's exclusion
    /// list disagrees with an already-registered one.
    pub fn add_interaction(&mut self, term: InteractionTerm) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        if !self.terms.is_empty() && term.force_group != self.force_group {
            return Err(EngineError::Setup(format!(
                "all default-kernel interactions must share one force group \
                 (got {}, have {})",
                term.force_group, self.force_group
            )));
        }
        if term.uses_exclusions {
            self.request_exclusions(&term.exclusion_list)?;
        }
        self.force_group = term.force_group;
        if term.uses_cutoff {
            self.use_cutoff = true;
            self.cutoff = self.cutoff.max(term.cutoff_distance);
        }
        if term.uses_periodic {
            self.periodic = true;
        }
        self.terms.push(term);
        Ok(())
    }

    /// Register a per-particle parameter array the default kernel reads as
    /// `NAME1` / `NAME2`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] after initialization or on a duplicate name.
    pub fn add_parameter(&mut self, info: ParameterInfo) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        if self.symbol_taken(info.name()) {
            return Err(EngineError::Setup(format!(
                "duplicate parameter name '{}'",
                info.name()
            )));
        }
        self.parameters.push(info);
        Ok(())
    }

    /// Register an auxiliary array fragments may index directly.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] after initialization or on a duplicate name.
    pub fn add_argument(&mut self, info: ParameterInfo) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        if self.symbol_taken(info.name()) {
            return Err(EngineError::Setup(format!(
                "duplicate argument name '{}'",
                info.name()
            )));
        }
        self.arguments.push(info);
        Ok(())
    }

    fn symbol_taken(&self, name: &str) -> bool {
        self.parameters.iter().any(|p| p.name() == name)
            || self.arguments.iter().any(|a| a.name() == name)
    }

    /// Register the excluded-pair list shared by every exclusion-aware
    /// kernel of this engine. `exclusion_list[i]` lists the partners of
    /// atom `i` (one-sided input is fine).
    ///
    /// # Errors
    ///
    /// [`EngineError::ConflictingExclusions`] when called again with a
    /// different list; identical repeat registrations are accepted.
    pub fn request_exclusions(&mut self, exclusion_list: &[Vec<u32>]) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        match &self.exclusion_list {
            Some(existing) if existing.as_slice() != exclusion_list => {
                Err(EngineError::ConflictingExclusions)
            }
            Some(_) => Ok(()),
            None => {
                self.exclusion_list = Some(exclusion_list.to_vec());
                Ok(())
            }
        }
    }

    /// Restrict this engine to a contiguous range of flat tile indices,
    /// for splitting the tile space across devices. Defaults to the full
    /// space.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] after initialization or for a range that
    /// exceeds the system's tile space.
    pub fn set_tile_range(&mut self, start_tile: u64, num_tiles: u64) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        let total = tile_count(num_blocks(self.system.num_atoms));
        if start_tile + num_tiles > total {
            return Err(EngineError::Setup(format!(
                "tile range {start_tile}+{num_tiles} exceeds tile space {total}"
            )));
        }
        self.start_tile = start_tile;
        self.range_len = Some(num_tiles);
        Ok(())
    }

    /// Freeze registrations and build device state: exclusion encoding,
    /// neighbor list, accumulators, and the combined default kernel.
    ///
    /// # Errors
    ///
    /// [`EngineError::UndeclaredSymbol`] / [`EngineError::KernelCompile`]
    /// for bad fragments, [`EngineError::Setup`] for re-initialization or
    /// a tile range that does not fit device indices.
    pub fn initialize(&mut self) -> Result<(), EngineError> {
        self.ensure_mutable()?;
        let gpu = &self.gpu;
        let num_atoms = self.system.num_atoms;
        let total_tiles = tile_count(num_blocks(num_atoms));
        let range_len = self.range_len.unwrap_or(total_tiles - self.start_tile);

        // Flat indices up to start + len - 1 must fit device u32 arithmetic.
        if self.start_tile + range_len > u64::from(u32::MAX) + 1 {
            return Err(EngineError::Setup(format!(
                "tile range {}+{range_len} does not fit device indices",
                self.start_tile
            )));
        }
        let start_tile = u32::try_from(self.start_tile)
            .map_err(|_| EngineError::Setup(format!("start tile {} too large", self.start_tile)))?;
        let range_len = u32::try_from(range_len)
            .map_err(|_| EngineError::Setup(format!("tile range {range_len} too large")))?;

        let empty = vec![Vec::new(); num_atoms];
        let exclusions =
            ExclusionSet::build(self.exclusion_list.as_deref().unwrap_or(&empty), num_atoms);
        let exclusion_masks = gpu.create_u32_buffer(exclusions.masks(), "nb:exclusion_masks");
        let exclusion_indices = gpu.create_u32_buffer(exclusions.indices(), "nb:exclusion_indices");
        let exclusion_row_indices =
            gpu.create_u32_buffer(exclusions.row_indices(), "nb:exclusion_row_indices");

        let box_size = [
            self.system.box_size[0] as f32,
            self.system.box_size[1] as f32,
            self.system.box_size[2] as f32,
        ];
        let cutoff = if self.use_cutoff { self.cutoff as f32 } else { 0.0 };
        let neighbor = NeighborList::new(
            gpu,
            NeighborListConfig {
                num_atoms,
                periodic: self.periodic,
                box_size,
                use_cutoff: self.use_cutoff,
                cutoff,
                padding: (self.cutoff.max(0.0) * PADDING_FRACTION) as f32,
                start_tile,
                range_len,
            },
            (range_len / 2).max(1),
        )?;

        let positions = gpu.create_output_buffer(num_atoms * 3, "nb:positions");
        let forces = gpu.create_output_buffer(num_atoms * 3, "nb:forces");
        let energy = gpu.create_output_buffer(self.num_energy_slots(), "nb:energy");

        let default_kernel = if self.terms.is_empty() {
            None
        } else {
            let use_exclusions = self.terms.iter().any(|t| t.uses_exclusions);
            let mut synth = KernelSynthesizer::new(use_exclusions, true);
            for info in &self.parameters {
                synth.add_parameter(info);
            }
            for info in &self.arguments {
                synth.add_argument(info);
            }
            for term in &self.terms {
                synth.add_fragment(&term.source);
            }
            Some(CompiledKernel::build(
                gpu,
                &synth,
                self.parameters.clone(),
                self.arguments.clone(),
                "nb:default_kernel",
            )?)
        };

        log::info!(
            "nonbonded engine: {num_atoms} atoms, {} blocks, tiles {start_tile}..{} ({} terms)",
            num_blocks(num_atoms),
            u64::from(start_tile) + u64::from(range_len),
            self.terms.len()
        );

        self.state = Some(DeviceState {
            neighbor,
            exclusions,
            exclusion_masks,
            exclusion_indices,
            exclusion_row_indices,
            positions,
            forces,
            energy,
            default_kernel,
        });
        Ok(())
    }

    /// Rebuild the neighbor list from current device positions. Returns
    /// the interacting-tile count.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization,
    /// [`EngineError::Readback`] if the tile counter cannot be read.
    pub fn prepare_interactions(&mut self) -> Result<u32, EngineError> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| EngineError::Setup("engine not initialized".into()))?;
        state.neighbor.prepare(&self.gpu, &state.positions)
    }

    /// Launch the combined default kernel over the current neighbor list,
    /// accumulating into the force and energy buffers. A no-op when no
    /// interactions are registered.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization.
    pub fn compute_interactions(&self) -> Result<(), EngineError> {
        let state = self.state()?;
        let Some(kernel) = &state.default_kernel else {
            return Ok(());
        };
        kernel.execute(
            &self.gpu,
            &self.kernel_resources(state),
            self.system.num_atoms,
            self.use_cutoff,
            self.periodic,
            if self.use_cutoff { self.cutoff as f32 } else { 0.0 },
            [
                self.system.box_size[0] as f32,
                self.system.box_size[1] as f32,
                self.system.box_size[2] as f32,
            ],
        );
        Ok(())
    }

    fn kernel_resources<'a>(&self, state: &'a DeviceState) -> KernelResources<'a> {
        KernelResources {
            neighbor: &state.neighbor,
            positions: &state.positions,
            forces: &state.forces,
            energy: &state.energy,
            exclusion_masks: &state.exclusion_masks,
            exclusion_indices: &state.exclusion_indices,
            exclusion_row_indices: &state.exclusion_row_indices,
        }
    }

    /// Compile a collaborator kernel sharing this engine's neighbor list
    /// and exclusion encoding. Symmetric kernels evaluate each unordered
    /// pair once and apply Newton's third law; non-symmetric kernels
    /// evaluate both orientations.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization,
    /// [`EngineError::UndeclaredSymbol`] / [`EngineError::KernelCompile`]
    /// for bad source.
    pub fn create_interaction_kernel(
        &self,
        source: &str,
        params: Vec<ParameterInfo>,
        arguments: Vec<ParameterInfo>,
        use_exclusions: bool,
        is_symmetric: bool,
    ) -> Result<CompiledKernel, EngineError> {
        self.state()?;
        let mut synth = KernelSynthesizer::new(use_exclusions, is_symmetric);
        for info in &params {
            synth.add_parameter(info);
        }
        for info in &arguments {
            synth.add_argument(info);
        }
        synth.add_fragment(source);
        CompiledKernel::build(&self.gpu, &synth, params, arguments, "nb:aux_kernel")
    }

    /// Launch a kernel from [`NonbondedEngine::create_interaction_kernel`]
    /// over the current neighbor list.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization.
    pub fn execute_kernel(&self, kernel: &CompiledKernel) -> Result<(), EngineError> {
        let state = self.state()?;
        kernel.execute(
            &self.gpu,
            &self.kernel_resources(state),
            self.system.num_atoms,
            self.use_cutoff,
            self.periodic,
            if self.use_cutoff { self.cutoff as f32 } else { 0.0 },
            [
                self.system.box_size[0] as f32,
                self.system.box_size[1] as f32,
                self.system.box_size[2] as f32,
            ],
        );
        Ok(())
    }

    /// Upload particle positions (`3 * num_atoms` coordinates).
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization or on a length mismatch.
    pub fn set_positions(&self, positions: &[f64]) -> Result<(), EngineError> {
        let state = self.state()?;
        if positions.len() != self.system.num_atoms * 3 {
            return Err(EngineError::Setup(format!(
                "expected {} coordinates, got {}",
                self.system.num_atoms * 3,
                positions.len()
            )));
        }
        let f32s: Vec<f32> = positions.iter().map(|&x| x as f32).collect();
        self.gpu.upload_f32(&state.positions, &f32s);
        Ok(())
    }

    /// Zero the force and energy accumulators. Call before the first
    /// kernel launch of a step.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization.
    pub fn zero_accumulators(&self) -> Result<(), EngineError> {
        let state = self.state()?;
        self.gpu.zero_buffer(&state.forces, self.system.num_atoms * 3);
        self.gpu.zero_buffer(&state.energy, self.num_energy_slots());
        Ok(())
    }

    /// Read back accumulated forces, decoded from fixed point.
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization,
    /// [`EngineError::Readback`] on transfer failure.
    pub fn read_forces(&self) -> Result<Vec<[f64; 3]>, EngineError> {
        let state = self.state()?;
        let raw = self
            .gpu
            .read_back_i32(&state.forces, self.system.num_atoms * 3)?;
        Ok(raw
            .chunks_exact(3)
            .map(|c| [fixed_to_force(c[0]), fixed_to_force(c[1]), fixed_to_force(c[2])])
            .collect())
    }

    /// Read back total accumulated energy (sum over per-invocation slots,
    /// reduced on the host in f64).
    ///
    /// # Errors
    ///
    /// [`EngineError::Setup`] before initialization,
    /// [`EngineError::Readback`] on transfer failure.
    pub fn read_energy(&self) -> Result<f64, EngineError> {
        let state = self.state()?;
        let slots = self.gpu.read_back_f32(&state.energy, self.num_energy_slots())?;
        Ok(slots.iter().map(|&e| f64::from(e)).sum())
    }

    /// Whether any interaction has been registered.
    pub fn has_interactions(&self) -> bool {
        !self.terms.is_empty()
    }

    /// Effective cutoff distance: the maximum across registered terms, or
    /// a negative sentinel when no cutoff-using term exists.
    pub fn cutoff_distance(&self) -> f64 {
        self.cutoff
    }

    pub fn uses_cutoff(&self) -> bool {
        self.use_cutoff
    }

    pub fn uses_periodic(&self) -> bool {
        self.periodic
    }

    /// Force group of the combined default kernel: shared by every
    /// registered term, 0 when none is registered.
    pub fn force_group(&self) -> i32 {
        self.force_group
    }

    pub fn system(&self) -> &SystemDescription {
        &self.system
    }

    /// First flat tile index this engine is responsible for.
    pub fn start_tile_index(&self) -> u64 {
        self.start_tile
    }

    /// Number of tiles in this engine's range.
    pub fn num_tiles(&self) -> u64 {
        self.range_len
            .unwrap_or_else(|| tile_count(num_blocks(self.system.num_atoms)) - self.start_tile)
    }

    pub fn num_force_thread_blocks(&self) -> u32 {
        NUM_FORCE_THREAD_BLOCKS
    }

    pub fn force_thread_block_size(&self) -> u32 {
        FORCE_THREAD_BLOCK_SIZE
    }

    /// Energy accumulation slots: one per potential kernel invocation.
    pub fn num_energy_slots(&self) -> usize {
        (NUM_FORCE_THREAD_BLOCKS * FORCE_THREAD_BLOCK_SIZE) as usize
    }

    /// The shared exclusion encoding. Available after initialization.
    pub fn exclusions(&self) -> Result<&ExclusionSet, EngineError> {
        Ok(&self.state()?.exclusions)
    }

    /// Interacting-tile count from the last [`NonbondedEngine::prepare_interactions`].
    pub fn interaction_count(&self) -> Result<u32, EngineError> {
        Ok(self.state()?.neighbor.interaction_count_host())
    }

    /// The underlying neighbor list. Available after initialization.
    pub fn neighbor_list(&self) -> Result<&NeighborList, EngineError> {
        Ok(&self.state()?.neighbor)
    }

    /// Device position buffer (3 f32 per atom). Available after
    /// initialization.
    pub fn positions_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.positions)
    }

    /// Fixed-point force accumulator buffer (3 i32 words per atom).
    pub fn forces_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.forces)
    }

    /// Per-invocation energy slot buffer.
    pub fn energy_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.energy)
    }

    /// Device copy of the exclusion tile bitmasks (CSR order).
    pub fn exclusion_masks_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.exclusion_masks)
    }

    /// Device copy of the exclusion tile column indices.
    pub fn exclusion_indices_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.exclusion_indices)
    }

    /// Device copy of the exclusion CSR row offsets.
    pub fn exclusion_row_indices_buffer(&self) -> Result<&wgpu::Buffer, EngineError> {
        Ok(&self.state()?.exclusion_row_indices)
    }

    /// Registered default-kernel terms, in registration order. Drivers use
    /// the force-group tags here for staged evaluation.
    pub fn interaction_terms(&self) -> &[InteractionTerm] {
        &self.terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_system() -> SystemDescription {
        SystemDescription {
            num_atoms: 8,
            periodic: false,
            box_size: [0.0; 3],
        }
    }

    #[test]
    fn engine_registration_flow() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let mut engine = NonbondedEngine::new(Arc::new(gpu), small_system());
        assert!(!engine.has_interactions());
        assert!(engine.cutoff_distance() < 0.0);

        engine
            .add_interaction(InteractionTerm {
                uses_cutoff: true,
                uses_periodic: false,
                uses_exclusions: false,
                exclusion_list: Vec::new(),
                cutoff_distance: 1.5,
                source: "temp_energy = temp_energy + inv_r;\ndedr = dedr + inv_r * inv_r * inv_r;"
                    .into(),
                force_group: 0,
            })
            .unwrap();
        assert!(engine.has_interactions());
        assert!((engine.cutoff_distance() - 1.5).abs() < 1e-12);
        assert!(engine.uses_cutoff());
        assert!(!engine.uses_periodic());

        engine.request_exclusions(&[vec![1], vec![0]]).unwrap();
        // Identical repeat is fine.
        engine.request_exclusions(&[vec![1], vec![0]]).unwrap();
        // A different list conflicts.
        match engine.request_exclusions(&[vec![2], vec![], vec![0]]) {
            Err(EngineError::ConflictingExclusions) => {}
            other => panic!("expected ConflictingExclusions, got {other:?}"),
        }
    }

    #[test]
    fn term_exclusions_join_the_shared_set() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let mut engine = NonbondedEngine::new(Arc::new(gpu), small_system());
        engine
            .add_interaction(InteractionTerm {
                uses_cutoff: false,
                uses_periodic: false,
                uses_exclusions: true,
                exclusion_list: vec![vec![1], vec![0]],
                cutoff_distance: 0.0,
                source: "temp_energy = temp_energy + inv_r;".into(),
                force_group: 0,
            })
            .unwrap();
        // The term's list landed in the shared set: an identical explicit
        // registration is fine, a different one conflicts.
        engine.request_exclusions(&[vec![1], vec![0]]).unwrap();
        match engine.request_exclusions(&[vec![], vec![], vec![]]) {
            Err(EngineError::ConflictingExclusions) => {}
            other => panic!("expected ConflictingExclusions, got {other:?}"),
        }
        // A second exclusion-using term with a different list is rejected
        // at registration.
        match engine.add_interaction(InteractionTerm {
            uses_cutoff: false,
            uses_periodic: false,
            uses_exclusions: true,
            exclusion_list: vec![vec![2], vec![], vec![0]],
            cutoff_distance: 0.0,
            source: "temp_energy = temp_energy + inv_r;".into(),
            force_group: 0,
        }) {
            Err(EngineError::ConflictingExclusions) => {}
            other => panic!("expected ConflictingExclusions, got {other:?}"),
        }

        engine.initialize().unwrap();
        let set = engine.exclusions().unwrap();
        assert!(set.is_excluded(0, 1));
        assert!(!set.is_excluded(0, 2));
    }

    #[test]
    fn terms_share_one_force_group() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let mut engine = NonbondedEngine::new(Arc::new(gpu), small_system());
        assert_eq!(engine.force_group(), 0);
        let term = |group: i32| InteractionTerm {
            uses_cutoff: false,
            uses_periodic: false,
            uses_exclusions: false,
            exclusion_list: Vec::new(),
            cutoff_distance: 0.0,
            source: "temp_energy = temp_energy + inv_r;".into(),
            force_group: group,
        };
        engine.add_interaction(term(2)).unwrap();
        assert_eq!(engine.force_group(), 2);
        engine.add_interaction(term(2)).unwrap();
        match engine.add_interaction(term(1)) {
            Err(EngineError::Setup(_)) => {}
            other => panic!("expected Setup error, got {other:?}"),
        }
        assert_eq!(engine.force_group(), 2);
    }

    #[test]
    fn tile_range_validation() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let mut engine = NonbondedEngine::new(
            Arc::new(gpu),
            SystemDescription {
                num_atoms: 100,
                periodic: false,
                box_size: [0.0; 3],
            },
        );
        // 100 atoms -> 4 blocks -> 10 tiles.
        assert_eq!(engine.num_tiles(), 10);
        engine.set_tile_range(2, 5).unwrap();
        assert_eq!(engine.start_tile_index(), 2);
        assert_eq!(engine.num_tiles(), 5);
        assert!(engine.set_tile_range(8, 5).is_err());
    }

    #[test]
    fn operations_require_initialization() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let engine = NonbondedEngine::new(Arc::new(gpu), small_system());
        assert!(matches!(
            engine.set_positions(&[0.0; 24]),
            Err(EngineError::Setup(_))
        ));
        assert!(matches!(engine.read_energy(), Err(EngineError::Setup(_))));
        assert!(matches!(
            engine.compute_interactions(),
            Err(EngineError::Setup(_))
        ));
    }

    #[test]
    fn energy_slot_count_matches_launch_shape() {
        let Ok(gpu) = GpuContext::new_blocking() else {
            eprintln!("skipping: no GPU adapter");
            return;
        };
        let engine = NonbondedEngine::new(Arc::new(gpu), small_system());
        assert_eq!(
            engine.num_energy_slots(),
            (engine.num_force_thread_blocks() * engine.force_thread_block_size()) as usize
        );
    }
}
