// SPDX-License-Identifier: AGPL-3.0-only

//! tidepool — tile-based GPU neighbor lists and synthesized nonbonded
//! kernels for molecular dynamics.
//!
//! Particles are grouped into 32-atom blocks; pairs of blocks (*tiles*)
//! are the unit of neighbor-list discovery and kernel work. The engine
//! keeps the tile list, per-pair interaction flags, and a shared
//! exclusion encoding resident on the GPU, and composes every registered
//! interaction into a single WGSL kernel at runtime.
//!
//! ## Modules
//!   - [`gpu`] — wgpu compute context: device setup, buffers, readback,
//!     host-side WGSL validation
//!   - [`nonbonded`] — tile arithmetic and the engine itself
//!     - [`nonbonded::engine`] — registration, initialization, per-step driving
//!     - [`nonbonded::neighbor`] — three-pass GPU neighbor-list build
//!     - [`nonbonded::exclusions`] — CSR tile bitmask exclusion encoding
//!     - [`nonbonded::kernel`] — WGSL kernel synthesis from fragments
//!     - [`nonbonded::reference`] — CPU mirror for validation
//!
//! ## Typical flow
//!
//! ```no_run
//! use std::sync::Arc;
//! use tidepool::gpu::GpuContext;
//! use tidepool::nonbonded::engine::NonbondedEngine;
//! use tidepool::nonbonded::{InteractionTerm, SystemDescription};
//!
//! # fn main() -> Result<(), tidepool::error::EngineError> {
//! let gpu = Arc::new(GpuContext::new_blocking()?);
//! let mut engine = NonbondedEngine::new(gpu, SystemDescription {
//!     num_atoms: 1000,
//!     periodic: true,
//!     box_size: [4.0; 3],
//! });
//! engine.add_interaction(InteractionTerm {
//!     uses_cutoff: true,
//!     uses_periodic: true,
//!     uses_exclusions: false,
//!     exclusion_list: Vec::new(),
//!     cutoff_distance: 1.0,
//!     source: "temp_energy = temp_energy + inv_r;\n\
//!              dedr = dedr + inv_r * inv_r * inv_r;"
//!         .into(),
//!     force_group: 0,
//! })?;
//! engine.initialize()?;
//! engine.set_positions(&vec![0.0; 3000])?;
//! engine.zero_accumulators()?;
//! engine.prepare_interactions()?;
//! engine.compute_interactions()?;
//! let forces = engine.read_forces()?;
//! let energy = engine.read_energy()?;
//! # let _ = (forces, energy);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod gpu;
pub mod nonbonded;
