// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for GPU setup and nonbonded engine operations.
//!
//! A proper enum instead of `Result<_, String>` so callers can pattern-match
//! on failure modes (no adapter, kernel compile failure, contract violation)
//! rather than parsing opaque strings.

use std::fmt;

/// Errors arising from GPU initialization, kernel synthesis, or engine setup.
#[derive(Debug)]
pub enum EngineError {
    /// No compatible GPU adapter was found by wgpu.
    NoAdapter,

    /// GPU device creation failed (wraps the underlying wgpu error message).
    DeviceCreation(String),

    /// A synthesized kernel failed WGSL parsing or validation.
    KernelCompile(String),

    /// `find_exclusion_index` was queried with `x < y`. Only lower-triangular
    /// tile coordinates are legal.
    InvalidExclusionTile { x: u32, y: u32 },

    /// `find_exclusion_index` was queried for a tile with no exclusion data.
    ExclusionTileNotFound { x: u32, y: u32 },

    /// Two interactions registered on the same engine supplied different
    /// exclusion lists. All exclusion-aware terms share one encoding.
    ConflictingExclusions,

    /// An interaction source fragment references a symbol that was never
    /// declared via `add_parameter` or `add_argument`.
    UndeclaredSymbol(String),

    /// Setup-time contract violation (registration after initialize,
    /// initialize called twice, tile range out of bounds, ...).
    Setup(String),

    /// GPU buffer readback failed (map callback error or dropped channel).
    Readback(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "No GPU adapter found"),
            Self::DeviceCreation(e) => write!(f, "Failed to create GPU device: {e}"),
            Self::KernelCompile(e) => write!(f, "Kernel compilation failed: {e}"),
            Self::InvalidExclusionTile { x, y } => {
                write!(f, "Illegal exclusion tile query ({x}, {y}): requires x >= y")
            }
            Self::ExclusionTileNotFound { x, y } => {
                write!(f, "Tile ({x}, {y}) has no exclusion data")
            }
            Self::ConflictingExclusions => {
                write!(
                    f,
                    "All interactions with exclusions must use identical exclusion lists"
                )
            }
            Self::UndeclaredSymbol(name) => {
                write!(f, "Interaction source references undeclared symbol '{name}'")
            }
            Self::Setup(msg) => write!(f, "Engine setup error: {msg}"),
            Self::Readback(msg) => write!(f, "GPU readback failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_no_adapter() {
        let err = EngineError::NoAdapter;
        assert_eq!(err.to_string(), "No GPU adapter found");
    }

    #[test]
    fn display_invalid_exclusion_tile() {
        let err = EngineError::InvalidExclusionTile { x: 2, y: 5 };
        assert!(err.to_string().contains("(2, 5)"));
        assert!(err.to_string().contains("x >= y"));
    }

    #[test]
    fn display_kernel_compile() {
        let err = EngineError::KernelCompile("expected ';'".into());
        assert_eq!(err.to_string(), "Kernel compilation failed: expected ';'");
    }

    #[test]
    fn display_undeclared_symbol() {
        let err = EngineError::UndeclaredSymbol("sigma".into());
        assert!(err.to_string().contains("'sigma'"));
    }

    #[test]
    fn error_trait_works() {
        let err = EngineError::ConflictingExclusions;
        let dyn_err: &dyn std::error::Error = &err;
        assert!(dyn_err.to_string().contains("identical exclusion lists"));
    }
}
