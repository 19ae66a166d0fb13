//! Shader cross-compiler backend: composites independently-authored
//! shader fragments into pipeline stages and lowers them to a SPIR-V
//! binary module.
//!
//! The front-end parser/type-checker is an external collaborator; it hands
//! over resolved metadata (`meta`, `program`) and receives generated
//! composite source back from the `compositor`. The `entry_points` and
//! `binary` modules operate on the typed IR in `ir`.

pub mod binary;
pub mod compositor;
pub mod cycle_detection;
pub mod entry_points;
pub mod error;
pub mod ir;
pub mod meta;
pub mod passes;
pub mod program;
pub mod reflection;
pub mod settings;

#[cfg(test)]
mod binary_tests;

#[cfg(test)]
mod compositor_tests;

#[cfg(test)]
mod cycle_detection_tests;

#[cfg(test)]
mod entry_points_tests;

use binary::{BinaryBackend, EmitResult};
use compositor::{CompositeResult, Compositor, ShaderDefinition};
use cycle_detection::CycleDetection;
use entry_points::EntryPointInfo;
use error::{CompilerError, Result};
use ir::ShaderLibrary;
use program::ShaderProgram;
use settings::{ShaderCapabilities, TranslationSettings};

/// Facade bundling the translation settings with the three backend phases
/// a host drives: cycle checking, compositing, and binary emission.
pub struct Translator {
    pub settings: TranslationSettings,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

impl Translator {
    pub fn new() -> Self {
        let mut settings = TranslationSettings::new();
        // A default-constructed translator is immediately usable; hosts
        // that customize settings build them separately and use
        // `with_settings`.
        let _ = settings.finalize();
        Translator { settings }
    }

    pub fn with_settings(mut settings: TranslationSettings) -> Result<Self> {
        if !settings.is_finalized() {
            settings.finalize()?;
        }
        Ok(Translator { settings })
    }

    /// Reject programs containing recursive call chains. Returns the first
    /// cycle error when one exists.
    pub fn check_cycles(&self, program: &ShaderProgram) -> Result<()> {
        let mut detection = CycleDetection::new(program);
        if detection.run() {
            let errors = detection.take_errors();
            if let Some(error) = errors.into_iter().next() {
                return Err(error);
            }
            return Err(CompilerError::CycleError("recursive call chain".into(), Vec::new()));
        }
        Ok(())
    }

    /// Composite fragments into per-stage programs for re-lowering by the
    /// front end.
    pub fn composite(
        &self,
        def: &ShaderDefinition,
        capabilities: ShaderCapabilities,
    ) -> Result<CompositeResult> {
        Compositor::new(&self.settings).composite(def, capabilities)
    }

    /// Composite compute fragments with the given local workgroup size.
    pub fn composite_compute(
        &self,
        def: &ShaderDefinition,
        local_size: (u32, u32, u32),
    ) -> Result<CompositeResult> {
        Compositor::new(&self.settings).composite_compute(def, local_size)
    }

    /// Emit a binary module containing the given entry points.
    pub fn emit(
        &self,
        lib: &mut ShaderLibrary,
        entry_points: &[EntryPointInfo],
    ) -> Result<EmitResult> {
        BinaryBackend::translate_entry_points(lib, entry_points)
    }
}
