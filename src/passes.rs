//! Composable translation passes.
//!
//! Every downstream tool (textual backend, optimizer, validator,
//! disassembler, file writer) consumes and produces the same pair of
//! binary module and reflection data. Passes run in the order given and
//! are order-sensitive; a failing pass aborts the run with its diagnostic
//! attached, without retry.

use crate::error::{CompilerError, Result};
use crate::reflection::StageReflection;
use log::debug;

/// The data threaded through a pass pipeline.
#[derive(Debug, Clone, Default)]
pub struct TranslationPassData {
    pub binary: Vec<u32>,
    pub reflections: Vec<StageReflection>,
}

pub trait TranslationPass {
    fn name(&self) -> &str;

    /// Transform the module in place, or fail with a textual diagnostic.
    fn run(&self, data: &mut TranslationPassData) -> std::result::Result<(), String>;
}

/// Run every pass in order, stopping at the first failure.
pub fn run_passes(
    passes: &[Box<dyn TranslationPass>],
    data: &mut TranslationPassData,
) -> Result<()> {
    for pass in passes {
        debug!("running translation pass '{}'", pass.name());
        pass.run(data)
            .map_err(|message| CompilerError::PassError(pass.name().to_string(), message))?;
    }
    Ok(())
}
