//! Program builder: compile kernel source for the context's device.

use tracing::{debug, error, info};

use crate::accel::{release, Context, PipelineError};
use crate::runtime::{Handle, ProgramId};

/// Upper bound on the build log surfaced in [`PipelineError::BuildFailed`].
pub const BUILD_LOG_LIMIT: usize = 2048;

/// A successfully built program. Only built programs are ever returned, so
/// a kernel can never be extracted from a failed build.
pub struct Program<'c> {
    context: &'c Context<'c>,
    id: ProgramId,
}

impl<'c> Program<'c> {
    /// Create a program from `source` and compile it synchronously.
    pub fn build(context: &'c Context<'c>, source: &str) -> Result<Self, PipelineError> {
        let runtime = context.runtime();
        let id = runtime
            .create_program(context.id(), source)
            .map_err(|e| PipelineError::BuildFailed { log: e.to_string() })?;
        // Guard first so a failed build still releases the program object.
        let program = Self { context, id };
        debug!(program = %id, source_len = source.len(), "program created");

        if let Err(e) = runtime.build_program(id, context.device()) {
            let log = match runtime.build_log(id, context.device()) {
                Ok(log) if !log.trim().is_empty() => log,
                _ => e.to_string(),
            };
            let log = bound_log(log);
            error!(program = %id, "program build failed");
            return Err(PipelineError::BuildFailed { log });
        }

        info!(program = %id, "program built");
        Ok(program)
    }

    pub fn id(&self) -> ProgramId {
        self.id
    }

    pub fn context(&self) -> &'c Context<'c> {
        self.context
    }
}

impl Drop for Program<'_> {
    fn drop(&mut self) {
        release(self.context.runtime(), Handle::Program(self.id));
    }
}

/// Truncate `log` to at most [`BUILD_LOG_LIMIT`] bytes on a char boundary.
fn bound_log(mut log: String) -> String {
    if log.len() > BUILD_LOG_LIMIT {
        let mut cut = BUILD_LOG_LIMIT;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        log.truncate(cut);
    }
    log
}
