//! Recoverable error taxonomy. Contract violations (bad resource generation,
//! recording against a completed command list, oversized push constants) are
//! programmer errors and are asserted against directly where they occur,
//! not modeled here.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("shader source file not found: {0}")]
    ShaderSourceNotFound(PathBuf),

    #[error("failed to resolve include {path} from {from}: {reason}")]
    ShaderInclude {
        path: String,
        from: PathBuf,
        reason: String,
    },

    #[error("shader compilation failed for {name}:\n{diagnostics}")]
    ShaderCompilation { name: String, diagnostics: String },

    #[error("push constant size {size} exceeds the {max} byte cap for pipeline '{pipeline}'")]
    PushConstantTooLarge {
        pipeline: String,
        size: u32,
        max: u32,
    },

    #[error("task '{task}' declares resource {resource:?} more than once")]
    DuplicateTaskResource { task: String, resource: String },

    #[error("no compatible surface format found for swapchain")]
    NoCompatibleSurfaceFormat,
}
