use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    #[error("instance '{name}' not found")]
    #[diagnostic(help("run `tock list` to see registered instances, or `tock init` to create one"))]
    InstanceNotFound { name: String },

    #[error("instance is paused: {path}")]
    #[diagnostic(help("delete the paused file to resume ticking (may fail again)"))]
    Paused { path: String },

    #[error("tick ended abnormally: {reason}")]
    #[diagnostic(help("see system/crash_notify.txt and the latest tick log for details"))]
    TickAbnormal { reason: String },

    #[error("container unavailable: {message}")]
    #[diagnostic(help("ensure podman is installed and system/container/Containerfile builds"))]
    ContainerUnavailable { message: String },

    #[error("session provider error: {message}")]
    Provider { message: String },

    #[error("{command} failed: {message}")]
    #[diagnostic(help("ensure {command} is installed and accessible"))]
    ExternalCommand { command: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl KernelError {
    /// Process exit code for the CLI: 3 unknown instance, 4 abnormal tick,
    /// 5 paused, 1 anything else. Usage errors exit 2 via clap.
    pub fn exit_code(&self) -> i32 {
        match self {
            KernelError::InstanceNotFound { .. } => 3,
            KernelError::TickAbnormal { .. } => 4,
            KernelError::Paused { .. } => 5,
            _ => 1,
        }
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        KernelError::Io {
            context: context.into(),
            source,
        }
    }
}
