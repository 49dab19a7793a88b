//! Worker admission, supervision, and the container runtime seam.

pub mod dispatcher;
pub mod runtime;

pub use dispatcher::Dispatcher;
pub use runtime::{ContainerRuntime, DockerRuntime, ExitStatus, SignalKind, WorkerHandle, WorkerSpec};
