//! Runtime backends implementing `SandboxBackend`

mod docker;

pub use docker::{DockerBackend, DockerRuntime};
