//! Container execution layer.
//!
//! Containers are reached only through the [`ContainerRuntime`] trait; the
//! production implementation is [`DockerClient`] (bollard). On top of it,
//! [`ContainerController`] owns the per-task lifecycle:
//!
//! ```text
//! ensure image → create → start → readiness probe → checkout base → exec* → release
//! ```
//!
//! Every exec is bounded by a wall-clock limit, and every acquired
//! [`ContainerHandle`] is removed on release or, failing that, on drop.

pub mod container;
pub mod docker_client;
pub mod images;
pub mod resources;
pub mod runtime;
pub mod shell;

pub use container::{container_name, ContainerController, ContainerHandle, ExecOutcome};
pub use docker_client::DockerClient;
pub use images::{ensure_image, local_image_name, pull_images, remote_image_name, BuildSummary};
pub use resources::ExecutionLimits;
pub use runtime::{ContainerRuntime, ContainerSpec, ExecOutput};
