//! Kiln runtime - everything that touches the daemon or a registry.
//!
//! The image abstraction ([`image::Image`]) has two backing variants: Local
//! (daemon-resident) and Remote (registry-resident). The rebase engine, build
//! delegation, and run supervisor are written against that capability set and
//! the narrow [`docker::ContainerRuntime`] interface, never against a concrete
//! backing, so tests substitute in-memory fakes.

pub mod build;
pub mod builder;
pub mod docker;
pub mod image;
pub mod metadata;
pub mod rebase;
pub mod run;

mod tarball;

pub use build::{BuildFactory, BuildFlags, Task};
pub use builder::{BuilderFactory, CreateBuilderFlags};
pub use docker::{ContainerRuntime, DockerClient};
pub use image::{Image, ImageFactory};
pub use metadata::{AppImageMetadata, METADATA_LABEL, STACK_ID_LABEL};
pub use rebase::{RebaseFlags, RebaseOperation, Rebaser};
pub use run::{parse_ports, PortBinding, RunSupervisor};
