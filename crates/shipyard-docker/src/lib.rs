//! Container runtime boundary: the traits the engine drives and the Docker CLI behind them.

pub mod docker;
pub mod error;
pub mod runtime;

pub use docker::DockerCli;
pub use error::DockerError;
pub use runtime::{
    Change, ChangeKind, ContainerRuntime, ContainerSpec, ImageBuilder, ImageSummary, VolumeBinding,
};
