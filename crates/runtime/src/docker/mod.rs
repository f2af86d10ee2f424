pub mod client;
pub mod container;
pub mod image;
pub mod network;

pub use client::{DockerClient, DriverError};
pub use container::{ContainerCreateSpec, ContainerRunState, MountSpec, PrefixedContainer};
pub use image::ImageFacts;
pub use network::NetworkChoice;
