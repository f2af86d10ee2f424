//! Engine runtime capability layer.
//!
//! Everything the control plane needs to materialize a model as a local
//! container: the Docker driver, local image enumeration, engine command
//! rendering, and on-disk weight resolution. This crate never talks to the
//! database or the network beyond the Docker socket.

pub mod docker;
pub mod engines;
pub mod weights;
