//! Engine parameter records and command rendering.
//!
//! Each engine kind has its own typed parameter record; rendering the
//! container command line is a pure function of (kind, params, resolved
//! inputs). No string-keyed maps cross this boundary.

pub mod quantized;
pub mod transformer;

use serde::{Deserialize, Serialize};

pub use quantized::QuantizedParams;
pub use transformer::TransformerParams;

/// The two engine kinds this control plane orchestrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Tensor-parallel server for standard transformer checkpoints.
    TransformerEngine,
    /// GGUF server for pre-quantized weight files, including split sets.
    QuantizedEngine,
}

impl EngineKind {
    /// Port the engine listens on inside its container.
    pub fn container_port(self) -> u16 {
        match self {
            EngineKind::TransformerEngine => 8000,
            EngineKind::QuantizedEngine => 8080,
        }
    }

    /// Graceful stop timeout in seconds. The quantized engine gets longer
    /// because KV-cache release on large contexts is slow.
    pub fn stop_timeout_secs(self) -> u32 {
        match self {
            EngineKind::TransformerEngine => 5,
            EngineKind::QuantizedEngine => 10,
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineKind::TransformerEngine => write!(f, "transformer-engine"),
            EngineKind::QuantizedEngine => write!(f, "quantized-engine"),
        }
    }
}

/// What a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTask {
    Generate,
    Embed,
}

impl std::fmt::Display for ModelTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelTask::Generate => write!(f, "generate"),
            ModelTask::Embed => write!(f, "embed"),
        }
    }
}

/// Tagged engine parameters; exactly one variant per engine kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "kebab-case")]
pub enum EngineParams {
    TransformerEngine(TransformerParams),
    QuantizedEngine(QuantizedParams),
}

impl EngineParams {
    pub fn kind(&self) -> EngineKind {
        match self {
            EngineParams::TransformerEngine(_) => EngineKind::TransformerEngine,
            EngineParams::QuantizedEngine(_) => EngineKind::QuantizedEngine,
        }
    }

    pub fn gpu_indices(&self) -> Option<&[u32]> {
        match self {
            EngineParams::TransformerEngine(p) => p.gpu_indices.as_deref(),
            EngineParams::QuantizedEngine(p) => p.gpu_indices.as_deref(),
        }
    }
}

/// Inputs resolved by the lifecycle manager before rendering: where the
/// weights are (as seen inside the container) and what to serve them as.
#[derive(Debug, Clone)]
pub struct LaunchInputs {
    /// Model argument: a remote repo id, or the container-side weight path.
    pub model_arg: String,
    pub served_name: String,
    pub task: ModelTask,
    pub port: u16,
    pub internal_api_key: String,
}

/// A fully rendered container launch: argv and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLaunch {
    pub argv: Vec<String>,
    pub env: Vec<String>,
}

/// Render the engine command for one model. Pure: no I/O, no clock.
pub fn render_command(params: &EngineParams, inputs: &LaunchInputs) -> RenderedLaunch {
    match params {
        EngineParams::TransformerEngine(p) => transformer::render(p, inputs),
        EngineParams::QuantizedEngine(p) => quantized::render(p, inputs),
    }
}

/// GPU selection renders to environment, not argv, so both engines see it
/// the same way.
pub(crate) fn gpu_env(gpu_indices: Option<&[u32]>) -> Option<String> {
    gpu_indices.map(|indices| {
        let list = indices
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("CUDA_VISIBLE_DEVICES={list}")
    })
}
