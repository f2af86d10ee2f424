//! Command rendering for the quantized GGUF engine.

use serde::{Deserialize, Serialize};

use super::{gpu_env, LaunchInputs, RenderedLaunch};

/// Sparse parameter record for the quantized engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizedParams {
    pub ctx_size: Option<u32>,
    pub parallel: Option<u32>,
    pub n_gpu_layers: Option<u32>,
    /// "none", "layer", or "row".
    pub split_mode: Option<String>,
    /// Comma-separated per-device ratios, e.g. "0.5,0.5".
    pub tensor_split: Option<String>,
    pub flash_attention: Option<bool>,
    pub cache_type_k: Option<String>,
    pub cache_type_v: Option<String>,
    /// "distribute", "isolate", or "numactl".
    pub numa_policy: Option<String>,
    pub gpu_indices: Option<Vec<u32>>,
}

pub(super) fn render(params: &QuantizedParams, inputs: &LaunchInputs) -> RenderedLaunch {
    let mut argv: Vec<String> = Vec::new();

    argv.extend(["--model".to_string(), inputs.model_arg.clone()]);
    argv.extend(["--alias".to_string(), inputs.served_name.clone()]);
    argv.extend(["--host".to_string(), "0.0.0.0".to_string()]);
    argv.extend(["--port".to_string(), inputs.port.to_string()]);
    argv.extend(["--api-key".to_string(), inputs.internal_api_key.clone()]);

    if let Some(ctx) = params.ctx_size {
        argv.extend(["--ctx-size".to_string(), ctx.to_string()]);
    }
    if let Some(parallel) = params.parallel {
        argv.extend(["--parallel".to_string(), parallel.to_string()]);
    }
    if let Some(layers) = params.n_gpu_layers {
        argv.extend(["--n-gpu-layers".to_string(), layers.to_string()]);
    }
    if let Some(mode) = &params.split_mode {
        argv.extend(["--split-mode".to_string(), mode.clone()]);
    }
    if let Some(split) = &params.tensor_split {
        argv.extend(["--tensor-split".to_string(), split.clone()]);
    }
    if params.flash_attention == Some(true) {
        argv.push("--flash-attn".to_string());
    }
    if let Some(t) = &params.cache_type_k {
        argv.extend(["--cache-type-k".to_string(), t.clone()]);
    }
    if let Some(t) = &params.cache_type_v {
        argv.extend(["--cache-type-v".to_string(), t.clone()]);
    }
    if let Some(numa) = &params.numa_policy {
        argv.extend(["--numa".to_string(), numa.clone()]);
    }

    let mut env = Vec::new();
    if let Some(gpus) = gpu_env(params.gpu_indices.as_deref()) {
        env.push(gpus);
    }

    RenderedLaunch { argv, env }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::ModelTask;

    fn inputs() -> LaunchInputs {
        LaunchInputs {
            model_arg: "/models/big/w-00001-of-00003.gguf".to_string(),
            served_name: "big-gguf".to_string(),
            task: ModelTask::Generate,
            port: 8080,
            internal_api_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_points_engine_at_first_split_part() {
        let launch = render(&QuantizedParams::default(), &inputs());
        let pos = launch.argv.iter().position(|a| a == "--model").unwrap();
        assert_eq!(launch.argv[pos + 1], "/models/big/w-00001-of-00003.gguf");
    }

    #[test]
    fn test_api_key_is_argv_not_env() {
        let launch = render(&QuantizedParams::default(), &inputs());
        assert!(launch.argv.iter().any(|a| a == "--api-key"));
        assert!(launch.env.is_empty());
    }

    #[test]
    fn test_gpu_and_split_flags() {
        let params = QuantizedParams {
            ctx_size: Some(16384),
            parallel: Some(4),
            n_gpu_layers: Some(999),
            split_mode: Some("layer".to_string()),
            tensor_split: Some("0.5,0.5".to_string()),
            flash_attention: Some(true),
            cache_type_k: Some("q8_0".to_string()),
            cache_type_v: Some("q8_0".to_string()),
            numa_policy: Some("distribute".to_string()),
            gpu_indices: Some(vec![1]),
        };
        let launch = render(&params, &inputs());

        for flag in [
            "--ctx-size",
            "--parallel",
            "--n-gpu-layers",
            "--split-mode",
            "--tensor-split",
            "--flash-attn",
            "--cache-type-k",
            "--cache-type-v",
            "--numa",
        ] {
            assert!(launch.argv.iter().any(|a| a == flag), "missing {flag}");
        }
        assert_eq!(launch.env, vec!["CUDA_VISIBLE_DEVICES=1"]);
    }
}
