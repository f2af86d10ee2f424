//! Command rendering for the tensor-parallel transformer engine.

use serde::{Deserialize, Serialize};

use super::{gpu_env, LaunchInputs, ModelTask, RenderedLaunch};

/// Sparse parameter record for the transformer engine. Only set fields are
/// rendered; the engine's own defaults cover the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerParams {
    pub dtype: Option<String>,
    pub tensor_parallel: Option<u32>,
    pub gpu_memory_fraction: Option<f32>,
    pub max_context_len: Option<u32>,
    pub kv_cache_dtype: Option<String>,
    pub quantization: Option<String>,
    pub max_batched_tokens: Option<u32>,
    pub max_seqs: Option<u32>,
    pub swap_space_gb: Option<u32>,
    pub gpu_indices: Option<Vec<u32>>,
    pub flash_attention: Option<bool>,
    /// Draft model path for speculative decoding.
    pub draft_model_path: Option<String>,
}

pub(super) fn render(params: &TransformerParams, inputs: &LaunchInputs) -> RenderedLaunch {
    let mut argv: Vec<String> = Vec::new();

    argv.extend(["--model".to_string(), inputs.model_arg.clone()]);
    argv.extend([
        "--served-model-name".to_string(),
        inputs.served_name.clone(),
    ]);
    argv.extend(["--host".to_string(), "0.0.0.0".to_string()]);
    argv.extend(["--port".to_string(), inputs.port.to_string()]);

    if inputs.task == ModelTask::Embed {
        argv.extend(["--task".to_string(), "embed".to_string()]);
    }

    if let Some(dtype) = &params.dtype {
        argv.extend(["--dtype".to_string(), dtype.clone()]);
    }
    if let Some(tp) = params.tensor_parallel {
        argv.extend(["--tensor-parallel-size".to_string(), tp.to_string()]);
    }
    if let Some(fraction) = params.gpu_memory_fraction {
        argv.extend(["--gpu-memory-utilization".to_string(), fraction.to_string()]);
    }
    if let Some(len) = params.max_context_len {
        argv.extend(["--max-model-len".to_string(), len.to_string()]);
    }
    if let Some(dtype) = &params.kv_cache_dtype {
        argv.extend(["--kv-cache-dtype".to_string(), dtype.clone()]);
    }
    if let Some(quant) = &params.quantization {
        argv.extend(["--quantization".to_string(), quant.clone()]);
    }
    if let Some(v) = params.max_batched_tokens {
        argv.extend(["--max-num-batched-tokens".to_string(), v.to_string()]);
    }
    if let Some(v) = params.max_seqs {
        argv.extend(["--max-num-seqs".to_string(), v.to_string()]);
    }
    if let Some(v) = params.swap_space_gb {
        argv.extend(["--swap-space".to_string(), v.to_string()]);
    }
    if params.flash_attention == Some(false) {
        argv.push("--enforce-eager".to_string());
    }
    if let Some(draft) = &params.draft_model_path {
        argv.extend(["--speculative-model".to_string(), draft.clone()]);
    }

    let mut env = vec![format!("VLLM_API_KEY={}", inputs.internal_api_key)];
    if let Some(gpus) = gpu_env(params.gpu_indices.as_deref()) {
        env.push(gpus);
    }

    RenderedLaunch { argv, env }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{render_command, EngineParams};

    fn inputs() -> LaunchInputs {
        LaunchInputs {
            model_arg: "/models/llama-3-8b".to_string(),
            served_name: "llama-3-8b".to_string(),
            task: ModelTask::Generate,
            port: 8000,
            internal_api_key: "secret".to_string(),
        }
    }

    #[test]
    fn test_minimal_render_has_only_required_flags() {
        let params = EngineParams::TransformerEngine(TransformerParams::default());
        let launch = render_command(&params, &inputs());

        assert_eq!(
            launch.argv,
            vec![
                "--model",
                "/models/llama-3-8b",
                "--served-model-name",
                "llama-3-8b",
                "--host",
                "0.0.0.0",
                "--port",
                "8000",
            ]
        );
        assert_eq!(launch.env, vec!["VLLM_API_KEY=secret"]);
    }

    #[test]
    fn test_embed_task_renders_task_flag() {
        let params = EngineParams::TransformerEngine(TransformerParams::default());
        let mut inputs = inputs();
        inputs.task = ModelTask::Embed;

        let launch = render_command(&params, &inputs);
        let pos = launch.argv.iter().position(|a| a == "--task").unwrap();
        assert_eq!(launch.argv[pos + 1], "embed");
    }

    #[test]
    fn test_full_params_render() {
        let params = TransformerParams {
            dtype: Some("bfloat16".to_string()),
            tensor_parallel: Some(2),
            gpu_memory_fraction: Some(0.9),
            max_context_len: Some(8192),
            kv_cache_dtype: Some("fp8".to_string()),
            quantization: Some("awq".to_string()),
            max_batched_tokens: Some(4096),
            max_seqs: Some(64),
            swap_space_gb: Some(4),
            gpu_indices: Some(vec![0, 1]),
            flash_attention: Some(false),
            draft_model_path: Some("/models/draft".to_string()),
        };
        let launch = render(&params, &inputs());

        for flag in [
            "--dtype",
            "--tensor-parallel-size",
            "--gpu-memory-utilization",
            "--max-model-len",
            "--kv-cache-dtype",
            "--quantization",
            "--max-num-batched-tokens",
            "--max-num-seqs",
            "--swap-space",
            "--enforce-eager",
            "--speculative-model",
        ] {
            assert!(launch.argv.iter().any(|a| a == flag), "missing {flag}");
        }
        assert!(launch.env.contains(&"CUDA_VISIBLE_DEVICES=0,1".to_string()));
    }

    #[test]
    fn test_flash_attention_on_is_the_engine_default() {
        let params = TransformerParams {
            flash_attention: Some(true),
            ..Default::default()
        };
        let launch = render(&params, &inputs());
        assert!(!launch.argv.iter().any(|a| a == "--enforce-eager"));
    }
}
