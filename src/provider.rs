use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::model::{ChatModel, OpenAiCompatConfig, OpenAiCompatModel};

const MODEL_REQUEST_TIMEOUT_SECS: u64 = 300;

/// Connection defaults for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderSpec {
    pub provider: Provider,
    pub api_key_env: &'static str,
    pub base_url_env: &'static str,
    pub default_base_url: &'static str,
    pub default_model: &'static str,
}

/// Detection order for `--provider auto`.
pub const PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        provider: Provider::Deepseek,
        api_key_env: "DEEPSEEK_API_KEY",
        base_url_env: "DEEPSEEK_BASE_URL",
        default_base_url: "https://api.deepseek.com",
        default_model: "deepseek-chat",
    },
    ProviderSpec {
        provider: Provider::Qwen,
        api_key_env: "DASHSCOPE_API_KEY",
        base_url_env: "QWEN_BASE_URL",
        default_base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1",
        default_model: "qwen-plus",
    },
    ProviderSpec {
        provider: Provider::Openai,
        api_key_env: "OPENAI_API_KEY",
        base_url_env: "OPENAI_BASE_URL",
        default_base_url: "https://api.openai.com/v1",
        default_model: "gpt-4o-mini",
    },
    ProviderSpec {
        provider: Provider::NimMinimaxM2,
        api_key_env: "NVIDIA_API_KEY",
        base_url_env: "NIM_BASE_URL",
        default_base_url: "https://integrate.api.nvidia.com/v1",
        default_model: "minimaxai/minimax-m2",
    },
    ProviderSpec {
        provider: Provider::NimGlm47,
        api_key_env: "NVIDIA_API_KEY",
        base_url_env: "NIM_BASE_URL",
        default_base_url: "https://integrate.api.nvidia.com/v1",
        default_model: "z-ai/glm4.7",
    },
];

pub fn provider_spec(provider: Provider) -> Option<&'static ProviderSpec> {
    PROVIDERS.iter().find(|spec| spec.provider == provider)
}

pub fn detect_provider() -> Option<Provider> {
    PROVIDERS
        .iter()
        .find(|spec| env_present(spec.api_key_env))
        .map(|spec| spec.provider)
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
    Provider::from_str(&normalized, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, deepseek, qwen, openai, nim_minimax_m2, nim_glm47",
            value
        )
    })
}

/// Model and base URL that `provider` would use under `cfg`.
pub fn resolved_endpoint(spec: &ProviderSpec, cfg: &RuntimeConfig) -> (String, String) {
    let base_url = std::env::var(spec.base_url_env)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| spec.default_base_url.to_string());
    let model = cfg
        .model
        .clone()
        .unwrap_or_else(|| spec.default_model.to_string());
    (base_url, model)
}

pub fn resolve_model(cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Provider, String)> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of DEEPSEEK_API_KEY, DASHSCOPE_API_KEY, \
             OPENAI_API_KEY or NVIDIA_API_KEY, or pass --provider",
        )?,
        p => p,
    };
    let spec = provider_spec(provider)
        .ok_or_else(|| anyhow::anyhow!("provider '{provider}' has no connection settings"))?;

    let api_key = std::env::var(spec.api_key_env)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .with_context(|| format!("{} is required for provider '{provider}'", spec.api_key_env))?;
    let (base_url, model_name) = resolved_endpoint(spec, cfg);
    let model = OpenAiCompatModel::new(
        provider.id(),
        OpenAiCompatConfig {
            base_url,
            api_key,
            model: model_name.clone(),
            temperature: cfg.temperature,
            request_timeout: Duration::from_secs(MODEL_REQUEST_TIMEOUT_SECS),
        },
    )?;
    Ok((Arc::new(model), provider, model_name))
}

/// Builds the chat model for a runtime config. Swappable so sessions can be
/// driven by scripted models.
pub trait ModelResolver: Send + Sync {
    fn resolve(&self, cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Provider, String)>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvModelResolver;

impl ModelResolver for EnvModelResolver {
    fn resolve(&self, cfg: &RuntimeConfig) -> Result<(Arc<dyn ChatModel>, Provider, String)> {
        resolve_model(cfg)
    }
}
