//! Configuração do reelforge carregada a partir de `reelforge.toml`.
//!
//! A struct [`ReelforgeConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Variáveis de ambiente `REELFORGE_*` têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::pipeline::{CallbackConfig, PipelineSettings, WorkerPoolConfig};
use crate::state_machine::{PollConfig, RetryConfig};

pub const DEFAULT_CONFIG_FILE: &str = "reelforge.toml";

/// Configuração de nível superior carregada de `reelforge.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReelforgeConfig {
    /// Diretório onde cada job é persistido como um arquivo JSON.
    pub store_dir: PathBuf,

    /// Diretório onde os vídeos montados são gravados.
    pub output_dir: PathBuf,

    /// Único diretório de onde assets `file://` podem ser lidos. Sem ele, só URLs http(s).
    pub asset_root: Option<PathBuf>,

    pub retry: RetryConfig,
    pub poll: PollConfig,
    pub workers: WorkersConfig,
    pub queue: QueueConfig,
    pub webhook: WebhookConfig,
    pub providers: ProvidersConfig,
}

impl Default for ReelforgeConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("data/jobs"),
            output_dir: PathBuf::from("data/videos"),
            asset_root: None,
            retry: RetryConfig::default(),
            poll: PollConfig::default(),
            workers: WorkersConfig::default(),
            queue: QueueConfig::default(),
            webhook: WebhookConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// Número de workers consumindo a fila.
    pub count: usize,
    /// Prazo de cada chamada externa (provider ou ffmpeg).
    pub stage_timeout_secs: u64,
    pub idle_poll_ms: u64,
    /// Intervalo da varredura de recuperação.
    pub recovery_interval_secs: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: 4,
            stage_timeout_secs: 600,
            idle_poll_ms: 250,
            recovery_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Por quanto tempo uma chave já confirmada continua deduplicada.
    pub dedup_window_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub bind: String,
    /// URL pública pela qual os providers alcançam este serviço.
    pub public_base_url: Option<String>,
    pub secret: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            public_base_url: None,
            secret: None,
        }
    }
}

impl WebhookConfig {
    /// Callbacks só são anunciados quando a URL pública e o segredo estão definidos.
    pub fn callback(&self) -> Option<CallbackConfig> {
        match (&self.public_base_url, &self.secret) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => {
                Some(CallbackConfig {
                    public_base_url: url.clone(),
                    secret: secret.clone(),
                })
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub llm: ProviderConfig,
    pub music: ProviderConfig,
    pub image: ProviderConfig,
    /// Sem publicador configurado, o estágio `uploading` termina sem publicação.
    pub publisher: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: String,
    /// Desligue para serviços que não enviam callbacks; suas tarefas são consultadas.
    pub callbacks: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: String::new(),
            callbacks: true,
        }
    }
}

impl ReelforgeConfig {
    /// Carrega a configuração de `path` ou de `reelforge.toml` no diretório atual.
    /// Usa valores padrão se o arquivo padrão não existir.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config in {}", path.display()))
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, name: &str| {
            if let Some(value) = var(name).filter(|v| !v.is_empty()) {
                *target = value;
            }
        };
        set(&mut self.providers.llm.api_key, "REELFORGE_LLM_API_KEY");
        set(&mut self.providers.music.api_key, "REELFORGE_MUSIC_API_KEY");
        set(&mut self.providers.image.api_key, "REELFORGE_IMAGE_API_KEY");
        if let Some(publisher) = self.providers.publisher.as_mut() {
            set(&mut publisher.api_key, "REELFORGE_PUBLISHER_API_KEY");
        }
        if let Some(secret) = var("REELFORGE_WEBHOOK_SECRET").filter(|v| !v.is_empty()) {
            self.webhook.secret = Some(secret);
        }
        if let Some(url) = var("REELFORGE_PUBLIC_URL").filter(|v| !v.is_empty()) {
            self.webhook.public_base_url = Some(url);
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry: self.retry.clone(),
            poll: self.poll.clone(),
            callback: self.webhook.callback(),
            stage_timeout: Duration::from_secs(self.workers.stage_timeout_secs),
        }
    }

    pub fn worker_pool(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers: self.workers.count,
            poll_interval_ms: self.workers.idle_poll_ms,
        }
    }
}
