use std::{env, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";

/// Runtime settings, read once from the process environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub classifier_model_path: PathBuf,
    pub classifier_labels_path: PathBuf,
    pub upload_dir: PathBuf,
    pub public_dir: PathBuf,
    pub keep_uploads: bool,
    pub expose_error_details: bool,
    pub call_timeout: Duration,
    pub max_concurrent_jobs: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup, so tests don't have to touch
    /// the real environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("PORT") {
            Some(v) => v
                .trim()
                .parse::<u16>()
                .with_context(|| format!("PORT must be a port number, got {v:?}"))?,
            None => DEFAULT_PORT,
        };

        let call_timeout_secs = match get("CALL_TIMEOUT_SECS") {
            Some(v) => v
                .trim()
                .parse::<u64>()
                .with_context(|| format!("CALL_TIMEOUT_SECS must be a number of seconds, got {v:?}"))?,
            None => 30,
        };
        if call_timeout_secs == 0 {
            return Err(anyhow!("CALL_TIMEOUT_SECS must be greater than zero"));
        }

        let max_concurrent_jobs = match get("MAX_CONCURRENT_JOBS") {
            Some(v) => v
                .trim()
                .parse::<usize>()
                .with_context(|| format!("MAX_CONCURRENT_JOBS must be a number, got {v:?}"))?,
            None => 8,
        };
        if max_concurrent_jobs == 0 {
            return Err(anyhow!("MAX_CONCURRENT_JOBS must be greater than zero"));
        }

        Ok(Self {
            port,
            openai_api_key: get("OPENAI_API_KEY").map(|v| v.trim().to_string()),
            openai_base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: get("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            classifier_model_path: get("CLASSIFIER_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models/mobilenetv2-7.onnx")),
            classifier_labels_path: get("CLASSIFIER_LABELS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("models/imagenet_classes.txt")),
            upload_dir: get("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("uploads")),
            public_dir: get("PUBLIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("public")),
            keep_uploads: parse_flag("KEEP_UPLOADS", get("KEEP_UPLOADS"))?,
            expose_error_details: parse_flag("EXPOSE_ERROR_DETAILS", get("EXPOSE_ERROR_DETAILS"))?,
            call_timeout: Duration::from_secs(call_timeout_secs),
            max_concurrent_jobs,
        })
    }
}

fn parse_flag(key: &str, value: Option<String>) -> anyhow::Result<bool> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{key} must be a boolean, got {other:?}")),
    }
}
