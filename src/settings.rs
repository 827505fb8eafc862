use std::path::{Path, PathBuf};

use config::Config;
use serde::Deserialize;

use crate::error::{CollectError, Result};
use crate::record::Endpoint;

pub const DEFAULT_CONFIG_FILE: &str = "configs/collector.toml";
const ENV_PREFIX: &str = "DRUGDATA";
/// Key variable name used by the earlier collector scripts.
const LEGACY_KEY_VAR: &str = "DATA_PORTAL_API_KEY_DECODED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    File,
    Database,
}

/// Process-wide, read-only run configuration. Built once in `main` and passed
/// by reference into each stage.
#[derive(Debug, Clone)]
pub struct Settings {
    pub api_key: String,
    pub approval_url: String,
    pub pill_url: String,
    pub page_size: u32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// First retry delay; doubles on every further attempt.
    pub retry_backoff_ms: u64,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub mode: OutputMode,
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    api_key: Option<String>,
    approval_url: Option<String>,
    pill_url: Option<String>,
    page_size: Option<u32>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    output_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    mode: Option<OutputMode>,
}

impl Settings {
    /// Defaults for everything except the key.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Settings {
            api_key: api_key.into(),
            approval_url: Endpoint::Approval.default_url().to_string(),
            pill_url: Endpoint::Pill.default_url().to_string(),
            page_size: 100,
            timeout_secs: 30,
            max_retries: 0,
            retry_backoff_ms: 2000,
            output_dir: PathBuf::from("data"),
            db_path: PathBuf::from("data/drugs.sqlite"),
            mode: OutputMode::File,
        }
    }

    /// Optional config file first, then `DRUGDATA_*` environment variables.
    pub fn load_from(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| CollectError::Config(e.to_string()))?;
        let raw: RawSettings = cfg
            .try_deserialize()
            .map_err(|e| CollectError::Config(e.to_string()))?;
        Self::resolve(raw, std::env::var(LEGACY_KEY_VAR).ok())
    }

    fn resolve(raw: RawSettings, legacy_key: Option<String>) -> Result<Self> {
        let api_key = raw
            .api_key
            .filter(|k| !k.trim().is_empty())
            .or(legacy_key)
            .unwrap_or_default();
        let mut s = Settings::with_api_key(api_key.trim());
        if let Some(v) = raw.approval_url {
            s.approval_url = v;
        }
        if let Some(v) = raw.pill_url {
            s.pill_url = v;
        }
        if let Some(v) = raw.page_size {
            if v == 0 {
                return Err(CollectError::Config("page_size must be at least 1".into()));
            }
            s.page_size = v;
        }
        if let Some(v) = raw.timeout_secs {
            s.timeout_secs = v;
        }
        if let Some(v) = raw.max_retries {
            s.max_retries = v;
        }
        if let Some(v) = raw.retry_backoff_ms {
            s.retry_backoff_ms = v;
        }
        if let Some(v) = raw.output_dir {
            s.output_dir = v;
        }
        if let Some(v) = raw.db_path {
            s.db_path = v;
        }
        if let Some(v) = raw.mode {
            s.mode = v;
        }
        Ok(s)
    }

    /// The key is only needed by commands that call the portal.
    pub fn require_api_key(&self) -> Result<&str> {
        if self.api_key.is_empty() {
            return Err(CollectError::Config(format!(
                "API key missing: set {}_API_KEY or api_key in {}",
                ENV_PREFIX, DEFAULT_CONFIG_FILE
            )));
        }
        Ok(&self.api_key)
    }

    pub fn endpoint_url(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Approval => &self.approval_url,
            Endpoint::Pill => &self.pill_url,
        }
    }

    pub fn json_path(&self, endpoint: Endpoint) -> PathBuf {
        self.output_dir.join(format!("{}.json", endpoint.table_name()))
    }

    /// Records whose label documents had to be kept as plain text.
    pub fn error_report_path(&self) -> PathBuf {
        self.output_dir.join("error_report.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> RawSettings {
        RawSettings {
            api_key: None,
            approval_url: None,
            pill_url: None,
            page_size: None,
            timeout_secs: None,
            max_retries: None,
            retry_backoff_ms: None,
            output_dir: None,
            db_path: None,
            mode: None,
        }
    }

    #[test]
    fn missing_key_is_config_error() {
        let s = Settings::resolve(empty(), None).unwrap();
        let err = s.require_api_key().unwrap_err();
        assert!(matches!(err, CollectError::Config(_)));
    }

    #[test]
    fn legacy_key_is_fallback() {
        let s = Settings::resolve(empty(), Some(" legacy ".into())).unwrap();
        assert_eq!(s.require_api_key().unwrap(), "legacy");

        let mut raw = empty();
        raw.api_key = Some("primary".into());
        let s = Settings::resolve(raw, Some("legacy".into())).unwrap();
        assert_eq!(s.api_key, "primary");
    }

    #[test]
    fn zero_page_size_rejected() {
        let mut raw = empty();
        raw.api_key = Some("k".into());
        raw.page_size = Some(0);
        assert!(Settings::resolve(raw, None).is_err());
    }

    #[test]
    fn reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collector.toml");
        std::fs::write(
            &path,
            "api_key = \"file-key\"\npage_size = 50\nretry_backoff_ms = 500\nmode = \"database\"\noutput_dir = \"out\"\n",
        )
        .unwrap();

        let s = Settings::load_from(&path).unwrap();
        assert_eq!(s.page_size, 50);
        assert_eq!(s.retry_backoff_ms, 500);
        assert_eq!(s.max_retries, 0);
        assert_eq!(s.mode, OutputMode::Database);
        assert_eq!(s.json_path(Endpoint::Pill), PathBuf::from("out/pill_identifications.json"));
        assert_eq!(s.endpoint_url(Endpoint::Approval), Endpoint::Approval.default_url());
    }
}
