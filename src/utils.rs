use std::{
    env,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use tracing::info;

use crate::error::{ModelError, StartupError};
use crate::model::{CLASS_LIST_FILE, GRAPH_FILE, PREPROCESSOR_FILE};

const DEFAULT_PORT: u16 = 6969;
const DEFAULT_BODY_LIMIT_MB: usize = 10;
const DEFAULT_MODEL_DIR: &str = "./models/nsfw_detection";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub model_dir: PathBuf,
    pub model_url: Option<String>,
    pub class_list_url: Option<String>,
    pub preprocessor_url: Option<String>,
    pub auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StartupError> {
        let host = match lookup("HOST") {
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| StartupError::Config(format!("HOST must be an IP address, got {raw:?}")))?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = match lookup("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                StartupError::Config(format!(
                    "PORT must be a valid number between 0 and 65535, got {raw:?}"
                ))
            })?,
            None => DEFAULT_PORT,
        };

        let body_limit_bytes = {
            let mb = match lookup("BODY_LIMIT_MB") {
                Some(raw) => raw.parse::<usize>().map_err(|_| {
                    StartupError::Config(format!("BODY_LIMIT_MB must be a valid integer, got {raw:?}"))
                })?,
                None => DEFAULT_BODY_LIMIT_MB,
            };
            mb * 1024 * 1024
        };

        let model_dir = lookup("MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_DIR));

        Ok(Config {
            host,
            port,
            body_limit_bytes,
            model_dir,
            model_url: lookup("MODEL_URL"),
            class_list_url: lookup("CLASS_LIST_URL"),
            preprocessor_url: lookup("PREPROCESSOR_URL"),
            auth_token: lookup("MODEL_AUTH_TOKEN"),
        })
    }
}

async fn download_file(
    client: &reqwest::Client,
    headers: &HeaderMap,
    url: &str,
    path: &Path,
) -> Result<(), ModelError> {
    info!(url, path = %path.display(), "Downloading model artifact");

    let response = client.get(url).headers(headers.clone()).send().await?;
    if !response.status().is_success() {
        return Err(ModelError::Download(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    let bytes = response.bytes().await?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

/// Downloads the model artifacts into the configured cache directory.
pub async fn fetch_artifacts(config: &Config) -> Result<(), ModelError> {
    let model_url = config
        .model_url
        .as_deref()
        .ok_or_else(|| ModelError::Download("MODEL_URL environment variable not set".into()))?;
    let class_url = config
        .class_list_url
        .as_deref()
        .ok_or_else(|| ModelError::Download("CLASS_LIST_URL environment variable not set".into()))?;

    let mut headers = HeaderMap::new();
    if let Some(token) = &config.auth_token {
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ModelError::Download("invalid MODEL_AUTH_TOKEN format".into()))?;
        headers.insert(AUTHORIZATION, auth_value);
    }
    headers.insert(ACCEPT, HeaderValue::from_static("application/octet-stream"));

    tokio::fs::create_dir_all(&config.model_dir).await?;

    let client = reqwest::Client::new();
    let dir = &config.model_dir;
    download_file(&client, &headers, model_url, &dir.join(GRAPH_FILE)).await?;
    download_file(&client, &headers, class_url, &dir.join(CLASS_LIST_FILE)).await?;
    if let Some(url) = &config.preprocessor_url {
        download_file(&client, &headers, url, &dir.join(PREPROCESSOR_FILE)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, StartupError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.port, 6969);
        assert_eq!(config.host, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.body_limit_bytes, 10 * 1024 * 1024);
        assert_eq!(config.model_dir, PathBuf::from("./models/nsfw_detection"));
        assert!(config.model_url.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "5020"),
            ("BODY_LIMIT_MB", "2"),
            ("MODEL_DIR", "/tmp/models"),
            ("MODEL_URL", "https://example.com/frozen_graph.pb"),
        ])
        .unwrap();
        assert_eq!(config.host.to_string(), "127.0.0.1");
        assert_eq!(config.port, 5020);
        assert_eq!(config.body_limit_bytes, 2 * 1024 * 1024);
        assert_eq!(config.model_dir, PathBuf::from("/tmp/models"));
        assert_eq!(config.model_url.as_deref(), Some("https://example.com/frozen_graph.pb"));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(matches!(config_from(&[("PORT", "70000")]), Err(StartupError::Config(_))));
        assert!(matches!(config_from(&[("BODY_LIMIT_MB", "lots")]), Err(StartupError::Config(_))));
        assert!(matches!(config_from(&[("HOST", "localhost")]), Err(StartupError::Config(_))));
    }

    #[tokio::test]
    async fn fetch_without_urls_fails() {
        let config = config_from(&[("MODEL_DIR", "/nonexistent/cache")]).unwrap();
        let err = fetch_artifacts(&config).await.unwrap_err();
        assert!(matches!(err, ModelError::Download(_)));
    }
}
