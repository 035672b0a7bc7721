use std::io::Read;
use std::{env, fs};

use crate::spotify::SpotifyCredentials;
use crate::{env_or, LOG};

pub const CLIENT_ID_ENV: &str = "CLIENT_ID_ENV";
pub const CLIENT_SECRET_ENV: &str = "CLIENT_SECRET_ENV";
pub const REFRESH_TOKEN_ENV: &str = "REFRESH_TOKEN_ENV";
pub const BUCKET_ENV: &str = "GCS_BUCKET_ENV";
pub const OBJECT_ENV: &str = "GCS_OBJECT_ENV";

pub const DEFAULT_SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
pub const DEFAULT_SPOTIFY_API_URL: &str = "https://api.spotify.com/v1";
pub const DEFAULT_GCS_URL: &str = "https://storage.googleapis.com";

const MAX_TOKEN_EXPIRY_BUFFER_SECONDS: i64 = 24 * 60 * 60;

pub struct Config {
    pub version: String,
    pub host: String,
    pub port: u16,
    pub log_format: String,
    pub log_level: String,
    pub spotify: SpotifyCredentials,
    pub spotify_token_url: String,
    pub spotify_api_url: String,
    // seconds before the reported expiry at which a cached token
    // is treated as stale and refreshed
    pub token_expiry_buffer_seconds: i64,
    pub gcs_bucket: String,
    pub gcs_object: String,
    // when set, talk to a GCS emulator at this base url without auth
    pub storage_emulator_host: Option<String>,
    pub gce_metadata_host: String,
    pub ideas_write_attempts: u32,
}

/// Read a variable that must be present and non-empty
fn required(k: &str) -> anyhow::Result<String> {
    match env::var(k) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(anyhow::anyhow!("missing required environment variable {}", k)),
    }
}

fn parsed_or<T: std::str::FromStr>(k: &str, default: T) -> anyhow::Result<T> {
    match env::var(k) {
        Err(_) => Ok(default),
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {}: {:?}", k, v)),
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let version = fs::File::open("commit_hash.txt")
            .and_then(|mut f| {
                let mut s = String::new();
                f.read_to_string(&mut s)?;
                Ok(s.trim().to_string())
            })
            .unwrap_or_else(|_| "unknown".to_string());
        let spotify = SpotifyCredentials {
            client_id: required(CLIENT_ID_ENV)?,
            client_secret: required(CLIENT_SECRET_ENV)?,
            refresh_token: required(REFRESH_TOKEN_ENV)?,
        };
        Ok(Self {
            version,
            host: env_or("HOST", "0.0.0.0"),
            port: parsed_or("PORT", 8080)?,
            log_format: env_or("LOG_FORMAT", "json")
                .to_lowercase()
                .trim()
                .to_string(),
            log_level: env_or("LOG_LEVEL", "INFO"),
            spotify,
            spotify_token_url: env_or("SPOTIFY_TOKEN_URL", DEFAULT_SPOTIFY_TOKEN_URL),
            spotify_api_url: env_or("SPOTIFY_API_URL", DEFAULT_SPOTIFY_API_URL),
            token_expiry_buffer_seconds: parsed_or("TOKEN_EXPIRY_BUFFER_SECONDS", 30)?,
            gcs_bucket: required(BUCKET_ENV)?,
            gcs_object: required(OBJECT_ENV)?,
            storage_emulator_host: env::var("STORAGE_EMULATOR_HOST")
                .ok()
                .filter(|h| !h.trim().is_empty()),
            gce_metadata_host: env_or("GCE_METADATA_HOST", "metadata.google.internal"),
            ideas_write_attempts: parsed_or("IDEAS_WRITE_ATTEMPTS", 5)?,
        })
    }

    pub fn initialize(&self) -> anyhow::Result<()> {
        if self.ideas_write_attempts == 0 {
            return Err(anyhow::anyhow!("IDEAS_WRITE_ATTEMPTS must be at least 1"));
        }
        if !(0..=MAX_TOKEN_EXPIRY_BUFFER_SECONDS).contains(&self.token_expiry_buffer_seconds) {
            return Err(anyhow::anyhow!(
                "TOKEN_EXPIRY_BUFFER_SECONDS must be between 0 and {}",
                MAX_TOKEN_EXPIRY_BUFFER_SECONDS
            ));
        }
        slog::info!(
            LOG, "initialized config";
            "version" => &self.version,
            "host" => &self.host,
            "port" => &self.port,
            "log_format" => &self.log_format,
            "log_level" => &self.log_level,
            "gcs_bucket" => &self.gcs_bucket,
            "gcs_object" => &self.gcs_object,
            "storage_emulator" => self.storage_emulator_host.is_some(),
            "token_expiry_buffer_seconds" => self.token_expiry_buffer_seconds,
        );
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base url of the GCS JSON api, or the emulator when one is configured
    pub fn gcs_url(&self) -> String {
        match &self.storage_emulator_host {
            Some(host) if host.starts_with("http") => host.trim_end_matches('/').to_string(),
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => DEFAULT_GCS_URL.to_string(),
        }
    }

    pub fn metadata_token_url(&self) -> String {
        format!(
            "http://{}/computeMetadata/v1/instance/service-accounts/default/token",
            self.gce_metadata_host
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_emulator(emulator: Option<&str>) -> Config {
        Config {
            version: "test".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_format: "json".to_string(),
            log_level: "INFO".to_string(),
            spotify: SpotifyCredentials {
                client_id: "id".to_string(),
                client_secret: "secret".to_string(),
                refresh_token: "refresh".to_string(),
            },
            spotify_token_url: DEFAULT_SPOTIFY_TOKEN_URL.to_string(),
            spotify_api_url: DEFAULT_SPOTIFY_API_URL.to_string(),
            token_expiry_buffer_seconds: 30,
            gcs_bucket: "bucket".to_string(),
            gcs_object: "ideas.json".to_string(),
            storage_emulator_host: emulator.map(|e| e.to_string()),
            gce_metadata_host: "metadata.google.internal".to_string(),
            ideas_write_attempts: 5,
        }
    }

    #[test]
    fn gcs_url_prefers_emulator() {
        assert_eq!(config_with_emulator(None).gcs_url(), DEFAULT_GCS_URL);
        assert_eq!(
            config_with_emulator(Some("localhost:4443")).gcs_url(),
            "http://localhost:4443"
        );
        assert_eq!(
            config_with_emulator(Some("https://gcs.test/")).gcs_url(),
            "https://gcs.test"
        );
    }

    #[test]
    fn listen_addr_joins_host_and_port() {
        assert_eq!(config_with_emulator(None).listen_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn zero_write_attempts_is_rejected() {
        let mut config = config_with_emulator(None);
        config.ideas_write_attempts = 0;
        assert!(config.initialize().is_err());
    }

    #[test]
    fn out_of_range_expiry_buffer_is_rejected() {
        let mut config = config_with_emulator(None);
        config.token_expiry_buffer_seconds = -1;
        assert!(config.initialize().is_err());
        config.token_expiry_buffer_seconds = i64::MAX;
        assert!(config.initialize().is_err());
        config.token_expiry_buffer_seconds = 0;
        assert!(config.initialize().is_ok());
    }

    // no other test reads or writes these variables
    #[test]
    fn load_requires_every_required_variable() {
        for k in &[CLIENT_ID_ENV, CLIENT_SECRET_ENV, REFRESH_TOKEN_ENV, BUCKET_ENV] {
            env::set_var(k, "value");
        }
        env::set_var(OBJECT_ENV, "ideas.json");
        let config = Config::load().unwrap();
        assert_eq!(config.gcs_object, "ideas.json");
        assert_eq!(config.spotify.client_id, "value");

        env::set_var(OBJECT_ENV, "   ");
        let err = Config::load().err().unwrap();
        assert!(err.to_string().contains(OBJECT_ENV));

        env::remove_var(OBJECT_ENV);
        let err = Config::load().err().unwrap();
        assert!(err.to_string().contains(OBJECT_ENV));

        env::remove_var(CLIENT_ID_ENV);
        let err = Config::load().err().unwrap();
        assert!(err.to_string().contains(CLIENT_ID_ENV));
    }

    #[test]
    fn missing_required_value_is_an_error() {
        let err = required("WEBSITE_BACKEND_TEST_NEVER_SET").unwrap_err();
        assert!(err.to_string().contains("WEBSITE_BACKEND_TEST_NEVER_SET"));
    }
}
