use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);

const DEFAULT_COOKIE_NAME: &str = "_doorman_session";
const DEFAULT_CALLBACK_PATH: &str = "/oauth2callback";
const DEFAULT_PROTECT_PATH: &str = "/";

const DEFAULT_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const DEFAULT_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo";
const DEFAULT_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";
const DEFAULT_EMAIL_PATTERN: &str = ".*";

/// Errors loading or validating the configuration. All of them are fatal at
/// startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file")]
    Read(#[source] std::io::Error),
    #[error("unable to parse configuration file")]
    Parse(#[from] toml::de::Error),
    #[error("at least one of listen_addr and listen_addr_tls must be configured")]
    NoListener,
    #[error("listen_addr_tls requires tls_cert to be set")]
    MissingTlsCert,
    #[error("listen_addr_tls requires tls_key to be set")]
    MissingTlsKey,
    #[error("{0} must begin with '/'")]
    RelativePath(&'static str),
    #[error("invalid backend_url: {0}")]
    BackendUrl(String),
    #[error("invalid email_pattern: {0}")]
    EmailPattern(#[from] regex::Error),
    #[error("invalid {name} endpoint: {reason}")]
    Endpoint {
        name: &'static str,
        reason: String,
    },
}

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: ProviderConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: Option<SocketAddr>,
    #[serde(default)]
    pub listen_addr_tls: Option<SocketAddr>,
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_callback_path")]
    pub callback_path: String,
    #[serde(default = "default_protect_path")]
    pub protect_path: String,
    pub backend_url: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ProviderConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_userinfo_url")]
    pub userinfo_url: String,
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_email_pattern")]
    pub email_pattern: String,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;

        Ok(config)
    }

    /// Check the cross-field invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.is_none() && self.server.listen_addr_tls.is_none() {
            return Err(ConfigError::NoListener);
        }

        if self.server.listen_addr_tls.is_some() {
            if self.server.tls_cert.is_none() {
                return Err(ConfigError::MissingTlsCert);
            }
            if self.server.tls_key.is_none() {
                return Err(ConfigError::MissingTlsKey);
            }
        }

        if !self.server.callback_path.starts_with('/') {
            return Err(ConfigError::RelativePath("callback_path"));
        }
        if !self.server.protect_path.starts_with('/') {
            return Err(ConfigError::RelativePath("protect_path"));
        }

        reqwest::Url::parse(&self.server.backend_url)
            .map_err(|e| ConfigError::BackendUrl(e.to_string()))?;

        for (name, url) in [
            ("auth_url", &self.oauth.auth_url),
            ("token_url", &self.oauth.token_url),
            ("redirect_url", &self.oauth.redirect_url),
            ("userinfo_url", &self.oauth.userinfo_url),
        ] {
            reqwest::Url::parse(url).map_err(|e| ConfigError::Endpoint {
                name,
                reason: e.to_string(),
            })?;
        }

        regex::bytes::Regex::new(&self.oauth.email_pattern)?;

        Ok(())
    }
}

fn default_listen_addr() -> Option<SocketAddr> {
    Some(DEFAULT_LISTEN_ADDR)
}

fn default_cookie_name() -> String {
    DEFAULT_COOKIE_NAME.to_string()
}

fn default_callback_path() -> String {
    DEFAULT_CALLBACK_PATH.to_string()
}

fn default_protect_path() -> String {
    DEFAULT_PROTECT_PATH.to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_userinfo_url() -> String {
    DEFAULT_USERINFO_URL.to_string()
}

fn default_scope() -> String {
    DEFAULT_SCOPE.to_string()
}

fn default_email_pattern() -> String {
    DEFAULT_EMAIL_PATTERN.to_string()
}
