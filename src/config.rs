//! Server configuration.
//!
//! Loaded from `./application.yml` when present. Every key has a built-in
//! default, so a partial file only overrides the keys it names.

use serde::Deserialize;

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Root of `application.yml`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub server: ServerConfig,
    pub lavalink: LavalinkSection,
    pub logging: LoggingConfig,
    pub spring: SpringConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LavalinkSection {
    pub server: LavalinkConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LavalinkConfig {
    pub password: String,
    pub sources: SourcesConfig,
    pub youtube_search_enabled: bool,
    pub soundcloud_search_enabled: bool,
}

/// Per-source enable switches.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub youtube: bool,
    pub soundcloud: bool,
    pub local: bool,
    pub http: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LoggingLevels,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingLevels {
    pub root: String,
    pub lavalink: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SpringConfig {
    pub main: SpringMainConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SpringMainConfig {
    pub banner_mode: String,
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults if the
    /// file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, Error> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_yaml::from_str(&text).map_err(Error::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Checks an `Authorization` header value against the configured
    /// password. An empty password disables authentication.
    pub fn authorized(&self, header: Option<&str>) -> bool {
        let password = &self.lavalink.server.password;

        password.is_empty() || header == Some(password.as_str())
    }

    /// Builds a `tracing_subscriber` env-filter directive string from the
    /// logging levels.
    pub fn log_filter(&self) -> String {
        let levels = &self.logging.level;

        format!(
            "{},magma={}",
            levels.root.to_lowercase(),
            levels.lavalink.to_lowercase(),
        )
    }
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 2333,
        }
    }
}

impl Default for LavalinkConfig {
    fn default() -> LavalinkConfig {
        LavalinkConfig {
            password: String::from("youshallnotpass"),
            sources: SourcesConfig::default(),
            youtube_search_enabled: true,
            soundcloud_search_enabled: true,
        }
    }
}

impl Default for SourcesConfig {
    fn default() -> SourcesConfig {
        SourcesConfig {
            youtube: true,
            soundcloud: true,
            local: false,
            http: true,
        }
    }
}

impl Default for LoggingLevels {
    fn default() -> LoggingLevels {
        LoggingLevels {
            root: String::from("INFO"),
            lavalink: String::from("INFO"),
        }
    }
}

impl Default for SpringMainConfig {
    fn default() -> SpringMainConfig {
        SpringMainConfig {
            banner_mode: String::from("log"),
        }
    }
}

/// An error loading configuration.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Parse(serde_yaml::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "read config: {}", err),
            Error::Parse(err) => write!(f, "parse config: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Parse(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn defaults_when_missing() {
        let config = Config::load("/definitely/not/here.yml").unwrap();

        assert_eq!(config.server.port, 2333);
        assert!(config.lavalink.server.sources.youtube);
        assert!(!config.lavalink.server.sources.local);
        assert_eq!(config.spring.main.banner_mode, "log");
    }

    #[test]
    fn partial_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "server:\n  port: 8080\nlavalink:\n  server:\n    password: \"hunter2\"\n    sources:\n      local: true\n",
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.lavalink.server.password, "hunter2");
        assert!(config.lavalink.server.sources.local);
        // untouched keys keep their defaults
        assert!(config.lavalink.server.sources.http);
        assert!(config.lavalink.server.youtube_search_enabled);
    }

    #[test]
    fn authorization() {
        let mut config = Config::default();
        config.lavalink.server.password = String::from("abc");

        assert!(config.authorized(Some("abc")));
        assert!(!config.authorized(Some("nope")));
        assert!(!config.authorized(None));

        config.lavalink.server.password = String::new();
        assert!(config.authorized(None));
    }
}
