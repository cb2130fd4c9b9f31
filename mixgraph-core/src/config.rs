use std::path::{Path, PathBuf};

use serde::Deserialize;

use mixgraph_audio::ServerOptions;
use mixgraph_types::{DEFAULT_CHANNEL_COUNT, MAX_CHANNEL_COUNT, MIN_CHANNEL_COUNT};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    allocation: AllocationConfig,
}

#[derive(Deserialize, Default)]
struct ServerConfig {
    host: Option<String>,
    port: Option<u16>,
    latency: Option<f64>,
}

#[derive(Deserialize, Default)]
struct SessionConfig {
    channel_count: Option<u32>,
    track_count: Option<usize>,
}

#[derive(Deserialize, Default)]
struct AllocationConfig {
    initial_node_id: Option<i32>,
    output_bus_channels: Option<u32>,
    input_bus_channels: Option<u32>,
}

pub struct Config {
    server: ServerConfig,
    session: SessionConfig,
    allocation: AllocationConfig,
}

impl Config {
    /// Embedded defaults overlaid with the user's config file, if any.
    pub fn load() -> Self {
        match user_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::embedded(),
        }
    }

    /// Embedded defaults overlaid with the file at `path`. A missing or
    /// malformed file leaves the defaults untouched.
    pub fn load_from(path: &Path) -> Self {
        let mut base = Self::embedded_file();
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                    Ok(user) => {
                        merge_server(&mut base.server, user.server);
                        merge_session(&mut base.session, user.session);
                        merge_allocation(&mut base.allocation, user.allocation);
                    }
                    Err(e) => {
                        log::warn!(target: "config", "ignoring malformed config {}: {}", path.display(), e)
                    }
                },
                Err(e) => {
                    log::warn!(target: "config", "could not read config {}: {}", path.display(), e)
                }
            }
        }
        Config {
            server: base.server,
            session: base.session,
            allocation: base.allocation,
        }
    }

    pub fn embedded() -> Self {
        let base = Self::embedded_file();
        Config {
            server: base.server,
            session: base.session,
            allocation: base.allocation,
        }
    }

    fn embedded_file() -> ConfigFile {
        toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
            log::warn!(target: "config", "embedded config.toml is invalid: {}", e);
            ConfigFile::default()
        })
    }

    /// `host:port` of the synthesis server.
    pub fn server_address(&self) -> String {
        format!(
            "{}:{}",
            self.server.host.as_deref().unwrap_or("127.0.0.1"),
            self.server.port.unwrap_or(57110)
        )
    }

    /// Seconds ahead at which bundles are scheduled (clamped to 0..=1).
    pub fn latency(&self) -> f64 {
        self.server.latency.unwrap_or(0.05).clamp(0.0, 1.0)
    }

    /// Application channel count, clamped to the supported range.
    pub fn channel_count(&self) -> u32 {
        self.session
            .channel_count
            .unwrap_or(DEFAULT_CHANNEL_COUNT)
            .clamp(MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT)
    }

    /// Tracks created in a fresh demo session.
    pub fn track_count(&self) -> usize {
        self.session.track_count.unwrap_or(2).min(64)
    }

    pub fn server_options(&self) -> ServerOptions {
        let fallback = ServerOptions::default();
        ServerOptions {
            initial_node_id: self.allocation.initial_node_id.unwrap_or(fallback.initial_node_id),
            output_bus_channels: self
                .allocation
                .output_bus_channels
                .unwrap_or(fallback.output_bus_channels),
            input_bus_channels: self
                .allocation
                .input_bus_channels
                .unwrap_or(fallback.input_bus_channels),
            ..fallback
        }
    }
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mixgraph").join("config.toml"))
}

fn merge_server(base: &mut ServerConfig, user: ServerConfig) {
    if user.host.is_some() {
        base.host = user.host;
    }
    if user.port.is_some() {
        base.port = user.port;
    }
    if user.latency.is_some() {
        base.latency = user.latency;
    }
}

fn merge_session(base: &mut SessionConfig, user: SessionConfig) {
    if user.channel_count.is_some() {
        base.channel_count = user.channel_count;
    }
    if user.track_count.is_some() {
        base.track_count = user.track_count;
    }
}

fn merge_allocation(base: &mut AllocationConfig, user: AllocationConfig) {
    if user.initial_node_id.is_some() {
        base.initial_node_id = user.initial_node_id;
    }
    if user.output_bus_channels.is_some() {
        base.output_bus_channels = user.output_bus_channels;
    }
    if user.input_bus_channels.is_some() {
        base.input_bus_channels = user.input_bus_channels;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_embedded_config() {
        let config = Config::embedded();
        assert_eq!(config.server_address(), "127.0.0.1:57110");
        assert!((config.latency() - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.channel_count(), 2);
        assert_eq!(config.track_count(), 2);
        let options = config.server_options();
        assert_eq!(options.initial_node_id, 1000);
        assert_eq!(options.first_private_bus(), 16);
    }

    #[test]
    fn test_user_file_overrides_subset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 57120\n\n[session]\nchannel_count = 12").unwrap();
        let config = Config::load_from(file.path());
        assert_eq!(config.server_address(), "127.0.0.1:57120");
        // out-of-range counts are clamped
        assert_eq!(config.channel_count(), 8);
        assert_eq!(config.track_count(), 2);
    }

    #[test]
    fn test_malformed_user_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let config = Config::load_from(file.path());
        assert_eq!(config.server_address(), "127.0.0.1:57110");
    }

    #[test]
    fn test_missing_user_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.toml"));
        assert_eq!(config.channel_count(), 2);
    }
}
