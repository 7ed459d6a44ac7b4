//! Server configuration: TOML file + environment + CLI overrides.

use courier_core::{generate_secret, CourierError, CourierResult, TokenService};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable holding the token signing secret.
pub const SECRET_ENV: &str = "COURIER_JWT_SECRET";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_frame_size: default_max_frame_size(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_access_ttl")]
    pub access_ttl: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl: u64,
    #[serde(default = "default_reset_ttl")]
    pub reset_ttl: u64,
    #[serde(default = "default_max_handshakes")]
    pub max_handshakes_per_minute: u32,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            access_ttl: default_access_ttl(),
            refresh_ttl: default_refresh_ttl(),
            reset_ttl: default_reset_ttl(),
            max_handshakes_per_minute: default_max_handshakes(),
        }
    }
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub encrypt_payloads: bool,
    #[serde(default)]
    pub notify_undeliverable: bool,
    #[serde(default = "default_receipt_ttl")]
    pub receipt_ttl: u64,
    #[serde(default = "default_max_tracked_messages")]
    pub max_tracked_messages: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            encrypt_payloads: false,
            notify_undeliverable: false,
            receipt_ttl: default_receipt_ttl(),
            max_tracked_messages: default_max_tracked_messages(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_frame_size() -> usize {
    1024 * 1024
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_access_ttl() -> u64 {
    15 * 60
}
fn default_refresh_ttl() -> u64 {
    7 * 24 * 60 * 60
}
fn default_reset_ttl() -> u64 {
    60 * 60
}
fn default_max_handshakes() -> u32 {
    30
}
fn default_receipt_ttl() -> u64 {
    60 * 60
}
fn default_max_tracked_messages() -> usize {
    100_000
}

/// Values from the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub encrypt_payloads: bool,
    pub notify_undeliverable: bool,
}

/// Resolved server configuration (file, environment and CLI merged).
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_frame_size: usize,
    pub outbound_buffer: usize,
    /// `None` means no secret was configured.
    pub jwt_secret: Option<Vec<u8>>,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub reset_ttl: Duration,
    pub max_handshakes_per_minute: u32,
    pub encrypt_payloads: bool,
    pub notify_undeliverable: bool,
    pub receipt_ttl: Duration,
    pub max_tracked_messages: usize,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_frame_size", &self.max_frame_size)
            .field("outbound_buffer", &self.outbound_buffer)
            .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
            .field("access_ttl", &self.access_ttl)
            .field("encrypt_payloads", &self.encrypt_payloads)
            .field("notify_undeliverable", &self.notify_undeliverable)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply environment and CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> CourierResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| CourierError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, std::env::var(SECRET_ENV).ok(), cli)
    }

    fn resolve(
        file: ConfigFile,
        env_secret: Option<String>,
        cli: &CliOverrides,
    ) -> CourierResult<Self> {
        let bind = cli.bind.clone().unwrap_or(file.server.bind);
        let ip: IpAddr = bind
            .parse()
            .map_err(|e| CourierError::Config(format!("invalid bind address {bind:?}: {e}")))?;
        let port = cli.port.unwrap_or(file.server.port);

        if file.server.max_frame_size == 0 {
            return Err(CourierError::Config("max_frame_size must be positive".into()));
        }
        if file.server.outbound_buffer == 0 {
            return Err(CourierError::Config("outbound_buffer must be positive".into()));
        }

        let secret = match env_secret.or(file.auth.jwt_secret) {
            Some(s) if s.is_empty() => {
                return Err(CourierError::Config("JWT secret must not be empty".into()))
            }
            Some(s) => Some(s.into_bytes()),
            None => None,
        };

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            max_frame_size: file.server.max_frame_size,
            outbound_buffer: file.server.outbound_buffer,
            jwt_secret: secret,
            access_ttl: Duration::from_secs(file.auth.access_ttl),
            refresh_ttl: Duration::from_secs(file.auth.refresh_ttl),
            reset_ttl: Duration::from_secs(file.auth.reset_ttl),
            max_handshakes_per_minute: file.auth.max_handshakes_per_minute,
            encrypt_payloads: cli.encrypt_payloads || file.relay.encrypt_payloads,
            notify_undeliverable: cli.notify_undeliverable || file.relay.notify_undeliverable,
            receipt_ttl: Duration::from_secs(file.relay.receipt_ttl),
            max_tracked_messages: file.relay.max_tracked_messages,
        })
    }

    /// Build the token service, generating an ephemeral secret if none is set.
    pub fn token_service(&self) -> CourierResult<TokenService> {
        let secret = match &self.jwt_secret {
            Some(secret) => secret.clone(),
            None => {
                warn!(
                    env = SECRET_ENV,
                    "no JWT secret configured, using an ephemeral one; tokens will not survive a restart"
                );
                generate_secret()?
            }
        };
        Ok(TokenService::new(&secret).with_ttls(self.access_ttl, self.refresh_ttl, self.reset_ttl))
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn resolve(toml_src: &str, env: Option<&str>, cli: CliOverrides) -> CourierResult<ServerConfig> {
        let file: ConfigFile = toml::from_str(toml_src).unwrap();
        ServerConfig::resolve(file, env.map(str::to_string), &cli)
    }

    #[test]
    fn defaults() {
        let config = resolve("", None, CliOverrides::default()).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.max_frame_size, 1024 * 1024);
        assert_eq!(config.outbound_buffer, 256);
        assert_eq!(config.access_ttl, Duration::from_secs(900));
        assert_eq!(config.refresh_ttl, Duration::from_secs(604_800));
        assert_eq!(config.reset_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_handshakes_per_minute, 30);
        assert!(config.jwt_secret.is_none());
        assert!(!config.encrypt_payloads);
        assert!(!config.notify_undeliverable);
        assert_eq!(config.receipt_ttl, Duration::from_secs(3600));
        assert_eq!(config.max_tracked_messages, 100_000);
    }

    #[test]
    fn file_values_apply() {
        let config = resolve(
            r#"
            [server]
            bind = "127.0.0.1"
            port = 9000
            outbound_buffer = 8

            [auth]
            jwt_secret = "from-file"
            access_ttl = 60

            [relay]
            notify_undeliverable = true
            max_tracked_messages = 10
            "#,
            None,
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.outbound_buffer, 8);
        assert_eq!(config.jwt_secret.as_deref(), Some(b"from-file".as_slice()));
        assert_eq!(config.access_ttl, Duration::from_secs(60));
        assert!(config.notify_undeliverable);
        assert_eq!(config.max_tracked_messages, 10);
    }

    #[test]
    fn cli_overrides_file() {
        let cli = CliOverrides {
            port: Some(7000),
            bind: Some("::1".into()),
            encrypt_payloads: true,
            notify_undeliverable: false,
        };
        let config = resolve("[server]\nport = 9000\n", None, cli).unwrap();
        assert_eq!(config.bind_addr, "[::1]:7000".parse().unwrap());
        assert!(config.encrypt_payloads);
    }

    #[test]
    fn environment_secret_wins() {
        let config = resolve("[auth]\njwt_secret = \"file\"\n", Some("env"), CliOverrides::default())
            .unwrap();
        assert_eq!(config.jwt_secret.as_deref(), Some(b"env".as_slice()));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            resolve("", Some(""), CliOverrides::default()),
            Err(CourierError::Config(_))
        ));
    }

    #[test]
    fn bad_bind_is_rejected() {
        let cli = CliOverrides {
            bind: Some("not-an-ip".into()),
            ..Default::default()
        };
        assert!(matches!(resolve("", None, cli), Err(CourierError::Config(_))));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        assert!(resolve("[server]\noutbound_buffer = 0\n", None, CliOverrides::default()).is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 9100\n[relay]\nreceipt_ttl = 5").unwrap();
        let config = ServerConfig::load(Some(file.path()), &CliOverrides::default()).unwrap();
        assert_eq!(config.bind_addr.port(), 9100);
        assert_eq!(config.receipt_ttl, Duration::from_secs(5));
    }

    #[test]
    fn load_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ServerConfig::load(Some(&dir.path().join("absent.toml")), &CliOverrides::default())
                .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
    }

    #[test]
    fn malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            ServerConfig::load(Some(file.path()), &CliOverrides::default()),
            Err(CourierError::Config(_))
        ));
    }

    #[test]
    fn configured_secret_signs_verifiable_tokens() {
        let config = resolve("", Some("shared"), CliOverrides::default()).unwrap();
        let a = config.token_service().unwrap();
        let b = config.token_service().unwrap();
        let token = a
            .issue(courier_core::Identity::new_v4(), "user", Duration::from_secs(60))
            .unwrap();
        assert!(b.validate(&token).is_ok());
    }

    #[test]
    fn expand_tilde_leaves_plain_paths() {
        assert_eq!(expand_tilde(Path::new("/etc/courier.toml")), PathBuf::from("/etc/courier.toml"));
    }
}
