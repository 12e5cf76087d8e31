use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the orchestrator
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Process-level settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Nginx config directory and reload command
    #[serde(default)]
    pub nginx: NginxConfig,

    /// acme.sh location and issuance paths
    #[serde(default)]
    pub acme: AcmeConfig,

    /// Task queue sizing
    #[serde(default)]
    pub queue: QueueConfig,

    /// Certificate reconciler settings
    #[serde(default)]
    pub certificates: CertificatesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Data directory (custom certificates, issued certificates, logs)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database file (default: <data_dir>/database.sqlite)
    pub database: Option<PathBuf>,

    /// Path to PID file (optional)
    pub pid_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.data_dir.join("database.sqlite"))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// Base directory for rendered config files
    #[serde(default = "default_conf_dir")]
    pub conf_dir: PathBuf,

    /// Nginx binary name or path
    #[serde(default = "default_nginx_binary")]
    pub binary: String,

    /// Arguments passed to the binary to reload configuration
    #[serde(default = "default_reload_args")]
    pub reload_args: Vec<String>,
}

impl NginxConfig {
    /// Directory holding `host_<id>.conf` files
    pub fn hosts_dir(&self) -> PathBuf {
        self.conf_dir.join("hosts")
    }

    /// Directory holding `upstream_<id>.conf` files
    pub fn upstreams_dir(&self) -> PathBuf {
        self.conf_dir.join("upstreams")
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            conf_dir: default_conf_dir(),
            binary: default_nginx_binary(),
            reload_args: default_reload_args(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AcmeConfig {
    /// acme.sh script name or path
    #[serde(default = "default_acme_script")]
    pub script: String,

    /// acme.sh certificate home (issued certificates live in npm-<id> below it)
    #[serde(default = "default_cert_home")]
    pub cert_home: PathBuf,

    /// Webroot served for HTTP-01 challenges
    #[serde(default = "default_webroot")]
    pub webroot: PathBuf,

    /// Log file passed to acme.sh
    #[serde(default = "default_acme_log_file")]
    pub log_file: PathBuf,
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            script: default_acme_script(),
            cert_home: default_cert_home(),
            webroot: default_webroot(),
            log_file: default_acme_log_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Maximum number of pending tasks before producers block (default: 10)
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertificatesConfig {
    /// Interval in seconds between pending-certificate sweeps (default: 15)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl CertificatesConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_conf_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d")
}

fn default_nginx_binary() -> String {
    "nginx".to_string()
}

fn default_reload_args() -> Vec<String> {
    vec!["-s".to_string(), "reload".to_string()]
}

fn default_acme_script() -> String {
    "acme.sh".to_string()
}

fn default_cert_home() -> PathBuf {
    PathBuf::from("/data/.acme.sh/certs")
}

fn default_webroot() -> PathBuf {
    PathBuf::from("/data/acme/wellknown")
}

fn default_acme_log_file() -> PathBuf {
    PathBuf::from("/data/logs/acme.sh.log")
}

fn default_queue_capacity() -> usize {
    10
}

fn default_sweep_interval() -> u64 {
    15
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be greater than 0".to_string());
        }
        if self.certificates.sweep_interval_secs == 0 {
            errors.push("certificates.sweep_interval_secs must be greater than 0".to_string());
        }
        if self.nginx.binary.trim().is_empty() {
            errors.push("nginx.binary must not be empty".to_string());
        }
        if self.acme.script.trim().is_empty() {
            errors.push("acme.script must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
data_dir = "/srv/data"
pid_file = "/run/confgate.pid"

[nginx]
conf_dir = "/srv/nginx"
binary = "/usr/sbin/nginx"
reload_args = ["-s", "reload", "-c", "/srv/nginx/nginx.conf"]

[acme]
script = "/srv/data/acme.sh"
webroot = "/srv/acme"

[queue]
capacity = 32

[certificates]
sweep_interval_secs = 60
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.data_dir, PathBuf::from("/srv/data"));
        assert_eq!(config.server.database_path(), PathBuf::from("/srv/data/database.sqlite"));
        assert_eq!(config.server.pid_file, Some(PathBuf::from("/run/confgate.pid")));
        assert_eq!(config.nginx.binary, "/usr/sbin/nginx");
        assert_eq!(config.nginx.reload_args.len(), 4);
        assert_eq!(config.nginx.hosts_dir(), PathBuf::from("/srv/nginx/hosts"));
        assert_eq!(config.acme.script, "/srv/data/acme.sh");
        assert_eq!(config.acme.webroot, PathBuf::from("/srv/acme"));
        assert_eq!(config.acme.cert_home, PathBuf::from("/data/.acme.sh/certs"));
        assert_eq!(config.queue.capacity, 32);
        assert_eq!(config.certificates.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();

        assert_eq!(config.queue.capacity, 10);
        assert_eq!(config.certificates.sweep_interval_secs, 15);
        assert_eq!(config.nginx.binary, "nginx");
        assert_eq!(config.nginx.reload_args, vec!["-s", "reload"]);
        assert_eq!(config.nginx.upstreams_dir(), PathBuf::from("/etc/nginx/conf.d/upstreams"));
        assert_eq!(config.acme.log_file, PathBuf::from("/data/logs/acme.sh.log"));
        assert!(config.server.database.is_none());
    }

    #[test]
    fn test_explicit_database_path() {
        let config: Config = toml::from_str("[server]\ndatabase = \"/tmp/x.db\"\n").unwrap();
        assert_eq!(config.server.database_path(), PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config: Config = toml::from_str("[queue]\ncapacity = 0\n").unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("queue.capacity"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let toml = r#"
[queue]
capacity = 0

[certificates]
sweep_interval_secs = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("queue.capacity"));
        assert!(err.contains("sweep_interval_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\ncapacity = 3\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.queue.capacity, 3);

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
