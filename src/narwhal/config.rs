use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

const CONFIG_ENV: &str = "NARWHAL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds the env var into the flag; this covers callers that skip clap.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }
    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("narwhal.toml")));
        }
        return Ok(p.to_path_buf());
    }
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["narwhal.toml", "narwhal.yaml", "narwhal.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/narwhal/narwhal.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "narwhal", "narwhal")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("narwhal.toml"))
    }
}

/// Create `path` from the default template when it does not exist.
/// Returns whether a file was written.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = match extension(path).as_str() {
        "toml" => DEFAULT_CONFIG_TEMPLATE_TOML,
        "yaml" | "yml" => DEFAULT_CONFIG_TEMPLATE_YAML,
        other => anyhow::bail!("config: unsupported extension {other:?} (expected .toml or .yaml/.yml)"),
    };

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&data).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&data).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported extension {other:?}"),
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub bind_host: String,
    pub handshake_timeout: Duration,
    pub pairing_timeout: Duration,
    pub pairing_queue_capacity: usize,
    pub buffer_size: usize,
    /// uid -> port rule
    pub users: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub local_addr: String,
    pub remote_port: u16,
    pub uid: String,
    pub max_retry_times: u32,
    pub retry_backoff: Duration,
    pub dial_timeout: Duration,
    pub reply_timeout: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    bind_host: Option<String>,
    handshake_timeout_ms: Option<i64>,
    pairing_timeout_ms: Option<i64>,
    pairing_queue_capacity: Option<i64>,
    buffer_size: Option<i64>,
    #[serde(default)]
    users: HashMap<String, RuleValue>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    #[serde(default)]
    server_addr: String,
    #[serde(default)]
    local_addr: String,
    #[serde(default)]
    remote_port: i64,
    #[serde(default)]
    uid: String,
    max_retry_times: Option<i64>,
    retry_backoff_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    reply_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
}

// `alice = "22,80"` and `bob = 0` are both accepted.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum RuleValue {
    Text(String),
    Number(i64),
}

impl RuleValue {
    fn into_rule(self) -> String {
        match self {
            RuleValue::Text(s) => s.trim().to_string(),
            RuleValue::Number(n) => n.to_string(),
        }
    }
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

fn positive(v: Option<i64>, default: usize) -> usize {
    match v {
        Some(n) if n > 0 => n as usize,
        _ => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = fc.logging {
            let pick = |v: Option<String>, fallback: String| {
                v.map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(fallback)
            };
            logging.level = pick(l.level, logging.level);
            logging.format = pick(l.format, logging.format);
            // Paths keep their case.
            logging.output = l
                .output
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or(logging.output);
            logging.add_source = l.add_source;
        }

        let server = fc.server.map(|s| ServerConfig {
            listen_addr: s
                .listen_addr
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| ":8888".to_string()),
            bind_host: s
                .bind_host
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            handshake_timeout: millis(s.handshake_timeout_ms, 5000),
            pairing_timeout: millis(s.pairing_timeout_ms, 10_000),
            pairing_queue_capacity: positive(s.pairing_queue_capacity, 64),
            buffer_size: positive(s.buffer_size, 32 * 1024),
            users: s
                .users
                .into_iter()
                .map(|(uid, rule)| (uid, rule.into_rule()))
                .collect(),
        });

        let client = match fc.client {
            Some(c) => {
                if c.server_addr.trim().is_empty() {
                    anyhow::bail!("config: client.server_addr is required");
                }
                if c.local_addr.trim().is_empty() {
                    anyhow::bail!("config: client.local_addr is required");
                }
                if c.uid.trim().is_empty() {
                    anyhow::bail!("config: client.uid is required");
                }
                let remote_port = u16::try_from(c.remote_port)
                    .ok()
                    .filter(|p| *p != 0)
                    .with_context(|| {
                        format!("config: client.remote_port {} out of range 1..=65535", c.remote_port)
                    })?;
                Some(ClientConfig {
                    server_addr: c.server_addr.trim().to_string(),
                    local_addr: c.local_addr.trim().to_string(),
                    remote_port,
                    uid: c.uid.trim().to_string(),
                    max_retry_times: c.max_retry_times.unwrap_or(5).clamp(0, u32::MAX as i64) as u32,
                    retry_backoff: millis(c.retry_backoff_ms, 1000),
                    dial_timeout: millis(c.dial_timeout_ms, 5000),
                    reply_timeout: millis(c.reply_timeout_ms, 5000),
                    buffer_size: positive(c.buffer_size, 32 * 1024),
                })
            }
            None => None,
        };

        if server.is_none() && client.is_none() {
            anyhow::bail!("config: nothing to run; add a [server] or [client] section");
        }

        Ok(Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            server,
            client,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Narwhal configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path.
# Runs a relay server on :8888. Add users below, then point clients at it.

admin_addr = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[server]
listen_addr = ":8888"
bind_host = "0.0.0.0"
handshake_timeout_ms = 5000
pairing_timeout_ms = 10000
pairing_queue_capacity = 64
buffer_size = 32768

# uid -> allowed remote ports: "" or 0 (any), "80", "22,80", "8000-8100"
[server.users]

# [client]
# server_addr = "relay.example.com:8888"
# local_addr = "127.0.0.1:22"
# remote_port = 2222
# uid = "alice"
# max_retry_times = 5
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Narwhal configuration (auto-generated)
#
# Created because no configuration file existed at the resolved path.
# Runs a relay server on :8888. Add users below, then point clients at it.

admin_addr: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

server:
  listen_addr: ":8888"
  bind_host: "0.0.0.0"
  handshake_timeout_ms: 5000
  pairing_timeout_ms: 10000
  pairing_queue_capacity: 64
  buffer_size: 32768
  # uid -> allowed remote ports: "" or 0 (any), "80", "22,80", "8000-8100"
  users: {}

# client:
#   server_addr: "relay.example.com:8888"
#   local_addr: "127.0.0.1:22"
#   remote_port: 2222
#   uid: "alice"
#   max_retry_times: 5
"#;
