use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};

/// Upper bound on configured listener endpoints.
pub const MAX_LISTENERS: usize = 8;

/// A UDP endpoint a listener binds to. IPv4 only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerEndpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Target of the optional HTTP event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSinkConfig {
    pub host: String,
    pub port: u16,
    /// Request path, always with a leading slash.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Info,
    Debug,
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
        }
    }
}

/// Immutable configuration snapshot, built once at startup and shared
/// read-only with listeners and sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub root_dir: PathBuf,
    pub log_dir: PathBuf,
    pub listeners: Vec<ListenerEndpoint>,
    pub event_udp: Option<SocketAddrV4>,
    pub event_http: Option<HttpSinkConfig>,
    pub timeout_sec: u64,
    pub max_retries: u32,
    pub log_level: LogLevel,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/tftp"),
            log_dir: PathBuf::from("/var/tftp/logs"),
            listeners: vec![ListenerEndpoint {
                addr: Ipv4Addr::UNSPECIFIED,
                port: 69,
            }],
            event_udp: None,
            event_http: None,
            timeout_sec: 3,
            max_retries: 5,
            log_level: LogLevel::Info,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a `key=value` file. A missing file is not an
    /// error; malformed lines and values are skipped, keeping the defaults
    /// for whatever failed to parse.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    /// Parse configuration text. Lines starting with `#` or `;` are
    /// comments.
    pub fn parse(text: &str) -> Self {
        let mut cfg = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            let (key, val) = (key.trim(), val.trim());

            match key {
                "root_dir" => cfg.root_dir = PathBuf::from(val),
                "log_dir" => cfg.log_dir = PathBuf::from(val),
                "listeners" => {
                    let parsed = parse_listeners(val);
                    if !parsed.is_empty() {
                        cfg.listeners = parsed;
                    }
                }
                "event_udp" => cfg.event_udp = parse_host_port(val),
                "event_http_url" => cfg.event_http = parse_http_url(val),
                "timeout_sec" => {
                    if let Ok(v) = val.parse::<u64>()
                        && v > 0
                    {
                        cfg.timeout_sec = v;
                    }
                }
                "max_retries" => {
                    if let Ok(v) = val.parse::<u32>()
                        && v > 0
                    {
                        cfg.max_retries = v;
                    }
                }
                "log_level" => match val {
                    "error" => cfg.log_level = LogLevel::Error,
                    "info" => cfg.log_level = LogLevel::Info,
                    "debug" => cfg.log_level = LogLevel::Debug,
                    _ => {}
                },
                _ => {}
            }
        }

        cfg
    }
}

/// Parse `ip:port,ip:port,...`, skipping entries that don't parse and
/// capping the result at `MAX_LISTENERS`.
fn parse_listeners(val: &str) -> Vec<ListenerEndpoint> {
    let mut out = Vec::new();
    for entry in val.split(',') {
        if out.len() == MAX_LISTENERS {
            break;
        }
        let entry = entry.trim();
        let Some((ip, port)) = entry.split_once(':') else {
            continue;
        };
        let (Ok(addr), Ok(port)) = (ip.parse::<Ipv4Addr>(), port.parse::<u16>()) else {
            continue;
        };
        out.push(ListenerEndpoint { addr, port });
    }
    out
}

fn parse_host_port(val: &str) -> Option<SocketAddrV4> {
    let (host, port) = val.trim().split_once(':')?;
    let addr = host.parse::<Ipv4Addr>().ok()?;
    let port = port.parse::<u16>().ok()?;
    Some(SocketAddrV4::new(addr, port))
}

/// Parse `http://host[:port]/path`. Only the `http://` scheme is accepted;
/// the port defaults to 80 and the path to `/`.
fn parse_http_url(val: &str) -> Option<HttpSinkConfig> {
    let rest = val.trim().strip_prefix("http://")?;
    if rest.is_empty() {
        return None;
    }

    let (hostport, path) = match rest.split_once('/') {
        Some((hp, p)) => (hp, format!("/{p}")),
        None => (rest, String::from("/")),
    };

    let (host, port) = match hostport.split_once(':') {
        Some((h, p)) => (h, p.parse::<u16>().unwrap_or(80)),
        None => (hostport, 80),
    };
    if host.is_empty() {
        return None;
    }

    Some(HttpSinkConfig {
        host: host.to_string(),
        port,
        path,
    })
}
