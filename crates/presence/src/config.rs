use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

const DEFAULT_LISTEN_PORT: u16 = 3001;
const DEFAULT_AUTH_URL: &str = "http://localhost:3000";
const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 5;
const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_OUTBOUND_BUFFER: usize = 64;
const DEFAULT_PRUNE_EMPTY_ROOMS: bool = true;

#[derive(Debug, Clone)]
pub struct PresenceServerConfig {
    pub listen_addr: SocketAddr,
    pub auth_base_url: String,
    pub auth_timeout: Duration,
    pub stun_urls: Vec<String>,
    pub outbound_buffer: usize,
    pub prune_empty_rooms: bool,
}

impl PresenceServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_port = env::var("PRESENCE_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(DEFAULT_LISTEN_PORT);

        let listen_addr = env::var("PRESENCE_ADDR")
            .ok()
            .and_then(|raw| raw.parse::<IpAddr>().ok())
            .map(|ip| SocketAddr::new(ip, listen_port))
            .unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), listen_port));

        let auth_base_url = env::var("PRESENCE_AUTH_URL")
            .map(|raw| raw.trim_end_matches('/').to_string())
            .unwrap_or_else(|_| DEFAULT_AUTH_URL.to_string());

        let auth_timeout = env::var("PRESENCE_AUTH_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS));

        let stun_urls = env::var("PRESENCE_STUN_URLS")
            .ok()
            .map(|raw| parse_list(&raw))
            .filter(|urls| !urls.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_STUN_URL.to_string()]);

        // A zero-capacity mpsc channel panics on construction.
        let outbound_buffer = env::var("PRESENCE_OUTBOUND_BUFFER")
            .ok()
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_OUTBOUND_BUFFER);

        let prune_empty_rooms = env::var("PRESENCE_PRUNE_EMPTY_ROOMS")
            .ok()
            .and_then(|raw| parse_bool(&raw))
            .unwrap_or(DEFAULT_PRUNE_EMPTY_ROOMS);

        Ok(Self {
            listen_addr,
            auth_base_url,
            auth_timeout,
            stun_urls,
            outbound_buffer,
            prune_empty_rooms,
        })
    }
}

impl Default for PresenceServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_LISTEN_PORT),
            auth_base_url: DEFAULT_AUTH_URL.to_string(),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            prune_empty_rooms: DEFAULT_PRUNE_EMPTY_ROOMS,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_parse_list_skips_blanks() {
        let urls = parse_list(" stun:a:3478, ,stun:b:3478 ");
        assert_eq!(urls, vec!["stun:a:3478".to_string(), "stun:b:3478".to_string()]);
    }

    #[test]
    fn test_default_config() {
        let config = PresenceServerConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_LISTEN_PORT);
        assert_eq!(config.stun_urls, vec![DEFAULT_STUN_URL.to_string()]);
        assert!(config.outbound_buffer > 0);
        assert!(config.prune_empty_rooms);
    }
}
