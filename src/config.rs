//! Server configuration loading
//!
//! Reads the JSON config file, optionally fetches a hostname blocklist from
//! a URL, and resolves everything into the immutable [`WispConfig`] the
//! session engine consumes.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::wisp::WispConfig;

/// On-disk config schema. Everything except `port` is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub port: Option<u16>,
    pub buffer_remaining_length: Option<u32>,
    #[serde(rename = "disableUDP")]
    pub disable_udp: Option<bool>,
    pub tcp_buffer_size: Option<usize>,
    pub tcp_no_delay: Option<bool>,
    pub websocket_tcp_no_delay: Option<bool>,
    pub websocket_permessage_deflate: Option<bool>,
    pub proxy: Option<String>,
    pub dns_server: Option<String>,
    pub blacklist: HostnameListSection,
    pub whitelist: HostnameListSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostnameListSection {
    pub hostnames: HostnamesSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostnamesSection {
    pub fetch_from_url: Option<String>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Fully resolved server configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub port: u16,
    pub wisp: WispConfig,
}

/// Load and resolve the config file. Fetching the remote blocklist happens
/// here, before the listener starts; a fetch failure logs a warning and the
/// server runs with the static include list only.
pub async fn load_config(path: impl AsRef<Path>) -> Result<ServerConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let file: ConfigFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    resolve_config(file).await
}

async fn resolve_config(file: ConfigFile) -> Result<ServerConfig> {
    let port = file.port.context("config is missing required key `port`")?;

    let blacklist_hostnames = resolve_hostname_list(&file.blacklist.hostnames).await;
    let whitelist_hostnames = resolve_hostname_list(&file.whitelist.hostnames).await;

    let defaults = WispConfig::default();
    let wisp = WispConfig {
        buffer_remaining_length: file
            .buffer_remaining_length
            .unwrap_or(defaults.buffer_remaining_length)
            .max(1),
        disable_udp: file.disable_udp.unwrap_or(defaults.disable_udp),
        tcp_buffer_size: file
            .tcp_buffer_size
            .unwrap_or(defaults.tcp_buffer_size)
            .max(1),
        tcp_no_delay: file.tcp_no_delay.unwrap_or(defaults.tcp_no_delay),
        websocket_tcp_no_delay: file
            .websocket_tcp_no_delay
            .unwrap_or(defaults.websocket_tcp_no_delay),
        websocket_permessage_deflate: file
            .websocket_permessage_deflate
            .unwrap_or(defaults.websocket_permessage_deflate),
        proxy: file.proxy.filter(|p| !p.is_empty()),
        dns_server: file.dns_server.filter(|d| !d.is_empty()),
        blacklist_hostnames,
        whitelist_hostnames,
    };

    Ok(ServerConfig { port, wisp })
}

/// Fetched set (if any), plus `include`, minus `exclude`.
async fn resolve_hostname_list(section: &HostnamesSection) -> HashSet<String> {
    let mut hostnames = match &section.fetch_from_url {
        Some(url) if !url.is_empty() => match fetch_hostname_list(url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("failed to fetch hostname list from {}: {:#}", url, e);
                HashSet::new()
            }
        },
        _ => HashSet::new(),
    };

    for host in &section.include {
        hostnames.insert(host.clone());
    }
    for host in &section.exclude {
        hostnames.remove(host);
    }

    hostnames
}

async fn fetch_hostname_list(url: &str) -> Result<HashSet<String>> {
    let response = reqwest::get(url)
        .await
        .with_context(|| format!("GET {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("unexpected status {} from {}", response.status(), url);
    }

    let body = response.text().await.context("reading hostname list body")?;
    Ok(parse_hostname_list(&body))
}

/// One hostname per line; blank lines and `#` comments are skipped.
fn parse_hostname_list(body: &str) -> HashSet<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hostname_list_skips_blanks_and_comments() {
        let body = "ads.example\n\n# tracker section\ntracker.example\n  \n#another\n";
        let hostnames = parse_hostname_list(body);
        assert_eq!(
            hostnames,
            HashSet::from(["ads.example".to_string(), "tracker.example".to_string()])
        );
    }

    #[tokio::test]
    async fn include_exclude_merge_order() {
        let section = HostnamesSection {
            fetch_from_url: None,
            include: vec!["a.example".to_string(), "b.example".to_string()],
            exclude: vec!["b.example".to_string()],
        };
        let hostnames = resolve_hostname_list(&section).await;
        assert_eq!(hostnames, HashSet::from(["a.example".to_string()]));
    }

    #[tokio::test]
    async fn camel_case_keys_parse() {
        let raw = r#"{
            "port": 6001,
            "bufferRemainingLength": 256,
            "disableUDP": true,
            "tcpBufferSize": 8192,
            "tcpNoDelay": true,
            "websocketTcpNoDelay": true,
            "websocketPermessageDeflate": false,
            "proxy": "127.0.0.1:1080",
            "dnsServer": "1.1.1.1",
            "blacklist": {
                "hostnames": {
                    "include": ["blocked.test"],
                    "exclude": []
                }
            },
            "whitelist": {
                "hostnames": {
                    "include": ["allowed.test"]
                }
            }
        }"#;

        let file: ConfigFile = serde_json::from_str(raw).unwrap();
        let config = resolve_config(file).await.unwrap();

        assert_eq!(config.port, 6001);
        assert_eq!(config.wisp.buffer_remaining_length, 256);
        assert!(config.wisp.disable_udp);
        assert_eq!(config.wisp.tcp_buffer_size, 8192);
        assert!(config.wisp.tcp_no_delay);
        assert!(config.wisp.websocket_tcp_no_delay);
        assert!(!config.wisp.websocket_permessage_deflate);
        assert_eq!(config.wisp.proxy.as_deref(), Some("127.0.0.1:1080"));
        assert_eq!(config.wisp.dns_server.as_deref(), Some("1.1.1.1"));
        assert!(config.wisp.blacklist_hostnames.contains("blocked.test"));
        assert!(config.wisp.whitelist_hostnames.contains("allowed.test"));
    }

    #[tokio::test]
    async fn minimal_config_uses_defaults() {
        let file: ConfigFile = serde_json::from_str(r#"{"port": 6001}"#).unwrap();
        let config = resolve_config(file).await.unwrap();

        assert_eq!(config.port, 6001);
        assert_eq!(config.wisp.buffer_remaining_length, 128);
        assert!(!config.wisp.disable_udp);
        assert!(config.wisp.proxy.is_none());
        assert!(config.wisp.blacklist_hostnames.is_empty());
        assert!(config.wisp.whitelist_hostnames.is_empty());
    }

    #[tokio::test]
    async fn missing_port_is_an_error() {
        let file: ConfigFile = serde_json::from_str("{}").unwrap();
        assert!(resolve_config(file).await.is_err());
    }

    #[tokio::test]
    async fn empty_proxy_means_direct() {
        let file: ConfigFile =
            serde_json::from_str(r#"{"port": 6001, "proxy": "", "dnsServer": ""}"#).unwrap();
        let config = resolve_config(file).await.unwrap();
        assert!(config.wisp.proxy.is_none());
        assert!(config.wisp.dns_server.is_none());
    }
}
