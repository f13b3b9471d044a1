//! Agent roster file (`SIP_AI_CONFIG_PATH`)
//!
//! ```json
//! {
//!   "defaults": { "sipServerAddr": "auto:5060", "sipPass": "1234", "registerExpires": 300 },
//!   "agents": [
//!     { "id": "sales", "source": "pbx", "extension": "1001", "geminiSocketUrl": "ws://ai:9000/ws" },
//!     { "id": "ext", "source": "external", "sipUser": "bot", "sipPass": "pw",
//!       "sipServerAddr": "sip.example.com:5060", "sipDomain": "example.com" }
//!   ]
//! }
//! ```
//!
//! Parsing is tolerant: a malformed record is skipped, and an unreadable or
//! malformed file is the same as an empty roster.

use super::Settings;
use crate::application::RuntimeState;
use crate::domain::agent::{is_stream_url, normalize_expires, Agent, AgentSource};
use crate::infrastructure::net::{detect_local_ipv4, resolve_auto_addr, resolve_auto_host};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Files larger than this are ignored
const MAX_FILE_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDefaults {
    pub sip_server_addr: Option<String>,
    pub sip_domain: Option<String>,
    pub sip_contact_host: Option<String>,
    #[serde(rename = "sdpIP")]
    pub sdp_ip: Option<String>,
    /// Accepted for compatibility; the listener is bound once at startup
    pub sip_listen_addr: Option<String>,
    pub sip_pass: Option<String>,
    pub register_expires: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub extension: Option<String>,
    #[serde(default)]
    pub sip_user: Option<String>,
    #[serde(default)]
    pub sip_pass: Option<String>,
    #[serde(default)]
    pub sip_server_addr: Option<String>,
    #[serde(default)]
    pub sip_domain: Option<String>,
    #[serde(default)]
    pub gemini_socket_url: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawAgentFile {
    #[serde(default)]
    defaults: Option<FileDefaults>,
    #[serde(default)]
    agents: Option<Vec<serde_json::Value>>,
}

/// Parsed roster file
#[derive(Debug, Clone, Default)]
pub struct AgentFile {
    pub defaults: FileDefaults,
    pub agents: Vec<AgentRecord>,
}

/// Agents plus the network identity they are advertised under
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAgents {
    pub agents: Vec<Agent>,
    pub contact_host: String,
    pub sdp_ip: String,
}

impl AgentFile {
    pub fn parse(data: &[u8]) -> Self {
        if data.len() > MAX_FILE_SIZE {
            warn!("Agent file is {} bytes, over the {} byte limit", data.len(), MAX_FILE_SIZE);
            return Self::default();
        }

        let raw: RawAgentFile = match serde_json::from_slice(data) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Agent file is not valid JSON: {}", e);
                return Self::default();
            }
        };

        let mut agents = Vec::new();
        for (index, value) in raw.agents.unwrap_or_default().into_iter().enumerate() {
            match serde_json::from_value::<AgentRecord>(value) {
                Ok(record) => agents.push(record),
                Err(e) => warn!("Skipping malformed agent record #{}: {}", index, e),
            }
        }

        Self {
            defaults: raw.defaults.unwrap_or_default(),
            agents,
        }
    }

    /// Apply defaults and `auto` resolution.
    ///
    /// Disabled and incomplete records are dropped. When two records claim the
    /// same SIP user the later one wins.
    pub fn resolve(&self, settings: &Settings, auto_ip: &str) -> ResolvedAgents {
        let def = &self.defaults;

        let server_addr = resolve_auto_addr(
            first_non_empty(def.sip_server_addr.as_deref(), &settings.sip_server_addr),
            auto_ip,
        );
        let domain = resolve_auto_host(
            first_non_empty(def.sip_domain.as_deref(), &settings.sip_domain),
            auto_ip,
        );
        let contact_host = resolve_auto_host(
            first_non_empty(def.sip_contact_host.as_deref(), &settings.sip_contact_host),
            auto_ip,
        );
        let sdp_ip = resolve_auto_host(
            first_non_empty(def.sdp_ip.as_deref(), &settings.sdp_ip),
            auto_ip,
        );

        let expires = match def.register_expires {
            Some(value) if value >= 0 => normalize_expires(value.min(u32::MAX as i64) as u32),
            _ => normalize_expires(settings.register_expires),
        };

        let default_pass = {
            let pass = first_non_empty(def.sip_pass.as_deref(), &settings.sip_pass);
            if pass.is_empty() {
                "1234".to_string()
            } else {
                pass.to_string()
            }
        };

        let mut agents: Vec<Agent> = Vec::new();
        for record in &self.agents {
            if record.enabled == Some(false) {
                continue;
            }

            let source = match trimmed(&record.source).to_ascii_lowercase().as_str() {
                "external" => AgentSource::External,
                _ => AgentSource::Pbx,
            };
            let stream_url = Some(trimmed(&record.gemini_socket_url).to_string())
                .filter(|url| !url.is_empty());

            let agent = match source {
                AgentSource::External => {
                    let user = trimmed(&record.sip_user);
                    let pass = trimmed(&record.sip_pass);
                    let srv = trimmed(&record.sip_server_addr);
                    let dom = trimmed(&record.sip_domain);
                    if user.is_empty() || pass.is_empty() || srv.is_empty() || dom.is_empty() {
                        warn!("Skipping external agent {:?}: incomplete credentials", record.id);
                        continue;
                    }
                    Agent {
                        id: record.id.clone(),
                        source,
                        user: user.to_string(),
                        password: pass.to_string(),
                        server_addr: resolve_auto_addr(srv, auto_ip),
                        domain: resolve_auto_host(dom, auto_ip),
                        expires,
                        stream_url,
                        enabled: true,
                    }
                }
                AgentSource::Pbx => {
                    let pass = trimmed(&record.sip_pass);
                    Agent {
                        id: record.id.clone(),
                        source,
                        user: trimmed(&record.extension).to_string(),
                        password: if pass.is_empty() {
                            default_pass.clone()
                        } else {
                            pass.to_string()
                        },
                        server_addr: server_addr.clone(),
                        domain: domain.clone(),
                        expires,
                        stream_url,
                        enabled: true,
                    }
                }
            };

            if let Err(e) = agent.validate() {
                warn!("Skipping agent: {}", e);
                continue;
            }
            if let Some(url) = agent.stream_url.as_deref().filter(|url| !is_stream_url(url)) {
                warn!(
                    "Agent {} stream url {:?} is not ws:// or wss://; its calls will be drained",
                    agent.user, url
                );
            }

            agents.retain(|a| a.user != agent.user);
            agents.push(agent);
        }

        ResolvedAgents {
            agents,
            contact_host,
            sdp_ip,
        }
    }
}

fn trimmed(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or("")
}

fn first_non_empty<'a>(preferred: Option<&'a str>, fallback: &'a str) -> &'a str {
    match preferred.map(str::trim) {
        Some(value) if !value.is_empty() => value,
        _ => fallback.trim(),
    }
}

/// Polls the roster file and pushes every change into the runtime state.
pub struct AgentWatcher {
    path: PathBuf,
    settings: Settings,
    runtime: Arc<RuntimeState>,
    interval: Duration,
}

impl AgentWatcher {
    pub fn new(settings: Settings, runtime: Arc<RuntimeState>) -> Self {
        Self {
            path: PathBuf::from(&settings.sip_ai_config_path),
            settings,
            runtime,
            interval: Duration::from_secs(2),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Apply the current file, then re-apply whenever its content changes.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Watching agent file {}", self.path.display());
        let mut last: Option<Option<Vec<u8>>> = None;

        loop {
            let content = tokio::fs::read(&self.path).await.ok();
            if last.as_ref() != Some(&content) {
                let file = match &content {
                    Some(data) => AgentFile::parse(data),
                    None => {
                        warn!("Agent file {} not readable; no agents", self.path.display());
                        AgentFile::default()
                    }
                };
                let auto_ip = detect_local_ipv4().await;
                let resolved = file.resolve(&self.settings, &auto_ip);
                info!(
                    "Applying {} agent(s) (contact={}, sdp={})",
                    resolved.agents.len(),
                    resolved.contact_host,
                    resolved.sdp_ip
                );
                self.runtime.replace_agents(resolved).await;
                last = Some(content);
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!("Agent watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"{
        "defaults": {
            "sipServerAddr": "auto:5070",
            "sipDomain": "auto",
            "sipContactHost": "pbx-host",
            "sdpIP": "auto",
            "sipPass": "",
            "registerExpires": 0,
            "somethingNew": true
        },
        "agents": [
            {"id": "a", "source": "pbx", "extension": "1001", "geminiSocketUrl": " ws://ai:9000/ws "},
            {"id": "b", "source": "pbx", "extension": "1002", "sipPass": "own", "enabled": false},
            {"id": "c", "source": "external", "sipUser": "bot", "sipPass": "pw",
             "sipServerAddr": "sip.example.com:5060", "sipDomain": "example.com"},
            {"id": "d", "source": "external", "sipUser": "half"},
            {"id": "e", "source": "pbx", "extension": "sales"},
            {"id": 42, "extension": ["bad"]},
            {"id": "f", "extension": "1003", "sipPass": "x"}
        ]
    }"#;

    #[test]
    fn test_resolve_full_file() {
        let file = AgentFile::parse(FILE.as_bytes());
        assert_eq!(file.agents.len(), 6);

        let resolved = file.resolve(&Settings::default(), "10.1.2.3");
        assert_eq!(resolved.contact_host, "pbx-host");
        assert_eq!(resolved.sdp_ip, "10.1.2.3");

        let users: Vec<&str> = resolved.agents.iter().map(|a| a.user.as_str()).collect();
        assert_eq!(users, vec!["1001", "bot", "1003"]);

        let a = &resolved.agents[0];
        assert_eq!(a.source, AgentSource::Pbx);
        assert_eq!(a.server_addr, "10.1.2.3:5070");
        assert_eq!(a.domain, "10.1.2.3");
        assert_eq!(a.password, "1234");
        assert_eq!(a.expires, 31_536_000);
        assert_eq!(a.stream_url.as_deref(), Some("ws://ai:9000/ws"));

        let bot = &resolved.agents[1];
        assert_eq!(bot.source, AgentSource::External);
        assert_eq!(bot.server_addr, "sip.example.com:5060");
        assert_eq!(bot.password, "pw");
        assert_eq!(bot.stream_url, None);

        assert_eq!(resolved.agents[2].password, "x");
    }

    #[test]
    fn test_expires_fallbacks() {
        let mut settings = Settings::default();
        settings.register_expires = 120;

        let file = AgentFile::parse(br#"{"agents":[{"extension":"1001"}]}"#);
        assert_eq!(file.resolve(&settings, "127.0.0.1").agents[0].expires, 120);

        let file = AgentFile::parse(
            br#"{"defaults":{"registerExpires":-5},"agents":[{"extension":"1001"}]}"#,
        );
        assert_eq!(file.resolve(&settings, "127.0.0.1").agents[0].expires, 120);

        let file = AgentFile::parse(
            br#"{"defaults":{"registerExpires":600},"agents":[{"extension":"1001"}]}"#,
        );
        assert_eq!(file.resolve(&settings, "127.0.0.1").agents[0].expires, 600);
    }

    #[test]
    fn test_malformed_file_is_empty() {
        let file = AgentFile::parse(b"{ not json");
        assert!(file.agents.is_empty());
        let resolved = file.resolve(&Settings::default(), "127.0.0.1");
        assert!(resolved.agents.is_empty());
        assert_eq!(resolved.contact_host, "127.0.0.1");
    }

    #[test]
    fn test_malformed_stream_url_keeps_agent() {
        let file = AgentFile::parse(
            br#"{"agents":[{"id":"x","extension":"1001","geminiSocketUrl":"http://ai:9000/ws"}]}"#,
        );
        let resolved = file.resolve(&Settings::default(), "127.0.0.1");
        assert_eq!(resolved.agents.len(), 1);
        assert_eq!(resolved.agents[0].user, "1001");
        assert_eq!(
            resolved.agents[0].stream_url.as_deref(),
            Some("http://ai:9000/ws")
        );
    }

    #[test]
    fn test_duplicate_user_last_wins() {
        let file = AgentFile::parse(
            br#"{"agents":[{"id":"x","extension":"1001"},{"id":"y","extension":"1001"}]}"#,
        );
        let resolved = file.resolve(&Settings::default(), "127.0.0.1");
        assert_eq!(resolved.agents.len(), 1);
        assert_eq!(resolved.agents[0].id, "y");
    }

    #[tokio::test]
    async fn test_watcher_applies_file_changes() {
        use crate::application::RuntimeOptions;

        let path = std::env::temp_dir().join(format!("sip-ai-agents-{}.json", std::process::id()));
        let roster = |ext: &str| {
            format!(
                r#"{{"defaults":{{"sipServerAddr":"127.0.0.1:9","sipDomain":"127.0.0.1"}},
                    "agents":[{{"id":"a","extension":"{}"}}]}}"#,
                ext
            )
        };
        std::fs::write(&path, roster("1001")).unwrap();

        let mut settings = Settings::default();
        settings.sip_ai_config_path = path.display().to_string();
        let runtime = Arc::new(RuntimeState::new(5090, RuntimeOptions::default()));
        let cancel = CancellationToken::new();
        let watcher = tokio::spawn(
            AgentWatcher::new(settings, runtime.clone())
                .with_interval(Duration::from_millis(50))
                .run(cancel.clone()),
        );

        let wait_for = |user: &'static str| {
            let runtime = runtime.clone();
            async move {
                for _ in 0..100 {
                    if runtime.agent(user).await.is_some() {
                        return true;
                    }
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                false
            }
        };

        assert!(wait_for("1001").await);
        std::fs::write(&path, roster("1002")).unwrap();
        assert!(wait_for("1002").await);
        assert!(runtime.agent("1001").await.is_none());

        cancel.cancel();
        watcher.await.unwrap();
        runtime.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }
}
