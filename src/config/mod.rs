//! Configuration management
//!
//! Process settings come from environment variables with built-in defaults.
//! The agent roster lives in a separate JSON file that is watched at runtime
//! (see [`agents`]).

pub mod agents;

use crate::infrastructure::protocols::sip::registration::ResponseMatchPolicy;
use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

pub use agents::{AgentFile, AgentWatcher, ResolvedAgents};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Upstream SIP server for pbx agents, `host:port` or `auto:<port>`
    pub sip_server_addr: String,
    pub sip_domain: String,
    /// Password for pbx agents that do not set their own
    pub sip_pass: String,
    pub sip_listen_addr: String,
    /// Host advertised in Via and Contact
    pub sip_contact_host: String,
    /// Address advertised in SDP answers
    pub sdp_ip: String,
    pub register_expires: u32,
    pub log_level: String,
    pub sip_ai_config_path: String,
    /// First remote chunk at or above this rate flushes playback once; 0 disables
    pub audio_flush_min_rate: u32,
    pub register_match_policy: ResponseMatchPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sip_server_addr: "auto:5060".to_string(),
            sip_domain: "auto".to_string(),
            sip_pass: "1234".to_string(),
            sip_listen_addr: "0.0.0.0:5090".to_string(),
            sip_contact_host: "auto".to_string(),
            sdp_ip: "auto".to_string(),
            register_expires: 300,
            log_level: "info".to_string(),
            sip_ai_config_path: "/data/sip-ai.json".to_string(),
            audio_flush_min_rate: 16000,
            register_match_policy: ResponseMatchPolicy::Lenient,
        }
    }
}

impl Settings {
    /// Load from the process environment (`SIP_SERVER_ADDR`, `LOG_LEVEL`, ...).
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Environment::default())
    }

    pub fn load_from(environment: Environment) -> Result<Self, ConfigError> {
        let defaults = Settings::default();

        Config::builder()
            .set_default("sip_server_addr", defaults.sip_server_addr)?
            .set_default("sip_domain", defaults.sip_domain)?
            .set_default("sip_pass", defaults.sip_pass)?
            .set_default("sip_listen_addr", defaults.sip_listen_addr)?
            .set_default("sip_contact_host", defaults.sip_contact_host)?
            .set_default("sdp_ip", defaults.sdp_ip)?
            .set_default("register_expires", defaults.register_expires as i64)?
            .set_default("log_level", defaults.log_level)?
            .set_default("sip_ai_config_path", defaults.sip_ai_config_path)?
            .set_default("audio_flush_min_rate", defaults.audio_flush_min_rate as i64)?
            .set_default("register_match_policy", "lenient")?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let mut map = config::Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.to_string());
        }
        Environment::default().source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::load_from(env(&[])).unwrap();
        assert_eq!(settings.sip_server_addr, "auto:5060");
        assert_eq!(settings.sip_listen_addr, "0.0.0.0:5090");
        assert_eq!(settings.register_expires, 300);
        assert_eq!(settings.audio_flush_min_rate, 16000);
        assert_eq!(settings.register_match_policy, ResponseMatchPolicy::Lenient);
    }

    #[test]
    fn test_environment_overrides() {
        let settings = Settings::load_from(env(&[
            ("SIP_PASS", "9999"),
            ("REGISTER_EXPIRES", "60"),
            ("SIP_CONTACT_HOST", "pbx.example.com"),
            ("AUDIO_FLUSH_MIN_RATE", "0"),
            ("REGISTER_MATCH_POLICY", "strict"),
        ]))
        .unwrap();
        assert_eq!(settings.sip_pass, "9999");
        assert_eq!(settings.register_expires, 60);
        assert_eq!(settings.sip_contact_host, "pbx.example.com");
        assert_eq!(settings.audio_flush_min_rate, 0);
        assert_eq!(settings.register_match_policy, ResponseMatchPolicy::Strict);
    }

    #[test]
    fn test_bad_number_is_an_error() {
        assert!(Settings::load_from(env(&[("REGISTER_EXPIRES", "soon")])).is_err());
    }
}
