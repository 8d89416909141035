use crate::utils::{get_nanobot_home, get_workspace_path};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

#[derive(Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_gateway_url", rename = "gatewayUrl")]
    pub gateway_url: String,
    #[serde(default = "default_intents")]
    pub intents: u64,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".to_string()
}

// GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
fn default_intents() -> u64 {
    (1 << 9) | (1 << 12) | (1 << 15)
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            gateway_url: default_gateway_url(),
            intents: default_intents(),
            allow_from: Vec::new(),
        }
    }
}

// Tokens stay out of Debug output.
impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("enabled", &self.enabled)
            .field("token", &"***")
            .field("gateway_url", &self.gateway_url)
            .field("intents", &self.intents)
            .field("allow_from", &self.allow_from)
            .finish()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, rename = "appId")]
    pub app_id: String,
    #[serde(default, rename = "appSecret")]
    pub app_secret: String,
    #[serde(default, rename = "encryptKey")]
    pub encrypt_key: String,
    #[serde(default, rename = "verificationToken")]
    pub verification_token: String,
    #[serde(default, rename = "allowFrom")]
    pub allow_from: Vec<String>,
}

impl std::fmt::Debug for FeishuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeishuConfig")
            .field("enabled", &self.enabled)
            .field("app_id", &self.app_id)
            .field("app_secret", &"***")
            .field("encrypt_key", &"***")
            .field("verification_token", &"***")
            .field("allow_from", &self.allow_from)
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub feishu: FeishuConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronConfig {
    /// Override for the job store location; defaults to `~/.nanobot/cron/jobs.json`.
    #[serde(default, rename = "storePath")]
    pub store_path: Option<PathBuf>,
}

impl CronConfig {
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            get_nanobot_home()
                .map(|home| home.join("cron").join("jobs.json"))
                .unwrap_or_else(|_| PathBuf::from("cron_jobs.json"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval", rename = "intervalS")]
    pub interval_s: u64,
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_heartbeat_interval() -> u64 {
    30 * 60
}

fn default_workspace() -> String {
    "~/.nanobot/workspace".to_string()
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_s: default_heartbeat_interval(),
            workspace: default_workspace(),
        }
    }
}

impl HeartbeatConfig {
    pub fn workspace_path(&self) -> PathBuf {
        get_workspace_path(&self.workspace)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(!config.channels.discord.enabled);
        assert!(!config.channels.feishu.enabled);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.interval_s, 1800);
    }

    #[test]
    fn test_camel_case_keys() {
        let json = r#"{
            "channels": {
                "discord": {"enabled": true, "token": "t", "allowFrom": ["1|2"]},
                "feishu": {"enabled": true, "appId": "cli_x", "appSecret": "s"}
            },
            "heartbeat": {"intervalS": 60}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.channels.discord.enabled);
        assert_eq!(config.channels.discord.allow_from, vec!["1|2"]);
        assert_eq!(config.channels.feishu.app_id, "cli_x");
        assert_eq!(config.heartbeat.interval_s, 60);
    }

    #[test]
    fn test_default_gateway_url_and_intents() {
        let config = DiscordConfig::default();
        assert!(config.gateway_url.starts_with("wss://gateway.discord.gg"));
        assert_eq!(config.intents, 512 + 4096 + 32768);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = DiscordConfig {
            token: "secret-token".into(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret-token"));
    }

    #[test]
    fn test_cron_store_path_override() {
        let config = CronConfig {
            store_path: Some(PathBuf::from("/tmp/jobs.json")),
        };
        assert_eq!(config.resolved_store_path(), PathBuf::from("/tmp/jobs.json"));
    }
}
