//! Provider configuration.

use crate::filter::{DefaultAction, Rule};
use omerta_core::{Error, PeerId, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one provider node.
///
/// Loadable from TOML; every field has a default derived from the standard
/// `~/.omerta` layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Root of the provider's state (`~/.omerta`).
    pub home_dir: PathBuf,
    /// Immutable base disk image; VM overlays are backed by it.
    pub base_image: PathBuf,
    /// Event log directory (`<home>/logs/provider`).
    pub log_dir: PathBuf,
    /// Directory for firewall anchor markers read by the cleanup tool.
    pub firewall_marker_dir: PathBuf,
    /// When set, reject all incoming VM requests.
    pub consumer_only: bool,
    /// Public key advertised to consumers in `vm_created` responses.
    pub provider_public_key: Option<String>,
    /// Network this provider participates in, for filter trust decisions.
    pub network_id: Option<String>,
    /// Harden guests with a default-drop firewall via cloud-init.
    pub test_mode: bool,
    /// Launch VMs with the hypervisor's own NAT instead of a packet source.
    pub reverse_tunnel: bool,
    /// Override the ISO authoring tool (auto-detected otherwise).
    pub iso_tool: Option<PathBuf>,

    /// Peer whose requests bypass all filtering.
    pub owner_peer: Option<PeerId>,
    /// Filter fallback when no rule decides.
    pub default_filter_action: DefaultAction,
    /// Networks whose requests the default action may accept.
    pub trusted_networks: Vec<String>,
    /// Peers rejected outright.
    pub blocked_peers: Vec<PeerId>,
    /// Filter rules, evaluated by priority descending.
    pub filter_rules: Vec<Rule>,

    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub default_max_heartbeat_failures: u32,
    pub ack_timeout_secs: u64,
    pub ssh_wait_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".omerta");
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| home_dir.clone())
            .join("omerta");
        Self {
            base_image: home_dir.join("images").join("base.qcow2"),
            log_dir: home_dir.join("logs").join("provider"),
            firewall_marker_dir: config_dir.join("firewall"),
            home_dir,
            consumer_only: false,
            provider_public_key: None,
            network_id: None,
            test_mode: false,
            reverse_tunnel: false,
            iso_tool: None,
            owner_peer: None,
            default_filter_action: DefaultAction::AcceptAll,
            trusted_networks: Vec::new(),
            blocked_peers: Vec::new(),
            filter_rules: Vec::new(),
            heartbeat_interval_secs: 60,
            heartbeat_timeout_secs: 30,
            default_max_heartbeat_failures: 10,
            ack_timeout_secs: 5,
            ssh_wait_timeout_secs: 120,
        }
    }
}

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Directory holding immutable base images.
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join("images")
    }

    /// Per-VM scratch space: overlays, seed ISOs, pid files, logs.
    pub fn vm_disks_dir(&self) -> PathBuf {
        self.home_dir.join("vm-disks")
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn ssh_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_wait_timeout_secs)
    }

    /// Startup validation; failures here are fatal.
    pub fn validate(&self) -> Result<()> {
        if !self.base_image.exists() {
            return Err(Error::DiskImageNotFound(self.base_image.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_home_layout() {
        let config = ProviderConfig::default();
        assert!(config.home_dir.ends_with(".omerta"));
        assert!(config.vm_disks_dir().ends_with("vm-disks"));
        assert!(config.log_dir.ends_with("logs/provider"));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.default_max_heartbeat_failures, 10);
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.toml");
        std::fs::write(
            &path,
            "consumer_only = true\nheartbeat_interval_secs = 5\nnetwork_id = \"homelab\"\n",
        )
        .unwrap();

        let config = ProviderConfig::load(&path).unwrap();
        assert!(config.consumer_only);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(config.network_id.as_deref(), Some("homelab"));
        // Unspecified fields keep their defaults.
        assert_eq!(config.ack_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_filter_action, DefaultAction::AcceptAll);
        assert!(config.filter_rules.is_empty());
    }

    #[test]
    fn loads_filter_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provider.toml");
        std::fs::write(
            &path,
            r#"
default_filter_action = "accept_trusted_only"
trusted_networks = ["homelab"]
blocked_peers = ["2222222222222222222222222222222222222222222222222222222222222222"]

[[filter_rules]]
id = "limits"
name = "resource limits"
priority = 10
type = "resource_limits"
max_cpu_cores = 8
max_memory_mb = 8192

[[filter_rules]]
id = "night"
name = "night window"
type = "quiet_hours"
start_hour = 22
end_hour = 6
action = "require_approval"
"#,
        )
        .unwrap();

        let config = ProviderConfig::load(&path).unwrap();
        assert_eq!(
            config.default_filter_action,
            DefaultAction::AcceptTrustedOnly
        );
        assert_eq!(config.trusted_networks, vec!["homelab".to_string()]);
        assert_eq!(config.blocked_peers.len(), 1);
        assert_eq!(config.blocked_peers[0], PeerId::new([0x22; 32]));

        assert_eq!(config.filter_rules.len(), 2);
        let limits = &config.filter_rules[0];
        assert_eq!(limits.priority, 10);
        assert!(limits.enabled);
        assert!(matches!(
            limits.kind,
            crate::filter::RuleKind::ResourceLimits {
                max_cpu_cores: Some(8),
                max_memory_mb: Some(8192),
                ..
            }
        ));
        let night = &config.filter_rules[1];
        assert_eq!(night.priority, 0);
        assert!(matches!(
            night.kind,
            crate::filter::RuleKind::QuietHours {
                start_hour: 22,
                end_hour: 6,
                action: crate::filter::QuietHoursAction::RequireApproval,
            }
        ));
    }

    #[test]
    fn validate_requires_base_image() {
        let mut config = ProviderConfig::default();
        config.base_image = PathBuf::from("/definitely/not/here.qcow2");
        assert!(matches!(
            config.validate(),
            Err(Error::DiskImageNotFound(_))
        ));
    }
}
