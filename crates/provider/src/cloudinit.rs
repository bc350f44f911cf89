//! Cloud-init seed authoring.
//!
//! Produces the NoCloud seed: `meta-data`, `user-data`, and an optional
//! `network-config` v2, packed into an ISO9660 image with volume id
//! `cidata`. The user-data comes in two variants: the plain SSH-only form,
//! and a hardened form that drops all guest ingress except loopback, the
//! gateway subnet and established flows.

use omerta_core::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Static guest addressing for `network-config` v2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticNetwork {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub dns: Vec<Ipv4Addr>,
}

impl StaticNetwork {
    /// The `/24` around the guest address, used by the hardened firewall.
    fn subnet_cidr(&self) -> String {
        let octets = self.address.octets();
        format!("{}.{}.{}.0/{}", octets[0], octets[1], octets[2], self.prefix_len)
    }
}

/// Inputs for one seed. Identical inputs produce byte-identical files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudInitSpec {
    pub instance_id: String,
    pub hostname: String,
    pub ssh_user: String,
    pub ssh_public_key: String,
    pub network: Option<StaticNetwork>,
    /// Hardened variant: default-drop guest firewall.
    pub lockdown: bool,
}

impl CloudInitSpec {
    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            self.instance_id, self.hostname
        )
    }

    pub fn user_data(&self) -> String {
        let mut doc = format!(
            r#"#cloud-config
hostname: {hostname}
users:
  - name: {user}
    sudo: ALL=(ALL) NOPASSWD:ALL
    groups: sudo
    shell: /bin/bash
    ssh_authorized_keys:
      - {key}
ssh_pwauth: false
runcmd:
  - systemctl enable --now ssh
"#,
            hostname = self.hostname,
            user = self.ssh_user,
            key = self.ssh_public_key,
        );

        if self.lockdown {
            let allowed = self
                .network
                .as_ref()
                .map(|n| n.subnet_cidr())
                .unwrap_or_else(|| "192.168.0.0/16".to_string());
            doc.push_str(&format!(
                r#"  - iptables -A INPUT -i lo -j ACCEPT
  - iptables -A INPUT -s {allowed} -j ACCEPT
  - iptables -A INPUT -m state --state ESTABLISHED,RELATED -j ACCEPT
  - iptables -P INPUT DROP
  - iptables -P FORWARD DROP
"#
            ));
        }

        // Keep the seed one-shot: cloud-init must not rerun on reboot.
        doc.push_str("  - touch /etc/cloud/cloud-init.disabled\n");
        doc
    }

    pub fn network_config(&self) -> Option<String> {
        let net = self.network.as_ref()?;
        let dns = net
            .dns
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!(
            r#"version: 2
ethernets:
  primary:
    match:
      name: "en*"
    addresses:
      - {address}/{prefix}
    routes:
      - to: default
        via: {gateway}
    nameservers:
      addresses: [{dns}]
"#,
            address = net.address,
            prefix = net.prefix_len,
            gateway = net.gateway,
        ))
    }
}

enum IsoTool {
    /// genisoimage, mkisofs, xorrisofs — compatible flag sets.
    Mkisofs(PathBuf),
    /// `hdiutil makehybrid`, the Darwin fallback.
    Hdiutil(PathBuf),
}

pub struct CloudInitAuthor {
    tool_override: Option<PathBuf>,
}

impl CloudInitAuthor {
    pub fn new() -> Self {
        Self {
            tool_override: None,
        }
    }

    /// Use a specific mkisofs-compatible binary instead of probing.
    pub fn with_tool(tool: impl Into<PathBuf>) -> Self {
        Self {
            tool_override: Some(tool.into()),
        }
    }

    /// Write the seed files into `work_dir` and pack them into `iso_path`.
    pub async fn build_seed_iso(
        &self,
        spec: &CloudInitSpec,
        work_dir: &Path,
        iso_path: &Path,
    ) -> Result<()> {
        tokio::fs::create_dir_all(work_dir).await?;

        let meta = work_dir.join("meta-data");
        let user = work_dir.join("user-data");
        tokio::fs::write(&meta, spec.meta_data()).await?;
        tokio::fs::write(&user, spec.user_data()).await?;

        let mut files = vec![user, meta];
        if let Some(network) = spec.network_config() {
            let path = work_dir.join("network-config");
            tokio::fs::write(&path, network).await?;
            files.push(path);
        }

        let tool = self.resolve_tool()?;
        let output = match &tool {
            IsoTool::Mkisofs(path) => {
                let mut cmd = Command::new(path);
                cmd.arg("-output")
                    .arg(iso_path)
                    .args(["-volid", "cidata", "-joliet", "-rock"])
                    .args(&files);
                cmd.output().await?
            }
            IsoTool::Hdiutil(path) => {
                let mut cmd = Command::new(path);
                cmd.arg("makehybrid")
                    .arg("-o")
                    .arg(iso_path)
                    .args(["-joliet", "-iso", "-default-volume-name", "cidata"])
                    .arg(work_dir);
                cmd.output().await?
            }
        };

        if !output.status.success() {
            return Err(Error::StartFailed(format!(
                "seed ISO authoring failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(iso = %iso_path.display(), "authored cloud-init seed");
        Ok(())
    }

    fn resolve_tool(&self) -> Result<IsoTool> {
        if let Some(tool) = &self.tool_override {
            return Ok(IsoTool::Mkisofs(tool.clone()));
        }
        for candidate in ["genisoimage", "mkisofs", "xorrisofs"] {
            if let Ok(path) = which::which(candidate) {
                return Ok(IsoTool::Mkisofs(path));
            }
        }
        if cfg!(target_os = "macos") {
            if let Ok(path) = which::which("hdiutil") {
                return Ok(IsoTool::Hdiutil(path));
            }
        }
        Err(Error::IsoToolNotFound)
    }
}

impl Default for CloudInitAuthor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> CloudInitSpec {
        CloudInitSpec {
            instance_id: "6fa459ea-ee8a-3ca4-894e-db77e160355e".to_string(),
            hostname: "vm-6fa459ea".to_string(),
            ssh_user: "dev".to_string(),
            ssh_public_key: "ssh-ed25519 AAAA test@host".to_string(),
            network: Some(StaticNetwork {
                address: Ipv4Addr::new(10, 200, 200, 2),
                prefix_len: 24,
                gateway: Ipv4Addr::new(10, 200, 200, 1),
                dns: vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)],
            }),
            lockdown: false,
        }
    }

    #[test]
    fn meta_data_names_the_instance() {
        let meta = spec().meta_data();
        assert!(meta.contains("instance-id: 6fa459ea-ee8a-3ca4-894e-db77e160355e"));
        assert!(meta.contains("local-hostname: vm-6fa459ea"));
    }

    #[test]
    fn user_data_is_cloud_config_with_sudoer() {
        let user = spec().user_data();
        assert!(user.starts_with("#cloud-config\n"));
        assert!(user.contains("name: dev"));
        assert!(user.contains("ssh-ed25519 AAAA test@host"));
        assert!(user.contains("sudo: ALL=(ALL) NOPASSWD:ALL"));
        assert!(user.contains("systemctl enable --now ssh"));
        assert!(user.contains("cloud-init.disabled"));
        assert!(!user.contains("iptables"));
    }

    #[test]
    fn lockdown_variant_adds_default_drop_firewall() {
        let mut spec = spec();
        spec.lockdown = true;
        let user = spec.user_data();
        assert!(user.contains("iptables -P INPUT DROP"));
        assert!(user.contains("iptables -A INPUT -i lo -j ACCEPT"));
        assert!(user.contains("iptables -A INPUT -s 10.200.200.0/24 -j ACCEPT"));
        assert!(user.contains("ESTABLISHED,RELATED"));
    }

    #[test]
    fn network_config_renders_static_addressing() {
        let net = spec().network_config().unwrap();
        assert!(net.starts_with("version: 2\n"));
        assert!(net.contains("- 10.200.200.2/24"));
        assert!(net.contains("via: 10.200.200.1"));
        assert!(net.contains("[1.1.1.1, 8.8.8.8]"));
    }

    #[test]
    fn no_network_means_no_network_config() {
        let mut spec = spec();
        spec.network = None;
        assert!(spec.network_config().is_none());
    }

    #[test]
    fn generation_is_pure_over_inputs() {
        let a = spec();
        let b = spec();
        assert_eq!(a.meta_data(), b.meta_data());
        assert_eq!(a.user_data(), b.user_data());
        assert_eq!(a.network_config(), b.network_config());
    }

    #[tokio::test]
    async fn build_writes_seed_files() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("seed");
        let iso = dir.path().join("seed.iso");

        // `true` stands in for an ISO tool; only the seed files matter here.
        let author = CloudInitAuthor::with_tool("/bin/true");
        author.build_seed_iso(&spec(), &work, &iso).await.unwrap();

        assert!(work.join("meta-data").exists());
        assert!(work.join("user-data").exists());
        assert!(work.join("network-config").exists());
    }
}
