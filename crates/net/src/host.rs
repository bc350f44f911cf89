//! Host-side network provisioning for TAP VMs (Linux).
//!
//! Assigns the gateway address, enables forwarding and proxy-ARP, and
//! installs the NAT/forwarding rules that let a TAP subnet reach the
//! outside world. Every installed rule set leaves a marker file behind so
//! an external cleanup tool can reap anchors from a crashed provider.

use crate::error::{NetError, Result};
use crate::subnet::TapSubnet;
use std::path::PathBuf;
use tokio::process::Command;

pub struct HostNetwork {
    firewall_marker_dir: PathBuf,
}

impl HostNetwork {
    pub fn new(firewall_marker_dir: impl Into<PathBuf>) -> Self {
        Self {
            firewall_marker_dir: firewall_marker_dir.into(),
        }
    }

    /// Assign the gateway address to the TAP interface, bring it up, and
    /// enable IPv4 forwarding plus proxy-ARP for it.
    pub async fn configure_tap(&self, interface: &str, subnet: &TapSubnet) -> Result<()> {
        run("ip", &["addr", "add", &format!("{}/24", subnet.gateway()), "dev", interface]).await?;
        run("ip", &["link", "set", interface, "up"]).await?;

        write_sysctl("/proc/sys/net/ipv4/ip_forward", "1").await?;
        write_sysctl(
            &format!("/proc/sys/net/ipv4/conf/{interface}/proxy_arp"),
            "1",
        )
        .await?;
        Ok(())
    }

    /// Install MASQUERADE for the subnet on the default-route interface and
    /// the two FORWARD ACCEPT rules for it. Returns the uplink interface so
    /// teardown can remove the same rules.
    pub async fn install_forwarding(&self, interface: &str, subnet: &TapSubnet) -> Result<String> {
        let uplink = default_route_interface().await?;
        let cidr = subnet.cidr();

        run(
            "iptables",
            &["-t", "nat", "-A", "POSTROUTING", "-s", &cidr, "-o", &uplink, "-j", "MASQUERADE"],
        )
        .await?;
        run("iptables", &["-A", "FORWARD", "-s", &cidr, "-j", "ACCEPT"]).await?;
        run(
            "iptables",
            &[
                "-A", "FORWARD", "-d", &cidr, "-m", "state", "--state", "ESTABLISHED,RELATED",
                "-j", "ACCEPT",
            ],
        )
        .await?;

        self.write_marker(interface, subnet, &uplink).await;
        Ok(uplink)
    }

    /// Remove the rules installed by [`install_forwarding`]. Each removal is
    /// attempted even when an earlier one fails; errors are logged only,
    /// since teardown must always run to completion.
    ///
    /// [`install_forwarding`]: HostNetwork::install_forwarding
    pub async fn remove_forwarding(&self, interface: &str, subnet: &TapSubnet, uplink: &str) {
        let cidr = subnet.cidr();
        let deletions: [&[&str]; 3] = [
            &["-t", "nat", "-D", "POSTROUTING", "-s", &cidr, "-o", uplink, "-j", "MASQUERADE"],
            &["-D", "FORWARD", "-s", &cidr, "-j", "ACCEPT"],
            &[
                "-D", "FORWARD", "-d", &cidr, "-m", "state", "--state", "ESTABLISHED,RELATED",
                "-j", "ACCEPT",
            ],
        ];
        for args in deletions {
            if let Err(e) = run("iptables", args).await {
                tracing::warn!(error = %e, "failed to remove iptables rule");
            }
        }

        let marker = self.marker_path(interface);
        if let Err(e) = tokio::fs::remove_file(&marker).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %marker.display(), error = %e, "failed to remove firewall marker");
            }
        }
    }

    /// Best-effort interface deletion for crash recovery; a TAP created by
    /// this provider normally disappears when its descriptor closes.
    pub async fn delete_tap(&self, interface: &str) {
        if let Err(e) = run("ip", &["link", "del", interface]).await {
            tracing::debug!(interface, error = %e, "TAP already gone");
        }
    }

    fn marker_path(&self, interface: &str) -> PathBuf {
        self.firewall_marker_dir.join(format!("{interface}.marker"))
    }

    async fn write_marker(&self, interface: &str, subnet: &TapSubnet, uplink: &str) {
        if let Err(e) = tokio::fs::create_dir_all(&self.firewall_marker_dir).await {
            tracing::warn!(error = %e, "cannot create firewall marker dir");
            return;
        }
        let body = format!(
            "interface={interface}\nsubnet={}\nuplink={uplink}\nrules=masquerade,forward-src,forward-established\n",
            subnet.cidr()
        );
        if let Err(e) = tokio::fs::write(self.marker_path(interface), body).await {
            tracing::warn!(error = %e, "cannot write firewall marker");
        }
    }
}

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| NetError::HostCommand {
            command: program.to_string(),
            stderr: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(NetError::HostCommand {
            command: format!("{program} {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

async fn write_sysctl(path: &str, value: &str) -> Result<()> {
    tokio::fs::write(path, value).await.map_err(NetError::Io)
}

/// Interface carrying the default route, from `/proc/net/route`.
async fn default_route_interface() -> Result<String> {
    let table = tokio::fs::read_to_string("/proc/net/route").await?;
    parse_default_route(&table).ok_or_else(|| NetError::HostCommand {
        command: "default route lookup".to_string(),
        stderr: "no default route found".to_string(),
    })
}

fn parse_default_route(table: &str) -> Option<String> {
    for line in table.lines().skip(1) {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        if destination == "00000000" {
            return Some(iface.to_string());
        }
    }
    None
}
