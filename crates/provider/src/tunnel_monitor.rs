//! WireGuard tunnel health monitoring (legacy consumer-tunnel path).
//!
//! One polling task per monitored VM queries the last handshake for the
//! VM's interface and the consumer's key. A tunnel with no handshake gets
//! a grace window from when monitoring started; after that, staleness past
//! the threshold is death. The death callback fires exactly once and the
//! task ends with it.

use crate::events::{EventFamily, EventLogger};
use omerta_core::VmId;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::process::Command;
use tokio::task::JoinHandle;

pub type DeathCallback = Arc<dyn Fn(VmId) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct TunnelHealthConfig {
    pub check_interval: Duration,
    pub timeout_threshold: Duration,
}

impl Default for TunnelHealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            timeout_threshold: Duration::from_secs(180),
        }
    }
}

pub struct TunnelHealthMonitor {
    config: TunnelHealthConfig,
    on_death: DeathCallback,
    events: Arc<EventLogger>,
    tasks: Mutex<HashMap<VmId, JoinHandle<()>>>,
}

impl TunnelHealthMonitor {
    pub fn new(
        config: TunnelHealthConfig,
        events: Arc<EventLogger>,
        on_death: DeathCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            on_death,
            events,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Begin monitoring one VM's tunnel. Replaces any existing watch.
    pub fn watch(self: &Arc<Self>, vm_id: VmId, vpn_interface: String, peer_public_key: String) {
        let this = self.clone();
        let task = tokio::spawn(async move {
            this.poll_loop(vm_id, vpn_interface, peer_public_key).await;
        });
        if let Some(previous) = self.tasks.lock().unwrap().insert(vm_id, task) {
            previous.abort();
        }
    }

    /// Stop monitoring. The poll loop ends before its next tick.
    pub fn unwatch(&self, vm_id: &VmId) {
        if let Some(task) = self.tasks.lock().unwrap().remove(vm_id) {
            task.abort();
        }
    }

    pub fn stop(&self) {
        for (_, task) in self.tasks.lock().unwrap().drain() {
            task.abort();
        }
    }

    pub fn watched(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    async fn poll_loop(&self, vm_id: VmId, vpn_interface: String, peer_public_key: String) {
        let started_at = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // tunnel gets a full interval before its first check.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let handshake = match query_handshake(&vpn_interface, &peer_public_key).await {
                Ok(handshake) => handshake,
                Err(e) => {
                    tracing::warn!(%vm_id, interface = %vpn_interface, error = %e, "wg query failed");
                    continue;
                }
            };

            let now_epoch = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if is_healthy(
                handshake,
                now_epoch,
                started_at.elapsed(),
                self.config.timeout_threshold,
            ) {
                continue;
            }

            tracing::warn!(%vm_id, interface = %vpn_interface, "tunnel is dead");
            self.events.emit(
                EventFamily::Vpn,
                "tunnel_dead",
                json!({
                    "vm_id": vm_id.to_string(),
                    "interface": vpn_interface,
                    "last_handshake": handshake,
                }),
            );
            self.tasks.lock().unwrap().remove(&vm_id);
            (self.on_death)(vm_id);
            return;
        }
    }
}

/// Last handshake epoch for a peer on an interface, via
/// `wg show <interface> latest-handshakes`. `None` means never.
async fn query_handshake(interface: &str, peer_public_key: &str) -> std::io::Result<Option<u64>> {
    let output = Command::new("wg")
        .args(["show", interface, "latest-handshakes"])
        .output()
        .await?;
    if !output.status.success() {
        return Err(std::io::Error::other(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(parse_latest_handshakes(
        &String::from_utf8_lossy(&output.stdout),
        peer_public_key,
    ))
}

/// Parse `wg show … latest-handshakes` output: one `key<TAB>epoch` pair
/// per line. Epoch 0 means no handshake yet.
fn parse_latest_handshakes(output: &str, peer_public_key: &str) -> Option<u64> {
    for line in output.lines() {
        let mut fields = line.split('\t');
        let (Some(key), Some(epoch)) = (fields.next(), fields.next()) else {
            continue;
        };
        if key != peer_public_key {
            continue;
        }
        return match epoch.trim().parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(epoch) => Some(epoch),
        };
    }
    None
}

/// A tunnel is healthy with a fresh handshake, or with none at all while
/// still inside the startup grace window.
fn is_healthy(
    handshake: Option<u64>,
    now_epoch: u64,
    since_start: Duration,
    threshold: Duration,
) -> bool {
    match handshake {
        Some(epoch) => now_epoch.saturating_sub(epoch) < threshold.as_secs(),
        None => since_start < threshold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY_A: &str = "mDqg1p9ZK+R1chWiimlTSRrh0i0sdJLdebmYnA9dKEE=";
    const KEY_B: &str = "Yp0pOXPSLbDSTEzZGlTO3CdIHWJv/lX0RRYJ0BwYyDo=";

    #[test]
    fn parses_tab_separated_handshakes() {
        let output = format!("{KEY_A}\t1722500000\n{KEY_B}\t1722500100\n");
        assert_eq!(parse_latest_handshakes(&output, KEY_A), Some(1722500000));
        assert_eq!(parse_latest_handshakes(&output, KEY_B), Some(1722500100));
    }

    #[test]
    fn zero_epoch_means_no_handshake() {
        let output = format!("{KEY_A}\t0\n");
        assert_eq!(parse_latest_handshakes(&output, KEY_A), None);
    }

    #[test]
    fn unknown_peer_yields_none() {
        let output = format!("{KEY_A}\t1722500000\n");
        assert_eq!(parse_latest_handshakes(&output, KEY_B), None);
    }

    #[test]
    fn fresh_handshake_is_healthy() {
        let threshold = Duration::from_secs(180);
        assert!(is_healthy(
            Some(1000),
            1100,
            Duration::from_secs(3600),
            threshold
        ));
        assert!(!is_healthy(
            Some(1000),
            1181,
            Duration::from_secs(3600),
            threshold
        ));
    }

    #[test]
    fn missing_handshake_gets_grace_window() {
        let threshold = Duration::from_secs(180);
        assert!(is_healthy(None, 1100, Duration::from_secs(60), threshold));
        assert!(!is_healthy(None, 1100, Duration::from_secs(181), threshold));
    }

    #[tokio::test(start_paused = true)]
    async fn unwatch_cancels_before_next_poll() {
        let events = Arc::new(EventLogger::new(std::env::temp_dir().join("omerta-test-logs")));
        let deaths = Arc::new(AtomicUsize::new(0));
        let deaths_cb = deaths.clone();
        let monitor = TunnelHealthMonitor::new(
            TunnelHealthConfig {
                check_interval: Duration::from_secs(30),
                timeout_threshold: Duration::from_secs(180),
            },
            events,
            Arc::new(move |_| {
                deaths_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let vm_id: VmId = "6fa459ea-ee8a-3ca4-894e-db77e160355e".parse().unwrap();
        monitor.watch(vm_id, "wg-vm0".to_string(), KEY_A.to_string());
        assert_eq!(monitor.watched(), 1);

        monitor.unwatch(&vm_id);
        assert_eq!(monitor.watched(), 0);

        // Advance well past several poll intervals: no callback fires.
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(deaths.load(Ordering::SeqCst), 0);
    }
}
