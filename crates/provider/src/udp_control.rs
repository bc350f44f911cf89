//! Legacy UDP control surface (compatibility layer).
//!
//! The pre-mesh wire format: a UDP datagram carrying
//! `[network_id_len: u16 BE][network_id][sealed box]`, where the sealed
//! box decrypts to the same JSON control taxonomy plus a `timestamp`
//! field that must sit within ±60 s of wall clock. The cipher itself
//! (ChaCha20-Poly1305 over the network key) is an external collaborator,
//! consumed here as a contract.

use omerta_core::{ControlMessage, Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Acceptable skew between a message timestamp and wall clock.
pub const TIMESTAMP_SKEW: f64 = 60.0;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Sealing contract for the legacy envelope.
pub trait SealedCipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Vec<u8>;
    /// Returns `None` when the box fails to authenticate.
    fn open(&self, sealed: &[u8]) -> Option<Vec<u8>>;
}

/// One framed control datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEnvelope {
    pub network_id: String,
    pub sealed: Vec<u8>,
}

impl ControlEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let id = self.network_id.as_bytes();
        let mut out = Vec::with_capacity(2 + id.len() + self.sealed.len());
        out.extend_from_slice(&(id.len() as u16).to_be_bytes());
        out.extend_from_slice(id);
        out.extend_from_slice(&self.sealed);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(Error::InvalidConfig("short control datagram".to_string()));
        }
        let id_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if bytes.len() < 2 + id_len {
            return Err(Error::InvalidConfig(
                "control datagram truncates network id".to_string(),
            ));
        }
        let network_id = String::from_utf8(bytes[2..2 + id_len].to_vec())
            .map_err(|_| Error::InvalidConfig("network id is not UTF-8".to_string()))?;
        Ok(Self {
            network_id,
            sealed: bytes[2 + id_len..].to_vec(),
        })
    }
}

/// A message received on the legacy surface.
#[derive(Debug)]
pub struct ControlDatagram {
    pub from: SocketAddr,
    pub message: ControlMessage,
}

pub struct UdpControlServer {
    socket: Arc<UdpSocket>,
    cipher: Arc<dyn SealedCipher>,
    network_id: String,
}

impl UdpControlServer {
    pub async fn bind(
        addr: SocketAddr,
        network_id: String,
        cipher: Arc<dyn SealedCipher>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            cipher,
            network_id,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop: validated messages surface on the returned channel.
    pub fn spawn(self: Arc<Self>) -> (mpsc::Receiver<ControlDatagram>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(64);
        let this = self.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match this.socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::error!(error = %e, "udp control socket failed");
                        return;
                    }
                };
                match this.open_datagram(&buf[..len]) {
                    Ok(message) => {
                        if tx.send(ControlDatagram { from, message }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%from, error = %e, "discarding control datagram");
                    }
                }
            }
        });
        (rx, task)
    }

    /// Send one sealed control message.
    pub async fn send_to(&self, to: SocketAddr, message: &ControlMessage) -> Result<()> {
        let mut value = serde_json::to_value(message)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(object) = value.as_object_mut() {
            object.insert("timestamp".to_string(), serde_json::json!(epoch_now()));
        }
        let plaintext = serde_json::to_vec(&value)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        let envelope = ControlEnvelope {
            network_id: self.network_id.clone(),
            sealed: self.cipher.seal(&plaintext),
        };
        self.socket.send_to(&envelope.encode(), to).await?;
        Ok(())
    }

    fn open_datagram(&self, bytes: &[u8]) -> Result<ControlMessage> {
        let envelope = ControlEnvelope::decode(bytes)?;
        if envelope.network_id != self.network_id {
            return Err(Error::InvalidConfig(format!(
                "wrong network id '{}'",
                envelope.network_id
            )));
        }
        let plaintext = self
            .cipher
            .open(&envelope.sealed)
            .ok_or_else(|| Error::InvalidConfig("sealed box failed to open".to_string()))?;
        decode_fresh(&plaintext, epoch_now())
    }
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Decode plaintext and enforce timestamp freshness.
fn decode_fresh(plaintext: &[u8], now_epoch: f64) -> Result<ControlMessage> {
    let value: serde_json::Value = serde_json::from_slice(plaintext)
        .map_err(|e| Error::InvalidConfig(format!("bad control payload: {e}")))?;
    let timestamp = value
        .get("timestamp")
        .and_then(|t| t.as_f64())
        .ok_or_else(|| Error::InvalidConfig("control message lacks a timestamp".to_string()))?;
    if (now_epoch - timestamp).abs() > TIMESTAMP_SKEW {
        return Err(Error::InvalidConfig(format!(
            "stale control message ({:.0}s skew)",
            (now_epoch - timestamp).abs()
        )));
    }
    serde_json::from_value(value).map_err(|e| Error::InvalidConfig(format!("bad control message: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use omerta_core::VmId;

    /// XOR stand-in for the real sealed box.
    struct XorCipher(u8);

    impl SealedCipher for XorCipher {
        fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
            plaintext.iter().map(|b| b ^ self.0).collect()
        }

        fn open(&self, sealed: &[u8]) -> Option<Vec<u8>> {
            Some(sealed.iter().map(|b| b ^ self.0).collect())
        }
    }

    fn vm_id() -> VmId {
        "6fa459ea-ee8a-3ca4-894e-db77e160355e".parse().unwrap()
    }

    #[test]
    fn envelope_round_trip() {
        let envelope = ControlEnvelope {
            network_id: "homelab".to_string(),
            sealed: vec![1, 2, 3, 4],
        };
        let decoded = ControlEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        assert!(ControlEnvelope::decode(&[0]).is_err());
        // Claims an 8-byte id but carries 3.
        assert!(ControlEnvelope::decode(&[0, 8, b'a', b'b', b'c']).is_err());
    }

    #[test]
    fn fresh_timestamp_is_accepted() {
        let now = 1_722_500_000.0;
        let plaintext = format!(
            r#"{{"type":"vm_release","vm_id":"{}","timestamp":{}}}"#,
            vm_id(),
            now - 30.0
        );
        let message = decode_fresh(plaintext.as_bytes(), now).unwrap();
        assert_eq!(message, ControlMessage::VmRelease { vm_id: vm_id() });
    }

    #[test]
    fn stale_and_future_timestamps_are_rejected() {
        let now = 1_722_500_000.0;
        for skew in [-61.0, 61.0, 3600.0] {
            let plaintext = format!(
                r#"{{"type":"vm_release","vm_id":"{}","timestamp":{}}}"#,
                vm_id(),
                now + skew
            );
            assert!(decode_fresh(plaintext.as_bytes(), now).is_err());
        }
    }

    #[test]
    fn missing_timestamp_is_rejected() {
        let plaintext = format!(r#"{{"type":"vm_release","vm_id":"{}"}}"#, vm_id());
        assert!(decode_fresh(plaintext.as_bytes(), 1_722_500_000.0).is_err());
    }

    #[tokio::test]
    async fn server_delivers_sealed_messages() {
        let cipher: Arc<dyn SealedCipher> = Arc::new(XorCipher(0x5a));
        let server = Arc::new(
            UdpControlServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                "homelab".to_string(),
                cipher.clone(),
            )
            .await
            .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let (mut rx, _task) = server.clone().spawn();

        let plaintext = format!(
            r#"{{"type":"vm_release","vm_id":"{}","timestamp":{}}}"#,
            vm_id(),
            epoch_now()
        );
        let envelope = ControlEnvelope {
            network_id: "homelab".to_string(),
            sealed: cipher.seal(plaintext.as_bytes()),
        };

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&envelope.encode(), addr).await.unwrap();

        let datagram = rx.recv().await.unwrap();
        assert_eq!(
            datagram.message,
            ControlMessage::VmRelease { vm_id: vm_id() }
        );
    }

    #[tokio::test]
    async fn wrong_network_id_is_dropped() {
        let cipher: Arc<dyn SealedCipher> = Arc::new(XorCipher(0x5a));
        let server = Arc::new(
            UdpControlServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                "homelab".to_string(),
                cipher.clone(),
            )
            .await
            .unwrap(),
        );
        let addr = server.local_addr().unwrap();
        let (mut rx, _task) = server.clone().spawn();

        let plaintext = format!(
            r#"{{"type":"vm_release","vm_id":"{}","timestamp":{}}}"#,
            vm_id(),
            epoch_now()
        );
        let envelope = ControlEnvelope {
            network_id: "other-network".to_string(),
            sealed: cipher.seal(plaintext.as_bytes()),
        };
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(&envelope.encode(), addr).await.unwrap();

        tokio::select! {
            _ = rx.recv() => panic!("message on wrong network must not surface"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }
}
