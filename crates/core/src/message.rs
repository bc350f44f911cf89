//! Mesh control-plane wire messages.
//!
//! One JSON object per message, dispatched by the `type` discriminator.
//! The taxonomy is fixed; decoding an unknown `type` fails so the dispatcher
//! can hand the raw bytes to a fallback handler.

use crate::VmId;
use crate::resources::ResourceRequirements;
use serde::{Deserialize, Serialize};

/// A request to launch a VM on this provider.
///
/// The VPN-era fields (`consumer_public_key`, `consumer_endpoint`,
/// `consumer_vpn_ip`) are carried for compatibility and ignored on the
/// mesh-tunnel path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRequest {
    pub vm_id: VmId,
    #[serde(default)]
    pub requirements: ResourceRequirements,
    pub ssh_public_key: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_vpn_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_vpn_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
}

fn default_ssh_user() -> String {
    "ubuntu".to_string()
}

/// Control messages exchanged with peers over the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    VmRequest(VmRequest),
    VmCreated {
        vm_id: VmId,
        vm_ip: Option<String>,
        provider_public_key: Option<String>,
        error: Option<String>,
    },
    VmError {
        vm_id: VmId,
        error: String,
    },
    VmAck {
        vm_id: VmId,
        success: bool,
    },
    VmRelease {
        vm_id: VmId,
    },
    VmReleased {
        vm_id: VmId,
        error: Option<String>,
    },
    VmReleaseAck {
        vm_id: VmId,
        success: bool,
    },
    VmHeartbeat {
        vm_ids: Vec<VmId>,
    },
    VmHeartbeatResponse {
        active_vm_ids: Vec<VmId>,
    },
    ProviderShutdown {
        vm_ids: Vec<VmId>,
    },
}

impl ControlMessage {
    /// Wire discriminator string, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::VmRequest(_) => "vm_request",
            ControlMessage::VmCreated { .. } => "vm_created",
            ControlMessage::VmError { .. } => "vm_error",
            ControlMessage::VmAck { .. } => "vm_ack",
            ControlMessage::VmRelease { .. } => "vm_release",
            ControlMessage::VmReleased { .. } => "vm_released",
            ControlMessage::VmReleaseAck { .. } => "vm_release_ack",
            ControlMessage::VmHeartbeat { .. } => "vm_heartbeat",
            ControlMessage::VmHeartbeatResponse { .. } => "vm_heartbeat_response",
            ControlMessage::ProviderShutdown { .. } => "provider_shutdown",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A fixed taxonomy of plain data; encoding cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_id() -> VmId {
        "a1a2a3a4-b1b2-c1c2-d1d2-e1e2e3e4e5e6".parse().unwrap()
    }

    #[test]
    fn vm_request_decodes_with_minimal_fields() {
        let json = format!(
            r#"{{"type":"vm_request","vm_id":"{}","ssh_public_key":"ssh-ed25519 AAAA test"}}"#,
            vm_id()
        );
        let msg = ControlMessage::decode(json.as_bytes()).unwrap();
        let ControlMessage::VmRequest(req) = msg else {
            panic!("expected vm_request");
        };
        assert_eq!(req.vm_id, vm_id());
        assert_eq!(req.ssh_user, "ubuntu");
        assert_eq!(req.requirements.cpu_cores(), 2);
        assert!(req.timeout_minutes.is_none());
    }

    #[test]
    fn vm_request_decodes_full_form() {
        let json = format!(
            r#"{{
                "type": "vm_request",
                "vm_id": "{}",
                "requirements": {{"cpu_cores": 4, "memory_mb": 8192}},
                "ssh_public_key": "ssh-ed25519 AAAA test",
                "ssh_user": "dev",
                "consumer_public_key": "pk",
                "consumer_endpoint": "203.0.113.9:51820",
                "vm_vpn_ip": "10.200.200.2",
                "consumer_vpn_ip": "10.200.200.1",
                "timeout_minutes": 10
            }}"#,
            vm_id()
        );
        let ControlMessage::VmRequest(req) = ControlMessage::decode(json.as_bytes()).unwrap()
        else {
            panic!("expected vm_request");
        };
        assert_eq!(req.requirements.cpu_cores(), 4);
        assert_eq!(req.vm_vpn_ip.as_deref(), Some("10.200.200.2"));
        assert_eq!(req.timeout_minutes, Some(10));
    }

    #[test]
    fn type_tag_round_trip() {
        let messages = vec![
            ControlMessage::VmCreated {
                vm_id: vm_id(),
                vm_ip: Some("10.200.200.2".to_string()),
                provider_public_key: Some("pk".to_string()),
                error: None,
            },
            ControlMessage::VmAck {
                vm_id: vm_id(),
                success: true,
            },
            ControlMessage::VmHeartbeat {
                vm_ids: vec![vm_id()],
            },
            ControlMessage::VmHeartbeatResponse {
                active_vm_ids: vec![],
            },
            ControlMessage::ProviderShutdown {
                vm_ids: vec![vm_id()],
            },
        ];
        for msg in messages {
            let bytes = msg.encode();
            let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(value["type"], msg.kind());
            assert_eq!(ControlMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn vm_created_serializes_null_error() {
        let msg = ControlMessage::VmCreated {
            vm_id: vm_id(),
            vm_ip: Some("10.200.200.2".to_string()),
            provider_public_key: None,
            error: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert!(value.get("error").unwrap().is_null());
    }

    #[test]
    fn unknown_type_fails_decode() {
        let json = br#"{"type":"vm_migrate","vm_id":"a1a2a3a4-b1b2-c1c2-d1d2-e1e2e3e4e5e6"}"#;
        assert!(ControlMessage::decode(json).is_err());
    }

    #[test]
    fn uuids_are_string_serialized() {
        let msg = ControlMessage::VmRelease { vm_id: vm_id() };
        let value: serde_json::Value = serde_json::from_slice(&msg.encode()).unwrap();
        assert_eq!(value["vm_id"], vm_id().to_string());
    }
}
