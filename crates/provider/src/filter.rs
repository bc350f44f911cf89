//! Request filtering.
//!
//! An ordered rule list plus a default action decide whether an incoming VM
//! request is accepted, rejected, or parked for manual approval. The owner
//! peer bypasses everything; blocked peers are rejected before any rule
//! runs. Rules evaluate by priority, highest first; the first non-pass
//! outcome decides and carries the rule's name.

use omerta_core::{PeerId, ResourceRequirements};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Why a request was accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptBasis {
    Owner,
    TrustedNetwork,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept { basis: AcceptBasis },
    Reject { reason: String },
    RequireApproval { reason: String },
}

impl FilterDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, FilterDecision::Accept { .. })
    }
}

/// Action applied when no rule decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultAction {
    #[default]
    AcceptAll,
    RejectAll,
    RequireApproval,
    AcceptTrustedOnly,
}

/// One request as the filter sees it.
#[derive(Debug, Clone)]
pub struct FilterRequest<'a> {
    pub requester: PeerId,
    pub network_id: Option<&'a str>,
    pub requirements: &'a ResourceRequirements,
    pub activity_description: Option<&'a str>,
}

/// Outcome of a single rule.
enum RuleOutcome {
    Pass,
    Reject(String),
    RequireApproval(String),
}

/// Built-in rule families.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    /// Per-dimension resource caps; exceeding any cap rejects.
    ResourceLimits {
        #[serde(default)]
        max_cpu_cores: Option<u32>,
        #[serde(default)]
        max_memory_mb: Option<u64>,
        #[serde(default)]
        max_storage_mb: Option<u64>,
        #[serde(default)]
        max_runtime_seconds: Option<u64>,
    },
    /// Keyword allow/deny lists over the activity description.
    ActivityKeywords {
        #[serde(default)]
        allow: Vec<String>,
        #[serde(default)]
        deny: Vec<String>,
    },
    /// Wall-clock window, inclusive of `start_hour`, exclusive of
    /// `end_hour`; wraps across midnight when `start_hour > end_hour`.
    QuietHours {
        start_hour: u32,
        end_hour: u32,
        action: QuietHoursAction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuietHoursAction {
    Reject,
    RequireApproval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: RuleKind,
}

fn enabled_by_default() -> bool {
    true
}

impl Rule {
    fn evaluate(&self, req: &FilterRequest<'_>, hour: u32) -> RuleOutcome {
        match &self.kind {
            RuleKind::ResourceLimits {
                max_cpu_cores,
                max_memory_mb,
                max_storage_mb,
                max_runtime_seconds,
            } => {
                if let Some(max) = max_cpu_cores {
                    if req.requirements.cpu_cores() > *max {
                        return RuleOutcome::Reject(format!(
                            "requested {} cpu cores, limit is {max}",
                            req.requirements.cpu_cores()
                        ));
                    }
                }
                if let Some(max) = max_memory_mb {
                    if req.requirements.memory_mb() > *max {
                        return RuleOutcome::Reject(format!(
                            "requested {} MiB memory, limit is {max}",
                            req.requirements.memory_mb()
                        ));
                    }
                }
                if let Some(max) = max_storage_mb {
                    if req.requirements.storage_mb() > *max {
                        return RuleOutcome::Reject(format!(
                            "requested {} MiB storage, limit is {max}",
                            req.requirements.storage_mb()
                        ));
                    }
                }
                if let (Some(max), Some(requested)) =
                    (max_runtime_seconds, req.requirements.max_runtime_seconds)
                {
                    if requested > *max {
                        return RuleOutcome::Reject(format!(
                            "requested {requested}s runtime, limit is {max}s"
                        ));
                    }
                }
                RuleOutcome::Pass
            }
            RuleKind::ActivityKeywords { allow, deny } => {
                let description = req.activity_description.unwrap_or("").to_lowercase();
                for keyword in deny {
                    if description.contains(&keyword.to_lowercase()) {
                        return RuleOutcome::Reject(format!(
                            "activity matches denied keyword '{keyword}'"
                        ));
                    }
                }
                if !allow.is_empty()
                    && !allow
                        .iter()
                        .any(|k| description.contains(&k.to_lowercase()))
                {
                    return RuleOutcome::Reject(
                        "activity matches no allowed keyword".to_string(),
                    );
                }
                RuleOutcome::Pass
            }
            RuleKind::QuietHours {
                start_hour,
                end_hour,
                action,
            } => {
                if !in_window(hour, *start_hour, *end_hour) {
                    return RuleOutcome::Pass;
                }
                let reason = format!("inside quiet hours {start_hour}:00-{end_hour}:00");
                match action {
                    QuietHoursAction::Reject => RuleOutcome::Reject(reason),
                    QuietHoursAction::RequireApproval => RuleOutcome::RequireApproval(reason),
                }
            }
        }
    }
}

/// Window membership, inclusive start, exclusive end, wrapping midnight.
fn in_window(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        false
    } else if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

struct Inner {
    rules: HashMap<String, Rule>,
    default_action: DefaultAction,
    trusted_networks: HashSet<String>,
    blocked_peers: HashSet<PeerId>,
    owner: Option<PeerId>,
}

pub struct FilterEngine {
    inner: RwLock<Inner>,
}

impl FilterEngine {
    pub fn new(default_action: DefaultAction) -> Self {
        Self {
            inner: RwLock::new(Inner {
                rules: HashMap::new(),
                default_action,
                trusted_networks: HashSet::new(),
                blocked_peers: HashSet::new(),
                owner: None,
            }),
        }
    }

    pub fn set_owner(&self, owner: PeerId) {
        self.inner.write().unwrap().owner = Some(owner);
    }

    pub fn add_rule(&self, rule: Rule) {
        self.inner.write().unwrap().rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        self.inner.write().unwrap().rules.remove(id).is_some()
    }

    /// Enable or disable a rule. Returns false when no such rule exists.
    pub fn set_rule_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.inner.write().unwrap().rules.get_mut(id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn trust_network(&self, network_id: impl Into<String>) {
        self.inner
            .write()
            .unwrap()
            .trusted_networks
            .insert(network_id.into());
    }

    pub fn block_peer(&self, peer: PeerId) {
        self.inner.write().unwrap().blocked_peers.insert(peer);
    }

    pub fn unblock_peer(&self, peer: &PeerId) -> bool {
        self.inner.write().unwrap().blocked_peers.remove(peer)
    }

    /// Evaluate at the current local wall-clock hour.
    pub fn evaluate(&self, req: &FilterRequest<'_>) -> FilterDecision {
        use chrono::Timelike;
        self.evaluate_at(req, chrono::Local::now().hour())
    }

    /// Evaluate at an explicit hour-of-day; quiet-hours rules are the only
    /// time-dependent part, so this is periodic in 24 h.
    pub fn evaluate_at(&self, req: &FilterRequest<'_>, hour: u32) -> FilterDecision {
        let inner = self.inner.read().unwrap();

        if inner.owner == Some(req.requester) {
            return FilterDecision::Accept {
                basis: AcceptBasis::Owner,
            };
        }

        if inner.blocked_peers.contains(&req.requester) {
            return FilterDecision::Reject {
                reason: "Peer is blocked".to_string(),
            };
        }

        let mut rules: Vec<&Rule> = inner.rules.values().filter(|r| r.enabled).collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        for rule in rules {
            match rule.evaluate(req, hour % 24) {
                RuleOutcome::Pass => {}
                RuleOutcome::Reject(msg) => {
                    return FilterDecision::Reject {
                        reason: format!("{}: {msg}", rule.name),
                    };
                }
                RuleOutcome::RequireApproval(msg) => {
                    return FilterDecision::RequireApproval {
                        reason: format!("{}: {msg}", rule.name),
                    };
                }
            }
        }

        let trusted = req
            .network_id
            .map(|n| inner.trusted_networks.contains(n))
            .unwrap_or(false);

        match inner.default_action {
            DefaultAction::AcceptAll => {
                if trusted {
                    FilterDecision::Accept {
                        basis: AcceptBasis::TrustedNetwork,
                    }
                } else {
                    FilterDecision::RequireApproval {
                        reason: "network is not trusted".to_string(),
                    }
                }
            }
            DefaultAction::AcceptTrustedOnly => {
                if trusted {
                    FilterDecision::Accept {
                        basis: AcceptBasis::TrustedNetwork,
                    }
                } else {
                    FilterDecision::Reject {
                        reason: "network is not trusted".to_string(),
                    }
                }
            }
            DefaultAction::RejectAll => FilterDecision::Reject {
                reason: "rejected by default policy".to_string(),
            },
            DefaultAction::RequireApproval => FilterDecision::RequireApproval {
                reason: "manual approval required".to_string(),
            },
        }
    }
}
