#![forbid(unsafe_code)]

use crate::blocklist::{BlockEntry, BlockList};
use crate::capture::VerdictHandle;
use crate::events::{unix_to_rfc3339, FirewallEvent};
use crate::headers::ApplicationHeaders;
use crate::history::SourceHistory;
use crate::packet::{ParsedPacket, SourceKey, VerdictStatus};
use crate::queue::DynamicQueueManager;
use crate::request::{Request, DEFAULT_MAX_TIME};
use crate::rules::{best_match, InvalidRuleConfig, Rule, RuleKind, RuleSpec};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const PRIORITY_ROUTINE: u8 = 0;
const PRIORITY_DENY: u8 = 1;
const PRIORITY_BLOCK: u8 = 2;

/// Payload-level policy layered on top of the ip/port rules: recognized
/// message-type names, a protocol version floor, and caller-identity
/// blacklist/whitelist sets. Whitelisted callers bypass these checks only;
/// rule matching and detection still apply to them.
#[derive(Debug, Clone, Default)]
pub struct IdentityPolicy {
    pub synapse_names: Vec<String>,
    pub min_version: Option<u64>,
    pub whitelist: HashSet<String>,
    pub blacklist: HashSet<String>,
}

impl IdentityPolicy {
    /// First identity check the headers fail, as the deny reason.
    pub fn violation(&self, headers: &ApplicationHeaders) -> Option<String> {
        if let Some(hotkey) = &headers.dendrite_hotkey {
            if self.whitelist.contains(hotkey) {
                return None;
            }
            if self.blacklist.contains(hotkey) {
                return Some(format!("Hotkey '{hotkey}' is blacklisted"));
            }
        }
        if let Some(name) = &headers.name {
            if !self.synapse_names.is_empty() && !self.synapse_names.contains(name) {
                return Some(format!(
                    "Synapse name '{name}' not found, available {:?}",
                    self.synapse_names
                ));
            }
        }
        if let (Some(version), Some(min)) = (headers.dendrite_version, self.min_version) {
            if version < min {
                return Some(format!(
                    "Neuron version {version} is outdated, version {min} is required."
                ));
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCounters {
    pub processed: u64,
    pub allowed: u64,
    pub denied: u64,
}

/// Outcome of one packet callback, for callers that report per-packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub status: VerdictStatus,
    pub rule_kind: Option<RuleKind>,
    pub reason: Option<String>,
}

/// The per-packet decision pipeline. Owned by the single interception
/// thread; everything it shares with the consumer side goes through the
/// telemetry queue and the block list mutex.
pub struct FirewallEngine {
    rules: Vec<Rule>,
    identity: IdentityPolicy,
    history: SourceHistory,
    packet_times: HashMap<SourceKey, VecDeque<f64>>,
    port_requests: HashMap<u16, VecDeque<f64>>,
    max_detection_window: u64,
    blocklist: Arc<Mutex<BlockList>>,
    queue: Arc<DynamicQueueManager<FirewallEvent>>,
    next_request_id: u64,
    counters: EngineCounters,
}

impl FirewallEngine {
    pub fn new(
        blocklist: Arc<Mutex<BlockList>>,
        queue: Arc<DynamicQueueManager<FirewallEvent>>,
    ) -> FirewallEngine {
        FirewallEngine {
            rules: Vec::new(),
            identity: IdentityPolicy::default(),
            history: SourceHistory::new(),
            packet_times: HashMap::new(),
            port_requests: HashMap::new(),
            max_detection_window: DEFAULT_MAX_TIME,
            blocklist,
            queue,
            next_request_id: 0,
            counters: EngineCounters::default(),
        }
    }

    /// Replaces the active rule set and caller-identity sets. Validation
    /// happens up front: on any invalid specification nothing changes.
    pub fn update(
        &mut self,
        specs: &[RuleSpec],
        whitelist: &[String],
        blacklist: &[String],
    ) -> Result<(), InvalidRuleConfig> {
        let mut rules = Vec::with_capacity(specs.len());
        for spec in specs {
            rules.push(Rule::create(spec)?);
        }
        self.max_detection_window = rules
            .iter()
            .filter_map(|rule| match rule {
                Rule::DetectDos(d) | Rule::DetectDdos(d) => Some(d.time_window),
                _ => None,
            })
            .max()
            .unwrap_or(DEFAULT_MAX_TIME);
        self.rules = rules;
        self.identity.whitelist = whitelist.iter().cloned().collect();
        self.identity.blacklist = blacklist.iter().cloned().collect();
        Ok(())
    }

    /// Sets the recognized message-type names and the protocol version
    /// floor enforced on data packets.
    pub fn set_identity_requirements(
        &mut self,
        synapse_names: Vec<String>,
        min_version: Option<u64>,
    ) {
        self.identity.synapse_names = synapse_names;
        self.identity.min_version = min_version;
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn counters(&self) -> EngineCounters {
        self.counters
    }

    /// The packet callback: parse, assimilate into a request, decide,
    /// commit the verdict to the capture handle, enqueue telemetry.
    pub fn handle_packet<V: VerdictHandle>(
        &mut self,
        raw: &[u8],
        capture_time: f64,
        queue_num: u16,
        handle: V,
    ) -> Decision {
        self.counters.processed += 1;
        let now = capture_time;
        let mut packet = ParsedPacket::parse(raw, capture_time, queue_num);

        let Some(key) = packet.source_key() else {
            // unparseable traffic never matches anything: deny by default
            packet.set_deny(None, "Deny ip".into(), DEFAULT_MAX_TIME);
            let decision = Decision {
                status: VerdictStatus::Deny,
                rule_kind: None,
                reason: Some("Deny ip".into()),
            };
            self.counters.denied += 1;
            handle.drop();
            self.queue.put(
                FirewallEvent::Decision {
                    timestamp: unix_to_rfc3339(now),
                    ip: "unknown".into(),
                    port: 0,
                    protocol: "unknown".into(),
                    request_id: 0,
                    status: VerdictStatus::Deny,
                    rule_type: None,
                    reason: decision.reason.clone(),
                    packets_in_window: 0,
                },
                PRIORITY_DENY,
            );
            return decision;
        };

        let packets_in_window = self.note_packet(&key, now);
        let is_data = packet.is_data();
        let headers = packet.headers.clone();
        let request_index = self.assimilate(&key, packet, now);

        let verdict = self.decide(&key, is_data, &headers, now);
        if let Some(last) = self
            .history
            .request_mut(&key, request_index)
            .and_then(|r| r.packets.last_mut())
        {
            match verdict.status {
                VerdictStatus::Allow => {
                    last.set_allow(verdict.rule_kind, verdict.max_time);
                    self.counters.allowed += 1;
                }
                _ => {
                    let reason = verdict.reason.clone().unwrap_or_else(|| "Deny ip".into());
                    last.set_deny(verdict.rule_kind, reason, verdict.max_time);
                    self.counters.denied += 1;
                }
            }
        }
        let decision = Decision {
            status: verdict.status,
            rule_kind: verdict.rule_kind,
            reason: verdict.reason,
        };
        let request_id = self
            .history
            .requests(&key)
            .get(request_index)
            .map(|r| r.id)
            .unwrap_or(0);

        self.maintain_blocklist(&key, request_index, now);

        match decision.status {
            VerdictStatus::Allow => handle.accept(),
            _ => handle.drop(),
        }

        let priority = match decision.status {
            VerdictStatus::Deny => PRIORITY_DENY,
            _ => PRIORITY_ROUTINE,
        };
        self.queue.put(
            FirewallEvent::Decision {
                timestamp: unix_to_rfc3339(now),
                ip: key.ip.to_string(),
                port: key.port,
                protocol: key.protocol.to_string(),
                request_id,
                status: decision.status,
                rule_type: decision.rule_kind,
                reason: decision.reason.clone(),
                packets_in_window,
            },
            priority,
        );
        decision
    }

    /// Runs the retention pass over the source history and emits a cleanup
    /// event naming the pruned request ids.
    pub fn sweep(&mut self, now: f64) -> usize {
        let pruned = self.history.clean(now);
        let horizon = self.max_detection_window.max(DEFAULT_MAX_TIME) as f64;
        self.packet_times.retain(|_, times| {
            while times.front().map(|t| now - *t >= horizon).unwrap_or(false) {
                times.pop_front();
            }
            !times.is_empty()
        });
        self.port_requests.retain(|_, times| {
            while times.front().map(|t| now - *t >= horizon).unwrap_or(false) {
                times.pop_front();
            }
            !times.is_empty()
        });
        self.queue.put(
            FirewallEvent::Cleanup {
                timestamp: unix_to_rfc3339(now),
                pruned: pruned.iter().map(|r| r.id).collect(),
            },
            PRIORITY_ROUTINE,
        );
        pruned.len()
    }

    fn note_packet(&mut self, key: &SourceKey, now: f64) -> u64 {
        let horizon = self.max_detection_window.max(DEFAULT_MAX_TIME) as f64;
        let times = self.packet_times.entry(*key).or_default();
        while times.front().map(|t| now - *t >= horizon).unwrap_or(false) {
            times.pop_front();
        }
        times.push_back(now);
        times.len() as u64
    }

    /// Places the packet in a request and returns the request's index: a
    /// SYN (or the first packet ever seen from a source) starts a new
    /// request; anything else lands in the flow its sequence number falls
    /// into, or failing that in the source's most recent request.
    fn assimilate(&mut self, key: &SourceKey, packet: ParsedPacket, now: f64) -> usize {
        let existing = if packet.is_syn() {
            None
        } else {
            packet
                .seq
                .and_then(|seq| self.history.flow_index(key, seq))
                .or_else(|| self.history.last_index(key))
        };
        let index = match existing {
            Some(index) => index,
            None => {
                let id = self.next_request_id;
                self.next_request_id += 1;
                let previous_id = self.history.last_decisive_id(key);
                self.history.push_request(*key, Request::new(id, previous_id));
                // flow starts feed the cross-source per-port index
                let horizon = self.max_detection_window.max(DEFAULT_MAX_TIME) as f64;
                let times = self.port_requests.entry(key.port).or_default();
                while times.front().map(|t| now - *t >= horizon).unwrap_or(false) {
                    times.pop_front();
                }
                times.push_back(now);
                self.history.last_index(key).unwrap_or(0)
            }
        };
        if let Some(request) = self.history.request_mut(key, index) {
            request.push(packet);
        }
        index
    }

    fn decide(
        &self,
        key: &SourceKey,
        is_data: bool,
        headers: &ApplicationHeaders,
        now: f64,
    ) -> PendingVerdict {
        // identity policy runs first and wins over everything else
        if is_data && !headers.is_empty() {
            if let Some(reason) = self.identity.violation(headers) {
                return PendingVerdict::deny(None, reason, DEFAULT_MAX_TIME);
            }
        }

        if let Some(Rule::DetectDos(detection)) = best_match(&self.rules, RuleKind::DetectDos, key)
        {
            let count = self.history.count_recent(key, now, detection.time_window);
            if count > detection.packet_threshold {
                return PendingVerdict::deny(
                    Some(RuleKind::DetectDos),
                    format!(
                        "DoS attack detected: {count} requests in {} seconds",
                        detection.time_window
                    ),
                    detection.time_window,
                );
            }
            return PendingVerdict::allow(Some(RuleKind::DetectDos), detection.time_window);
        }

        if let Some(Rule::DetectDdos(detection)) =
            best_match(&self.rules, RuleKind::DetectDdos, key)
        {
            let count = self
                .port_requests
                .get(&key.port)
                .map(|times| {
                    times
                        .iter()
                        .filter(|t| now - **t < detection.time_window as f64)
                        .count() as u64
                })
                .unwrap_or(0);
            if count > detection.packet_threshold {
                return PendingVerdict::deny(
                    Some(RuleKind::DetectDdos),
                    format!(
                        "DDoS attack detected: {count} requests in {} seconds",
                        detection.time_window
                    ),
                    detection.time_window,
                );
            }
            return PendingVerdict::allow(Some(RuleKind::DetectDdos), detection.time_window);
        }

        if best_match(&self.rules, RuleKind::Allow, key).is_some() {
            return PendingVerdict::allow(Some(RuleKind::Allow), DEFAULT_MAX_TIME);
        }

        PendingVerdict::deny(None, "Deny ip".into(), DEFAULT_MAX_TIME)
    }

    /// Block-list upkeep: a denied source gains an entry, and a blocked
    /// source whose most recent flow completes allowed is unblocked.
    fn maintain_blocklist(&mut self, key: &SourceKey, request_index: usize, now: f64) {
        let Some(request) = self.history.requests(key).get(request_index) else {
            return;
        };
        let Ok(mut blocklist) = self.blocklist.lock() else {
            return;
        };
        if request.is_denied() {
            let reason = request.deny_reason().unwrap_or("Deny ip").to_string();
            let rule_type = request
                .packets
                .iter()
                .rev()
                .find(|p| p.status() == VerdictStatus::Deny)
                .and_then(|p| p.rule_kind());
            let entry = BlockEntry::for_source(key, rule_type, reason.clone());
            if blocklist.block(entry) {
                self.queue.put(
                    FirewallEvent::Block {
                        timestamp: unix_to_rfc3339(now),
                        ip: key.ip.to_string(),
                        port: key.port,
                        protocol: key.protocol.to_string(),
                        reason,
                    },
                    PRIORITY_BLOCK,
                );
            }
        } else if request.is_allowed() && blocklist.contains(key) && blocklist.unblock(key) {
            self.queue.put(
                FirewallEvent::Unblock {
                    timestamp: unix_to_rfc3339(now),
                    ip: key.ip.to_string(),
                    port: key.port,
                    protocol: key.protocol.to_string(),
                },
                PRIORITY_BLOCK,
            );
        }
    }
}

struct PendingVerdict {
    status: VerdictStatus,
    rule_kind: Option<RuleKind>,
    reason: Option<String>,
    max_time: u64,
}

impl PendingVerdict {
    fn allow(rule_kind: Option<RuleKind>, max_time: u64) -> PendingVerdict {
        PendingVerdict {
            status: VerdictStatus::Allow,
            rule_kind,
            reason: None,
            max_time,
        }
    }

    fn deny(rule_kind: Option<RuleKind>, reason: String, max_time: u64) -> PendingVerdict {
        PendingVerdict {
            status: VerdictStatus::Deny,
            rule_kind,
            reason: Some(reason),
            max_time,
        }
    }
}
