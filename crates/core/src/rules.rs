#![forbid(unsafe_code)]

use crate::packet::SourceKey;
use packet_parser::IpProtocol;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    Allow,
    Deny,
    DetectDos,
    DetectDdos,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Allow => "allow",
            RuleKind::Deny => "deny",
            RuleKind::DetectDos => "detect-dos",
            RuleKind::DetectDdos => "detect-ddos",
        }
    }
}

/// A rule specification that failed validation, naming the first violated
/// constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRuleConfig(pub String);

impl std::fmt::Display for InvalidRuleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for InvalidRuleConfig {}

/// On-disk shape of one rule record. Fields stay raw JSON values so a
/// malformed record is representable and validation can name the bad value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSpec {
    #[serde(rename = "type")]
    pub rule_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<DetectionSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionSpec {
    pub time_window: Option<Value>,
    pub packet_threshold: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTarget {
    pub ip: Option<Ipv4Addr>,
    pub port: Option<u16>,
    pub protocol: Option<IpProtocol>,
}

impl RuleTarget {
    pub fn matches(&self, key: &SourceKey) -> bool {
        if let Some(ip) = self.ip {
            if ip != key.ip {
                return false;
            }
        }
        if let Some(port) = self.port {
            if port != key.port {
                return false;
            }
        }
        if let Some(protocol) = self.protocol {
            if protocol != key.protocol {
                return false;
            }
        }
        true
    }

    /// Match specificity: exact (ip and port) beats ip-only beats
    /// port-with-protocol.
    pub fn specificity(&self) -> u8 {
        match (self.ip, self.port) {
            (Some(_), Some(_)) => 3,
            (Some(_), None) => 2,
            (None, Some(_)) => 1,
            (None, None) => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionRule {
    pub target: RuleTarget,
    pub time_window: u64,
    pub packet_threshold: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Allow(RuleTarget),
    Deny(RuleTarget),
    DetectDos(DetectionRule),
    DetectDdos(DetectionRule),
}

impl Rule {
    /// Builds a rule from its on-disk record, validating each field and
    /// failing with the first violated constraint.
    pub fn create(spec: &RuleSpec) -> Result<Rule, InvalidRuleConfig> {
        let kind = parse_rule_type(spec.rule_type.as_ref())?;
        let ip = parse_ip(spec.ip.as_ref())?;
        let protocol = parse_protocol(spec.protocol.as_ref())?;
        match kind {
            RuleKind::Allow | RuleKind::Deny => {
                let port = parse_optional_port(spec.port.as_ref())?;
                if ip.is_none() && port.is_none() {
                    return Err(InvalidRuleConfig(
                        "Ip and or Port have to be provided".into(),
                    ));
                }
                let target = RuleTarget { ip, port, protocol };
                Ok(match kind {
                    RuleKind::Allow => Rule::Allow(target),
                    _ => Rule::Deny(target),
                })
            }
            RuleKind::DetectDos | RuleKind::DetectDdos => {
                let port = parse_required_port(spec.port.as_ref())?;
                let config = spec.configuration.clone().unwrap_or_default();
                let time_window = parse_positive(config.time_window.as_ref(), "Time Window")?;
                let packet_threshold =
                    parse_positive(config.packet_threshold.as_ref(), "Packet Threshold")?;
                let detection = DetectionRule {
                    target: RuleTarget {
                        ip,
                        port: Some(port),
                        protocol,
                    },
                    time_window,
                    packet_threshold,
                };
                Ok(match kind {
                    RuleKind::DetectDos => Rule::DetectDos(detection),
                    _ => Rule::DetectDdos(detection),
                })
            }
        }
    }

    pub fn kind(&self) -> RuleKind {
        match self {
            Rule::Allow(_) => RuleKind::Allow,
            Rule::Deny(_) => RuleKind::Deny,
            Rule::DetectDos(_) => RuleKind::DetectDos,
            Rule::DetectDdos(_) => RuleKind::DetectDdos,
        }
    }

    pub fn target(&self) -> &RuleTarget {
        match self {
            Rule::Allow(target) | Rule::Deny(target) => target,
            Rule::DetectDos(detection) | Rule::DetectDdos(detection) => &detection.target,
        }
    }

    pub fn matches(&self, key: &SourceKey) -> bool {
        self.target().matches(key)
    }
}

/// Picks the most specific matching rule of the given kind; earlier rules
/// win ties.
pub(crate) fn best_match<'a>(
    rules: &'a [Rule],
    kind: RuleKind,
    key: &SourceKey,
) -> Option<&'a Rule> {
    rules
        .iter()
        .filter(|rule| rule.kind() == kind && rule.matches(key))
        .fold(None, |best: Option<&Rule>, rule| match best {
            Some(current) if current.target().specificity() >= rule.target().specificity() => {
                Some(current)
            }
            _ => Some(rule),
        })
}

fn display(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "null".into(),
    }
}

fn parse_rule_type(value: Option<&Value>) -> Result<RuleKind, InvalidRuleConfig> {
    match value.and_then(Value::as_str) {
        Some("allow") => Ok(RuleKind::Allow),
        Some("deny") => Ok(RuleKind::Deny),
        Some("detect-dos") => Ok(RuleKind::DetectDos),
        Some("detect-ddos") => Ok(RuleKind::DetectDdos),
        _ => Err(InvalidRuleConfig(format!(
            "Invalid Rule Type: {}",
            display(value)
        ))),
    }
}

fn parse_ip(value: Option<&Value>) -> Result<Option<Ipv4Addr>, InvalidRuleConfig> {
    let Some(value) = value else {
        return Ok(None);
    };
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .map(Some)
        .ok_or_else(|| InvalidRuleConfig(format!("Invalid Ip: {}", display(Some(value)))))
}

fn parse_port_value(value: &Value) -> Option<u16> {
    let number = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if number == 0 || number > u64::from(u16::MAX) {
        return None;
    }
    Some(number as u16)
}

fn parse_optional_port(value: Option<&Value>) -> Result<Option<u16>, InvalidRuleConfig> {
    let Some(value) = value else {
        return Ok(None);
    };
    parse_port_value(value)
        .map(Some)
        .ok_or_else(|| InvalidRuleConfig(format!("Invalid Port: {}", display(Some(value)))))
}

fn parse_required_port(value: Option<&Value>) -> Result<u16, InvalidRuleConfig> {
    value
        .and_then(parse_port_value)
        .ok_or_else(|| InvalidRuleConfig(format!("Invalid Port: {}", display(value))))
}

fn parse_protocol(value: Option<&Value>) -> Result<Option<IpProtocol>, InvalidRuleConfig> {
    let Some(value) = value else {
        return Ok(None);
    };
    match value.as_str() {
        Some("tcp") => Ok(Some(IpProtocol::Tcp)),
        _ => Err(InvalidRuleConfig(format!(
            "Invalid Protocol: {}",
            display(Some(value))
        ))),
    }
}

fn parse_positive(value: Option<&Value>, field: &str) -> Result<u64, InvalidRuleConfig> {
    value
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .ok_or_else(|| InvalidRuleConfig(format!("Invalid {}: {}", field, display(value))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(json: &str) -> RuleSpec {
        serde_json::from_str(json).expect("rule spec")
    }

    #[test]
    fn builds_allow_rule_with_ip_and_port() {
        let rule = Rule::create(&spec(
            r#"{"type": "allow", "ip": "192.168.1.10", "port": 8091, "protocol": "tcp"}"#,
        ))
        .expect("valid rule");
        assert_eq!(rule.kind(), RuleKind::Allow);
        assert_eq!(rule.target().port, Some(8091));
        assert_eq!(rule.target().specificity(), 3);
    }

    #[test]
    fn allow_rule_requires_ip_or_port() {
        let err = Rule::create(&spec(r#"{"type": "deny", "protocol": "tcp"}"#)).unwrap_err();
        assert_eq!(err.0, "Ip and or Port have to be provided");
    }

    #[test]
    fn reports_invalid_fields() {
        let err = Rule::create(&spec(r#"{"type": "permit", "port": 1}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Rule Type: permit");

        let err = Rule::create(&spec(r#"{"type": "allow", "ip": "999.0.0.1"}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Ip: 999.0.0.1");

        let err = Rule::create(&spec(r#"{"type": "allow", "port": 0}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Port: 0");

        let err = Rule::create(&spec(r#"{"type": "allow", "port": 70000}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Port: 70000");

        let err = Rule::create(&spec(r#"{"type": "allow", "port": "http"}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Port: http");

        let err =
            Rule::create(&spec(r#"{"type": "allow", "port": 80, "protocol": "udp"}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Protocol: udp");
    }

    #[test]
    fn detection_rule_validates_window_and_threshold() {
        let rule = Rule::create(&spec(
            r#"{"type": "detect-dos", "port": 8091, "protocol": "tcp",
               "configuration": {"time_window": 30, "packet_threshold": 4}}"#,
        ))
        .expect("valid detection rule");
        match rule {
            Rule::DetectDos(detection) => {
                assert_eq!(detection.time_window, 30);
                assert_eq!(detection.packet_threshold, 4);
            }
            other => panic!("unexpected rule {other:?}"),
        }

        let err = Rule::create(&spec(
            r#"{"type": "detect-ddos", "port": 8091,
               "configuration": {"time_window": 0, "packet_threshold": 4}}"#,
        ))
        .unwrap_err();
        assert_eq!(err.0, "Invalid Time Window: 0");

        let err = Rule::create(&spec(
            r#"{"type": "detect-ddos", "port": 8091,
               "configuration": {"time_window": 30, "packet_threshold": "many"}}"#,
        ))
        .unwrap_err();
        assert_eq!(err.0, "Invalid Packet Threshold: many");

        let err = Rule::create(&spec(r#"{"type": "detect-dos"}"#)).unwrap_err();
        assert_eq!(err.0, "Invalid Port: null");
    }

    #[test]
    fn specificity_orders_candidates() {
        let key = SourceKey {
            ip: "10.0.0.5".parse().expect("ip"),
            port: 8091,
            protocol: IpProtocol::Tcp,
        };
        let rules = vec![
            Rule::create(&spec(r#"{"type": "allow", "port": 8091, "protocol": "tcp"}"#))
                .expect("rule"),
            Rule::create(&spec(r#"{"type": "allow", "ip": "10.0.0.5"}"#)).expect("rule"),
            Rule::create(&spec(r#"{"type": "allow", "ip": "10.0.0.5", "port": 8091}"#))
                .expect("rule"),
        ];
        let best = best_match(&rules, RuleKind::Allow, &key).expect("match");
        assert_eq!(best.target().specificity(), 3);

        let other_key = SourceKey {
            ip: "10.0.0.6".parse().expect("ip"),
            port: 8091,
            protocol: IpProtocol::Tcp,
        };
        let best = best_match(&rules, RuleKind::Allow, &other_key).expect("match");
        assert_eq!(best.target().specificity(), 1);
    }
}
