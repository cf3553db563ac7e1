#![forbid(unsafe_code)]

use crate::rules::Rule;
use packet_parser::IpProtocol;
use std::net::Ipv4Addr;

#[derive(Debug)]
pub enum FilterError {
    Io(std::io::Error),
    Command(String),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Io(e) => write!(f, "io: {e}"),
            FilterError::Command(msg) => write!(f, "command: {msg}"),
        }
    }
}

impl std::error::Error for FilterError {}

impl From<std::io::Error> for FilterError {
    fn from(e: std::io::Error) -> Self {
        FilterError::Io(e)
    }
}

/// Idempotent contract of the OS packet-filter tool. `queue_num` on an
/// allow rule routes matching traffic into the capture subsystem for
/// per-packet inspection instead of the kernel fast path.
pub trait KernelFilter {
    fn rule_exists(
        &self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<bool, FilterError>;

    fn create_allow_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
        queue_num: Option<u16>,
    ) -> Result<(), FilterError>;

    fn create_deny_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<(), FilterError>;

    fn create_allow_loopback_rule(&mut self) -> Result<(), FilterError>;

    fn create_deny_policy(&mut self) -> Result<(), FilterError>;

    fn create_allow_policy(&mut self) -> Result<(), FilterError>;

    fn remove_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<(), FilterError>;

    fn flush_input_chain(&mut self) -> Result<(), FilterError>;
}

/// Installs the static view of a rule set: plain allow rules go to the
/// kernel fast path, detection rules route their traffic into the capture
/// queue, deny rules drop outright, and the default policy is deny.
pub fn apply_static_rules(
    filter: &mut dyn KernelFilter,
    rules: &[Rule],
    queue_num: u16,
) -> Result<(), FilterError> {
    filter.create_allow_loopback_rule()?;
    for rule in rules {
        let target = rule.target();
        if filter.rule_exists(target.ip, target.port, target.protocol)? {
            continue;
        }
        match rule {
            Rule::Allow(_) => {
                filter.create_allow_rule(target.ip, target.port, target.protocol, None)?;
            }
            Rule::DetectDos(_) | Rule::DetectDdos(_) => {
                filter.create_allow_rule(
                    target.ip,
                    target.port,
                    target.protocol,
                    Some(queue_num),
                )?;
            }
            Rule::Deny(_) => {
                filter.create_deny_rule(target.ip, target.port, target.protocol)?;
            }
        }
    }
    filter.create_deny_policy()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::rules::RuleSpec;

    /// Records every operation instead of touching the OS.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingFilter {
        pub operations: Vec<String>,
    }

    fn describe(ip: Option<Ipv4Addr>, port: Option<u16>, protocol: Option<IpProtocol>) -> String {
        format!(
            "{}:{}:{}",
            ip.map(|i| i.to_string()).unwrap_or_else(|| "*".into()),
            port.map(|p| p.to_string()).unwrap_or_else(|| "*".into()),
            protocol
                .map(|p| p.to_string())
                .unwrap_or_else(|| "*".into()),
        )
    }

    impl KernelFilter for RecordingFilter {
        fn rule_exists(
            &self,
            ip: Option<Ipv4Addr>,
            port: Option<u16>,
            protocol: Option<IpProtocol>,
        ) -> Result<bool, FilterError> {
            let needle = describe(ip, port, protocol);
            Ok(self
                .operations
                .iter()
                .any(|op| op.ends_with(&needle) && !op.starts_with("remove")))
        }

        fn create_allow_rule(
            &mut self,
            ip: Option<Ipv4Addr>,
            port: Option<u16>,
            protocol: Option<IpProtocol>,
            queue_num: Option<u16>,
        ) -> Result<(), FilterError> {
            let suffix = describe(ip, port, protocol);
            match queue_num {
                Some(q) => self.operations.push(format!("allow[q={q}] {suffix}")),
                None => self.operations.push(format!("allow {suffix}")),
            }
            Ok(())
        }

        fn create_deny_rule(
            &mut self,
            ip: Option<Ipv4Addr>,
            port: Option<u16>,
            protocol: Option<IpProtocol>,
        ) -> Result<(), FilterError> {
            self.operations
                .push(format!("deny {}", describe(ip, port, protocol)));
            Ok(())
        }

        fn create_allow_loopback_rule(&mut self) -> Result<(), FilterError> {
            self.operations.push("allow-loopback".into());
            Ok(())
        }

        fn create_deny_policy(&mut self) -> Result<(), FilterError> {
            self.operations.push("policy deny".into());
            Ok(())
        }

        fn create_allow_policy(&mut self) -> Result<(), FilterError> {
            self.operations.push("policy allow".into());
            Ok(())
        }

        fn remove_rule(
            &mut self,
            ip: Option<Ipv4Addr>,
            port: Option<u16>,
            protocol: Option<IpProtocol>,
        ) -> Result<(), FilterError> {
            self.operations
                .push(format!("remove {}", describe(ip, port, protocol)));
            Ok(())
        }

        fn flush_input_chain(&mut self) -> Result<(), FilterError> {
            self.operations.push("flush".into());
            Ok(())
        }
    }

    fn rule(json: &str) -> Rule {
        let spec: RuleSpec = serde_json::from_str(json).expect("spec");
        Rule::create(&spec).expect("rule")
    }

    #[test]
    fn static_rules_route_detection_traffic_to_the_queue() {
        let rules = vec![
            rule(r#"{"type": "allow", "ip": "10.0.0.2", "protocol": "tcp"}"#),
            rule(r#"{"type": "deny", "ip": "10.0.0.9"}"#),
            rule(
                r#"{"type": "detect-dos", "port": 8091, "protocol": "tcp",
                   "configuration": {"time_window": 30, "packet_threshold": 4}}"#,
            ),
        ];
        let mut filter = RecordingFilter::default();
        apply_static_rules(&mut filter, &rules, 1).expect("apply");
        assert_eq!(
            filter.operations,
            vec![
                "allow-loopback".to_string(),
                "allow 10.0.0.2:*:tcp".to_string(),
                "deny 10.0.0.9:*:*".to_string(),
                "allow[q=1] *:8091:tcp".to_string(),
                "policy deny".to_string(),
            ]
        );
    }

    #[test]
    fn existing_rules_are_not_reinstalled() {
        let rules = vec![rule(r#"{"type": "allow", "ip": "10.0.0.2", "protocol": "tcp"}"#)];
        let mut filter = RecordingFilter::default();
        apply_static_rules(&mut filter, &rules, 1).expect("apply");
        apply_static_rules(&mut filter, &rules, 1).expect("apply again");
        let installs = filter
            .operations
            .iter()
            .filter(|op| op.starts_with("allow 10.0.0.2"))
            .count();
        assert_eq!(installs, 1);
    }
}
