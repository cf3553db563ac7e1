#![forbid(unsafe_code)]

use packet_parser::IpProtocol;
use palisade_core::{FilterError, KernelFilter};
use std::net::Ipv4Addr;
use std::process::Command;

/// Drives the kernel packet filter through the iptables binary. Every rule
/// lands in the INPUT chain; detection rules are installed as NFQUEUE
/// targets so their traffic reaches the userspace engine.
pub struct IptablesFilter {
    binary: String,
}

impl IptablesFilter {
    pub fn new() -> IptablesFilter {
        IptablesFilter {
            binary: "iptables".to_string(),
        }
    }

    fn run(&self, args: &[String]) -> Result<(), FilterError> {
        let output = Command::new(&self.binary).args(args).output()?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(FilterError::Command(format!(
                "{} {} failed: {}",
                self.binary,
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    fn check(&self, args: &[String]) -> Result<bool, FilterError> {
        let status = Command::new(&self.binary).args(args).status()?;
        Ok(status.success())
    }

    fn match_args(
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ip) = ip {
            args.push("-s".to_string());
            args.push(ip.to_string());
        }
        // --dport is only valid with an explicit protocol match
        let proto = protocol.or(if port.is_some() {
            Some(IpProtocol::Tcp)
        } else {
            None
        });
        if let Some(proto) = proto {
            args.push("-p".to_string());
            args.push(proto_arg(proto));
        }
        if let Some(port) = port {
            args.push("--dport".to_string());
            args.push(port.to_string());
        }
        args
    }
}

impl Default for IptablesFilter {
    fn default() -> Self {
        IptablesFilter::new()
    }
}

fn proto_arg(proto: IpProtocol) -> String {
    match proto {
        IpProtocol::Tcp => "tcp".to_string(),
        IpProtocol::Udp => "udp".to_string(),
        IpProtocol::Icmp => "icmp".to_string(),
        IpProtocol::Other(value) => value.to_string(),
    }
}

impl KernelFilter for IptablesFilter {
    fn rule_exists(
        &self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<bool, FilterError> {
        let mut args = vec!["-C".to_string(), "INPUT".to_string()];
        args.extend(Self::match_args(ip, port, protocol));
        args.push("-j".to_string());
        args.push("ACCEPT".to_string());
        if self.check(&args)? {
            return Ok(true);
        }
        // the rule may have been installed as a queue or drop target
        let len = args.len();
        args[len - 1] = "NFQUEUE".to_string();
        if self.check(&args)? {
            return Ok(true);
        }
        args[len - 1] = "DROP".to_string();
        self.check(&args)
    }

    fn create_allow_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
        queue_num: Option<u16>,
    ) -> Result<(), FilterError> {
        let mut args = vec!["-A".to_string(), "INPUT".to_string()];
        args.extend(Self::match_args(ip, port, protocol));
        match queue_num {
            Some(queue) => {
                args.push("-j".to_string());
                args.push("NFQUEUE".to_string());
                args.push("--queue-num".to_string());
                args.push(queue.to_string());
            }
            None => {
                args.push("-j".to_string());
                args.push("ACCEPT".to_string());
            }
        }
        self.run(&args)
    }

    fn create_deny_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<(), FilterError> {
        let mut args = vec!["-A".to_string(), "INPUT".to_string()];
        args.extend(Self::match_args(ip, port, protocol));
        args.push("-j".to_string());
        args.push("DROP".to_string());
        self.run(&args)
    }

    fn create_allow_loopback_rule(&mut self) -> Result<(), FilterError> {
        let check: Vec<String> = ["-C", "INPUT", "-i", "lo", "-j", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if self.check(&check)? {
            return Ok(());
        }
        let args: Vec<String> = ["-I", "INPUT", "1", "-i", "lo", "-j", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.run(&args)
    }

    fn create_deny_policy(&mut self) -> Result<(), FilterError> {
        let args: Vec<String> = ["-P", "INPUT", "DROP"].iter().map(|s| s.to_string()).collect();
        self.run(&args)
    }

    fn create_allow_policy(&mut self) -> Result<(), FilterError> {
        let args: Vec<String> = ["-P", "INPUT", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        self.run(&args)
    }

    fn remove_rule(
        &mut self,
        ip: Option<Ipv4Addr>,
        port: Option<u16>,
        protocol: Option<IpProtocol>,
    ) -> Result<(), FilterError> {
        for target in ["ACCEPT", "NFQUEUE", "DROP"] {
            let mut args = vec!["-C".to_string(), "INPUT".to_string()];
            args.extend(Self::match_args(ip, port, protocol));
            args.push("-j".to_string());
            args.push(target.to_string());
            if self.check(&args)? {
                args[0] = "-D".to_string();
                return self.run(&args);
            }
        }
        Ok(())
    }

    fn flush_input_chain(&mut self) -> Result<(), FilterError> {
        let args: Vec<String> = ["-F", "INPUT"].iter().map(|s| s.to_string()).collect();
        self.run(&args)
    }
}
