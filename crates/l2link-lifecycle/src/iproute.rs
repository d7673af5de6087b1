//! iproute2-backed [`TunnelControl`]
//!
//! Shells out to `ip l2tp`, `ip link` and `ip addr` and parses their text
//! output. Every call blocks until the child process exits.

use crate::{InterfaceState, LifecycleError, SessionSpec, TunnelControl, TunnelSpec};
use ipnetwork::Ipv4Network;
use regex_lite::Regex;
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How long to wait for the session's interface to appear after creation
const INTERFACE_WAIT_STEPS: u32 = 20;
const INTERFACE_WAIT_STEP: Duration = Duration::from_millis(50);

struct Patterns {
    tunnel_header: Regex,
    tunnel_endpoints: Regex,
    peer_tunnel: Regex,
    session_header: Regex,
    peer_session: Regex,
    interface_name: Regex,
    link_flags: Regex,
    inet: Regex,
}

impl Patterns {
    fn new() -> Result<Self, regex_lite::Error> {
        Ok(Self {
            tunnel_header: Regex::new(r"^Tunnel\s+(\d+),")?,
            tunnel_endpoints: Regex::new(r"From\s+(\S+)\s+to\s+(\S+)")?,
            peer_tunnel: Regex::new(r"Peer tunnel\s+(\d+)")?,
            session_header: Regex::new(r"^Session\s+(\d+)\s+in\s+tunnel\s+(\d+)")?,
            peer_session: Regex::new(r"Peer session\s+(\d+)")?,
            interface_name: Regex::new(r"interface name:\s+(\S+)")?,
            link_flags: Regex::new(r"<([^>]*)>")?,
            inet: Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+/\d+)")?,
        })
    }
}

pub struct IpRouteControl {
    program: String,
    patterns: Patterns,
}

impl IpRouteControl {
    pub fn new() -> Result<Self, LifecycleError> {
        Self::with_program("ip")
    }

    /// Use a specific `ip` binary
    pub fn with_program(program: impl Into<String>) -> Result<Self, LifecycleError> {
        let patterns = Patterns::new().map_err(|e| LifecycleError::Command {
            command: "ip".to_string(),
            detail: format!("invalid output pattern: {}", e),
        })?;
        Ok(Self {
            program: program.into(),
            patterns,
        })
    }

    fn output(&self, args: &[String]) -> Result<Output, LifecycleError> {
        debug!("Running {} {}", self.program, args.join(" "));
        Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|e| LifecycleError::Command {
                command: self.describe(args),
                detail: e.to_string(),
            })
    }

    /// Run a command that must succeed, returning its stdout
    fn run(&self, args: &[String]) -> Result<String, LifecycleError> {
        let output = self.output(args)?;
        if !output.status.success() {
            return Err(LifecycleError::Command {
                command: self.describe(args),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn describe(&self, args: &[String]) -> String {
        format!("{} {}", self.program, args.join(" "))
    }

    fn parse_tunnels(&self, output: &str) -> Vec<TunnelSpec> {
        split_blocks(output, "Tunnel")
            .into_iter()
            .filter_map(|block| {
                let p = &self.patterns;
                let tunnel_id = capture_u32(&p.tunnel_header, &block)?;
                let peer_tunnel_id = capture_u32(&p.peer_tunnel, &block)?;
                let endpoints = p.tunnel_endpoints.captures(&block)?;
                Some(TunnelSpec {
                    tunnel_id,
                    peer_tunnel_id,
                    local: endpoints[1].parse().ok()?,
                    remote: endpoints[2].parse().ok()?,
                })
            })
            .collect()
    }

    fn parse_sessions(&self, output: &str) -> Vec<SessionSpec> {
        split_blocks(output, "Session")
            .into_iter()
            .filter_map(|block| {
                let p = &self.patterns;
                let header = p.session_header.captures(&block)?;
                Some(SessionSpec {
                    session_id: header[1].parse().ok()?,
                    tunnel_id: header[2].parse().ok()?,
                    peer_session_id: capture_u32(&p.peer_session, &block)?,
                    interface: p
                        .interface_name
                        .captures(&block)
                        .map(|c| c[1].to_string())
                        .unwrap_or_default(),
                })
            })
            .collect()
    }

    fn parse_link_up(&self, output: &str) -> bool {
        self.patterns
            .link_flags
            .captures(output)
            .map(|c| c[1].split(',').any(|flag| flag == "UP"))
            .unwrap_or(false)
    }

    fn parse_addresses(&self, output: &str) -> Vec<Ipv4Network> {
        self.patterns
            .inet
            .captures_iter(output)
            .filter_map(|c| c[1].parse().ok())
            .collect()
    }
}

impl TunnelControl for IpRouteControl {
    fn query_tunnel(&self, tunnel_id: u32) -> Result<Option<TunnelSpec>, LifecycleError> {
        let output = self.run(&args(&["l2tp", "show", "tunnel"]))?;
        Ok(self
            .parse_tunnels(&output)
            .into_iter()
            .find(|t| t.tunnel_id == tunnel_id))
    }

    fn create_tunnel(&self, spec: &TunnelSpec) -> Result<(), LifecycleError> {
        self.run(&[
            "l2tp".into(),
            "add".into(),
            "tunnel".into(),
            "tunnel_id".into(),
            spec.tunnel_id.to_string(),
            "peer_tunnel_id".into(),
            spec.peer_tunnel_id.to_string(),
            "encap".into(),
            "ip".into(),
            "local".into(),
            spec.local.to_string(),
            "remote".into(),
            spec.remote.to_string(),
        ])?;
        Ok(())
    }

    fn delete_tunnel(&self, tunnel_id: u32) -> Result<(), LifecycleError> {
        self.run(&[
            "l2tp".into(),
            "del".into(),
            "tunnel".into(),
            "tunnel_id".into(),
            tunnel_id.to_string(),
        ])?;
        Ok(())
    }

    fn query_session(
        &self,
        tunnel_id: u32,
        session_id: u32,
    ) -> Result<Option<SessionSpec>, LifecycleError> {
        let output = self.run(&args(&["l2tp", "show", "session"]))?;
        Ok(self
            .parse_sessions(&output)
            .into_iter()
            .find(|s| s.tunnel_id == tunnel_id && s.session_id == session_id))
    }

    fn create_session(&self, spec: &SessionSpec) -> Result<(), LifecycleError> {
        self.run(&[
            "l2tp".into(),
            "add".into(),
            "session".into(),
            "name".into(),
            spec.interface.clone(),
            "tunnel_id".into(),
            spec.tunnel_id.to_string(),
            "session_id".into(),
            spec.session_id.to_string(),
            "peer_session_id".into(),
            spec.peer_session_id.to_string(),
        ])?;

        // The interface shows up asynchronously after the session is created
        for _ in 0..INTERFACE_WAIT_STEPS {
            if self.query_interface(&spec.interface)?.is_some() {
                return Ok(());
            }
            thread::sleep(INTERFACE_WAIT_STEP);
        }
        Err(LifecycleError::Command {
            command: "ip link show".to_string(),
            detail: format!("interface {} did not appear", spec.interface),
        })
    }

    fn delete_session(&self, tunnel_id: u32, session_id: u32) -> Result<(), LifecycleError> {
        self.run(&[
            "l2tp".into(),
            "del".into(),
            "session".into(),
            "tunnel_id".into(),
            tunnel_id.to_string(),
            "session_id".into(),
            session_id.to_string(),
        ])?;
        Ok(())
    }

    fn query_interface(&self, name: &str) -> Result<Option<InterfaceState>, LifecycleError> {
        let link_args = args(&["-o", "link", "show", "dev", name]);
        let link = self.output(&link_args)?;
        if !link.status.success() {
            let stderr = String::from_utf8_lossy(&link.stderr);
            if stderr.contains("does not exist") {
                return Ok(None);
            }
            return Err(LifecycleError::Command {
                command: self.describe(&link_args),
                detail: stderr.trim().to_string(),
            });
        }

        let addresses = self.run(&args(&["-o", "-4", "addr", "show", "dev", name]))?;
        Ok(Some(InterfaceState {
            up: self.parse_link_up(&String::from_utf8_lossy(&link.stdout)),
            addresses: self.parse_addresses(&addresses),
        }))
    }

    fn set_link(&self, name: &str, up: bool) -> Result<(), LifecycleError> {
        let state = if up { "up" } else { "down" };
        self.run(&args(&["link", "set", "dev", name, state]))?;
        Ok(())
    }

    fn add_address(&self, name: &str, address: Ipv4Network) -> Result<(), LifecycleError> {
        self.run(&args(&["addr", "add", &address.to_string(), "dev", name]))?;
        Ok(())
    }

    fn flush_addresses(&self, name: &str) -> Result<(), LifecycleError> {
        self.run(&args(&["addr", "flush", "dev", name]))?;
        Ok(())
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn capture_u32(pattern: &Regex, text: &str) -> Option<u32> {
    pattern.captures(text)?[1].parse().ok()
}

/// Split `ip l2tp show` output into one block per object
fn split_blocks(output: &str, header: &str) -> Vec<String> {
    let mut blocks: Vec<String> = Vec::new();
    for line in output.lines() {
        if line.starts_with(header) {
            blocks.push(String::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.push_str(line.trim());
            block.push('\n');
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNNELS: &str = "\
Tunnel 1000, encap IP
  From 203.0.113.10 to 198.51.100.20
  Peer tunnel 2000
  UDP source / dest ports: 0/0
Tunnel 1001, encap IP
  From 203.0.113.10 to 192.0.2.7
  Peer tunnel 2001
";

    const SESSIONS: &str = "\
Session 10 in tunnel 1000
  Peer session 20, tunnel 2000
  interface name: l2tpeth0
  offset 0, peer offset 0
Session 11 in tunnel 1001
  Peer session 21, tunnel 2001
  interface name: l2tpeth1
";

    fn control() -> IpRouteControl {
        IpRouteControl::new().unwrap()
    }

    #[test]
    fn test_parse_tunnels() {
        let tunnels = control().parse_tunnels(TUNNELS);
        assert_eq!(tunnels.len(), 2);
        assert_eq!(
            tunnels[0],
            TunnelSpec {
                tunnel_id: 1000,
                peer_tunnel_id: 2000,
                local: "203.0.113.10".parse().unwrap(),
                remote: "198.51.100.20".parse().unwrap(),
            }
        );
        assert_eq!(tunnels[1].remote.to_string(), "192.0.2.7");
    }

    #[test]
    fn test_parse_sessions() {
        let sessions = control().parse_sessions(SESSIONS);
        assert_eq!(sessions.len(), 2);
        assert_eq!(
            sessions[1],
            SessionSpec {
                tunnel_id: 1001,
                session_id: 11,
                peer_session_id: 21,
                interface: "l2tpeth1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(control().parse_tunnels("").is_empty());
        assert!(control().parse_sessions("\n").is_empty());
    }

    #[test]
    fn test_parse_link_flags() {
        let control = control();
        assert!(control.parse_link_up(
            "7: l2tpeth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1446 qdisc fq_codel state UNKNOWN"
        ));
        assert!(!control.parse_link_up(
            "7: l2tpeth0: <BROADCAST,MULTICAST> mtu 1446 qdisc noop state DOWN"
        ));
    }

    #[test]
    fn test_parse_addresses() {
        let output = "7: l2tpeth0    inet 10.30.0.1/30 scope global l2tpeth0\\       valid_lft forever preferred_lft forever\n";
        let addresses = control().parse_addresses(output);
        assert_eq!(addresses, vec!["10.30.0.1/30".parse::<Ipv4Network>().unwrap()]);
    }
}
