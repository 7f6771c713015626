//! Resource driver: the boundary to kernel networking objects
//!
//! Everything that mutates or inspects kernel state goes through the
//! `ResourceDriver` trait, so the lifecycle engine can be tested against a
//! scripted double. The default implementation shells out to `ip(8)`,
//! `iptables(8)` and `sysctl(8)` with structured argument vectors. Names
//! and addresses are never passed through a shell, which closes the
//! injection hole a string-interpolated invocation would open.

use crate::error::{Error, Result};
use crate::firewall::{Chain, Policy, RuleAction};
use ipnet::Ipv4Net;
use std::io::Read;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of a command run inside a namespace
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Operations on kernel networking objects
pub trait ResourceDriver {
    fn bridge_exists(&self, name: &str) -> Result<bool>;
    fn bridge_create(&self, name: &str) -> Result<()>;
    fn bridge_delete(&self, name: &str) -> Result<()>;

    fn link_up(&self, name: &str) -> Result<()>;
    fn link_down(&self, name: &str) -> Result<()>;
    fn link_delete(&self, name: &str) -> Result<()>;
    fn set_master(&self, iface: &str, bridge: &str) -> Result<()>;

    fn netns_exists(&self, name: &str) -> Result<bool>;
    fn netns_add(&self, name: &str) -> Result<()>;
    fn netns_delete(&self, name: &str) -> Result<()>;

    fn veth_add(&self, host: &str, peer: &str) -> Result<()>;
    fn move_to_netns(&self, iface: &str, ns: &str) -> Result<()>;

    fn netns_link_up(&self, ns: &str, iface: &str) -> Result<()>;
    fn assign_address(&self, ns: &str, iface: &str, cidr: Ipv4Net) -> Result<()>;
    fn add_default_route(&self, ns: &str, gateway: Ipv4Addr) -> Result<()>;

    fn set_sysctl(&self, key: &str, value: &str) -> Result<()>;

    fn nat_masquerade(&self, source: Ipv4Net, out_iface: &str) -> Result<()>;
    fn forward_accept(&self, in_iface: &str, out_iface: &str, established_only: bool)
    -> Result<()>;

    fn netns_flush_rules(&self, ns: &str) -> Result<()>;
    fn netns_set_policy(&self, ns: &str, chain: Chain, policy: Policy) -> Result<()>;
    fn netns_allow_established(&self, ns: &str) -> Result<()>;
    fn netns_allow_loopback(&self, ns: &str) -> Result<()>;
    fn netns_ingress_rule(&self, ns: &str, protocol: &str, port: u16, action: RuleAction)
    -> Result<()>;

    /// Run a shell command line inside a namespace, capturing output.
    /// The command string is handed to `sh -c` deliberately; the namespace
    /// name itself is passed as a plain argument.
    fn exec_in_netns(&self, ns: &str, command: &str) -> Result<ExecOutput>;
}

/// Default driver: spawns `ip`/`iptables`/`sysctl` with a deadline per call
#[derive(Debug)]
pub struct IpCommandDriver {
    timeout: Duration,
}

impl IpCommandDriver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run a command with timeout enforcement, capturing output
    fn run(&self, program: &str, args: &[&str]) -> Result<ExecOutput> {
        let rendered = format!("{} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::CommandFailed {
                command: rendered.clone(),
                message: e.to_string(),
            })?;

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let mut stdout = String::new();
                    let mut stderr = String::new();

                    if let Some(mut handle) = child.stdout.take() {
                        let _ = handle.read_to_string(&mut stdout);
                    }
                    if let Some(mut handle) = child.stderr.take() {
                        let _ = handle.read_to_string(&mut stderr);
                    }

                    return Ok(ExecOutput {
                        stdout,
                        stderr,
                        code: status.code().unwrap_or(1),
                    });
                }
                Ok(None) => {
                    if start.elapsed() > self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Timeout {
                            command: rendered,
                            seconds: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::CommandFailed {
                        command: rendered,
                        message: format!("Failed to wait on process: {}", e),
                    });
                }
            }
        }
    }

    /// Run a command, failing on non-zero exit with the stderr text
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = self.run(program, args)?;
        if !output.success() {
            return Err(Error::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Extract namespace names from `ip netns list` output.
/// Lines look like `ns-test-web (id: 0)`.
fn parse_netns_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(String::from)
        .collect()
}

impl ResourceDriver for IpCommandDriver {
    fn bridge_exists(&self, name: &str) -> Result<bool> {
        Ok(self.run("ip", &["link", "show", name])?.success())
    }

    fn bridge_create(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["link", "add", name, "type", "bridge"])
    }

    fn bridge_delete(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["link", "delete", name, "type", "bridge"])
    }

    fn link_up(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["link", "set", name, "up"])
    }

    fn link_down(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["link", "set", name, "down"])
    }

    fn link_delete(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["link", "delete", name])
    }

    fn set_master(&self, iface: &str, bridge: &str) -> Result<()> {
        self.run_checked("ip", &["link", "set", iface, "master", bridge])
    }

    fn netns_exists(&self, name: &str) -> Result<bool> {
        let output = self.run("ip", &["netns", "list"])?;
        Ok(parse_netns_list(&output.stdout).iter().any(|n| n == name))
    }

    fn netns_add(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["netns", "add", name])
    }

    fn netns_delete(&self, name: &str) -> Result<()> {
        self.run_checked("ip", &["netns", "delete", name])
    }

    fn veth_add(&self, host: &str, peer: &str) -> Result<()> {
        self.run_checked(
            "ip",
            &["link", "add", host, "type", "veth", "peer", "name", peer],
        )
    }

    fn move_to_netns(&self, iface: &str, ns: &str) -> Result<()> {
        self.run_checked("ip", &["link", "set", iface, "netns", ns])
    }

    fn netns_link_up(&self, ns: &str, iface: &str) -> Result<()> {
        self.run_checked("ip", &["netns", "exec", ns, "ip", "link", "set", iface, "up"])
    }

    fn assign_address(&self, ns: &str, iface: &str, cidr: Ipv4Net) -> Result<()> {
        let cidr = cidr.to_string();
        self.run_checked(
            "ip",
            &["netns", "exec", ns, "ip", "addr", "add", &cidr, "dev", iface],
        )
    }

    fn add_default_route(&self, ns: &str, gateway: Ipv4Addr) -> Result<()> {
        let gateway = gateway.to_string();
        self.run_checked(
            "ip",
            &[
                "netns", "exec", ns, "ip", "route", "add", "default", "via", &gateway,
            ],
        )
    }

    fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", key, value);
        self.run_checked("sysctl", &["-w", &assignment])
    }

    fn nat_masquerade(&self, source: Ipv4Net, out_iface: &str) -> Result<()> {
        let source = source.to_string();
        self.run_checked(
            "iptables",
            &[
                "-t",
                "nat",
                "-A",
                "POSTROUTING",
                "-s",
                &source,
                "-o",
                out_iface,
                "-j",
                "MASQUERADE",
            ],
        )
    }

    fn forward_accept(
        &self,
        in_iface: &str,
        out_iface: &str,
        established_only: bool,
    ) -> Result<()> {
        let mut args = vec!["-A", "FORWARD", "-i", in_iface, "-o", out_iface];
        if established_only {
            args.extend(["-m", "state", "--state", "RELATED,ESTABLISHED"]);
        }
        args.extend(["-j", "ACCEPT"]);
        self.run_checked("iptables", &args)
    }

    fn netns_flush_rules(&self, ns: &str) -> Result<()> {
        self.run_checked("ip", &["netns", "exec", ns, "iptables", "-F"])
    }

    fn netns_set_policy(&self, ns: &str, chain: Chain, policy: Policy) -> Result<()> {
        self.run_checked(
            "ip",
            &[
                "netns",
                "exec",
                ns,
                "iptables",
                "-P",
                chain.as_str(),
                policy.as_str(),
            ],
        )
    }

    fn netns_allow_established(&self, ns: &str) -> Result<()> {
        self.run_checked(
            "ip",
            &[
                "netns",
                "exec",
                ns,
                "iptables",
                "-A",
                "INPUT",
                "-m",
                "state",
                "--state",
                "ESTABLISHED,RELATED",
                "-j",
                "ACCEPT",
            ],
        )
    }

    fn netns_allow_loopback(&self, ns: &str) -> Result<()> {
        self.run_checked(
            "ip",
            &[
                "netns", "exec", ns, "iptables", "-A", "INPUT", "-i", "lo", "-j", "ACCEPT",
            ],
        )
    }

    fn netns_ingress_rule(
        &self,
        ns: &str,
        protocol: &str,
        port: u16,
        action: RuleAction,
    ) -> Result<()> {
        let port = port.to_string();
        let target = match action {
            RuleAction::Allow => "ACCEPT",
            RuleAction::Deny => "DROP",
        };
        self.run_checked(
            "ip",
            &[
                "netns", "exec", ns, "iptables", "-A", "INPUT", "-p", protocol, "--dport", &port,
                "-j", target,
            ],
        )
    }

    fn exec_in_netns(&self, ns: &str, command: &str) -> Result<ExecOutput> {
        self.run("ip", &["netns", "exec", ns, "sh", "-c", command])
    }
}
