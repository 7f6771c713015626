//! NAT and per-subnet packet filtering
//!
//! Firewall policy is not persisted; it is a one-shot imperative
//! application. Reapplying always flushes first, because appended rules
//! would otherwise accumulate across invocations. NAT setup is the
//! opposite: it only appends, so repeated calls leave duplicate rules.

use crate::driver::ResourceDriver;
use crate::error::{Error, Result};
use ipnet::Ipv4Net;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

/// iptables built-in chains touched by the subnet policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
    Forward,
    Output,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
        }
    }
}

/// Default chain policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

/// What an ingress rule does with matching traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    #[default]
    Allow,
    Deny,
}

/// External rule file: `{ "ingress": [ {port, protocol?, action?} ] }`
#[derive(Debug, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub ingress: Vec<IngressRule>,
}

/// One ingress entry from a rule file
#[derive(Debug, Deserialize)]
pub struct IngressRule {
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub action: RuleAction,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// Load and parse a rule file. Read or parse failure is fatal to the
/// caller; any rules applied before the load are left standing.
pub fn load_rules(path: &Path) -> Result<RuleFile> {
    let content = fs::read_to_string(path).map_err(|e| Error::RuleFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|e| Error::RuleFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply the full firewall policy to a subnet's namespace.
///
/// Order: flush, default-deny policies, established/related, loopback,
/// rule-file entries, then the fixed SSH and HTTP allows. The fixed allows
/// come last and apply regardless of the custom policy (demo convenience,
/// kept as a documented quirk). Individual rule failures are logged and
/// skipped; only a rule-file load failure aborts.
pub fn apply(driver: &dyn ResourceDriver, ns: &str, rules_file: Option<&Path>) -> Result<()> {
    best_effort("flush rules", driver.netns_flush_rules(ns));
    best_effort(
        "set INPUT policy",
        driver.netns_set_policy(ns, Chain::Input, Policy::Drop),
    );
    best_effort(
        "set FORWARD policy",
        driver.netns_set_policy(ns, Chain::Forward, Policy::Drop),
    );
    best_effort(
        "set OUTPUT policy",
        driver.netns_set_policy(ns, Chain::Output, Policy::Accept),
    );
    best_effort("allow established", driver.netns_allow_established(ns));
    best_effort("allow loopback", driver.netns_allow_loopback(ns));

    if let Some(path) = rules_file {
        let rules = load_rules(path)?;
        for rule in &rules.ingress {
            best_effort(
                "apply ingress rule",
                driver.netns_ingress_rule(ns, &rule.protocol, rule.port, rule.action),
            );
        }
    }

    // SSH and HTTP stay reachable no matter what the rule file said
    best_effort(
        "allow ssh",
        driver.netns_ingress_rule(ns, "tcp", 22, RuleAction::Allow),
    );
    best_effort(
        "allow http",
        driver.netns_ingress_rule(ns, "tcp", 80, RuleAction::Allow),
    );

    Ok(())
}

/// Wire up NAT so the VPC's address block can reach the outside world via
/// `host_iface`: enable forwarding, masquerade the whole VPC CIDR, and
/// open the forward path both ways (return traffic restricted to
/// established/related). Each step is independently best-effort. Repeated
/// calls append duplicate rules.
pub fn setup_nat(
    driver: &dyn ResourceDriver,
    vpc_cidr: Ipv4Net,
    bridge: &str,
    host_iface: &str,
) -> Result<()> {
    best_effort(
        "enable ip forwarding",
        driver.set_sysctl("net.ipv4.ip_forward", "1"),
    );
    best_effort(
        "add masquerade rule",
        driver.nat_masquerade(vpc_cidr, host_iface),
    );
    best_effort(
        "allow bridge egress",
        driver.forward_accept(bridge, host_iface, false),
    );
    best_effort(
        "allow return traffic",
        driver.forward_accept(host_iface, bridge, true),
    );
    Ok(())
}

fn best_effort(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!(error = %e, "{} failed", what);
    }
}
