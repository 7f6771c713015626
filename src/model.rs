//! VPC and subnet records
//!
//! Provides:
//! - The persisted record types (`Vpc`, `Subnet`)
//! - Deterministic kernel object naming (bridge, namespace, veth ends)
//! - CIDR validation and gateway derivation

use crate::error::{Error, Result};
use clap::ValueEnum;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Maximum usable length of a Linux interface name (IFNAMSIZ minus NUL)
pub const MAX_IFACE_LEN: usize = 15;

/// A persisted VPC record
///
/// The record is the source of truth for what should exist in the kernel:
/// the bridge exists iff the record exists, and each subnet's namespace and
/// veth pair exist iff its entry is present in `subnets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vpc {
    /// Unique VPC name (primary key)
    pub name: String,
    /// Address block for the whole VPC
    pub cidr: Ipv4Net,
    /// Bridge interface name (always `br-<name>`)
    pub bridge: String,
    /// Subnets keyed by subnet name
    #[serde(default)]
    pub subnets: BTreeMap<String, Subnet>,
}

impl Vpc {
    /// Create a fresh record with an empty subnet map
    pub fn new(name: &str, cidr: Ipv4Net) -> Self {
        Self {
            name: name.to_string(),
            cidr,
            bridge: bridge_name(name),
            subnets: BTreeMap::new(),
        }
    }
}

/// A subnet entry inside a VPC record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subnet {
    /// Address block assigned to the namespace-side veth end
    pub cidr: Ipv4Net,
    /// Public or private
    #[serde(rename = "type")]
    pub kind: SubnetKind,
    /// Network namespace name (always `ns-<vpc>-<subnet>`)
    pub namespace: String,
    /// Host-side veth end (always `veth-<subnet>-host`)
    pub veth_host: String,
    /// Namespace-side veth end (always `veth-<subnet>-ns`)
    pub veth_ns: String,
}

/// Subnet type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SubnetKind {
    Public,
    Private,
}

impl fmt::Display for SubnetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubnetKind::Public => write!(f, "public"),
            SubnetKind::Private => write!(f, "private"),
        }
    }
}

/// Bridge interface name for a VPC
pub fn bridge_name(vpc: &str) -> String {
    format!("br-{}", vpc)
}

/// Network namespace name for a subnet
pub fn namespace_name(vpc: &str, subnet: &str) -> String {
    format!("ns-{}-{}", vpc, subnet)
}

/// Veth end names for a subnet: (host side, namespace side)
pub fn veth_names(subnet: &str) -> (String, String) {
    (
        format!("veth-{}-host", subnet),
        format!("veth-{}-ns", subnet),
    )
}

/// Check CIDR syntax: dotted-quad IPv4 with a `/` mask, octets in [0,255],
/// mask in [0,32]. Host bits need not be zero.
pub fn validate_cidr(cidr: &str) -> bool {
    cidr.parse::<Ipv4Net>().is_ok()
}

/// Parse a CIDR, surfacing `InvalidCidr` on any syntax failure
pub fn parse_cidr(cidr: &str) -> Result<Ipv4Net> {
    cidr.parse::<Ipv4Net>()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))
}

/// Gateway address for a subnet: the network address with its last octet
/// replaced by 1.
///
/// This is a convention, not a parameter. It is only correct for
/// octet-aligned masks of /24 or coarser; finer masks are rejected at
/// subnet creation time rather than silently misderived.
pub fn gateway_for(cidr: &Ipv4Net) -> Ipv4Addr {
    let mut octets = cidr.network().octets();
    octets[3] = 1;
    Ipv4Addr::from(octets)
}

/// Validate a VPC name: charset plus the derived bridge name fitting IFNAMSIZ
pub fn validate_vpc_name(name: &str) -> Result<()> {
    validate_charset(name)?;
    if bridge_name(name).len() > MAX_IFACE_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!(
                "bridge name 'br-{}' exceeds {} characters",
                name, MAX_IFACE_LEN
            ),
        });
    }
    Ok(())
}

/// Validate a subnet name: charset plus both derived veth names fitting
/// IFNAMSIZ
pub fn validate_subnet_name(name: &str) -> Result<()> {
    validate_charset(name)?;
    let (veth_host, _) = veth_names(name);
    if veth_host.len() > MAX_IFACE_LEN {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: format!(
                "veth name '{}' exceeds {} characters",
                veth_host, MAX_IFACE_LEN
            ),
        });
    }
    Ok(())
}

fn validate_charset(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "name is empty".to_string(),
        });
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidName {
            name: name.to_string(),
            reason: "only ASCII letters, digits, '-' and '_' are allowed".to_string(),
        });
    }
    Ok(())
}
