//! Lifecycle orchestration for VPCs and subnets
//!
//! The engine owns the resource driver and the record store and keeps the
//! two consistent: kernel objects are mutated first, the record is
//! persisted after, so a crash can only leave kernel objects with a stale
//! record to retry against, never a record describing objects that were
//! never created.
//!
//! Provisioning is atomic-with-compensation: a hard driver failure rolls
//! back the partially built subnet. Teardown is the opposite, deliberately
//! best-effort: a child that refuses to die is logged and skipped so the
//! cascade always reaches the record.

use crate::driver::{ExecOutput, ResourceDriver};
use crate::error::{Error, Result};
use crate::firewall;
use crate::model::{self, Subnet, SubnetKind, Vpc};
use crate::store::VpcStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct Engine {
    driver: Box<dyn ResourceDriver>,
    store: Box<dyn VpcStore>,
    /// Per-VPC locks: kernel objects are host-global, so mutations on the
    /// same VPC name serialize rather than race
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(driver: Box<dyn ResourceDriver>, store: Box<dyn VpcStore>) -> Self {
        Self {
            driver,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(name.to_string()).or_default().clone()
    }

    fn load_vpc(&self, name: &str) -> Result<Vpc> {
        self.store
            .get(name)?
            .ok_or_else(|| Error::VpcNotFound(name.to_string()))
    }

    /// Create a VPC and its bridge.
    ///
    /// Idempotent: an existing bridge is adopted without being verified,
    /// and any existing record for the name is overwritten. Bridge
    /// creation failure aborts before anything is persisted.
    pub fn create_vpc(&self, name: &str, cidr: &str) -> Result<()> {
        model::validate_vpc_name(name)?;
        if !model::validate_cidr(cidr) {
            return Err(Error::InvalidCidr(cidr.to_string()));
        }
        let cidr = model::parse_cidr(cidr)?;

        let lock = self.lock_for(name);
        let _guard = lock.lock().unwrap();

        let bridge = model::bridge_name(name);
        if self.driver.bridge_exists(&bridge)? {
            warn!(bridge = %bridge, "bridge already exists, adopting it");
        } else {
            self.driver.bridge_create(&bridge)?;
            self.driver.link_up(&bridge)?;
            debug!(bridge = %bridge, "created bridge");
        }

        let record = Vpc::new(name, cidr);
        self.store.put(&record)?;

        info!(vpc = name, cidr = %cidr, bridge = %bridge, "VPC created");
        Ok(())
    }

    /// Delete a VPC: every child subnet first, then the bridge, then the
    /// record. The record goes last so a crash mid-delete leaves
    /// something an operator can retry against.
    pub fn delete_vpc(&self, name: &str) -> Result<()> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().unwrap();

        let mut record = self.load_vpc(name)?;

        let subnet_names: Vec<String> = record.subnets.keys().cloned().collect();
        for subnet in &subnet_names {
            if let Err(e) = self.remove_subnet_entry(&mut record, subnet) {
                warn!(vpc = name, subnet = %subnet, error = %e, "subnet deletion failed, continuing");
            }
        }

        // The bridge may already be gone
        if let Err(e) = self.driver.link_down(&record.bridge) {
            debug!(bridge = %record.bridge, error = %e, "failed to bring bridge down");
        }
        if let Err(e) = self.driver.bridge_delete(&record.bridge) {
            debug!(bridge = %record.bridge, error = %e, "failed to delete bridge");
        }

        self.store.remove(name)?;
        info!(vpc = name, "VPC deleted");
        Ok(())
    }

    /// Create a subnet: namespace, veth pair, bridge port, addressing and
    /// default route, then persist the entry. Any hard driver failure
    /// rolls the partially built subnet back and leaves the record
    /// untouched.
    pub fn create_subnet(&self, vpc: &str, name: &str, cidr: &str, kind: SubnetKind) -> Result<()> {
        model::validate_subnet_name(name)?;
        let cidr = model::parse_cidr(cidr)?;
        // Gateway derivation replaces the last octet, which only makes
        // sense for octet-aligned masks of /24 or coarser
        if cidr.prefix_len() > 24 {
            return Err(Error::InvalidCidr(format!(
                "{} (subnet masks finer than /24 are not supported)",
                cidr
            )));
        }

        let lock = self.lock_for(vpc);
        let _guard = lock.lock().unwrap();

        let mut record = self.load_vpc(vpc)?;

        let namespace = model::namespace_name(vpc, name);
        let (veth_host, veth_ns) = model::veth_names(name);

        let created_ns = if self.driver.netns_exists(&namespace)? {
            warn!(namespace = %namespace, "namespace already exists, reusing it");
            false
        } else {
            self.driver.netns_add(&namespace)?;
            debug!(namespace = %namespace, "created namespace");
            true
        };

        if let Err(e) = self.wire_subnet(&record.bridge, &namespace, &veth_host, &veth_ns, cidr) {
            // Compensate: a half-built subnet must not leak. Deleting the
            // namespace destroys whatever veth end was moved into it.
            if created_ns {
                if let Err(cleanup) = self.driver.netns_delete(&namespace) {
                    warn!(namespace = %namespace, error = %cleanup, "rollback failed to delete namespace");
                }
            }
            if let Err(cleanup) = self.driver.link_delete(&veth_host) {
                debug!(iface = %veth_host, error = %cleanup, "rollback: host veth already gone");
            }
            return Err(e);
        }

        record.subnets.insert(
            name.to_string(),
            Subnet {
                cidr,
                kind,
                namespace,
                veth_host,
                veth_ns,
            },
        );
        self.store.put(&record)?;

        info!(vpc, subnet = name, cidr = %cidr, kind = %kind, "subnet created");
        Ok(())
    }

    fn wire_subnet(
        &self,
        bridge: &str,
        namespace: &str,
        veth_host: &str,
        veth_ns: &str,
        cidr: ipnet::Ipv4Net,
    ) -> Result<()> {
        self.driver.veth_add(veth_host, veth_ns)?;
        self.driver.move_to_netns(veth_ns, namespace)?;

        self.driver.set_master(veth_host, bridge)?;
        self.driver.link_up(veth_host)?;

        self.driver.netns_link_up(namespace, "lo")?;
        self.driver.netns_link_up(namespace, veth_ns)?;
        self.driver.assign_address(namespace, veth_ns, cidr)?;
        self.driver
            .add_default_route(namespace, model::gateway_for(&cidr))?;
        Ok(())
    }

    /// Delete a subnet. Deleting the namespace implicitly destroys any
    /// veth end still attached to it, so there is no separate veth
    /// cleanup.
    pub fn delete_subnet(&self, vpc: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(vpc);
        let _guard = lock.lock().unwrap();

        let mut record = self.load_vpc(vpc)?;
        self.remove_subnet_entry(&mut record, name)
    }

    fn remove_subnet_entry(&self, record: &mut Vpc, name: &str) -> Result<()> {
        let subnet = record
            .subnets
            .get(name)
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: record.name.clone(),
                subnet: name.to_string(),
            })?;

        if let Err(e) = self.driver.netns_delete(&subnet.namespace) {
            warn!(namespace = %subnet.namespace, error = %e, "failed to delete namespace");
        }

        record.subnets.remove(name);
        self.store.put(record)?;

        info!(vpc = %record.name, subnet = name, "subnet deleted");
        Ok(())
    }

    /// Configure NAT so the VPC can reach the outside world through
    /// `host_iface`. Appends rules; repeated calls leave duplicates.
    pub fn setup_nat(&self, vpc: &str, subnet: &str, host_iface: &str) -> Result<()> {
        let lock = self.lock_for(vpc);
        let _guard = lock.lock().unwrap();

        let record = self.load_vpc(vpc)?;
        if !record.subnets.contains_key(subnet) {
            return Err(Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            });
        }

        firewall::setup_nat(self.driver.as_ref(), record.cidr, &record.bridge, host_iface)?;

        info!(vpc, subnet, interface = host_iface, "NAT configured");
        Ok(())
    }

    /// Apply firewall policy inside a subnet's namespace
    pub fn apply_firewall(&self, vpc: &str, subnet: &str, rules_file: Option<&Path>) -> Result<()> {
        let lock = self.lock_for(vpc);
        let _guard = lock.lock().unwrap();

        let record = self.load_vpc(vpc)?;
        let entry = record
            .subnets
            .get(subnet)
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            })?;

        firewall::apply(self.driver.as_ref(), &entry.namespace, rules_file)?;

        info!(vpc, subnet, "firewall rules applied");
        Ok(())
    }

    /// Run a command line inside a subnet's namespace
    pub fn exec(&self, vpc: &str, subnet: &str, command: &str) -> Result<ExecOutput> {
        let record = self.load_vpc(vpc)?;
        let entry = record
            .subnets
            .get(subnet)
            .ok_or_else(|| Error::SubnetNotFound {
                vpc: vpc.to_string(),
                subnet: subnet.to_string(),
            })?;

        debug!(vpc, subnet, command, "executing in namespace");
        self.driver.exec_in_netns(&entry.namespace, command)
    }

    /// All persisted VPC records, re-read from the store on every call
    pub fn list_vpcs(&self) -> Result<Vec<Vpc>> {
        self.store.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::MockDriver;
    use crate::store::testing::MemStore;

    fn engine() -> (Engine, MockDriver, MemStore) {
        let driver = MockDriver::new();
        let store = MemStore::new();
        let engine = Engine::new(Box::new(driver.clone()), Box::new(store.clone()));
        (engine, driver, store)
    }

    fn engine_with_vpc() -> (Engine, MockDriver, MemStore) {
        let (engine, driver, store) = engine();
        engine.create_vpc("test", "10.1.0.0/16").unwrap();
        (engine, driver, store)
    }

    #[test]
    fn test_create_vpc_provisions_bridge_and_record() {
        let (engine, driver, store) = engine();
        engine.create_vpc("test", "10.1.0.0/16").unwrap();

        assert!(driver.called("bridge_create br-test"));
        assert!(driver.called("link_up br-test"));

        let record = store.get("test").unwrap().unwrap();
        assert_eq!(record.bridge, "br-test");
        assert_eq!(record.cidr.to_string(), "10.1.0.0/16");
        assert!(record.subnets.is_empty());
    }

    #[test]
    fn test_create_vpc_is_idempotent() {
        let (engine, driver, store) = engine();
        engine.create_vpc("test", "10.1.0.0/16").unwrap();
        engine.create_vpc("test", "10.1.0.0/16").unwrap();

        // Bridge created exactly once, record overwritten not duplicated
        let creates = driver
            .calls()
            .iter()
            .filter(|c| c.starts_with("bridge_create"))
            .count();
        assert_eq!(creates, 1);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_create_vpc_adopts_existing_bridge() {
        let (engine, driver, store) = engine();
        driver.seed_bridge("br-test");

        engine.create_vpc("test", "10.1.0.0/16").unwrap();

        assert!(!driver.called("bridge_create"));
        assert!(store.contains("test"));
    }

    #[test]
    fn test_create_vpc_rejects_bad_cidr() {
        let (engine, driver, store) = engine();
        let err = engine.create_vpc("test", "10.1.0.0").unwrap_err();

        assert!(matches!(err, Error::InvalidCidr(_)));
        assert!(driver.calls().is_empty());
        assert!(!store.contains("test"));
    }

    #[test]
    fn test_create_vpc_rejects_bad_name() {
        let (engine, driver, _) = engine();
        let err = engine.create_vpc("bad name", "10.1.0.0/16").unwrap_err();

        assert!(matches!(err, Error::InvalidName { .. }));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_create_vpc_bridge_failure_aborts_before_persist() {
        let (engine, driver, store) = engine();
        driver.fail_on("bridge_create");

        assert!(engine.create_vpc("test", "10.1.0.0/16").is_err());
        assert!(!store.contains("test"));
    }

    #[test]
    fn test_create_subnet_wires_namespace() {
        let (engine, driver, store) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();

        assert!(driver.called("netns_add ns-test-web"));
        assert!(driver.called("veth_add veth-web-host veth-web-ns"));
        assert!(driver.called("move_to_netns veth-web-ns ns-test-web"));
        assert!(driver.called("set_master veth-web-host br-test"));
        assert!(driver.called("link_up veth-web-host"));
        assert!(driver.called("netns_link_up ns-test-web lo"));
        assert!(driver.called("netns_link_up ns-test-web veth-web-ns"));
        assert!(driver.called("assign_address ns-test-web veth-web-ns 10.1.1.0/24"));
        assert!(driver.called("add_default_route ns-test-web 10.1.1.1"));

        let record = store.get("test").unwrap().unwrap();
        let subnet = &record.subnets["web"];
        assert_eq!(subnet.kind, SubnetKind::Public);
        assert_eq!(subnet.namespace, "ns-test-web");
    }

    #[test]
    fn test_create_subnet_missing_vpc_mutates_nothing() {
        let (engine, driver, _) = engine();
        let err = engine
            .create_subnet("ghost", "web", "10.1.1.0/24", SubnetKind::Private)
            .unwrap_err();

        assert!(matches!(err, Error::VpcNotFound(_)));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_create_subnet_reuses_existing_namespace() {
        let (engine, driver, _) = engine_with_vpc();
        driver.seed_namespace("ns-test-web");

        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Private)
            .unwrap();

        assert!(!driver.called("netns_add"));
        assert!(driver.called("veth_add veth-web-host veth-web-ns"));
    }

    #[test]
    fn test_create_subnet_rolls_back_on_failure() {
        let (engine, driver, store) = engine_with_vpc();
        driver.fail_on("assign_address");

        let err = engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));

        // Namespace and host veth were compensated away
        assert!(driver.called("netns_delete ns-test-web"));
        assert!(driver.called("link_delete veth-web-host"));
        assert!(!driver.has_namespace("ns-test-web"));

        // And the record never saw the subnet
        let record = store.get("test").unwrap().unwrap();
        assert!(record.subnets.is_empty());
    }

    #[test]
    fn test_create_subnet_rejects_fine_mask() {
        let (engine, driver, _) = engine_with_vpc();
        let before = driver.calls().len();

        let err = engine
            .create_subnet("test", "web", "10.1.1.0/28", SubnetKind::Private)
            .unwrap_err();

        assert!(matches!(err, Error::InvalidCidr(_)));
        assert_eq!(driver.calls().len(), before);
    }

    #[test]
    fn test_delete_subnet_removes_entry_and_namespace() {
        let (engine, driver, store) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();

        engine.delete_subnet("test", "web").unwrap();

        assert!(driver.called("netns_delete ns-test-web"));
        let record = store.get("test").unwrap().unwrap();
        assert!(record.subnets.is_empty());
    }

    #[test]
    fn test_delete_subnet_not_found() {
        let (engine, _, _) = engine_with_vpc();
        let err = engine.delete_subnet("test", "ghost").unwrap_err();
        assert!(matches!(err, Error::SubnetNotFound { .. }));
    }

    #[test]
    fn test_delete_vpc_removes_children_before_bridge() {
        let (engine, driver, store) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();
        engine
            .create_subnet("test", "db", "10.1.2.0/24", SubnetKind::Private)
            .unwrap();

        engine.delete_vpc("test").unwrap();

        let web = driver.index_of("netns_delete ns-test-web").unwrap();
        let db = driver.index_of("netns_delete ns-test-db").unwrap();
        let down = driver.index_of("link_down br-test").unwrap();
        let gone = driver.index_of("bridge_delete br-test").unwrap();

        assert!(web < down && db < down);
        assert!(down < gone);
        assert!(!store.contains("test"));
    }

    #[test]
    fn test_delete_vpc_continues_past_subnet_failure() {
        let (engine, driver, store) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();
        driver.fail_on("netns_delete");

        engine.delete_vpc("test").unwrap();

        assert!(driver.called("bridge_delete br-test"));
        assert!(!store.contains("test"));
    }

    #[test]
    fn test_delete_vpc_not_found() {
        let (engine, driver, _) = engine();
        let err = engine.delete_vpc("ghost").unwrap_err();

        assert!(matches!(err, Error::VpcNotFound(_)));
        assert!(driver.calls().is_empty());
    }

    #[test]
    fn test_exec_runs_in_namespace() {
        let (engine, driver, _) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();
        driver.set_exec_output(ExecOutput {
            stdout: "up\n".to_string(),
            stderr: String::new(),
            code: 0,
        });

        let out = engine.exec("test", "web", "ip link show").unwrap();

        assert!(driver.called("exec_in_netns ns-test-web ip link show"));
        assert_eq!(out.stdout, "up\n");
        assert!(out.success());
    }

    #[test]
    fn test_exec_not_found_runs_nothing() {
        let (engine, driver, _) = engine_with_vpc();
        let before = driver.calls().len();

        let err = engine.exec("test", "ghost", "true").unwrap_err();

        assert!(matches!(err, Error::SubnetNotFound { .. }));
        assert_eq!(driver.calls().len(), before);
    }

    #[test]
    fn test_setup_nat_references_vpc_cidr() {
        let (engine, driver, _) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();

        engine.setup_nat("test", "web", "eth0").unwrap();

        assert!(driver.called("set_sysctl net.ipv4.ip_forward 1"));
        assert!(driver.called("nat_masquerade 10.1.0.0/16 eth0"));
        assert!(driver.called("forward_accept br-test eth0 established=false"));
        assert!(driver.called("forward_accept eth0 br-test established=true"));
    }

    #[test]
    fn test_setup_nat_missing_subnet() {
        let (engine, driver, _) = engine_with_vpc();
        let before = driver.calls().len();

        let err = engine.setup_nat("test", "ghost", "eth0").unwrap_err();

        assert!(matches!(err, Error::SubnetNotFound { .. }));
        assert_eq!(driver.calls().len(), before);
    }

    #[test]
    fn test_apply_firewall_targets_subnet_namespace() {
        let (engine, driver, _) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();

        engine.apply_firewall("test", "web", None).unwrap();

        assert!(driver.called("netns_flush_rules ns-test-web"));
        assert!(driver.called("netns_ingress_rule ns-test-web tcp 22 ACCEPT"));
    }

    #[test]
    fn test_list_round_trips_subnets() {
        let (engine, _, _) = engine_with_vpc();
        engine
            .create_subnet("test", "web", "10.1.1.0/24", SubnetKind::Public)
            .unwrap();

        let vpcs = engine.list_vpcs().unwrap();
        assert_eq!(vpcs.len(), 1);
        let subnet = &vpcs[0].subnets["web"];
        assert_eq!(subnet.cidr.to_string(), "10.1.1.0/24");
        assert_eq!(subnet.kind, SubnetKind::Public);

        engine.delete_subnet("test", "web").unwrap();
        let vpcs = engine.list_vpcs().unwrap();
        assert!(vpcs[0].subnets.is_empty());
    }
}
