//! The VM topology as a resource graph
//!
//! Names and locations of dependent resources are references to the
//! resource group, so the graph carries its own ordering.

use anyhow::Result;
use declarative::{Condition, ResourceKind, ResourceSpec, StateStore, Value};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::StackConfig;

pub const RESOURCE_GROUP: &str = "resource_group";
pub const NETWORK: &str = "virtual_network";
pub const SUBNET: &str = "subnet";
pub const SECURITY_GROUP: &str = "security_group";
pub const REMOTE_ACCESS_RULE: &str = "remote_access_rule";
pub const PUBLIC_IP: &str = "public_ip";
pub const NETWORK_INTERFACE: &str = "network_interface";
pub const VIRTUAL_MACHINE: &str = "virtual_machine";

fn rg_name() -> Value {
    Value::reference(RESOURCE_GROUP, "name")
}

fn rg_location() -> Value {
    Value::reference(RESOURCE_GROUP, "location")
}

/// Build the resource graph for a config.
///
/// The public IP and the remote access rule are always declared; their
/// conditions decide whether a run includes them.
pub fn build(config: &StackConfig) -> Vec<ResourceSpec> {
    let tags = Value::from(config.tags.clone());
    let prefix = &config.prefix;

    let mut nic = ResourceSpec::new(NETWORK_INTERFACE, ResourceKind::NetworkInterface)
        .attr("name", format!("{prefix}-nic"))
        .attr("location", rg_location())
        .attr("resource_group", rg_name())
        .attr("subnet", Value::reference(SUBNET, "id"))
        .attr("private_ip_allocation", "Dynamic")
        .attr("network_security_group", Value::reference(SECURITY_GROUP, "id"))
        .attr("tags", tags.clone());
    if config.create_public_ip {
        nic = nic.attr("public_ip", Value::reference(PUBLIC_IP, "id"));
    }

    vec![
        ResourceSpec::new(RESOURCE_GROUP, ResourceKind::ResourceGroup)
            .attr("name", config.resource_group_name.as_str())
            .attr("location", config.location.as_str())
            .attr("tags", tags.clone()),
        ResourceSpec::new(NETWORK, ResourceKind::Network)
            .attr("name", format!("{prefix}-vnet"))
            .attr("location", rg_location())
            .attr("resource_group", rg_name())
            .attr("address_space", config.vnet_address_space.clone())
            .attr("tags", tags.clone()),
        ResourceSpec::new(SUBNET, ResourceKind::Subnet)
            .attr("name", format!("{prefix}-subnet"))
            .attr("resource_group", rg_name())
            .attr("network", Value::reference(NETWORK, "name"))
            .attr("address_prefixes", config.subnet_address_prefixes.clone()),
        ResourceSpec::new(SECURITY_GROUP, ResourceKind::SecurityPolicy)
            .attr("name", format!("{prefix}-nsg"))
            .attr("location", rg_location())
            .attr("resource_group", rg_name())
            .attr("tags", tags.clone()),
        ResourceSpec::new(REMOTE_ACCESS_RULE, ResourceKind::SecurityRule)
            .attr("name", "allow-remote-access")
            .attr("resource_group", rg_name())
            .attr("security_policy", Value::reference(SECURITY_GROUP, "name"))
            .attr("priority", 1001_i64)
            .attr("direction", "Inbound")
            .attr("access", "Allow")
            .attr("protocol", "Tcp")
            .attr("source_port_range", "*")
            .attr("destination_port_range", config.remote_access_port.to_string())
            .attr("source_address_prefix", config.allowed_remote_cidr.as_str())
            .attr("destination_address_prefix", "*")
            .when(Condition::non_empty("allowed_remote_cidr")),
        ResourceSpec::new(PUBLIC_IP, ResourceKind::PublicAddress)
            .attr("name", format!("{prefix}-pip"))
            .attr("location", rg_location())
            .attr("resource_group", rg_name())
            .attr("allocation", "Static")
            .attr("sku", "Standard")
            .attr("tags", tags.clone())
            .when(Condition::is_true("create_public_ip")),
        nic,
        ResourceSpec::new(VIRTUAL_MACHINE, ResourceKind::VirtualMachine)
            .attr("name", config.vm_name.as_str())
            .attr("location", rg_location())
            .attr("resource_group", rg_name())
            .attr("size", config.vm_size.as_str())
            .attr("admin_username", config.admin_username.as_str())
            .attr("admin_password", Value::secret(&config.admin_password))
            .attr("network_interfaces", vec![Value::reference(NETWORK_INTERFACE, "id")])
            .attr("os_disk_name", format!("{}-osdisk", config.vm_name))
            .attr("image", image())
            .attr("tags", tags),
    ]
}

fn image() -> Value {
    Value::from(BTreeMap::from([
        ("publisher".to_string(), "MicrosoftWindowsServer".to_string()),
        ("offer".to_string(), "WindowsServer".to_string()),
        ("sku".to_string(), "2022-datacenter-azure-edition".to_string()),
        ("version".to_string(), "latest".to_string()),
    ]))
}

/// Values reported after a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outputs {
    pub vm_id: Option<String>,
    pub private_ip_address: Option<String>,
    /// `None` when the stack has no public IP
    pub public_ip_address: Option<String>,
}

/// Read outputs from recorded state
pub fn outputs(store: &dyn StateStore) -> Result<Outputs> {
    let live_field = |id: &str, field: &str| -> Result<Option<String>> {
        Ok(store
            .get(id)?
            .filter(declarative::ResourceState::is_live)
            .and_then(|state| state.field(field))
            .and_then(|value| value.as_str().map(str::to_string)))
    };

    Ok(Outputs {
        vm_id: live_field(VIRTUAL_MACHINE, "id")?,
        private_ip_address: live_field(NETWORK_INTERFACE, "private_ip_address")?,
        public_ip_address: live_field(PUBLIC_IP, "ip_address")?,
    })
}
