//! Local simulated platform
//!
//! Keeps an inventory of resources in `<dir>/platform.json` and hands out
//! ARM-style ids, addresses and the other values a cloud would report. Lets
//! a topology be rehearsed end to end without an account.

use declarative::{
    Attributes, BackendError, Created, ResourceBackend, ResourceKind, ResourceProvider, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::parse_cidr;

/// Hosts at the start of a subnet that the platform keeps for itself
const RESERVED_HOSTS: u32 = 4;

/// One resource as the platform sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformResource {
    pub kind: ResourceKind,
    pub attributes: Attributes,
    pub outputs: Attributes,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Inventory {
    #[serde(default)]
    resources: BTreeMap<String, PlatformResource>,
    /// Addresses handed out so far, per subnet
    #[serde(default)]
    allocated: BTreeMap<String, u32>,
    #[serde(default)]
    public_ips: u32,
}

/// Shared inventory, persisted after every change
struct Platform {
    path: PathBuf,
    inventory: Mutex<Inventory>,
    secret: fn(&str) -> bool,
}

impl Platform {
    fn inventory(&self) -> MutexGuard<'_, Inventory> {
        match self.inventory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn save(&self, inventory: &Inventory) -> Result<(), BackendError> {
        let temp_path = self.path.with_extension("json.tmp");
        let io = |e: std::io::Error| BackendError::permanent(format!("{}: {e}", self.path.display()));
        {
            let mut writer = BufWriter::new(File::create(&temp_path).map_err(io)?);
            serde_json::to_writer_pretty(&mut writer, inventory)
                .map_err(|e| BackendError::permanent(format!("failed to serialize inventory: {e}")))?;
            writer.flush().map_err(io)?;
        }
        fs::rename(&temp_path, &self.path).map_err(io)
    }
}

pub struct LocalBackend {
    providers: Vec<LocalProvider>,
    platform: Arc<Platform>,
}

impl LocalBackend {
    /// Open the platform inventory in `dir`.
    ///
    /// Secrets are checked against the process environment.
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::open_with(dir, |name| std::env::var_os(name).is_some())
    }

    /// Open with a custom check for whether a named secret is available
    pub fn open_with(dir: impl Into<PathBuf>, secret: fn(&str) -> bool) -> anyhow::Result<Self> {
        use anyhow::Context;

        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let path = dir.join("platform.json");

        let inventory = if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("Failed to open platform inventory: {}", path.display()))?;
            serde_json::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to parse platform inventory: {}", path.display()))?
        } else {
            Inventory::default()
        };

        let platform = Arc::new(Platform {
            path,
            inventory: Mutex::new(inventory),
            secret,
        });
        let providers = ResourceKind::ALL
            .into_iter()
            .map(|kind| LocalProvider {
                kind,
                platform: Arc::clone(&platform),
            })
            .collect();
        Ok(Self { providers, platform })
    }

    /// Every resource on the platform, keyed by backend id
    pub fn resources(&self) -> BTreeMap<String, PlatformResource> {
        self.platform.inventory().resources.clone()
    }
}

impl ResourceBackend for LocalBackend {
    fn provider(&self, kind: ResourceKind) -> Option<&dyn ResourceProvider> {
        self.providers
            .iter()
            .find(|p| p.kind == kind)
            .map(|p| p as &dyn ResourceProvider)
    }
}

struct LocalProvider {
    kind: ResourceKind,
    platform: Arc<Platform>,
}

fn text<'a>(attributes: &'a Attributes, field: &str) -> Result<&'a str, BackendError> {
    attributes
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BackendError::permanent(format!("missing required field {field:?}")))
}

fn not_found(backend_id: &str) -> BackendError {
    BackendError::NotFound {
        backend_id: backend_id.to_string(),
    }
}

impl LocalProvider {
    /// ARM-style id for a new resource
    fn backend_id(&self, attributes: &Attributes) -> Result<String, BackendError> {
        let name = text(attributes, "name")?;
        let path = match self.kind {
            ResourceKind::ResourceGroup => return Ok(format!("/subscriptions/local/resourceGroups/{name}")),
            ResourceKind::Network => format!("Microsoft.Network/virtualNetworks/{name}"),
            ResourceKind::Subnet => format!(
                "Microsoft.Network/virtualNetworks/{}/subnets/{name}",
                text(attributes, "network")?
            ),
            ResourceKind::SecurityPolicy => format!("Microsoft.Network/networkSecurityGroups/{name}"),
            ResourceKind::SecurityRule => format!(
                "Microsoft.Network/networkSecurityGroups/{}/securityRules/{name}",
                text(attributes, "security_policy")?
            ),
            ResourceKind::PublicAddress => format!("Microsoft.Network/publicIPAddresses/{name}"),
            ResourceKind::NetworkInterface => format!("Microsoft.Network/networkInterfaces/{name}"),
            ResourceKind::VirtualMachine => format!("Microsoft.Compute/virtualMachines/{name}"),
        };
        let group = text(attributes, "resource_group")?;
        Ok(format!("/subscriptions/local/resourceGroups/{group}/providers/{path}"))
    }

    /// Fail unless every secret named in `attributes` is available
    fn check_secrets(&self, attributes: &Attributes) -> Result<(), BackendError> {
        for value in attributes.values() {
            if let Value::Secret(secret) = value
                && !(self.platform.secret)(secret.name())
            {
                return Err(BackendError::permanent(format!(
                    "secret {} is not set",
                    secret.name()
                )));
            }
        }
        Ok(())
    }

    /// Values the platform assigns on create
    fn assign_outputs(&self, inventory: &mut Inventory, attributes: &Attributes) -> Result<Attributes, BackendError> {
        let mut outputs = Attributes::new();
        match self.kind {
            ResourceKind::PublicAddress => {
                inventory.public_ips += 1;
                let n = inventory.public_ips;
                let ip = Ipv4Addr::new(20, 0, (n >> 8) as u8, (n & 0xff) as u8);
                outputs.insert("ip_address".into(), Value::String(ip.to_string()));
            }
            ResourceKind::NetworkInterface => {
                let subnet_id = text(attributes, "subnet")?;
                let subnet = inventory
                    .resources
                    .get(subnet_id)
                    .ok_or_else(|| BackendError::permanent(format!("subnet {subnet_id} does not exist")))?;
                let prefix = match subnet.attributes.get("address_prefixes") {
                    Some(Value::List(items)) => items.first().and_then(Value::as_str),
                    _ => None,
                }
                .ok_or_else(|| BackendError::permanent(format!("subnet {subnet_id} has no address prefix")))?;

                let (base, len) = match parse_cidr(prefix) {
                    Ok((IpAddr::V4(base), len)) => (base, len),
                    _ => {
                        return Err(BackendError::permanent(format!(
                            "subnet {subnet_id} has no IPv4 prefix"
                        )));
                    }
                };
                let counter = inventory.allocated.entry(subnet_id.to_string()).or_default();
                let ip = host_address(base, len, *counter)
                    .ok_or_else(|| BackendError::permanent(format!("subnet {subnet_id} is exhausted")))?;
                *counter += 1;
                outputs.insert("private_ip_address".into(), Value::String(ip.to_string()));
            }
            _ => {}
        }
        Ok(outputs)
    }
}

/// The `index`-th assignable host of a subnet.
///
/// The first hosts and the broadcast address are never handed out.
fn host_address(addr: Ipv4Addr, len: u8, index: u32) -> Option<Ipv4Addr> {
    let host_bits = 32 - u32::from(len.min(32));
    let mask = u32::MAX.checked_shl(host_bits).unwrap_or(0);
    let network = u32::from(addr) & mask;
    let size = 1_u64 << host_bits;
    let offset = u64::from(RESERVED_HOSTS) + u64::from(index);
    if offset + 1 >= size {
        return None;
    }
    let host = u32::try_from(offset).ok()?;
    network.checked_add(host).map(Ipv4Addr::from)
}

impl ResourceProvider for LocalProvider {
    fn create(&self, attributes: &Attributes) -> Result<Created, BackendError> {
        self.check_secrets(attributes)?;
        let backend_id = self.backend_id(attributes)?;

        let mut inventory = self.platform.inventory();
        if inventory.resources.contains_key(&backend_id) {
            return Err(BackendError::permanent(format!("{backend_id} already exists")));
        }
        let outputs = self.assign_outputs(&mut inventory, attributes)?;
        inventory.resources.insert(
            backend_id.clone(),
            PlatformResource {
                kind: self.kind,
                attributes: attributes.clone(),
                outputs: outputs.clone(),
            },
        );
        self.platform.save(&inventory)?;
        Ok(Created { backend_id, outputs })
    }

    fn update(&self, backend_id: &str, attributes: &Attributes) -> Result<Attributes, BackendError> {
        self.check_secrets(attributes)?;
        let mut inventory = self.platform.inventory();
        let resource = inventory
            .resources
            .get_mut(backend_id)
            .ok_or_else(|| not_found(backend_id))?;
        resource.attributes = attributes.clone();
        let outputs = resource.outputs.clone();
        self.platform.save(&inventory)?;
        Ok(outputs)
    }

    fn destroy(&self, backend_id: &str) -> Result<(), BackendError> {
        let mut inventory = self.platform.inventory();
        inventory
            .resources
            .remove(backend_id)
            .ok_or_else(|| not_found(backend_id))?;
        inventory.allocated.remove(backend_id);
        self.platform.save(&inventory)
    }

    fn read(&self, backend_id: &str) -> Result<Attributes, BackendError> {
        let inventory = self.platform.inventory();
        let resource = inventory
            .resources
            .get(backend_id)
            .ok_or_else(|| not_found(backend_id))?;
        let mut observed = resource.attributes.clone();
        observed.extend(resource.outputs.clone());
        Ok(observed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn backend(dir: &std::path::Path) -> LocalBackend {
        LocalBackend::open_with(dir, |name| name == "PW_SET").unwrap()
    }

    fn network(backend: &LocalBackend) -> String {
        subnet(backend, "default", "10.0.1.0/24")
    }

    fn subnet(backend: &LocalBackend, name: &str, prefix: &str) -> String {
        let subnet = backend.provider(ResourceKind::Subnet).unwrap();
        subnet
            .create(&attrs(&[
                ("name", name.into()),
                ("resource_group", "rg".into()),
                ("network", "vnet".into()),
                ("address_prefixes", vec![prefix].into()),
            ]))
            .unwrap()
            .backend_id
    }

    fn nic(backend: &LocalBackend, name: &str, subnet: &str) -> Result<Created, BackendError> {
        backend.provider(ResourceKind::NetworkInterface).unwrap().create(&attrs(&[
            ("name", name.into()),
            ("resource_group", "rg".into()),
            ("subnet", subnet.into()),
        ]))
    }

    #[test]
    fn test_arm_ids() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let created = backend
            .provider(ResourceKind::ResourceGroup)
            .unwrap()
            .create(&attrs(&[("name", "rg".into()), ("location", "eastus".into())]))
            .unwrap();
        assert_eq!(created.backend_id, "/subscriptions/local/resourceGroups/rg");
        assert_eq!(
            network(&backend),
            "/subscriptions/local/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/default"
        );
    }

    #[test]
    fn test_nic_gets_address_from_subnet() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let subnet = network(&backend);
        let nics = backend.provider(ResourceKind::NetworkInterface).unwrap();

        let first = nics
            .create(&attrs(&[
                ("name", "nic1".into()),
                ("resource_group", "rg".into()),
                ("subnet", subnet.as_str().into()),
            ]))
            .unwrap();
        assert_eq!(first.outputs["private_ip_address"], Value::from("10.0.1.4"));

        let second = nics
            .create(&attrs(&[
                ("name", "nic2".into()),
                ("resource_group", "rg".into()),
                ("subnet", subnet.as_str().into()),
            ]))
            .unwrap();
        assert_eq!(second.outputs["private_ip_address"], Value::from("10.0.1.5"));
    }

    #[test]
    fn test_nic_address_stays_inside_subnet() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        // written with host bits set; addresses count from the network base
        let small = subnet(&backend, "small", "10.0.2.9/29");
        let first = nic(&backend, "a", &small).unwrap();
        assert_eq!(first.outputs["private_ip_address"], Value::from("10.0.2.12"));
        assert_eq!(
            nic(&backend, "b", &small).unwrap().outputs["private_ip_address"],
            Value::from("10.0.2.13")
        );
        assert_eq!(
            nic(&backend, "c", &small).unwrap().outputs["private_ip_address"],
            Value::from("10.0.2.14")
        );
        let err = nic(&backend, "d", &small).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("exhausted"));

        let tiny = subnet(&backend, "tiny", "10.0.1.0/30");
        assert!(nic(&backend, "e", &tiny).unwrap_err().to_string().contains("exhausted"));
    }

    #[test]
    fn test_nic_at_top_of_address_space() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());

        let top = subnet(&backend, "top", "255.255.255.252/30");
        assert!(nic(&backend, "a", &top).unwrap_err().to_string().contains("exhausted"));

        let last = subnet(&backend, "last", "255.255.255.0/24");
        assert_eq!(
            nic(&backend, "b", &last).unwrap().outputs["private_ip_address"],
            Value::from("255.255.255.4")
        );
    }

    #[test]
    fn test_host_address_bounds() {
        let base = Ipv4Addr::new(10, 0, 0, 0);
        assert_eq!(host_address(base, 8, 0), Some(Ipv4Addr::new(10, 0, 0, 4)));
        assert_eq!(host_address(base, 0, 0), Some(Ipv4Addr::new(0, 0, 0, 4)));
        assert_eq!(host_address(base, 24, 250), Some(Ipv4Addr::new(10, 0, 0, 254)));
        assert_eq!(host_address(base, 24, 251), None);
        assert_eq!(host_address(base, 32, 0), None);
    }

    #[test]
    fn test_missing_secret_is_permanent() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let vms = backend.provider(ResourceKind::VirtualMachine).unwrap();
        let base = [("name", Value::from("vm")), ("resource_group", Value::from("rg"))];

        let mut missing = attrs(&base);
        missing.insert("admin_password".into(), Value::secret("PW_UNSET"));
        let err = vms.create(&missing).unwrap_err();
        assert!(!err.is_retryable());

        let mut present = attrs(&base);
        present.insert("admin_password".into(), Value::secret("PW_SET"));
        assert!(vms.create(&present).is_ok());
    }

    #[test]
    fn test_inventory_persists() {
        let dir = tempfile::tempdir().unwrap();
        let id = network(&backend(dir.path()));

        let reopened = backend(dir.path());
        let subnet = reopened.provider(ResourceKind::Subnet).unwrap();
        assert!(subnet.read(&id).is_ok());
        subnet.destroy(&id).unwrap();
        assert!(subnet.read(&id).unwrap_err().is_not_found());
        assert!(subnet.destroy(&id).unwrap_err().is_not_found());
        assert!(reopened.resources().is_empty());
    }

    #[test]
    fn test_duplicate_create_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        network(&backend);
        let err = backend
            .provider(ResourceKind::Subnet)
            .unwrap()
            .create(&attrs(&[
                ("name", "default".into()),
                ("resource_group", "rg".into()),
                ("network", "vnet".into()),
            ]))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
