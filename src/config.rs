//! Stack configuration (`vmstack.toml`)
//!
//! Every recognized variable lives here. Address prefixes are checked when
//! the file is loaded, so a bad CIDR never reaches the platform.

use declarative::{ValidationError, Value, Variables};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable holding the admin password unless configured otherwise
pub const DEFAULT_PASSWORD_ENV: &str = "VMSTACK_ADMIN_PASSWORD";

/// Config file name looked up in the user config directory
const CONFIG_FILE: &str = "vmstack.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Variables of the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    pub resource_group_name: String,

    #[serde(default = "default_location")]
    pub location: String,

    /// Prefix for the names of network resources
    #[serde(default = "default_prefix")]
    pub prefix: String,

    pub vm_name: String,

    #[serde(default = "default_vm_size")]
    pub vm_size: String,

    #[serde(default = "default_admin_username")]
    pub admin_username: String,

    /// Name of the environment variable holding the admin password
    #[serde(default = "default_admin_password")]
    pub admin_password: String,

    #[serde(default = "default_vnet_address_space")]
    pub vnet_address_space: Vec<String>,

    #[serde(default = "default_subnet_address_prefixes")]
    pub subnet_address_prefixes: Vec<String>,

    /// Source prefix allowed to reach the remote access port; empty disables the rule
    #[serde(default)]
    pub allowed_remote_cidr: String,

    #[serde(default = "default_remote_access_port")]
    pub remote_access_port: u16,

    #[serde(default = "default_true")]
    pub create_public_ip: bool,

    /// Applied to every resource that takes tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_location() -> String {
    "eastus".to_string()
}

fn default_prefix() -> String {
    "vmstack".to_string()
}

fn default_vm_size() -> String {
    "Standard_B2s".to_string()
}

fn default_admin_username() -> String {
    "azureuser".to_string()
}

fn default_admin_password() -> String {
    DEFAULT_PASSWORD_ENV.to_string()
}

fn default_vnet_address_space() -> Vec<String> {
    vec!["10.0.0.0/16".to_string()]
}

fn default_subnet_address_prefixes() -> Vec<String> {
    vec!["10.0.1.0/24".to_string()]
}

fn default_remote_access_port() -> u16 {
    3389
}

fn default_true() -> bool {
    true
}

impl StackConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ParseFailure::Toml(source) => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            ParseFailure::Invalid(e) => ConfigError::Invalid(e),
        })?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate config text
    fn parse(content: &str) -> Result<Self, ParseFailure> {
        let config: Self = toml::from_str(content).map_err(ParseFailure::Toml)?;
        config.validate().map_err(ParseFailure::Invalid)?;
        Ok(config)
    }

    /// Check names and address prefixes
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (variable, value) in [
            ("resource_group_name", &self.resource_group_name),
            ("location", &self.location),
            ("prefix", &self.prefix),
            ("vm_name", &self.vm_name),
            ("vm_size", &self.vm_size),
            ("admin_username", &self.admin_username),
            ("admin_password", &self.admin_password),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(variable, "must not be empty"));
            }
        }

        if self.vnet_address_space.is_empty() {
            return Err(invalid("vnet_address_space", "at least one prefix is required"));
        }
        if self.subnet_address_prefixes.is_empty() {
            return Err(invalid("subnet_address_prefixes", "at least one prefix is required"));
        }
        for cidr in &self.vnet_address_space {
            parse_cidr(cidr).map_err(|reason| invalid("vnet_address_space", &reason))?;
        }
        for cidr in &self.subnet_address_prefixes {
            parse_cidr(cidr).map_err(|reason| invalid("subnet_address_prefixes", &reason))?;
        }
        if !self.allowed_remote_cidr.is_empty() {
            parse_cidr(&self.allowed_remote_cidr)
                .map_err(|reason| invalid("allowed_remote_cidr", &reason))?;
        }
        if self.remote_access_port == 0 {
            return Err(invalid("remote_access_port", "must be between 1 and 65535"));
        }
        Ok(())
    }

    /// Variables that inclusion conditions are evaluated over
    pub fn variables(&self) -> Variables {
        Variables::from([
            ("resource_group_name".into(), self.resource_group_name.as_str().into()),
            ("location".into(), self.location.as_str().into()),
            ("prefix".into(), self.prefix.as_str().into()),
            ("vm_name".into(), self.vm_name.as_str().into()),
            ("vm_size".into(), self.vm_size.as_str().into()),
            ("admin_username".into(), self.admin_username.as_str().into()),
            ("admin_password".into(), Value::secret(&self.admin_password)),
            ("vnet_address_space".into(), self.vnet_address_space.clone().into()),
            (
                "subnet_address_prefixes".into(),
                self.subnet_address_prefixes.clone().into(),
            ),
            ("allowed_remote_cidr".into(), self.allowed_remote_cidr.as_str().into()),
            ("remote_access_port".into(), self.remote_access_port.into()),
            ("create_public_ip".into(), self.create_public_ip.into()),
            ("tags".into(), self.tags.clone().into()),
        ])
    }
}

enum ParseFailure {
    Toml(toml::de::Error),
    Invalid(ValidationError),
}

fn invalid(variable: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidVariable {
        variable: variable.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse an address prefix such as `10.0.0.0/16`.
///
/// A bare address counts as a single-host prefix.
pub fn parse_cidr(cidr: &str) -> Result<(IpAddr, u8), String> {
    let (addr, len) = match cidr.split_once('/') {
        Some((addr, len)) => (addr, Some(len)),
        None => (cidr, None),
    };
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| format!("{cidr:?} is not a valid address prefix"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let len = match len {
        Some(len) => len
            .parse::<u8>()
            .ok()
            .filter(|len| *len <= max)
            .ok_or_else(|| format!("{cidr:?} has an invalid prefix length"))?,
        None => max,
    };
    Ok((addr, len))
}

/// Resolve the config path.
///
/// `~` is expanded. A relative path that does not exist in the working
/// directory is looked up in the user config directory (`vmstack/`).
pub fn locate(path: &Path) -> PathBuf {
    let expanded = expand(path);
    if expanded.exists() || expanded.is_absolute() {
        return expanded;
    }
    dirs::config_dir()
        .map(|dir| dir.join("vmstack").join(CONFIG_FILE))
        .filter(|candidate| candidate.exists())
        .unwrap_or(expanded)
}

/// Expand a leading `~` in a path
pub fn expand(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&raw).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
resource_group_name = "rg-demo"
vm_name = "demo-vm"
"#;

    fn parse(content: &str) -> Result<StackConfig, ValidationError> {
        match StackConfig::parse(content) {
            Ok(config) => Ok(config),
            Err(ParseFailure::Invalid(e)) => Err(e),
            Err(ParseFailure::Toml(e)) => panic!("unexpected TOML error: {e}"),
        }
    }

    #[test]
    fn test_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.location, "eastus");
        assert_eq!(config.admin_password, DEFAULT_PASSWORD_ENV);
        assert_eq!(config.remote_access_port, 3389);
        assert!(config.create_public_ip);
        assert!(config.allowed_remote_cidr.is_empty());
        assert_eq!(config.vnet_address_space, vec!["10.0.0.0/16"]);
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
resource_group_name = "rg-demo"
location = "westeurope"
prefix = "demo"
vm_name = "demo-vm"
vm_size = "Standard_D2s_v5"
admin_username = "ops"
admin_password = "DEMO_PASSWORD"
vnet_address_space = ["10.10.0.0/16"]
subnet_address_prefixes = ["10.10.1.0/24"]
allowed_remote_cidr = "203.0.113.0/24"
remote_access_port = 22
create_public_ip = false

[tags]
env = "dev"
owner = "platform"
"#,
        )
        .unwrap();
        assert_eq!(config.tags.len(), 2);

        let vars = config.variables();
        assert_eq!(vars["create_public_ip"], Value::Bool(false));
        assert_eq!(vars["remote_access_port"], Value::Int(22));
        assert_eq!(vars["admin_password"], Value::secret("DEMO_PASSWORD"));
    }

    #[test]
    fn test_malformed_remote_cidr_rejected() {
        let err = parse(&format!("{MINIMAL}allowed_remote_cidr = \"203.0.113.0/33\"\n")).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidVariable { ref variable, .. } if variable == "allowed_remote_cidr"
        ));

        let err = parse(&format!("{MINIMAL}allowed_remote_cidr = \"my office\"\n")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidVariable { .. }));
    }

    #[test]
    fn test_malformed_network_cidr_rejected() {
        let err = parse(&format!("{MINIMAL}vnet_address_space = [\"10.0.0/16\"]\n")).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidVariable { ref variable, .. } if variable == "vnet_address_space"
        ));
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = parse("resource_group_name = \"\"\nvm_name = \"vm\"\n").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidVariable { ref variable, .. } if variable == "resource_group_name"
        ));
    }

    #[test]
    fn test_unknown_field_is_parse_error() {
        assert!(matches!(
            StackConfig::parse(&format!("{MINIMAL}vm_sise = \"x\"\n")),
            Err(ParseFailure::Toml(_))
        ));
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.0.0.0/16").unwrap().1, 16);
        assert_eq!(parse_cidr("198.51.100.7").unwrap().1, 32);
        assert_eq!(parse_cidr("2001:db8::/32").unwrap().1, 32);
        assert!(parse_cidr("10.0.0.0/").is_err());
        assert!(parse_cidr("2001:db8::/129").is_err());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmstack.toml");

        assert!(matches!(StackConfig::load(&path), Err(ConfigError::Read { .. })));

        fs::write(&path, MINIMAL).unwrap();
        assert_eq!(StackConfig::load(&path).unwrap().vm_name, "demo-vm");
        assert_eq!(locate(&path), path);
    }
}
