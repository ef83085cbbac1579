//! Static table of per-kind update semantics

use crate::types::ResourceKind;

/// How a resource kind reacts to attribute changes
#[derive(Debug, Clone, Copy)]
pub struct KindRules {
    pub kind: ResourceKind,
    /// Fields whose change forces destroy + create
    pub immutable: &'static [&'static str],
}

const RULES: [KindRules; 8] = [
    KindRules {
        kind: ResourceKind::ResourceGroup,
        immutable: &["name", "location"],
    },
    KindRules {
        kind: ResourceKind::Network,
        immutable: &["name", "location", "resource_group", "address_space"],
    },
    KindRules {
        kind: ResourceKind::Subnet,
        immutable: &["name", "network"],
    },
    KindRules {
        kind: ResourceKind::SecurityPolicy,
        immutable: &["name", "location", "resource_group"],
    },
    KindRules {
        kind: ResourceKind::SecurityRule,
        immutable: &["name", "security_policy", "direction"],
    },
    KindRules {
        kind: ResourceKind::PublicAddress,
        immutable: &["name", "location", "resource_group", "allocation", "sku"],
    },
    KindRules {
        kind: ResourceKind::NetworkInterface,
        immutable: &["name", "location", "resource_group"],
    },
    KindRules {
        kind: ResourceKind::VirtualMachine,
        immutable: &[
            "name",
            "location",
            "resource_group",
            "size",
            "admin_username",
            "admin_password",
            "os_disk_name",
            "image",
        ],
    },
];

/// Rules for a kind
pub fn rules(kind: ResourceKind) -> &'static KindRules {
    // RULES follows the declaration order of ResourceKind
    &RULES[kind as usize]
}

/// Whether changing `field` on `kind` forces a replace
pub fn is_immutable(kind: ResourceKind, field: &str) -> bool {
    rules(kind).immutable.contains(&field)
}

/// Whether a change to `changed` fields can be done in place.
///
/// Every kind supports in-place updates of its mutable fields.
pub fn can_update_in_place<'a>(kind: ResourceKind, mut changed: impl Iterator<Item = &'a str>) -> bool {
    let rules = rules(kind);
    !changed.any(|field| rules.immutable.contains(&field))
}
