//! Permission and connection models, diffing, and the permission collaborator.
//!
//! The permission engine itself lives outside the controller. The controller
//! only needs to know which permissions a snap holds, to grant and revoke
//! them, and to manage the origins connected to a snap.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snaps_execution::SnapId;

/// Restriction attached to a permission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caveat {
    /// Caveat kind, e.g. `maxRequestTime`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Caveat payload.
    pub value: Value,
}

impl Caveat {
    /// Creates a caveat.
    #[must_use]
    pub fn new(kind: impl Into<String>, value: Value) -> Self {
        Self {
            kind: kind.into(),
            value,
        }
    }
}

/// A permission as requested by a manifest or held by a subject.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    /// Restrictions on the permission, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub caveats: Vec<Caveat>,
}

impl Permission {
    /// Creates a permission with `caveats`.
    #[must_use]
    pub const fn with_caveats(caveats: Vec<Caveat>) -> Self {
        Self { caveats }
    }

    /// Returns the value of the first caveat of `kind`.
    #[must_use]
    pub fn caveat(&self, kind: &str) -> Option<&Value> {
        self.caveats
            .iter()
            .find(|caveat| caveat.kind == kind)
            .map(|caveat| &caveat.value)
    }
}

/// Permissions keyed by name.
pub type PermissionSet = BTreeMap<String, Permission>;

/// Origins a snap asks to be connected to, with per-origin options.
pub type Connections = BTreeMap<String, Value>;

/// Difference between two permission sets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PermissionsChange {
    /// Desired but not currently held, or held with different caveats.
    pub new: PermissionSet,
    /// Held but no longer desired, or desired with different caveats.
    pub unused: PermissionSet,
    /// Held and desired unchanged.
    pub approved: PermissionSet,
}

/// Computes what must be granted and revoked to move from `current` to
/// `desired`.
///
/// A permission whose caveats changed appears in both `new` and `unused`.
#[must_use]
pub fn calculate_permissions_change(
    desired: &PermissionSet,
    current: &PermissionSet,
) -> PermissionsChange {
    let mut change = PermissionsChange::default();
    for (name, permission) in desired {
        match current.get(name) {
            Some(held) if held == permission => {
                change.approved.insert(name.clone(), permission.clone());
            }
            _ => {
                change.new.insert(name.clone(), permission.clone());
            }
        }
    }
    for (name, held) in current {
        if desired.get(name) != Some(held) {
            change.unused.insert(name.clone(), held.clone());
        }
    }
    change
}

/// Difference between two connection maps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionsChange {
    /// Origins only in the new map.
    pub new: BTreeSet<String>,
    /// Origins only in the old map.
    pub unused: BTreeSet<String>,
    /// Origins in both maps.
    pub approved: BTreeSet<String>,
}

/// Computes which origins to connect and disconnect when moving from `old`
/// to `new`.
#[must_use]
pub fn calculate_connections_change(old: &Connections, new: &Connections) -> ConnectionsChange {
    let old_origins: BTreeSet<&String> = old.keys().collect();
    let new_origins: BTreeSet<&String> = new.keys().collect();
    ConnectionsChange {
        new: new_origins
            .difference(&old_origins)
            .map(|origin| (*origin).clone())
            .collect(),
        unused: old_origins
            .difference(&new_origins)
            .map(|origin| (*origin).clone())
            .collect(),
        approved: old_origins
            .intersection(&new_origins)
            .map(|origin| (*origin).clone())
            .collect(),
    }
}

/// Capability store consulted and mutated by the controller.
pub trait PermissionController: Send + Sync {
    /// Permissions currently held by `snap_id`.
    fn granted(&self, snap_id: &SnapId) -> PermissionSet;

    /// Grants `permissions` to `snap_id`, replacing same-named grants.
    fn grant(&self, snap_id: &SnapId, permissions: &PermissionSet);

    /// Revokes the named permissions from `snap_id`. Unknown names are
    /// ignored.
    fn revoke(&self, snap_id: &SnapId, names: &[String]);

    /// Revokes every permission of `snap_id`.
    fn revoke_all(&self, snap_id: &SnapId);

    /// Allows `origin` to call `snap_id`.
    fn grant_connection(&self, origin: &str, snap_id: &SnapId);

    /// Stops `origin` from calling `snap_id`.
    fn revoke_connection(&self, origin: &str, snap_id: &SnapId);

    /// Removes `snap_id` from every origin's connections.
    fn remove_connections(&self, snap_id: &SnapId);

    /// Snaps `origin` may call.
    fn connected_snaps(&self, origin: &str) -> BTreeSet<SnapId>;

    /// The permission `name` held by `snap_id`.
    fn permission(&self, snap_id: &SnapId, name: &str) -> Option<Permission> {
        self.granted(snap_id).remove(name)
    }

    /// Returns `true` when `snap_id` holds `name`.
    fn has_permission(&self, snap_id: &SnapId, name: &str) -> bool {
        self.permission(snap_id, name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn set(entries: &[(&str, Permission)]) -> PermissionSet {
        entries
            .iter()
            .map(|(name, permission)| ((*name).to_owned(), permission.clone()))
            .collect()
    }

    fn with_origin(origin: &str) -> Permission {
        Permission::with_caveats(vec![Caveat::new("rpcOrigin", json!({ "dapps": origin == "dapps" }))])
    }

    #[rstest]
    fn splits_new_unused_and_approved() {
        let current = set(&[
            ("snap_dialog", Permission::default()),
            ("endowment:network-access", Permission::default()),
        ]);
        let desired = set(&[
            ("snap_dialog", Permission::default()),
            ("snap_getBip44Entropy", Permission::default()),
        ]);

        let change = calculate_permissions_change(&desired, &current);

        assert_eq!(change.new, set(&[("snap_getBip44Entropy", Permission::default())]));
        assert_eq!(
            change.unused,
            set(&[("endowment:network-access", Permission::default())])
        );
        assert_eq!(change.approved, set(&[("snap_dialog", Permission::default())]));
    }

    #[rstest]
    fn changed_caveats_are_both_new_and_unused() {
        let current = set(&[("endowment:rpc", with_origin("snaps"))]);
        let desired = set(&[("endowment:rpc", with_origin("dapps"))]);

        let change = calculate_permissions_change(&desired, &current);

        assert_eq!(change.new, desired);
        assert_eq!(change.unused, current);
        assert!(change.approved.is_empty());
    }

    #[rstest]
    fn identical_sets_are_fully_approved() {
        let current = set(&[("endowment:rpc", with_origin("dapps"))]);

        let change = calculate_permissions_change(&current, &current);

        assert!(change.new.is_empty());
        assert!(change.unused.is_empty());
        assert_eq!(change.approved, current);
    }

    #[rstest]
    fn diffs_connection_origins() {
        let old: Connections = [("https://a.example", json!({})), ("https://b.example", json!({}))]
            .into_iter()
            .map(|(origin, value)| (origin.to_owned(), value))
            .collect();
        let new: Connections = [("https://b.example", json!({})), ("https://c.example", json!({}))]
            .into_iter()
            .map(|(origin, value)| (origin.to_owned(), value))
            .collect();

        let change = calculate_connections_change(&old, &new);

        assert_eq!(change.new, BTreeSet::from(["https://c.example".to_owned()]));
        assert_eq!(change.unused, BTreeSet::from(["https://a.example".to_owned()]));
        assert_eq!(change.approved, BTreeSet::from(["https://b.example".to_owned()]));
    }

    #[rstest]
    fn finds_caveats_by_kind() {
        let permission = Permission::with_caveats(vec![Caveat::new("maxRequestTime", json!(5000))]);
        assert_eq!(permission.caveat("maxRequestTime"), Some(&json!(5000)));
        assert_eq!(permission.caveat("rpcOrigin"), None);
    }
}
