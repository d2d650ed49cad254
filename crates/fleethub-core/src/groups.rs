//! Group membership for FleetHub.
//!
//! Groups are named subsets of connections used for targeted delivery. The
//! hub uses one group per driver, `driver-<id>`, which connections join
//! explicitly. Joining is not tied to the connection's own identity.

use crate::connection::ConnectionId;
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::debug;

/// Prefix of per-driver group names.
pub const DRIVER_GROUP_PREFIX: &str = "driver-";

/// Maximum driver ID length in bytes.
pub const MAX_DRIVER_ID_LENGTH: usize = 256;

/// A group name.
pub type GroupName = String;

/// Name of the group addressed by assignments for `driver_id`.
#[must_use]
pub fn driver_group(driver_id: &str) -> GroupName {
    format!("{DRIVER_GROUP_PREFIX}{driver_id}")
}

/// Validate a driver ID.
///
/// # Errors
///
/// Returns an error message if the driver ID is invalid.
pub fn validate_driver_id(driver_id: &str) -> Result<(), &'static str> {
    if driver_id.is_empty() {
        return Err("Driver id cannot be empty");
    }
    if driver_id.len() > MAX_DRIVER_ID_LENGTH {
        return Err("Driver id too long");
    }
    if driver_id.chars().any(char::is_control) {
        return Err("Driver id contains control characters");
    }
    Ok(())
}

/// Connection <-> group membership table.
#[derive(Debug, Default)]
pub struct GroupMembership {
    /// Members of each group.
    groups: DashMap<GroupName, HashSet<ConnectionId>>,
    /// Groups each connection has joined.
    memberships: DashMap<ConnectionId, HashSet<GroupName>>,
}

impl GroupMembership {
    /// Create an empty membership table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection to a group, creating the group if needed.
    ///
    /// Returns `true` if the connection was not already a member.
    pub fn join(&self, connection_id: &ConnectionId, group: &str) -> bool {
        let mut joined = self.memberships.entry(connection_id.clone()).or_default();
        if !joined.insert(group.to_string()) {
            return false;
        }

        let mut members = self.groups.entry(group.to_string()).or_default();
        members.insert(connection_id.clone());

        debug!(
            group = %group,
            connection = %connection_id,
            members = members.len(),
            "Joined group"
        );
        true
    }

    /// Remove a connection from a group.
    ///
    /// Returns `true` if the connection was a member. Empty groups are deleted.
    pub fn leave(&self, connection_id: &ConnectionId, group: &str) -> bool {
        let was_member = self
            .memberships
            .get_mut(connection_id)
            .map(|mut joined| joined.remove(group))
            .unwrap_or(false);
        self.memberships
            .remove_if(connection_id, |_, joined| joined.is_empty());

        if was_member {
            self.remove_member(group, connection_id);
            debug!(group = %group, connection = %connection_id, "Left group");
        }
        was_member
    }

    /// Remove a connection from every group it joined.
    ///
    /// Returns the groups that were left.
    pub fn leave_all(&self, connection_id: &ConnectionId) -> Vec<GroupName> {
        let Some((_, joined)) = self.memberships.remove(connection_id) else {
            return Vec::new();
        };

        for group in &joined {
            self.remove_member(group, connection_id);
        }

        debug!(connection = %connection_id, groups = joined.len(), "Left all groups");
        joined.into_iter().collect()
    }

    fn remove_member(&self, group: &str, connection_id: &ConnectionId) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(connection_id);
        }
        if self
            .groups
            .remove_if(group, |_, members| members.is_empty())
            .is_some()
        {
            debug!(group = %group, "Deleted empty group");
        }
    }

    /// Snapshot the members of a group.
    #[must_use]
    pub fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.groups
            .get(group)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Check if a connection belongs to a group.
    #[must_use]
    pub fn is_member(&self, connection_id: &ConnectionId, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|members| members.contains(connection_id))
    }

    /// Groups a connection has joined.
    #[must_use]
    pub fn groups_of(&self, connection_id: &ConnectionId) -> Vec<GroupName> {
        self.memberships
            .get(connection_id)
            .map(|joined| joined.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of members in a group.
    #[must_use]
    pub fn member_count(&self, group: &str) -> usize {
        self.groups.get(group).map(|m| m.len()).unwrap_or(0)
    }
}
