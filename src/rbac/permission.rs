use std::fmt;

use serde::{Deserialize, Serialize};

use super::{
    PIJUL_APPLY, PIJUL_CREATE_DISCUSSION, PIJUL_EDIT_CHANNELS, PIJUL_EDIT_DISCUSSION,
    PIJUL_EDIT_PERMISSIONS, PIJUL_EDIT_TAGS, PIJUL_READ, PIJUL_TAG_DISCUSSION,
};

/// Bitmask over the eight pijul repo actions, as reported by `repo.permissions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PijulPermissions(u32);

impl PijulPermissions {
    pub const READ: PijulPermissions = PijulPermissions(1 << 0); // 1
    pub const CREATE_DISCUSSION: PijulPermissions = PijulPermissions(1 << 1); // 2
    pub const EDIT_DISCUSSION: PijulPermissions = PijulPermissions(1 << 2); // 4
    pub const TAG_DISCUSSION: PijulPermissions = PijulPermissions(1 << 3); // 8
    pub const APPLY: PijulPermissions = PijulPermissions(1 << 4); // 16
    pub const EDIT_CHANNELS: PijulPermissions = PijulPermissions(1 << 5); // 32
    pub const EDIT_TAGS: PijulPermissions = PijulPermissions(1 << 6); // 64
    pub const EDIT_PERMISSIONS: PijulPermissions = PijulPermissions(1 << 7); // 128

    /// Bit, short name, RBAC action. Order is the order names are reported in.
    const TABLE: [(PijulPermissions, &'static str, &'static str); 8] = [
        (Self::READ, "read", PIJUL_READ),
        (Self::CREATE_DISCUSSION, "create_discussion", PIJUL_CREATE_DISCUSSION),
        (Self::EDIT_DISCUSSION, "edit_discussion", PIJUL_EDIT_DISCUSSION),
        (Self::TAG_DISCUSSION, "tag_discussion", PIJUL_TAG_DISCUSSION),
        (Self::APPLY, "apply", PIJUL_APPLY),
        (Self::EDIT_CHANNELS, "edit_channels", PIJUL_EDIT_CHANNELS),
        (Self::EDIT_TAGS, "edit_tags", PIJUL_EDIT_TAGS),
        (Self::EDIT_PERMISSIONS, "edit_permissions", PIJUL_EDIT_PERMISSIONS),
    ];

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn has(self, required: PijulPermissions) -> bool {
        self.0 & required.0 == required.0
    }

    #[must_use]
    pub const fn union(self, other: PijulPermissions) -> PijulPermissions {
        PijulPermissions(self.0 | other.0)
    }

    /// Builds a mask from granted RBAC action strings; unknown actions are ignored.
    #[must_use]
    pub fn from_actions<S: AsRef<str>>(actions: &[S]) -> PijulPermissions {
        Self::TABLE
            .iter()
            .filter(|(_, _, action)| actions.iter().any(|a| a.as_ref() == *action))
            .fold(PijulPermissions::default(), |acc, (bit, _, _)| acc.union(*bit))
    }

    pub fn parse(s: &str) -> Option<PijulPermissions> {
        Self::TABLE
            .iter()
            .find(|(_, name, action)| *name == s || *action == s)
            .map(|(bit, _, _)| *bit)
    }

    #[must_use]
    pub fn to_strings(self) -> Vec<&'static str> {
        Self::TABLE
            .iter()
            .filter(|(bit, _, _)| self.has(*bit))
            .map(|(_, name, _)| *name)
            .collect()
    }
}

impl fmt::Display for PijulPermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_strings().join(", "))
    }
}

impl From<u32> for PijulPermissions {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl From<PijulPermissions> for i64 {
    fn from(p: PijulPermissions) -> Self {
        i64::from(p.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_are_stable() {
        assert_eq!(PijulPermissions::READ.bits(), 1);
        assert_eq!(PijulPermissions::APPLY.bits(), 16);
        assert_eq!(PijulPermissions::EDIT_PERMISSIONS.bits(), 128);
    }

    #[test]
    fn test_from_actions() {
        let p = PijulPermissions::from_actions(&["pijul:read", "pijul:apply", "repo:push"]);
        assert_eq!(p.bits(), 1 | 16);
        assert_eq!(p.to_strings(), vec!["read", "apply"]);
    }

    #[test]
    fn test_parse() {
        assert_eq!(PijulPermissions::parse("edit_tags"), Some(PijulPermissions::EDIT_TAGS));
        assert_eq!(PijulPermissions::parse("pijul:edit_tags"), Some(PijulPermissions::EDIT_TAGS));
        assert_eq!(PijulPermissions::parse("nope"), None);
    }
}
