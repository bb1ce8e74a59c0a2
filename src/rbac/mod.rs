//! Role-based access control over `(subject, domain, object, action)` tuples.
//!
//! Policies (`p` rows) grant an action on an object within a domain to a
//! subject or a role. Groupings (`g` rows) put a subject into a role within a
//! domain. A request is allowed if a policy matches the subject directly or
//! any role the subject holds in that domain.

mod permission;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, params};

use crate::error::{Error, Result};

pub use permission::PijulPermissions;

/// The domain a knot or spindle uses for its own policies.
pub const THIS_SERVER: &str = "thisserver";

pub const SERVER_OWNER: &str = "server:owner";
pub const SERVER_MEMBER: &str = "server:member";

pub const REPO_SETTINGS: &str = "repo:settings";
pub const REPO_PUSH: &str = "repo:push";
pub const REPO_OWNER: &str = "repo:owner";
pub const REPO_INVITE: &str = "repo:invite";
pub const REPO_DELETE: &str = "repo:delete";
pub const REPO_COLLABORATOR: &str = "repo:collaborator";

pub const PIJUL_READ: &str = "pijul:read";
pub const PIJUL_CREATE_DISCUSSION: &str = "pijul:create_discussion";
pub const PIJUL_EDIT_DISCUSSION: &str = "pijul:edit_discussion";
pub const PIJUL_TAG_DISCUSSION: &str = "pijul:tag_discussion";
pub const PIJUL_APPLY: &str = "pijul:apply";
pub const PIJUL_EDIT_CHANNELS: &str = "pijul:edit_channels";
pub const PIJUL_EDIT_TAGS: &str = "pijul:edit_tags";
pub const PIJUL_EDIT_PERMISSIONS: &str = "pijul:edit_permissions";

const OWNER_REPO_ACTIONS: &[&str] = &[
    REPO_SETTINGS,
    REPO_PUSH,
    REPO_OWNER,
    REPO_INVITE,
    REPO_DELETE,
];

const COLLABORATOR_REPO_ACTIONS: &[&str] = &[REPO_COLLABORATOR, REPO_PUSH];

const PIJUL_OWNER_ACTIONS: &[&str] = &[
    PIJUL_READ,
    PIJUL_CREATE_DISCUSSION,
    PIJUL_EDIT_DISCUSSION,
    PIJUL_TAG_DISCUSSION,
    PIJUL_APPLY,
    PIJUL_EDIT_CHANNELS,
    PIJUL_EDIT_TAGS,
    PIJUL_EDIT_PERMISSIONS,
];

const PIJUL_COLLABORATOR_ACTIONS: &[&str] = &[
    PIJUL_READ,
    PIJUL_CREATE_DISCUSSION,
    PIJUL_EDIT_DISCUSSION,
    PIJUL_TAG_DISCUSSION,
    PIJUL_APPLY,
    PIJUL_EDIT_CHANNELS,
    PIJUL_EDIT_TAGS,
];

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS policies (
    ptype TEXT NOT NULL,
    v0 TEXT NOT NULL,
    v1 TEXT NOT NULL,
    v2 TEXT NOT NULL,
    v3 TEXT NOT NULL DEFAULT '',
    UNIQUE(ptype, v0, v1, v2, v3)
);

CREATE INDEX IF NOT EXISTS idx_policies_lookup ON policies(ptype, v1, v2);
"#;

/// Rejects repo objects that are not of the form `owner/name`.
pub fn check_repo_format(repo: &str) -> Result<()> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok(())
        }
        _ => Err(Error::BadRequest(format!(
            "invalid repo format {repo:?}, expected owner/name"
        ))),
    }
}

pub struct Enforcer {
    conn: Mutex<Connection>,
}

impl Enforcer {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        Self::from_connection(Connection::open(db_path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn add_rows(&self, ptype: &str, rows: &[[&str; 4]]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT OR IGNORE INTO policies (ptype, v0, v1, v2, v3) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ptype, row[0], row[1], row[2], row[3]],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove_rows(&self, ptype: &str, rows: &[[&str; 4]]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "DELETE FROM policies WHERE ptype = ?1 AND v0 = ?2 AND v1 = ?3 AND v2 = ?4 AND v3 = ?5",
                params![ptype, row[0], row[1], row[2], row[3]],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn policies_for<'a>(
        subject: &'a str,
        domain: &'a str,
        repo: &'a str,
        actions: &[&'a str],
    ) -> Vec<[&'a str; 4]> {
        actions
            .iter()
            .map(|action| [subject, domain, repo, *action])
            .collect()
    }

    /// Registers a domain and the baseline role policies for it.
    pub fn add_domain(&self, domain: &str) -> Result<()> {
        self.add_rows(
            "p",
            &[
                [SERVER_OWNER, domain, domain, "server:invite"],
                [SERVER_MEMBER, domain, domain, "repo:create"],
            ],
        )
    }

    pub fn add_server_owner(&self, domain: &str, owner: &str) -> Result<()> {
        self.add_rows("g", &[[owner, SERVER_OWNER, domain, ""]])
    }

    pub fn add_server_member(&self, domain: &str, member: &str) -> Result<()> {
        self.add_rows("g", &[[member, SERVER_MEMBER, domain, ""]])
    }

    pub fn remove_server_member(&self, domain: &str, member: &str) -> Result<()> {
        self.remove_rows("g", &[[member, SERVER_MEMBER, domain, ""]])
    }

    /// Grants the repo owner every repo action.
    pub fn add_repo(&self, owner: &str, domain: &str, repo: &str) -> Result<()> {
        check_repo_format(repo)?;
        self.add_rows("p", &Self::policies_for(owner, domain, repo, OWNER_REPO_ACTIONS))
    }

    pub fn remove_repo(&self, owner: &str, domain: &str, repo: &str) -> Result<()> {
        check_repo_format(repo)?;
        self.remove_rows("p", &Self::policies_for(owner, domain, repo, OWNER_REPO_ACTIONS))
    }

    pub fn add_collaborator(&self, collaborator: &str, domain: &str, repo: &str) -> Result<()> {
        check_repo_format(repo)?;
        self.add_rows(
            "p",
            &Self::policies_for(collaborator, domain, repo, COLLABORATOR_REPO_ACTIONS),
        )
    }

    pub fn remove_collaborator(&self, collaborator: &str, domain: &str, repo: &str) -> Result<()> {
        check_repo_format(repo)?;
        self.remove_rows(
            "p",
            &Self::policies_for(collaborator, domain, repo, COLLABORATOR_REPO_ACTIONS),
        )
    }

    pub fn add_pijul_repo_permissions(&self, owner: &str, domain: &str, repo: &str) -> Result<()> {
        check_repo_format(repo)?;
        self.add_rows("p", &Self::policies_for(owner, domain, repo, PIJUL_OWNER_ACTIONS))
    }

    pub fn remove_pijul_repo_permissions(
        &self,
        owner: &str,
        domain: &str,
        repo: &str,
    ) -> Result<()> {
        check_repo_format(repo)?;
        self.remove_rows("p", &Self::policies_for(owner, domain, repo, PIJUL_OWNER_ACTIONS))
    }

    pub fn add_pijul_collaborator_permissions(
        &self,
        collaborator: &str,
        domain: &str,
        repo: &str,
    ) -> Result<()> {
        check_repo_format(repo)?;
        self.add_rows(
            "p",
            &Self::policies_for(collaborator, domain, repo, PIJUL_COLLABORATOR_ACTIONS),
        )
    }

    pub fn remove_pijul_collaborator_permissions(
        &self,
        collaborator: &str,
        domain: &str,
        repo: &str,
    ) -> Result<()> {
        check_repo_format(repo)?;
        self.remove_rows(
            "p",
            &Self::policies_for(collaborator, domain, repo, PIJUL_COLLABORATOR_ACTIONS),
        )
    }

    /// Roles `subject` holds in `domain`.
    pub fn roles_for(&self, subject: &str, domain: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT v1 FROM policies WHERE ptype = 'g' AND v0 = ?1 AND v2 = ?2")?;
        let rows = stmt.query_map(params![subject, domain], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// True if `subject` (directly or via a role in `domain`) may perform `action` on `object`.
    pub fn enforce(&self, subject: &str, domain: &str, object: &str, action: &str) -> Result<bool> {
        let conn = self.conn();
        let allowed: bool = conn.query_row(
            "SELECT EXISTS (
                SELECT 1 FROM policies p
                WHERE p.ptype = 'p' AND p.v1 = ?2 AND p.v2 = ?3 AND p.v3 = ?4
                  AND (p.v0 = ?1 OR p.v0 IN (
                      SELECT g.v1 FROM policies g
                      WHERE g.ptype = 'g' AND g.v0 = ?1 AND g.v2 = ?2
                  ))
            )",
            params![subject, domain, object, action],
            |row| row.get(0),
        )?;
        Ok(allowed)
    }

    /// All actions granted to `subject` on `repo`, including those granted via roles.
    pub fn permissions_in_repo(&self, subject: &str, domain: &str, repo: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT p.v3 FROM policies p
             WHERE p.ptype = 'p' AND p.v1 = ?2 AND p.v2 = ?3
               AND (p.v0 = ?1 OR p.v0 IN (
                   SELECT g.v1 FROM policies g
                   WHERE g.ptype = 'g' AND g.v0 = ?1 AND g.v2 = ?2
               ))
             ORDER BY p.v3",
        )?;
        let rows = stmt.query_map(params![subject, domain, repo], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    pub fn is_repo_owner(&self, subject: &str, domain: &str, repo: &str) -> Result<bool> {
        self.enforce(subject, domain, repo, REPO_OWNER)
    }

    pub fn is_collaborator(&self, subject: &str, domain: &str, repo: &str) -> Result<bool> {
        self.enforce(subject, domain, repo, REPO_COLLABORATOR)
    }

    pub fn is_push_allowed(&self, subject: &str, domain: &str, repo: &str) -> Result<bool> {
        self.enforce(subject, domain, repo, REPO_PUSH)
    }

    /// Owners and collaborators: anyone allowed to push, own, or collaborate.
    pub fn can_edit_repo(&self, subject: &str, domain: &str, repo: &str) -> Result<bool> {
        for action in [REPO_PUSH, REPO_OWNER, REPO_COLLABORATOR] {
            if self.enforce(subject, domain, repo, action)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Users of repos on this server: the distinct subjects holding `repo:owner`.
    pub fn repo_owners(&self, domain: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT v0, v2 FROM policies WHERE ptype = 'p' AND v1 = ?1 AND v3 = ?2 ORDER BY v2",
        )?;
        let rows = stmt.query_map(params![domain, REPO_OWNER], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = "did:plc:alice";
    const BOB: &str = "did:plc:bob";
    const REPO: &str = "did:plc:alice/proj";

    #[test]
    fn test_check_repo_format() {
        assert!(check_repo_format("did:plc:a/repo").is_ok());
        assert!(check_repo_format("repo").is_err());
        assert!(check_repo_format("/repo").is_err());
        assert!(check_repo_format("a/").is_err());
        assert!(check_repo_format("a/b/c").is_err());
    }

    #[test]
    fn test_owner_has_all_repo_actions() {
        let e = Enforcer::in_memory().unwrap();
        e.add_repo(ALICE, THIS_SERVER, REPO).unwrap();

        assert!(e.is_repo_owner(ALICE, THIS_SERVER, REPO).unwrap());
        assert!(e.is_push_allowed(ALICE, THIS_SERVER, REPO).unwrap());
        assert!(!e.is_repo_owner(BOB, THIS_SERVER, REPO).unwrap());
        assert!(!e.is_push_allowed(ALICE, "otherserver", REPO).unwrap());
    }

    #[test]
    fn test_collaborator_add_remove() {
        let e = Enforcer::in_memory().unwrap();
        e.add_collaborator(BOB, THIS_SERVER, REPO).unwrap();
        assert!(e.is_push_allowed(BOB, THIS_SERVER, REPO).unwrap());
        assert!(e.is_collaborator(BOB, THIS_SERVER, REPO).unwrap());
        assert!(!e.is_repo_owner(BOB, THIS_SERVER, REPO).unwrap());

        e.remove_collaborator(BOB, THIS_SERVER, REPO).unwrap();
        assert!(!e.is_push_allowed(BOB, THIS_SERVER, REPO).unwrap());
    }

    #[test]
    fn test_pijul_permissions_by_role() {
        let e = Enforcer::in_memory().unwrap();
        e.add_pijul_repo_permissions(ALICE, THIS_SERVER, REPO).unwrap();
        e.add_pijul_collaborator_permissions(BOB, THIS_SERVER, REPO).unwrap();

        let owner = PijulPermissions::from_actions(&e.permissions_in_repo(ALICE, THIS_SERVER, REPO).unwrap());
        let collab = PijulPermissions::from_actions(&e.permissions_in_repo(BOB, THIS_SERVER, REPO).unwrap());

        assert_eq!(owner.bits(), 0xff);
        assert_eq!(collab.bits(), 0x7f);
        assert!(!collab.has(PijulPermissions::EDIT_PERMISSIONS));
    }

    #[test]
    fn test_role_grouping() {
        let e = Enforcer::in_memory().unwrap();
        e.add_domain(THIS_SERVER).unwrap();
        e.add_server_member(THIS_SERVER, BOB).unwrap();

        assert!(e.enforce(BOB, THIS_SERVER, THIS_SERVER, "repo:create").unwrap());
        assert!(!e.enforce(BOB, THIS_SERVER, THIS_SERVER, "server:invite").unwrap());
        assert_eq!(e.roles_for(BOB, THIS_SERVER).unwrap(), vec![SERVER_MEMBER]);

        e.remove_server_member(THIS_SERVER, BOB).unwrap();
        assert!(!e.enforce(BOB, THIS_SERVER, THIS_SERVER, "repo:create").unwrap());
    }

    #[test]
    fn test_add_is_idempotent() {
        let e = Enforcer::in_memory().unwrap();
        e.add_repo(ALICE, THIS_SERVER, REPO).unwrap();
        e.add_repo(ALICE, THIS_SERVER, REPO).unwrap();
        assert_eq!(e.repo_owners(THIS_SERVER).unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_repo_rejected_before_write() {
        let e = Enforcer::in_memory().unwrap();
        assert!(e.add_repo(ALICE, THIS_SERVER, "noslash").is_err());
        assert!(e.remove_collaborator(BOB, THIS_SERVER, "a/b/c").is_err());
    }
}
