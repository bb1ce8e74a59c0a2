//! Attributes signed commits to DIDs through their registered SSH keys.

use std::collections::HashMap;

use tracing::warn;

use super::store::Store;
use crate::crypto::{ssh_fingerprint, verify_signature};
use crate::error::Result;
use crate::sets::Set;
use crate::types::{Commit, PublicKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VerifiedCommit {
    pub hash: String,
    pub fingerprint: String,
}

#[derive(Debug, Default, Clone)]
pub struct VerifiedCommits(Set<VerifiedCommit>);

impl VerifiedCommits {
    pub fn is_verified(&self, hash: &str) -> bool {
        self.0.iter().any(|vc| vc.hash == hash)
    }

    /// Fingerprint of the key that verified `hash`, empty when unverified.
    pub fn fingerprint(&self, hash: &str) -> &str {
        self.0
            .iter()
            .find(|vc| vc.hash == hash)
            .map(|vc| vc.fingerprint.as_str())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Verifies each commit whose committer email maps to a DID against that
/// DID's public keys. Keys are fetched once per DID.
pub fn get_verified_commits(
    store: &dyn Store,
    email_to_did: &HashMap<String, String>,
    commits: &[Commit],
) -> Result<VerifiedCommits> {
    let mut verified = VerifiedCommits::default();
    let mut key_cache: HashMap<&str, Vec<PublicKey>> = HashMap::new();

    for commit in commits {
        let Some(signature) = commit.pgp_signature.as_deref() else {
            continue;
        };
        let Some(did) = email_to_did.get(&commit.committer.email) else {
            continue;
        };

        if !key_cache.contains_key(did.as_str()) {
            match store.get_public_keys(did) {
                Ok(keys) => {
                    key_cache.insert(did.as_str(), keys);
                }
                Err(e) => {
                    warn!(email = %commit.committer.email, error = %e, "failed to fetch public keys");
                    continue;
                }
            }
        }
        let Some(keys) = key_cache.get(did.as_str()) else {
            continue;
        };

        let payload = commit.payload();
        for pk in keys {
            if verify_signature(&pk.key, signature, payload.as_bytes()).is_err() {
                continue;
            }
            let fingerprint = ssh_fingerprint(&pk.key).unwrap_or_else(|e| {
                warn!(error = %e, "failed to compute ssh fingerprint");
                String::new()
            });
            let hash = if commit.this.is_empty() {
                commit.hash.clone()
            } else {
                commit.this.clone()
            };
            verified.0.insert(VerifiedCommit { hash, fingerprint });
            break;
        }
    }

    Ok(verified)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{FixedOffset, TimeZone, Utc};

    use super::*;
    use crate::appview::store::testing::new_store;
    use crate::crypto::testing::{authorized_key, sign, signing_key};
    use crate::types::Signature;

    fn commit(hash: &str, email: &str) -> Commit {
        let when = FixedOffset::east_opt(0)
            .unwrap()
            .timestamp_opt(1_700_000_000, 0)
            .unwrap();
        Commit {
            hash: hash.to_string(),
            author: Signature {
                name: "Alice".to_string(),
                email: email.to_string(),
                when,
            },
            committer: Signature {
                name: "Alice".to_string(),
                email: email.to_string(),
                when,
            },
            message: "signed\n".to_string(),
            tree: "4b825dc642cb6eb9a060e54bf8d69288fbee4904".to_string(),
            parent_hashes: Vec::new(),
            pgp_signature: None,
            change_id: None,
            extra_headers: BTreeMap::new(),
            this: hash.to_string(),
            parent: String::new(),
        }
    }

    #[test]
    fn test_verifies_with_registered_key() {
        let (_temp, store) = new_store();
        let key = signing_key(7);
        let authorized = authorized_key(&key);
        store
            .add_public_key(&PublicKey {
                did: "did:plc:alice".to_string(),
                name: "laptop".to_string(),
                key: authorized.clone(),
                created: Utc::now(),
            })
            .unwrap();

        let mut good = commit("aaaa", "alice@example.com");
        good.pgp_signature = Some(sign(&key, "git", good.payload().as_bytes()));

        let mut forged = commit("bbbb", "alice@example.com");
        forged.pgp_signature = Some(sign(&signing_key(9), "git", forged.payload().as_bytes()));

        let unsigned = commit("cccc", "alice@example.com");

        let mut unknown = commit("dddd", "stranger@example.com");
        unknown.pgp_signature = Some(sign(&key, "git", unknown.payload().as_bytes()));

        let email_to_did = HashMap::from([(
            "alice@example.com".to_string(),
            "did:plc:alice".to_string(),
        )]);
        let verified =
            get_verified_commits(&store, &email_to_did, &[good, forged, unsigned, unknown]).unwrap();

        assert_eq!(verified.len(), 1);
        assert!(verified.is_verified("aaaa"));
        assert!(!verified.is_verified("bbbb"));
        assert!(!verified.is_verified("cccc"));
        assert!(!verified.is_verified("dddd"));
        assert_eq!(verified.fingerprint("aaaa"), ssh_fingerprint(&authorized).unwrap());
        assert_eq!(verified.fingerprint("bbbb"), "");
    }

    #[test]
    fn test_wrong_namespace_does_not_verify() {
        let (_temp, store) = new_store();
        let key = signing_key(3);
        store
            .add_public_key(&PublicKey {
                did: "did:plc:alice".to_string(),
                name: "laptop".to_string(),
                key: authorized_key(&key),
                created: Utc::now(),
            })
            .unwrap();

        let mut c = commit("aaaa", "alice@example.com");
        c.pgp_signature = Some(sign(&key, "file", c.payload().as_bytes()));

        let email_to_did = HashMap::from([(
            "alice@example.com".to_string(),
            "did:plc:alice".to_string(),
        )]);
        let verified = get_verified_commits(&store, &email_to_did, &[c]).unwrap();
        assert!(verified.is_empty());
    }
}
