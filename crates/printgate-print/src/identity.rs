// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Identity resolution: who owns a network submission.
//
// Two lookups, both pure over an immutable `IdentityTable` snapshot:
//
//   - by source address: every registration whose range contains the
//     address is a candidate; the narrowest prefix wins, then the most
//     recently created registration.  No candidate means unresolved.
//   - by IPP token: the presented secret is hashed and looked up; unknown
//     and revoked tokens never authenticate.
//
// Writers (create/revoke) clone the current table, modify the copy, and swap
// the `Arc` in one step, so a resolution always sees either the whole old
// table or the whole new one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use printgate_core::error::{PrintgateError, Result};
use printgate_core::types::{AccountId, IdentityDirectory, IpRange, IpRegistration, IppToken};
use printgate_security::integrity::{generate_token_secret, hash_secret};

/// The registration that won an address lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressMatch {
    pub account: AccountId,
    pub registration_id: Uuid,
    pub range: IpRange,
}

/// Why a token failed to authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRejection {
    Unknown,
    Revoked,
    /// The Basic-auth username names a different account than the token.
    AccountMismatch,
}

impl TokenRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown token",
            Self::Revoked => "revoked token",
            Self::AccountMismatch => "token belongs to another account",
        }
    }
}

/// One consistent view of the registration and token tables.
#[derive(Debug, Default)]
pub struct IdentityTable {
    registrations: Vec<IpRegistration>,
    /// Keyed by `secret_hash`, which is unique.
    tokens: HashMap<String, IppToken>,
}

impl IdentityTable {
    fn from_directory(dir: IdentityDirectory) -> Result<Self> {
        let mut tokens = HashMap::with_capacity(dir.tokens.len());
        for token in dir.tokens {
            if tokens.contains_key(&token.secret_hash) {
                return Err(PrintgateError::Config(format!(
                    "duplicate token secret hash (token {})",
                    token.id
                )));
            }
            tokens.insert(token.secret_hash.clone(), token);
        }
        Ok(Self {
            registrations: dir.registrations,
            tokens,
        })
    }

    /// Most specific, then most recent, registration containing `addr`.
    pub fn resolve_address(&self, addr: IpAddr) -> Option<AddressMatch> {
        self.registrations
            .iter()
            .filter(|r| r.range.contains(addr))
            .max_by(|a, b| {
                a.range
                    .prefix_len()
                    .cmp(&b.range.prefix_len())
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|r| AddressMatch {
                account: r.account.clone(),
                registration_id: r.id,
                range: r.range,
            })
    }

    /// Authenticate a presented secret.  `claimed_account` is the Basic-auth
    /// username; an empty or absent one is not checked.
    pub fn authenticate(
        &self,
        claimed_account: Option<&str>,
        secret: &str,
    ) -> std::result::Result<AccountId, TokenRejection> {
        let token = self
            .tokens
            .get(&hash_secret(secret))
            .ok_or(TokenRejection::Unknown)?;
        if token.revoked {
            return Err(TokenRejection::Revoked);
        }
        match claimed_account {
            Some(name) if !name.is_empty() && name != token.account.as_str() => {
                Err(TokenRejection::AccountMismatch)
            }
            _ => Ok(token.account.clone()),
        }
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

/// Shared, read-mostly identity lookup service.
#[derive(Default)]
pub struct IdentityResolver {
    table: RwLock<Arc<IdentityTable>>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from an exported directory.
    pub fn from_directory(dir: IdentityDirectory) -> Result<Self> {
        Ok(Self {
            table: RwLock::new(Arc::new(IdentityTable::from_directory(dir)?)),
        })
    }

    /// Read a JSON `IdentityDirectory` file.
    pub fn load_directory(path: impl AsRef<Path>) -> Result<IdentityDirectory> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| PrintgateError::Config(format!("read {}: {e}", path.display())))?;
        let dir: IdentityDirectory = serde_json::from_str(&data)
            .map_err(|e| PrintgateError::Config(format!("parse {}: {e}", path.display())))?;
        info!(
            registrations = dir.registrations.len(),
            tokens = dir.tokens.len(),
            "identity directory loaded"
        );
        Ok(dir)
    }

    /// The current table.  Hold on to it for as long as one decision needs a
    /// stable view.
    pub fn snapshot(&self) -> Arc<IdentityTable> {
        match self.table.read() {
            Ok(guard) => Arc::clone(&guard),
            // Swaps are single assignments, so a poisoned lock still guards
            // a complete table.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn resolve_address(&self, addr: IpAddr) -> Option<AddressMatch> {
        let found = self.snapshot().resolve_address(addr);
        debug!(%addr, account = ?found.as_ref().map(|m| &m.account), "address resolved");
        found
    }

    pub fn authenticate(
        &self,
        claimed_account: Option<&str>,
        secret: &str,
    ) -> std::result::Result<AccountId, TokenRejection> {
        self.snapshot().authenticate(claimed_account, secret)
    }

    /// Replace both tables wholesale, e.g. after re-reading the directory.
    pub fn replace(&self, dir: IdentityDirectory) -> Result<()> {
        let table = Arc::new(IdentityTable::from_directory(dir)?);
        self.swap(|_| Ok(table))
    }

    /// Map an address range to an account.
    pub fn register_address(&self, account: AccountId, range: IpRange) -> Result<IpRegistration> {
        let registration = IpRegistration::new(account, range);
        let added = registration.clone();
        self.swap(move |current| {
            let mut registrations = current.registrations.clone();
            registrations.push(added);
            Ok(Arc::new(IdentityTable {
                registrations,
                tokens: current.tokens.clone(),
            }))
        })?;
        info!(account = %registration.account, range = %registration.range, "address registered");
        Ok(registration)
    }

    /// Remove a registration.  Returns whether it existed.
    pub fn remove_registration(&self, id: Uuid) -> Result<bool> {
        let mut removed = false;
        self.swap(|current| {
            let registrations: Vec<_> = current
                .registrations
                .iter()
                .filter(|r| r.id != id)
                .cloned()
                .collect();
            removed = registrations.len() != current.registrations.len();
            Ok(Arc::new(IdentityTable {
                registrations,
                tokens: current.tokens.clone(),
            }))
        })?;
        Ok(removed)
    }

    /// Issue a new token for `account`.  Returns the stored record and the
    /// plaintext secret, which is not recoverable afterwards.
    pub fn issue_token(&self, account: AccountId) -> Result<(IppToken, String)> {
        let mut issued = None;
        self.swap(|current| {
            let (secret, secret_hash) = loop {
                let secret = generate_token_secret()?;
                let hash = hash_secret(&secret);
                if !current.tokens.contains_key(&hash) {
                    break (secret, hash);
                }
            };
            let token = IppToken {
                id: Uuid::new_v4(),
                account: account.clone(),
                secret_hash: secret_hash.clone(),
                revoked: false,
                created_at: Utc::now(),
            };
            let mut tokens = current.tokens.clone();
            tokens.insert(secret_hash, token.clone());
            issued = Some((token, secret));
            Ok(Arc::new(IdentityTable {
                registrations: current.registrations.clone(),
                tokens,
            }))
        })?;
        let (token, secret) = issued
            .ok_or_else(|| PrintgateError::Config("token issue did not complete".into()))?;
        info!(account = %token.account, token_id = %token.id, "IPP token issued");
        Ok((token, secret))
    }

    /// Revoke a token.  Returns whether it existed and was live.
    pub fn revoke_token(&self, id: Uuid) -> Result<bool> {
        let mut revoked = false;
        self.swap(|current| {
            let mut tokens = current.tokens.clone();
            if let Some(token) = tokens.values_mut().find(|t| t.id == id && !t.revoked) {
                token.revoked = true;
                revoked = true;
            }
            Ok(Arc::new(IdentityTable {
                registrations: current.registrations.clone(),
                tokens,
            }))
        })?;
        if revoked {
            info!(token_id = %id, "IPP token revoked");
        } else {
            warn!(token_id = %id, "revoke requested for unknown or already revoked token");
        }
        Ok(revoked)
    }

    /// Writer-exclusive copy-on-write update.
    fn swap(
        &self,
        update: impl FnOnce(&IdentityTable) -> Result<Arc<IdentityTable>>,
    ) -> Result<()> {
        let mut guard = match self.table.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = update(&guard)?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn account(name: &str) -> AccountId {
        AccountId::new(name)
    }

    fn registration(name: &str, range: &str, age_secs: i64) -> IpRegistration {
        let mut r = IpRegistration::new(account(name), range.parse().unwrap());
        r.created_at = Utc::now() - Duration::seconds(age_secs);
        r
    }

    #[test]
    fn narrowest_prefix_wins() {
        let resolver = IdentityResolver::from_directory(IdentityDirectory {
            registrations: vec![
                registration("office", "10.0.0.0/24", 10),
                registration("alice", "10.0.0.5/32", 100),
            ],
            tokens: vec![],
        })
        .unwrap();

        let found = resolver.resolve_address("10.0.0.5".parse().unwrap()).unwrap();
        assert_eq!(found.account, account("alice"));

        let found = resolver.resolve_address("10.0.0.6".parse().unwrap()).unwrap();
        assert_eq!(found.account, account("office"));
    }

    #[test]
    fn newest_registration_breaks_ties() {
        let resolver = IdentityResolver::from_directory(IdentityDirectory {
            registrations: vec![
                registration("old", "192.168.1.0/24", 500),
                registration("new", "192.168.1.0/24", 5),
            ],
            tokens: vec![],
        })
        .unwrap();

        let found = resolver.resolve_address("192.168.1.40".parse().unwrap()).unwrap();
        assert_eq!(found.account, account("new"));
    }

    #[test]
    fn unmatched_address_is_unresolved() {
        let resolver = IdentityResolver::new();
        resolver
            .register_address(account("alice"), "10.0.0.0/8".parse().unwrap())
            .unwrap();
        assert!(resolver.resolve_address("172.16.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn removed_registration_no_longer_matches() {
        let resolver = IdentityResolver::new();
        let reg = resolver
            .register_address(account("alice"), "10.0.0.5".parse().unwrap())
            .unwrap();
        assert!(resolver.remove_registration(reg.id).unwrap());
        assert!(!resolver.remove_registration(reg.id).unwrap());
        assert!(resolver.resolve_address("10.0.0.5".parse().unwrap()).is_none());
    }

    #[test]
    fn issued_token_authenticates_until_revoked() {
        let resolver = IdentityResolver::new();
        let (token, secret) = resolver.issue_token(account("bob")).unwrap();
        assert_ne!(token.secret_hash, secret);

        assert_eq!(resolver.authenticate(Some("bob"), &secret), Ok(account("bob")));
        assert_eq!(resolver.authenticate(None, &secret), Ok(account("bob")));
        assert_eq!(
            resolver.authenticate(Some("mallory"), &secret),
            Err(TokenRejection::AccountMismatch)
        );

        assert!(resolver.revoke_token(token.id).unwrap());
        assert_eq!(resolver.authenticate(Some("bob"), &secret), Err(TokenRejection::Revoked));
        assert_eq!(
            resolver.authenticate(Some("bob"), "wrong-secret"),
            Err(TokenRejection::Unknown)
        );
    }

    #[test]
    fn snapshot_is_unaffected_by_later_revocation() {
        let resolver = IdentityResolver::new();
        let (token, secret) = resolver.issue_token(account("bob")).unwrap();
        let before = resolver.snapshot();
        resolver.revoke_token(token.id).unwrap();

        assert!(before.authenticate(None, &secret).is_ok());
        assert!(resolver.snapshot().authenticate(None, &secret).is_err());
    }

    #[test]
    fn duplicate_secret_hashes_are_rejected() {
        let token = IppToken {
            id: Uuid::new_v4(),
            account: account("a"),
            secret_hash: hash_secret("same"),
            revoked: false,
            created_at: Utc::now(),
        };
        let mut twin = token.clone();
        twin.id = Uuid::new_v4();
        twin.account = account("b");

        let result = IdentityResolver::from_directory(IdentityDirectory {
            registrations: vec![],
            tokens: vec![token, twin],
        });
        assert!(matches!(result, Err(PrintgateError::Config(_))));
    }

    #[test]
    fn concurrent_readers_see_whole_tables() {
        let resolver = Arc::new(IdentityResolver::new());
        let addr: IpAddr = "10.1.2.3".parse().unwrap();

        let writer = {
            let resolver = Arc::clone(&resolver);
            std::thread::spawn(move || {
                for i in 0..200 {
                    let dir = IdentityDirectory {
                        registrations: vec![
                            registration(&format!("wide-{i}"), "10.0.0.0/8", 10),
                            registration(&format!("narrow-{i}"), "10.1.2.3/32", 10),
                        ],
                        tokens: vec![],
                    };
                    resolver.replace(dir).unwrap();
                }
            })
        };

        for _ in 0..500 {
            let snapshot = resolver.snapshot();
            // Each table holds both registrations or neither.
            assert!(snapshot.registration_count() == 0 || snapshot.registration_count() == 2);
            if let Some(found) = snapshot.resolve_address(addr) {
                assert!(found.account.as_str().starts_with("narrow-"));
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn directory_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        let export = IdentityDirectory {
            registrations: vec![registration("alice", "10.0.0.5", 1)],
            tokens: vec![],
        };
        std::fs::write(&path, serde_json::to_string(&export).unwrap()).unwrap();

        let loaded = IdentityResolver::load_directory(&path).unwrap();
        let resolver = IdentityResolver::from_directory(loaded).unwrap();
        assert_eq!(
            resolver.resolve_address("10.0.0.5".parse().unwrap()).map(|m| m.account),
            Some(account("alice"))
        );
    }
}
