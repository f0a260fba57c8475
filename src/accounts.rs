// =============================================================================
// Account Registry — identities, credential hashes, API token validation
// =============================================================================
//
// Accounts are seeded from config at startup. Each account gets a bearer token
// derived as HMAC-SHA256(secret, account_id); only the SHA-256 hash of the
// token is retained as the account's credential hash. Validation hashes the
// presented token and compares in constant time, yielding
// `(user_id, account_id)` for the push hub and command API.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::runtime_config::AccountSeed;

type HmacSha256 = Hmac<Sha256>;

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even when a mismatch is found early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// A client account. One currency per account; the core is USD-only.
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the account's bearer token. Never the token itself.
    #[serde(skip_serializing)]
    pub credentials_hash: String,
    pub currency: String,
    /// ISO 8601.
    pub created_at: String,
}

/// Result of a successful token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: String,
    pub account_id: String,
}

/// Thread-safe account store.
pub struct AccountStore {
    accounts: RwLock<HashMap<String, Account>>,
    secret: String,
}

impl AccountStore {
    /// `secret` is the server-side token-derivation key
    /// (`MERIDIAN_AUTH_SECRET`).
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            secret: secret.into(),
        }
    }

    /// Register an account from its seed and return it with the bearer token.
    /// The token is returned exactly once; only its hash is stored.
    pub fn register(&self, seed: &AccountSeed) -> (Account, String) {
        let token = self.derive_token(&seed.id);
        let account = Account {
            id: seed.id.clone(),
            name: seed.name.clone(),
            credentials_hash: sha256_hex(token.as_bytes()),
            currency: "USD".to_string(),
            created_at: Utc::now().to_rfc3339(),
        };

        self.accounts.write().insert(seed.id.clone(), account.clone());
        info!(account = %seed.id, name = %seed.name, "account registered");
        (account, token)
    }

    pub fn get(&self, account_id: &str) -> Option<Account> {
        self.accounts.read().get(account_id).cloned()
    }

    pub fn contains(&self, account_id: &str) -> bool {
        self.accounts.read().contains_key(account_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    /// Validate a presented bearer token. Returns the identity it maps to, or
    /// `None`. Comparison is constant-time over the token hash.
    pub fn validate_token(&self, token: &str) -> Option<TokenIdentity> {
        if token.is_empty() {
            return None;
        }
        let presented_hash = sha256_hex(token.as_bytes());

        let accounts = self.accounts.read();
        for account in accounts.values() {
            if constant_time_eq(
                presented_hash.as_bytes(),
                account.credentials_hash.as_bytes(),
            ) {
                return Some(TokenIdentity {
                    user_id: format!("owner:{}", account.id),
                    account_id: account.id.clone(),
                });
            }
        }
        None
    }

    /// Deterministic token for an account id: hex(HMAC-SHA256(secret, id)).
    fn derive_token(&self, account_id: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(account_id.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn seed(id: &str) -> AccountSeed {
        AccountSeed {
            id: id.to_string(),
            name: format!("Account {id}"),
            initial_balance: 10_000.0,
        }
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn register_and_validate_roundtrip() {
        let store = AccountStore::new("test-secret");
        let (account, token) = store.register(&seed("acc-1"));
        assert_eq!(account.currency, "USD");

        let identity = store.validate_token(&token).unwrap();
        assert_eq!(identity.account_id, "acc-1");
        assert_eq!(identity.user_id, "owner:acc-1");
    }

    #[test]
    fn wrong_token_rejected() {
        let store = AccountStore::new("test-secret");
        let (_, token) = store.register(&seed("acc-1"));
        assert!(store.validate_token("not-a-token").is_none());
        assert!(store.validate_token("").is_none());
        // A token derived with a different secret must not validate.
        let other = AccountStore::new("other-secret");
        other.register(&seed("acc-1"));
        assert!(other.validate_token(&token).is_none());
    }

    #[test]
    fn tokens_are_deterministic_per_secret_and_account() {
        let store_a = AccountStore::new("s");
        let store_b = AccountStore::new("s");
        let (_, t1) = store_a.register(&seed("acc-1"));
        let (_, t2) = store_b.register(&seed("acc-1"));
        assert_eq!(t1, t2);
        let (_, t3) = store_b.register(&seed("acc-2"));
        assert_ne!(t1, t3);
    }

    #[test]
    fn credentials_hash_is_not_the_token() {
        let store = AccountStore::new("s");
        let (account, token) = store.register(&seed("acc-1"));
        assert_ne!(account.credentials_hash, token);
        assert_eq!(account.credentials_hash.len(), 64);
    }
}
