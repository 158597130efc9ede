//! Alias store: maps an inbound address on the proxied domain to a real
//! destination mailbox.
//!
//! Records are keyed by a full address (`billing@proxy.example`), a bare
//! local-part (`billing`) or a domain catch-all (`@proxy.example`). Keys are
//! stored and matched lower-cased.

pub mod libsql_store;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::AliasError;
use crate::retry::{RetryPolicy, with_retry};

pub use libsql_store::LibSqlAliasStore;
pub use memory::MemoryAliasStore;

/// Read-only key/value lookup of alias records.
#[async_trait]
pub trait AliasStore: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &str;

    /// Look up one lower-cased key. A missing record is `Ok(None)`.
    async fn get(&self, key: &str) -> Result<Option<String>, AliasError>;
}

/// A recipient address split into its routing parts, lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl Address {
    pub fn parse(raw: &str) -> Result<Self, AliasError> {
        let trimmed = raw
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_lowercase();
        let Some((local, domain)) = trimmed.rsplit_once('@') else {
            return Err(AliasError::InvalidAddress(raw.to_string()));
        };
        if local.is_empty() || domain.is_empty() || local.contains(char::is_whitespace) {
            return Err(AliasError::InvalidAddress(raw.to_string()));
        }
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
        })
    }

    /// `user+tag` -> `user`, or `None` when there is no extension.
    pub fn base_local(&self) -> Option<&str> {
        self.local
            .split_once('+')
            .map(|(base, _)| base)
            .filter(|base| !base.is_empty())
    }

    pub fn full(&self) -> String {
        format!("{}@{}", self.local, self.domain)
    }
}

/// Keys tried for `address`, most specific first.
pub fn lookup_keys(address: &Address, allow_plus_sign: bool) -> Vec<String> {
    let mut keys = vec![address.full(), address.local.clone()];
    if allow_plus_sign && let Some(base) = address.base_local() {
        keys.push(format!("{base}@{}", address.domain));
        keys.push(base.to_string());
    }
    keys.push(format!("@{}", address.domain));
    keys
}

/// Applies the lookup policy on top of an [`AliasStore`].
#[derive(Clone)]
pub struct AliasResolver {
    store: Arc<dyn AliasStore>,
    allow_plus_sign: bool,
    retry: RetryPolicy,
}

impl AliasResolver {
    pub fn new(store: Arc<dyn AliasStore>, allow_plus_sign: bool, retry: RetryPolicy) -> Self {
        Self {
            store,
            allow_plus_sign,
            retry,
        }
    }

    /// Resolve an inbound address to its destination.
    ///
    /// The first matching key wins. Each lookup runs under the retry policy;
    /// an error that outlasts it aborts the resolution.
    pub async fn resolve(&self, address: &str) -> Result<Option<String>, AliasError> {
        let parsed = Address::parse(address)?;

        let store = &self.store;
        for key in lookup_keys(&parsed, self.allow_plus_sign) {
            let lookup = key.as_str();
            let found = with_retry(&self.retry, "alias_lookup", move || store.get(lookup)).await?;
            if let Some(destination) = found {
                debug!(
                    recipient = %address,
                    key = %key,
                    destination = %destination,
                    store = self.store.name(),
                    "Alias matched"
                );
                return Ok(Some(destination));
            }
        }

        Ok(None)
    }
}
