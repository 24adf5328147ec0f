use std::fmt;

use crate::config::AccountConfig;

/// A trading account as the account store knows it
#[derive(Clone, PartialEq, Eq)]
pub struct Account {
    pub alias: String,
    pub address: String,
    /// `None` for addresses we can only watch
    pub secret_key: Option<String>,
}

impl Account {
    pub fn watch_only(address: &str) -> Self {
        Self {
            alias: address.to_string(),
            address: address.to_string(),
            secret_key: None,
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("alias", &self.alias)
            .field("address", &self.address)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Alias and address lookup for configured accounts
pub trait AccountStore: Send + Sync {
    fn by_alias(&self, alias: &str) -> Option<Account>;

    /// Addresses compare case-insensitively
    fn by_address(&self, address: &str) -> Option<Account>;
}

/// In-memory store, usually built from the settings file
#[derive(Debug, Clone, Default)]
pub struct StaticAccountStore {
    accounts: Vec<Account>,
}

impl StaticAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        Self { accounts }
    }

    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        Self::new(
            accounts
                .iter()
                .map(|a| Account {
                    alias: a.alias.clone(),
                    address: a.address.clone(),
                    secret_key: Some(a.secret_key.clone()).filter(|k| !k.is_empty()),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

impl AccountStore for StaticAccountStore {
    fn by_alias(&self, alias: &str) -> Option<Account> {
        self.accounts.iter().find(|a| a.alias == alias).cloned()
    }

    fn by_address(&self, address: &str) -> Option<Account> {
        self.accounts
            .iter()
            .find(|a| a.address.eq_ignore_ascii_case(address))
            .cloned()
    }
}
