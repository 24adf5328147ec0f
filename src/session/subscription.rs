use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::accounts::{Account, AccountStore};
use crate::error::{Error, Result};

pub const DEFAULT_CANDLE_INTERVAL: &str = "1m";

/// What a subscription listens to, in venue wire shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SubscriptionKind {
    Candle { coin: String, interval: String },
    UserFills { user: String },
    AllMids,
    Trades { coin: String },
}

impl SubscriptionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SubscriptionKind::Candle { .. } => "candle",
            SubscriptionKind::UserFills { .. } => "userFills",
            SubscriptionKind::AllMids => "allMids",
            SubscriptionKind::Trades { .. } => "trades",
        }
    }

    /// The `subscription` object of a subscribe request
    pub fn to_wire(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Kinds whose frames drive the strategy
    pub fn feeds_strategy(&self) -> bool {
        matches!(
            self,
            SubscriptionKind::Candle { .. } | SubscriptionKind::UserFills { .. }
        )
    }

    pub fn coin(&self) -> Option<&str> {
        match self {
            SubscriptionKind::Candle { coin, .. } | SubscriptionKind::Trades { coin } => Some(coin),
            SubscriptionKind::UserFills { .. } | SubscriptionKind::AllMids => None,
        }
    }
}

/// Loosely-typed parameters as they arrive from the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_address: Option<String>,
}

impl SubscriptionParams {
    pub fn for_coin(coin: impl Into<String>) -> Self {
        Self {
            coin: Some(coin.into()),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.account_alias = Some(alias.into());
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.account_address = Some(address.into());
        self
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    /// Fill in the account and build the typed subscription
    ///
    /// The address comes from `user`, then `account_alias` through the
    /// store, then `account_address`. Every subscription needs one since
    /// it runs on that account's connection.
    pub fn resolve(&self, type_name: &str, store: &dyn AccountStore) -> Result<ResolvedSubscription> {
        let account = self.resolve_account(store)?;

        let kind = match type_name {
            "candle" => SubscriptionKind::Candle {
                coin: self.require_coin(type_name)?,
                interval: self
                    .interval
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CANDLE_INTERVAL.to_string()),
            },
            "userFills" => SubscriptionKind::UserFills {
                user: account.address.clone(),
            },
            "allMids" => SubscriptionKind::AllMids,
            "trades" => SubscriptionKind::Trades {
                coin: self.require_coin(type_name)?,
            },
            other => {
                return Err(Error::Config(format!(
                    "unsupported subscription type: {}",
                    other
                )))
            }
        };

        Ok(ResolvedSubscription { kind, account })
    }

    fn resolve_account(&self, store: &dyn AccountStore) -> Result<Account> {
        if let Some(user) = self.user.as_deref().filter(|u| !u.is_empty()) {
            return Ok(store
                .by_address(user)
                .unwrap_or_else(|| Account::watch_only(user)));
        }

        if let Some(alias) = self.account_alias.as_deref() {
            if let Some(account) = store.by_alias(alias) {
                return Ok(account);
            }
        }

        if let Some(address) = self.account_address.as_deref().filter(|a| !a.is_empty()) {
            return Ok(store
                .by_address(address)
                .unwrap_or_else(|| Account::watch_only(address)));
        }

        Err(Error::MissingAddress)
    }

    fn require_coin(&self, type_name: &str) -> Result<String> {
        self.coin
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Config(format!("{} subscription needs a coin", type_name)))
    }
}

/// A subscription with its account filled in
#[derive(Debug, Clone)]
pub struct ResolvedSubscription {
    pub kind: SubscriptionKind,
    pub account: Account,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Error,
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Inactive => "INACTIVE",
            SubscriptionStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Local record of one subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub kind: SubscriptionKind,
    pub params: SubscriptionParams,
    pub address: String,
    pub status: SubscriptionStatus,
    /// Correlation handle returned by the account's client
    pub subscription_id: Option<u64>,
    pub error_message: Option<String>,
    /// The other half of a strategy's candle/fills pair
    pub paired_with: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SubscriptionInfo {
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub error: usize,
}

impl SubscriptionStats {
    pub fn count<'a>(records: impl IntoIterator<Item = &'a SubscriptionInfo>) -> Self {
        let mut stats = Self::default();
        for info in records {
            stats.total += 1;
            match info.status {
                SubscriptionStatus::Active => stats.active += 1,
                SubscriptionStatus::Inactive => stats.inactive += 1,
                SubscriptionStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}
