use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, info, warn};

use super::accounts::{Account, AccountStore};
use super::context::{AccountContext, ContextFactory, FatalErrorReporter};
use super::subscription::{
    ResolvedSubscription, SubscriptionInfo, SubscriptionKind, SubscriptionParams, SubscriptionStats,
    SubscriptionStatus,
};
use crate::error::{Error, Result};

const ID_PREFIX: &str = "sub_";

/// Ids of a strategy's paired candle and fill subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategySubscriptions {
    pub candle: String,
    pub user_fills: String,
}

/// Subscription table, shared with the fatal error reporters
#[derive(Default)]
struct SubscriptionTable {
    records: Mutex<BTreeMap<u64, SubscriptionInfo>>,
}

impl SubscriptionTable {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, SubscriptionInfo>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn mark_account_error(&self, address: &str, message: &str) -> usize {
        let mut records = self.lock();
        let mut marked = 0;
        for info in records.values_mut().filter(|i| i.address.eq_ignore_ascii_case(address)) {
            info.status = SubscriptionStatus::Error;
            info.error_message = Some(message.to_string());
            marked += 1;
        }
        marked
    }
}

/// Owns every subscription and the per-account contexts behind them
///
/// Contexts are created on the first subscription for an address and are
/// never evicted; removing the last subscription of an account leaves its
/// connection and strategy running.
pub struct SessionManager {
    factory: Arc<dyn ContextFactory>,
    accounts: Arc<dyn AccountStore>,
    table: Arc<SubscriptionTable>,
    contexts: tokio::sync::Mutex<HashMap<String, Arc<AccountContext>>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(factory: Arc<dyn ContextFactory>, accounts: Arc<dyn AccountStore>) -> Self {
        Self {
            factory,
            accounts,
            table: Arc::new(SubscriptionTable::default()),
            contexts: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe on the owning account's connection
    ///
    /// Returns the new subscription id. Fatal errors (unresolvable address,
    /// zero equity, bad credentials) are returned; a transient failure is
    /// recorded on the subscription as `ERROR` instead.
    pub async fn add_subscription(&self, type_name: &str, params: SubscriptionParams) -> Result<String> {
        let resolved = params.resolve(type_name, self.accounts.as_ref())?;
        self.add_resolved(resolved, params, None).await
    }

    /// Register a strategy's candle and fill subscriptions as one pair
    ///
    /// If the second half cannot be added the first is removed again.
    pub async fn add_strategy_subscriptions(&self, params: SubscriptionParams) -> Result<StrategySubscriptions> {
        let candle = params.resolve("candle", self.accounts.as_ref())?;
        let fills = params.resolve("userFills", self.accounts.as_ref())?;

        let candle_id = self.add_resolved(candle, params.clone(), None).await?;
        let fills_id = match self.add_resolved(fills, params, Some(candle_id.clone())).await {
            Ok(id) => id,
            Err(e) => {
                self.remove_subscription(&candle_id).await;
                return Err(e);
            }
        };

        if let Some(n) = parse_id(&candle_id) {
            if let Some(info) = self.table.lock().get_mut(&n) {
                info.paired_with = Some(fills_id.clone());
            }
        }

        info!(candle = %candle_id, fills = %fills_id, "🔗 Strategy subscriptions added");
        Ok(StrategySubscriptions {
            candle: candle_id,
            user_fills: fills_id,
        })
    }

    async fn add_resolved(
        &self,
        resolved: ResolvedSubscription,
        params: SubscriptionParams,
        paired_with: Option<String>,
    ) -> Result<String> {
        let ResolvedSubscription { kind, account } = resolved;

        let (status, subscription_id, error_message) = match self.context_for(&account, kind.coin()).await {
            Ok(context) => match self.subscribe_on(&context, &kind).await {
                Ok(handle) => (SubscriptionStatus::Active, Some(handle), None),
                Err(e) => {
                    error!(address = %account.address, kind = kind.type_name(), "Subscribe failed: {}", e);
                    (SubscriptionStatus::Error, None, Some(e.to_string()))
                }
            },
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(address = %account.address, "Account context unavailable: {}", e);
                (SubscriptionStatus::Error, None, Some(e.to_string()))
            }
        };

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}{}", ID_PREFIX, n);
        info!(id = %id, kind = kind.type_name(), address = %account.address, status = %status, "Subscription added");

        self.table.lock().insert(
            n,
            SubscriptionInfo {
                id: id.clone(),
                kind,
                params,
                address: account.address,
                status,
                subscription_id,
                error_message,
                paired_with,
                created_at: Utc::now(),
            },
        );

        Ok(id)
    }

    /// Every subscribed channel feeds the account's strategy; one it cannot
    /// handle fails fatally on the first frame and marks the account `ERROR`
    async fn subscribe_on(&self, context: &AccountContext, kind: &SubscriptionKind) -> Result<u64> {
        let wire = kind.to_wire()?;
        if !context.route_to_strategy(kind.type_name()) && kind.feeds_strategy() {
            warn!(address = %context.address, kind = kind.type_name(), "Account has no strategy, frames will only be logged");
        }
        context.feed.subscribe(wire).await
    }

    /// The account's context, created on first use
    ///
    /// The registry lock is held across creation so concurrent callers for
    /// the same address share one context.
    async fn context_for(&self, account: &Account, coin: Option<&str>) -> Result<Arc<AccountContext>> {
        let key = account.address.to_lowercase();
        let mut contexts = self.contexts.lock().await;

        if let Some(context) = contexts.get(&key) {
            return Ok(context.clone());
        }

        info!(address = %account.address, alias = %account.alias, "Creating account context");
        let context = Arc::new(self.factory.create(account, coin, self.fatal_reporter()).await?);
        contexts.insert(key, context.clone());
        Ok(context)
    }

    fn fatal_reporter(&self) -> FatalErrorReporter {
        let table: Weak<SubscriptionTable> = Arc::downgrade(&self.table);
        Arc::new(move |address: &str, err: &Error| {
            if let Some(table) = table.upgrade() {
                let marked = table.mark_account_error(address, &err.to_string());
                warn!(address = %address, marked, "Subscriptions marked ERROR after fatal strategy error");
            }
        })
    }

    /// Unsubscribe and forget `id`; `false` when unknown or the unsubscribe failed
    pub async fn remove_subscription(&self, id: &str) -> bool {
        let Some(info) = self.get(id) else {
            warn!(id = %id, "Subscription not found");
            return false;
        };

        if let Some(handle) = info.subscription_id {
            let context = self
                .contexts
                .lock()
                .await
                .get(&info.address.to_lowercase())
                .cloned();

            if let Some(context) = context {
                if let Err(e) = context.feed.unsubscribe(handle).await {
                    error!(id = %id, "Unsubscribe failed: {}", e);
                    self.update_status(id, SubscriptionStatus::Error, Some(e.to_string()));
                    return false;
                }
            }
        }

        if let Some(n) = parse_id(id) {
            self.table.lock().remove(&n);
        }
        info!(id = %id, kind = info.type_name(), "Subscription removed");
        true
    }

    /// Remove both halves of a strategy pair; `true` only if both went
    pub async fn remove_strategy_subscriptions(&self, pair: &StrategySubscriptions) -> bool {
        let fills = self.remove_subscription(&pair.user_fills).await;
        let candle = self.remove_subscription(&pair.candle).await;
        fills && candle
    }

    pub fn get(&self, id: &str) -> Option<SubscriptionInfo> {
        let n = parse_id(id)?;
        self.table.lock().get(&n).cloned()
    }

    /// Every subscription, oldest first
    pub fn list_all(&self) -> Vec<SubscriptionInfo> {
        self.table.lock().values().cloned().collect()
    }

    pub fn list_active(&self) -> Vec<SubscriptionInfo> {
        self.table
            .lock()
            .values()
            .filter(|i| i.is_active())
            .cloned()
            .collect()
    }

    pub fn list_by_type(&self, type_name: &str) -> Vec<SubscriptionInfo> {
        self.table
            .lock()
            .values()
            .filter(|i| i.type_name() == type_name)
            .cloned()
            .collect()
    }

    pub fn update_status(&self, id: &str, status: SubscriptionStatus, message: Option<String>) -> bool {
        let Some(n) = parse_id(id) else {
            return false;
        };
        match self.table.lock().get_mut(&n) {
            Some(info) => {
                debug!(id = %id, from = %info.status, to = %status, "Subscription status updated");
                info.status = status;
                info.error_message = message;
                true
            }
            None => false,
        }
    }

    /// Best effort removal of everything; returns how many were removed
    pub async fn clear_all(&self) -> usize {
        let ids: Vec<String> = self.list_all().into_iter().map(|i| i.id).collect();
        let mut removed = 0;
        for id in &ids {
            if self.remove_subscription(id).await {
                removed += 1;
            }
        }
        info!(removed, total = ids.len(), "🧹 Cleared subscriptions");
        removed
    }

    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats::count(self.table.lock().values())
    }

    /// Whether any account's connection is open
    pub async fn is_any_connected(&self) -> bool {
        self.contexts.lock().await.values().any(|c| c.feed.is_open())
    }

    pub async fn context_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Close every account connection; used on process exit
    pub async fn shutdown(&self) {
        let contexts: Vec<Arc<AccountContext>> = self.contexts.lock().await.values().cloned().collect();
        for context in contexts {
            context.shutdown().await;
        }
    }
}

fn parse_id(id: &str) -> Option<u64> {
    id.strip_prefix(ID_PREFIX)?.parse().ok()
}
