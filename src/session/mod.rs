// Subscription lifecycle and per-account contexts
pub mod accounts;
pub mod context;
pub mod manager;
pub mod subscription;

pub use accounts::{Account, AccountStore, StaticAccountStore};
pub use context::{
    check_equity, AccountContext, ContextFactory, ExchangeContextFactory, FatalErrorReporter, Feed,
    SharedStrategy, StrategyHandler,
};
pub use manager::{SessionManager, StrategySubscriptions};
pub use subscription::{
    ResolvedSubscription, SubscriptionInfo, SubscriptionKind, SubscriptionParams, SubscriptionStats,
    SubscriptionStatus,
};
