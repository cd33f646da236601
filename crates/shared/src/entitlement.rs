//! Entitlement derivation
//!
//! Answers "what is this user allowed to do right now?" from the plan catalog
//! and a (possibly cached) subscription record. This is a pure function of its
//! inputs and never fails: anything unexpected degrades to the free plan.
//!
//! Client-side results are advisory only. Privileged actions are re-checked on
//! the server against the persisted row.

use serde::{Deserialize, Serialize};

use crate::plans::{Plan, PlanCatalog, UsageLimits};
use crate::types::{SubscriptionRecord, SubscriptionStatus};

/// What determined the entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    /// Active or trialing subscription
    Subscription,
    /// No subscription, or one that no longer grants access
    Default,
}

/// The features and limits a user currently has
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub plan_id: String,
    pub plan_name: String,
    pub source: EntitlementSource,
    pub status: Option<SubscriptionStatus>,
    pub is_subscribed: bool,
    pub cancel_at_period_end: bool,
    pub features: Vec<String>,
    /// Static plan ceilings, not live consumption counters
    pub limits: UsageLimits,
}

impl Entitlement {
    /// Derive the entitlement for an optional subscription record
    pub fn derive(catalog: &PlanCatalog, subscription: Option<&SubscriptionRecord>) -> Self {
        let plan = current_plan(catalog, subscription);
        let is_subscribed = is_subscribed(subscription);

        Self {
            plan_id: plan.id.clone(),
            plan_name: plan.name.clone(),
            source: if is_subscribed && !plan.is_free() {
                EntitlementSource::Subscription
            } else {
                EntitlementSource::Default
            },
            status: subscription.map(|s| s.status),
            is_subscribed,
            cancel_at_period_end: subscription.is_some_and(|s| s.cancel_at_period_end),
            features: plan.features.clone(),
            limits: plan.limits,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// True iff the subscription is active or trialing
pub fn is_subscribed(subscription: Option<&SubscriptionRecord>) -> bool {
    subscription.is_some_and(|s| s.status.grants_access())
}

/// The plan the user is currently entitled to.
///
/// Only an active or trialing subscription selects its plan; a canceled, past
/// due or otherwise lapsed subscription, or a plan id missing from the catalog,
/// yields the free plan.
pub fn current_plan<'a>(
    catalog: &'a PlanCatalog,
    subscription: Option<&SubscriptionRecord>,
) -> &'a Plan {
    subscription
        .filter(|s| s.status.grants_access())
        .and_then(|s| catalog.get_plan_by_id(&s.plan_id))
        .unwrap_or_else(|| catalog.free_plan())
}

/// Usage ceilings for the current plan
pub fn remaining_usage(
    catalog: &PlanCatalog,
    subscription: Option<&SubscriptionRecord>,
) -> UsageLimits {
    current_plan(catalog, subscription).limits
}
