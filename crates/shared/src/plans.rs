//! Subscription plan catalog
//!
//! Static registry of PrepBuddy plans. Plans never change at runtime; the only
//! configurable part is the processor price id attached to each paid plan.
//!
//! Invariants (checked by [`PlanCatalog::validate`]):
//! - exactly one plan has a zero price, and its id is `free`
//! - every paid plan carries a processor price id
//! - plan ids and price ids are unique

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::SharedError;

/// Id of the zero-price plan every user falls back to
pub const FREE_PLAN_ID: &str = "free";

/// Billing interval of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Month,
    Year,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Month => "month",
            Self::Year => "year",
        }
    }
}

impl std::str::FromStr for BillingPeriod {
    type Err = SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "month" | "monthly" => Ok(Self::Month),
            "year" | "yearly" | "annual" => Ok(Self::Year),
            _ => Err(SharedError::UnknownBillingPeriod(s.to_string())),
        }
    }
}

// =============================================================================
// Usage Limits
// =============================================================================

/// A per-resource ceiling: a fixed count or unlimited.
///
/// On the wire this is either an integer or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageLimit {
    Limited(u32),
    Unlimited,
}

impl UsageLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Whether `used` more units still fit under this limit
    pub fn allows(&self, used: u32) -> bool {
        match self {
            Self::Limited(max) => used < *max,
            Self::Unlimited => true,
        }
    }
}

impl std::fmt::Display for UsageLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{}", n),
            Self::Unlimited => write!(f, "unlimited"),
        }
    }
}

impl Serialize for UsageLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Limited(n) => serializer.serialize_u32(*n),
            Self::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for UsageLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u32),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => Ok(Self::Limited(n)),
            Raw::Text(s) if s.eq_ignore_ascii_case("unlimited") => Ok(Self::Unlimited),
            Raw::Text(s) => Err(serde::de::Error::custom(SharedError::InvalidUsageLimit(s))),
        }
    }
}

/// Usage ceilings for each metered resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    /// AI-generated study plans per billing period
    pub study_plans: UsageLimit,
    /// Quizzes generated per billing period
    pub quizzes: UsageLimit,
    /// Documents uploaded per billing period
    pub document_uploads: UsageLimit,
    /// Follow-up questions to the AI tutor per billing period
    pub ai_questions: UsageLimit,
}

// =============================================================================
// Plans
// =============================================================================

/// A named tier of feature access and usage ceilings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    /// Price in minor currency units (cents)
    pub price: i64,
    pub currency: String,
    pub interval: BillingPeriod,
    /// Processor price id; `None` only for the free plan
    pub price_id: Option<String>,
    pub features: Vec<String>,
    pub limits: UsageLimits,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.price == 0
    }

    /// Display price, e.g. `$9.99`
    pub fn display_price(&self) -> String {
        format_price(self.price, &self.currency)
    }

    fn free() -> Self {
        Self {
            id: FREE_PLAN_ID.to_string(),
            name: "Free".to_string(),
            price: 0,
            currency: "usd".to_string(),
            interval: BillingPeriod::Month,
            price_id: None,
            features: vec![
                "3 AI study plans per month".to_string(),
                "5 quizzes per month".to_string(),
                "Upload up to 3 documents".to_string(),
                "Task tracking".to_string(),
            ],
            limits: UsageLimits {
                study_plans: UsageLimit::Limited(3),
                quizzes: UsageLimit::Limited(5),
                document_uploads: UsageLimit::Limited(3),
                ai_questions: UsageLimit::Limited(20),
            },
        }
    }

    fn pro(id: &str, price: i64, interval: BillingPeriod, price_id: &str) -> Self {
        let name = match interval {
            BillingPeriod::Month => "Pro",
            BillingPeriod::Year => "Pro (Annual)",
        };
        Self {
            id: id.to_string(),
            name: name.to_string(),
            price,
            currency: "usd".to_string(),
            interval,
            price_id: Some(price_id.to_string()),
            features: vec![
                "50 AI study plans per month".to_string(),
                "Unlimited quizzes".to_string(),
                "Upload up to 100 documents".to_string(),
                "Progress analytics".to_string(),
                "Priority generation queue".to_string(),
            ],
            limits: UsageLimits {
                study_plans: UsageLimit::Limited(50),
                quizzes: UsageLimit::Unlimited,
                document_uploads: UsageLimit::Limited(100),
                ai_questions: UsageLimit::Limited(500),
            },
        }
    }

    fn premium(price_id: &str) -> Self {
        Self {
            id: "premium".to_string(),
            name: "Premium".to_string(),
            price: 1999,
            currency: "usd".to_string(),
            interval: BillingPeriod::Month,
            price_id: Some(price_id.to_string()),
            features: vec![
                "Unlimited AI study plans".to_string(),
                "Unlimited quizzes".to_string(),
                "Unlimited document uploads".to_string(),
                "Progress analytics".to_string(),
                "Priority generation queue".to_string(),
                "Unlimited AI tutor questions".to_string(),
            ],
            limits: UsageLimits {
                study_plans: UsageLimit::Unlimited,
                quizzes: UsageLimit::Unlimited,
                document_uploads: UsageLimit::Unlimited,
                ai_questions: UsageLimit::Unlimited,
            },
        }
    }
}

/// Processor price ids for the paid plans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceIds {
    pub pro: String,
    pub pro_annual: String,
    pub premium: String,
}

impl Default for PriceIds {
    fn default() -> Self {
        Self {
            pro: "price_prepbuddy_pro_monthly".to_string(),
            pro_annual: "price_prepbuddy_pro_annual".to_string(),
            premium: "price_prepbuddy_premium_monthly".to_string(),
        }
    }
}

impl PriceIds {
    /// Read price ids from the environment, keeping defaults for unset values
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pro: std::env::var("STRIPE_PRICE_PRO").unwrap_or(defaults.pro),
            pro_annual: std::env::var("STRIPE_PRICE_PRO_ANNUAL").unwrap_or(defaults.pro_annual),
            premium: std::env::var("STRIPE_PRICE_PREMIUM").unwrap_or(defaults.premium),
        }
    }
}

/// The full set of plans, ordered cheapest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl Default for PlanCatalog {
    fn default() -> Self {
        Self::new(PriceIds::default())
    }
}

impl PlanCatalog {
    pub fn new(price_ids: PriceIds) -> Self {
        Self {
            plans: vec![
                Plan::free(),
                Plan::pro("pro", 999, BillingPeriod::Month, &price_ids.pro),
                Plan::premium(&price_ids.premium),
                Plan::pro("pro_annual", 9999, BillingPeriod::Year, &price_ids.pro_annual),
            ],
        }
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn paid_plans(&self) -> impl Iterator<Item = &Plan> {
        self.plans.iter().filter(|p| !p.is_free())
    }

    pub fn get_plan_by_id(&self, id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.id == id)
    }

    /// The zero-price plan. Falls back to the first plan if the catalog was
    /// built without one, which [`PlanCatalog::validate`] reports.
    pub fn free_plan(&self) -> &Plan {
        self.plans
            .iter()
            .find(|p| p.is_free())
            .unwrap_or(&self.plans[0])
    }

    pub fn plan_for_price_id(&self, price_id: &str) -> Option<&Plan> {
        self.plans
            .iter()
            .find(|p| p.price_id.as_deref() == Some(price_id))
    }

    /// Map a processor price id to a plan id.
    ///
    /// Unknown price ids map to the free plan so a misconfigured price can
    /// never grant paid entitlements.
    pub fn plan_id_for_price_or_free(&self, price_id: Option<&str>) -> &str {
        match price_id.and_then(|id| self.plan_for_price_id(id)) {
            Some(plan) => &plan.id,
            None => {
                tracing::warn!(
                    price_id = ?price_id,
                    "Unmapped processor price id, falling back to free plan"
                );
                &self.free_plan().id
            }
        }
    }

    /// Check the catalog invariants, returning one message per violation
    pub fn validate(&self) -> Vec<String> {
        let mut violations = Vec::new();

        let free: Vec<_> = self.plans.iter().filter(|p| p.is_free()).collect();
        if free.len() != 1 {
            violations.push(format!("expected exactly one free plan, found {}", free.len()));
        }
        if let Some(plan) = free.first() {
            if plan.id != FREE_PLAN_ID {
                violations.push(format!("free plan has id {:?}", plan.id));
            }
        }

        let mut ids = HashSet::new();
        let mut price_ids = HashSet::new();
        for plan in &self.plans {
            if plan.price < 0 {
                violations.push(format!("plan {} has a negative price", plan.id));
            }
            if !ids.insert(plan.id.as_str()) {
                violations.push(format!("duplicate plan id {}", plan.id));
            }
            match plan.price_id.as_deref() {
                Some(price_id) if !price_id.is_empty() => {
                    if !price_ids.insert(price_id) {
                        violations.push(format!("duplicate price id {}", price_id));
                    }
                }
                _ if !plan.is_free() => {
                    violations.push(format!("paid plan {} has no price id", plan.id));
                }
                _ => {}
            }
        }

        violations
    }
}

// =============================================================================
// Price Formatting
// =============================================================================

fn currency_symbol(code: &str) -> Option<&'static str> {
    match code {
        "usd" => Some("$"),
        "eur" => Some("€"),
        "gbp" => Some("£"),
        "inr" => Some("₹"),
        "cad" => Some("CA$"),
        "aud" => Some("A$"),
        "jpy" => Some("¥"),
        _ => None,
    }
}

fn group_thousands(whole: u64) -> String {
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Format an amount in minor units for display, e.g. `format_price(999, "usd")`
/// gives `"$9.99"`.
pub fn format_price(amount_minor: i64, currency: &str) -> String {
    let code = currency.to_lowercase();
    let abs = amount_minor.unsigned_abs();
    let sign = if amount_minor < 0 { "-" } else { "" };
    let amount = format!("{}.{:02}", group_thousands(abs / 100), abs % 100);

    match currency_symbol(&code) {
        Some(symbol) => format!("{}{}{}", sign, symbol, amount),
        None => format!("{}{} {}", sign, amount, code.to_uppercase()),
    }
}
