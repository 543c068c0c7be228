use std::{fmt, str::FromStr};

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failed payments tolerated before an account is moved to past-due.
pub const MAX_FAILED_PAYMENTS: i64 = 3;
pub const GRACE_PERIOD_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Weekly,
    Monthly,
    Quarterly,
    SemiAnnual,
    Annual,
    OneTime,
}

impl BillingInterval {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Quarterly => "quarterly",
            Self::SemiAnnual => "semi_annual",
            Self::Annual => "annual",
            Self::OneTime => "one_time",
        }
    }

    /// End of the billing period starting at `from`. One-time plans never renew.
    pub fn advance(self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Weekly => from.checked_add_signed(Duration::days(7)),
            Self::Monthly => from.checked_add_months(Months::new(1)),
            Self::Quarterly => from.checked_add_months(Months::new(3)),
            Self::SemiAnnual => from.checked_add_months(Months::new(6)),
            Self::Annual => from.checked_add_months(Months::new(12)),
            Self::OneTime => None,
        }
    }
}

impl FromStr for BillingInterval {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "quarterly" => Ok(Self::Quarterly),
            "semi_annual" => Ok(Self::SemiAnnual),
            "annual" => Ok(Self::Annual),
            "one_time" => Ok(Self::OneTime),
            other => Err(BillingError::UnknownInterval(other.to_string())),
        }
    }
}

/// Checkout cadence chosen by the customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cadence {
    Monthly,
    Annual,
}

impl Cadence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl FromStr for Cadence {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "annual" => Ok(Self::Annual),
            other => Err(BillingError::InvalidCadence(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPlan {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub price_cents: i64,
    pub currency: String,
    pub billing_interval: BillingInterval,
    pub trial_period_days: i64,
    pub max_users: i64,
    pub max_projects: i64,
    pub max_storage_gb: i64,
    pub has_advanced_reporting: bool,
    pub has_api_access: bool,
    pub has_priority_support: bool,
    pub is_active: bool,
    pub is_public: bool,
    pub sort_order: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_price_id: Option<String>,
}

impl SubscriptionPlan {
    pub fn validate(&self) -> Result<(), BillingError> {
        if self.name.trim().is_empty() {
            return Err(BillingError::InvalidPlan("name is required"));
        }
        if self.price_cents < 0 {
            return Err(BillingError::InvalidPlan("price cannot be negative"));
        }
        if self.currency.len() != 3 || !self.currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(BillingError::InvalidPlan("currency must be a 3-letter code"));
        }
        if self.trial_period_days < 0 {
            return Err(BillingError::InvalidPlan("trial period cannot be negative"));
        }
        if self.max_users < 1 || self.max_projects < 0 || self.max_storage_gb < 0 {
            return Err(BillingError::InvalidPlan("limits must be non-negative"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Suspended,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = BillingError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "suspended" => Ok(Self::Suspended),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(BillingError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub billing_interval: BillingInterval,
    pub status: SubscriptionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_billing_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub failed_payment_attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_period_ends_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn start(id: String, user_id: &str, plan: &SubscriptionPlan, now: DateTime<Utc>) -> Self {
        let trial_ends_at =
            (plan.trial_period_days > 0).then(|| now + Duration::days(plan.trial_period_days));
        let current_period_end = plan.billing_interval.advance(now);
        Self {
            id,
            user_id: user_id.to_string(),
            plan_id: plan.id.clone(),
            billing_interval: plan.billing_interval,
            status: if trial_ends_at.is_some() {
                SubscriptionStatus::Trial
            } else {
                SubscriptionStatus::Active
            },
            started_at: now,
            trial_ends_at,
            current_period_start: now,
            current_period_end,
            next_billing_at: trial_ends_at.or(current_period_end),
            cancel_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            ended_at: None,
            failed_payment_attempts: 0,
            grace_period_ends_at: None,
            stripe_subscription_id: None,
            stripe_customer_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        )
    }

    pub fn is_in_trial(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Trial
            && self.trial_ends_at.map(|end| now < end).unwrap_or(false)
    }

    pub fn is_in_grace_period(&self, now: DateTime<Utc>) -> bool {
        self.grace_period_ends_at
            .map(|end| now < end)
            .unwrap_or(false)
    }

    /// Trial and active subscriptions grant their plan, past-due ones only while
    /// the grace period runs.
    pub fn grants_access(&self, now: DateTime<Utc>) -> bool {
        self.is_active()
            || (self.status == SubscriptionStatus::PastDue && self.is_in_grace_period(now))
    }

    /// Rolls the period forward after a successful charge.
    pub fn renew_period(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        if self.status.is_terminal() {
            return Err(BillingError::Terminal(self.status));
        }
        let start = self.current_period_end.unwrap_or(now).max(now);
        self.current_period_start = start;
        self.current_period_end = self.billing_interval.advance(start);
        self.next_billing_at = self.current_period_end;
        self.failed_payment_attempts = 0;
        self.grace_period_ends_at = None;
        if matches!(
            self.status,
            SubscriptionStatus::PastDue | SubscriptionStatus::Suspended | SubscriptionStatus::Trial
        ) {
            self.status = SubscriptionStatus::Active;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn record_failed_payment(&mut self, now: DateTime<Utc>) -> Result<(), BillingError> {
        if self.status.is_terminal() {
            return Err(BillingError::Terminal(self.status));
        }
        self.failed_payment_attempts += 1;
        if self.failed_payment_attempts >= MAX_FAILED_PAYMENTS {
            self.status = SubscriptionStatus::PastDue;
            self.grace_period_ends_at = Some(now + Duration::days(GRACE_PERIOD_DAYS));
        } else {
            self.status = SubscriptionStatus::Suspended;
        }
        self.updated_at = now;
        Ok(())
    }

    pub fn cancel(
        &mut self,
        at_period_end: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), BillingError> {
        if self.status.is_terminal() {
            return Err(BillingError::Terminal(self.status));
        }
        self.cancellation_reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());
        match (at_period_end, self.current_period_end) {
            (true, Some(period_end)) => {
                self.cancel_at = Some(period_end);
                self.next_billing_at = None;
            }
            _ => {
                self.status = SubscriptionStatus::Cancelled;
                self.cancelled_at = Some(now);
                self.ended_at = Some(now);
                self.cancel_at = None;
                self.next_billing_at = None;
            }
        }
        self.updated_at = now;
        Ok(())
    }

    /// Clears a pending cancellation or revives a lapsed subscription.
    pub fn reactivate(&mut self, now: DateTime<Utc>) {
        self.status = SubscriptionStatus::Active;
        self.cancel_at = None;
        self.cancelled_at = None;
        self.cancellation_reason = None;
        self.ended_at = None;
        self.failed_payment_attempts = 0;
        self.grace_period_ends_at = None;
        self.next_billing_at = self.current_period_end;
        self.updated_at = now;
    }

    /// Applies time-driven transitions. Returns `true` when anything changed.
    pub fn settle(&mut self, now: DateTime<Utc>) -> bool {
        let before = self.status;
        match self.status {
            SubscriptionStatus::Trial
                if self.trial_ends_at.map(|end| end <= now).unwrap_or(false) =>
            {
                self.status = SubscriptionStatus::Active;
                self.next_billing_at = self.current_period_end;
            }
            SubscriptionStatus::PastDue if !self.is_in_grace_period(now) => {
                self.status = SubscriptionStatus::Expired;
                self.ended_at = Some(now);
                self.next_billing_at = None;
            }
            _ => {}
        }
        if !self.status.is_terminal() && self.cancel_at.map(|at| at <= now).unwrap_or(false) {
            self.status = SubscriptionStatus::Cancelled;
            self.cancelled_at = Some(now);
            self.ended_at = Some(now);
            self.cancel_at = None;
            self.next_billing_at = None;
        }
        let changed = before != self.status;
        if changed {
            self.updated_at = now;
        }
        changed
    }
}

/// What the current account is allowed to use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlements {
    pub plan_id: Option<String>,
    pub plan_name: String,
    pub max_users: i64,
    pub max_projects: i64,
    pub max_storage_gb: i64,
    pub has_advanced_reporting: bool,
    pub has_api_access: bool,
    pub has_priority_support: bool,
    pub is_trial: bool,
}

/// Picks the subscription whose plan applies, newest first. A trial or active
/// subscription wins over a past-due one still inside its grace period.
pub fn entitled_subscription(
    subscriptions: &[Subscription],
    now: DateTime<Utc>,
) -> Option<&Subscription> {
    subscriptions
        .iter()
        .find(|subscription| subscription.is_active())
        .or_else(|| {
            subscriptions
                .iter()
                .find(|subscription| subscription.grants_access(now))
        })
}

impl Entitlements {
    pub fn free() -> Self {
        Self {
            plan_id: None,
            plan_name: "Free".to_string(),
            max_users: 1,
            max_projects: 3,
            max_storage_gb: 1,
            has_advanced_reporting: false,
            has_api_access: false,
            has_priority_support: false,
            is_trial: false,
        }
    }

    pub fn for_plan(plan: &SubscriptionPlan, subscription: &Subscription) -> Self {
        Self {
            plan_id: Some(plan.id.clone()),
            plan_name: plan.name.clone(),
            max_users: plan.max_users,
            max_projects: plan.max_projects,
            max_storage_gb: plan.max_storage_gb,
            has_advanced_reporting: plan.has_advanced_reporting,
            has_api_access: plan.has_api_access,
            has_priority_support: plan.has_priority_support,
            is_trial: subscription.status == SubscriptionStatus::Trial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("cadence must be 'monthly' or 'annual' (got '{0}')")]
    InvalidCadence(String),
    #[error("unknown billing interval {0}")]
    UnknownInterval(String),
    #[error("unknown subscription status {0}")]
    UnknownStatus(String),
    #[error("subscription is {0} and can no longer change")]
    Terminal(SubscriptionStatus),
    #[error("invalid plan: {0}")]
    InvalidPlan(&'static str),
}
