use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use thiserror::Error;

use stockflow_core::billing::{BillingError, Subscription, SubscriptionPlan};

use crate::{is_foreign_key_violation, is_unique_violation, opt_rfc3339, to_rfc3339};

const PLAN_COLUMNS: &str = "id, name, description, price_cents, currency, billing_interval, \
     trial_period_days, max_users, max_projects, max_storage_gb, has_advanced_reporting, \
     has_api_access, has_priority_support, is_active, is_public, sort_order, stripe_price_id";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, billing_interval, status, started_at, \
     trial_ends_at, current_period_start, current_period_end, next_billing_at, cancel_at, \
     cancelled_at, cancellation_reason, ended_at, failed_payment_attempts, grace_period_ends_at, \
     stripe_subscription_id, stripe_customer_id, created_at, updated_at";

/// Repository for the subscription plan catalog.
#[derive(Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    description: Option<String>,
    price_cents: i64,
    currency: String,
    billing_interval: String,
    trial_period_days: i64,
    max_users: i64,
    max_projects: i64,
    max_storage_gb: i64,
    has_advanced_reporting: bool,
    has_api_access: bool,
    has_priority_support: bool,
    is_active: bool,
    is_public: bool,
    sort_order: i64,
    stripe_price_id: Option<String>,
}

impl TryFrom<PlanRow> for SubscriptionPlan {
    type Error = BillingError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(SubscriptionPlan {
            id: row.id,
            name: row.name,
            description: row.description,
            price_cents: row.price_cents,
            currency: row.currency,
            billing_interval: row.billing_interval.parse()?,
            trial_period_days: row.trial_period_days,
            max_users: row.max_users,
            max_projects: row.max_projects,
            max_storage_gb: row.max_storage_gb,
            has_advanced_reporting: row.has_advanced_reporting,
            has_api_access: row.has_api_access,
            has_priority_support: row.has_priority_support,
            is_active: row.is_active,
            is_public: row.is_public,
            sort_order: row.sort_order,
            stripe_price_id: row.stripe_price_id,
        })
    }
}

impl PlanRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, plan: &SubscriptionPlan, now: DateTime<Utc>) -> Result<(), PlanError> {
        let stamp = to_rfc3339(now);
        let result = sqlx::query(&format!(
            "INSERT INTO subscription_plans ({PLAN_COLUMNS}, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price_cents)
        .bind(&plan.currency)
        .bind(plan.billing_interval.as_str())
        .bind(plan.trial_period_days)
        .bind(plan.max_users)
        .bind(plan.max_projects)
        .bind(plan.max_storage_gb)
        .bind(plan.has_advanced_reporting)
        .bind(plan.has_api_access)
        .bind(plan.has_priority_support)
        .bind(plan.is_active)
        .bind(plan.is_public)
        .bind(plan.sort_order)
        .bind(&plan.stripe_price_id)
        .bind(&stamp)
        .bind(&stamp)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(PlanError::Duplicate),
            Err(err) => Err(PlanError::Database(err)),
        }
    }

    pub async fn find(&self, id: &str) -> Result<Option<SubscriptionPlan>, PlanError> {
        let row = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionPlan::try_from)
            .transpose()
            .map_err(PlanError::Corrupt)
    }

    /// Plans offered on the pricing page, cheapest first within the same sort order.
    pub async fn list_public_active(&self) -> Result<Vec<SubscriptionPlan>, PlanError> {
        let rows = sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM subscription_plans \
             WHERE is_active = 1 AND is_public = 1 \
             ORDER BY sort_order, price_cents, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(SubscriptionPlan::try_from)
            .collect::<Result<_, _>>()
            .map_err(PlanError::Corrupt)
    }
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("a plan with this id or name already exists")]
    Duplicate,
    #[error("stored plan is invalid: {0}")]
    Corrupt(BillingError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for customer subscriptions.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    plan_id: String,
    billing_interval: String,
    status: String,
    started_at: DateTime<Utc>,
    trial_ends_at: Option<DateTime<Utc>>,
    current_period_start: DateTime<Utc>,
    current_period_end: Option<DateTime<Utc>>,
    next_billing_at: Option<DateTime<Utc>>,
    cancel_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    cancellation_reason: Option<String>,
    ended_at: Option<DateTime<Utc>>,
    failed_payment_attempts: i64,
    grace_period_ends_at: Option<DateTime<Utc>>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            billing_interval: row.billing_interval.parse()?,
            status: row.status.parse()?,
            started_at: row.started_at,
            trial_ends_at: row.trial_ends_at,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            next_billing_at: row.next_billing_at,
            cancel_at: row.cancel_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            ended_at: row.ended_at,
            failed_payment_attempts: row.failed_payment_attempts,
            grace_period_ends_at: row.grace_period_ends_at,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl SubscriptionRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, subscription: &Subscription) -> Result<(), SubscriptionError> {
        let result = sqlx::query(&format!(
            "INSERT INTO subscriptions ({SUBSCRIPTION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.plan_id)
        .bind(subscription.billing_interval.as_str())
        .bind(subscription.status.as_str())
        .bind(to_rfc3339(subscription.started_at))
        .bind(opt_rfc3339(subscription.trial_ends_at))
        .bind(to_rfc3339(subscription.current_period_start))
        .bind(opt_rfc3339(subscription.current_period_end))
        .bind(opt_rfc3339(subscription.next_billing_at))
        .bind(opt_rfc3339(subscription.cancel_at))
        .bind(opt_rfc3339(subscription.cancelled_at))
        .bind(&subscription.cancellation_reason)
        .bind(opt_rfc3339(subscription.ended_at))
        .bind(subscription.failed_payment_attempts)
        .bind(opt_rfc3339(subscription.grace_period_ends_at))
        .bind(&subscription.stripe_subscription_id)
        .bind(&subscription.stripe_customer_id)
        .bind(to_rfc3339(subscription.created_at))
        .bind(to_rfc3339(subscription.updated_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(SubscriptionError::Duplicate),
            Err(err) if is_foreign_key_violation(&err) => Err(SubscriptionError::MissingReference),
            Err(err) => Err(SubscriptionError::Database(err)),
        }
    }

    pub async fn find(&self, id: &str) -> Result<Option<Subscription>, SubscriptionError> {
        self.fetch_one_where("id = ?", id).await
    }

    pub async fn find_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        self.fetch_one_where("stripe_subscription_id = ?", stripe_subscription_id)
            .await
    }

    /// Trial, active and past-due subscriptions, newest first. Which of them
    /// still grants access depends on the clock, so the caller decides.
    pub async fn access_candidates_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = ? AND status IN ('trial', 'active', 'past_due') \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Subscription>, SubscriptionError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE user_id = ? ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    /// Persists every mutable field of the subscription.
    pub async fn update(&self, subscription: &Subscription) -> Result<(), SubscriptionError> {
        let result = sqlx::query(
            "UPDATE subscriptions SET status = ?, trial_ends_at = ?, current_period_start = ?, \
             current_period_end = ?, next_billing_at = ?, cancel_at = ?, cancelled_at = ?, \
             cancellation_reason = ?, ended_at = ?, failed_payment_attempts = ?, \
             grace_period_ends_at = ?, stripe_subscription_id = ?, stripe_customer_id = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(subscription.status.as_str())
        .bind(opt_rfc3339(subscription.trial_ends_at))
        .bind(to_rfc3339(subscription.current_period_start))
        .bind(opt_rfc3339(subscription.current_period_end))
        .bind(opt_rfc3339(subscription.next_billing_at))
        .bind(opt_rfc3339(subscription.cancel_at))
        .bind(opt_rfc3339(subscription.cancelled_at))
        .bind(&subscription.cancellation_reason)
        .bind(opt_rfc3339(subscription.ended_at))
        .bind(subscription.failed_payment_attempts)
        .bind(opt_rfc3339(subscription.grace_period_ends_at))
        .bind(&subscription.stripe_subscription_id)
        .bind(&subscription.stripe_customer_id)
        .bind(to_rfc3339(subscription.updated_at))
        .bind(&subscription.id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Err(SubscriptionError::NotFound),
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(SubscriptionError::Duplicate),
            Err(err) => Err(SubscriptionError::Database(err)),
        }
    }

    /// Non-terminal subscriptions with a lifecycle deadline at or before `now`.
    pub async fn list_unsettled(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Subscription>, SubscriptionError> {
        let stamp = to_rfc3339(now);
        let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions \
             WHERE status NOT IN ('cancelled', 'expired') AND ( \
                   (status = 'trial' AND trial_ends_at <= ?) \
                OR (status = 'past_due' AND (grace_period_ends_at IS NULL OR grace_period_ends_at <= ?)) \
                OR cancel_at <= ?) \
             ORDER BY id LIMIT ?"
        ))
        .bind(&stamp)
        .bind(&stamp)
        .bind(&stamp)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<Subscription>, SubscriptionError> {
        let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE {clause}"
        ))
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from)
            .transpose()
            .map_err(SubscriptionError::Corrupt)
    }
}

fn collect(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>, SubscriptionError> {
    rows.into_iter()
        .map(Subscription::try_from)
        .collect::<Result<_, _>>()
        .map_err(SubscriptionError::Corrupt)
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("subscription not found")]
    NotFound,
    #[error("stripe subscription is already linked")]
    Duplicate,
    #[error("user or plan does not exist")]
    MissingReference,
    #[error("stored subscription is invalid: {0}")]
    Corrupt(BillingError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
