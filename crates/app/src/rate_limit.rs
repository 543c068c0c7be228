use std::{net::SocketAddr, num::NonZeroU32, sync::Arc, time::Duration};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::{Clock, DefaultClock},
    middleware::NoOpMiddleware,
    state::keyed::DashMapStateStore,
    Quota,
};
use metrics::counter;
use tracing::{debug, warn};

use crate::problem::ProblemResponse;

const EXEMPT_PATHS: &[&str] = &["/api/billing/webhook"];
const PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub name: &'static str,
    pub prefix: &'static str,
    pub limit: u32,
    pub window: Duration,
}

const fn rule(name: &'static str, prefix: &'static str, limit: u32, minutes: u64) -> RateRule {
    RateRule {
        name,
        prefix,
        limit,
        window: Duration::from_secs(minutes * 60),
    }
}

pub const DEFAULT_RULES: &[RateRule] = &[
    rule("login", "/api/auth/login", 5, 15),
    rule("register", "/api/auth/register", 3, 60),
    rule("forgot_password", "/api/auth/forgot-password", 3, 60),
    rule("users", "/api/users", 100, 60),
    rule("api", "/api/", 1000, 60),
];

impl RateRule {
    /// `limit` requests per `window`, all of which may arrive at once.
    fn quota(&self) -> Option<Quota> {
        let burst = NonZeroU32::new(self.limit)?;
        Quota::with_period(self.window / self.limit).map(|quota| quota.allow_burst(burst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub rule: &'static str,
    pub retry_after: Duration,
}

type KeyedLimiter<C> = governor::RateLimiter<
    String,
    DashMapStateStore<String>,
    C,
    NoOpMiddleware<<C as Clock>::Instant>,
>;

struct RuleLimiter<C: Clock> {
    rule: RateRule,
    limiter: KeyedLimiter<C>,
}

/// GCRA limiter per rule, keyed by client address.
#[derive(Clone)]
pub struct RateLimiter<C: Clock = DefaultClock> {
    clock: C,
    rules: Arc<Vec<RuleLimiter<C>>>,
}

impl RateLimiter<DefaultClock> {
    pub fn new(rules: &[RateRule]) -> Self {
        Self::with_clock(rules, DefaultClock::default())
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(rules: &[RateRule], clock: C) -> Self {
        let mut rules: Vec<RuleLimiter<C>> = rules
            .iter()
            .filter_map(|rule| {
                let quota = rule.quota()?;
                Some(RuleLimiter {
                    rule: *rule,
                    limiter: governor::RateLimiter::dashmap_with_clock(quota, &clock),
                })
            })
            .collect();
        rules.sort_by(|a, b| b.rule.prefix.len().cmp(&a.rule.prefix.len()));
        Self {
            clock,
            rules: Arc::new(rules),
        }
    }

    fn limiter_for(&self, path: &str) -> Option<&RuleLimiter<C>> {
        self.rules
            .iter()
            .find(|entry| path.starts_with(entry.rule.prefix))
    }

    /// Longest matching prefix wins.
    pub fn rule_for(&self, path: &str) -> Option<&RateRule> {
        self.limiter_for(path).map(|entry| &entry.rule)
    }

    pub fn check(&self, client: &str, path: &str) -> Result<(), Rejection> {
        let Some(entry) = self.limiter_for(path) else {
            return Ok(());
        };

        if entry.limiter.len() > PRUNE_THRESHOLD {
            entry.limiter.retain_recent();
            debug!(
                stage = "auth",
                rule = entry.rule.name,
                remaining = entry.limiter.len(),
                "pruned rate limit keys"
            );
        }

        entry
            .limiter
            .check_key(&client.to_string())
            .map_err(|not_until| Rejection {
                rule: entry.rule.name,
                retry_after: not_until
                    .wait_time_from(self.clock.now())
                    .max(Duration::from_secs(1)),
            })
    }
}

impl Default for RateLimiter<DefaultClock> {
    fn default() -> Self {
        Self::new(DEFAULT_RULES)
    }
}

/// First `X-Forwarded-For` hop, then `X-Real-IP`, then the socket address.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header_value("x-real-ip") {
        return real_ip.to_string();
    }
    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn enforce(State(limiter): State<RateLimiter>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if request.method() == Method::OPTIONS || EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let client = client_ip(request.headers(), remote);

    match limiter.check(&client, path) {
        Ok(()) => next.run(request).await,
        Err(rejection) => {
            counter!("rate_limit_rejections_total", "rule" => rejection.rule).increment(1);
            warn!(stage = "auth", %client, rule = rejection.rule, "rate limit exceeded");
            let seconds = rejection.retry_after.as_secs_f64().ceil() as u64;
            let mut response = ProblemResponse::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("too many requests, retry in {seconds} seconds"),
            )
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}
