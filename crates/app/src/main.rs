mod account;
mod audit;
mod auth;
mod billing;
mod invoices;
mod mailer;
mod maintenance;
mod notifications;
mod notifier;
mod passwords;
mod problem;
mod products;
mod rate_limit;
mod roles;
mod router;
mod sse;
mod telemetry;
#[cfg(test)]
mod test_support;
mod users;
mod verification;
mod webhook;

use std::net::SocketAddr;

use chrono::Utc;
use tracing::{info, warn};

use stockflow_core::roles::RoleDefinition;
use stockflow_storage::Database;
use stockflow_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    let seeded = database
        .roles()
        .ensure_system_roles(&RoleDefinition::system_defaults(), Utc::now())
        .await?;
    info!(stage = "storage", seeded, "system roles ready");

    match &config.auth.bootstrap_admin {
        Some(admin) => {
            account::bootstrap_admin(&database, admin, Utc::now()).await?;
        }
        None => warn!(stage = "auth", "ADMIN_EMAIL not set; skipping admin bootstrap"),
    }

    let mailer = mailer::build_mailer(&config.smtp)?;
    let stripe = billing::build_stripe_client(&config.stripe)?;
    if stripe.is_none() {
        info!(stage = "billing", "Stripe checkout disabled");
    }

    let audit_hub = audit::AuditHub::new();
    let state = router::AppState::new(
        &config,
        metrics,
        audit_hub.clone(),
        database.clone(),
        mailer,
        stripe,
    );

    maintenance::MaintenanceWorker::new(
        database,
        state.verification().clone(),
        audit_hub,
        state.notifier().clone(),
    )
    .spawn();

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router::app_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|err| err.into())
}
