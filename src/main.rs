use std::sync::Arc;

use ses_proxy::alias::{AliasResolver, LibSqlAliasStore};
use ses_proxy::archive::FsArchive;
use ses_proxy::config::ProxyConfig;
use ses_proxy::dispatch::SmtpSender;
use ses_proxy::error::Result;
use ses_proxy::forwarder::Forwarder;
use ses_proxy::rules::{LibSqlRuleSets, RuleSet, RuleSetActivator};
use ses_proxy::server::{AppState, routes};
use ses_proxy::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ProxyConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("📬 ses-proxy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Identity: {}", config.from_email);
    eprintln!(
        "   Archive: {}/{} (under {})",
        config.archive_bucket,
        config.archive_prefix,
        config.archive_root.display()
    );
    eprintln!("   Rule set: {}", config.rule_set_name);
    eprintln!("   Inbound: http://0.0.0.0:{}/inbound\n", config.http_port);

    let store = Store::open_local(&config.db_path).await?;

    // Activation runs on every start, before anything is accepted.
    let rules = Arc::new(LibSqlRuleSets::new(store.connection()));
    let activator = RuleSetActivator::new(rules.clone());
    activator
        .apply(&RuleSet::desired(&config))
        .await
        .inspect_err(|e| {
            tracing::error!(rule_set = %config.rule_set_name, error = %e, "Rule set activation failed");
        })?;

    let aliases = LibSqlAliasStore::open(store.connection(), &config.alias_table).await?;
    let resolver = AliasResolver::new(
        Arc::new(aliases),
        config.allow_plus_sign,
        config.retry.clone(),
    );
    let archive = FsArchive::new(&config.archive_root, &config.archive_bucket);
    let sender = SmtpSender::new(&config.smtp)?;

    let forwarder = Arc::new(Forwarder::new(
        resolver,
        Arc::new(archive),
        Arc::new(sender),
        config.forwarder_settings(),
    ));

    let app = routes(AppState { forwarder, rules });
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Inbound server started");
    axum::serve(listener, app).await?;
    Ok(())
}
