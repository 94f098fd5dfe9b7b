use std::sync::Arc;

use clap::Parser;
use warden_core::engine::CancelToken;
use warden_core::tuple::TenantId;
use warden_service::cli::{Cli, Command};
use warden_service::config::{AppConfig, LogFormat};
use warden_service::fixture::Fixture;
use warden_service::service::{CheckInput, ExpandInput, LookupSchemaInput, PermissionService};
use warden_storage::InMemoryStoreFactory;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

type Service = PermissionService<InMemoryStoreFactory>;

fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));

    // stdout carries command output.
    let registry = tracing_subscriber::registry().with(filter);

    match config.log.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .pretty()
                .with_writer(std::io::stderr);
            registry.with(fmt_layer).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let service = PermissionService::new(
        Arc::new(InMemoryStoreFactory::new()),
        config.to_engine_config(),
        config.to_schema_limits(),
    )
    .with_depth_policy(config.to_depth_policy())
    .with_timeout(config.timeout());

    let tenant_id = TenantId::new(uuid::Uuid::nil());
    let fixture = Fixture::load(cli.command.fixture())?;
    fixture.install(&service, &tenant_id).await?;

    let (handle, cancel) = CancelToken::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT, cancelling");
            handle.cancel();
        }
    });

    match cli.command {
        Command::Check {
            entity,
            permission,
            subject,
            depth,
            ..
        } => {
            let input = CheckInput {
                depth,
                ..CheckInput::new(entity, permission, subject)
            };
            run_check(&service, &tenant_id, input, cancel).await
        }
        Command::Expand {
            entity,
            permission,
            depth,
            ..
        } => {
            let input = ExpandInput {
                depth,
                ..ExpandInput::new(entity, permission)
            };
            run_expand(&service, &tenant_id, input, cancel).await
        }
        Command::LookupSchema {
            entity_type,
            relations,
            ..
        } => {
            let input = LookupSchemaInput {
                entity_type,
                relations,
                schema_version: None,
            };
            let permissions = service.lookup_schema(&tenant_id, input).await?;
            println!("{}", serde_json::to_string_pretty(&permissions)?);
            Ok(())
        }
        Command::Validate { .. } => run_validate(&service, &tenant_id, &fixture, &cancel).await,
    }
}

async fn run_check(
    service: &Service,
    tenant_id: &TenantId,
    input: CheckInput,
    cancel: CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = service.check_cancellable(tenant_id, input, cancel).await?;
    let report = serde_json::json!({
        "allowed": output.allowed,
        "remaining_depth": output.remaining_depth,
        "check_count": output.check_count,
        "snapshot": output.snapshot.value(),
        "schema_version": output.schema_version.value(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_expand(
    service: &Service,
    tenant_id: &TenantId,
    input: ExpandInput,
    cancel: CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let output = service.expand_cancellable(tenant_id, input, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&output.tree)?);
    Ok(())
}

async fn run_validate(
    service: &Service,
    tenant_id: &TenantId,
    fixture: &Fixture,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let outcomes = fixture.verify(service, tenant_id, cancel).await?;
    let failed = outcomes.iter().filter(|o| !o.passed()).count();

    for outcome in &outcomes {
        let status = if outcome.passed() { "PASS" } else { "FAIL" };
        println!("{status} {}", outcome.assertion);
    }
    tracing::info!(total = outcomes.len(), failed, "assertions evaluated");

    if failed > 0 {
        return Err(format!("{failed} of {} assertions failed", outcomes.len()).into());
    }
    Ok(())
}
