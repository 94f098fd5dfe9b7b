#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use warden_core::engine::EngineConfig;
use warden_core::schema::SchemaLimits;
use warden_core::tuple::TenantId;
use warden_service::fixture::Fixture;
use warden_service::service::{CheckInput, PermissionService};
use warden_storage::{InMemoryStoreFactory, StoreFactory};

pub fn fixture(name: &str) -> Fixture {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(format!("{name}.toml"));
    Fixture::load(&path).unwrap()
}

pub fn service(config: EngineConfig) -> PermissionService<InMemoryStoreFactory> {
    PermissionService::new(
        Arc::new(InMemoryStoreFactory::new()),
        config,
        SchemaLimits::default(),
    )
}

/// Installs the named fixture for a fresh tenant.
pub async fn installed<F: StoreFactory>(service: &PermissionService<F>, name: &str) -> TenantId {
    let tenant_id = TenantId::new(uuid::Uuid::new_v4());
    fixture(name).install(service, &tenant_id).await.unwrap();
    tenant_id
}

pub fn check(entity: &str, permission: &str, subject: &str) -> CheckInput {
    CheckInput::new(
        entity.parse().unwrap(),
        permission,
        subject.parse().unwrap(),
    )
}

pub fn check_at(entity: &str, permission: &str, subject: &str, depth: u32) -> CheckInput {
    CheckInput {
        depth: Some(depth),
        ..check(entity, permission, subject)
    }
}
