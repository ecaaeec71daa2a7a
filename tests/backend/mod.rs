use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use advisor_admin::dispatch::Command;
use advisor_admin::domain::admin_user::{
    AdminUser, AdminUserStatus, AdminUserView, DisableAdminUser, GetAdminUser, ListAdminUsers, ProvisionAdminUser,
    Role, UpdateAdminUserRoles,
};
use advisor_admin::domain::advisor::{AdvisorStatus, ChangeAdvisorStatus, ListAdvisors, RegisterAdvisor, UpdateAdvisor};
use advisor_admin::domain::copy_group::{
    ArchiveCopyGroup, CreateCopyGroup, GetCopyGroup, ListCopyGroups, RemoveGroupMember, UpsertGroupMember,
};
use advisor_admin::domain::integration::{
    AcknowledgeIntegrationEvent, IntegrationStatus, ListIntegrationEvents, RecordIntegrationEvent,
};
use advisor_admin::domain::{aggregate_id, COMMAND, REQUESTED_BY, TENANT_ID};
use advisor_admin::error::HandlerKind;
use advisor_admin::id::payload_hash;
use advisor_admin::read_model::{InMemoryReadModelStore, ReadModelStore};
use advisor_admin::store::EventStore;
use advisor_admin::{Backend, Error, EventStores, ReadModels, Settings};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn provision(tenant_id: &str, user_id: &str, roles: &[Role]) -> ProvisionAdminUser {
    ProvisionAdminUser {
        tenant_id: tenant_id.to_string(),
        user_id: user_id.to_string(),
        email: format!("{}@example.com", user_id),
        roles: roles.to_vec(),
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    }
}

fn update_roles(tenant_id: &str, user_id: &str, roles: &[Role]) -> UpdateAdminUserRoles {
    UpdateAdminUserRoles {
        tenant_id: tenant_id.to_string(),
        user_id: user_id.to_string(),
        roles: roles.to_vec(),
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    }
}

fn register_advisor(advisor_id: &str) -> RegisterAdvisor {
    RegisterAdvisor {
        tenant_id: "t1".to_string(),
        advisor_id: advisor_id.to_string(),
        name: format!("{} advisor", advisor_id),
        version_label: "1.0".to_string(),
        symbols: vec!["EURUSD".to_string()],
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    }
}

fn change_status(advisor_id: &str, status: AdvisorStatus) -> ChangeAdvisorStatus {
    ChangeAdvisorStatus {
        tenant_id: "t1".to_string(),
        advisor_id: advisor_id.to_string(),
        status,
        reason: None,
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    }
}

#[tokio::test]
async fn admin_user_roles_update_end_to_end() {
    let stores = EventStores::in_memory();
    let admin_users = Arc::clone(&stores.admin_users);
    let backend = Backend::new(&Settings::default(), stores, ReadModels::in_memory()).unwrap();
    let cancellation = CancellationToken::new();

    let provisioned = backend
        .execute(provision("t1", "alice", &[Role::Operator]), &cancellation)
        .await
        .unwrap();
    assert_eq!(provisioned.roles, vec![Role::Operator]);
    assert_eq!(provisioned.version, 0);

    let updated = backend
        .execute(update_roles("t1", "alice", &[Role::Operator, Role::Admin]), &cancellation)
        .await
        .unwrap();
    assert_eq!(updated.roles, vec![Role::Operator, Role::Admin]);
    assert_eq!(updated.version, 1);

    let fetched = backend
        .query(
            GetAdminUser {
                tenant_id: "t1".to_string(),
                user_id: "alice".to_string(),
            },
            &cancellation,
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched, updated);

    let envelopes = admin_users
        .load(&aggregate_id::<AdminUser>("t1", "alice"))
        .await
        .unwrap();
    assert_eq!(envelopes.iter().map(|e| e.version).collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(envelopes[0].event_type(), "AdminUserProvisioned");
    assert_eq!(envelopes[1].event_type(), "AdminUserRolesUpdated");
    assert_eq!(envelopes[1].metadata_value(TENANT_ID), Some("t1"));
    assert_eq!(envelopes[1].metadata_value(REQUESTED_BY), Some("root"));
    assert_eq!(envelopes[1].metadata_value(COMMAND), Some("UpdateAdminUserRoles"));
}

#[tokio::test]
async fn repeated_commands_do_not_grow_the_stream() {
    let stores = EventStores::in_memory();
    let admin_users = Arc::clone(&stores.admin_users);
    let backend = Backend::new(&Settings::default(), stores, ReadModels::in_memory()).unwrap();
    let cancellation = CancellationToken::new();
    backend
        .execute(provision("t1", "bob", &[Role::Viewer]), &cancellation)
        .await
        .unwrap();

    let same = backend
        .execute(update_roles("t1", "bob", &[Role::Viewer, Role::Viewer]), &cancellation)
        .await
        .unwrap();

    assert_eq!(same.version, 0);
    let id = aggregate_id::<AdminUser>("t1", "bob");
    assert_eq!(admin_users.load(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn tenants_do_not_see_each_other() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    backend
        .execute(provision("t1", "alice", &[Role::Admin]), &cancellation)
        .await
        .unwrap();
    backend
        .execute(provision("t2", "alice", &[Role::Viewer]), &cancellation)
        .await
        .unwrap();

    let t1 = backend
        .query(ListAdminUsers { tenant_id: "t1".to_string() }, &cancellation)
        .await
        .unwrap();
    let t3 = backend
        .query(ListAdminUsers { tenant_id: "t3".to_string() }, &cancellation)
        .await
        .unwrap();

    assert_eq!(t1.len(), 1);
    assert_eq!(t1[0].roles, vec![Role::Admin]);
    assert!(t3.is_empty());
}

#[tokio::test]
async fn disabled_users_reject_role_changes() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    backend
        .execute(provision("t1", "carol", &[Role::Operator]), &cancellation)
        .await
        .unwrap();

    let disabled = backend
        .execute(
            DisableAdminUser {
                tenant_id: "t1".to_string(),
                user_id: "carol".to_string(),
                reason: Some("left the company".to_string()),
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();
    let rejected = backend
        .execute(update_roles("t1", "carol", &[Role::Admin]), &cancellation)
        .await;

    assert_eq!(disabled.status, AdminUserStatus::Disabled);
    assert!(matches!(rejected, Err(Error::Validation(_))));
}

#[tokio::test]
async fn advisor_lifecycle_and_status_filter() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    backend.execute(register_advisor("scalper"), &cancellation).await.unwrap();
    backend.execute(register_advisor("swing"), &cancellation).await.unwrap();

    let paused = backend
        .execute(change_status("swing", AdvisorStatus::Paused), &cancellation)
        .await
        .unwrap();
    let updated = backend
        .execute(
            UpdateAdvisor {
                tenant_id: "t1".to_string(),
                advisor_id: "scalper".to_string(),
                name: None,
                version_label: Some("2.0".to_string()),
                symbols: None,
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();

    assert_eq!(paused.status, AdvisorStatus::Paused);
    assert_eq!(updated.version_label, "2.0");
    assert_eq!(updated.version, 1);

    let only_paused = backend
        .query(
            ListAdvisors {
                tenant_id: "t1".to_string(),
                status: Some(AdvisorStatus::Paused),
            },
            &cancellation,
        )
        .await
        .unwrap();
    assert_eq!(only_paused.len(), 1);
    assert_eq!(only_paused[0].advisor_id, "swing");

    backend
        .execute(change_status("swing", AdvisorStatus::Retired), &cancellation)
        .await
        .unwrap();
    let revived = backend
        .execute(change_status("swing", AdvisorStatus::Active), &cancellation)
        .await;
    assert!(matches!(revived, Err(Error::Validation(_))));
}

#[tokio::test]
async fn copy_group_membership() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    let member = |account_id: &str, multiplier_bps: u32| UpsertGroupMember {
        tenant_id: "t1".to_string(),
        group_id: "majors".to_string(),
        account_id: account_id.to_string(),
        multiplier_bps,
        enabled: true,
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    };
    let remove = |account_id: &str| RemoveGroupMember {
        tenant_id: "t1".to_string(),
        group_id: "majors".to_string(),
        account_id: account_id.to_string(),
        requested_by: "root".to_string(),
        requested_at: Utc::now(),
    };

    backend
        .execute(
            CreateCopyGroup {
                tenant_id: "t1".to_string(),
                group_id: "majors".to_string(),
                name: "Majors".to_string(),
                leader_advisor_id: "scalper".to_string(),
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();
    backend.execute(member("acc-1", 10_000), &cancellation).await.unwrap();
    backend.execute(member("acc-2", 25_000), &cancellation).await.unwrap();
    let after_removal = backend.execute(remove("acc-1"), &cancellation).await.unwrap();
    let unchanged = backend.execute(remove("acc-1"), &cancellation).await.unwrap();
    let out_of_range = backend.execute(member("acc-3", 0), &cancellation).await;

    assert_eq!(after_removal.members.len(), 1);
    assert_eq!(after_removal.members[0].account_id, "acc-2");
    assert_eq!(unchanged.version, after_removal.version);
    assert!(matches!(out_of_range, Err(Error::Validation(_))));

    backend
        .execute(
            ArchiveCopyGroup {
                tenant_id: "t1".to_string(),
                group_id: "majors".to_string(),
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();

    let active = backend
        .query(
            ListCopyGroups {
                tenant_id: "t1".to_string(),
                include_archived: false,
            },
            &cancellation,
        )
        .await
        .unwrap();
    let archived = backend
        .query(
            GetCopyGroup {
                tenant_id: "t1".to_string(),
                group_id: "majors".to_string(),
            },
            &cancellation,
        )
        .await
        .unwrap()
        .unwrap();
    assert!(active.is_empty());
    assert!(archived.archived);
}

#[tokio::test]
async fn integration_events_are_deduplicated_per_source() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    let record = |source: &str, external_id: &str, qty: u32| RecordIntegrationEvent {
        tenant_id: "t1".to_string(),
        source: source.to_string(),
        external_id: external_id.to_string(),
        kind: "OrderFilled".to_string(),
        payload: json!({ "qty": qty }),
        requested_by: "webhook".to_string(),
        requested_at: Utc::now(),
    };

    let first = backend.execute(record("broker-a", "fill-1", 1), &cancellation).await.unwrap();
    let duplicate = backend.execute(record("broker-a", "fill-1", 9), &cancellation).await.unwrap();
    backend.execute(record("broker-b", "fill-1", 2), &cancellation).await.unwrap();

    assert_eq!(duplicate, first);
    assert_eq!(duplicate.payload, json!({ "qty": 1 }));

    let acknowledged = backend
        .execute(
            AcknowledgeIntegrationEvent {
                tenant_id: "t1".to_string(),
                source: "broker-a".to_string(),
                external_id: "fill-1".to_string(),
                requested_by: "ops".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();
    assert_eq!(acknowledged.status, IntegrationStatus::Acknowledged);
    assert_eq!(acknowledged.acknowledged_by.as_deref(), Some("ops"));

    let from_a = backend
        .query(
            ListIntegrationEvents {
                tenant_id: "t1".to_string(),
                source: Some("broker-a".to_string()),
            },
            &cancellation,
        )
        .await
        .unwrap();
    assert_eq!(from_a.len(), 1);
}

#[tokio::test]
async fn idempotent_submission_executes_once() {
    let stores = EventStores::in_memory();
    let admin_users = Arc::clone(&stores.admin_users);
    let backend = Backend::new(&Settings::default(), stores, ReadModels::in_memory()).unwrap();
    let cancellation = CancellationToken::new();
    let body = json!({ "user_id": "dave", "roles": ["Viewer"] });
    let hash = payload_hash(&body).unwrap();

    let first = backend
        .execute_idempotent("t1", "req-1", &hash, provision("t1", "dave", &[Role::Viewer]), &cancellation)
        .await
        .unwrap();
    let replay = backend
        .execute_idempotent("t1", "req-1", &hash, provision("t1", "dave", &[Role::Viewer]), &cancellation)
        .await
        .unwrap();
    let reused = backend
        .execute_idempotent("t1", "req-1", "other", provision("t1", "dave", &[Role::Admin]), &cancellation)
        .await;

    assert_eq!(replay, first);
    assert!(matches!(reused, Err(Error::IdempotencyKeyReused { .. })));
    let id = aggregate_id::<AdminUser>("t1", "dave");
    assert_eq!(admin_users.load(&id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failed_idempotent_submission_can_be_retried() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();

    let failed = backend
        .execute_idempotent("t1", "req-1", "h1", provision("t1", "erin", &[]), &cancellation)
        .await;
    let retried = backend
        .execute_idempotent("t1", "req-1", "h2", provision("t1", "erin", &[Role::Viewer]), &cancellation)
        .await;

    assert!(matches!(failed, Err(Error::Validation(_))));
    assert_eq!(retried.unwrap().roles, vec![Role::Viewer]);
    assert_eq!(
        backend.idempotency_store().record("t1", "req-1").await.unwrap().payload_hash,
        "h2"
    );
}

#[tokio::test]
async fn repair_rebuilds_lost_read_models() {
    let read_models = ReadModels::in_memory();
    let admin_views = Arc::clone(&read_models.admin_users);
    let backend = Backend::new(&Settings::default(), EventStores::in_memory(), read_models).unwrap();
    let cancellation = CancellationToken::new();
    backend
        .execute(provision("t1", "frank", &[Role::Viewer]), &cancellation)
        .await
        .unwrap();
    let expected = backend
        .execute(update_roles("t1", "frank", &[Role::Admin]), &cancellation)
        .await
        .unwrap();

    admin_views.remove("t1", "frank").await.unwrap();
    let replayed = backend.repair_read_models().await.unwrap();

    assert_eq!(replayed, 2);
    assert_eq!(admin_views.get("t1", "frank").await.unwrap(), Some(expected));
}

#[tokio::test]
async fn unregistered_command_is_reported() {
    struct Unknown;

    impl Command for Unknown {
        type Output = ();
    }

    let backend = Backend::in_memory(&Settings::default()).unwrap();

    let result = backend.execute(Unknown, &CancellationToken::new()).await;

    assert!(matches!(
        result,
        Err(Error::HandlerNotFound {
            kind: HandlerKind::Command,
            ..
        })
    ));
}

#[tokio::test]
async fn cancelled_command_changes_nothing() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let result = backend
        .execute(provision("t1", "gina", &[Role::Viewer]), &cancellation)
        .await;
    let fetched = backend
        .query(
            GetAdminUser {
                tenant_id: "t1".to_string(),
                user_id: "gina".to_string(),
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(fetched.is_none());
}

#[tokio::test]
async fn business_ids_are_trimmed_before_addressing_streams() {
    let stores = EventStores::in_memory();
    let admin_users = Arc::clone(&stores.admin_users);
    let backend = Backend::new(&Settings::default(), stores, ReadModels::in_memory()).unwrap();
    let cancellation = CancellationToken::new();
    let mut padded = provision("t1", "zoe", &[Role::Viewer]);
    padded.user_id = " zoe ".to_string();

    backend.execute(padded, &cancellation).await.unwrap();
    let updated = backend
        .execute(update_roles("t1", "zoe", &[Role::Admin]), &cancellation)
        .await
        .unwrap();
    let fetched = backend
        .query(
            GetAdminUser {
                tenant_id: "t1".to_string(),
                user_id: "zoe ".to_string(),
            },
            &cancellation,
        )
        .await
        .unwrap();

    assert_eq!(updated.version, 1);
    assert_eq!(updated.user_id, "zoe");
    assert_eq!(fetched, Some(updated));
    assert_eq!(
        admin_users.load(&aggregate_id::<AdminUser>("t1", "zoe")).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn padded_member_ids_are_removed() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    backend
        .execute(
            CreateCopyGroup {
                tenant_id: "t1".to_string(),
                group_id: " minors".to_string(),
                name: "Minors".to_string(),
                leader_advisor_id: "scalper".to_string(),
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();
    backend
        .execute(
            UpsertGroupMember {
                tenant_id: "t1".to_string(),
                group_id: "minors".to_string(),
                account_id: "acc-1".to_string(),
                multiplier_bps: 10_000,
                enabled: true,
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();

    let removed = backend
        .execute(
            RemoveGroupMember {
                tenant_id: "t1".to_string(),
                group_id: "minors ".to_string(),
                account_id: " acc-1 ".to_string(),
                requested_by: "root".to_string(),
                requested_at: Utc::now(),
            },
            &cancellation,
        )
        .await
        .unwrap();

    assert_eq!(removed.group_id, "minors");
    assert!(removed.members.is_empty());
    assert_eq!(removed.version, 2);
}

#[tokio::test]
async fn separators_in_sources_keep_integration_events_apart() {
    let backend = Backend::in_memory(&Settings::default()).unwrap();
    let cancellation = CancellationToken::new();
    let record = |source: &str, external_id: &str, qty: u32| RecordIntegrationEvent {
        tenant_id: "t1".to_string(),
        source: source.to_string(),
        external_id: external_id.to_string(),
        kind: "OrderFilled".to_string(),
        payload: json!({ "qty": qty }),
        requested_by: "webhook".to_string(),
        requested_at: Utc::now(),
    };

    let nested_source = backend.execute(record("a/b", "c", 1), &cancellation).await.unwrap();
    let nested_id = backend.execute(record("a", "b/c", 2), &cancellation).await.unwrap();
    let all = backend
        .query(
            ListIntegrationEvents {
                tenant_id: "t1".to_string(),
                source: None,
            },
            &cancellation,
        )
        .await
        .unwrap();

    assert_eq!(nested_source.payload, json!({ "qty": 1 }));
    assert_eq!(nested_id.payload, json!({ "qty": 2 }));
    assert_eq!(all.len(), 2);
    assert_eq!(
        all.iter().map(|e| (e.source.as_str(), e.external_id.as_str())).collect::<Vec<_>>(),
        vec![("a/b", "c"), ("a", "b/c")]
    );
}

/// Admin user read models whose next upsert fails once armed.
struct FlakyAdminViews {
    inner: InMemoryReadModelStore<AdminUserView>,
    fail_next: AtomicBool,
}

#[async_trait]
impl ReadModelStore<AdminUserView> for FlakyAdminViews {
    async fn get(&self, tenant_id: &str, business_id: &str) -> Result<Option<AdminUserView>, Error> {
        self.inner.get(tenant_id, business_id).await
    }

    async fn list(&self, tenant_id: &str) -> Result<Vec<AdminUserView>, Error> {
        self.inner.list(tenant_id).await
    }

    async fn upsert(&self, tenant_id: &str, business_id: &str, model: AdminUserView) -> Result<(), Error> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Custom("read model unavailable".into()));
        }
        self.inner.upsert(tenant_id, business_id, model).await
    }

    async fn remove(&self, tenant_id: &str, business_id: &str) -> Result<Option<AdminUserView>, Error> {
        self.inner.remove(tenant_id, business_id).await
    }
}

#[tokio::test]
async fn unpublished_idempotent_submission_completes_after_repair() {
    let mut read_models = ReadModels::in_memory();
    read_models.admin_users = Arc::new(FlakyAdminViews {
        inner: InMemoryReadModelStore::new(),
        fail_next: AtomicBool::new(true),
    });
    let stores = EventStores::in_memory();
    let admin_users = Arc::clone(&stores.admin_users);
    let settings = Settings {
        idempotency_ttl: None,
        ..Settings::default()
    };
    let backend = Backend::new(&settings, stores, read_models).unwrap();
    let cancellation = CancellationToken::new();
    let submit = || provision("t1", "hana", &[Role::Viewer]);

    let failed = backend
        .execute_idempotent("t1", "req-1", "h1", submit(), &cancellation)
        .await;
    assert!(matches!(failed, Err(Error::Publish { .. })));

    backend.repair_read_models().await.unwrap();
    let resumed = backend
        .execute_idempotent("t1", "req-1", "h1", submit(), &cancellation)
        .await
        .unwrap();
    let replayed = backend
        .execute_idempotent("t1", "req-1", "h1", submit(), &cancellation)
        .await
        .unwrap();

    assert_eq!(resumed.version, 0);
    assert_eq!(replayed, resumed);
    assert_eq!(
        admin_users.load(&aggregate_id::<AdminUser>("t1", "hana")).await.unwrap().len(),
        1
    );
}
