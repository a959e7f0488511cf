//! In-memory implementation of the system-of-record store.
//!
//! For local development and tests: no external dependencies, state lost on
//! restart. All tables live under one lock, which is what makes the
//! master + audit + outbox write atomic here; the Postgres backend gets the
//! same property from a real transaction.
use super::{
    AuditRow, FeatureFilter, FeatureRow, FeatureWrite, FlagStore, OutboxStatus, OutboxTask,
    SaveOutcome, SdkKeyRow, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::Utc;
use mizuflow_wire::{FeatureFlag, FlagKey};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    features: HashMap<FlagKey, FeatureRow>,
    audits: BTreeMap<i64, AuditRow>,
    outbox: BTreeMap<i64, OutboxTask>,
    sdk_keys: HashMap<String, SdkKeyRow>,
    next_feature_id: i64,
    next_audit_id: i64,
    next_outbox_id: i64,
    next_sdk_id: i64,
}

#[derive(Default)]
pub struct MemoryFlagStore {
    tables: Mutex<Tables>,
}

impl MemoryFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlagStore for MemoryFlagStore {
    async fn save_feature(&self, write: FeatureWrite) -> StoreResult<SaveOutcome> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let identity = FlagKey::new(&write.namespace, &write.env, &write.key);

        let (version, old_value) = match tables.features.get(&identity) {
            None => (1, String::new()),
            Some(existing) => (existing.version + 1, existing.current_value.clone()),
        };

        if tables.features.contains_key(&identity) {
            let existing = tables.features.get_mut(&identity).expect("checked above");
            existing.version = version;
            existing.current_value = write.value.clone();
            existing.flag_type = write.flag_type;
            existing.updated_by = write.operator.clone();
            existing.updated_at = now;
        } else {
            tables.next_feature_id += 1;
            let row = FeatureRow {
                id: tables.next_feature_id,
                namespace: write.namespace.clone(),
                env: write.env.clone(),
                key: write.key.clone(),
                flag_type: write.flag_type,
                version,
                current_value: write.value.clone(),
                updated_by: write.operator.clone(),
                updated_at: now,
            };
            tables.features.insert(identity, row);
        }

        tables.next_audit_id += 1;
        let audit_id = tables.next_audit_id;
        tables.audits.insert(
            audit_id,
            AuditRow {
                id: audit_id,
                namespace: write.namespace.clone(),
                env: write.env.clone(),
                key: write.key.clone(),
                old_value,
                new_value: write.value.clone(),
                flag_type: write.flag_type,
                operator: write.operator.clone(),
                trace_id: write.trace_id.clone(),
                created_at: now,
            },
        );

        let flag = FeatureFlag {
            namespace: write.namespace,
            env: write.env,
            key: write.key,
            value: write.value,
            flag_type: write.flag_type,
            version,
            revision: 0,
        };
        let payload = serde_json::to_string(&flag)
            .map_err(|err| StoreError::Unexpected(anyhow::anyhow!(err)))?;

        tables.next_outbox_id += 1;
        let outbox_id = tables.next_outbox_id;
        tables.outbox.insert(
            outbox_id,
            OutboxTask {
                id: outbox_id,
                key: flag.key.clone(),
                payload,
                status: OutboxStatus::Pending,
                retry_count: 0,
                trace_id: write.trace_id,
                created_at: now,
                updated_at: now,
            },
        );

        Ok(SaveOutcome {
            version,
            outbox_id,
            flag,
        })
    }

    async fn get_feature(&self, key: &FlagKey) -> StoreResult<Option<FeatureRow>> {
        Ok(self.tables.lock().await.features.get(key).cloned())
    }

    async fn list_features(&self, filter: &FeatureFilter) -> StoreResult<Vec<FeatureRow>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<FeatureRow> = tables
            .features
            .values()
            .filter(|row| {
                filter
                    .namespace
                    .as_ref()
                    .is_none_or(|ns| &row.namespace == ns)
                    && filter.env.as_ref().is_none_or(|env| &row.env == env)
                    && filter
                        .search
                        .as_ref()
                        .is_none_or(|needle| row.key.contains(needle.as_str()))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn page_features(&self, after_id: i64, limit: i64) -> StoreResult<Vec<FeatureRow>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<FeatureRow> = tables
            .features
            .values()
            .filter(|row| row.id > after_id)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn get_audit(&self, id: i64) -> StoreResult<AuditRow> {
        self.tables
            .lock()
            .await
            .audits
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("audit {id}")))
    }

    async fn list_audits(&self, key: &FlagKey) -> StoreResult<Vec<AuditRow>> {
        let tables = self.tables.lock().await;
        let mut rows: Vec<AuditRow> = tables
            .audits
            .values()
            .filter(|row| {
                row.namespace == key.namespace && row.env == key.env && row.key == key.key
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(rows)
    }

    async fn fetch_pending_outbox(&self, limit: i64) -> StoreResult<Vec<OutboxTask>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox
            .values()
            .filter(|task| task.status == OutboxStatus::Pending)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn update_outbox_status(
        &self,
        id: i64,
        status: OutboxStatus,
        retry_count: i32,
    ) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let Some(task) = tables.outbox.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("outbox task {id}")));
        };
        // Status progression is monotone; settled tasks stay settled.
        if task.status != OutboxStatus::Pending {
            return Ok(());
        }
        task.status = status;
        task.retry_count = retry_count;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn find_sdk_key(&self, api_key: &str) -> StoreResult<Option<SdkKeyRow>> {
        Ok(self.tables.lock().await.sdk_keys.get(api_key).cloned())
    }

    async fn insert_sdk_key(
        &self,
        app_id: &str,
        api_key: &str,
        env: &str,
    ) -> StoreResult<SdkKeyRow> {
        let mut tables = self.tables.lock().await;
        if tables.sdk_keys.contains_key(api_key) {
            return Err(StoreError::Conflict(format!("sdk key for {app_id}")));
        }
        tables.next_sdk_id += 1;
        let row = SdkKeyRow {
            id: tables.next_sdk_id,
            app_id: app_id.to_string(),
            api_key: api_key.to_string(),
            env: env.to_string(),
            active: true,
        };
        tables.sdk_keys.insert(api_key.to_string(), row.clone());
        Ok(row)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn is_durable(&self) -> bool {
        false
    }
}
