//! # Shared Model Registry
//!
//! Central schemas and versioned records for entities shared across modules.
//!
//! ## Concurrency
//!
//! Optimistic concurrency is the only correctness mechanism. Every write
//! carries the version the caller last read; the store applies it with a
//! version-guarded update, so of two writers starting from the same version
//! exactly one succeeds and the other gets a [`ConflictError`]. A record's
//! version grows by exactly one per successful write.
//!
//! ## Notifications
//!
//! Successful writes are broadcast (`record_created`, `record_updated`,
//! `record_archived`) from the `shared_models` system sender to the modules
//! that declare the model name as a dependency. Broadcast is best-effort;
//! delivery failures are logged and never undo the write.

use super::errors::{
    ConflictError, RecordNotFound, SharedModelError, SharedModelResult, ValidationError,
};
use super::schema::{FieldSpec, ModelSchema};
use crate::clock::SharedClock;
use crate::constants::{collections, message_types, system_senders};
use crate::messaging::{MessageBus, MessageSource};
use crate::registry::ModuleRegistry;
use crate::store::{DocumentFilter, DocumentStore, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Active,
    Archived,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedRecord {
    pub model: String,
    pub id: Uuid,
    pub version: i64,
    pub data: Map<String, Value>,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl SharedRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn is_archived(&self) -> bool {
        self.status == RecordStatus::Archived
    }
}

/// Field-equality filter over record data
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    fields: Vec<(String, Value)>,
    include_archived: bool,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((field.into(), value.into()));
        self
    }

    pub fn include_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    fn matches(&self, record: &SharedRecord) -> bool {
        (self.include_archived || !record.is_archived())
            && self
                .fields
                .iter()
                .all(|(field, expected)| record.data.get(field) == Some(expected))
    }
}

pub struct SharedModelRegistry {
    store: Arc<dyn DocumentStore>,
    modules: Arc<ModuleRegistry>,
    bus: MessageBus,
    clock: SharedClock,
    schemas: RwLock<HashMap<String, ModelSchema>>,
}

impl fmt::Debug for SharedModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedModelRegistry")
            .field("models", &self.schemas.read().len())
            .finish()
    }
}

impl SharedModelRegistry {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        modules: Arc<ModuleRegistry>,
        bus: MessageBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            modules,
            bus,
            clock,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register a model schema
    pub async fn define_model(
        &self,
        name: impl Into<String>,
        fields: BTreeMap<String, FieldSpec>,
    ) -> SharedModelResult<ModelSchema> {
        let schema = ModelSchema::new(name, fields)?;
        if self.schemas.read().contains_key(&schema.name) {
            return Err(ValidationError::DuplicateModel {
                model: schema.name.clone(),
            }
            .into());
        }

        let body = serde_json::to_value(&schema).map_err(StoreError::from)?;
        match self
            .store
            .insert(collections::MODEL_SCHEMAS, &schema.name, body)
            .await
        {
            Ok(_) => {}
            Err(StoreError::DuplicateKey { .. }) => {
                return Err(ValidationError::DuplicateModel {
                    model: schema.name.clone(),
                }
                .into());
            }
            Err(error) => return Err(error.into()),
        }

        self.schemas
            .write()
            .insert(schema.name.clone(), schema.clone());
        crate::log_shared_model!(info, "Model defined",
            model: schema.name,
            fields: schema.fields.len()
        );
        Ok(schema)
    }

    /// Restore schemas persisted by an earlier process
    pub async fn load_schemas(&self) -> SharedModelResult<usize> {
        let documents = self
            .store
            .select(collections::MODEL_SCHEMAS, &DocumentFilter::new())
            .await?;
        let mut schemas = HashMap::with_capacity(documents.len());
        for document in &documents {
            let schema: ModelSchema = document.decode()?;
            schemas.insert(schema.name.clone(), schema);
        }
        let count = schemas.len();
        *self.schemas.write() = schemas;
        Ok(count)
    }

    pub fn schema(&self, model: &str) -> Option<ModelSchema> {
        self.schemas.read().get(model).cloned()
    }

    /// Defined model names, sorted
    pub fn models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate and persist a new record at version 1
    pub async fn create(
        &self,
        model: &str,
        data: Value,
        actor: &str,
    ) -> SharedModelResult<SharedRecord> {
        let schema = self.require_schema(model)?;
        let data = into_object(model, data)?;
        schema.validate(&data)?;

        let now = self.clock.now();
        let record = SharedRecord {
            model: model.to_string(),
            id: Uuid::new_v4(),
            version: 1,
            data,
            status: RecordStatus::Active,
            created_at: now,
            created_by: actor.to_string(),
            updated_at: now,
            updated_by: actor.to_string(),
        };
        let body = serde_json::to_value(&record).map_err(StoreError::from)?;
        self.store
            .insert(collections::SHARED_RECORDS, &record.id.to_string(), body)
            .await?;

        crate::log_shared_model!(info, "Record created",
            model: model,
            id: record.id,
            actor: actor
        );
        self.notify(message_types::RECORD_CREATED, &record, json!({ "data": record.data }))
            .await;
        Ok(record)
    }

    /// Merge `partial` into the record if it is still at `expected_version`.
    ///
    /// A null value removes the field. The merged record is re-validated.
    pub async fn update(
        &self,
        model: &str,
        id: Uuid,
        partial: Value,
        expected_version: i64,
        actor: &str,
    ) -> SharedModelResult<SharedRecord> {
        let schema = self.require_schema(model)?;
        let partial = into_object(model, partial)?;
        let current = self.load_for_write(model, id, expected_version).await?;

        let mut data = current.data.clone();
        let mut changed: Vec<String> = Vec::with_capacity(partial.len());
        for (field, value) in partial {
            changed.push(field.clone());
            if value.is_null() {
                data.remove(&field);
            } else {
                data.insert(field, value);
            }
        }
        schema.validate(&data)?;

        let record = SharedRecord {
            data,
            version: expected_version + 1,
            updated_at: self.clock.now(),
            updated_by: actor.to_string(),
            ..current
        };
        self.write_guarded(&record, expected_version).await?;

        crate::log_shared_model!(info, "Record updated",
            model: model,
            id: id,
            version: record.version,
            actor: actor
        );
        self.notify(
            message_types::RECORD_UPDATED,
            &record,
            json!({ "changed_fields": changed, "data": record.data }),
        )
        .await;
        Ok(record)
    }

    /// Soft-delete a record; archived records are read-only
    pub async fn archive(
        &self,
        model: &str,
        id: Uuid,
        expected_version: i64,
        actor: &str,
    ) -> SharedModelResult<SharedRecord> {
        self.require_schema(model)?;
        let current = self.load_for_write(model, id, expected_version).await?;
        let record = SharedRecord {
            status: RecordStatus::Archived,
            version: expected_version + 1,
            updated_at: self.clock.now(),
            updated_by: actor.to_string(),
            ..current
        };
        self.write_guarded(&record, expected_version).await?;

        crate::log_shared_model!(info, "Record archived",
            model: model,
            id: id,
            actor: actor
        );
        self.notify(message_types::RECORD_ARCHIVED, &record, json!({}))
            .await;
        Ok(record)
    }

    pub async fn get(&self, model: &str, id: Uuid) -> SharedModelResult<Option<SharedRecord>> {
        self.require_schema(model)?;
        let record = self.read(id).await?;
        Ok(record.filter(|r| r.model == model))
    }

    /// Records of `model` matching the filter, ordered by id
    pub async fn find(
        &self,
        model: &str,
        filter: &RecordFilter,
    ) -> SharedModelResult<Vec<SharedRecord>> {
        self.require_schema(model)?;
        let documents = self
            .store
            .select(
                collections::SHARED_RECORDS,
                &DocumentFilter::new().field_eq("model", model),
            )
            .await?;
        let mut records = Vec::with_capacity(documents.len());
        for document in &documents {
            let record: SharedRecord = document.decode()?;
            if filter.matches(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn require_schema(&self, model: &str) -> Result<ModelSchema, ValidationError> {
        self.schema(model)
            .ok_or_else(|| ValidationError::unknown_model(model))
    }

    async fn read(&self, id: Uuid) -> SharedModelResult<Option<SharedRecord>> {
        match self
            .store
            .get(collections::SHARED_RECORDS, &id.to_string())
            .await?
        {
            Some(document) => Ok(Some(document.decode()?)),
            None => Ok(None),
        }
    }

    async fn load_for_write(
        &self,
        model: &str,
        id: Uuid,
        expected_version: i64,
    ) -> SharedModelResult<SharedRecord> {
        let current = self
            .read(id)
            .await?
            .filter(|r| r.model == model)
            .ok_or_else(|| RecordNotFound {
                model: model.to_string(),
                id,
            })?;
        if current.version != expected_version {
            return Err(self.conflict(model, id, expected_version, current.version));
        }
        if current.is_archived() {
            return Err(SharedModelError::Archived {
                model: model.to_string(),
                id,
            });
        }
        Ok(current)
    }

    async fn write_guarded(
        &self,
        record: &SharedRecord,
        expected_version: i64,
    ) -> SharedModelResult<()> {
        let body = serde_json::to_value(record).map_err(StoreError::from)?;
        let affected = self
            .store
            .update_where(
                collections::SHARED_RECORDS,
                &record.id.to_string(),
                expected_version,
                body,
            )
            .await?;
        if affected == 0 {
            let current_version = self
                .read(record.id)
                .await?
                .map(|r| r.version)
                .unwrap_or(expected_version);
            return Err(self.conflict(&record.model, record.id, expected_version, current_version));
        }
        Ok(())
    }

    fn conflict(
        &self,
        model: &str,
        id: Uuid,
        expected_version: i64,
        current_version: i64,
    ) -> SharedModelError {
        crate::log_shared_model!(debug, "Stale write rejected",
            model: model,
            id: id,
            expected_version: expected_version,
            current_version: current_version
        );
        ConflictError {
            model: model.to_string(),
            id,
            expected_version,
            current_version,
        }
        .into()
    }

    async fn notify(&self, message_type: &str, record: &SharedRecord, extra: Value) {
        let dependents = self.modules.get_dependents(&record.model);
        if dependents.is_empty() {
            return;
        }

        let mut payload = json!({
            "model": record.model,
            "id": record.id,
            "version": record.version,
            "actor": record.updated_by,
        });
        if let (Some(fields), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            fields.extend(extra);
        }

        let report = self
            .bus
            .broadcast(
                MessageSource::system(system_senders::SHARED_MODELS),
                message_type,
                payload,
                Some(dependents),
            )
            .await;
        for (module, error) in report.failed() {
            crate::log_shared_model!(warn, "Change notification not delivered",
                model: record.model,
                id: record.id,
                module: module,
                error: error.to_string()
            );
        }
    }
}

fn into_object(model: &str, data: Value) -> Result<Map<String, Value>, ValidationError> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(ValidationError::TypeMismatch {
            model: model.to_string(),
            field: "<record>".to_string(),
            expected: "object".to_string(),
            actual: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::{MessageBusConfig, RegistryConfig};
    use crate::registry::ModuleDescriptor;
    use crate::store::InMemoryDocumentStore;

    async fn setup() -> (SharedModelRegistry, MessageBus) {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let modules = Arc::new(ModuleRegistry::new(
            Arc::clone(&store),
            RegistryConfig::default(),
        ));
        let bus = MessageBus::new(
            Arc::clone(&modules),
            Arc::clone(&store),
            Arc::new(SystemClock),
            MessageBusConfig::default(),
        );
        let models = SharedModelRegistry::new(store, modules, bus.clone(), Arc::new(SystemClock));
        models
            .define_model(
                "Invoice",
                BTreeMap::from([
                    ("amount".to_string(), FieldSpec::required("float")),
                    ("status".to_string(), FieldSpec::required("string")),
                    ("memo".to_string(), FieldSpec::optional("string")),
                ]),
            )
            .await
            .unwrap();
        (models, bus)
    }

    #[tokio::test]
    async fn test_duplicate_model_rejected() {
        let (models, _) = setup().await;
        let err = models
            .define_model(
                "Invoice",
                BTreeMap::from([("x".to_string(), FieldSpec::optional("string"))]),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SharedModelError::Validation(ValidationError::DuplicateModel { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_merges_and_bumps_version() {
        let (models, _) = setup().await;
        let record = models
            .create("Invoice", json!({"amount": 100.0, "status": "open", "memo": "x"}), "clerk")
            .await
            .unwrap();
        assert_eq!(record.version, 1);

        let updated = models
            .update("Invoice", record.id, json!({"status": "paid", "memo": null}), 1, "cashier")
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.get("amount"), Some(&json!(100.0)));
        assert_eq!(updated.get("status"), Some(&json!("paid")));
        assert!(updated.get("memo").is_none());
        assert_eq!(updated.created_by, "clerk");
        assert_eq!(updated.updated_by, "cashier");
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let (models, _) = setup().await;
        let record = models
            .create("Invoice", json!({"amount": 1.0, "status": "open"}), "a")
            .await
            .unwrap();
        models
            .update("Invoice", record.id, json!({"status": "paid"}), 1, "a")
            .await
            .unwrap();
        let err = models
            .update("Invoice", record.id, json!({"status": "void"}), 1, "b")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SharedModelError::Conflict(ConflictError {
                model: "Invoice".to_string(),
                id: record.id,
                expected_version: 1,
                current_version: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_removing_required_field_fails_validation() {
        let (models, _) = setup().await;
        let record = models
            .create("Invoice", json!({"amount": 1.0, "status": "open"}), "a")
            .await
            .unwrap();
        let err = models
            .update("Invoice", record.id, json!({"amount": null}), 1, "a")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SharedModelError::Validation(ValidationError::MissingField { .. })
        ));
        let unchanged = models.get("Invoice", record.id).await.unwrap().unwrap();
        assert_eq!(unchanged.version, 1);
    }

    #[tokio::test]
    async fn test_archive_hides_record_and_freezes_it() {
        let (models, _) = setup().await;
        let record = models
            .create("Invoice", json!({"amount": 1.0, "status": "open"}), "a")
            .await
            .unwrap();
        let archived = models.archive("Invoice", record.id, 1, "a").await.unwrap();
        assert_eq!(archived.version, 2);
        assert!(archived.is_archived());

        assert!(models
            .find("Invoice", &RecordFilter::new())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            models
                .find("Invoice", &RecordFilter::new().include_archived())
                .await
                .unwrap()
                .len(),
            1
        );
        let err = models
            .update("Invoice", record.id, json!({"status": "x"}), 2, "a")
            .await
            .unwrap_err();
        assert!(matches!(err, SharedModelError::Archived { .. }));
    }

    #[tokio::test]
    async fn test_find_filters_on_data_fields() {
        let (models, _) = setup().await;
        for status in ["open", "open", "paid"] {
            models
                .create("Invoice", json!({"amount": 1.0, "status": status}), "a")
                .await
                .unwrap();
        }
        let open = models
            .find("Invoice", &RecordFilter::new().field_eq("status", "open"))
            .await
            .unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn test_dependents_are_notified() {
        let (models, bus) = setup().await;
        models
            .modules
            .register(ModuleDescriptor::new("Invoice", "1.0"))
            .await
            .unwrap();
        models
            .modules
            .register(ModuleDescriptor::new("Reports", "1.0").depends_on("Invoice", "*"))
            .await
            .unwrap();

        models
            .create("Invoice", json!({"amount": 1.0, "status": "open"}), "a")
            .await
            .unwrap();
        let stats = bus.stats();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_unknown_model_and_missing_record() {
        let (models, _) = setup().await;
        assert!(matches!(
            models.create("Nope", json!({}), "a").await,
            Err(SharedModelError::Validation(ValidationError::UnknownModel { .. }))
        ));
        assert!(matches!(
            models
                .update("Invoice", Uuid::new_v4(), json!({}), 1, "a")
                .await,
            Err(SharedModelError::NotFound(_))
        ));
    }
}
