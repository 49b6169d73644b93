//! Generic record store.
//!
//! A [`Repository`] persists any [`Record`] type as a JSON row. Records must
//! carry `id`, `created_at` and `updated_at` fields; the store owns those
//! three and callers supply everything else as a JSON object of attributes.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ImageVaultError, Result};

/// Fields assigned by the store and never accepted from callers.
pub const STORE_FIELDS: [&str; 3] = ["id", "created_at", "updated_at"];

/// A persistable entity. Implementations only describe their constraints;
/// the store applies them.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Human-readable kind used in error messages.
    const KIND: &'static str;
    /// Fields whose values must be unique across all records of this kind.
    const UNIQUE_FIELDS: &'static [&'static str] = &[];
    /// Fields that may be set at creation but never updated.
    const IMMUTABLE_FIELDS: &'static [&'static str] = &[];

    fn id(&self) -> Uuid;
}

#[async_trait]
pub trait Repository<T: Record>: Send + Sync {
    /// Insert a record built from `attributes` (a JSON object).
    async fn create(&self, attributes: Value) -> Result<T>;

    async fn get_by_id(&self, id: Uuid) -> Result<T>;

    /// First record whose `field` equals `value`.
    async fn get_by_field(&self, field: &str, value: &Value) -> Result<Option<T>>;

    /// Records whose `field` equals `value`, in creation order.
    async fn get_all_by_field(
        &self,
        field: &str,
        value: &Value,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<T>>;

    async fn get_all(&self, skip: usize, limit: usize) -> Result<Vec<T>>;

    /// Merge `attributes` into the record and refresh `updated_at`.
    async fn update(&self, id: Uuid, attributes: Value) -> Result<T>;

    async fn delete(&self, id: Uuid) -> Result<bool>;
}

type Row = Map<String, Value>;

/// In-memory [`Repository`], optionally mirrored to a JSON file after every
/// committed mutation. Each operation holds the table lock for its whole
/// duration, so single-record writes are atomic.
pub struct MemoryRepository<T> {
    rows: RwLock<Vec<Row>>,
    snapshot: Option<PathBuf>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Record> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            snapshot: None,
            _record: PhantomData,
        }
    }

    /// Load rows from `path` if it exists and write back to it on every change.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let rows: Vec<Row> = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        for row in &rows {
            decode_row::<T>(row)?;
        }
        info!(kind = T::KIND, rows = rows.len(), path = %path.display(), "loaded records");

        Ok(Self {
            rows: RwLock::new(rows),
            snapshot: Some(path),
            _record: PhantomData,
        })
    }

    async fn persist(&self, rows: &[Row]) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        write_atomically(path, &serde_json::to_vec_pretty(rows)?).await
    }

    fn check_unique(rows: &[Row], candidate: &Row, skip_id: Option<&Value>) -> Result<()> {
        for field in T::UNIQUE_FIELDS {
            let Some(value) = candidate.get(*field) else {
                continue;
            };
            let taken = rows
                .iter()
                .filter(|row| skip_id.is_none_or(|id| row.get("id") != Some(id)))
                .any(|row| row.get(*field) == Some(value));
            if taken {
                return Err(ImageVaultError::Validation(format!(
                    "{} with this {} already exists",
                    T::KIND,
                    field
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Record> Repository<T> for MemoryRepository<T> {
    async fn create(&self, attributes: Value) -> Result<T> {
        let mut row = into_row(attributes)?;
        if let Some(field) = STORE_FIELDS.iter().find(|f| row.contains_key(**f)) {
            return Err(ImageVaultError::Validation(format!(
                "'{}' is assigned by the store",
                field
            )));
        }

        let now = json!(Utc::now());
        row.insert("id".into(), json!(Uuid::new_v4()));
        row.insert("created_at".into(), now.clone());
        row.insert("updated_at".into(), now);

        let record: T = decode_row(&row)?;
        let row = encode_row(&record)?;

        let mut rows = self.rows.write().await;
        Self::check_unique(&rows, &row, None)?;
        rows.push(row);
        if let Err(e) = self.persist(&rows).await {
            rows.pop();
            return Err(e);
        }

        debug!(kind = T::KIND, id = %record.id(), "created record");
        Ok(record)
    }

    async fn get_by_id(&self, id: Uuid) -> Result<T> {
        let rows = self.rows.read().await;
        let key = json!(id);
        rows.iter()
            .find(|row| row.get("id") == Some(&key))
            .map(decode_row::<T>)
            .unwrap_or_else(|| Err(not_found::<T>(id)))
    }

    async fn get_by_field(&self, field: &str, value: &Value) -> Result<Option<T>> {
        let rows = self.rows.read().await;
        rows.iter()
            .find(|row| row.get(field) == Some(value))
            .map(decode_row::<T>)
            .transpose()
    }

    async fn get_all_by_field(
        &self,
        field: &str,
        value: &Value,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<T>> {
        let rows = self.rows.read().await;
        rows.iter()
            .filter(|row| row.get(field) == Some(value))
            .skip(skip)
            .take(limit)
            .map(decode_row::<T>)
            .collect()
    }

    async fn get_all(&self, skip: usize, limit: usize) -> Result<Vec<T>> {
        let rows = self.rows.read().await;
        rows.iter().skip(skip).take(limit).map(decode_row::<T>).collect()
    }

    async fn update(&self, id: Uuid, attributes: Value) -> Result<T> {
        let patch = into_row(attributes)?;
        let locked = patch
            .keys()
            .find(|k| STORE_FIELDS.contains(&k.as_str()) || T::IMMUTABLE_FIELDS.contains(&k.as_str()));
        if let Some(field) = locked {
            return Err(ImageVaultError::Validation(format!(
                "'{}' cannot be changed on {}",
                field,
                T::KIND
            )));
        }

        let mut rows = self.rows.write().await;
        let key = json!(id);
        let index = rows
            .iter()
            .position(|row| row.get("id") == Some(&key))
            .ok_or_else(|| not_found::<T>(id))?;

        let mut merged = rows[index].clone();
        merged.extend(patch);
        merged.insert("updated_at".into(), json!(Utc::now()));

        let record: T = decode_row(&merged)?;
        let row = encode_row(&record)?;
        Self::check_unique(&rows, &row, Some(&key))?;

        let previous = std::mem::replace(&mut rows[index], row);
        if let Err(e) = self.persist(&rows).await {
            rows[index] = previous;
            return Err(e);
        }

        debug!(kind = T::KIND, %id, "updated record");
        Ok(record)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let key = json!(id);
        let index = rows
            .iter()
            .position(|row| row.get("id") == Some(&key))
            .ok_or_else(|| not_found::<T>(id))?;

        let removed = rows.remove(index);
        if let Err(e) = self.persist(&rows).await {
            rows.insert(index, removed);
            return Err(e);
        }

        debug!(kind = T::KIND, %id, "deleted record");
        Ok(true)
    }
}

fn into_row(attributes: Value) -> Result<Row> {
    match attributes {
        Value::Object(map) => Ok(map),
        other => Err(ImageVaultError::Validation(format!(
            "attributes must be a JSON object, got {}",
            other
        ))),
    }
}

fn decode_row<T: Record>(row: &Row) -> Result<T> {
    serde_json::from_value(Value::Object(row.clone()))
        .map_err(|e| ImageVaultError::Validation(format!("invalid {}: {}", T::KIND, e)))
}

fn encode_row<T: Record>(record: &T) -> Result<Row> {
    into_row(serde_json::to_value(record)?)
}

fn not_found<T: Record>(id: Uuid) -> ImageVaultError {
    ImageVaultError::NotFound(format!("{} {}", T::KIND, id))
}

// Write to a sibling temp file and rename over the target.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ImageRecord, UserRecord};
    use tempfile::tempdir;

    fn image_attributes(name: &str, owner: Uuid) -> Value {
        json!({ "name": name, "owner_id": owner })
    }

    fn user_attributes(email: &str) -> Value {
        json!({ "username": "someone", "email": email, "password_hash": "$argon2id$fake" })
    }

    #[tokio::test]
    async fn test_create_assigns_store_fields() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let owner = Uuid::new_v4();

        let image = repo.create(image_attributes("1-a.png", owner)).await.unwrap();
        assert_eq!(image.name, "1-a.png");
        assert_eq!(image.owner_id, owner);
        assert_eq!(image.created_at, image.updated_at);

        let fetched = repo.get_by_id(image.id).await.unwrap();
        assert_eq!(fetched, image);
    }

    #[tokio::test]
    async fn test_create_fills_serde_defaults() {
        let repo = MemoryRepository::<UserRecord>::new();
        let user = repo.create(user_attributes("a@example.com")).await.unwrap();
        assert!(user.is_active);
        assert!(!user.is_admin);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_attributes() {
        let repo = MemoryRepository::<ImageRecord>::new();

        let missing_owner = repo.create(json!({ "name": "x.png" })).await;
        assert!(matches!(missing_owner, Err(ImageVaultError::Validation(_))));

        let not_object = repo.create(json!(["x.png"])).await;
        assert!(matches!(not_object, Err(ImageVaultError::Validation(_))));

        let caller_id = repo
            .create(json!({ "id": Uuid::new_v4(), "name": "x.png", "owner_id": Uuid::new_v4() }))
            .await;
        assert!(matches!(caller_id, Err(ImageVaultError::Validation(_))));
    }

    #[tokio::test]
    async fn test_unique_field_enforced() {
        let repo = MemoryRepository::<UserRecord>::new();
        repo.create(user_attributes("dup@example.com")).await.unwrap();

        let result = repo.create(user_attributes("dup@example.com")).await;
        assert_eq!(
            result.unwrap_err(),
            ImageVaultError::Validation("user with this email already exists".into())
        );
        assert_eq!(repo.get_all(0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let result = repo.get_by_id(Uuid::new_v4()).await;
        assert!(matches!(result, Err(ImageVaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_all_by_field_paginates_in_creation_order() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        for i in 0..5 {
            repo.create(image_attributes(&format!("{i}.png"), owner)).await.unwrap();
            repo.create(image_attributes(&format!("other-{i}.png"), other)).await.unwrap();
        }

        let page = repo
            .get_all_by_field("owner_id", &json!(owner), 1, 3)
            .await
            .unwrap();
        let names: Vec<_> = page.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["1.png", "2.png", "3.png"]);

        let none = repo
            .get_all_by_field("no_such_field", &json!(owner), 0, 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let first = repo.get_by_field("name", &json!("other-4.png")).await.unwrap();
        assert_eq!(first.unwrap().owner_id, other);
    }

    #[tokio::test]
    async fn test_update_merges_and_touches_timestamp() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let image = repo.create(image_attributes("old.png", Uuid::new_v4())).await.unwrap();

        let updated = repo.update(image.id, json!({ "name": "old.jpg" })).await.unwrap();
        assert_eq!(updated.name, "old.jpg");
        assert_eq!(updated.owner_id, image.owner_id);
        assert_eq!(updated.created_at, image.created_at);
        assert!(updated.updated_at >= image.updated_at);
    }

    #[tokio::test]
    async fn test_update_rejects_immutable_fields() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let image = repo.create(image_attributes("a.png", Uuid::new_v4())).await.unwrap();

        for patch in [json!({ "owner_id": Uuid::new_v4() }), json!({ "id": Uuid::new_v4() })] {
            let result = repo.update(image.id, patch).await;
            assert!(matches!(result, Err(ImageVaultError::Validation(_))));
        }
        assert_eq!(repo.get_by_id(image.id).await.unwrap(), image);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let result = repo.update(Uuid::new_v4(), json!({ "name": "x.png" })).await;
        assert!(matches!(result, Err(ImageVaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = MemoryRepository::<ImageRecord>::new();
        let image = repo.create(image_attributes("a.png", Uuid::new_v4())).await.unwrap();

        assert!(repo.delete(image.id).await.unwrap());
        assert!(matches!(
            repo.delete(image.id).await,
            Err(ImageVaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("users.json");

        let created = {
            let repo = MemoryRepository::<UserRecord>::open(&path).await.unwrap();
            repo.create(user_attributes("kept@example.com")).await.unwrap()
        };

        let reopened = MemoryRepository::<UserRecord>::open(&path).await.unwrap();
        assert_eq!(reopened.get_by_id(created.id).await.unwrap(), created);

        let duplicate = reopened.create(user_attributes("kept@example.com")).await;
        assert!(matches!(duplicate, Err(ImageVaultError::Validation(_))));
    }
}
