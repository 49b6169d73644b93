//! Request-path orchestration: users, uploads, guarded reads, transforms and
//! deletes over a blob store and two record repositories.

use serde::Serialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::config::Config;
use crate::error::{ImageVaultError, Result};
use crate::guard;
use crate::image_handler::{self, OutputFormat};
use crate::models::{ImageRecord, UserProfile, UserRecord};
use crate::password;
use crate::pipeline;
use crate::records::Repository;
use crate::spec::TransformationSpec;

pub const TRANSFORM_SUCCESS_MESSAGE: &str = "Image successfully transformed";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Maximum number of CPU-bound jobs (pipelines, password hashes) in flight.
    pub workers: usize,
    pub presign_ttl: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            presign_ttl: Duration::from_secs(3600),
        }
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            presign_ttl: config.presign_ttl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadedImage {
    pub record: ImageRecord,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransformOutcome {
    pub message: String,
    pub record: ImageRecord,
    pub url: String,
    pub format: String,
    pub width: u32,
    pub height: u32,
}

pub struct MediaService<B, I, U> {
    blobs: Arc<B>,
    images: Arc<I>,
    users: Arc<U>,
    workers: Arc<Semaphore>,
    presign_ttl: Duration,
}

impl<B, I, U> MediaService<B, I, U>
where
    B: BlobStore,
    I: Repository<ImageRecord>,
    U: Repository<UserRecord>,
{
    pub fn new(blobs: Arc<B>, images: Arc<I>, users: Arc<U>, options: ServiceOptions) -> Self {
        Self {
            blobs,
            images,
            users,
            workers: Arc::new(Semaphore::new(options.workers.max(1))),
            presign_ttl: options.presign_ttl,
        }
    }

    // -- Users ---------------------------------------------------------------

    #[instrument(skip(self, password))]
    pub async fn register_user(&self, username: &str, email: &str, password: &str) -> Result<UserRecord> {
        let username = username.trim();
        let email = email.trim().to_lowercase();
        if username.is_empty() {
            return Err(ImageVaultError::Validation("username must not be empty".into()));
        }
        if !is_plausible_email(&email) {
            return Err(ImageVaultError::Validation(format!("invalid email: {}", email)));
        }
        password::validate_password_strength(password)?;

        if self.users.get_by_field("email", &json!(email)).await?.is_some() {
            return Err(ImageVaultError::Validation("User already exists!".into()));
        }

        let plaintext = password.to_string();
        let password_hash = self.run_blocking(move || password::hash_password(&plaintext)).await?;

        let user = self
            .users
            .create(json!({
                "username": username,
                "email": email,
                "password_hash": password_hash,
            }))
            .await?;
        info!(user_id = %user.id, "registered user");
        Ok(user)
    }

    /// Check a login. Every failure is reported as `Unauthorized`.
    #[instrument(skip(self, password))]
    pub async fn verify_credentials(&self, email: &str, password: &str) -> Result<UserRecord> {
        let email = email.trim().to_lowercase();
        let plaintext = password.to_string();
        let Some(user) = self.users.get_by_field("email", &json!(email)).await? else {
            self.run_blocking(move || {
                password::verify_against_dummy(&plaintext);
                Ok(())
            })
            .await?;
            return Err(ImageVaultError::Unauthorized);
        };

        let hash = user.password_hash.clone();
        let matches = self
            .run_blocking(move || password::verify_password(&plaintext, &hash))
            .await?;
        if !matches || !user.is_active {
            return Err(ImageVaultError::Unauthorized);
        }
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<UserProfile> {
        Ok(UserProfile::from(&self.users.get_by_id(user_id).await?))
    }

    pub async fn list_users(&self, skip: usize, limit: usize) -> Result<Vec<UserProfile>> {
        let users = self.users.get_all(skip, limit).await?;
        Ok(users.iter().map(UserProfile::from).collect())
    }

    // -- Images --------------------------------------------------------------

    /// Store a new image for `user_id` under a generated key that keeps the
    /// upload's extension.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub async fn upload(&self, user_id: Uuid, filename: &str, bytes: Vec<u8>) -> Result<UploadedImage> {
        let owner = self.users.get_by_id(user_id).await?;
        if !owner.is_active {
            return Err(ImageVaultError::Unauthorized);
        }
        if bytes.is_empty() {
            return Err(ImageVaultError::Validation("uploaded file is empty".into()));
        }

        let declared = OutputFormat::from_key(filename)?;
        let actual = image_handler::sniff_format(&bytes)?;
        if declared != actual {
            return Err(ImageVaultError::Validation(format!(
                "file is named .{} but contains {}",
                declared, actual
            )));
        }

        let key = storage_key(filename, chrono::Utc::now().timestamp());
        let url = retry_once("blob put", || self.blobs.put(&key, &bytes, declared.content_type())).await?;

        let record = match self
            .images
            .create(json!({ "name": key, "owner_id": user_id }))
            .await
        {
            Ok(record) => record,
            Err(e) => {
                if let Err(cleanup) = self.blobs.delete(&key).await {
                    warn!(key, error = %cleanup, "could not remove blob after failed record create");
                }
                return Err(e);
            }
        };

        info!(image_id = %record.id, key = %record.name, "uploaded image");
        Ok(UploadedImage { record, url })
    }

    pub async fn list_images(&self, user_id: Uuid, skip: usize, limit: usize) -> Result<Vec<ImageRecord>> {
        self.images
            .get_all_by_field("owner_id", &json!(user_id), skip, limit)
            .await
    }

    pub async fn get_image(&self, image_id: Uuid, user_id: Uuid) -> Result<ImageRecord> {
        let record = self.images.get_by_id(image_id).await?;
        guard::authorize(&record, user_id)?;
        Ok(record)
    }

    /// Presigned, time-limited URL for an image the caller owns.
    #[instrument(skip(self))]
    pub async fn image_url(&self, image_id: Uuid, user_id: Uuid) -> Result<String> {
        let record = self.get_image(image_id, user_id).await?;
        self.blobs.presigned_url(&record.name, self.presign_ttl).await
    }

    /// Run `spec` over a stored image and store the result.
    ///
    /// The output key is the original stem with the resolved extension, so
    /// a retried request overwrites instead of duplicating. When the key
    /// changes the record is pointed at the new blob and the old blob is
    /// removed on a best-effort basis.
    #[instrument(skip(self, spec))]
    pub async fn transform(
        &self,
        image_id: Uuid,
        user_id: Uuid,
        spec: TransformationSpec,
    ) -> Result<TransformOutcome> {
        let record = self.get_image(image_id, user_id).await?;
        spec.validate()?;

        let original_format = extension_of(&record.name).to_string();
        let original = retry_once("blob get", || self.blobs.get(&record.name)).await?;

        let output = self
            .run_blocking(move || pipeline::apply(&original, &spec, &original_format))
            .await?;

        let new_key = match OutputFormat::from_key(&record.name) {
            Ok(current) if current == output.format => record.name.clone(),
            _ => replace_extension(&record.name, output.format.extension()),
        };
        let url = retry_once("blob put", || {
            self.blobs.put(&new_key, &output.bytes, output.format.content_type())
        })
        .await?;

        let updated = self
            .images
            .update(record.id, json!({ "name": new_key }))
            .await?;

        if new_key != record.name {
            if let Err(e) = self.blobs.delete(&record.name).await {
                warn!(key = %record.name, error = %e, "could not remove superseded blob");
            }
        }

        info!(
            image_id = %updated.id,
            key = %updated.name,
            width = output.width,
            height = output.height,
            "transformed image"
        );
        Ok(TransformOutcome {
            message: TRANSFORM_SUCCESS_MESSAGE.to_string(),
            record: updated,
            url,
            format: output.format.to_string(),
            width: output.width,
            height: output.height,
        })
    }

    /// Remove both the blob and the record of an image the caller owns.
    #[instrument(skip(self))]
    pub async fn delete(&self, image_id: Uuid, user_id: Uuid) -> Result<()> {
        let record = self.get_image(image_id, user_id).await?;
        retry_once("blob delete", || self.blobs.delete(&record.name)).await?;
        self.images.delete(record.id).await?;
        info!(%image_id, key = %record.name, "deleted image");
        Ok(())
    }

    // Runs CPU-bound work off the async workers, at most `workers` at a time.
    async fn run_blocking<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ImageVaultError::Internal("worker pool closed".into()))?;
        tokio::task::spawn_blocking(job)
            .await
            .map_err(|e| ImageVaultError::Internal(format!("worker task failed: {}", e)))?
    }
}

async fn retry_once<T, F, Fut>(operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match call().await {
        Err(e) if e.is_transient() => {
            warn!(operation, error = %e, "transient store failure, retrying once");
            call().await
        }
        other => other,
    }
}

/// `<unix seconds>-<8 hex chars>-<sanitized filename>`.
pub fn storage_key(filename: &str, unix_secs: i64) -> String {
    let nonce: [u8; 4] = rand::random();
    format!("{}-{}-{}", unix_secs, hex::encode(nonce), sanitize_filename(filename))
}

fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    base.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_of(name: &str) -> &str {
    name.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("")
}

fn replace_extension(name: &str, extension: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, _)) => format!("{}.{}", stem, extension),
        None => format!("{}.{}", name, extension),
    }
}

fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.contains('@'),
        None => false,
    }
}
