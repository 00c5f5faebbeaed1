//! S3-based state storage backend.
//!
//! Each unit is stored at `<prefix><unit>/state.json`. Writes use S3
//! conditional requests: `If-Match` with the `ETag` of the version that was
//! checked, or `If-None-Match: *` for the first write, so a concurrent writer
//! makes the put fail with 412 instead of being overwritten.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use tracing::{debug, info};

use crate::error::{Result, StackplanError, StateError};

use super::store::{StateStore, check_version, decode, encode};
use super::types::StateSnapshot;

/// State object name within a unit's key prefix.
const STATE_KEY: &str = "state.json";

/// S3-based state store.
#[derive(Debug, Clone)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
}

/// A stored object with its entity tag.
struct StoredObject {
    snapshot: StateSnapshot,
    e_tag: Option<String>,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the S3 key of a unit's snapshot.
    fn key(&self, unit: &str) -> String {
        format!("{}{unit}/{STATE_KEY}", self.prefix)
    }

    /// Fetches a unit's snapshot and its `ETag`.
    async fn get(&self, unit: &str) -> Result<Option<StoredObject>> {
        let key = self.key(unit);
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let e_tag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::backend(format!("Failed to read s3://{}/{key}: {e}", self.bucket))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}"))
                })?;

                Ok(Some(StoredObject {
                    snapshot: decode(unit, &content)?,
                    e_tag,
                }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn stored_version(&self, unit: &str) -> Result<u64> {
        Ok(self.get(unit).await?.map_or(0, |o| o.snapshot.version))
    }
}

/// Normalizes a key prefix to empty or `path/`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

/// Returns true if S3 refused a conditional put because of a race.
fn is_precondition_failure(err: &SdkError<PutObjectError, HttpResponse>) -> bool {
    matches!(
        err.raw_response().map(|r| r.status().as_u16()),
        Some(409 | 412)
    )
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, unit: &str) -> Result<StateSnapshot> {
        debug!("Loading state of {unit} from s3://{}/{}", self.bucket, self.key(unit));

        match self.get(unit).await? {
            Some(object) => {
                info!("Loaded state of {unit} (version {})", object.snapshot.version);
                Ok(object.snapshot)
            }
            None => {
                debug!("No state for {unit} in S3");
                Ok(StateSnapshot::new(unit))
            }
        }
    }

    async fn save(&self, snapshot: &StateSnapshot, expected_version: u64) -> Result<u64> {
        let unit = snapshot.unit.as_str();
        let key = self.key(unit);

        let current = self.get(unit).await?;
        let found = current.as_ref().map_or(0, |o| o.snapshot.version);
        check_version(unit, expected_version, found)?;

        let version = expected_version + 1;
        let content = encode(snapshot, version)?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(content.into_bytes().into())
            .content_type("application/json");

        request = match current.and_then(|o| o.e_tag) {
            Some(e_tag) => request.if_match(e_tag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => {
                debug!("Saved state of {unit} to s3://{}/{key} at version {version}", self.bucket);
                Ok(version)
            }
            Err(err) if is_precondition_failure(&err) => {
                let found = self.stored_version(unit).await?;
                Err(StateError::ConcurrentModification {
                    unit: unit.to_string(),
                    expected: expected_version,
                    found,
                }
                .into())
            }
            Err(err) => Err(StackplanError::State(StateError::backend(format!(
                "S3 put error: {}",
                err.into_service_error()
            )))),
        }
    }

    async fn delete(&self, unit: &str, expected_version: u64) -> Result<()> {
        let found = self.stored_version(unit).await?;
        check_version(unit, expected_version, found)?;

        let key = self.key(unit);
        info!("Deleting state of {unit} from s3://{}/{key}", self.bucket);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StateError::backend(format!("S3 delete error: {}", e.into_service_error())))?;

        Ok(())
    }

    async fn list_units(&self) -> Result<Vec<String>> {
        let mut units = Vec::new();
        let mut token: Option<String> = None;
        let suffix = format!("/{STATE_KEY}");

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| StateError::backend(format!("S3 list error: {}", e.into_service_error())))?;

            units.extend(response.contents().iter().filter_map(|object| {
                object
                    .key()
                    .and_then(|k| k.strip_prefix(self.prefix.as_str()))
                    .and_then(|k| k.strip_suffix(suffix.as_str()))
                    .filter(|unit| !unit.contains('/'))
                    .map(str::to_string)
            }));

            match response.next_continuation_token() {
                Some(next) if response.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        units.sort();
        Ok(units)
    }

    async fn current_version(&self, unit: &str) -> Result<u64> {
        self.stored_version(unit).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(prefix: Option<&str>) -> S3StateStore {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("eu-west-1"))
            .build();
        S3StateStore::with_client(Client::from_conf(config), "state-bucket", prefix)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("/n8n/prod/")), "n8n/prod/");
    }

    #[test]
    fn test_unit_keys() {
        assert_eq!(store(Some("n8n")).key("network"), "n8n/network/state.json");
        assert_eq!(store(None).key("compute"), "compute/state.json");
        assert_eq!(store(None).backend_type(), "s3");
    }
}
