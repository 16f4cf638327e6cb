use crate::adapters::storage::{ObjectStorage, StorageError, StoredObject};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;

#[derive(Clone, Debug)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    #[must_use]
    pub const fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    #[tracing::instrument(level = "debug", skip(self), err(level = "warn"))]
    async fn get(&self, key: &str, max_size: usize) -> Result<StoredObject, StorageError> {
        let output = self.client.get_object().bucket(&self.bucket).key(key).send().await.map_err(|e| match e {
            SdkError::ServiceError(ref service) if matches!(service.err(), GetObjectError::NoSuchKey(_)) => {
                StorageError::NotFound(key.to_string())
            }
            other => {
                tracing::error!(error = ?other, key = %key, "S3 download failed");
                StorageError::Backend(other.to_string())
            }
        })?;

        let size = u64::try_from(output.content_length.unwrap_or(0)).unwrap_or(0);
        if size > max_size as u64 {
            return Err(StorageError::TooLarge { size, max: max_size });
        }

        let content_type = output.content_type;
        let bytes = output.body.collect().await.map_err(|e| StorageError::Backend(e.to_string()))?.into_bytes();
        if bytes.len() > max_size {
            return Err(StorageError::TooLarge { size: bytes.len() as u64, max: max_size });
        }

        Ok(StoredObject { bytes, content_type })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }
}
