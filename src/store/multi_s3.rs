//! Multi-bucket S3 origin store.
//!
//! Holds one client per configured origin bucket, in config order. Every
//! call must carry `Extras::MultiBucket { index }` naming the bucket to
//! talk to. No key hashing happens here: the caching store sends the
//! external object name, because the remote buckets store by name.

use std::time::Instant;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_object::HeadObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ObjectCannedAcl;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

use super::{Extras, ObjectStore, StoreError, StoreResult, Trace};
use crate::config::S3OriginConfig;

const NAME: &str = "multiS3";

struct S3Origin {
    client: Client,
    bucket: String,
}

pub struct MultiS3Store {
    origins: Vec<S3Origin>,
}

impl MultiS3Store {
    /// Build one client per configured bucket, in bucket-index order.
    #[must_use]
    pub fn new(configs: &[S3OriginConfig]) -> Self {
        let origins = configs
            .iter()
            .map(|cfg| {
                let sdk_config = aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .credentials_provider(Credentials::new(
                        cfg.id.clone(),
                        cfg.secret.clone(),
                        None,
                        None,
                        "edge-store-config",
                    ))
                    .region(Region::new(cfg.region.clone()))
                    .endpoint_url(cfg.endpoint.clone())
                    .force_path_style(true)
                    .build();
                S3Origin {
                    client: Client::from_conf(sdk_config),
                    bucket: cfg.bucket.clone(),
                }
            })
            .collect();
        Self { origins }
    }

    fn origin(&self, extras: Extras) -> StoreResult<(usize, &S3Origin)> {
        match extras {
            Extras::MultiBucket { index } if index < self.origins.len() => {
                Ok((index, &self.origins[index]))
            }
            _ => Err(StoreError::BadExtras { store: NAME }),
        }
    }
}

/// First 8 chars of a name, for log lines.
fn short(name: &str) -> &str {
    if name.len() > 8 {
        &name[..8]
    } else {
        name
    }
}

#[async_trait]
impl ObjectStore for MultiS3Store {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn has(&self, key: &str, extras: Extras) -> StoreResult<bool> {
        let (_, origin) = self.origin(extras)?;
        match origin
            .client
            .head_object()
            .bucket(&origin.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(ctx)) if matches!(ctx.err(), HeadObjectError::NotFound(_)) => {
                Ok(false)
            }
            Err(err) => Err(StoreError::Origin(DisplayErrorContext(&err).to_string())),
        }
    }

    async fn get(&self, key: &str, extras: Extras) -> (StoreResult<Bytes>, Trace) {
        let start = Instant::now();
        let (index, origin) = match self.origin(extras) {
            Ok(origin) => origin,
            Err(err) => return (Err(err), Trace::new(NAME, start.elapsed())),
        };
        debug!("fetching {} from origin bucket {index}", short(key));

        let result = origin
            .client
            .get_object()
            .bucket(&origin.bucket)
            .key(key)
            .send()
            .await;
        let object = match result {
            Ok(resp) => match resp.body.collect().await {
                Ok(data) => Ok(data.into_bytes()),
                Err(err) => Err(StoreError::Origin(err.to_string())),
            },
            Err(SdkError::ServiceError(ctx)) if matches!(ctx.err(), GetObjectError::NoSuchKey(_)) => {
                Err(StoreError::NotFound)
            }
            Err(SdkError::ServiceError(ctx)) if ctx.err().code() == Some("NoSuchBucket") => {
                Err(StoreError::NoSuchBucket(origin.bucket.clone()))
            }
            Err(err) => Err(StoreError::Origin(DisplayErrorContext(&err).to_string())),
        };
        debug!(
            "fetching {} from origin bucket {index} took {:?}",
            short(key),
            start.elapsed()
        );
        (object, Trace::new(NAME, start.elapsed()))
    }

    async fn put(&self, key: &str, object: Bytes, extras: Extras) -> StoreResult<()> {
        let (index, origin) = self.origin(extras)?;
        let start = Instant::now();
        debug!("uploading {} to origin bucket {index}", short(key));

        // public-read for compatibility with the existing buckets
        let result = origin
            .client
            .put_object()
            .bucket(&origin.bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .body(ByteStream::from(object))
            .send()
            .await;
        debug!("uploading {} took {:?}", short(key), start.elapsed());
        match result {
            Ok(_) => Ok(()),
            Err(err) => Err(StoreError::Origin(DisplayErrorContext(&err).to_string())),
        }
    }

    async fn delete(&self, key: &str, extras: Extras) -> StoreResult<()> {
        let (index, origin) = self.origin(extras)?;
        debug!("deleting {} from origin bucket {index}", short(key));

        origin
            .client
            .delete_object()
            .bucket(&origin.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::Origin(DisplayErrorContext(&err).to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MultiS3Store {
        MultiS3Store::new(&[S3OriginConfig {
            id: "id".to_string(),
            secret: "secret".to_string(),
            region: "us-east-1".to_string(),
            bucket: "bucket".to_string(),
            endpoint: "http://127.0.0.1:9999".to_string(),
        }])
    }

    #[tokio::test]
    async fn missing_extras_is_rejected() {
        let store = store();
        let err = store.has("x", Extras::None).await.unwrap_err();
        assert_eq!(err, StoreError::BadExtras { store: "multiS3" });
    }

    #[tokio::test]
    async fn out_of_range_bucket_index_is_rejected() {
        let store = store();
        let err = store
            .put("x", Bytes::from_static(b"x"), Extras::MultiBucket { index: 7 })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::BadExtras { store: "multiS3" });

        let (object, trace) = store.get("x", Extras::MultiBucket { index: 7 }).await;
        assert_eq!(object.unwrap_err(), StoreError::BadExtras { store: "multiS3" });
        assert!(trace.visited("multiS3"));
    }

    #[test]
    fn short_truncates_long_names() {
        assert_eq!(short("abcdefghij"), "abcdefgh");
        assert_eq!(short("abc"), "abc");
    }
}
