use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use url::Url;

use super::{BlockStore, StoreError};

/// Object-store backed by an S3 bucket.
///
/// Keys derive deterministically from artifact names
/// (`<prefix>/<name>.<extension>`), so re-uploading after a crash overwrites
/// the same object and stays idempotent.
#[derive(Debug)]
pub struct S3BlockStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
    extension: String,
}

impl S3BlockStore {
    /// Opens `s3://bucket/prefix` using ambient AWS configuration
    /// (environment, profile, instance role).
    pub async fn open(url: &Url, extension: &str) -> Result<Self, StoreError> {
        let bucket = url
            .host_str()
            .ok_or_else(|| StoreError::UnsupportedUrl {
                url: url.to_string(),
            })?
            .to_owned();
        let prefix = url.path().trim_matches('/').to_owned();

        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Ok(S3BlockStore {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
            prefix,
            extension: extension.to_owned(),
        })
    }

    fn key_for(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            format!("{name}.{}", self.extension)
        } else {
            format!("{}/{name}.{}", self.prefix, self.extension)
        }
    }

    fn remote_error(
        operation: &'static str,
        key: String,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> StoreError {
        StoreError::Remote {
            operation,
            key,
            source: Box::new(source),
        }
    }
}

#[async_trait]
impl BlockStore for S3BlockStore {
    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<(), StoreError> {
        let key = self.key_for(name);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|error| Self::remote_error("put_object", key, error))?;
        Ok(())
    }

    async fn read(&self, name: &str) -> Result<Bytes, StoreError> {
        let key = self.key_for(name);
        let output = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(output) => output,
            Err(error) => {
                let service = error.into_service_error();
                if service.is_no_such_key() {
                    return Err(StoreError::NotFound {
                        store: self.location(),
                        name: name.to_owned(),
                    });
                }
                return Err(Self::remote_error("get_object", key, service));
            }
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|error| Self::remote_error("get_object", key, error))?;
        Ok(data.into_bytes())
    }

    async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let key = self.key_for(name);
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(error) => {
                let service = error.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::remote_error("head_object", key, service))
                }
            }
        }
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let key = self.key_for(name);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|error| Self::remote_error("delete_object", key, error))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let list_prefix = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };
        let suffix = format!(".{}", self.extension);

        let mut names = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(&list_prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page =
                page.map_err(|error| Self::remote_error("list_objects_v2", list_prefix.clone(), error))?;
            for object in page.contents() {
                let Some(key) = object.key() else { continue };
                let Some(rest) = key.strip_prefix(&list_prefix) else {
                    continue;
                };
                if let Some(name) = rest.strip_suffix(&suffix) {
                    // Nested keys belong to other writers.
                    if !name.contains('/') {
                        names.push(name.to_owned());
                    }
                }
            }
        }

        names.sort_unstable();
        Ok(names)
    }
}
