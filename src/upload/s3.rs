//! S3 multipart upload backend.
//!
//! Parts smaller than the S3 minimum are buffered until 5 MiB accumulate;
//! the final part flushes whatever is left and completes the multipart
//! upload. Presigned URLs come from `rusty-s3`, requests go over `reqwest`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::ETAG;
use reqwest::Client;
use rusty_s3::actions::{CompleteMultipartUpload, CreateMultipartUpload, UploadPart};
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

use super::{UploadBackend, UploadBackendFactory};

/// Smallest part S3 accepts (except the last one).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

const PRESIGN_TTL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct S3Config {
    bucket: Bucket,
    credentials: Credentials,
    host_rewrite: Option<String>,
}

impl S3Config {
    pub fn new(
        endpoint: &str,
        region: impl Into<String>,
        bucket_name: impl Into<String>,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        host_rewrite: Option<String>,
    ) -> anyhow::Result<Self> {
        let url = Url::parse(endpoint).with_context(|| format!("invalid S3 endpoint: {endpoint}"))?;
        let bucket = Bucket::new(url, UrlStyle::VirtualHost, bucket_name.into(), region.into())?;
        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key.into(), secret_key.into()),
            host_rewrite,
        })
    }

    /// Public URL of an object, with the host rewritten if configured (e.g.
    /// a CDN in front of the bucket).
    pub fn object_url(&self, name: &str) -> anyhow::Result<Url> {
        let mut url = self.bucket.object_url(name)?;
        if let Some(host) = &self.host_rewrite {
            url.set_host(Some(host))
                .with_context(|| format!("invalid host rewrite: {host}"))?;
        }
        Ok(url)
    }
}

impl UploadBackendFactory for S3Config {
    fn create(&self, mime: &str) -> anyhow::Result<Arc<dyn UploadBackend>> {
        Ok(Arc::new(S3Uploader::new(self.clone(), mime)))
    }
}

/// Object extension for a recorder mime type.
pub fn extension_for(mime: &str) -> &'static str {
    if mime.starts_with("video/mp4") {
        "mp4"
    } else {
        "webm"
    }
}

/// `"abc"` → `abc`; S3 returns quoted etags.
pub fn unquote_etag(etag: &str) -> String {
    etag.replace('"', "")
}

struct Multipart {
    upload_id: String,
    object: String,
    next_part: u16,
    etags: Vec<String>,
    buffer: BytesMut,
    total_size: usize,
    /// The final data went out; only completion is left.
    final_flushed: bool,
}

pub struct S3Uploader {
    client: Client,
    config: S3Config,
    extension: &'static str,
    state: Mutex<Option<Multipart>>,
    location: Mutex<Option<String>>,
}

impl S3Uploader {
    pub fn new(config: S3Config, mime: &str) -> Self {
        Self {
            client: Client::new(),
            config,
            extension: extension_for(mime),
            state: Mutex::new(None),
            location: Mutex::new(None),
        }
    }

    async fn flush(&self, upload: &mut Multipart) -> anyhow::Result<()> {
        if upload.buffer.is_empty() && !upload.etags.is_empty() {
            return Ok(());
        }
        let action = UploadPart::new(
            &self.config.bucket,
            Some(&self.config.credentials),
            &upload.object,
            upload.next_part,
            &upload.upload_id,
        );
        let url = action.sign(PRESIGN_TTL);
        // Keep the bytes until the part succeeds so a retry resends them.
        let body: Bytes = upload.buffer.clone().freeze();
        let len = body.len();
        let res = self
            .client
            .put(url)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        let etag = res
            .headers()
            .get(ETAG)
            .ok_or_else(|| anyhow!("UploadPart response carried no ETag"))?
            .to_str()
            .context("ETag is not ASCII")?;
        upload.etags.push(unquote_etag(etag));
        upload.next_part += 1;
        upload.buffer.clear();
        upload.total_size += len;
        debug!(part = upload.next_part - 1, bytes = len, "S3 part uploaded");
        Ok(())
    }

    async fn complete(&self, upload: &Multipart) -> anyhow::Result<Url> {
        let action = CompleteMultipartUpload::new(
            &self.config.bucket,
            Some(&self.config.credentials),
            &upload.object,
            &upload.upload_id,
            upload.etags.iter().map(AsRef::as_ref),
        );
        let url = action.sign(PRESIGN_TTL);
        self.client
            .post(url)
            .body(action.body())
            .send()
            .await?
            .error_for_status()?;
        self.config.object_url(&upload.object)
    }
}

#[async_trait]
impl UploadBackend for S3Uploader {
    async fn begin(&self) -> anyhow::Result<()> {
        let object = format!("{}.{}", Uuid::new_v4(), self.extension);
        let mut action = CreateMultipartUpload::new(&self.config.bucket, Some(&self.config.credentials), &object);
        action.headers_mut().insert("x-amz-acl", "public-read");
        let url = action.sign(PRESIGN_TTL);
        let body = self
            .client
            .post(url)
            .header("x-amz-acl", "public-read")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let multipart = CreateMultipartUpload::parse_response(&body)?;
        info!(object = %object, "S3 multipart upload created");

        *self.location.lock().await = None;
        *self.state.lock().await = Some(Multipart {
            upload_id: multipart.upload_id().to_owned(),
            object,
            next_part: 1,
            etags: Vec::new(),
            buffer: BytesMut::with_capacity(MIN_PART_SIZE + MIN_PART_SIZE / 5),
            total_size: 0,
            final_flushed: false,
        });
        Ok(())
    }

    async fn part(&self, data: Bytes, is_final: bool) -> anyhow::Result<bool> {
        let mut guard = self.state.lock().await;
        let upload = guard.as_mut().ok_or_else(|| anyhow!("no upload in progress"))?;

        // A failed call leaves the buffer as it was so a retry of the same
        // part does not duplicate data.
        if !upload.final_flushed {
            let before = upload.buffer.len();
            upload.buffer.extend_from_slice(&data);
            let must_flush = is_final || upload.buffer.len() >= MIN_PART_SIZE;
            if must_flush {
                if let Err(e) = self.flush(upload).await {
                    upload.buffer.truncate(before);
                    return Err(e);
                }
            }
            if !is_final {
                return Ok(false);
            }
            upload.final_flushed = true;
        }

        let url = self.complete(upload).await?;
        info!(url = %url, bytes = upload.total_size, "S3 upload complete");
        *self.location.lock().await = Some(url.to_string());
        guard.take();
        Ok(true)
    }

    async fn location(&self) -> Option<String> {
        self.location.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rewrite: Option<&str>) -> S3Config {
        S3Config::new(
            "https://s3.eu-central-1.amazonaws.com",
            "eu-central-1",
            "captures",
            "AKIA",
            "secret",
            rewrite.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn test_object_url_virtual_host() {
        let url = config(None).object_url("abc.webm").unwrap();
        assert_eq!(url.as_str(), "https://captures.s3.eu-central-1.amazonaws.com/abc.webm");
    }

    #[test]
    fn test_object_url_host_rewrite() {
        let url = config(Some("cdn.example.com")).object_url("abc.webm").unwrap();
        assert_eq!(url.as_str(), "https://cdn.example.com/abc.webm");
    }

    #[test]
    fn test_invalid_endpoint() {
        assert!(S3Config::new("not a url", "r", "b", "k", "s", None).is_err());
    }

    #[test]
    fn test_unquote_and_extension() {
        assert_eq!(unquote_etag("\"d41d8cd9\""), "d41d8cd9");
        assert_eq!(extension_for("video/mp4"), "mp4");
        assert_eq!(extension_for("video/webm;codecs=vp9"), "webm");
    }

    #[tokio::test]
    async fn test_part_without_begin_fails() {
        let uploader = S3Uploader::new(config(None), "video/webm");
        assert!(uploader.part(Bytes::from_static(b"x"), false).await.is_err());
        assert_eq!(uploader.location().await, None);
    }
}
