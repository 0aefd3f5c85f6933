//! Networked storage backend over an HTTP object and table service.
//!
//! Endpoints, relative to the base URL:
//!
//! | Operation        | Request                                         |
//! |------------------|-------------------------------------------------|
//! | put / get        | `PUT` / `GET /blobs/{key}`                      |
//! | exists           | `HEAD /blobs/{key}`                             |
//! | retrieval_url    | `POST /presign` `{key, ttl_seconds}`            |
//! | put_record       | `PUT /tables/{table}/records/{key}`             |
//! | get/delete       | `GET` / `DELETE /tables/{table}/records/{key}`  |
//! | query_by_index   | `POST /tables/{table}/query` `{index, query}`   |
//! | scan_records     | `GET /tables/{table}/records`                   |
//!
//! The service answers a failed write condition with `412 Precondition
//! Failed` and a missing item with `404 Not Found`.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{
    validate_blob_key, validate_record_key, IndexQuery, IndexSpec, Record, Storage, WriteCondition,
};
use crate::core::BlobRef;
use crate::errors::{ConflictError, JobflowError, NotFoundError, Result};

/// HTTP client for a remote object and table service.
#[derive(Debug, Clone)]
pub struct RemoteStorage {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Serialize)]
struct PutRecordRequest<'a> {
    record: &'a Record,
    condition: &'a WriteCondition,
}

#[derive(Debug, Serialize)]
struct QueryRequest<'a> {
    index: &'a IndexSpec,
    query: &'a IndexQuery,
}

#[derive(Debug, Serialize)]
struct PresignRequest<'a> {
    key: &'a str,
    ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct PresignResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ScannedRecord {
    key: String,
    record: Record,
}

impl RemoteStorage {
    /// Creates a client for the service at `base_url`.
    pub fn new(base_url: impl AsRef<str>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())
            .map_err(|e| JobflowError::Config(format!("invalid storage base_url: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(JobflowError::Config(format!(
                "storage base_url '{base_url}' cannot carry paths"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobflowError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, base_url })
    }

    fn endpoint<'a, I>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| JobflowError::storage("base URL cannot carry paths"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn blob_url(&self, key: &str) -> Result<Url> {
        validate_blob_key(key)?;
        self.endpoint(std::iter::once("blobs").chain(key.split('/')))
    }

    fn record_url(&self, table: &str, key: &str) -> Result<Url> {
        validate_record_key(table, key)?;
        self.endpoint(["tables", table, "records", key])
    }

    /// Maps non-success responses onto the shared error taxonomy.
    async fn check(
        response: reqwest::Response,
        table: &str,
        key: &str,
    ) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::PRECONDITION_FAILED | StatusCode::CONFLICT => {
                Err(ConflictError::new(table, key, body).into())
            }
            StatusCode::NOT_FOUND => Err(NotFoundError::new(format!("{table}/{key}")).into()),
            _ => Err(JobflowError::storage(format!(
                "remote storage returned {status} for {table}/{key}: {body}"
            ))),
        }
    }
}

fn transport_error(err: reqwest::Error) -> JobflowError {
    JobflowError::storage(format!("remote storage request failed: {err}"))
}

#[async_trait]
impl Storage for RemoteStorage {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<BlobRef> {
        let response = self
            .client
            .put(self.blob_url(key)?)
            .body(bytes)
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response, "blobs", key).await?;
        Ok(BlobRef::new(key))
    }

    async fn get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(self.blob_url(blob.as_str())?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, "blobs", blob.as_str()).await?;
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        let response = self
            .client
            .head(self.blob_url(blob.as_str())?)
            .send()
            .await
            .map_err(transport_error)?;
        match Self::check(response, "blobs", blob.as_str()).await {
            Ok(_) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn retrieval_url(&self, blob: &BlobRef, ttl: Duration) -> Result<String> {
        validate_blob_key(blob.as_str())?;
        let response = self
            .client
            .post(self.endpoint(["presign"])?)
            .json(&PresignRequest {
                key: blob.as_str(),
                ttl_seconds: ttl.as_secs(),
            })
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, "blobs", blob.as_str()).await?;
        let presigned: PresignResponse = response.json().await.map_err(transport_error)?;
        Ok(presigned.url)
    }

    async fn put_record(
        &self,
        table: &str,
        key: &str,
        record: Record,
        condition: WriteCondition,
    ) -> Result<()> {
        let response = self
            .client
            .put(self.record_url(table, key)?)
            .json(&PutRecordRequest {
                record: &record,
                condition: &condition,
            })
            .send()
            .await
            .map_err(transport_error)?;
        Self::check(response, table, key).await?;
        Ok(())
    }

    async fn get_record(&self, table: &str, key: &str) -> Result<Record> {
        let response = self
            .client
            .get(self.record_url(table, key)?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, table, key).await?;
        response.json().await.map_err(transport_error)
    }

    async fn delete_record(&self, table: &str, key: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.record_url(table, key)?)
            .send()
            .await
            .map_err(transport_error)?;
        match Self::check(response, table, key).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn query_by_index(
        &self,
        table: &str,
        index: &IndexSpec,
        query: &IndexQuery,
    ) -> Result<Vec<Record>> {
        let response = self
            .client
            .post(self.endpoint(["tables", table, "query"])?)
            .json(&QueryRequest { index, query })
            .send()
            .await
            .map_err(transport_error)?;
        let response = Self::check(response, table, &index.name).await?;
        response.json().await.map_err(transport_error)
    }

    async fn scan_records(&self, table: &str) -> Result<Vec<(String, Record)>> {
        let response = self
            .client
            .get(self.endpoint(["tables", table, "records"])?)
            .send()
            .await
            .map_err(transport_error)?;
        let response = match Self::check(response, table, "*").await {
            Ok(response) => response,
            Err(err) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let rows: Vec<ScannedRecord> = response.json().await.map_err(transport_error)?;
        Ok(rows.into_iter().map(|row| (row.key, row.record)).collect())
    }
}
