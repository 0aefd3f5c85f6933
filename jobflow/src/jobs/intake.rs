//! Job intake: validate, upload inputs, route, persist, enqueue.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::JobStore;
use crate::core::{BlobRef, Job, JobInput, JobKey, ProcessingEvent};
use crate::errors::{Result, ValidationError};
use crate::events::EventSink;
use crate::pipeline::PipelineRouter;
use crate::queue::{JobMessage, JobQueue};
use crate::storage::Storage;

/// Default upper bound on an uploaded document.
pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 100 * 1024 * 1024;

const PDF_MAGIC: &[u8] = b"%PDF";

/// Format of a secondary context document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    /// PDF specification.
    Pdf,
    /// Word document.
    Docx,
    /// Plain text.
    Text,
}

impl ContextKind {
    /// File extension used when storing the context.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Text => "txt",
        }
    }

    /// Detects the format from MIME type, then file name, then content.
    #[must_use]
    pub fn classify(content: &[u8], mime_type: Option<&str>, filename: Option<&str>) -> Self {
        if let Some(mime) = mime_type.map(str::to_ascii_lowercase) {
            if mime.contains("pdf") {
                return Self::Pdf;
            }
            if mime.contains("wordprocessingml") || mime.contains("msword") {
                return Self::Docx;
            }
            if mime.contains("text") {
                return Self::Text;
            }
        }
        if let Some(name) = filename.map(str::to_ascii_lowercase) {
            if name.ends_with(".pdf") {
                return Self::Pdf;
            }
            if name.ends_with(".docx") {
                return Self::Docx;
            }
            if name.ends_with(".txt") || name.ends_with(".text") {
                return Self::Text;
            }
        }
        if content.starts_with(PDF_MAGIC) {
            Self::Pdf
        } else if content.starts_with(b"PK") {
            Self::Docx
        } else {
            Self::Text
        }
    }
}

/// Secondary context supplied with a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextUpload {
    /// Raw bytes (file contents or UTF-8 text).
    pub content: Vec<u8>,
    /// Declared MIME type.
    pub mime_type: Option<String>,
    /// Original file name.
    pub filename: Option<String>,
}

impl ContextUpload {
    /// Context given as inline text.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: text.into().into_bytes(),
            mime_type: Some("text/plain".to_string()),
            filename: None,
        }
    }
}

/// A request to process one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeRequest {
    /// Tenant segment of the job key.
    pub tenant: String,
    /// Client segment of the job key.
    pub client: String,
    /// Primary document (PDF).
    pub document: Vec<u8>,
    /// Name of the primary document.
    pub filename: String,
    /// Optional secondary context.
    pub context: Option<ContextUpload>,
    /// Optional named pipeline.
    pub pipeline: Option<String>,
}

/// Creates jobs from intake requests.
pub struct JobIntake {
    storage: Arc<dyn Storage>,
    jobs: JobStore,
    queue: Arc<dyn JobQueue>,
    router: PipelineRouter,
    events: Arc<dyn EventSink>,
    retention_days: i64,
    max_document_bytes: usize,
}

impl std::fmt::Debug for JobIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobIntake")
            .field("backend", &self.storage.backend_name())
            .field("retention_days", &self.retention_days)
            .field("max_document_bytes", &self.max_document_bytes)
            .finish_non_exhaustive()
    }
}

impl JobIntake {
    /// Creates an intake path.
    #[must_use]
    pub fn new(
        storage: Arc<dyn Storage>,
        queue: Arc<dyn JobQueue>,
        router: PipelineRouter,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            jobs: JobStore::new(storage.clone()),
            storage,
            queue,
            router,
            events,
            retention_days: crate::checkpoint::DEFAULT_CHECKPOINT_RETENTION_DAYS,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }

    /// Sets how long job records are kept.
    #[must_use]
    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Sets the document size limit.
    #[must_use]
    pub fn with_max_document_bytes(mut self, bytes: usize) -> Self {
        self.max_document_bytes = bytes;
        self
    }

    /// Accepts a request and returns the queued job.
    ///
    /// Returns as soon as the job is persisted and announced on the queue;
    /// no stage runs here.
    pub async fn submit(&self, request: IntakeRequest) -> Result<Job> {
        self.validate(&request)?;
        let key = JobKey::generate(&request.tenant, &request.client)?;
        let input = self.upload_inputs(&key, &request).await?;

        let plan = self.router.route(&input, request.pipeline.as_deref());
        let job = Job::new(key, input, plan.pipeline, plan.stages, self.retention_days)?;
        self.jobs.create(&job).await?;
        self.events
            .emit(ProcessingEvent::job_created(&job.key.job_id, &job.pipeline))
            .await;
        self.queue.enqueue(JobMessage::for_job(&job.key)).await?;

        tracing::info!(
            job_key = %job.key,
            pipeline = %job.pipeline,
            stages = job.stage_plan.len(),
            has_context = job.input_refs.has_context(),
            "Job accepted"
        );
        Ok(job)
    }

    fn validate(&self, request: &IntakeRequest) -> std::result::Result<(), ValidationError> {
        if request.document.is_empty() {
            return Err(ValidationError::new("document", "file is empty"));
        }
        if request.document.len() > self.max_document_bytes {
            return Err(ValidationError::new(
                "document",
                format!("file size exceeds {}MB limit", self.max_document_bytes / (1024 * 1024)),
            ));
        }
        if !request.document.starts_with(PDF_MAGIC) {
            return Err(ValidationError::new("document", "not a PDF file"));
        }
        if let Some(context) = &request.context {
            if context.content.is_empty() {
                return Err(ValidationError::new("context", "context is empty"));
            }
        }
        Ok(())
    }

    async fn upload_inputs(&self, key: &JobKey, request: &IntakeRequest) -> Result<JobInput> {
        let prefix = format!("inputs/{}/{}/{}", key.tenant, key.client, key.job_id);
        let filename = sanitize_filename(&request.filename, "drawing.pdf");
        let primary = self
            .storage
            .put(&format!("{prefix}/{filename}"), request.document.clone())
            .await?;

        let mut input = JobInput::new(primary)
            .with_metadata("file_name", serde_json::json!(filename))
            .with_metadata("file_size_bytes", serde_json::json!(request.document.len()));

        if let Some(context) = &request.context {
            let kind = ContextKind::classify(
                &context.content,
                context.mime_type.as_deref(),
                context.filename.as_deref(),
            );
            let blob: BlobRef = self
                .storage
                .put(&format!("{prefix}/context.{}", kind.extension()), context.content.clone())
                .await?;
            input = input
                .with_context(blob)
                .with_metadata("context_type", serde_json::json!(kind));
        }
        Ok(input)
    }
}

fn sanitize_filename(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}
