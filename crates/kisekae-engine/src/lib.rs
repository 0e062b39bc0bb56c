use std::env;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use image::GenericImageView;
use kisekae_contracts::batch::{
    effective_prompt, ArtifactRef, EditOutput, EditRequest, PersistedArtifact, RunLog,
};
use kisekae_contracts::events::{EventPayload, EventWriter};
use kisekae_contracts::session::{
    artifact_file_name, extension_for_reference, session_timestamp, Session,
};
use kisekae_contracts::summary::{write_summary, RunSummary};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub use kisekae_contracts::batch::RunOptions;

pub const DEFAULT_MODEL: &str = "qwen/qwen-image-edit";
pub const DEFAULT_OUTPUT_QUALITY: u32 = 80;

/// Connection settings for the remote editing service. Built once at the
/// process edge and handed to [`ReplicateEditor::new`]; nothing below this
/// layer reads the environment.
#[derive(Debug, Clone)]
pub struct ReplicateConfig {
    pub api_base: String,
    pub api_token: String,
    pub model: String,
    pub output_quality: u32,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub request_timeout: Duration,
}

impl ReplicateConfig {
    pub fn from_env() -> Result<Self> {
        let api_token = non_empty_env("REPLICATE_API_TOKEN")
            .or_else(|| non_empty_env("REPLICATE_API_KEY"))
            .context("REPLICATE_API_TOKEN not set")?;
        Ok(Self {
            api_base: non_empty_env("REPLICATE_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.replicate.com/v1".to_string()),
            api_token,
            model: non_empty_env("KISEKAE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            output_quality: DEFAULT_OUTPUT_QUALITY,
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(120),
        })
    }
}

/// The remote generative editing service: one source image plus a prompt in,
/// one or more artifact references out.
pub trait ImageEditor: Send + Sync {
    fn edit(&self, request: &EditRequest) -> Result<EditOutput>;
}

pub struct ReplicateEditor {
    config: ReplicateConfig,
    http: HttpClient,
}

impl ReplicateEditor {
    pub fn new(config: ReplicateConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { config, http })
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/predictions", self.config.api_base)
    }

    fn image_data_uri(path: &Path) -> Result<String> {
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime = mime_for_path(path).unwrap_or("application/octet-stream");
        Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
    }

    fn poll_prediction(&self, poll_url: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(&self.config.api_token)
                .send()
                .with_context(|| format!("edit service poll failed ({poll_url})"))?;
            let payload = response_json_or_error("edit service poll", response)?;
            let status = payload
                .get("status")
                .and_then(Value::as_str)
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or_default();
            if status == "succeeded" {
                return Ok(payload);
            }
            if matches!(status.as_str(), "failed" | "canceled") {
                bail!("edit prediction failed: {}", payload);
            }
            if started.elapsed() >= self.config.poll_timeout {
                bail!(
                    "edit polling timed out after {:.1}s",
                    self.config.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(url) => {
                let trimmed = url.trim();
                if !trimmed.is_empty()
                    && trimmed.starts_with("http")
                    && !out.iter().any(|existing| existing == trimmed)
                {
                    out.push(trimmed.to_string());
                }
            }
            Value::Array(rows) => {
                for row in rows {
                    Self::extract_output_urls(row, out);
                }
            }
            Value::Object(obj) => {
                if let Some(url) = obj.get("url") {
                    Self::extract_output_urls(url, out);
                }
                if let Some(urls) = obj.get("urls") {
                    Self::extract_output_urls(urls, out);
                }
                if let Some(output) = obj.get("output") {
                    Self::extract_output_urls(output, out);
                }
            }
            _ => {}
        }
    }
}

impl ImageEditor for ReplicateEditor {
    fn edit(&self, request: &EditRequest) -> Result<EditOutput> {
        let endpoint = self.predictions_endpoint();
        let payload = json!({
            "model": self.config.model,
            "input": {
                "image": Self::image_data_uri(&request.source)?,
                "prompt": request.prompt,
                "output_quality": self.config.output_quality,
            },
        });

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.config.api_token)
            .header("Prefer", "wait")
            .json(&payload)
            .send()
            .with_context(|| format!("edit request failed ({endpoint})"))?;
        let mut prediction = response_json_or_error("edit service", response)?;

        let status = prediction
            .get("status")
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        if status != "succeeded" {
            if matches!(status.as_str(), "starting" | "processing") {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|obj| obj.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("edit prediction missing poll URL"))?
                    .to_string();
                prediction = self.poll_prediction(&poll_url)?;
            } else {
                bail!("edit prediction failed: {}", prediction);
            }
        }

        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            Self::extract_output_urls(output, &mut urls);
        }
        if urls.is_empty() {
            bail!("edit service returned no artifact references");
        }
        Ok(EditOutput::Many(
            urls.into_iter().map(ArtifactRef::Direct).collect(),
        ))
    }
}

/// Failure to retrieve one artifact's bytes. Distinct from edit-service
/// failures: it isolates only that artifact's save step.
#[derive(Debug, Error)]
#[error("artifact fetch failed for {reference}: {reason}")]
pub struct FetchError {
    pub reference: String,
    pub status: Option<u16>,
    pub reason: String,
}

impl FetchError {
    pub fn new(reference: impl Into<String>, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            status,
            reason: reason.into(),
        }
    }

    fn transport(reference: &str, err: &reqwest::Error) -> Self {
        let reason = if err.is_timeout() {
            "request timed out".to_string()
        } else {
            err.to_string()
        };
        Self::new(reference, err.status().map(|status| status.as_u16()), reason)
    }
}

/// Retrieves the raw bytes behind an artifact reference.
pub trait ArtifactFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

pub struct HttpFetcher {
    http: HttpClient,
}

impl HttpFetcher {
    pub fn new(config: FetchConfig) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

impl ArtifactFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| FetchError::transport(url, &err))?;
        let status = response.status();
        if !status.is_success() {
            let reason = format!(
                "HTTP {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("request failed")
            );
            return Err(FetchError::new(url, Some(status.as_u16()), reason));
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::transport(url, &err))
    }
}

/// Bundles already-persisted files into one Deflate ZIP under their base
/// names. Files missing from disk at build time are skipped. The namespace is
/// flat: a later duplicate base name overwrites an earlier entry on
/// extraction. Accepted limitation, not silently corrected.
pub fn write_archive(archive_path: &Path, files: &[PathBuf]) -> Result<PathBuf> {
    let file = fs::File::create(archive_path)
        .with_context(|| format!("failed to create {}", archive_path.display()))?;
    let mut archive = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in files {
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        archive
            .start_file(name, options)
            .with_context(|| format!("failed to add {name} to archive"))?;
        let bytes =
            fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        archive
            .write_all(&bytes)
            .with_context(|| format!("failed writing {name} into archive"))?;
    }

    archive.finish().context("failed to finalize archive")?;
    Ok(archive_path.to_path_buf())
}

/// The only errors that cross [`BatchRunner::run`]; everything else is caught
/// per item or per artifact and reported through the run log.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no input images were provided")]
    NoInput,
    #[error("failed to prepare session directory under {}: {}", .dir.display(), .cause)]
    Session { dir: PathBuf, cause: anyhow::Error },
}

/// Where the structured event stream goes, if anywhere.
#[derive(Debug, Clone, Default)]
pub enum EventsTarget {
    #[default]
    Disabled,
    /// `events.jsonl` inside the session directory; only applies to
    /// autosave runs, since only those have a session directory.
    SessionDir,
    Path(PathBuf),
}

pub type CancelFlag = Arc<AtomicBool>;

/// One batch run's inputs and options.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub inputs: Vec<PathBuf>,
    pub prompt: String,
    pub reference_images: Vec<PathBuf>,
    pub options: RunOptions,
}

/// Everything a finished (or cancelled) run produced.
#[derive(Debug)]
pub struct BatchOutcome {
    pub gallery_urls: Vec<String>,
    pub log: RunLog,
    pub session: Option<Session>,
    pub persisted: Vec<PersistedArtifact>,
    pub archive: Option<PathBuf>,
    pub cancelled: bool,
}

/// Drives one end-to-end batch run: strictly sequential items, per-item
/// failure isolation, per-artifact save isolation, deterministic session
/// naming, optional archive.
pub struct BatchRunner {
    editor: Box<dyn ImageEditor>,
    fetcher: Box<dyn ArtifactFetcher>,
    events: EventsTarget,
    cancel: Option<CancelFlag>,
}

impl BatchRunner {
    pub fn new(editor: Box<dyn ImageEditor>, fetcher: Box<dyn ArtifactFetcher>) -> Self {
        Self {
            editor,
            fetcher,
            events: EventsTarget::Disabled,
            cancel: None,
        }
    }

    pub fn with_events(mut self, target: EventsTarget) -> Self {
        self.events = target;
        self
    }

    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn run(
        &self,
        batch: &BatchRequest,
        progress: &mut dyn FnMut(f64, &str),
    ) -> Result<BatchOutcome, BatchError> {
        if batch.inputs.is_empty() {
            return Err(BatchError::NoInput);
        }

        // The timestamp is taken once and reused for every name this run
        // produces; concurrent runs get distinct session directories.
        let timestamp = session_timestamp();
        let session = if batch.options.autosave {
            match Session::create(&batch.options.save_dir, &timestamp) {
                Ok(session) => Some(session),
                Err(cause) => {
                    return Err(BatchError::Session {
                        dir: batch.options.save_dir.clone(),
                        cause,
                    })
                }
            }
        } else {
            None
        };
        let events = self.events_for(&timestamp, session.as_ref());
        let started_at = now_utc_iso();

        let prompt = effective_prompt(&batch.prompt, &batch.reference_images);
        emit(
            events.as_ref(),
            "run_started",
            map_object(json!({
                "inputs": batch.inputs.len(),
                "references": batch.reference_images.len(),
                "autosave": batch.options.autosave,
                "save_dir": batch.options.save_dir.to_string_lossy(),
                "make_archive": batch.options.make_archive,
            })),
        );

        let mut log = RunLog::new();
        let mut gallery_urls: Vec<String> = Vec::new();
        let mut persisted: Vec<PersistedArtifact> = Vec::new();
        let mut failed_items = 0u64;
        let mut cancelled = false;
        let total = batch.inputs.len();

        for (index, input) in batch.inputs.iter().enumerate() {
            if self.is_cancelled() {
                cancelled = true;
                log.push(format!(
                    "[CANCELLED] stopped before item {} of {total}",
                    index + 1
                ));
                emit(
                    events.as_ref(),
                    "run_cancelled",
                    map_object(json!({"completed": index, "total": total})),
                );
                break;
            }

            let name = display_name(input);
            progress(index as f64 / total as f64, &name);
            emit(
                events.as_ref(),
                "item_started",
                map_object(json!({"index": index, "input": input.to_string_lossy()})),
            );

            // References are already folded into the prompt; the request
            // carries exactly what the service sees.
            let request = EditRequest {
                source: input.clone(),
                prompt: prompt.clone(),
                reference_images: Vec::new(),
            };
            let artifacts = match self.editor.edit(&request).map(EditOutput::into_refs) {
                Ok(artifacts) => artifacts,
                Err(err) => {
                    failed_items += 1;
                    let cause = error_chain_text(&err, 300);
                    log.push(format!("[ERROR] {name}: {cause}"));
                    emit(
                        events.as_ref(),
                        "item_failed",
                        map_object(json!({"index": index, "input": name, "error": cause})),
                    );
                    continue;
                }
            };

            for (artifact_index, artifact) in artifacts.iter().enumerate() {
                let url = match artifact.url() {
                    Ok(url) => url,
                    Err(err) => {
                        log.push(format!(
                            "[SAVE ERROR] {name} artifact {artifact_index}: unresolvable reference: {}",
                            error_chain_text(&err, 300)
                        ));
                        continue;
                    }
                };
                gallery_urls.push(url.clone());
                emit(
                    events.as_ref(),
                    "artifact_listed",
                    map_object(
                        json!({"index": index, "artifact_index": artifact_index, "url": url}),
                    ),
                );

                let Some(session) = &session else {
                    continue;
                };
                let extension = extension_for_reference(&url);
                let file_name = artifact_file_name(&timestamp, index, artifact_index, &extension);
                let destination = session.resolve(&file_name);
                match self.save_artifact(&url, &destination) {
                    Ok((size_bytes, dimensions)) => {
                        log.push(format!("Saved: {}", destination.display()));
                        emit(
                            events.as_ref(),
                            "artifact_saved",
                            map_object(json!({
                                "index": index,
                                "artifact_index": artifact_index,
                                "path": destination.to_string_lossy(),
                                "size_bytes": size_bytes,
                                "dimensions": dimensions.map(|(w, h)| json!([w, h])),
                            })),
                        );
                        persisted.push(PersistedArtifact {
                            source_index: index,
                            artifact_index,
                            path: destination,
                            size_bytes,
                            dimensions,
                        });
                    }
                    Err(err) => {
                        let cause = error_chain_text(&err, 300);
                        log.push(format!("[SAVE ERROR] {file_name}: {cause}"));
                        emit(
                            events.as_ref(),
                            "artifact_save_failed",
                            map_object(json!({
                                "index": index,
                                "artifact_index": artifact_index,
                                "destination": destination.to_string_lossy(),
                                "error": cause,
                            })),
                        );
                    }
                }
            }
        }

        if !cancelled {
            progress(1.0, "Done");
        }

        let mut archive = None;
        if batch.options.make_archive && !persisted.is_empty() {
            if let Some(session) = &session {
                let archive_path = session.archive_path();
                let files: Vec<PathBuf> =
                    persisted.iter().map(|artifact| artifact.path.clone()).collect();
                match write_archive(&archive_path, &files) {
                    Ok(path) => {
                        log.push(format!("Archive: {}", path.display()));
                        emit(
                            events.as_ref(),
                            "archive_written",
                            map_object(json!({
                                "path": path.to_string_lossy(),
                                "entries": files.len(),
                            })),
                        );
                        archive = Some(path);
                    }
                    Err(err) => {
                        let cause = error_chain_text(&err, 300);
                        log.push(format!("[ZIP ERROR] {cause}"));
                        emit(
                            events.as_ref(),
                            "archive_failed",
                            map_object(json!({
                                "path": archive_path.to_string_lossy(),
                                "error": cause,
                            })),
                        );
                    }
                }
            }
        }

        if let Some(session) = &session {
            let summary = RunSummary {
                session: timestamp.clone(),
                started_at,
                finished_at: now_utc_iso(),
                total_inputs: total as u64,
                total_artifacts: gallery_urls.len() as u64,
                saved_files: persisted
                    .iter()
                    .map(|artifact| artifact.path.to_string_lossy().to_string())
                    .collect(),
                failed_items,
            };
            if let Err(err) = write_summary(&session.resolve("summary.json"), &summary) {
                log.push(format!("[SUMMARY ERROR] {}", error_chain_text(&err, 300)));
            }
        }

        emit(
            events.as_ref(),
            "run_finished",
            map_object(json!({
                "gallery": gallery_urls.len(),
                "saved": persisted.len(),
                "failed_items": failed_items,
                "cancelled": cancelled,
            })),
        );

        Ok(BatchOutcome {
            gallery_urls,
            log,
            session,
            persisted,
            archive,
            cancelled,
        })
    }

    fn events_for(&self, timestamp: &str, session: Option<&Session>) -> Option<EventWriter> {
        match &self.events {
            EventsTarget::Disabled => None,
            EventsTarget::SessionDir => {
                session.map(|session| EventWriter::new(session.resolve("events.jsonl"), timestamp))
            }
            EventsTarget::Path(path) => Some(EventWriter::new(path.clone(), timestamp)),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn save_artifact(&self, url: &str, destination: &Path) -> Result<(u64, Option<(u32, u32)>)> {
        let bytes = self.fetcher.fetch(url)?;
        write_atomic(destination, &bytes)?;
        // Dimension decode is best-effort reporting; a save never fails on it.
        let dimensions = image::load_from_memory(&bytes)
            .ok()
            .map(|img| img.dimensions());
        Ok((bytes.len() as u64, dimensions))
    }
}

fn emit(events: Option<&EventWriter>, event_type: &str, payload: EventPayload) {
    // An event write failure must never abort the batch.
    if let Some(events) = events {
        let _ = events.emit(event_type, payload);
    }
}

// Either the artifact is fully written at `destination` or nothing is.
fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<()> {
    let staging = destination.with_extension("part");
    if let Err(err) = fs::write(&staging, bytes) {
        let _ = fs::remove_file(&staging);
        return Err(err).with_context(|| format!("failed writing {}", staging.display()));
    }
    if let Err(err) = fs::rename(&staging, destination) {
        let _ = fs::remove_file(&staging);
        return Err(err).with_context(|| format!("failed moving into {}", destination.display()));
    }
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

fn response_json_or_error(context: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{context} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{context} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{context} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use kisekae_contracts::batch::ArtifactHandle;
    use serde_json::json;

    use super::*;

    struct FakeEditor {
        urls_per_item: usize,
        fail_on: &'static [usize],
        cancel_after_call: Option<CancelFlag>,
        calls: Mutex<usize>,
    }

    impl FakeEditor {
        fn new(urls_per_item: usize, fail_on: &'static [usize]) -> Self {
            Self {
                urls_per_item,
                fail_on,
                cancel_after_call: None,
                calls: Mutex::new(0),
            }
        }

        fn cancelling(mut self, flag: CancelFlag) -> Self {
            self.cancel_after_call = Some(flag);
            self
        }
    }

    impl ImageEditor for FakeEditor {
        fn edit(&self, request: &EditRequest) -> Result<EditOutput> {
            let index = {
                let mut calls = self.calls.lock().expect("calls lock");
                let current = *calls;
                *calls += 1;
                current
            };
            if let Some(flag) = &self.cancel_after_call {
                flag.store(true, Ordering::SeqCst);
            }
            if self.fail_on.contains(&index) {
                bail!("synthetic edit failure for {}", request.source.display());
            }
            Ok(EditOutput::Many(
                (0..self.urls_per_item)
                    .map(|j| {
                        ArtifactRef::Direct(format!(
                            "https://cdn.example/item-{index}/out-{j}.webp"
                        ))
                    })
                    .collect(),
            ))
        }
    }

    struct TestHandle(String);

    impl ArtifactHandle for TestHandle {
        fn resolve(&self) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct HandleEditor;

    impl ImageEditor for HandleEditor {
        fn edit(&self, _request: &EditRequest) -> Result<EditOutput> {
            Ok(EditOutput::Single(ArtifactRef::Resolvable(Box::new(
                TestHandle("https://cdn.example/resolved/out.png".to_string()),
            ))))
        }
    }

    struct FakeFetcher {
        payload: Vec<u8>,
        fail_marker: Option<&'static str>,
    }

    impl FakeFetcher {
        fn ok() -> Self {
            Self {
                payload: b"artifact-bytes".to_vec(),
                fail_marker: None,
            }
        }

        fn failing_on(marker: &'static str) -> Self {
            Self {
                payload: b"artifact-bytes".to_vec(),
                fail_marker: Some(marker),
            }
        }
    }

    impl ArtifactFetcher for FakeFetcher {
        fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
            if let Some(marker) = self.fail_marker {
                if url.contains(marker) {
                    return Err(FetchError::new(url, Some(404), "HTTP 404 Not Found"));
                }
            }
            Ok(self.payload.clone())
        }
    }

    fn runner(
        editor: impl ImageEditor + 'static,
        fetcher: impl ArtifactFetcher + 'static,
    ) -> BatchRunner {
        BatchRunner::new(Box::new(editor), Box::new(fetcher))
    }

    fn batch(inputs: &[&str], save_dir: &Path, autosave: bool, make_archive: bool) -> BatchRequest {
        BatchRequest {
            inputs: inputs.iter().map(PathBuf::from).collect(),
            prompt: "replace the jacket".to_string(),
            reference_images: Vec::new(),
            options: RunOptions {
                autosave,
                save_dir: save_dir.to_path_buf(),
                make_archive,
            },
        }
    }

    fn saved_artifact_names(session: &Session) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(session.dir())
            .expect("session dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .filter(|name| name.ends_with(".webp") || name.ends_with(".png"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn empty_input_fails_before_any_side_effect() {
        let temp = tempfile::tempdir().expect("tempdir");
        let save_dir = temp.path().join("outputs");
        let events_path = temp.path().join("events.jsonl");
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::ok())
            .with_events(EventsTarget::Path(events_path.clone()));

        let mut progress_calls = 0usize;
        let result = runner.run(
            &batch(&[], &save_dir, true, true),
            &mut |_fraction, _desc| progress_calls += 1,
        );

        assert!(matches!(result, Err(BatchError::NoInput)));
        assert_eq!(progress_calls, 0);
        assert!(!save_dir.exists());
        assert!(!events_path.exists());
    }

    #[test]
    fn progress_fractions_increase_and_end_at_one() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::ok());

        let mut updates: Vec<(f64, String)> = Vec::new();
        let outcome = runner.run(
            &batch(&["a.png", "b.png", "c.png"], temp.path(), false, false),
            &mut |fraction, desc| updates.push((fraction, desc.to_string())),
        )?;

        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].0, 0.0);
        assert_eq!(updates[0].1, "a.png");
        for pair in updates.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        assert_eq!(updates.last().map(|(fraction, _)| *fraction), Some(1.0));
        assert_eq!(outcome.gallery_urls.len(), 3);
        Ok(())
    }

    #[test]
    fn failed_item_is_isolated_from_the_rest() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(1, &[1]), FakeFetcher::ok());

        let outcome = runner.run(
            &batch(&["a.png", "b.png", "c.png"], &save_dir, true, false),
            &mut |_, _| {},
        )?;

        assert_eq!(outcome.gallery_urls.len(), 2);
        let error_lines: Vec<&String> = outcome
            .log
            .lines()
            .iter()
            .filter(|line| line.starts_with("[ERROR]"))
            .collect();
        assert_eq!(error_lines.len(), 1);
        assert!(error_lines[0].contains("b.png"));

        assert!(outcome
            .persisted
            .iter()
            .all(|artifact| artifact.source_index != 1));
        let session = outcome.session.expect("autosave session");
        let names = saved_artifact_names(&session);
        assert_eq!(names.len(), 2);
        assert_eq!(
            names[0],
            artifact_file_name(session.timestamp(), 0, 0, "webp")
        );
        assert_eq!(
            names[1],
            artifact_file_name(session.timestamp(), 2, 0, "webp")
        );
        Ok(())
    }

    #[test]
    fn autosave_off_produces_gallery_without_writes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(2, &[]), FakeFetcher::ok());

        let outcome = runner.run(
            &batch(&["a.png", "b.png"], &save_dir, false, false),
            &mut |_, _| {},
        )?;

        assert_eq!(outcome.gallery_urls.len(), 4);
        assert!(outcome.session.is_none());
        assert!(outcome.persisted.is_empty());
        assert!(!save_dir.exists());
        Ok(())
    }

    #[test]
    fn fetch_failure_keeps_gallery_and_leaves_no_file() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::failing_on("item-0"));

        let outcome = runner.run(&batch(&["a.png"], &save_dir, true, false), &mut |_, _| {})?;

        assert_eq!(outcome.gallery_urls.len(), 1);
        assert!(outcome.persisted.is_empty());
        let save_errors: Vec<&String> = outcome
            .log
            .lines()
            .iter()
            .filter(|line| line.starts_with("[SAVE ERROR]"))
            .collect();
        assert_eq!(save_errors.len(), 1);

        let session = outcome.session.expect("autosave session");
        assert!(saved_artifact_names(&session).is_empty());
        let destination =
            session.resolve(&artifact_file_name(session.timestamp(), 0, 0, "webp"));
        assert!(!destination.exists());
        assert!(!destination.with_extension("part").exists());
        Ok(())
    }

    #[test]
    fn every_artifact_of_an_item_is_persisted_in_order() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(3, &[]), FakeFetcher::ok());

        let outcome = runner.run(
            &batch(&["a.png", "b.png"], &save_dir, true, false),
            &mut |_, _| {},
        )?;

        assert_eq!(outcome.gallery_urls.len(), 6);
        assert_eq!(outcome.persisted.len(), 6);
        let order: Vec<(usize, usize)> = outcome
            .persisted
            .iter()
            .map(|artifact| (artifact.source_index, artifact.artifact_index))
            .collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)]);
        assert!(outcome
            .persisted
            .iter()
            .all(|artifact| artifact.size_bytes == b"artifact-bytes".len() as u64));
        Ok(())
    }

    #[test]
    fn archive_is_built_from_persisted_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(2, &[]), FakeFetcher::ok());

        let outcome = runner.run(&batch(&["a.png"], &save_dir, true, true), &mut |_, _| {})?;

        let archive_path = outcome.archive.expect("archive built");
        assert!(archive_path.is_file());
        assert!(outcome
            .log
            .lines()
            .iter()
            .any(|line| line.starts_with("Archive: ")));

        let mut archive = zip::ZipArchive::new(fs::File::open(&archive_path)?)?;
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).map(|entry| entry.name().to_string()))
            .collect::<Result<_, _>>()?;
        names.sort();
        let session = outcome.session.expect("autosave session");
        assert_eq!(
            names,
            vec![
                artifact_file_name(session.timestamp(), 0, 0, "webp"),
                artifact_file_name(session.timestamp(), 0, 1, "webp"),
            ]
        );
        Ok(())
    }

    #[test]
    fn archive_is_skipped_when_nothing_was_persisted() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::ok());

        let outcome = runner.run(&batch(&["a.png"], &save_dir, false, true), &mut |_, _| {})?;

        assert!(outcome.archive.is_none());
        assert!(!outcome
            .log
            .lines()
            .iter()
            .any(|line| line.starts_with("[ZIP ERROR]")));
        Ok(())
    }

    #[test]
    fn cancellation_stops_between_items() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let flag: CancelFlag = Arc::new(AtomicBool::new(false));
        let runner = runner(
            FakeEditor::new(1, &[]).cancelling(flag.clone()),
            FakeFetcher::ok(),
        )
        .with_cancel_flag(flag);

        let mut updates = 0usize;
        let outcome = runner.run(
            &batch(&["a.png", "b.png", "c.png"], &save_dir, true, false),
            &mut |_, _| updates += 1,
        )?;

        assert!(outcome.cancelled);
        assert_eq!(updates, 1);
        assert_eq!(outcome.gallery_urls.len(), 1);
        assert_eq!(outcome.persisted.len(), 1);
        assert!(outcome
            .log
            .lines()
            .iter()
            .any(|line| line.starts_with("[CANCELLED]")));
        Ok(())
    }

    #[test]
    fn single_output_and_resolvable_handles_normalize() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(HandleEditor, FakeFetcher::ok());

        let outcome = runner.run(&batch(&["a.png"], &save_dir, true, false), &mut |_, _| {})?;

        assert_eq!(
            outcome.gallery_urls,
            vec!["https://cdn.example/resolved/out.png".to_string()]
        );
        assert_eq!(outcome.persisted.len(), 1);
        let session = outcome.session.expect("autosave session");
        assert!(session
            .resolve(&artifact_file_name(session.timestamp(), 0, 0, "png"))
            .is_file());
        Ok(())
    }

    #[test]
    fn summary_is_written_for_autosave_runs() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(1, &[1]), FakeFetcher::ok());

        let outcome = runner.run(
            &batch(&["a.png", "b.png"], &save_dir, true, false),
            &mut |_, _| {},
        )?;

        let session = outcome.session.expect("autosave session");
        let raw = fs::read_to_string(session.resolve("summary.json"))?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["session"], json!(session.timestamp()));
        assert_eq!(parsed["total_inputs"], json!(2));
        assert_eq!(parsed["total_artifacts"], json!(1));
        assert_eq!(parsed["failed_items"], json!(1));
        Ok(())
    }

    #[test]
    fn events_stream_records_the_run() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let events_path = temp.path().join("events.jsonl");
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::ok())
            .with_events(EventsTarget::Path(events_path.clone()));

        runner.run(&batch(&["a.png"], &save_dir, true, false), &mut |_, _| {})?;

        let raw = fs::read_to_string(events_path)?;
        let types: Vec<String> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect();
        let position = |needle: &str| types.iter().position(|value| value == needle);
        let started = position("run_started").expect("run_started");
        let item = position("item_started").expect("item_started");
        let listed = position("artifact_listed").expect("artifact_listed");
        let saved = position("artifact_saved").expect("artifact_saved");
        let finished = position("run_finished").expect("run_finished");
        assert!(started < item);
        assert!(item < listed);
        assert!(listed < saved);
        assert!(saved < finished);
        Ok(())
    }

    #[test]
    fn session_events_live_inside_the_session_directory() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let save_dir = temp.path().join("outputs");
        let runner = runner(FakeEditor::new(1, &[]), FakeFetcher::ok())
            .with_events(EventsTarget::SessionDir);

        let outcome = runner.run(&batch(&["a.png"], &save_dir, true, false), &mut |_, _| {})?;

        let session = outcome.session.expect("autosave session");
        assert!(session.resolve("events.jsonl").is_file());
        Ok(())
    }

    #[test]
    fn write_archive_skips_vanished_files() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let kept = temp.path().join("kept.webp");
        let vanished = temp.path().join("vanished.webp");
        fs::write(&kept, b"kept")?;

        let archive_path = temp.path().join("results.zip");
        write_archive(&archive_path, &[kept, vanished])?;

        let mut archive = zip::ZipArchive::new(fs::File::open(&archive_path)?)?;
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0)?.name(), "kept.webp");
        Ok(())
    }

    #[test]
    fn write_archive_flattens_to_base_names() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let nested = temp.path().join("deep").join("dir");
        fs::create_dir_all(&nested)?;
        let first = temp.path().join("one.webp");
        let second = nested.join("two.webp");
        fs::write(&first, b"one")?;
        fs::write(&second, b"two")?;

        let archive_path = temp.path().join("results.zip");
        write_archive(&archive_path, &[first, second])?;

        let mut archive = zip::ZipArchive::new(fs::File::open(&archive_path)?)?;
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).map(|entry| entry.name().to_string()))
            .collect::<Result<_, _>>()?;
        names.sort();
        assert_eq!(names, vec!["one.webp", "two.webp"]);
        Ok(())
    }

    #[test]
    fn extract_output_urls_walks_nested_shapes_in_order() {
        let payload = json!({
            "output": [
                "https://cdn.example/a.webp",
                {"url": "https://cdn.example/b.webp"},
                {"urls": ["https://cdn.example/c.webp", "https://cdn.example/a.webp"]},
                "not-a-url",
            ]
        });
        let mut urls = Vec::new();
        ReplicateEditor::extract_output_urls(&payload["output"], &mut urls);
        assert_eq!(
            urls,
            vec![
                "https://cdn.example/a.webp",
                "https://cdn.example/b.webp",
                "https://cdn.example/c.webp",
            ]
        );
    }

    #[test]
    fn fetch_error_reports_reference_and_reason() {
        let err = FetchError::new("https://cdn.example/a.webp", Some(503), "HTTP 503 Service Unavailable");
        assert_eq!(err.status, Some(503));
        let rendered = err.to_string();
        assert!(rendered.contains("https://cdn.example/a.webp"));
        assert!(rendered.contains("503"));
    }
}
