//! Task trigger: turns a freshly created record into a finished image.
//!
//! [`spawn_dispatcher`] listens on the task store's creation channel and runs
//! one [`TaskProcessor::process`] invocation per record. Each invocation is
//! sequential: claim the record, fetch the input, call the image API (with the
//! single alternate-field retry), watermark, store, finish. Every failure path
//! ends in a terminal status.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::overlay::{guess_mime, Overlay};
use crate::storage::{normalize_image_mime, public_url, BlobMetadata, BlobStore};
use crate::task::store::{StoreError, TaskStore};
use crate::task::{output_path, task_folder, TaskFailure, TaskRecord, TaskStatus, TaskTransition};
use crate::transform::{edit_with_fallback, ImageEditor, SourceImage, TransformError};

const INTERRUPTED_MESSAGE: &str = "interrupted by server restart";

pub struct TaskProcessor {
    store: Arc<dyn TaskStore>,
    blobs: Arc<dyn BlobStore>,
    editor: Arc<dyn ImageEditor>,
    overlay: Overlay,
    public_base_url: String,
}

/// Outcome of the image pipeline for a claimed task.
struct Finished {
    url: String,
    output_path: String,
}

impl TaskProcessor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        blobs: Arc<dyn BlobStore>,
        editor: Arc<dyn ImageEditor>,
        overlay: Overlay,
        public_base_url: String,
    ) -> Self {
        Self {
            store,
            blobs,
            editor,
            overlay,
            public_base_url,
        }
    }

    /// Drive one record to a terminal status. Never returns an error; every
    /// failure is recorded on the task or logged.
    pub async fn process(&self, record: TaskRecord) {
        let task_id = record.id.clone();

        let input_path = match record.input_path.as_deref().map(str::trim) {
            Some(path) if !path.is_empty() => path.to_string(),
            _ => {
                tracing::warn!(task_id = %task_id, "Task has no inputPath");
                self.fail(&task_id, TaskFailure::new("Task has no inputPath"))
                    .await;
                return;
            }
        };

        match self.store.transition(&task_id, TaskTransition::Start).await {
            Ok(_) => {}
            Err(StoreError::InvalidTransition(err)) => {
                tracing::info!(
                    task_id = %task_id,
                    status = %err.from,
                    "Task already claimed, skipping"
                );
                return;
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "Failed to mark task processing");
                return;
            }
        }

        tracing::info!(task_id = %task_id, input = %input_path, "Processing task");

        match self.run(&task_id, &input_path).await {
            Ok(finished) => {
                let transition = TaskTransition::Complete {
                    url: finished.url,
                    output_path: finished.output_path,
                };
                match self.store.transition(&task_id, transition).await {
                    Ok(record) => {
                        tracing::info!(
                            task_id = %task_id,
                            output = ?record.output_path,
                            "Task done"
                        );
                    }
                    Err(StoreError::NotFound(_)) => {
                        // Deleted while processing; the folder delete already ran.
                        self.discard_outputs(&task_id).await;
                    }
                    Err(err) => {
                        tracing::error!(task_id = %task_id, error = %err, "Failed to mark task done");
                        self.fail(&task_id, TaskFailure::new(err.to_string())).await;
                    }
                }
            }
            Err(err) => {
                let failure = match err.downcast_ref::<TransformError>() {
                    Some(transform_err) => transform_err.to_failure(),
                    None => TaskFailure::new(format!("{:#}", err)),
                };
                tracing::warn!(
                    task_id = %task_id,
                    error = %failure.error,
                    upstream_status = ?failure.upstream_status,
                    request_id = ?failure.request_id,
                    "Task failed"
                );
                self.fail(&task_id, failure).await;
            }
        }
    }

    async fn run(&self, task_id: &str, input_path: &str) -> anyhow::Result<Finished> {
        let input = self
            .blobs
            .get(input_path)
            .await
            .with_context(|| format!("Failed to read input blob {}", input_path))?
            .ok_or_else(|| anyhow!("Input blob not found: {}", input_path))?;

        let source = SourceImage {
            mime_type: normalize_image_mime(Some(&input.metadata.content_type)),
            bytes: input.bytes,
        };

        let edited = edit_with_fallback(self.editor.as_ref(), &source).await?;
        let base = Arc::new(edited.decode()?);

        let overlay = self.overlay.clone();
        let input = Arc::clone(&base);
        let image = match tokio::task::spawn_blocking(move || overlay.apply(&input)).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "Watermark task aborted, storing image as-is");
                base.to_vec()
            }
        };

        let path = output_path(task_id);
        let token = Uuid::new_v4().to_string();
        let metadata = BlobMetadata::new(guess_mime(&image)).with_token(token.clone());
        self.blobs
            .put(&path, image, metadata)
            .await
            .with_context(|| format!("Failed to store output {}", path))?;

        Ok(Finished {
            url: public_url(&self.public_base_url, self.blobs.bucket(), &path, &token),
            output_path: path,
        })
    }

    async fn discard_outputs(&self, task_id: &str) {
        match self.blobs.delete_prefix(&task_folder(task_id)).await {
            Ok(removed) => {
                tracing::info!(
                    task_id = %task_id,
                    blobs = removed,
                    "Task deleted while processing, discarded output"
                );
            }
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "Failed to discard orphaned output");
            }
        }
    }

    async fn fail(&self, task_id: &str, failure: TaskFailure) {
        if let Err(err) = self
            .store
            .transition(task_id, TaskTransition::Fail(failure))
            .await
        {
            tracing::error!(task_id = %task_id, error = %err, "Failed to record task failure");
        }
    }
}

/// Run a processor invocation for `record` on its own tokio task.
pub fn dispatch(processor: &Arc<TaskProcessor>, record: TaskRecord) -> JoinHandle<()> {
    let processor = Arc::clone(processor);
    tokio::spawn(async move { processor.process(record).await })
}

/// Consume creation events until the channel closes.
pub fn spawn_dispatcher(
    processor: Arc<TaskProcessor>,
    mut created: broadcast::Receiver<TaskRecord>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match created.recv().await {
                Ok(record) => {
                    tracing::debug!(task_id = %record.id, "Task created, dispatching");
                    dispatch(&processor, record);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dispatcher lagged, sweeping queued tasks");
                    if let Err(err) = sweep_queued(&processor).await {
                        tracing::error!(error = %err, "Queued sweep failed");
                    }
                }
                Err(RecvError::Closed) => {
                    tracing::info!("Task creation channel closed, dispatcher stopping");
                    break;
                }
            }
        }
    })
}

async fn sweep_queued(processor: &Arc<TaskProcessor>) -> Result<usize, StoreError> {
    let queued = processor.store.tasks_with_status(TaskStatus::Queued).await?;
    let count = queued.len();
    for record in queued {
        dispatch(processor, record);
    }
    Ok(count)
}

/// What startup recovery did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub interrupted: usize,
    pub requeued: usize,
}

/// Fail records left in `processing` by a previous run and dispatch the ones
/// still `queued`.
pub async fn recover_interrupted(
    store: &dyn TaskStore,
    processor: &Arc<TaskProcessor>,
) -> Result<RecoverySummary, StoreError> {
    let mut summary = RecoverySummary::default();

    for record in store.tasks_with_status(TaskStatus::Processing).await? {
        match store
            .transition(&record.id, TaskTransition::Fail(TaskFailure::new(INTERRUPTED_MESSAGE)))
            .await
        {
            Ok(_) => summary.interrupted += 1,
            Err(err) => {
                tracing::warn!(task_id = %record.id, error = %err, "Could not fail interrupted task");
            }
        }
    }

    for record in store.tasks_with_status(TaskStatus::Queued).await? {
        dispatch(processor, record);
        summary.requeued += 1;
    }

    if summary != RecoverySummary::default() {
        tracing::info!(
            interrupted = summary.interrupted,
            requeued = summary.requeued,
            "Recovered tasks from previous run"
        );
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBlobStore;
    use crate::task::store::{InMemoryTaskStore, NewTask};
    use crate::transform::testing::ScriptedEditor;
    use crate::transform::{EditedImage, ImageField};
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;
    use std::time::Duration;

    const BASE_URL: &str = "http://booth.test";

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(width, height, Rgba(color)))
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    struct Harness {
        tasks: Arc<InMemoryTaskStore>,
        blobs: Arc<InMemoryBlobStore>,
        editor: Arc<ScriptedEditor>,
        processor: Arc<TaskProcessor>,
        _assets: tempfile::TempDir,
    }

    /// Processor wired to in-memory stores; `watermark` is written to the
    /// asset path when given, otherwise the asset is absent.
    fn harness(editor: ScriptedEditor, watermark: Option<Vec<u8>>) -> Harness {
        let assets = tempfile::tempdir().unwrap();
        let asset_path = assets.path().join("watermark.png");
        if let Some(bytes) = watermark {
            std::fs::write(&asset_path, bytes).unwrap();
        }

        let tasks = Arc::new(InMemoryTaskStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new("booth"));
        let editor = Arc::new(editor);
        let processor = Arc::new(TaskProcessor::new(
            tasks.clone(),
            blobs.clone(),
            editor.clone(),
            Overlay::new(asset_path, 0.3, 0.03),
            BASE_URL.to_string(),
        ));
        Harness {
            tasks,
            blobs,
            editor,
            processor,
            _assets: assets,
        }
    }

    async fn queue(h: &Harness, id: &str, content_type: &str) -> TaskRecord {
        let input_path = format!("tasks/{}/input.jpg", id);
        h.blobs
            .put(&input_path, vec![7, 7, 7], BlobMetadata::new(content_type))
            .await
            .unwrap();
        h.tasks
            .create_task(NewTask {
                id: id.to_string(),
                input_path: Some(input_path),
            })
            .await
            .unwrap()
    }

    async fn wait_terminal(store: &InMemoryTaskStore, id: &str) -> TaskRecord {
        for _ in 0..200 {
            if let Some(record) = store.get_task(id).await.unwrap() {
                if record.status.is_terminal() {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never finished", id);
    }

    fn rejected() -> Result<EditedImage, TransformError> {
        Err(TransformError::from_response(
            400,
            r#"{"error":{"message":"Invalid value for 'image'"}}"#,
            Some("req_rejected".to_string()),
        ))
    }

    #[tokio::test]
    async fn missing_input_fails_without_calling_api() {
        let result = png(8, 8, [0, 255, 0, 255]);
        for input_path in [None, Some("   ".to_string())] {
            let h = harness(ScriptedEditor::returning_image(&result), None);
            let record = h
                .tasks
                .create_task(NewTask {
                    id: "no-input".to_string(),
                    input_path,
                })
                .await
                .unwrap();

            h.processor.process(record).await;

            let record = h.tasks.get_task("no-input").await.unwrap().unwrap();
            assert_eq!(record.status, TaskStatus::Error);
            assert!(record.error.unwrap().contains("inputPath"));
            assert!(h.editor.calls().is_empty());
        }
    }

    #[tokio::test]
    async fn success_stores_output_and_finishes() {
        let result = png(20, 30, [0, 255, 0, 255]);
        let h = harness(ScriptedEditor::returning_image(&result), None);
        let record = queue(&h, "t1", "image/jpeg").await;

        h.processor.process(record).await;

        let record = h.tasks.get_task("t1").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        assert_eq!(record.output_path.as_deref(), Some("tasks/t1/output.png"));
        let url = record.url.unwrap();
        assert!(url.starts_with("http://booth.test/v0/b/booth/o/tasks%2Ft1%2Foutput.png?alt=media&token="));
        assert!(record.finished_at.is_some());

        let stored = h.blobs.get("tasks/t1/output.png").await.unwrap().unwrap();
        let token = stored.metadata.download_token.unwrap();
        assert!(url.ends_with(&token));
        assert_eq!(stored.metadata.content_type, "image/png");

        let calls = h.editor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].bytes, vec![7, 7, 7]);
        assert_eq!(calls[0].mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn absent_watermark_stores_base_image_unchanged() {
        let result = png(16, 16, [10, 20, 30, 255]);
        let h = harness(ScriptedEditor::returning_image(&result), None);
        let record = queue(&h, "plain", "image/png").await;

        h.processor.process(record).await;

        let record = h.tasks.get_task("plain").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
        let stored = h.blobs.get("tasks/plain/output.png").await.unwrap().unwrap();
        assert_eq!(stored.bytes, result);
    }

    #[tokio::test]
    async fn watermark_is_applied_when_present() {
        let result = png(100, 100, [0, 0, 255, 255]);
        let h = harness(
            ScriptedEditor::returning_image(&result),
            Some(png(10, 10, [255, 0, 0, 255])),
        );
        let record = queue(&h, "marked", "image/png").await;

        h.processor.process(record).await;

        let stored = h.blobs.get("tasks/marked/output.png").await.unwrap().unwrap();
        assert_ne!(stored.bytes, result);
        let decoded = image::load_from_memory(&stored.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (100, 100));
    }

    #[tokio::test]
    async fn non_image_mime_is_submitted_as_png() {
        let h = harness(ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])), None);
        let record = queue(&h, "octet", "application/octet-stream").await;

        h.processor.process(record).await;

        let calls = h.editor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].mime_type, "image/png");
    }

    #[tokio::test]
    async fn client_rejection_retries_once_then_records_diagnostics() {
        let h = harness(ScriptedEditor::new(vec![rejected()]), None);
        let record = queue(&h, "rejected", "image/jpeg").await;

        h.processor.process(record).await;

        let fields: Vec<ImageField> = h.editor.calls().iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![ImageField::Primary, ImageField::Alternate]);

        let record = h.tasks.get_task("rejected").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.upstream_status, Some(400));
        assert_eq!(record.request_id.as_deref(), Some("req_rejected"));
        assert_eq!(
            record.details.unwrap()["error"]["message"],
            "Invalid value for 'image'"
        );
        assert!(record.output_path.is_none());
        assert!(record.url.is_none());
    }

    #[tokio::test]
    async fn retry_success_finishes_task() {
        let ok = Ok(EditedImage {
            b64_json: {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.encode(png(4, 4, [1, 2, 3, 255]))
            },
            request_id: None,
        });
        let h = harness(ScriptedEditor::new(vec![rejected(), ok]), None);
        let record = queue(&h, "second-try", "image/jpeg").await;

        h.processor.process(record).await;

        assert_eq!(h.editor.calls().len(), 2);
        let record = h.tasks.get_task("second-try").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn missing_input_blob_is_an_error() {
        let h = harness(ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])), None);
        let record = h
            .tasks
            .create_task(NewTask {
                id: "ghost".to_string(),
                input_path: Some("tasks/ghost/input.jpg".to_string()),
            })
            .await
            .unwrap();

        h.processor.process(record).await;

        let record = h.tasks.get_task("ghost").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert!(record.error.unwrap().contains("not found"));
        assert!(h.editor.calls().is_empty());
    }

    #[tokio::test]
    async fn undecodable_result_is_an_error() {
        let h = harness(
            ScriptedEditor::new(vec![Ok(EditedImage {
                b64_json: "%%%".to_string(),
                request_id: Some("req_bad".to_string()),
            })]),
            None,
        );
        let record = queue(&h, "garbled", "image/png").await;

        h.processor.process(record).await;

        let record = h.tasks.get_task("garbled").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.request_id.as_deref(), Some("req_bad"));
    }

    #[tokio::test]
    async fn second_invocation_keeps_same_output_path() {
        let h = harness(ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])), None);
        let record = queue(&h, "twice", "image/png").await;

        h.processor.process(record.clone()).await;
        let first = h.tasks.get_task("twice").await.unwrap().unwrap();
        h.processor.process(record).await;
        let second = h.tasks.get_task("twice").await.unwrap().unwrap();

        assert_eq!(first.status, TaskStatus::Done);
        assert_eq!(second.output_path, first.output_path);
        assert_eq!(second.url, first.url);
        assert_eq!(h.editor.calls().len(), 1);
        assert_eq!(h.blobs.list("tasks/twice/").await.unwrap().len(), 2);
    }

    /// Editor that removes the task the way the admin delete endpoint does
    /// before returning its result.
    struct DeletingEditor {
        task_id: String,
        tasks: Arc<InMemoryTaskStore>,
        blobs: Arc<InMemoryBlobStore>,
        inner: ScriptedEditor,
    }

    #[async_trait::async_trait]
    impl ImageEditor for DeletingEditor {
        async fn edit(
            &self,
            image: &SourceImage,
            field: ImageField,
        ) -> Result<EditedImage, TransformError> {
            assert!(self.tasks.delete_task(&self.task_id).await.unwrap());
            self.blobs
                .delete_prefix(&task_folder(&self.task_id))
                .await
                .unwrap();
            self.inner.edit(image, field).await
        }
    }

    #[tokio::test]
    async fn task_deleted_mid_run_leaves_no_output_behind() {
        let h = harness(ScriptedEditor::new(vec![]), None);
        let editor = Arc::new(DeletingEditor {
            task_id: "doomed".to_string(),
            tasks: h.tasks.clone(),
            blobs: h.blobs.clone(),
            inner: ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])),
        });
        let processor = TaskProcessor::new(
            h.tasks.clone(),
            h.blobs.clone(),
            editor,
            Overlay::new(h._assets.path().join("missing.png"), 0.3, 0.03),
            BASE_URL.to_string(),
        );
        let record = queue(&h, "doomed", "image/jpeg").await;

        processor.process(record).await;

        assert!(h.tasks.get_task("doomed").await.unwrap().is_none());
        assert!(h.blobs.list("tasks/doomed/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_processes_created_tasks() {
        let h = harness(ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])), None);
        let dispatcher = spawn_dispatcher(h.processor.clone(), h.tasks.subscribe());

        queue(&h, "live", "image/jpeg").await;

        let record = wait_terminal(&h.tasks, "live").await;
        assert_eq!(record.status, TaskStatus::Done);
        dispatcher.abort();
    }

    #[tokio::test]
    async fn recovery_fails_processing_and_requeues_queued() {
        let h = harness(ScriptedEditor::returning_image(&png(4, 4, [0, 0, 0, 255])), None);
        queue(&h, "stuck", "image/jpeg").await;
        h.tasks
            .transition("stuck", TaskTransition::Start)
            .await
            .unwrap();
        queue(&h, "waiting", "image/jpeg").await;

        let summary = recover_interrupted(&*h.tasks, &h.processor)
            .await
            .unwrap();
        assert_eq!(
            summary,
            RecoverySummary {
                interrupted: 1,
                requeued: 1
            }
        );

        let stuck = h.tasks.get_task("stuck").await.unwrap().unwrap();
        assert_eq!(stuck.status, TaskStatus::Error);
        assert_eq!(stuck.error.as_deref(), Some(INTERRUPTED_MESSAGE));

        let waiting = wait_terminal(&h.tasks, "waiting").await;
        assert_eq!(waiting.status, TaskStatus::Done);
    }
}
