//! Admin dashboard endpoints: listing, stats, deletion and bulk export.

use std::io::{Cursor, Write as IoWrite};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::task::store::{TaskCursor, TaskPage, TaskQuery, MAX_PAGE_SIZE};
use crate::task::{task_folder, TaskStatus};

use super::routes::{store_error, AppState};
use super::types::{ExportQuery, ListTasksQuery, StatsResponse};

fn parse_status(raw: Option<&str>) -> Result<Option<TaskStatus>, (StatusCode, String)> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => TaskStatus::parse(s)
            .map(Some)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("Unknown status: {}", s))),
    }
}

/// GET /api/admin/tasks
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListTasksQuery>,
) -> Result<Json<TaskPage>, (StatusCode, String)> {
    let defaults = TaskQuery::default();
    let cursor = q
        .cursor
        .as_deref()
        .filter(|c| !c.is_empty())
        .map(TaskCursor::decode)
        .transpose()
        .map_err(store_error)?;

    let query = TaskQuery {
        status: parse_status(q.status.as_deref())?,
        limit: q.limit.unwrap_or(defaults.limit).clamp(1, MAX_PAGE_SIZE),
        cursor,
    };

    let page = state.tasks.list_tasks(query).await.map_err(store_error)?;
    Ok(Json(page))
}

/// GET /api/admin/stats
pub async fn get_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatsResponse>, (StatusCode, String)> {
    let counts = state.tasks.count_by_status().await.map_err(store_error)?;

    let finished = counts.done + counts.error;
    let success_rate = if finished > 0 {
        counts.done as f64 / finished as f64
    } else {
        1.0
    };

    Ok(Json(StatsResponse {
        total_tasks: counts.total(),
        queued_tasks: counts.queued,
        processing_tasks: counts.processing,
        completed_tasks: counts.done,
        failed_tasks: counts.error,
        success_rate,
    }))
}

/// DELETE /api/admin/tasks/:id
/// Removes the record and every blob under its folder.
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    if !state.tasks.delete_task(&id).await.map_err(store_error)? {
        return Err((StatusCode::NOT_FOUND, format!("Task {} not found", id)));
    }

    let removed = state
        .blobs
        .delete_prefix(&task_folder(&id))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    tracing::info!(task_id = %id, blobs = removed, "Deleted task");
    Ok(Json(serde_json::json!({
        "success": true,
        "deletedBlobs": removed
    })))
}

/// GET /api/admin/export
/// ZIP of every blob belonging to tasks in `status` (default `done`).
pub async fn export(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ExportQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let status = parse_status(q.status.as_deref())?.unwrap_or(TaskStatus::Done);
    let records = state
        .tasks
        .tasks_with_status(status)
        .await
        .map_err(store_error)?;

    let mut archive = ExportArchive::new();
    for record in &records {
        let folder = task_folder(&record.id);
        let paths = state
            .blobs
            .list(&folder)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
        for path in paths {
            let Some(file) = path.strip_prefix(&folder) else {
                continue;
            };
            match state.blobs.get(&path).await {
                Ok(Some(blob)) => {
                    archive = archive
                        .append(format!("{}/{}", record.id, file), blob.bytes)
                        .await
                        .map_err(archive_error)?;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Skipping unreadable blob in export");
                }
            }
        }
    }

    let files = archive.files;
    let archive = archive.finish().await.map_err(archive_error)?;

    tracing::info!(
        status = %status,
        tasks = records.len(),
        files,
        bytes = archive.len(),
        "Built export archive"
    );

    let timestamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    let filename = format!("photobooth-{}-{}.zip", status, timestamp);
    let content_disposition = format!("attachment; filename=\"{}\"", filename);

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_DISPOSITION, content_disposition),
    ];

    Ok((headers, Body::from(archive)))
}

fn archive_error(err: anyhow::Error) -> (StatusCode, String) {
    tracing::error!(error = %err, "Export archive failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Failed to build export archive: {:#}", err),
    )
}

/// ZIP built one entry at a time on the blocking pool, so only the blob being
/// compressed is held uncompressed.
struct ExportArchive {
    zip: zip::ZipWriter<Cursor<Vec<u8>>>,
    files: usize,
}

impl ExportArchive {
    fn new() -> Self {
        Self {
            zip: zip::ZipWriter::new(Cursor::new(Vec::new())),
            files: 0,
        }
    }

    async fn append(mut self, name: String, bytes: Vec<u8>) -> anyhow::Result<Self> {
        tokio::task::spawn_blocking(move || {
            let options = zip::write::SimpleFileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            self.zip.start_file(name, options)?;
            self.zip.write_all(&bytes)?;
            self.files += 1;
            Ok::<_, anyhow::Error>(self)
        })
        .await?
    }

    async fn finish(self) -> anyhow::Result<Vec<u8>> {
        let cursor = tokio::task::spawn_blocking(move || self.zip.finish()).await??;
        Ok(cursor.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::super::routes::testing::{spawn, TestServer};
    use super::ExportArchive;
    use super::super::types::{LoginResponse, StatsResponse};
    use crate::storage::BlobMetadata;
    use crate::task::store::NewTask;
    use crate::task::{TaskFailure, TaskTransition};
    use std::collections::HashSet;
    use std::io::Read;

    async fn finished_task(server: &TestServer, id: &str) {
        let tasks = &server.state.tasks;
        let input = format!("tasks/{}/input.jpg", id);
        server
            .state
            .blobs
            .put(&input, b"in".to_vec(), BlobMetadata::new("image/jpeg"))
            .await
            .unwrap();
        server
            .state
            .blobs
            .put(
                &format!("tasks/{}/output.png", id),
                b"out".to_vec(),
                BlobMetadata::new("image/png").with_token("t"),
            )
            .await
            .unwrap();
        tasks
            .create_task(NewTask {
                id: id.to_string(),
                input_path: Some(input),
            })
            .await
            .unwrap();
        tasks.transition(id, TaskTransition::Start).await.unwrap();
        tasks
            .transition(
                id,
                TaskTransition::Complete {
                    url: "http://x".to_string(),
                    output_path: format!("tasks/{}/output.png", id),
                },
            )
            .await
            .unwrap();
    }

    async fn failed_task(server: &TestServer, id: &str) {
        server
            .state
            .tasks
            .create_task(NewTask {
                id: id.to_string(),
                input_path: None,
            })
            .await
            .unwrap();
        server
            .state
            .tasks
            .transition(id, TaskTransition::Fail(TaskFailure::new("no input")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn admin_routes_require_token_outside_dev_mode() {
        let server = spawn(|config| {
            config.dev_mode = false;
            config.auth.dashboard_password = Some("letmein".to_string());
            config.auth.jwt_secret = Some("jwt-secret".to_string());
        })
        .await;

        let denied = server
            .client
            .get(server.url("/api/admin/stats"))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let bad_login = server
            .client
            .post(server.url("/api/auth/login"))
            .json(&serde_json::json!({"password": "nope"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_login.status(), reqwest::StatusCode::UNAUTHORIZED);

        let login: LoginResponse = server
            .client
            .post(server.url("/api/auth/login"))
            .json(&serde_json::json!({"password": "letmein"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        let allowed = server
            .client
            .get(server.url("/api/admin/stats"))
            .bearer_auth(&login.token)
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);

        let forged = server
            .client
            .get(server.url("/api/admin/stats"))
            .bearer_auth("not-a-jwt")
            .send()
            .await
            .unwrap();
        assert_eq!(forged.status(), reqwest::StatusCode::UNAUTHORIZED);

        let public = server
            .client
            .get(server.url("/api/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(public.status(), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let server = spawn(|_| {}).await;
        finished_task(&server, "a").await;
        finished_task(&server, "b").await;
        failed_task(&server, "c").await;
        server
            .state
            .tasks
            .create_task(NewTask {
                id: "d".to_string(),
                input_path: None,
            })
            .await
            .unwrap();

        let stats: StatsResponse = server
            .client
            .get(server.url("/api/admin/stats"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(stats.total_tasks, 4);
        assert_eq!(stats.queued_tasks, 1);
        assert_eq!(stats.completed_tasks, 2);
        assert_eq!(stats.failed_tasks, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn list_pages_through_every_task_once() {
        let server = spawn(|_| {}).await;
        for i in 0..5 {
            failed_task(&server, &format!("t{}", i)).await;
        }

        let mut seen = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        loop {
            let mut url = server.url("/api/admin/tasks?limit=2");
            if let Some(c) = &cursor {
                url.push_str(&format!("&cursor={}", c));
            }
            let page: serde_json::Value = server
                .client
                .get(url)
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            pages += 1;
            for task in page["tasks"].as_array().unwrap() {
                assert!(seen.insert(task["id"].as_str().unwrap().to_string()));
            }
            match page["nextCursor"].as_str() {
                Some(next) => cursor = Some(next.to_string()),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn list_rejects_bad_status_and_cursor() {
        let server = spawn(|_| {}).await;
        for query in ["status=finished", "cursor=%%%"] {
            let response = server
                .client
                .get(server.url(&format!("/api/admin/tasks?{}", query)))
                .send()
                .await
                .unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{}", query);
        }
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let server = spawn(|_| {}).await;
        finished_task(&server, "ok").await;
        failed_task(&server, "bad").await;

        let page: serde_json::Value = server
            .client
            .get(server.url("/api/admin/tasks?status=error"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let tasks = page["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["id"], "bad");
        assert!(page.get("nextCursor").is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_and_blobs() {
        let server = spawn(|_| {}).await;
        finished_task(&server, "gone").await;
        finished_task(&server, "kept").await;

        let response = server
            .client
            .delete(server.url("/api/admin/tasks/gone"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert!(server.state.tasks.get_task("gone").await.unwrap().is_none());
        assert!(server.state.blobs.list("tasks/gone/").await.unwrap().is_empty());
        assert_eq!(server.state.blobs.list("tasks/kept/").await.unwrap().len(), 2);

        let again = server
            .client
            .delete(server.url("/api/admin/tasks/gone"))
            .send()
            .await
            .unwrap();
        assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn export_with_no_matches_is_an_empty_zip() {
        let server = spawn(|_| {}).await;
        failed_task(&server, "c").await;

        let bytes = server
            .client
            .get(server.url("/api/admin/export"))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[tokio::test]
    async fn archive_appends_entries_in_order() {
        let archive = ExportArchive::new()
            .append("a/input.jpg".to_string(), b"in".to_vec())
            .await
            .unwrap()
            .append("a/output.png".to_string(), vec![0u8; 4096])
            .await
            .unwrap();
        assert_eq!(archive.files, 2);

        let bytes = archive.finish().await.unwrap();
        let mut zip = zip::ZipArchive::new(std::io::Cursor::new(bytes)).unwrap();
        assert_eq!(zip.by_index(0).unwrap().name(), "a/input.jpg");
        let mut out = Vec::new();
        zip.by_name("a/output.png").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![0u8; 4096]);
    }

    #[tokio::test]
    async fn export_zips_done_task_folders() {
        let server = spawn(|_| {}).await;
        finished_task(&server, "a").await;
        finished_task(&server, "b").await;
        failed_task(&server, "c").await;

        let response = server
            .client
            .get(server.url("/api/admin/export"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/zip"
        );
        let bytes = response.bytes().await.unwrap();

        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes.to_vec())).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(
            names,
            vec!["a/input.jpg", "a/output.png", "b/input.jpg", "b/output.png"]
        );

        let mut contents = String::new();
        archive
            .by_name("a/output.png")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "out");
    }
}
