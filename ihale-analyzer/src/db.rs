//! Document repository
//!
//! Uploaded tender documents live in the `documents` table. The worker reads
//! a row before analysis and writes the outcome back afterwards.

use std::path::Path;

use chrono::Utc;
use ihale_common::events::DocumentId;
use ihale_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

/// Open (or create) the database and make sure the schema exists
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;
    create_schema(&pool).await?;
    Ok(pool)
}

/// Create the documents table if missing
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY,
            original_filename TEXT,
            file_type TEXT,
            storage_path TEXT,
            processing_status TEXT NOT NULL DEFAULT 'pending',
            analysis_result TEXT,
            error_message TEXT,
            processed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (documents)");
    Ok(())
}

/// One row of `documents`
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub original_filename: Option<String>,
    pub file_type: Option<String>,
    pub storage_path: Option<String>,
    pub processing_status: String,
    pub analysis_result: Option<String>,
}

impl DocumentRecord {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            original_filename: row.get("original_filename"),
            file_type: row.get("file_type"),
            storage_path: row.get("storage_path"),
            processing_status: row.get("processing_status"),
            analysis_result: row.get("analysis_result"),
        }
    }

    /// Filename shown to observers
    pub fn display_name(&self) -> String {
        display_name(self.id, self.original_filename.as_deref())
    }

    /// Lowercase extension without the dot, from `file_type` or the filename
    pub fn extension(&self) -> Option<String> {
        let raw = self
            .file_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.original_filename
                    .as_deref()
                    .and_then(|name| Path::new(name).extension())
                    .map(|ext| ext.to_string_lossy().into_owned())
            })?;
        Some(raw.trim().trim_start_matches('.').to_ascii_lowercase())
    }

    /// Stored analysis of an already completed document
    pub fn cached_analysis(&self) -> Option<serde_json::Value> {
        if self.processing_status != STATUS_COMPLETED {
            return None;
        }
        self.analysis_result
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Fallback label for documents without a stored filename
pub fn display_name(id: DocumentId, original_filename: Option<&str>) -> String {
    match original_filename.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => format!("Document #{}", id),
    }
}

pub async fn load_document(pool: &SqlitePool, id: DocumentId) -> Result<Option<DocumentRecord>> {
    let row = sqlx::query(
        r#"
        SELECT id, original_filename, file_type, storage_path,
               processing_status, analysis_result
        FROM documents
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.as_ref().map(DocumentRecord::from_row))
}

/// Filenames for the given ids; unknown ids are absent from the result
pub async fn load_filenames(
    pool: &SqlitePool,
    ids: &[DocumentId],
) -> Result<Vec<(DocumentId, String)>> {
    let mut names = Vec::with_capacity(ids.len());
    for &id in ids {
        let row = sqlx::query("SELECT original_filename FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        if let Some(row) = row {
            let name: Option<String> = row.get("original_filename");
            names.push((id, display_name(id, name.as_deref())));
        }
    }
    Ok(names)
}

pub async fn mark_processing(pool: &SqlitePool, id: DocumentId) -> Result<()> {
    sqlx::query("UPDATE documents SET processing_status = ? WHERE id = ?")
        .bind(STATUS_PROCESSING)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_completed(
    pool: &SqlitePool,
    id: DocumentId,
    analysis: &serde_json::Value,
) -> Result<()> {
    let analysis = serde_json::to_string(analysis)?;
    sqlx::query(
        r#"
        UPDATE documents
        SET processing_status = ?, analysis_result = ?, error_message = NULL, processed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(STATUS_COMPLETED)
    .bind(&analysis)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_failed(pool: &SqlitePool, id: DocumentId, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE documents
        SET processing_status = ?, error_message = ?, processed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(STATUS_FAILED)
    .bind(error)
    .bind(Utc::now().to_rfc3339())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a document row (used by tooling and tests)
pub async fn insert_document(
    pool: &SqlitePool,
    id: DocumentId,
    original_filename: &str,
    file_type: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, original_filename, file_type, processing_status)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(original_filename)
    .bind(file_type)
    .bind(STATUS_PENDING)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        create_schema(&pool).await.unwrap();
        pool
    }

    fn record(file_type: Option<&str>, filename: Option<&str>) -> DocumentRecord {
        DocumentRecord {
            id: 1,
            original_filename: filename.map(str::to_string),
            file_type: file_type.map(str::to_string),
            storage_path: None,
            processing_status: STATUS_PENDING.to_string(),
            analysis_result: None,
        }
    }

    #[test]
    fn test_extension_normalization() {
        assert_eq!(record(Some(".ZIP"), None).extension().as_deref(), Some("zip"));
        assert_eq!(
            record(None, Some("teknik_sartname.PDF")).extension().as_deref(),
            Some("pdf")
        );
        assert_eq!(record(Some(" "), Some("ek.rar")).extension().as_deref(), Some("rar"));
        assert_eq!(record(None, Some("README")).extension(), None);
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(record(None, None).display_name(), "Document #1");
        assert_eq!(record(None, Some("a.pdf")).display_name(), "a.pdf");
    }

    #[tokio::test]
    async fn test_roundtrip_and_cached_analysis() {
        let pool = memory_pool().await;
        insert_document(&pool, 42, "idari_sartname.pdf", Some("pdf"))
            .await
            .unwrap();

        let doc = load_document(&pool, 42).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, STATUS_PENDING);
        assert!(doc.cached_analysis().is_none());

        mark_completed(&pool, 42, &serde_json::json!({"summary": "ok"}))
            .await
            .unwrap();
        let doc = load_document(&pool, 42).await.unwrap().unwrap();
        assert_eq!(doc.cached_analysis().unwrap()["summary"], "ok");

        assert!(load_document(&pool, 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_document_has_no_cache() {
        let pool = memory_pool().await;
        insert_document(&pool, 5, "bozuk.pdf", None).await.unwrap();
        mark_failed(&pool, 5, "unreadable").await.unwrap();
        let doc = load_document(&pool, 5).await.unwrap().unwrap();
        assert_eq!(doc.processing_status, STATUS_FAILED);
        assert!(doc.cached_analysis().is_none());
    }

    #[tokio::test]
    async fn test_load_filenames_skips_unknown() {
        let pool = memory_pool().await;
        insert_document(&pool, 1, "a.pdf", None).await.unwrap();
        insert_document(&pool, 2, "", None).await.unwrap();
        let names = load_filenames(&pool, &[1, 2, 3]).await.unwrap();
        assert_eq!(
            names,
            vec![(1, "a.pdf".to_string()), (2, "Document #2".to_string())]
        );
    }
}
