//! Dataset repository for the `datasets` table.
//!
//! Descriptive fields are owned by source syncs (`upsert`/`bulk_upsert`).
//! The enrichment envelope (`enrichment_status`, `enrichment_attempts`,
//! `current_stage`, `last_enrichment_error`, `last_enriched_at`,
//! `last_checked_at`) is only written by the crate-private functions at the
//! bottom of this file, which are driven by `crate::enrichment`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    format_timestamp, optional_timestamp_column, timestamp_column, Database, DatabaseError,
};
use crate::enrichment::status::{EnrichmentStage, EnrichmentStatus};

/// Width of the embedding vectors stored on dataset records.
pub const EMBEDDING_DIMENSIONS: usize = 384;

/// Descriptive data for one dataset as seen by a source sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDataset {
    pub source_name: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub license: Option<String>,
    pub file_formats: Option<Vec<String>>,
    pub total_size_bytes: Option<i64>,
    pub column_names: Option<Vec<String>>,
    pub row_count: Option<i64>,
    #[serde(default)]
    pub download_count: i64,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub like_count: i64,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub source_meta: Option<serde_json::Value>,
}

impl NewDataset {
    pub fn new(
        source_name: impl Into<String>,
        external_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            external_id: external_id.into(),
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }
}

/// A dataset row, including its enrichment envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRow {
    pub id: String,
    pub source_name: String,
    pub external_id: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub license: Option<String>,
    pub file_formats: Option<Vec<String>>,
    pub total_size_bytes: Option<i64>,
    pub column_names: Option<Vec<String>>,
    pub row_count: Option<i64>,
    pub download_count: i64,
    pub view_count: i64,
    pub like_count: i64,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub static_score: Option<f64>,
    pub is_active: bool,
    pub enrichment_status: EnrichmentStatus,
    pub enrichment_attempts: u32,
    pub current_stage: Option<EnrichmentStage>,
    pub last_enrichment_error: Option<String>,
    pub last_enriched_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub source_meta: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DatasetRow {
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let embedding: Option<Vec<u8>> = row.get("embedding")?;
        Ok(Self {
            id: row.get("id")?,
            source_name: row.get("source_name")?,
            external_id: row.get("external_id")?,
            title: row.get("title")?,
            url: row.get("url")?,
            description: row.get("description")?,
            tags: json_column(row, "tags")?,
            license: row.get("license")?,
            file_formats: json_column(row, "file_formats")?,
            total_size_bytes: row.get("total_size_bytes")?,
            column_names: json_column(row, "column_names")?,
            row_count: row.get("row_count")?,
            download_count: row.get("download_count")?,
            view_count: row.get("view_count")?,
            like_count: row.get("like_count")?,
            source_created_at: optional_timestamp_column(row, "source_created_at")?,
            source_updated_at: optional_timestamp_column(row, "source_updated_at")?,
            embedding: embedding.as_deref().and_then(decode_embedding),
            static_score: row.get("static_score")?,
            is_active: row.get("is_active")?,
            enrichment_status: row.get("enrichment_status")?,
            enrichment_attempts: row.get("enrichment_attempts")?,
            current_stage: row.get("current_stage")?,
            last_enrichment_error: row.get("last_enrichment_error")?,
            last_enriched_at: optional_timestamp_column(row, "last_enriched_at")?,
            last_checked_at: optional_timestamp_column(row, "last_checked_at")?,
            source_meta: json_column(row, "source_meta")?,
            created_at: timestamp_column(row, "created_at")?,
            updated_at: timestamp_column(row, "updated_at")?,
        })
    }

    /// Active, fully enriched and embedded.
    pub fn is_ready_for_search(&self) -> bool {
        self.is_active
            && self.enrichment_status == EnrichmentStatus::Enriched
            && self.embedding.is_some()
    }
}

/// Per-status record counts for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceStats {
    pub source: String,
    pub total: u64,
    pub minimal: u64,
    pub pending: u64,
    pub enriching: u64,
    pub enriched: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Encodes an embedding as little-endian `f32`s.
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decodes a little-endian `f32` blob. Returns `None` for a truncated blob.
pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn json_text<T: Serialize>(
    column: &'static str,
    value: &Option<T>,
) -> Result<Option<String>, DatabaseError> {
    value
        .as_ref()
        .map(|v| serde_json::to_string(v).map_err(|source| DatabaseError::Json { column, source }))
        .transpose()
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|s| {
        serde_json::from_str(&s).map_err(|e| {
            let idx = row.as_ref().column_index(name).unwrap_or_default();
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

const UPSERT_SQL: &str = "INSERT INTO datasets (id, source_name, external_id, title, url, description,
     tags, license, file_formats, total_size_bytes, column_names, row_count, download_count,
     view_count, like_count, source_created_at, source_updated_at, source_meta, created_at, updated_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?19)
     ON CONFLICT(source_name, external_id) DO UPDATE SET
       title = excluded.title,
       url = excluded.url,
       description = excluded.description,
       tags = excluded.tags,
       license = excluded.license,
       file_formats = excluded.file_formats,
       total_size_bytes = excluded.total_size_bytes,
       column_names = excluded.column_names,
       row_count = excluded.row_count,
       download_count = excluded.download_count,
       view_count = excluded.view_count,
       like_count = excluded.like_count,
       source_created_at = excluded.source_created_at,
       source_updated_at = excluded.source_updated_at,
       source_meta = excluded.source_meta,
       updated_at = excluded.updated_at
     RETURNING *";

fn upsert_on(
    conn: &Connection,
    dataset: &NewDataset,
    now: DateTime<Utc>,
) -> Result<DatasetRow, DatabaseError> {
    let tags = json_text("tags", &dataset.tags)?;
    let file_formats = json_text("file_formats", &dataset.file_formats)?;
    let column_names = json_text("column_names", &dataset.column_names)?;
    let source_meta = json_text("source_meta", &dataset.source_meta)?;

    let row = conn.query_row(
        UPSERT_SQL,
        params![
            uuid::Uuid::new_v4().to_string(),
            dataset.source_name,
            dataset.external_id,
            dataset.title,
            dataset.url,
            dataset.description,
            tags,
            dataset.license,
            file_formats,
            dataset.total_size_bytes,
            column_names,
            dataset.row_count,
            dataset.download_count,
            dataset.view_count,
            dataset.like_count,
            dataset.source_created_at.as_ref().map(format_timestamp),
            dataset.source_updated_at.as_ref().map(format_timestamp),
            source_meta,
            format_timestamp(&now),
        ],
        DatasetRow::from_row,
    )?;
    Ok(row)
}

/// Inserts a dataset or refreshes the descriptive fields of the row with the
/// same `(source_name, external_id)`. The enrichment envelope, embedding,
/// static score and active flag of an existing row are left untouched.
pub fn upsert(
    db: &Database,
    dataset: &NewDataset,
    now: DateTime<Utc>,
) -> Result<DatasetRow, DatabaseError> {
    db.with_conn(|conn| upsert_on(conn, dataset, now))
}

/// Upserts a batch in a single transaction. Either every row is written or
/// none is; on failure the error reports how many rows had succeeded before
/// the rollback.
pub fn bulk_upsert(
    db: &Database,
    datasets: &[NewDataset],
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    if datasets.is_empty() {
        return Ok(0);
    }

    let total = datasets.len();
    let written = db.with_transaction(|tx| {
        for (index, dataset) in datasets.iter().enumerate() {
            upsert_on(tx, dataset, now).map_err(|e| match e {
                DatabaseError::Sqlite(source) => DatabaseError::BatchWrite {
                    succeeded: index,
                    total,
                    source,
                },
                other => other,
            })?;
        }
        Ok::<usize, DatabaseError>(total)
    });

    match &written {
        Ok(count) => log::debug!("Bulk upserted {} datasets", count),
        Err(e) => log::warn!("Bulk upsert rolled back: {}", e),
    }
    written
}

/// Finds a dataset by its internal ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DatasetRow>, DatabaseError> {
    db.with_conn(|conn| find_by_id_on(conn, id))
}

pub(crate) fn find_by_id_on(
    conn: &Connection,
    id: &str,
) -> Result<Option<DatasetRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM datasets WHERE id = ?1",
            params![id],
            DatasetRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Finds a dataset by its source identity.
pub fn find_by_external_id(
    db: &Database,
    source_name: &str,
    external_id: &str,
) -> Result<Option<DatasetRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM datasets WHERE source_name = ?1 AND external_id = ?2",
                params![source_name, external_id],
                DatasetRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Returns up to `limit` active records of `source_name` that a worker may
/// claim: status `minimal`, `pending` or `failed` with attempts remaining.
///
/// Least recently checked first (never-checked first), so every eligible
/// record is eventually reached.
pub fn pending_for_enrichment(
    db: &Database,
    source_name: &str,
    limit: u32,
    max_attempts: u32,
) -> Result<Vec<DatasetRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM datasets
             WHERE source_name = ?1
               AND enrichment_status IN ('minimal', 'pending', 'failed')
               AND enrichment_attempts < ?2
               AND is_active = 1
             ORDER BY last_checked_at ASC NULLS FIRST, created_at ASC, id ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![source_name, max_attempts, limit], DatasetRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts datasets of a source.
pub fn count_by_source(db: &Database, source_name: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM datasets WHERE source_name = ?1",
            params![source_name],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Counts datasets of a source in the given status.
pub fn count_by_status(
    db: &Database,
    source_name: &str,
    status: EnrichmentStatus,
) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM datasets WHERE source_name = ?1 AND enrichment_status = ?2",
            params![source_name, status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Returns per-status counts for a source.
pub fn stats_by_source(db: &Database, source_name: &str) -> Result<SourceStats, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT enrichment_status, COUNT(*) FROM datasets
             WHERE source_name = ?1 GROUP BY enrichment_status",
        )?;
        let counts = stmt
            .query_map(params![source_name], |row| {
                Ok((row.get::<_, EnrichmentStatus>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stats = SourceStats {
            source: source_name.to_string(),
            ..Default::default()
        };
        for (status, count) in counts {
            stats.total += count;
            let slot = match status {
                EnrichmentStatus::Minimal => &mut stats.minimal,
                EnrichmentStatus::Pending => &mut stats.pending,
                EnrichmentStatus::Enriching => &mut stats.enriching,
                EnrichmentStatus::Enriched => &mut stats.enriched,
                EnrichmentStatus::Failed => &mut stats.failed,
                EnrichmentStatus::Skipped => &mut stats.skipped,
            };
            *slot = count;
        }
        Ok(stats)
    })
}

/// Counts records of a source that are ready to be served by search.
pub fn count_ready_for_search(db: &Database, source_name: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM datasets
             WHERE source_name = ?1 AND is_active = 1
               AND enrichment_status = 'enriched' AND embedding IS NOT NULL",
            params![source_name],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Soft-deletes a dataset. Returns `false` if no such dataset exists.
pub fn deactivate(db: &Database, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE datasets SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![id, format_timestamp(&now)],
        )?;
        Ok(changed > 0)
    })
}

/// Rebuilds the full-text projection from the `datasets` table.
pub fn rebuild_search_projection(db: &Database) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute_batch("INSERT INTO datasets_fts(datasets_fts) VALUES ('rebuild');")?;
        log::info!("Rebuilt dataset search projection");
        Ok(())
    })
}

// ─── Envelope writes (driven by crate::enrichment) ──────────────────────────

/// Claims a record: moves it to `enriching` only if it is still claimable at
/// the instant of the write. A single conditional `UPDATE`, so two workers
/// racing for the same row cannot both see it change. `None` means another
/// worker got there first (or the record is not claimable at all).
pub(crate) fn mark_enriching(
    conn: &Connection,
    id: &str,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Option<DatasetRow>, DatabaseError> {
    let row = conn
        .query_row(
            "UPDATE datasets
             SET enrichment_status = 'enriching', last_checked_at = ?2, updated_at = ?2
             WHERE id = ?1
               AND enrichment_status IN ('minimal', 'pending', 'failed')
               AND enrichment_attempts < ?3
               AND is_active = 1
             RETURNING *",
            params![id, format_timestamp(&now), max_attempts],
            DatasetRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// New envelope values for a record leaving `expected`.
#[derive(Debug, Clone)]
pub(crate) struct EnvelopeWrite<'a> {
    pub id: &'a str,
    pub expected: EnrichmentStatus,
    pub status: EnrichmentStatus,
    pub attempts: u32,
    pub current_stage: Option<EnrichmentStage>,
    pub last_error: Option<&'a str>,
    pub last_enriched_at: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Writes a computed envelope, conditioned on the record still being in
/// `expected`. Returns the number of rows changed (0 or 1).
pub(crate) fn write_envelope(
    conn: &Connection,
    write: &EnvelopeWrite<'_>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE datasets
         SET enrichment_status = ?3,
             enrichment_attempts = ?4,
             current_stage = ?5,
             last_enrichment_error = ?6,
             last_enriched_at = COALESCE(?7, last_enriched_at),
             updated_at = ?8
         WHERE id = ?1 AND enrichment_status = ?2",
        params![
            write.id,
            write.expected,
            write.status,
            write.attempts,
            write.current_stage,
            write.last_error,
            write.last_enriched_at.as_ref().map(format_timestamp),
            format_timestamp(&write.now),
        ],
    )?;
    Ok(changed)
}

/// Stores stage outputs on a record. `None` leaves the column as is.
pub(crate) fn write_artifacts(
    conn: &Connection,
    id: &str,
    embedding: Option<&[f32]>,
    static_score: Option<f64>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE datasets
         SET embedding = COALESCE(?2, embedding),
             static_score = COALESCE(?3, static_score)
         WHERE id = ?1",
        params![id, embedding.map(encode_embedding), static_score],
    )?;
    Ok(())
}

/// `minimal → pending` for one record. Returns rows changed.
pub(crate) fn mark_pending(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE datasets SET enrichment_status = 'pending', updated_at = ?2
         WHERE id = ?1 AND enrichment_status = 'minimal'",
        params![id, format_timestamp(&now)],
    )?;
    Ok(changed)
}

/// `minimal → pending` for every active record of a source.
pub(crate) fn mark_source_pending(
    conn: &Connection,
    source_name: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE datasets SET enrichment_status = 'pending', updated_at = ?2
         WHERE source_name = ?1 AND enrichment_status = 'minimal' AND is_active = 1",
        params![source_name, format_timestamp(&now)],
    )?;
    Ok(changed)
}

/// Operator reset: back to `pending` with a fresh attempt budget. Never
/// touches a record that is currently claimed.
pub(crate) fn reset_envelope(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE datasets
         SET enrichment_status = 'pending',
             enrichment_attempts = 0,
             current_stage = NULL,
             last_enrichment_error = NULL,
             is_active = 1,
             updated_at = ?2
         WHERE id = ?1 AND enrichment_status != 'enriching'",
        params![id, format_timestamp(&now)],
    )?;
    Ok(changed)
}

/// IDs of records claimed before `cutoff` and still `enriching`.
pub(crate) fn find_stale_enriching(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<String>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id FROM datasets
         WHERE enrichment_status = 'enriching'
           AND (last_checked_at IS NULL OR last_checked_at < ?1)
         ORDER BY last_checked_at ASC NULLS FIRST
         LIMIT ?2",
    )?;
    let ids = stmt
        .query_map(params![format_timestamp(&cutoff), limit], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
