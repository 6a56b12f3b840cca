pub mod models;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;

/// SQLite-backed skip segment store, keyed by
/// (series_id, source_id, episode_number, segment_type).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

const SEGMENT_COLUMNS: &str = "series_id, source_id, episode_number, segment_type, start_time, end_time, confidence, detection_method, created_at";

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS skip_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                series_id TEXT NOT NULL,
                source_id TEXT NOT NULL,
                episode_number INTEGER NOT NULL,
                segment_type TEXT NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                confidence REAL DEFAULT 0,
                detection_method TEXT DEFAULT 'heuristic',
                created_at TEXT NOT NULL,
                UNIQUE(series_id, source_id, episode_number, segment_type)
            );

            CREATE INDEX IF NOT EXISTS idx_skip_segments_series
                ON skip_segments(series_id, source_id);
            "#,
        )?;
        Ok(())
    }

    fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<SkipSegment> {
        let segment_type: String = row.get(3)?;
        let segment_type = segment_type.parse::<SegmentType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        let method: String = row.get(7)?;
        Ok(SkipSegment {
            series_id: row.get(0)?,
            source_id: row.get(1)?,
            episode_number: row.get(2)?,
            segment_type,
            start_sec: row.get(4)?,
            end_sec: row.get(5)?,
            confidence: row.get(6)?,
            detection_method: DetectionMethod::from(method),
            created_at: row.get(8)?,
        })
    }

    // =========================================================================
    // Skip segments
    // =========================================================================

    /// Get the opening/ending pair for an episode, or `None` if neither is stored.
    pub fn get_skip_segments(
        &self,
        series_id: &str,
        source_id: &str,
        episode_number: i64,
    ) -> Result<Option<EpisodeSegments>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM skip_segments WHERE series_id = ?1 AND source_id = ?2 AND episode_number = ?3",
            SEGMENT_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![series_id, source_id, episode_number], Self::row_to_segment)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut pair = EpisodeSegments::default();
        for segment in rows {
            match segment.segment_type {
                SegmentType::Opening => pair.opening = Some(segment),
                SegmentType::Ending => pair.ending = Some(segment),
            }
        }

        Ok(if pair.is_empty() { None } else { Some(pair) })
    }

    pub fn get_skip_segment(
        &self,
        series_id: &str,
        source_id: &str,
        episode_number: i64,
        segment_type: SegmentType,
    ) -> Result<Option<SkipSegment>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            &format!(
                "SELECT {} FROM skip_segments
                 WHERE series_id = ?1 AND source_id = ?2 AND episode_number = ?3 AND segment_type = ?4",
                SEGMENT_COLUMNS
            ),
            params![series_id, source_id, episode_number, segment_type.as_str()],
            Self::row_to_segment,
        );
        match result {
            Ok(segment) => Ok(Some(segment)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a segment or replace the stored one for the same key.
    pub fn save_skip_segment(&self, segment: &SkipSegment) -> Result<()> {
        self.save_skip_segments(std::slice::from_ref(segment))
    }

    /// Save several segments in one transaction: either all are stored or
    /// none are.
    pub fn save_skip_segments(&self, segments: &[SkipSegment]) -> Result<()> {
        for segment in segments {
            validate_segment(segment)?;
        }

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = chrono::Utc::now().to_rfc3339();
        for segment in segments {
            upsert_segment(&tx, segment, &now)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete both segments of an episode. Returns the number of rows removed.
    pub fn delete_skip_segments(
        &self,
        series_id: &str,
        source_id: &str,
        episode_number: i64,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM skip_segments WHERE series_id = ?1 AND source_id = ?2 AND episode_number = ?3",
            params![series_id, source_id, episode_number],
        )?;
        Ok(removed)
    }

    /// Episode numbers of a series that already have at least one segment.
    pub fn analyzed_episode_numbers(&self, series_id: &str, source_id: &str) -> Result<BTreeSet<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT episode_number FROM skip_segments WHERE series_id = ?1 AND source_id = ?2",
        )?;
        let numbers = stmt
            .query_map(params![series_id, source_id], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<BTreeSet<_>>>()?;
        Ok(numbers)
    }

    pub fn count_by_method(&self) -> Result<SegmentStoreStats> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT detection_method, COUNT(*) FROM skip_segments GROUP BY detection_method")?;
        let mut stats = SegmentStoreStats::default();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (method, count) = row?;
            stats.total += count;
            match DetectionMethod::from(method) {
                DetectionMethod::Heuristic => stats.heuristic += count,
                DetectionMethod::Model => stats.model += count,
                DetectionMethod::Manual => stats.manual += count,
            }
        }
        Ok(stats)
    }
}

fn validate_segment(segment: &SkipSegment) -> Result<()> {
    if segment.end_sec <= segment.start_sec {
        return Err(anyhow!(
            "segment end ({}) must be greater than start ({})",
            segment.end_sec,
            segment.start_sec
        ));
    }
    Ok(())
}

fn upsert_segment(conn: &Connection, segment: &SkipSegment, now: &str) -> Result<()> {
    conn.execute(
        r#"INSERT INTO skip_segments
               (series_id, source_id, episode_number, segment_type, start_time, end_time, confidence, detection_method, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
           ON CONFLICT(series_id, source_id, episode_number, segment_type) DO UPDATE SET
               start_time = excluded.start_time,
               end_time = excluded.end_time,
               confidence = excluded.confidence,
               detection_method = excluded.detection_method,
               created_at = excluded.created_at"#,
        params![
            segment.series_id,
            segment.source_id,
            segment.episode_number,
            segment.segment_type.as_str(),
            segment.start_sec,
            segment.end_sec,
            segment.confidence.clamp(0.0, 1.0),
            segment.detection_method.to_string(),
            now
        ],
    )?;
    Ok(())
}
