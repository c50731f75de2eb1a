//! Batch Upsert Engine.
//!
//! Writes a batch of canonical entities in one transaction with
//! `INSERT ... ON CONFLICT(<key>) DO UPDATE SET ...`. The conflict key and
//! the overwritten columns come from the [`Resource`] implementation; the
//! identifier and the natural key are never in the update set.
//!
//! Each row also records which job and source row last wrote it, so the
//! reconciler can attribute deletions back to a job's own rows.
//!
//! Because the identifier is never updated, a record that reuses an id
//! already held under a different natural key would violate the primary
//! key and abort the whole batch. [`split_id_collisions`] catches those
//! records first and turns them into per-record failures.

use std::collections::HashMap;

use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::JobError;
use crate::models::ValidationOutcome;
use crate::resource::Resource;

/// SQLite's default bound on host parameters per statement.
const MAX_BIND_PARAMS: usize = 32_766;

/// Provenance columns appended after the resource's own columns.
const PROVENANCE_COLUMNS: &[&str] = &["import_job_id", "import_row"];

/// An entity waiting to be written, with the source row it came from.
#[derive(Debug, Clone)]
pub struct Staged<R> {
    pub row: u64,
    pub entity: R,
}

/// Writes `batch` atomically. Either every row lands or none does.
///
/// Returns the number of rows written.
pub async fn upsert_batch<R: Resource>(
    pool: &SqlitePool,
    job_id: &str,
    batch: &[Staged<R>],
) -> Result<u64, JobError> {
    let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
        return Ok(0);
    };

    write_batch(pool, job_id, batch)
        .await
        .map_err(|source| JobError::BatchWrite {
            first_row: first.row,
            last_row: last.row,
            source,
        })?;

    tracing::debug!(
        resource = %R::KIND,
        rows = batch.len(),
        first_row = first.row,
        last_row = last.row,
        "batch committed"
    );

    Ok(batch.len() as u64)
}

/// Separates entities whose id already identifies a row with a different
/// natural key, either in the table or earlier in the same batch.
///
/// Returns the entities that are safe to write and one failed outcome per
/// colliding entity, reported on `id`.
pub async fn split_id_collisions<R: Resource>(
    pool: &SqlitePool,
    batch: Vec<Staged<R>>,
) -> Result<(Vec<Staged<R>>, Vec<ValidationOutcome>), JobError> {
    // When the id is the conflict key there is nothing to collide with.
    if R::CONFLICT_KEY == "id" {
        return Ok((batch, Vec::new()));
    }
    let (Some(first_row), Some(last_row)) =
        (batch.first().map(|s| s.row), batch.last().map(|s| s.row))
    else {
        return Ok((batch, Vec::new()));
    };

    let stored = stored_keys(pool, &batch)
        .await
        .map_err(|source| JobError::BatchWrite {
            first_row,
            last_row,
            source,
        })?;

    let mut claimed: HashMap<String, String> = HashMap::new();
    let mut kept = Vec::with_capacity(batch.len());
    let mut collisions = Vec::new();

    for staged in batch {
        let id = staged.entity.id();
        let key = staged.entity.natural_key();
        let collides = claimed
            .get(id)
            .or_else(|| stored.get(id))
            .is_some_and(|owner| owner != key);
        if collides {
            let mut outcome = ValidationOutcome::new(staged.row, Some(id.to_string()));
            outcome.add_error(
                "id",
                format!(
                    "id '{}' already identifies a {} row with a different {}",
                    id,
                    R::KIND,
                    R::CONFLICT_KEY
                ),
            );
            collisions.push(outcome);
            continue;
        }
        claimed.insert(id.to_string(), key.to_string());
        kept.push(staged);
    }

    if !collisions.is_empty() {
        tracing::debug!(
            resource = %R::KIND,
            rejected = collisions.len(),
            first_row,
            last_row,
            "id collisions held back from batch"
        );
    }

    Ok((kept, collisions))
}

/// Natural keys of the stored rows whose ids appear in `batch`.
async fn stored_keys<R: Resource>(
    pool: &SqlitePool,
    batch: &[Staged<R>],
) -> Result<HashMap<String, String>, sqlx::Error> {
    let mut stored = HashMap::new();
    for chunk in batch.chunks(MAX_BIND_PARAMS) {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT id, {} FROM {} WHERE id IN (",
            R::CONFLICT_KEY,
            R::TABLE
        ));
        let mut ids = builder.separated(", ");
        for staged in chunk {
            ids.push_bind(staged.entity.id().to_string());
        }
        ids.push_unseparated(")");

        let rows: Vec<(String, String)> = builder.build_query_as().fetch_all(pool).await?;
        stored.extend(rows);
    }
    Ok(stored)
}

async fn write_batch<R: Resource>(
    pool: &SqlitePool,
    job_id: &str,
    batch: &[Staged<R>],
) -> Result<(), sqlx::Error> {
    let per_row = R::COLUMNS.len() + PROVENANCE_COLUMNS.len();
    let rows_per_statement = (MAX_BIND_PARAMS / per_row).max(1);

    let mut tx = pool.begin().await?;
    for chunk in batch.chunks(rows_per_statement) {
        let mut builder = upsert_statement::<R>(job_id, chunk);
        builder.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;

    Ok(())
}

fn upsert_statement<'args, R: Resource>(
    job_id: &str,
    chunk: &'args [Staged<R>],
) -> QueryBuilder<'args, Sqlite> {
    let mut builder = QueryBuilder::<Sqlite>::new(format!(
        "INSERT INTO {} ({}, {}) ",
        R::TABLE,
        R::COLUMNS.join(", "),
        PROVENANCE_COLUMNS.join(", ")
    ));

    builder.push_values(chunk, |mut values, staged| {
        staged.entity.bind_values(&mut values);
        values
            .push_bind(job_id.to_string())
            .push_bind(staged.row as i64);
    });

    builder.push(format!(
        " ON CONFLICT({}) DO UPDATE SET {}",
        R::CONFLICT_KEY,
        update_assignments(R::UPDATE_COLUMNS)
    ));

    builder
}

fn update_assignments(columns: &[&str]) -> String {
    columns
        .iter()
        .chain(PROVENANCE_COLUMNS)
        .map(|col| format!("{0} = excluded.{0}", col))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_include_provenance() {
        assert_eq!(
            update_assignments(&["name", "role"]),
            "name = excluded.name, role = excluded.role, \
             import_job_id = excluded.import_job_id, import_row = excluded.import_row"
        );
    }
}
