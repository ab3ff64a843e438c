//! Record writes: insert, update and upsert
//!
//! Inserts go out as multi-row statements. When one fails, its batch is
//! rolled back to a savepoint and replayed one record at a time so the
//! error names the record that caused it. Updates and upserts run per
//! record. The caller owns the transaction; any error here is expected to
//! roll back the whole call.

use serde_json::{Map, Value as JsonValue};
use sqlx::PgConnection;
use tracing::debug;

use crate::error::{DatastoreError, Result};
use crate::records::{UpsertRequest, WriteMethod};
use crate::schema::{live_fields, unique_key};
use crate::sql::query::Params;
use crate::sql::sanitize::identifier;
use crate::types::{Field, ID_TYPE};

/// Engine limit on bind parameters in one statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Write `request.records` into the resource.
///
/// Returns the number of records processed.
pub(crate) async fn write_records(conn: &mut PgConnection, request: &UpsertRequest) -> Result<usize> {
    if request.records.is_empty() {
        return Ok(0);
    }
    let fields = live_fields(conn, &request.resource_id).await?;
    if fields.is_empty() {
        // nothing to write into
        return Ok(0);
    }

    match request.method {
        WriteMethod::Insert => insert_records(conn, &request.resource_id, &fields, &request.records).await,
        WriteMethod::Update | WriteMethod::Upsert => {
            let key = unique_key(conn, &request.resource_id).await?;
            let upsert = request.method == WriteMethod::Upsert;
            for (row, record) in request.records.iter().enumerate() {
                let record = as_record(record, row)?;
                let write = keyed_write(&request.resource_id, &fields, &key, record)?;
                write.execute(conn, row, upsert).await?;
            }
            Ok(request.records.len())
        }
    }
}

async fn insert_records(
    conn: &mut PgConnection,
    resource_id: &str,
    fields: &[Field],
    records: &[JsonValue],
) -> Result<usize> {
    // validate everything before the first statement runs
    let mut rows = Vec::with_capacity(records.len());
    for (row, record) in records.iter().enumerate() {
        let record = as_record(record, row)?;
        check_extra_keys(record, fields, row)?;
        rows.push(record);
    }

    let batch_rows = rows_per_batch(fields.len());
    for (batch, chunk) in rows.chunks(batch_rows).enumerate() {
        insert_batch(conn, resource_id, fields, chunk, batch * batch_rows).await?;
    }
    debug!(resource_id, rows = records.len(), "Inserted records");
    Ok(records.len())
}

fn rows_per_batch(columns: usize) -> usize {
    (MAX_BIND_PARAMS / columns.max(1)).max(1)
}

/// Insert `batch`, whose first record is `first_row` of the request
async fn insert_batch(
    conn: &mut PgConnection,
    resource_id: &str,
    fields: &[Field],
    batch: &[&Map<String, JsonValue>],
    first_row: usize,
) -> Result<()> {
    if batch.len() == 1 {
        return insert_one(conn, resource_id, fields, batch[0], first_row).await;
    }

    sqlx::raw_sql("SAVEPOINT insert_batch").execute(&mut *conn).await?;
    let (sql, params) = insert_statement(resource_id, fields, batch);
    match params.bind_to(&sql).execute(&mut *conn).await {
        Ok(_) => {
            sqlx::raw_sql("RELEASE SAVEPOINT insert_batch")
                .execute(&mut *conn)
                .await?;
            Ok(())
        }
        Err(err) => {
            debug!(resource_id, first_row, error = %err, "Batch insert failed, replaying per record");
            sqlx::raw_sql("ROLLBACK TO SAVEPOINT insert_batch")
                .execute(&mut *conn)
                .await?;
            for (offset, record) in batch.iter().enumerate() {
                insert_one(conn, resource_id, fields, record, first_row + offset).await?;
            }
            Ok(())
        }
    }
}

async fn insert_one(
    conn: &mut PgConnection,
    resource_id: &str,
    fields: &[Field],
    record: &Map<String, JsonValue>,
    row: usize,
) -> Result<()> {
    let (sql, params) = insert_statement(resource_id, fields, &[record]);
    params
        .bind_to(&sql)
        .execute(&mut *conn)
        .await
        .map_err(|err| DatastoreError::from_record(err, row))?;
    Ok(())
}

fn as_record(record: &JsonValue, row: usize) -> Result<&Map<String, JsonValue>> {
    record.as_object().ok_or_else(|| {
        DatastoreError::validation_row("records", format!("row \"{}\" is not a json object", row), row)
    })
}

fn check_extra_keys(record: &Map<String, JsonValue>, fields: &[Field], row: usize) -> Result<()> {
    let extra: Vec<&str> = record
        .keys()
        .filter(|key| !fields.iter().any(|f| &f.id == *key))
        .map(String::as_str)
        .collect();
    if extra.is_empty() {
        return Ok(());
    }
    Err(DatastoreError::validation_row(
        "records",
        format!("row \"{}\" has extra keys \"{}\"", row + 1, extra.join(", ")),
        row,
    ))
}

/// Multi-row INSERT over every column; absent keys become NULL
fn insert_statement(
    resource_id: &str,
    fields: &[Field],
    records: &[&Map<String, JsonValue>],
) -> (String, Params) {
    let mut params = Params::bound();
    let rows: Vec<String> = records
        .iter()
        .map(|record| {
            let values: Vec<String> = fields
                .iter()
                .map(|field| {
                    let value = record.get(&field.id).unwrap_or(&JsonValue::Null);
                    params.push_value(value, field.type_name())
                })
                .collect();
            format!("({})", values.join(", "))
        })
        .collect();
    let columns: Vec<String> = fields.iter().map(|f| identifier(&f.id)).collect();

    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        identifier(resource_id),
        columns.join(", "),
        rows.join(", ")
    );
    (sql, params)
}

/// UPDATE (and for upserts a guarded INSERT) of one record, located by
/// `_id` or the unique key
#[derive(Debug)]
struct KeyedWrite {
    update: String,
    /// `None` when the record carries no column besides `_id`
    insert: Option<String>,
    params: Params,
    key_display: String,
}

impl KeyedWrite {
    async fn execute(&self, conn: &mut PgConnection, row: usize, upsert: bool) -> Result<()> {
        let updated = self
            .params
            .bind_to(&self.update)
            .execute(&mut *conn)
            .await
            .map_err(|err| DatastoreError::from_record(err, row))?
            .rows_affected();

        if !upsert {
            if updated != 1 {
                return Err(DatastoreError::validation_row(
                    "key",
                    format!("key \"{}\" not found", self.key_display),
                    row,
                ));
            }
            return Ok(());
        }

        if let Some(insert) = &self.insert {
            self.params
                .bind_to(insert)
                .execute(&mut *conn)
                .await
                .map_err(|err| DatastoreError::from_record(err, row))?;
        }
        Ok(())
    }
}

fn keyed_write(
    resource_id: &str,
    fields: &[Field],
    key: &[String],
    record: &Map<String, JsonValue>,
) -> Result<KeyedWrite> {
    let by_id = record.contains_key("_id");
    if key.is_empty() && !by_id {
        return Err(DatastoreError::validation(
            "table",
            "unique key must be passed for update/upsert",
        ));
    }
    if !by_id {
        let missing: Vec<&str> = key
            .iter()
            .filter(|k| !record.contains_key(k.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(DatastoreError::validation(
                "key",
                format!("fields \"{}\" are missing but needed as key", missing.join(", ")),
            ));
        }
    }

    let unknown: Vec<&str> = record
        .keys()
        .filter(|k| *k != "_id" && !fields.iter().any(|f| &f.id == *k))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(DatastoreError::validation(
            "fields",
            format!("fields \"{}\" do not exist", unknown.join(", ")),
        ));
    }

    let mut params = Params::bound();
    let used: Vec<&Field> = fields.iter().filter(|f| record.contains_key(&f.id)).collect();
    let columns: Vec<String> = used.iter().map(|f| identifier(&f.id)).collect();
    let values: Vec<String> = used
        .iter()
        .map(|f| params.push_value(&record[&f.id], f.type_name()))
        .collect();

    let key_columns: Vec<(&str, &str)> = if by_id {
        vec![("_id", ID_TYPE)]
    } else {
        key.iter()
            .map(|k| {
                let type_name = fields
                    .iter()
                    .find(|f| &f.id == k)
                    .map(Field::type_name)
                    .unwrap_or("text");
                (k.as_str(), type_name)
            })
            .collect()
    };
    let key_sql: Vec<String> = key_columns.iter().map(|(k, _)| identifier(k)).collect();
    let key_values: Vec<String> = key_columns
        .iter()
        .map(|(k, type_name)| params.push_value(&record[*k], type_name))
        .collect();
    let key_display: Vec<String> = key_columns
        .iter()
        .map(|(k, _)| match &record[*k] {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();

    let table = identifier(resource_id);
    let condition = format!("({}) = ({})", key_sql.join(", "), key_values.join(", "));
    let update = if columns.is_empty() {
        format!("UPDATE {} SET \"_full_text\" = NULL WHERE {}", table, condition)
    } else {
        format!(
            "UPDATE {} SET ({}, \"_full_text\") = ({}, NULL) WHERE {}",
            table,
            columns.join(", "),
            values.join(", "),
            condition
        )
    };
    let insert = (!columns.is_empty()).then(|| {
        format!(
            "INSERT INTO {table} ({}) SELECT {} WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {})",
            columns.join(", "),
            values.join(", "),
            condition
        )
    });

    Ok(KeyedWrite {
        update,
        insert,
        params,
        key_display: key_display.join(", "),
    })
}
