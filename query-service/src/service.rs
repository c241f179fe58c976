//! 查询执行服务模块

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use common::errors::{AppError, AppResult};
use common::models::query::{ColumnInfo, ConnectionStateReport, QueryRequest, QueryResult};
use query_service::{ConnectionStateSource, SearchPathManager, WaitMode};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::types::Uuid;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use validator::Validate;

use crate::state::AppState;

/// SQL 查询执行服务
pub struct QueryService {
    state: AppState,
}

impl QueryService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// 执行 SQL 查询，schema 仍在加载时等待并重试
    pub async fn execute(&self, req: QueryRequest) -> AppResult<QueryResult> {
        req.validate()?;
        let start = Instant::now();

        let mut conn = self
            .state
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::DatabaseConnection(e.to_string()))?;

        // 池中连接可能还停留在旧的 search_path 上
        self.state
            .search_path
            .ensure_session_search_path(&mut *conn)
            .await
            .map_err(|e| AppError::DatabaseConnection(e.to_string()))?;

        // 请求超时与服务重试预算取较小者
        let max_duration = self.state.config.retry.max_duration;
        let budget = req
            .timeout_secs
            .map_or(max_duration, |secs| Duration::from_secs(secs).min(max_duration));
        let cancel = self.state.shutdown.child_token();
        let rows = self
            .state
            .coordinator
            .execute_within(&cancel, &mut *conn, &req.sql, &req.args, budget)
            .await?;

        let (columns, rows) = render_rows(&rows)?;
        let execution_time_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(rows = rows.len(), execution_time_ms, "Query completed");

        Ok(QueryResult {
            row_count: rows.len(),
            columns,
            rows,
            execution_time_ms,
        })
    }

    /// 读取当前连接加载状态（不等待）
    pub async fn connection_state(&self) -> AppResult<ConnectionStateReport> {
        let mut conn = self
            .state
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::DatabaseConnection(e.to_string()))?;

        let map = self
            .state
            .state_source
            .load_snapshot(&mut *conn, WaitMode::Immediate)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;
        Ok(ConnectionStateReport::from(&map))
    }
}

/// 将结果行转换为列信息和 JSON 值
fn render_rows(rows: &[PgRow]) -> AppResult<(Vec<ColumnInfo>, Vec<Vec<Value>>)> {
    let Some(first) = rows.first() else {
        return Ok((Vec::new(), Vec::new()));
    };

    let mut columns = Vec::with_capacity(first.columns().len());
    let mut decoders = Vec::with_capacity(first.columns().len());
    for col in first.columns() {
        let type_name = col.type_info().name();
        let decoder = Decoder::for_type(type_name).ok_or_else(|| {
            AppError::QueryFailed(format!(
                "column '{}' has unsupported type {type_name}; cast it to text",
                col.name()
            ))
        })?;
        columns.push(ColumnInfo {
            name: col.name().to_string(),
            data_type: type_name.to_string(),
        });
        decoders.push(decoder);
    }

    let rows = rows
        .iter()
        .map(|row| {
            decoders
                .iter()
                .enumerate()
                .map(|(idx, decoder)| {
                    decoder.decode(row, idx).map_err(|e| {
                        AppError::QueryFailed(format!(
                            "failed to decode column '{}': {e}",
                            columns[idx].name
                        ))
                    })
                })
                .collect::<AppResult<Vec<_>>>()
        })
        .collect::<AppResult<Vec<_>>>()?;

    Ok((columns, rows))
}

/// 列值的 JSON 解码方式，按 PostgreSQL 类型名选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decoder {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    BoolArray,
    Int4Array,
    Int8Array,
    Float8Array,
    TextArray,
}

impl Decoder {
    fn for_type(type_name: &str) -> Option<Self> {
        let decoder = match type_name {
            "BOOL" => Decoder::Bool,
            "INT2" => Decoder::Int2,
            "INT4" => Decoder::Int4,
            "INT8" => Decoder::Int8,
            "FLOAT4" => Decoder::Float4,
            "FLOAT8" => Decoder::Float8,
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => Decoder::Text,
            "JSON" | "JSONB" => Decoder::Json,
            "UUID" => Decoder::Uuid,
            "DATE" => Decoder::Date,
            "TIME" => Decoder::Time,
            "TIMESTAMP" => Decoder::Timestamp,
            "TIMESTAMPTZ" => Decoder::TimestampTz,
            "BOOL[]" => Decoder::BoolArray,
            "INT4[]" => Decoder::Int4Array,
            "INT8[]" => Decoder::Int8Array,
            "FLOAT8[]" => Decoder::Float8Array,
            "TEXT[]" | "VARCHAR[]" | "NAME[]" => Decoder::TextArray,
            _ => return None,
        };
        Some(decoder)
    }

    fn decode(self, row: &PgRow, idx: usize) -> Result<Value, sqlx::Error> {
        if row.try_get_raw(idx)?.is_null() {
            return Ok(Value::Null);
        }

        Ok(match self {
            Decoder::Bool => Value::from(row.try_get::<bool, _>(idx)?),
            Decoder::Int2 => Value::from(row.try_get::<i16, _>(idx)?),
            Decoder::Int4 => Value::from(row.try_get::<i32, _>(idx)?),
            Decoder::Int8 => Value::from(row.try_get::<i64, _>(idx)?),
            Decoder::Float4 => Value::from(row.try_get::<f32, _>(idx)?),
            Decoder::Float8 => Value::from(row.try_get::<f64, _>(idx)?),
            Decoder::Text => Value::String(row.try_get::<String, _>(idx)?),
            Decoder::Json => row.try_get::<Value, _>(idx)?,
            Decoder::Uuid => Value::String(row.try_get::<Uuid, _>(idx)?.to_string()),
            Decoder::Date => Value::String(row.try_get::<NaiveDate, _>(idx)?.to_string()),
            Decoder::Time => Value::String(row.try_get::<NaiveTime, _>(idx)?.to_string()),
            Decoder::Timestamp => Value::String(
                row.try_get::<NaiveDateTime, _>(idx)?
                    .format("%Y-%m-%dT%H:%M:%S%.f")
                    .to_string(),
            ),
            Decoder::TimestampTz => {
                Value::String(row.try_get::<DateTime<Utc>, _>(idx)?.to_rfc3339())
            }
            Decoder::BoolArray => Value::from(row.try_get::<Vec<bool>, _>(idx)?),
            Decoder::Int4Array => Value::from(row.try_get::<Vec<i32>, _>(idx)?),
            Decoder::Int8Array => Value::from(row.try_get::<Vec<i64>, _>(idx)?),
            Decoder::Float8Array => Value::from(row.try_get::<Vec<f64>, _>(idx)?),
            Decoder::TextArray => Value::from(row.try_get::<Vec<String>, _>(idx)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_table() {
        let cases = [
            ("BOOL", Decoder::Bool),
            ("INT8", Decoder::Int8),
            ("FLOAT4", Decoder::Float4),
            ("VARCHAR", Decoder::Text),
            ("BPCHAR", Decoder::Text),
            ("JSONB", Decoder::Json),
            ("UUID", Decoder::Uuid),
            ("DATE", Decoder::Date),
            ("TIME", Decoder::Time),
            ("TIMESTAMP", Decoder::Timestamp),
            ("TIMESTAMPTZ", Decoder::TimestampTz),
            ("INT4[]", Decoder::Int4Array),
            ("TEXT[]", Decoder::TextArray),
        ];
        for (type_name, expected) in cases {
            assert_eq!(Decoder::for_type(type_name), Some(expected), "{type_name}");
        }
    }

    #[test]
    fn test_undecodable_types_are_rejected() {
        for type_name in ["NUMERIC", "INET", "CIDR", "INTERVAL", "BYTEA", "NUMERIC[]"] {
            assert_eq!(Decoder::for_type(type_name), None, "{type_name}");
        }
    }

    #[test]
    fn test_empty_result_has_no_columns() {
        let (columns, rows) = render_rows(&[]).unwrap();
        assert!(columns.is_empty());
        assert!(rows.is_empty());
    }
}
