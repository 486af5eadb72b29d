//! SQL rendering of the typed query model.
//!
//! `NodeFilter`, `Projection` and `NodeUpdate` are translated into
//! `QueryBuilder` fragments with bound parameters. Every value is bound;
//! only column names from `NodeField::column` are pushed as SQL text.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use nodeflow_core::repository::node_execution::StatusChange;
use nodeflow_types::error::RepositoryError;
use nodeflow_types::execution::NodeExecution;
use nodeflow_types::query::{Criterion, FieldUpdate, NodeField, NodeFilter, NodeUpdate, Projection};

// ---------------------------------------------------------------------------
// Scalar helpers
// ---------------------------------------------------------------------------

pub(super) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(super) fn parse_optional_uuid(s: Option<String>) -> Result<Option<Uuid>, RepositoryError> {
    s.as_deref().map(parse_uuid).transpose()
}

pub(super) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

pub(super) fn parse_optional_datetime(
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Fixed-width UTC timestamps, so text ordering matches time ordering.
pub(super) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize: {e}")))
}

pub(super) fn from_json<T: DeserializeOwned>(s: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse::<T>().map_err(RepositoryError::Query)
}

fn get<'r, T>(row: &'r SqliteRow, column: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(column)
        .map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// Comma-separated column list for `projection` (always including `id`).
pub(super) fn select_columns(projection: &Projection) -> String {
    projection
        .fields()
        .into_iter()
        .map(NodeField::column)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode the projected columns of a row onto a default record.
pub(super) fn decode_node(
    row: &SqliteRow,
    projection: &Projection,
) -> Result<NodeExecution, RepositoryError> {
    let mut node = NodeExecution::default();
    for field in projection.fields() {
        let column = field.column();
        match field {
            NodeField::Id => node.id = parse_uuid(&get::<String>(row, column)?)?,
            NodeField::PlanExecutionId => {
                node.plan_execution_id = parse_uuid(&get::<String>(row, column)?)?
            }
            NodeField::NodeId => node.node_id = get(row, column)?,
            NodeField::ParentId => node.parent_id = parse_optional_uuid(get(row, column)?)?,
            NodeField::PreviousId => node.previous_id = parse_optional_uuid(get(row, column)?)?,
            NodeField::NextId => node.next_id = parse_optional_uuid(get(row, column)?)?,
            NodeField::StageFqn => node.stage_fqn = get(row, column)?,
            NodeField::Identifier => node.identifier = get(row, column)?,
            NodeField::Name => node.name = get(row, column)?,
            NodeField::StepType => node.step_type = get(row, column)?,
            NodeField::StepCategory => {
                node.step_category = parse_enum(&get::<String>(row, column)?)?
            }
            NodeField::Mode => {
                node.mode = get::<Option<String>>(row, column)?
                    .as_deref()
                    .map(parse_enum)
                    .transpose()?
            }
            NodeField::Status => node.status = parse_enum(&get::<String>(row, column)?)?,
            NodeField::OldRetry => node.old_retry = get(row, column)?,
            NodeField::CreatedAt => node.created_at = parse_datetime(&get::<String>(row, column)?)?,
            NodeField::LastUpdatedAt => {
                node.last_updated_at = parse_datetime(&get::<String>(row, column)?)?
            }
            NodeField::StartTs => node.start_ts = parse_optional_datetime(get(row, column)?)?,
            NodeField::EndTs => node.end_ts = parse_optional_datetime(get(row, column)?)?,
            NodeField::TimeoutInstanceIds => {
                node.timeout_instance_ids = from_json(&get::<String>(row, column)?, column)?
            }
            NodeField::ResolvedParameters => {
                node.resolved_parameters = get::<Option<String>>(row, column)?
                    .map(|s| from_json(&s, column))
                    .transpose()?
            }
            NodeField::ExecutableResponses => {
                node.executable_responses = from_json(&get::<String>(row, column)?, column)?
            }
            NodeField::Outcome => {
                node.outcome = get::<Option<String>>(row, column)?
                    .map(|s| from_json(&s, column))
                    .transpose()?
            }
            NodeField::FailureInfo => {
                node.failure_info = get::<Option<String>>(row, column)?
                    .map(|s| from_json(&s, column))
                    .transpose()?
            }
            NodeField::InterruptHistories => {
                node.interrupt_histories = from_json(&get::<String>(row, column)?, column)?
            }
            NodeField::Ambiance => node.ambiance = from_json(&get::<String>(row, column)?, column)?,
            NodeField::Version => node.version = get(row, column)?,
        }
    }
    Ok(node)
}

// ---------------------------------------------------------------------------
// Filter
// ---------------------------------------------------------------------------

/// Push `filter` as one parenthesized boolean expression.
pub(super) fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &NodeFilter) {
    qb.push("(1 = 1");
    for criterion in &filter.criteria {
        qb.push(" AND ");
        push_criterion(qb, criterion);
    }
    if !filter.any_of.is_empty() {
        qb.push(" AND (");
        for (i, alternative) in filter.any_of.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_filter(qb, alternative);
        }
        qb.push(")");
    }
    qb.push(")");
}

fn push_criterion(qb: &mut QueryBuilder<'_, Sqlite>, criterion: &Criterion) {
    match criterion {
        Criterion::IdIn(ids) => push_in(qb, "id", ids.iter().map(Uuid::to_string), false),
        Criterion::PlanExecutionId(id) => push_eq(qb, "plan_execution_id", id.to_string()),
        Criterion::ParentId(id) => push_eq(qb, "parent_id", id.to_string()),
        Criterion::ParentIdIn(ids) => {
            push_in(qb, "parent_id", ids.iter().map(Uuid::to_string), false)
        }
        Criterion::PreviousId(id) => push_eq(qb, "previous_id", id.to_string()),
        Criterion::NodeIdIn(ids) => push_in(qb, "node_id", ids.iter().cloned(), false),
        Criterion::StatusIn(statuses) => {
            push_in(qb, "status", statuses.iter().map(|s| s.as_str().to_string()), false)
        }
        Criterion::StatusNotIn(statuses) => {
            push_in(qb, "status", statuses.iter().map(|s| s.as_str().to_string()), true)
        }
        Criterion::CategoryIn(categories) => push_in(
            qb,
            "step_category",
            categories.iter().map(|c| c.as_str().to_string()),
            false,
        ),
        Criterion::ModeIn(modes) => {
            push_in(qb, "mode", modes.iter().map(|m| m.as_str().to_string()), false)
        }
        Criterion::OldRetry(flag) => {
            qb.push("old_retry = ");
            qb.push_bind(*flag);
        }
        Criterion::StageFqnIn(fqns) => push_in(qb, "stage_fqn", fqns.iter().cloned(), false),
        Criterion::IdentifierIn(identifiers) => {
            push_in(qb, "identifier", identifiers.iter().cloned(), false)
        }
    }
}

fn push_eq(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, value: String) {
    qb.push(column);
    qb.push(" = ");
    qb.push_bind(value);
}

/// `column [NOT] IN (..)`. An empty set matches nothing (or everything when
/// negated), the same as the in-memory `contains` check.
fn push_in(
    qb: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    values: impl Iterator<Item = String>,
    negate: bool,
) {
    let values: Vec<String> = values.collect();
    if values.is_empty() {
        qb.push(if negate { "1 = 1" } else { "0 = 1" });
        return;
    }
    qb.push(column);
    qb.push(if negate { " NOT IN (" } else { " IN (" });
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

/// Push an id list as `IN (..)`.
pub(super) fn push_ids(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[Uuid]) {
    push_in(qb, "id", ids.iter().map(Uuid::to_string), false);
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// Push ` SET last_updated_at = ?` followed by one assignment per op.
///
/// Plain assignments are pushed in op order; SQLite keeps the rightmost
/// assignment of a column, matching last-op-wins. Appends to the same array
/// nest `json_insert` calls so binds stay in op order.
pub(super) fn push_set_clause(
    qb: &mut QueryBuilder<'_, Sqlite>,
    update: &NodeUpdate,
    now: &DateTime<Utc>,
) -> Result<(), RepositoryError> {
    qb.push(" SET last_updated_at = ");
    qb.push_bind(format_datetime(now));

    let mut responses = Vec::new();
    let mut interrupts = Vec::new();
    for op in &update.ops {
        match op {
            FieldUpdate::Mode(mode) => assign(qb, "mode", mode.as_str().to_string()),
            FieldUpdate::StartTs(ts) => assign(qb, "start_ts", format_datetime(ts)),
            FieldUpdate::NextId(id) => assign(qb, "next_id", id.to_string()),
            FieldUpdate::PreviousId(id) => assign(qb, "previous_id", id.to_string()),
            FieldUpdate::OldRetry(flag) => {
                qb.push(", old_retry = ");
                qb.push_bind(*flag);
            }
            FieldUpdate::TimeoutInstanceIds(ids) => {
                assign(qb, "timeout_instance_ids", to_json(ids)?)
            }
            FieldUpdate::ResolvedParameters(value) => {
                assign(qb, "resolved_parameters", to_json(value)?)
            }
            FieldUpdate::Outcome(value) => assign(qb, "outcome", to_json(value)?),
            FieldUpdate::FailureInfo(info) => assign(qb, "failure_info", to_json(info)?),
            FieldUpdate::AddExecutableResponse(response) => responses.push(to_json(response)?),
            FieldUpdate::AddInterruptHistory(history) => interrupts.push(to_json(history)?),
        }
    }
    push_append(qb, "executable_responses", responses);
    push_append(qb, "interrupt_histories", interrupts);
    Ok(())
}

/// `push_set_clause` plus the status write and its side effects.
pub(super) fn push_status_change(
    qb: &mut QueryBuilder<'_, Sqlite>,
    change: &StatusChange,
) -> Result<(), RepositoryError> {
    push_set_clause(qb, &change.update, &change.now)?;
    assign(qb, "status", change.target.as_str().to_string());
    if change.sets_end_ts() {
        assign(qb, "end_ts", format_datetime(&change.now));
    }
    if change.clears_timeouts() {
        qb.push(", timeout_instance_ids = '[]'");
    }
    qb.push(", version = version + 1");
    Ok(())
}

fn assign(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, value: String) {
    qb.push(", ");
    qb.push(column);
    qb.push(" = ");
    qb.push_bind(value);
}

fn push_append(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, items: Vec<String>) {
    if items.is_empty() {
        return;
    }
    qb.push(", ");
    qb.push(column);
    qb.push(" = ");
    for _ in &items {
        qb.push("json_insert(");
    }
    qb.push("COALESCE(");
    qb.push(column);
    qb.push(", '[]')");
    for item in items {
        qb.push(", '$[#]', json(");
        qb.push_bind(item);
        qb.push("))");
    }
}
