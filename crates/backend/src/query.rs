//! Query engine: translates list parameters and request bodies into
//! parameterized SQL against the generated resource tables, and maps rows
//! back into their JSON representation.

use crate::access::PathIds;
use crate::error::Error;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use models::Resource;
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const HEADER_PAGINATION_LIMIT: &str = "Pagination-Limit";
pub const HEADER_PAGINATION_PAGE_COUNT: &str = "Pagination-Page-Count";
pub const HEADER_PAGINATION_CURRENT_PAGE: &str = "Pagination-Current-Page";
pub const HEADER_PAGINATION_TOTAL_COUNT: &str = "Pagination-Total-Count";
pub const HEADER_PAGINATION_NEXT_TOKEN: &str = "Pagination-Next-Token";

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 100;

/// Server timestamps carry millisecond precision; higher-resolution
/// caller input is truncated so round-trips compare equal.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts.timestamp_millis())
        .single()
        .unwrap_or(ts)
}

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// One `filter=` or `search=` term. `~` in place of `=` selects LIKE
/// matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTerm {
    pub property: String,
    pub value: String,
    pub like: bool,
}

/// Opaque list cursor: position of the last row of the previous page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.id
        );
        base64::encode_config(raw, base64::URL_SAFE_NO_PAD)
    }

    pub fn decode(token: &str) -> Result<Self, Error> {
        let invalid = || Error::validation(format!("invalid next_token {token:?}"));
        let raw = base64::decode_config(token, base64::URL_SAFE_NO_PAD).map_err(|_| invalid())?;
        let raw = String::from_utf8(raw).map_err(|_| invalid())?;
        let (ts, id) = raw.split_once('|').ok_or_else(invalid)?;
        Ok(Cursor {
            timestamp: DateTime::parse_from_rfc3339(ts)
                .map_err(|_| invalid())?
                .with_timezone(&Utc),
            id: id.parse().map_err(|_| invalid())?,
        })
    }
}

/// Parsed query parameters of a listing request.
#[derive(Debug, Clone)]
pub struct ListParams {
    pub filters: Vec<FilterTerm>,
    pub searches: Vec<FilterTerm>,
    pub order: SortOrder,
    pub limit: i64,
    pub page: Option<i64>,
    pub next_token: Option<Cursor>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub only_meta: bool,
    pub children: Vec<String>,
    pub no_intercept: bool,
    /// Raw parameters, as interceptors see them.
    pub raw: BTreeMap<String, String>,
}

impl Default for ListParams {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            searches: Vec::new(),
            order: SortOrder::Desc,
            limit: DEFAULT_LIMIT,
            page: None,
            next_token: None,
            from: None,
            until: None,
            only_meta: false,
            children: Vec::new(),
            no_intercept: false,
            raw: BTreeMap::new(),
        }
    }
}

impl ListParams {
    pub fn parse(query: Option<&str>) -> Result<Self, Error> {
        let mut params = Self::default();
        let Some(query) = query else {
            return Ok(params);
        };

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let (key, value) = (key.as_ref(), value.as_ref());
            params.raw.insert(key.to_string(), value.to_string());
            match key {
                "filter" => params.filters.push(parse_term(key, value)?),
                "search" => params.searches.push(parse_term(key, value)?),
                "order" => {
                    params.order = match value {
                        "asc" => SortOrder::Asc,
                        "desc" => SortOrder::Desc,
                        other => {
                            return Err(Error::validation(format!("invalid order {other:?}")))
                        }
                    }
                }
                "limit" => {
                    let limit: i64 = value
                        .parse()
                        .map_err(|_| Error::validation(format!("invalid limit {value:?}")))?;
                    if !(1..=MAX_LIMIT).contains(&limit) {
                        return Err(Error::validation(format!(
                            "limit must be between 1 and {MAX_LIMIT}"
                        )));
                    }
                    params.limit = limit;
                }
                "page" => {
                    let page: i64 = value
                        .parse()
                        .map_err(|_| Error::validation(format!("invalid page {value:?}")))?;
                    if page < 1 {
                        return Err(Error::validation("page must be at least 1"));
                    }
                    params.page = Some(page);
                }
                "next_token" => params.next_token = Some(Cursor::decode(value)?),
                "from" => params.from = Some(parse_timestamp(key, value)?),
                "until" => params.until = Some(parse_timestamp(key, value)?),
                "onlymeta" => params.only_meta = value == "true",
                "children" => params.children.push(value.to_string()),
                "nointercept" => params.no_intercept = value == "true",
                other => {
                    return Err(Error::validation(format!(
                        "unknown query parameter {other:?}"
                    )))
                }
            }
        }

        if params.page.is_some() && params.next_token.is_some() {
            return Err(Error::validation(
                "page and next_token are mutually exclusive",
            ));
        }
        Ok(params)
    }
}

fn parse_term(kind: &str, raw: &str) -> Result<FilterTerm, Error> {
    let eq = raw.find('=');
    let like = raw.find('~');
    let (at, is_like) = match (eq, like) {
        (Some(e), Some(l)) if l < e => (l, true),
        (Some(e), _) => (e, false),
        (None, Some(l)) => (l, true),
        (None, None) => {
            return Err(Error::validation(format!(
                "{kind} must have the form <property>=<value>"
            )))
        }
    };
    Ok(FilterTerm {
        property: raw[..at].to_string(),
        value: raw[at + 1..].to_string(),
        like: is_like,
    })
}

fn parse_timestamp(kind: &str, raw: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| Error::validation(format!("invalid {kind} timestamp {raw:?}")))
}

/// A positional bind argument of a generated statement.
#[derive(Debug, Clone)]
pub enum SqlArg {
    Uuid(Uuid),
    UuidArray(Vec<Uuid>),
    Text(String),
    NullableText(Option<String>),
    Timestamp(DateTime<Utc>),
    Int(i64),
    Revision(i32),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

pub fn bind_args<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlArg::Uuid(v) => query.bind(v),
            SqlArg::UuidArray(v) => query.bind(v),
            SqlArg::Text(v) => query.bind(v),
            SqlArg::NullableText(v) => query.bind(v),
            SqlArg::Timestamp(v) => query.bind(v),
            SqlArg::Int(v) => query.bind(v),
            SqlArg::Revision(v) => query.bind(v),
            SqlArg::Json(v) => query.bind(v),
            SqlArg::Bytes(v) => query.bind(v),
        };
    }
    query
}

/// Incrementally built statement with positional arguments.
#[derive(Debug, Default)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlArg>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn push(&mut self, fragment: &str) {
        self.sql.push_str(fragment);
    }

    /// Add a bind argument, returning its `$n` placeholder.
    pub fn bind(&mut self, arg: SqlArg) -> String {
        self.args.push(arg);
        format!("${}", self.args.len())
    }
}

/// The selectable columns of a resource, in their canonical order.
pub fn select_columns(resource: &Resource, only_meta: bool) -> Vec<String> {
    let mut columns = vec![resource.pk_column()];
    columns.extend(resource.ancestor_pk_columns());
    columns.push("timestamp".to_string());
    columns.push("revision".to_string());
    if !only_meta {
        columns.push("properties".to_string());
        for property in resource.property_columns() {
            columns.push(property.to_string());
        }
    }
    columns
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ")
}

/// WHERE clause for the resource scoped by path ids and list parameters.
/// Returns the fragments joined with AND, or an empty string.
pub fn where_clause(
    resource: &Resource,
    path_ids: &PathIds,
    params: &ListParams,
    stmt: &mut Statement,
) -> Result<String, Error> {
    let mut conditions = Vec::new();

    for column in resource.ancestor_pk_columns() {
        if let Some(Some(id)) = path_ids.get(&column) {
            let placeholder = stmt.bind(SqlArg::Uuid(*id));
            conditions.push(format!("\"{column}\" = {placeholder}"));
        }
    }

    for term in &params.filters {
        if resource.is_filterable_column(&term.property) {
            conditions.push(column_condition(resource, term, stmt)?);
        } else {
            // Fall back to a top-level key of the properties document.
            let operator = if term.like { "LIKE" } else { "=" };
            let placeholder = stmt.bind(SqlArg::Text(term.value.clone()));
            conditions.push(format!(
                "\"properties\"->>'{}' {operator} {placeholder}",
                sanitize_json_key(&term.property)?
            ));
        }
    }

    for term in &params.searches {
        if !resource.is_indexed_column(&term.property) {
            return Err(Error::validation(format!(
                "search property {:?} is not indexed",
                term.property
            )));
        }
        conditions.push(column_condition(resource, term, stmt)?);
    }

    if let Some(from) = params.from {
        let placeholder = stmt.bind(SqlArg::Timestamp(from));
        conditions.push(format!("\"timestamp\" >= {placeholder}"));
    }
    if let Some(until) = params.until {
        let placeholder = stmt.bind(SqlArg::Timestamp(until));
        conditions.push(format!("\"timestamp\" <= {placeholder}"));
    }

    if let Some(cursor) = params.next_token {
        let comparator = match params.order {
            SortOrder::Desc => "<",
            SortOrder::Asc => ">",
        };
        let ts = stmt.bind(SqlArg::Timestamp(cursor.timestamp));
        let id = stmt.bind(SqlArg::Uuid(cursor.id));
        conditions.push(format!(
            "(\"timestamp\", \"{pk}\") {comparator} ({ts}, {id})",
            pk = resource.pk_column()
        ));
    }

    Ok(conditions.join(" AND "))
}

/// Condition on a declared column. Ancestor id columns compare as UUIDs;
/// everything else is text, with LIKE when the term asked for it.
fn column_condition(
    resource: &Resource,
    term: &FilterTerm,
    stmt: &mut Statement,
) -> Result<String, Error> {
    let is_id = resource
        .ancestor_pk_columns()
        .iter()
        .any(|c| c == &term.property);
    if is_id {
        let id: Uuid = term.value.parse().map_err(|_| {
            Error::validation(format!("invalid id in filter {:?}", term.property))
        })?;
        let placeholder = stmt.bind(SqlArg::Uuid(id));
        Ok(format!("\"{}\" = {placeholder}", term.property))
    } else {
        let operator = if term.like { "LIKE" } else { "=" };
        let placeholder = stmt.bind(SqlArg::Text(term.value.clone()));
        Ok(format!("\"{}\" {operator} {placeholder}", term.property))
    }
}

/// JSON keys are interpolated into `properties->>'…'`; restrict them to
/// identifier characters rather than escaping.
fn sanitize_json_key(key: &str) -> Result<&str, Error> {
    if !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        Ok(key)
    } else {
        Err(Error::validation(format!("invalid filter property {key:?}")))
    }
}

/// SELECT for one page of a listing.
pub fn select_list(
    table: &str,
    resource: &Resource,
    path_ids: &PathIds,
    params: &ListParams,
) -> Result<Statement, Error> {
    let columns = select_columns(resource, params.only_meta);
    select_list_with(table, resource, path_ids, params, &columns)
}

/// [`select_list`] with an explicit column set (blob listings widen it).
pub fn select_list_with(
    table: &str,
    resource: &Resource,
    path_ids: &PathIds,
    params: &ListParams,
    columns: &[String],
) -> Result<Statement, Error> {
    let mut stmt = Statement::new(format!("SELECT {} FROM {table}", column_list(columns)));

    let conditions = where_clause(resource, path_ids, params, &mut stmt)?;
    if !conditions.is_empty() {
        stmt.push(&format!(" WHERE {conditions}"));
    }

    let direction = match params.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    stmt.push(&format!(
        " ORDER BY \"timestamp\" {direction}, \"{pk}\" {direction}",
        pk = resource.pk_column()
    ));

    if let Some(page) = params.page {
        let limit = stmt.bind(SqlArg::Int(params.limit));
        let offset = stmt.bind(SqlArg::Int((page - 1) * params.limit));
        stmt.push(&format!(" LIMIT {limit} OFFSET {offset}"));
    } else {
        // Cursor mode fetches one extra row to detect whether more exist.
        let limit = stmt.bind(SqlArg::Int(params.limit + 1));
        stmt.push(&format!(" LIMIT {limit}"));
    }

    Ok(stmt)
}

/// SELECT of a single row by primary key, scoped by any concrete
/// ancestor ids so that a mismatched path yields not-found.
pub fn select_item(
    table: &str,
    resource: &Resource,
    path_ids: &PathIds,
    id: Uuid,
    for_update: bool,
) -> Statement {
    let columns = select_columns(resource, false);
    let mut stmt = Statement::new(format!("SELECT {} FROM {table}", column_list(&columns)));
    let placeholder = stmt.bind(SqlArg::Uuid(id));
    stmt.push(&format!(
        " WHERE \"{pk}\" = {placeholder}",
        pk = resource.pk_column()
    ));
    for column in resource.ancestor_pk_columns() {
        if let Some(Some(ancestor)) = path_ids.get(&column) {
            let placeholder = stmt.bind(SqlArg::Uuid(*ancestor));
            stmt.push(&format!(" AND \"{column}\" = {placeholder}"));
        }
    }
    if for_update {
        stmt.push(" FOR UPDATE");
    }
    stmt
}

/// COUNT over the same scope as [`select_list`], without pagination.
pub fn select_count(
    table: &str,
    resource: &Resource,
    path_ids: &PathIds,
    params: &ListParams,
) -> Result<Statement, Error> {
    let mut stmt = Statement::new(format!("SELECT count(*) AS \"count\" FROM {table}"));
    let mut unpaged = params.clone();
    unpaged.next_token = None;
    let conditions = where_clause(resource, path_ids, &unpaged, &mut stmt)?;
    if !conditions.is_empty() {
        stmt.push(&format!(" WHERE {conditions}"));
    }
    Ok(stmt)
}

/// Map a fetched row into its JSON object form: canonical fields, then
/// declared property columns, then the residual properties document, then
/// configured defaults for anything still missing.
pub fn row_to_object(
    resource: &Resource,
    row: &PgRow,
    only_meta: bool,
) -> Result<serde_json::Map<String, serde_json::Value>, Error> {
    let mut object = serde_json::Map::new();

    let pk = resource.pk_column();
    let id: Uuid = row.try_get(pk.as_str()).map_err(anyhow::Error::from)?;
    object.insert(pk, serde_json::Value::String(id.to_string()));

    for column in resource.ancestor_pk_columns() {
        let id: Uuid = row.try_get(column.as_str()).map_err(anyhow::Error::from)?;
        object.insert(column, serde_json::Value::String(id.to_string()));
    }

    let timestamp: DateTime<Utc> = row.try_get("timestamp").map_err(anyhow::Error::from)?;
    object.insert(
        "timestamp".to_string(),
        serde_json::Value::String(format_timestamp(timestamp)),
    );
    let revision: i32 = row.try_get("revision").map_err(anyhow::Error::from)?;
    object.insert("revision".to_string(), serde_json::Value::from(revision));

    if only_meta {
        return Ok(object);
    }

    for property in resource.property_columns() {
        let value: Option<String> = row.try_get(property).map_err(anyhow::Error::from)?;
        object.insert(
            property.to_string(),
            match value {
                Some(v) => serde_json::Value::String(v),
                None => serde_json::Value::Null,
            },
        );
    }

    let properties: serde_json::Value = row.try_get("properties").map_err(anyhow::Error::from)?;
    if let serde_json::Value::Object(properties) = properties {
        for (key, value) in properties {
            object.entry(key).or_insert(value);
        }
    }

    for (key, value) in &resource.default {
        object.entry(key.clone()).or_insert_with(|| value.clone());
    }

    Ok(object)
}

/// A request body decomposed into column values for INSERT/UPDATE.
#[derive(Debug)]
pub struct WriteRecord {
    pub id: Uuid,
    /// Whether the body carried an explicit, non-zero id.
    pub id_was_given: bool,
    pub revision: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub ancestors: Vec<(String, Uuid)>,
    pub columns: Vec<(String, Option<String>)>,
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Decompose `body` for writing. Ancestor ids in the path are
/// authoritative and must match any carried by the body; wildcard path
/// segments require the body to supply the id.
pub fn decompose(
    resource: &Resource,
    body: &serde_json::Map<String, serde_json::Value>,
    path_ids: &PathIds,
) -> Result<WriteRecord, Error> {
    let pk = resource.pk_column();

    let (id, id_was_given) = match body.get(&pk) {
        None | Some(serde_json::Value::Null) => (Uuid::new_v4(), false),
        Some(serde_json::Value::String(raw)) => {
            let id: Uuid = raw
                .parse()
                .map_err(|_| Error::validation(format!("invalid {pk} {raw:?}")))?;
            if id.is_nil() {
                // The zero UUID asks the server to mint a fresh id.
                (Uuid::new_v4(), false)
            } else {
                (id, true)
            }
        }
        Some(other) => {
            return Err(Error::validation(format!("invalid {pk} {other}")));
        }
    };

    let mut ancestors = Vec::new();
    for column in resource.ancestor_pk_columns() {
        let body_id = match body.get(&column) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(raw)) => Some(raw.parse::<Uuid>().map_err(|_| {
                Error::validation(format!("invalid {column} {raw:?}"))
            })?),
            Some(other) => {
                return Err(Error::validation(format!("invalid {column} {other}")));
            }
        };
        let id = match (path_ids.get(&column), body_id) {
            (Some(Some(path_id)), Some(body_id)) if *path_id != body_id => {
                return Err(Error::validation(format!(
                    "{column} in body does not match the request path"
                )));
            }
            (Some(Some(path_id)), _) => *path_id,
            (_, Some(body_id)) => body_id,
            (_, None) => {
                return Err(Error::validation(format!("missing {column}")));
            }
        };
        ancestors.push((column, id));
    }

    let revision = match body.get("revision") {
        None | Some(serde_json::Value::Null) => 0,
        Some(value) => value
            .as_i64()
            .and_then(|r| i32::try_from(r).ok())
            .ok_or_else(|| Error::validation(format!("invalid revision {value}")))?,
    };

    let timestamp = match body.get("timestamp") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(raw)) => Some(truncate_millis(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|_| Error::validation(format!("invalid timestamp {raw:?}")))?
                .with_timezone(&Utc),
        )),
        Some(other) => {
            return Err(Error::validation(format!("invalid timestamp {other}")));
        }
    };

    let mut columns = Vec::new();
    for property in resource.property_columns() {
        let value = match body.get(property) {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(v)) => Some(v.clone()),
            Some(other) => {
                return Err(Error::validation(format!(
                    "property {property:?} must be a string, got {other}"
                )));
            }
        };
        columns.push((property.to_string(), value));
    }

    // Everything else, with defaults applied first, lands in the
    // properties document.
    let mut properties = serde_json::Map::new();
    for (key, value) in body {
        let canonical = key == &pk
            || key == "timestamp"
            || key == "revision"
            || resource.ancestor_pk_columns().iter().any(|c| c == key)
            || resource.property_columns().iter().any(|c| *c == key.as_str());
        if !canonical {
            properties.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &resource.default {
        let declared_column = resource.property_columns().iter().any(|c| *c == key.as_str());
        if !declared_column && !body.contains_key(key) {
            properties.insert(key.clone(), value.clone());
        }
    }

    Ok(WriteRecord {
        id,
        id_was_given,
        revision,
        timestamp,
        ancestors,
        columns,
        properties,
    })
}

/// INSERT for a new row, returning the canonical columns.
pub fn insert_row(table: &str, resource: &Resource, record: &WriteRecord) -> Statement {
    let mut stmt = Statement::default();
    let mut names = vec![format!("\"{}\"", resource.pk_column())];
    let mut values = vec![stmt.bind(SqlArg::Uuid(record.id))];

    for (column, id) in &record.ancestors {
        names.push(format!("\"{column}\""));
        values.push(stmt.bind(SqlArg::Uuid(*id)));
    }
    if let Some(ts) = record.timestamp {
        names.push("\"timestamp\"".to_string());
        values.push(stmt.bind(SqlArg::Timestamp(ts)));
    } else {
        names.push("\"timestamp\"".to_string());
        values.push(stmt.bind(SqlArg::Timestamp(truncate_millis(Utc::now()))));
    }
    names.push("\"properties\"".to_string());
    values.push(stmt.bind(SqlArg::Json(serde_json::Value::Object(
        record.properties.clone(),
    ))));
    for (column, value) in &record.columns {
        names.push(format!("\"{column}\""));
        values.push(stmt.bind(SqlArg::NullableText(value.clone())));
    }

    stmt.sql = format!(
        "INSERT INTO {table} ({}) VALUES ({}) RETURNING {}",
        names.join(", "),
        values.join(", "),
        column_list(&select_columns(resource, false)),
    );
    stmt
}

/// UPDATE of an existing row; bumps `revision` by exactly one.
pub fn update_row(table: &str, resource: &Resource, record: &WriteRecord) -> Statement {
    let mut stmt = Statement::default();
    let mut sets = Vec::new();

    if let Some(ts) = record.timestamp {
        let placeholder = stmt.bind(SqlArg::Timestamp(ts));
        sets.push(format!("\"timestamp\" = {placeholder}"));
    } else {
        let placeholder = stmt.bind(SqlArg::Timestamp(truncate_millis(Utc::now())));
        sets.push(format!("\"timestamp\" = {placeholder}"));
    }
    let placeholder = stmt.bind(SqlArg::Json(serde_json::Value::Object(
        record.properties.clone(),
    )));
    sets.push(format!("\"properties\" = {placeholder}"));
    for (column, value) in &record.columns {
        let placeholder = stmt.bind(SqlArg::NullableText(value.clone()));
        sets.push(format!("\"{column}\" = {placeholder}"));
    }
    sets.push("\"revision\" = \"revision\" + 1".to_string());

    let id = stmt.bind(SqlArg::Uuid(record.id));
    stmt.sql = format!(
        "UPDATE {table} SET {} WHERE \"{pk}\" = {id} RETURNING {}",
        sets.join(", "),
        column_list(&select_columns(resource, false)),
        pk = resource.pk_column(),
    );
    stmt
}

#[cfg(test)]
mod test {
    use super::*;
    use models::{BackendConfiguration, Catalog};

    fn device() -> Catalog {
        let config: BackendConfiguration = serde_json::from_value(serde_json::json!({
            "collections": [
                {"resource": "fleet"},
                {
                    "resource": "fleet/device",
                    "external_index": "serial_number",
                    "static_properties": ["label"],
                    "searchable_properties": ["model"],
                    "default": {"color": "green"}
                }
            ]
        }))
        .unwrap();
        Catalog::compile(&config).unwrap()
    }

    #[test]
    fn cursor_round_trip() {
        let cursor = Cursor {
            timestamp: truncate_millis(Utc::now()),
            id: Uuid::new_v4(),
        };
        let decoded = Cursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);

        assert!(Cursor::decode("not-a-token").is_err());
    }

    #[test]
    fn parses_repeatable_filters_and_like() {
        let params =
            ListParams::parse(Some("filter=model=m3&filter=label~x%25&order=asc&limit=10"))
                .unwrap();
        assert_eq!(params.filters.len(), 2);
        assert_eq!(
            params.filters[0],
            FilterTerm {
                property: "model".into(),
                value: "m3".into(),
                like: false
            }
        );
        assert_eq!(
            params.filters[1],
            FilterTerm {
                property: "label".into(),
                value: "x%".into(),
                like: true
            }
        );
        assert_eq!(params.order, SortOrder::Asc);
        assert_eq!(params.limit, 10);
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(ListParams::parse(Some("limit=0")).is_err());
        assert!(ListParams::parse(Some("limit=101")).is_err());
        assert!(ListParams::parse(Some("page=0")).is_err());
        assert!(ListParams::parse(Some("order=sideways")).is_err());
        assert!(ListParams::parse(Some("bogus=1")).is_err());
        assert!(ListParams::parse(Some("from=yesterday")).is_err());

        let token = Cursor {
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
        }
        .encode();
        assert!(ListParams::parse(Some(&format!("page=2&next_token={token}"))).is_err());
    }

    #[test]
    fn list_select_shape() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let fleet_id = Uuid::new_v4();
        let mut path_ids = PathIds::new();
        path_ids.insert("fleet_id".to_string(), Some(fleet_id));

        let params = ListParams::parse(Some("filter=model=m3&filter=note=hi")).unwrap();
        let stmt = select_list("\"s\".\"fleet/device\"", resource, &path_ids, &params).unwrap();

        assert!(stmt.sql.starts_with(
            "SELECT \"device_id\", \"fleet_id\", \"timestamp\", \"revision\", \"properties\", \"label\", \"model\", \"serial_number\" FROM \"s\".\"fleet/device\" WHERE"
        ));
        assert!(stmt.sql.contains("\"fleet_id\" = $1"));
        assert!(stmt.sql.contains("\"model\" = $2"));
        // Undeclared properties filter through the properties document.
        assert!(stmt.sql.contains("\"properties\"->>'note' = $3"));
        assert!(stmt
            .sql
            .ends_with("ORDER BY \"timestamp\" DESC, \"device_id\" DESC LIMIT $4"));
        assert_eq!(stmt.args.len(), 4);
    }

    #[test]
    fn search_requires_an_indexed_column() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let params = ListParams::parse(Some("search=label=x")).unwrap();
        let err =
            select_list("t", resource, &PathIds::new(), &params).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let params = ListParams::parse(Some("search=model=x")).unwrap();
        assert!(select_list("t", resource, &PathIds::new(), &params).is_ok());
    }

    #[test]
    fn wildcard_ancestor_is_unconstrained() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let mut path_ids = PathIds::new();
        path_ids.insert("fleet_id".to_string(), None);

        let stmt =
            select_list("t", resource, &path_ids, &ListParams::default()).unwrap();
        assert!(!stmt.sql.contains("WHERE"));
    }

    #[test]
    fn decompose_replaces_zero_uuid_and_applies_defaults() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let fleet_id = Uuid::new_v4();
        let mut path_ids = PathIds::new();
        path_ids.insert("fleet_id".to_string(), Some(fleet_id));

        let body = serde_json::json!({
            "device_id": "00000000-0000-0000-0000-000000000000",
            "label": "alpha",
            "note": "spare"
        });
        let record = decompose(resource, body.as_object().unwrap(), &path_ids).unwrap();

        assert!(!record.id.is_nil());
        assert!(!record.id_was_given);
        assert_eq!(record.ancestors, vec![("fleet_id".to_string(), fleet_id)]);
        assert_eq!(record.revision, 0);
        assert_eq!(record.properties.get("note"), Some(&serde_json::json!("spare")));
        // The configured default lands in properties.
        assert_eq!(
            record.properties.get("color"),
            Some(&serde_json::json!("green"))
        );
        assert!(record
            .columns
            .contains(&("label".to_string(), Some("alpha".to_string()))));
    }

    #[test]
    fn decompose_rejects_ancestor_mismatch() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let mut path_ids = PathIds::new();
        path_ids.insert("fleet_id".to_string(), Some(Uuid::new_v4()));

        let body = serde_json::json!({"fleet_id": Uuid::new_v4().to_string()});
        let err = decompose(resource, body.as_object().unwrap(), &path_ids).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[test]
    fn decompose_requires_id_for_wildcard_ancestor() {
        let catalog = device();
        let resource = catalog.resource("fleet/device").unwrap();
        let mut path_ids = PathIds::new();
        path_ids.insert("fleet_id".to_string(), None);

        let err = decompose(resource, serde_json::json!({}).as_object().unwrap(), &path_ids)
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let fleet_id = Uuid::new_v4();
        let body = serde_json::json!({"fleet_id": fleet_id.to_string()});
        let record = decompose(resource, body.as_object().unwrap(), &path_ids).unwrap();
        assert_eq!(record.ancestors, vec![("fleet_id".to_string(), fleet_id)]);
    }

    #[test]
    fn caller_timestamps_truncate_to_milliseconds() {
        let catalog = device();
        let resource = catalog.resource("fleet").unwrap();
        let body = serde_json::json!({"timestamp": "2026-03-01T10:20:30.123456789Z"});
        let record =
            decompose(resource, body.as_object().unwrap(), &PathIds::new()).unwrap();
        assert_eq!(
            format_timestamp(record.timestamp.unwrap()),
            "2026-03-01T10:20:30.123Z"
        );
    }
}
