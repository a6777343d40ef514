// ABOUTME: Builds the bounded SELECT statements a table cursor executes
// ABOUTME: Aliased projection with read-time conversions, cursor predicate, ordering and limit

use crate::catalog::TableSchema;
use crate::db::{ColumnInfo, Dialect, SqlValue};
use crate::error::TailError;
use crate::table::TableDescriptor;

/// Result label of the identity column in a partition-minimum query.
pub const IDENTITY_LABEL: &str = "identity";
/// Result label of the minimum increment in a partition-minimum query.
pub const MINIMUM_LABEL: &str = "minimum";

/// Pre-rendered statement parts for one table.
///
/// Rows are ordered by the increment column only. Rows sharing an increment
/// value may be split across a `LIMIT` boundary, and the strict `>` of the next
/// read then skips the unread siblings.
#[derive(Debug, Clone)]
pub struct SelectionBuilder {
    dialect: Dialect,
    table_ref: String,
    projection: String,
    increment: ColumnInfo,
    identity: Option<ColumnInfo>,
    filter: Option<String>,
}

impl SelectionBuilder {
    pub fn new(
        descriptor: &TableDescriptor,
        schema: &TableSchema,
        dialect: Dialect,
        table_ref: String,
    ) -> Result<Self, TailError> {
        let cursor = descriptor.cursor();
        let increment = schema
            .column(&cursor.increment)
            .cloned()
            .ok_or_else(|| {
                TailError::schema(descriptor.name(), "increment column missing from schema")
            })?;
        let identity = match &cursor.identity {
            Some(name) => Some(schema.column(name).cloned().ok_or_else(|| {
                TailError::schema(descriptor.name(), "identity column missing from schema")
            })?),
            None => None,
        };

        Ok(Self {
            dialect,
            table_ref,
            projection: projection(descriptor, schema, dialect),
            increment,
            identity,
            filter: descriptor.filter().map(str::to_string),
        })
    }

    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Scan of a single-cursor table: rows strictly after `after`.
    pub fn single_scan(&self, after: SqlValue, limit: usize) -> (String, Vec<SqlValue>) {
        let mut conditions = vec![format!(
            "{} > {}",
            self.dialect.cursor_expr(&self.increment),
            self.dialect.cursor_placeholder(1, &self.increment)
        )];
        conditions.extend(self.static_filter());
        (self.scan(&conditions, limit), vec![after])
    }

    /// Scan of one identity of a partitioned table.
    ///
    /// `inclusive` reads `>= after`, used for the first read from a discovered minimum.
    pub fn partition_scan(
        &self,
        identity: SqlValue,
        after: SqlValue,
        inclusive: bool,
        limit: usize,
    ) -> (String, Vec<SqlValue>) {
        let mut conditions = Vec::with_capacity(3);
        if let Some(column) = &self.identity {
            conditions.push(format!(
                "{} = {}",
                self.dialect.quote_ident(&column.name),
                self.dialect.placeholder(1, column)
            ));
        }
        conditions.push(format!(
            "{} {} {}",
            self.dialect.cursor_expr(&self.increment),
            if inclusive { ">=" } else { ">" },
            self.dialect.cursor_placeholder(2, &self.increment)
        ));
        conditions.extend(self.static_filter());
        (self.scan(&conditions, limit), vec![identity, after])
    }

    /// `(identity, MIN(increment))` per identity, restricted to `includes`
    /// when non-empty and never returning `excludes`.
    pub fn partition_minimums(
        &self,
        includes: &[SqlValue],
        excludes: &[SqlValue],
    ) -> Option<(String, Vec<SqlValue>)> {
        let identity = self.identity.as_ref()?;
        let ident = self.dialect.quote_ident(&identity.name);
        let inc = self.dialect.cursor_expr(&self.increment);

        let mut params = Vec::with_capacity(includes.len() + excludes.len());
        let mut conditions = vec![format!("{} IS NOT NULL", ident)];
        for (list, negate) in [(includes, false), (excludes, true)] {
            if list.is_empty() {
                continue;
            }
            let placeholders: Vec<String> = list
                .iter()
                .map(|value| {
                    params.push(value.clone());
                    self.dialect.placeholder(params.len(), identity)
                })
                .collect();
            conditions.push(format!(
                "{} {}IN ({})",
                ident,
                if negate { "NOT " } else { "" },
                placeholders.join(", ")
            ));
        }
        conditions.extend(self.static_filter());

        let sql = format!(
            "SELECT {ident} AS {id_label}, MIN({inc}) AS {min_label} FROM {table} WHERE {cond} GROUP BY {ident}",
            ident = ident,
            inc = inc,
            id_label = self.dialect.quote_ident(IDENTITY_LABEL),
            min_label = self.dialect.quote_ident(MINIMUM_LABEL),
            table = self.table_ref,
            cond = conditions.join(" AND "),
        );
        Some((sql, params))
    }

    fn static_filter(&self) -> Option<String> {
        self.filter.as_ref().map(|f| format!("({})", f))
    }

    fn scan(&self, conditions: &[String], limit: usize) -> String {
        format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} ASC LIMIT {}",
            self.projection,
            self.table_ref,
            conditions.join(" AND "),
            self.dialect.cursor_expr(&self.increment),
            limit
        )
    }
}

/// Accessible columns (all when unrestricted) plus cursor columns, each
/// rendered as `<expr> AS "<alias>"`.
fn projection(descriptor: &TableDescriptor, schema: &TableSchema, dialect: Dialect) -> String {
    let mut columns: Vec<&str> = if descriptor.columns().is_empty() {
        schema.columns.iter().map(|c| c.name.as_str()).collect()
    } else {
        descriptor.columns().iter().map(String::as_str).collect()
    };
    let cursor = descriptor.cursor();
    for column in std::iter::once(cursor.increment.as_str()).chain(cursor.identity.as_deref()) {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }

    columns
        .iter()
        .map(|column| {
            let expr = descriptor
                .convert_of(column)
                .map(str::to_string)
                .unwrap_or_else(|| dialect.quote_ident(column));
            format!("{} AS {}", expr, dialect.quote_ident(descriptor.alias_of(column)))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    fn schema() -> TableSchema {
        TableSchema {
            table: "device_readings".to_string(),
            columns: vec![
                ColumnInfo::new("device_id", "bigint").with_cast_type("int8"),
                ColumnInfo::new("value", "double precision").with_cast_type("float8"),
                ColumnInfo::new("recorded_at", "timestamp without time zone")
                    .with_cast_type("timestamp"),
                ColumnInfo::new("note", "text"),
            ],
        }
    }

    fn builder(src: &str, dialect: Dialect) -> SelectionBuilder {
        let config: TableConfig = toml::from_str(src).unwrap();
        let descriptor = TableDescriptor::from_config(&config).unwrap();
        SelectionBuilder::new(&descriptor, &schema(), dialect, "\"public\".\"device_readings\"".to_string())
            .unwrap()
    }

    const PARTITIONED: &str = r#"
        name = "device_readings"
        columns = ["value"]
        where = "value > 0"
        [rename]
        value = "reading"
        [convert]
        value = "ROUND(value::numeric, 2)"
        [cursor]
        identity = "device_id"
        increment = "recorded_at"
    "#;

    #[test]
    fn test_projection_includes_cursor_columns_and_aliases() {
        let b = builder(PARTITIONED, Dialect::Postgres);
        assert_eq!(
            b.projection(),
            "ROUND(value::numeric, 2) AS \"reading\", \"recorded_at\" AS \"recorded_at\", \"device_id\" AS \"device_id\""
        );
    }

    #[test]
    fn test_projection_all_columns_when_unrestricted() {
        let b = builder(
            r#"
            name = "device_readings"
            [cursor]
            increment = "recorded_at"
            "#,
            Dialect::Sqlite,
        );
        assert_eq!(
            b.projection(),
            "\"device_id\" AS \"device_id\", \"value\" AS \"value\", \"recorded_at\" AS \"recorded_at\", \"note\" AS \"note\""
        );
    }

    #[test]
    fn test_single_scan_sqlite() {
        let b = builder(
            r#"
            name = "device_readings"
            columns = ["note"]
            [cursor]
            increment = "recorded_at"
            "#,
            Dialect::Sqlite,
        );
        let (sql, params) = b.single_scan(SqlValue::Text("2024-01-01 00:00:00".into()), 2);
        let normalized = "CASE typeof(\"recorded_at\") WHEN 'integer' \
             THEN strftime('%Y-%m-%d %H:%M:%f', \"recorded_at\", 'unixepoch') \
             ELSE strftime('%Y-%m-%d %H:%M:%f', \"recorded_at\") END";
        assert_eq!(
            sql,
            format!(
                "SELECT \"note\" AS \"note\", \"recorded_at\" AS \"recorded_at\" FROM \"public\".\"device_readings\" \
                 WHERE {n} > strftime('%Y-%m-%d %H:%M:%f', ?1) ORDER BY {n} ASC LIMIT 2",
                n = normalized
            )
        );
        assert_eq!(params, vec![SqlValue::Text("2024-01-01 00:00:00".into())]);
    }

    #[test]
    fn test_partition_scan_postgres() {
        let b = builder(PARTITIONED, Dialect::Postgres);
        let (sql, params) = b.partition_scan(
            SqlValue::Integer(7),
            SqlValue::Text("2024-01-01 00:00:00".into()),
            false,
            100,
        );
        assert!(sql.contains(
            "WHERE \"device_id\" = CAST($1::text AS int8) AND \"recorded_at\" > CAST($2::text AS timestamp) AND (value > 0)"
        ));
        assert!(sql.ends_with("ORDER BY \"recorded_at\" ASC LIMIT 100"));
        assert_eq!(params.len(), 2);

        let (sql, _) = b.partition_scan(SqlValue::Integer(7), SqlValue::Integer(0), true, 1);
        assert!(sql.contains("\"recorded_at\" >= CAST($2::text AS timestamp)"));
    }

    #[test]
    fn test_partition_minimums_with_filters() {
        let b = builder(PARTITIONED, Dialect::Sqlite);
        let (sql, params) = b
            .partition_minimums(
                &[SqlValue::Integer(1), SqlValue::Integer(2)],
                &[SqlValue::Integer(3)],
            )
            .unwrap();
        assert!(sql.starts_with(
            "SELECT \"device_id\" AS \"identity\", MIN(CASE typeof(\"recorded_at\") WHEN 'integer' "
        ));
        assert!(sql.ends_with(
            "END) AS \"minimum\" \
             FROM \"public\".\"device_readings\" \
             WHERE \"device_id\" IS NOT NULL AND \"device_id\" IN (?1, ?2) AND \"device_id\" NOT IN (?3) AND (value > 0) \
             GROUP BY \"device_id\""
        ));
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_single_cursor_has_no_minimum_query() {
        let b = builder(
            r#"
            name = "device_readings"
            [cursor]
            increment = "recorded_at"
            "#,
            Dialect::Sqlite,
        );
        assert!(b.partition_minimums(&[], &[]).is_none());
    }
}
