// ABOUTME: Table descriptor: real name, external alias, accessible columns and renames
// ABOUTME: Answers column access and alias lookups for one tracked table

use std::collections::BTreeMap;

use crate::config::{CursorConfig, TableConfig};
use crate::error::TailError;

/// Static description of a tracked table, built from its configuration.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    name: String,
    alias: String,
    columns: Vec<String>,
    to_alias: BTreeMap<String, String>,
    convert: BTreeMap<String, String>,
    filter: Option<String>,
    cursor: CursorConfig,
}

impl TableDescriptor {
    pub fn from_config(config: &TableConfig) -> Result<Self, TailError> {
        config.validate()?;

        Ok(Self {
            name: config.name.clone(),
            alias: config.alias().to_string(),
            columns: config.columns.clone(),
            to_alias: config.rename.clone(),
            convert: config.convert.clone(),
            filter: config
                .filter
                .as_ref()
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty()),
            cursor: config.cursor.clone(),
        })
    }

    /// Real table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// External alias carried on records.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Configured accessible columns; empty means all.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn cursor(&self) -> &CursorConfig {
        &self.cursor
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn is_partitioned(&self) -> bool {
        self.cursor.is_partitioned()
    }

    /// Column renames, real name -> alias.
    pub fn renames(&self) -> &BTreeMap<String, String> {
        &self.to_alias
    }

    /// External name of a real column.
    pub fn alias_of<'a>(&'a self, column: &'a str) -> &'a str {
        self.to_alias.get(column).map(String::as_str).unwrap_or(column)
    }

    /// Read-time expression override of a column.
    pub fn convert_of(&self, column: &str) -> Option<&str> {
        self.convert.get(column).map(String::as_str)
    }

    pub fn converts(&self) -> &BTreeMap<String, String> {
        &self.convert
    }

    pub fn is_accessible(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    /// Fail with `AccessDenied` when a real column is outside the accessible set.
    pub fn check_column(&self, column: &str) -> Result<(), TailError> {
        if self.is_accessible(column) {
            Ok(())
        } else {
            Err(TailError::AccessDenied(format!(
                "column '{}' of table '{}' is not accessible",
                column, self.name
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TableDescriptor {
        let config: TableConfig = toml::from_str(
            r#"
            name = "device_readings"
            alias = "readings"
            columns = ["device_id", "value"]
            where = "   "
            [rename]
            value = "reading"
            [cursor]
            identity = "device_id"
            increment = "recorded_at"
            "#,
        )
        .unwrap();
        TableDescriptor::from_config(&config).unwrap()
    }

    #[test]
    fn test_alias_of_falls_back_to_real_name() {
        let d = descriptor();
        assert_eq!(d.alias_of("value"), "reading");
        assert_eq!(d.alias_of("device_id"), "device_id");
    }

    #[test]
    fn test_column_access() {
        let d = descriptor();
        assert!(d.check_column("value").is_ok());
        assert!(matches!(
            d.check_column("secret"),
            Err(TailError::AccessDenied(_))
        ));
        assert_eq!(d.filter(), None);
        assert!(d.is_partitioned());
        assert_eq!(d.alias(), "readings");
    }
}
