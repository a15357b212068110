use crate::error::InceptionError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_$]*$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Check,
    Execute,
    Split,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Database selected before the first statement runs.
    pub db: Option<String>,
    pub backup: bool,
    pub ignore_warnings: bool,
    /// Count affected rows against the backend during audit.
    pub real_row_count: bool,
    /// Statements per transaction in execute mode. One means autocommit.
    pub tran_batch: usize,
    pub backend_timeout_ms: u64,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3306,
            user: "root".into(),
            password: String::new(),
            db: None,
            backup: false,
            ignore_warnings: false,
            real_row_count: false,
            tran_batch: 1,
            backend_timeout_ms: 30_000,
        }
    }
}

impl SourceOptions {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn batch_size(&self) -> usize {
        self.tran_batch.max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditRules {
    pub check_primary_key: bool,
    pub check_dml_where: bool,
    pub check_dml_limit: bool,
    pub check_dml_orderby: bool,
    pub check_insert_field: bool,
    pub check_column_comment: bool,
    pub check_identifier: bool,
    pub identifier_pattern: String,
    pub max_identifier_length: usize,
    pub enable_drop_table: bool,
    pub enable_drop_database: bool,
    pub enable_truncate: bool,
    pub merge_alter_table: bool,
    /// Warn above this many estimated rows; zero disables the check.
    pub max_update_rows: u64,
}

impl Default for AuditRules {
    fn default() -> Self {
        Self {
            check_primary_key: true,
            check_dml_where: true,
            check_dml_limit: true,
            check_dml_orderby: true,
            check_insert_field: false,
            check_column_comment: false,
            check_identifier: true,
            identifier_pattern: DEFAULT_IDENTIFIER_PATTERN.into(),
            max_identifier_length: 64,
            enable_drop_table: false,
            enable_drop_database: false,
            enable_truncate: true,
            merge_alter_table: true,
            max_update_rows: 0,
        }
    }
}

impl AuditRules {
    pub fn identifier_regex(&self) -> Result<Regex, InceptionError> {
        Regex::new(&self.identifier_pattern).map_err(|e| {
            InceptionError::Config(format!(
                "invalid identifier_pattern {:?}: {e}",
                self.identifier_pattern
            ))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub mode: RunMode,
    pub source: SourceOptions,
    pub rules: AuditRules,
}

impl SessionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, InceptionError> {
        toml::from_str(text).map_err(|e| InceptionError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, InceptionError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Checks the settings every run depends on. Connection settings are only
    /// checked when a connection will be opened.
    pub fn validate(&self, needs_connection: bool) -> Result<(), InceptionError> {
        self.rules.identifier_regex()?;
        if self.rules.max_identifier_length == 0 {
            return Err(InceptionError::Config(
                "max_identifier_length must be positive".into(),
            ));
        }
        if !needs_connection {
            return Ok(());
        }
        if self.source.host.trim().is_empty() {
            return Err(InceptionError::Config("host is empty".into()));
        }
        if self.source.port == 0 {
            return Err(InceptionError::Config("port must be non-zero".into()));
        }
        if self.source.user.trim().is_empty() {
            return Err(InceptionError::Config("user is empty".into()));
        }
        if self.source.backend_timeout_ms == 0 {
            return Err(InceptionError::Config(
                "backend_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = SessionConfig::from_toml_str(
            r#"
            mode = "execute"

            [source]
            host = "10.0.0.7"
            backup = true
            tran_batch = 50

            [rules]
            enable_drop_table = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mode, RunMode::Execute);
        assert_eq!(cfg.source.host, "10.0.0.7");
        assert_eq!(cfg.source.port, 3306);
        assert_eq!(cfg.source.batch_size(), 50);
        assert!(cfg.rules.enable_drop_table);
        assert!(cfg.rules.check_dml_where);
        cfg.validate(true).unwrap();
    }

    #[test]
    fn bad_identifier_pattern_is_a_config_error() {
        let mut cfg = SessionConfig::default();
        cfg.rules.identifier_pattern = "([a-z".into();
        assert!(matches!(
            cfg.validate(false),
            Err(InceptionError::Config(_))
        ));
    }

    #[test]
    fn connection_settings_checked_only_when_needed() {
        let mut cfg = SessionConfig::default();
        cfg.source.host.clear();
        cfg.validate(false).unwrap();
        assert!(cfg.validate(true).is_err());
    }

    #[test]
    fn zero_batch_means_autocommit() {
        let mut src = SourceOptions::default();
        src.tran_batch = 0;
        assert_eq!(src.batch_size(), 1);
    }
}
