use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SqlType {
    Int,
    Float,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: SqlType,
    pub nullable: bool,
    /// Rendered column definition as it appears in SHOW CREATE TABLE.
    pub definition: String,
    /// SQL type name reported by SHOW COLUMNS.
    pub type_name: String,
    #[serde(default)]
    pub default: Option<Cell>,
    #[serde(default)]
    pub auto_increment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub definition: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDef {
    pub db: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Primary key columns, empty when the table has none.
    #[serde(default)]
    pub primary_key: Vec<String>,
}

impl TableDef {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn is_primary(&self, column: &str) -> bool {
        self.primary_key
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn auto_increment_column(&self) -> Option<usize> {
        self.columns.iter().position(|c| c.auto_increment)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Cell::Null, Cell::Null) => true,
            (Cell::Int(a), Cell::Int(b)) => a == b,
            (Cell::Float(a), Cell::Float(b)) => a.to_bits() == b.to_bits(),
            (Cell::Text(a), Cell::Text(b)) => a == b,
            (Cell::Bytes(a), Cell::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Cell {}

impl std::hash::Hash for Cell {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Cell::Null => 0.hash(state),
            Cell::Int(i) => {
                1.hash(state);
                i.hash(state);
            }
            Cell::Float(f) => {
                2.hash(state);
                f.to_be_bytes().hash(state);
            }
            Cell::Text(s) => {
                3.hash(state);
                s.hash(state);
            }
            Cell::Bytes(b) => {
                4.hash(state);
                b.hash(state);
            }
        }
    }
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cell::Int(i) => Some(*i),
            Cell::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Cell::Float(f) => Some(*f),
            Cell::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Renders the value as a MySQL literal that parses back to the same value.
    pub fn to_sql_literal(&self) -> String {
        match self {
            Cell::Null => "NULL".to_string(),
            Cell::Int(i) => i.to_string(),
            Cell::Float(f) => {
                if f.is_finite() {
                    format!("{f:?}")
                } else {
                    "NULL".to_string()
                }
            }
            Cell::Text(s) => format!("'{}'", escape_sql_string(s)),
            Cell::Bytes(b) => {
                if b.is_empty() {
                    "''".to_string()
                } else {
                    let hex: String = b.iter().map(|byte| format!("{byte:02X}")).collect();
                    format!("X'{hex}'")
                }
            }
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "NULL"),
            Cell::Int(i) => write!(f, "{i}"),
            Cell::Float(v) => write!(f, "{v}"),
            Cell::Text(s) => write!(f, "{s}"),
            Cell::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
        }
    }
}

pub fn escape_sql_string(input: &str) -> String {
    input.replace('\\', "\\\\").replace('\'', "''")
}

pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Cell>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn level(self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Info => "no error",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub message: String,
}

impl Finding {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Operation id: orders forward statements and joins them to their rollback rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Opid {
    pub timestamp: i64,
    // Tells apart runs that start in the same second.
    pub run: u32,
    pub sequence: u32,
    // Not part of the text form; stored in its own column.
    pub sentinel: bool,
}

impl Opid {
    pub fn new(timestamp: i64, run: u32, sequence: u32) -> Self {
        Self {
            timestamp,
            run,
            sequence,
            sentinel: false,
        }
    }

    pub fn sentinel(timestamp: i64, run: u32, sequence: u32) -> Self {
        Self {
            timestamp,
            run,
            sequence,
            sentinel: true,
        }
    }
}

impl PartialOrd for Opid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Opid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.timestamp, self.run, self.sequence, self.sentinel).cmp(&(
            other.timestamp,
            other.run,
            other.sequence,
            other.sentinel,
        ))
    }
}

impl fmt::Display for Opid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:08x}_{:08}", self.timestamp, self.run, self.sequence)
    }
}

impl FromStr for Opid {
    type Err = crate::error::InceptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || crate::error::InceptionError::Invalid(format!("malformed opid: {s}"));
        let mut parts = s.trim().splitn(3, '_');
        let (Some(ts), Some(run), Some(seq)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(invalid());
        };
        let timestamp = ts.parse::<i64>().map_err(|_| invalid())?;
        let run = u32::from_str_radix(run, 16).map_err(|_| invalid())?;
        let sequence = seq.parse::<u32>().map_err(|_| invalid())?;
        Ok(Opid::new(timestamp, run, sequence))
    }
}

/// Seeded at random once per process, then incremented per run.
fn next_run_id() -> u32 {
    static RUN: OnceLock<AtomicU32> = OnceLock::new();
    RUN.get_or_init(|| AtomicU32::new(OsRng.next_u32()))
        .fetch_add(1, Ordering::Relaxed)
}

/// Hands out opids for one run: fixed timestamp and run id, increasing sequence.
#[derive(Debug)]
pub struct OpidGenerator {
    timestamp: i64,
    run: u32,
    next: u32,
}

impl OpidGenerator {
    pub fn new(timestamp: i64, run: u32) -> Self {
        Self {
            timestamp,
            run,
            next: 1,
        }
    }

    pub fn starting_now() -> Self {
        Self::new(chrono::Utc::now().timestamp(), next_run_id())
    }

    pub fn next_opid(&mut self) -> Opid {
        let opid = Opid::new(self.timestamp, self.run, self.next);
        self.next = self.next.saturating_add(1);
        opid
    }

    pub fn next_sentinel(&mut self) -> Opid {
        let opid = Opid::sentinel(self.timestamp, self.run, self.next);
        self.next = self.next.saturating_add(1);
        opid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Split,
    Checked,
    Executed,
    Skipped,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Split => "SPLIT",
            Stage::Checked => "CHECKED",
            Stage::Executed => "EXECUTED",
            Stage::Skipped => "SKIPPED",
        }
    }
}

pub const STATUS_AUDIT_COMPLETED: &str = "Audit Completed";
pub const STATUS_EXECUTED: &str = "Execute Successfully";
pub const STATUS_BACKED_UP: &str = "Backup Successfully";
pub const STATUS_EXECUTE_FAILED: &str = "Execute failed";
pub const STATUS_BACKUP_FAILED: &str = "Backup failed";
pub const STATUS_SKIPPED: &str = "Skipped";

pub const RECORD_COLUMNS: [&str; 11] = [
    "order_id",
    "error_level",
    "stage_status",
    "error_message",
    "affected_rows",
    "sequence",
    "backup_dbname",
    "sql",
    "stage",
    "execute_time",
    "backup_time",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub order_id: usize,
    pub stage: Stage,
    pub level: Severity,
    pub stage_status: String,
    pub error_message: String,
    pub sql: String,
    pub affected_rows: u64,
    pub opid: Option<Opid>,
    pub backup_dbname: Option<String>,
    pub execute_time: String,
    pub backup_time: String,
}

impl Record {
    pub fn new(order_id: usize, stage: Stage, sql: impl Into<String>) -> Self {
        Self {
            order_id,
            stage,
            level: Severity::Info,
            stage_status: String::new(),
            error_message: String::new(),
            sql: sql.into(),
            affected_rows: 0,
            opid: None,
            backup_dbname: None,
            execute_time: "0".to_string(),
            backup_time: "0".to_string(),
        }
    }

    /// Folds findings into level and message. Findings only ever raise the level.
    pub fn absorb(&mut self, findings: &[Finding]) {
        for finding in findings {
            self.level = self.level.max(finding.severity);
            self.push_message(&finding.message);
        }
    }

    pub fn push_message(&mut self, message: &str) {
        if message.is_empty() {
            return;
        }
        if !self.error_message.is_empty() {
            self.error_message.push('\n');
        }
        self.error_message.push_str(message);
    }

    pub fn columns(&self) -> Vec<String> {
        vec![
            self.order_id.to_string(),
            self.level.level().to_string(),
            self.stage_status.clone(),
            self.error_message.clone(),
            self.affected_rows.to_string(),
            self.opid.map(|o| o.to_string()).unwrap_or_default(),
            self.backup_dbname.clone().unwrap_or_default(),
            self.sql.clone(),
            self.stage.as_str().to_string(),
            self.execute_time.clone(),
            self.backup_time.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opids_order_by_sequence_within_a_run() {
        let mut gen = OpidGenerator::new(1_700_000_000, 0xab);
        let a = gen.next_opid();
        let s = gen.next_sentinel();
        let b = gen.next_opid();
        assert!(a < s && s < b);
        assert!(s.sentinel);
        assert_eq!(a.to_string(), "1700000000_000000ab_00000001");
        assert_eq!("1700000000_000000ab_00000003".parse::<Opid>().unwrap(), b);
        assert!("1700000000_00000003".parse::<Opid>().is_err());
    }

    #[test]
    fn runs_in_the_same_second_get_distinct_opids() {
        let mut first = OpidGenerator::starting_now();
        let mut second = OpidGenerator::starting_now();
        let a = first.next_opid();
        let b = second.next_opid();
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string().parse::<Opid>().unwrap(), a);
    }

    #[test]
    fn sentinel_flag_is_not_part_of_text_form() {
        let real = Opid::new(5, 1, 7);
        let sentinel = Opid::sentinel(5, 1, 7);
        assert_eq!(real.to_string(), sentinel.to_string());
        assert_ne!(real, sentinel);
    }

    #[test]
    fn literals_escape_quotes_and_backslashes() {
        assert_eq!(Cell::Text("it's".into()).to_sql_literal(), "'it''s'");
        assert_eq!(Cell::Text("a\\b".into()).to_sql_literal(), "'a\\\\b'");
        assert_eq!(Cell::Null.to_sql_literal(), "NULL");
        assert_eq!(Cell::Float(1.0).to_sql_literal(), "1.0");
        assert_eq!(Cell::Bytes(vec![0xab, 0x01]).to_sql_literal(), "X'AB01'");
    }

    #[test]
    fn findings_only_raise_record_level() {
        let mut rec = Record::new(1, Stage::Checked, "select 1");
        rec.absorb(&[Finding::error("boom"), Finding::warning("meh")]);
        assert_eq!(rec.level, Severity::Error);
        assert_eq!(rec.error_message, "boom\nmeh");
        assert_eq!(rec.columns().len(), RECORD_COLUMNS.len());
    }
}
