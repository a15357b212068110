use crate::error::InceptionError;
use crate::model::{
    Finding, Record, Severity, Stage, RECORD_COLUMNS, STATUS_AUDIT_COMPLETED, STATUS_BACKED_UP,
    STATUS_BACKUP_FAILED, STATUS_EXECUTED, STATUS_EXECUTE_FAILED, STATUS_SKIPPED,
};
use crate::split::StatementUnit;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RecordEmitter {
    records: Vec<Record>,
}

impl RecordEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_split(&mut self, unit: &StatementUnit) -> usize {
        let mut record = Record::new(unit.ordinal, Stage::Split, unit.text.clone());
        if let Some(err) = &unit.parse_error {
            record.absorb(&[Finding::error(format!("SQL syntax error: {err}"))]);
        }
        record.stage_status = record.level.label().to_string();
        self.push(record)
    }

    pub fn push_checked(&mut self, unit: &StatementUnit, findings: &[Finding]) -> usize {
        let mut record = Record::new(unit.ordinal, Stage::Checked, unit.text.clone());
        record.absorb(findings);
        record.stage_status = STATUS_AUDIT_COMPLETED.to_string();
        self.push(record)
    }

    fn push(&mut self, record: Record) -> usize {
        self.records.push(record);
        self.records.len() - 1
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Record> {
        self.records.get_mut(idx)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

pub fn seconds(elapsed: Duration) -> String {
    format!("{:.3}", elapsed.as_secs_f64())
}

pub fn mark_executed(record: &mut Record, affected_rows: u64, elapsed: Duration) {
    record.stage = Stage::Executed;
    record.stage_status = STATUS_EXECUTED.to_string();
    record.affected_rows = affected_rows;
    record.execute_time = seconds(elapsed);
}

pub fn mark_backed_up(record: &mut Record, schema: &str, elapsed: Duration) {
    record.stage_status = format!("{STATUS_EXECUTED}\n{STATUS_BACKED_UP}");
    record.backup_dbname = Some(schema.to_string());
    record.backup_time = seconds(elapsed);
}

pub fn mark_failed(record: &mut Record, error: &InceptionError) {
    record.stage = Stage::Executed;
    record.stage_status = STATUS_EXECUTE_FAILED.to_string();
    record.level = Severity::Error;
    record.affected_rows = 0;
    record.opid = None;
    record.backup_dbname = None;
    record.push_message(&error.to_string());
}

pub fn mark_backup_failed(record: &mut Record, error: &InceptionError) {
    record.stage = Stage::Executed;
    record.stage_status = STATUS_BACKUP_FAILED.to_string();
    record.level = Severity::Error;
    record.affected_rows = 0;
    record.opid = None;
    record.backup_dbname = None;
    record.push_message(&error.to_string());
}

/// A batch member whose work was rolled back with its batch.
pub fn mark_rolled_back(record: &mut Record, reason: &str) {
    record.stage_status = STATUS_EXECUTE_FAILED.to_string();
    record.level = Severity::Error;
    record.affected_rows = 0;
    record.opid = None;
    record.backup_dbname = None;
    record.push_message(reason);
}

pub fn mark_skipped(record: &mut Record) {
    record.stage = Stage::Skipped;
    record.stage_status = STATUS_SKIPPED.to_string();
    record.affected_rows = 0;
}

/// A unit dropped from an aborted batch without reaching the backend.
pub fn mark_drained(record: &mut Record, reason: &str) {
    record.stage = Stage::Skipped;
    record.stage_status = STATUS_EXECUTE_FAILED.to_string();
    record.level = Severity::Error;
    record.affected_rows = 0;
    record.push_message(reason);
}

pub fn render_table(records: &[Record]) -> String {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|r| {
            r.columns()
                .into_iter()
                .map(|v| v.replace('\n', " | "))
                .collect()
        })
        .collect();
    let mut widths: Vec<usize> = RECORD_COLUMNS.iter().map(|c| c.len()).collect();
    for row in &rows {
        for (w, v) in widths.iter_mut().zip(row) {
            *w = (*w).max(v.chars().count());
        }
    }
    let line = |cells: Vec<&str>| -> String {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}"))
            .collect::<Vec<_>>()
            .join(" | ")
            .trim_end()
            .to_string()
    };
    let mut out = line(RECORD_COLUMNS.to_vec());
    out.push('\n');
    out.push_str(
        &widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &rows {
        out.push('\n');
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split;

    #[test]
    fn split_records_report_no_error_for_clean_units() {
        let mut emitter = RecordEmitter::new();
        for unit in split("select 1; selec 2") {
            emitter.push_split(&unit);
        }
        let records = emitter.into_records();
        assert_eq!(records[0].stage_status, "no error");
        assert!(records[0].error_message.is_empty());
        assert_eq!(records[1].level, Severity::Error);
        assert_eq!(records[1].stage, Stage::Split);
    }

    #[test]
    fn failure_clears_backup_fields() {
        let mut record = Record::new(1, Stage::Checked, "delete from t where id = 1");
        mark_executed(&mut record, 3, Duration::from_millis(1500));
        assert_eq!(record.execute_time, "1.500");
        mark_backed_up(&mut record, "bk", Duration::from_millis(2));
        assert_eq!(record.stage_status, "Execute Successfully\nBackup Successfully");
        mark_rolled_back(&mut record, "batch rolled back");
        assert_eq!(record.affected_rows, 0);
        assert_eq!(record.backup_dbname, None);
        assert_eq!(record.level, Severity::Error);
    }

    #[test]
    fn table_has_header_and_one_line_per_record() {
        let records = vec![
            Record::new(1, Stage::Split, "select 1"),
            Record::new(2, Stage::Split, "select\n2"),
        ];
        let text = render_table(&records);
        assert_eq!(text.lines().count(), 4);
        assert!(text.starts_with("order_id"));
    }
}
