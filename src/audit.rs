use crate::backend::qualified;
use crate::classify::{object_name_to_parts, unquote, AlterAction, StatementKind, Target};
use crate::config::AuditRules;
use crate::error::InceptionError;
use crate::model::Finding;
use crate::schema::{column_shape, TableShape};
use crate::split::StatementUnit;
use regex::Regex;
use sqlparser::ast::{AlterTableOperation, Statement};
use std::collections::{HashMap, HashSet};

/// What earlier statements of the same script changed.
#[derive(Debug, Clone, Default)]
pub struct AuditState {
    pub current_db: Option<String>,
    created_tables: HashSet<(String, String)>,
    dropped_tables: HashSet<(String, String)>,
    created_dbs: HashSet<String>,
    dropped_dbs: HashSet<String>,
    alter_counts: HashMap<(String, String), usize>,
}

impl AuditState {
    pub fn new(current_db: Option<String>) -> Self {
        Self {
            current_db,
            ..Default::default()
        }
    }

    pub fn resolve_db(&self, target: &Target) -> Option<String> {
        target.db.clone().or_else(|| self.current_db.clone())
    }
}

fn table_key(db: &str, table: &str) -> (String, String) {
    (db.to_ascii_lowercase(), unquote(table).to_ascii_lowercase())
}

pub struct RuleEvaluator {
    rules: AuditRules,
    identifier: Regex,
}

impl RuleEvaluator {
    pub fn new(rules: &AuditRules) -> Result<Self, InceptionError> {
        Ok(Self {
            identifier: rules.identifier_regex()?,
            rules: rules.clone(),
        })
    }

    pub fn audit(
        &self,
        unit: &StatementUnit,
        target: &Target,
        state: &mut AuditState,
    ) -> Vec<Finding> {
        let mut findings = Vec::new();
        let Some(stmt) = &unit.statement else {
            let msg = unit.parse_error.as_deref().unwrap_or("cannot parse statement");
            findings.push(Finding::error(format!("SQL syntax error: {msg}")));
            return findings;
        };

        match target.kind {
            StatementKind::Unsupported => {
                findings.push(Finding::error(format!(
                    "Statement is not supported: {}",
                    first_words(&unit.text)
                )));
                return findings;
            }
            StatementKind::Transaction => {
                findings.push(Finding::error(
                    "Transaction control is not allowed inside a script",
                ));
                return findings;
            }
            StatementKind::Set if unit.text.to_ascii_lowercase().contains("autocommit") => {
                findings.push(Finding::error("SET autocommit is not allowed"));
                return findings;
            }
            StatementKind::Use => {
                if let Some(db) = &target.db {
                    state.current_db = Some(db.clone());
                }
                return findings;
            }
            _ => {}
        }

        let db = state.resolve_db(target);
        if target.kind.needs_table() && db.is_none() {
            findings.push(Finding::error("No database selected"));
        }
        let db = db.unwrap_or_default();

        if self.rules.check_identifier {
            for name in new_identifiers(stmt, target) {
                self.check_identifier(&name, &mut findings);
            }
        }

        let key = table_key(&db, &target.table);
        let display = if db.is_empty() {
            unquote(&target.table)
        } else {
            format!("{db}.{}", unquote(&target.table))
        };

        match target.kind {
            StatementKind::CreateTable => self.check_create_table(stmt, &display, &mut findings),
            StatementKind::AlterTable => self.check_alter_columns(stmt, &mut findings),
            _ => {}
        }
        if target.kind == StatementKind::CreateTable && state.created_tables.contains(&key) {
            findings.push(Finding::error(format!(
                "Table '{display}' is already created in this batch"
            )));
        }

        let touches_existing = matches!(
            target.kind,
            StatementKind::AlterTable
                | StatementKind::Truncate
                | StatementKind::CreateIndex
                | StatementKind::DropIndex
                | StatementKind::RenameTable
        ) || target.kind.is_dml();
        if touches_existing && !target.table.is_empty() {
            if state.dropped_tables.contains(&key) {
                findings.push(Finding::error(format!(
                    "Table '{display}' was dropped earlier in this batch"
                )));
            } else if state.dropped_dbs.contains(&key.0) {
                findings.push(Finding::error(format!(
                    "Database '{db}' was dropped earlier in this batch"
                )));
            }
        }

        match target.kind {
            StatementKind::DropTable if !self.rules.enable_drop_table => {
                findings.push(Finding::error("DROP TABLE is disabled"));
            }
            StatementKind::DropDatabase if !self.rules.enable_drop_database => {
                findings.push(Finding::error("DROP DATABASE is disabled"));
            }
            StatementKind::Truncate if !self.rules.enable_truncate => {
                findings.push(Finding::error("TRUNCATE TABLE is disabled"));
            }
            _ => {}
        }

        self.check_dml(stmt, &mut findings);

        if target.kind == StatementKind::AlterTable && self.rules.merge_alter_table {
            let count = state.alter_counts.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                findings.push(Finding::warning(format!(
                    "Table '{display}' is altered more than once; merge the ALTER statements"
                )));
            }
        }

        advance(stmt, target, &db, state);
        findings
    }

    fn check_identifier(&self, name: &str, findings: &mut Vec<Finding>) {
        let name = unquote(name);
        if name.is_empty() {
            return;
        }
        if name.chars().count() > self.rules.max_identifier_length {
            findings.push(Finding::error(format!(
                "Identifier '{name}' is too long (max {})",
                self.rules.max_identifier_length
            )));
        } else if !self.identifier.is_match(&name) {
            findings.push(Finding::error(format!("Identifier '{name}' is invalid")));
        }
    }

    fn check_create_table(&self, stmt: &Statement, display: &str, findings: &mut Vec<Finding>) {
        let Statement::CreateTable(create) = stmt else {
            return;
        };
        // CREATE TABLE ... LIKE copies its shape from the source table.
        if create.columns.is_empty() {
            return;
        }
        if self.rules.check_primary_key {
            let shape = TableShape::from_parts(&create.columns, &create.constraints);
            if shape.primary_key().is_none() {
                findings.push(Finding::error(format!(
                    "Table '{display}' has no primary key"
                )));
            }
        }
        if self.rules.check_column_comment {
            for col in &create.columns {
                if !column_shape(col).has_comment {
                    findings.push(Finding::warning(format!(
                        "Column '{}' has no comment",
                        col.name.value
                    )));
                }
            }
        }
    }

    fn check_alter_columns(&self, stmt: &Statement, findings: &mut Vec<Finding>) {
        let Statement::AlterTable(alter) = stmt else {
            return;
        };
        if !self.rules.check_column_comment {
            return;
        }
        for op in &alter.operations {
            if let AlterTableOperation::AddColumn { column_def, .. } = op {
                if !column_shape(column_def).has_comment {
                    findings.push(Finding::warning(format!(
                        "Column '{}' has no comment",
                        column_def.name.value
                    )));
                }
            }
        }
    }

    fn check_dml(&self, stmt: &Statement, findings: &mut Vec<Finding>) {
        match stmt {
            Statement::Update(update) => {
                if self.rules.check_dml_where && update.selection.is_none() {
                    findings.push(Finding::error("UPDATE without WHERE is not allowed"));
                }
                if self.rules.check_dml_limit && update.limit.is_some() {
                    findings.push(Finding::warning("UPDATE with LIMIT is not deterministic"));
                }
            }
            Statement::Delete(delete) => {
                if self.rules.check_dml_where && delete.selection.is_none() {
                    findings.push(Finding::error("DELETE without WHERE is not allowed"));
                }
                if self.rules.check_dml_limit && delete.limit.is_some() {
                    findings.push(Finding::warning("DELETE with LIMIT is not deterministic"));
                }
                if self.rules.check_dml_orderby && !delete.order_by.is_empty() {
                    findings.push(Finding::warning("DELETE with ORDER BY"));
                }
            }
            Statement::Insert(insert) => {
                if self.rules.check_insert_field
                    && insert.columns.is_empty()
                    && insert.assignments.is_empty()
                {
                    findings.push(Finding::warning("INSERT without a column list"));
                }
            }
            _ => {}
        }
    }

    pub fn check_row_estimate(&self, rows: u64) -> Option<Finding> {
        let max = self.rules.max_update_rows;
        (max > 0 && rows > max).then(|| {
            Finding::warning(format!(
                "Statement affects about {rows} rows, more than the allowed {max}"
            ))
        })
    }
}

/// `SELECT COUNT(*)` estimating the rows a single-table UPDATE/DELETE touches.
pub fn count_query(stmt: &Statement, target: &Target, db: &str) -> Option<String> {
    if target.table.is_empty() {
        return None;
    }
    let selection = match stmt {
        Statement::Update(update) => &update.selection,
        Statement::Delete(delete) if delete.tables.is_empty() && delete.using.is_none() => {
            &delete.selection
        }
        _ => return None,
    };
    let mut sql = format!("SELECT COUNT(*) FROM {}", qualified(db, &target.table));
    if let Some(selection) = selection {
        sql.push_str(&format!(" WHERE {selection}"));
    }
    Some(sql)
}

fn first_words(text: &str) -> String {
    text.split_whitespace().take(3).collect::<Vec<_>>().join(" ")
}

fn new_identifiers(stmt: &Statement, target: &Target) -> Vec<String> {
    let mut names = Vec::new();
    match stmt {
        Statement::CreateTable(create) => {
            names.push(target.table.clone());
            names.extend(create.columns.iter().map(|c| c.name.value.clone()));
            let shape = TableShape::from_parts(&create.columns, &create.constraints);
            names.extend(shape.indexes.iter().map(|i| i.name.clone()));
        }
        Statement::CreateDatabase { .. } => names.extend(target.db.clone()),
        Statement::RenameTable(renames) => {
            names.extend(renames.iter().map(|r| object_name_to_parts(&r.new_name).1));
        }
        _ => {}
    }
    for action in &target.actions {
        match action {
            AlterAction::AddColumn(name) | AlterAction::RenameTable(name) => {
                names.push(name.clone())
            }
            AlterAction::ChangeColumn { new, .. } | AlterAction::RenameColumn { new, .. } => {
                names.push(new.clone())
            }
            AlterAction::AddIndex(Some(name)) => names.push(name.clone()),
            _ => {}
        }
    }
    names
}

fn advance(stmt: &Statement, target: &Target, db: &str, state: &mut AuditState) {
    match target.kind {
        StatementKind::CreateTable => {
            let key = table_key(db, &target.table);
            state.dropped_tables.remove(&key);
            state.created_tables.insert(key);
        }
        StatementKind::DropTable => {
            if let Statement::Drop { names, .. } = stmt {
                for name in names {
                    let (name_db, table) = object_name_to_parts(name);
                    let key = table_key(name_db.as_deref().unwrap_or(db), &table);
                    state.created_tables.remove(&key);
                    state.dropped_tables.insert(key);
                }
            }
        }
        StatementKind::RenameTable => {
            if let Statement::RenameTable(renames) = stmt {
                for rename in renames {
                    let (old_db, old) = object_name_to_parts(&rename.old_name);
                    let (new_db, new) = object_name_to_parts(&rename.new_name);
                    let old_key = table_key(old_db.as_deref().unwrap_or(db), &old);
                    let new_key = table_key(new_db.as_deref().unwrap_or(db), &new);
                    state.created_tables.remove(&old_key);
                    state.dropped_tables.insert(old_key);
                    state.dropped_tables.remove(&new_key);
                    state.created_tables.insert(new_key);
                }
            }
        }
        StatementKind::CreateDatabase => {
            if let Some(name) = &target.db {
                let name = name.to_ascii_lowercase();
                state.dropped_dbs.remove(&name);
                state.created_dbs.insert(name);
            }
        }
        StatementKind::DropDatabase => {
            if let Some(name) = &target.db {
                let name = name.to_ascii_lowercase();
                state.created_dbs.remove(&name);
                state.dropped_dbs.insert(name);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_unit;
    use crate::model::Severity;
    use crate::split::split;

    fn run(rules: AuditRules, script: &str) -> Vec<Vec<Finding>> {
        let evaluator = RuleEvaluator::new(&rules).unwrap();
        let mut state = AuditState::new(Some("test".into()));
        split(script)
            .iter()
            .map(|unit| evaluator.audit(unit, &classify_unit(unit), &mut state))
            .collect()
    }

    fn worst(findings: &[Finding]) -> Severity {
        findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info)
    }

    #[test]
    fn clean_statements_have_no_findings() {
        let out = run(
            AuditRules::default(),
            "create table t1(id int primary key, c1 int);\
             insert into t1 values(1, 2);\
             update t1 set c1 = 3 where id = 1;\
             delete from t1 where id = 1;",
        );
        assert!(out.iter().all(|f| f.is_empty()), "{out:?}");
    }

    #[test]
    fn dml_without_where_is_an_error() {
        let out = run(
            AuditRules::default(),
            "update t1 set c1 = 1; delete from t1; delete from t1 where id > 1 order by id limit 2",
        );
        assert_eq!(worst(&out[0]), Severity::Error);
        assert_eq!(worst(&out[1]), Severity::Error);
        assert_eq!(worst(&out[2]), Severity::Warning);
        assert_eq!(out[2].len(), 2);
    }

    #[test]
    fn missing_primary_key_and_comments() {
        let rules = AuditRules {
            check_column_comment: true,
            ..AuditRules::default()
        };
        let out = run(
            rules,
            "create table t2(c1 int comment 'x', c2 int);\
             alter table t1 add column c3 int comment 'y', add column c4 int",
        );
        assert!(out[0].iter().any(|f| f.message.contains("no primary key")));
        assert!(out[0].iter().any(|f| f.message.contains("'c2'")));
        assert!(!out[0].iter().any(|f| f.message.contains("'c1'")));
        assert_eq!(out[1].len(), 1);
        assert!(out[1][0].message.contains("'c4'"));
    }

    #[test]
    fn batch_state_tracks_created_and_dropped_tables() {
        let rules = AuditRules {
            enable_drop_table: true,
            ..AuditRules::default()
        };
        let out = run(
            rules,
            "create table t3(id int primary key);\
             create table t3(id int primary key);\
             drop table t1;\
             insert into t1(id) values(1);\
             alter table t3 add column c int;\
             alter table t3 add column d int;",
        );
        assert!(out[1][0].message.contains("already created"));
        assert!(out[2].is_empty());
        assert!(out[3][0].message.contains("dropped earlier"));
        assert!(out[4].is_empty());
        assert_eq!(worst(&out[5]), Severity::Warning);
    }

    #[test]
    fn protections_and_session_rules() {
        let out = run(
            AuditRules::default(),
            "drop table t1; drop database test; begin; set autocommit = 0; set names utf8mb4",
        );
        assert!(out[0][0].message.contains("DROP TABLE"));
        assert!(out[1][0].message.contains("DROP DATABASE"));
        assert_eq!(worst(&out[2]), Severity::Error);
        assert_eq!(worst(&out[3]), Severity::Error);
        assert!(out[4].is_empty());
    }

    #[test]
    fn identifiers_and_database_selection() {
        let rules = AuditRules {
            max_identifier_length: 8,
            ..AuditRules::default()
        };
        let evaluator = RuleEvaluator::new(&rules).unwrap();
        let mut state = AuditState::new(None);
        let units = split(
            "insert into t1(id) values(1);\
             use test;\
             create table `bad-name`(id int primary key);\
             create table averyverylongname(id int primary key);",
        );
        let out: Vec<_> = units
            .iter()
            .map(|u| evaluator.audit(u, &classify_unit(u), &mut state))
            .collect();
        assert_eq!(out[0][0].message, "No database selected");
        assert!(out[1].is_empty());
        assert!(out[2][0].message.contains("invalid"));
        assert!(out[3][0].message.contains("too long"));
        assert_eq!(state.current_db.as_deref(), Some("test"));
    }

    #[test]
    fn syntax_errors_and_unsupported_kinds() {
        let out = run(AuditRules::default(), "selec 1; create view v as select 1");
        assert!(out[0][0].message.starts_with("SQL syntax error"));
        assert!(out[1][0].message.contains("not supported"));
    }

    #[test]
    fn row_estimate_threshold() {
        let rules = AuditRules {
            max_update_rows: 10,
            ..AuditRules::default()
        };
        let evaluator = RuleEvaluator::new(&rules).unwrap();
        assert!(evaluator.check_row_estimate(10).is_none());
        assert!(evaluator.check_row_estimate(11).is_some());
        let unit = &split("delete from t1 where id > 3")[0];
        let target = classify_unit(unit);
        let sql = count_query(unit.statement.as_ref().unwrap(), &target, "test").unwrap();
        assert_eq!(sql, "SELECT COUNT(*) FROM `test`.`t1` WHERE id > 3");
    }
}
