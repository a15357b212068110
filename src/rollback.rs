use crate::backend::{ExecResult, TableMeta};
use crate::classify::{table_text_after_on, unquote, AlterAction};
use crate::error::InceptionError;
use crate::eval::{self, ColMap};
use crate::model::{quote_ident, Cell};
use crate::schema::{IndexShape, TableShape};
use sqlparser::ast::{self, SetExpr, Statement};
use std::collections::HashSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Undo {
    pub statements: Vec<String>,
    /// Reasons the statements do not fully restore the prior state.
    pub partial: Vec<String>,
}

impl Undo {
    fn one(statement: String) -> Self {
        Self {
            statements: vec![statement],
            partial: Vec::new(),
        }
    }

    fn partial(mut self, reason: impl Into<String>) -> Self {
        self.partial.push(reason.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct DdlPreState {
    pub existed: bool,
    pub shape: Option<TableShape>,
    /// SHOW CREATE TABLE text per DROP TABLE name, `None` for absent tables.
    pub create_texts: Vec<Option<String>>,
}

fn capture_error(msg: impl Into<String>) -> InceptionError {
    InceptionError::BackupCapture(msg.into())
}

pub fn inverse_ddl(stmt: &Statement, pre: &DdlPreState) -> Result<Undo, InceptionError> {
    match stmt {
        Statement::CreateTable(create) => {
            if create.if_not_exists && pre.existed {
                return Ok(Undo::default());
            }
            Ok(Undo::one(format!("DROP TABLE {}", create.name)))
        }
        Statement::AlterTable(alter) => {
            let shape = pre
                .shape
                .as_ref()
                .ok_or_else(|| capture_error(format!("no definition for table {}", alter.name)))?;
            inverse_alter(alter, shape)
        }
        Statement::RenameTable(renames) => {
            let pairs = renames
                .iter()
                .rev()
                .map(|r| format!("{} TO {}", r.new_name, r.old_name))
                .collect::<Vec<_>>();
            if pairs.is_empty() {
                return Ok(Undo::default());
            }
            Ok(Undo::one(format!("RENAME TABLE {}", pairs.join(", "))))
        }
        Statement::CreateIndex(create) => {
            let name = match &create.name {
                Some(name) => name.to_string(),
                None => create
                    .columns
                    .first()
                    .map(|c| c.column.expr.to_string())
                    .ok_or_else(|| capture_error("index without columns"))?,
            };
            let exists = pre
                .shape
                .as_ref()
                .is_some_and(|s| s.index(&unquote(&name)).is_some());
            if create.if_not_exists && exists {
                return Ok(Undo::default());
            }
            Ok(Undo::one(format!(
                "DROP INDEX {name} ON {}",
                create.table_name
            )))
        }
        Statement::CreateDatabase {
            db_name,
            if_not_exists,
            ..
        } => {
            if *if_not_exists && pre.existed {
                return Ok(Undo::default());
            }
            Ok(Undo::one(format!("DROP DATABASE {db_name}")))
        }
        Statement::Drop {
            object_type,
            names,
            if_exists,
            ..
        } => match object_type {
            ast::ObjectType::Table => {
                let mut undo = Undo::default();
                for (name, text) in names.iter().zip(&pre.create_texts) {
                    match text {
                        Some(text) => undo.statements.push(retarget_create(text, &name.to_string())?),
                        None if *if_exists => {}
                        None => {
                            return Err(capture_error(format!("no definition for table {name}")))
                        }
                    }
                }
                Ok(undo)
            }
            ast::ObjectType::Index => {
                let name = names
                    .first()
                    .map(|n| n.to_string())
                    .ok_or_else(|| capture_error("DROP INDEX without a name"))?;
                let text = stmt.to_string();
                let table = table_text_after_on(&text)
                    .ok_or_else(|| capture_error("DROP INDEX without ON <table>"))?;
                let index = pre.shape.as_ref().and_then(|s| {
                    if unquote(&name).eq_ignore_ascii_case("PRIMARY") {
                        s.primary_key()
                    } else {
                        s.index(&unquote(&name))
                    }
                });
                match index {
                    Some(index) => Ok(Undo::one(format!(
                        "ALTER TABLE {table} ADD {}",
                        index.render()
                    ))),
                    None if *if_exists => Ok(Undo::default()),
                    None => Err(capture_error(format!("index {name} not found on {table}"))),
                }
            }
            ast::ObjectType::Database | ast::ObjectType::Schema => {
                if *if_exists && !pre.existed {
                    return Ok(Undo::default());
                }
                let name = names
                    .first()
                    .map(|n| n.to_string())
                    .ok_or_else(|| capture_error("DROP DATABASE without a name"))?;
                Ok(Undo::one(format!("CREATE DATABASE {name}"))
                    .partial("database contents are not restored"))
            }
            other => Err(capture_error(format!("no inverse for DROP {other}"))),
        },
        other => Err(capture_error(format!("no inverse for statement: {other}"))),
    }
}

/// SHOW CREATE TABLE text re-pointed at the name used in the forward statement.
fn retarget_create(create_text: &str, written: &str) -> Result<String, InceptionError> {
    let open = create_text
        .find('(')
        .ok_or_else(|| capture_error("malformed SHOW CREATE TABLE output"))?;
    Ok(format!("CREATE TABLE {written} {}", &create_text[open..]))
}

fn inverse_alter(alter: &ast::AlterTable, shape: &TableShape) -> Result<Undo, InceptionError> {
    let mut undo = Undo::default();
    let mut clauses = Vec::new();
    let mut renamed_to = None;

    for op in alter.operations.iter().rev() {
        let action = AlterAction::from_operation(op);
        let clause = match &action {
            AlterAction::AddColumn(name) => Some(format!("DROP COLUMN {name}")),
            AlterAction::DropColumn(name) => {
                let col = shape
                    .column(&unquote(name))
                    .ok_or_else(|| capture_error(format!("column {name} not found")))?;
                let pos = shape
                    .columns
                    .iter()
                    .position(|c| c.name == col.name)
                    .unwrap_or(0);
                let place = match pos.checked_sub(1).and_then(|p| shape.columns.get(p)) {
                    Some(prev) => format!(" AFTER {}", quote_ident(&prev.name)),
                    None => " FIRST".to_string(),
                };
                Some(format!("ADD COLUMN {}{place}", col.definition))
            }
            AlterAction::ModifyColumn(name) => {
                let col = shape
                    .column(&unquote(name))
                    .ok_or_else(|| capture_error(format!("column {name} not found")))?;
                Some(format!("MODIFY COLUMN {}", col.definition))
            }
            AlterAction::ChangeColumn { old, new } => {
                let col = shape
                    .column(&unquote(old))
                    .ok_or_else(|| capture_error(format!("column {old} not found")))?;
                Some(format!("CHANGE COLUMN {new} {}", col.definition))
            }
            AlterAction::RenameColumn { old, new } => {
                Some(format!("RENAME COLUMN {new} TO {old}"))
            }
            AlterAction::AddIndex(name) => {
                let name = match name {
                    Some(name) => name.clone(),
                    None => IndexShape::from_text(&op.to_string())
                        .map(|i| quote_ident(&i.name))
                        .ok_or_else(|| capture_error(format!("cannot name index in: {op}")))?,
                };
                Some(format!("DROP INDEX {name}"))
            }
            AlterAction::AddPrimaryKey => Some("DROP PRIMARY KEY".to_string()),
            AlterAction::DropIndex(name) => {
                let index = shape
                    .index(&unquote(name))
                    .ok_or_else(|| capture_error(format!("index {name} not found")))?;
                Some(format!("ADD {}", index.render()))
            }
            AlterAction::DropPrimaryKey => {
                let pk = shape
                    .primary_key()
                    .ok_or_else(|| capture_error("table has no primary key"))?;
                Some(format!("ADD {}", pk.render()))
            }
            AlterAction::RenameTable(new) => {
                renamed_to = Some(new.clone());
                None
            }
            AlterAction::ConvertCharset | AlterAction::TableOption(_) => {
                undo.partial
                    .push(format!("table option not reverted: {op}"));
                None
            }
            AlterAction::Other(text) => {
                undo.partial.push(format!("no inverse for: {text}"));
                None
            }
        };
        clauses.extend(clause);
    }

    let table = match &renamed_to {
        Some(new) => {
            clauses.push(format!("RENAME TO {}", alter.name));
            new.clone()
        }
        None => alter.name.to_string(),
    };
    if !clauses.is_empty() {
        undo.statements
            .push(format!("ALTER TABLE {table} {}", clauses.join(", ")));
    }
    Ok(undo)
}

fn column_map(columns: &[String]) -> ColMap {
    columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.to_ascii_lowercase(), i))
        .collect()
}

/// Equality as the server sees a changed row: numbers by value, the rest byte-wise.
fn same_value(a: &Cell, b: &Cell) -> bool {
    match (a, b) {
        (Cell::Null, Cell::Null) => true,
        (Cell::Null, _) | (_, Cell::Null) => false,
        _ => {
            let num = |c: &Cell| match c {
                Cell::Text(s) => s.trim().parse::<f64>().ok(),
                other => other.as_f64(),
            };
            match (num(a), num(b)) {
                (Some(x), Some(y)) if !matches!((a, b), (Cell::Text(_), Cell::Text(_))) => x == y,
                _ => a.to_string() == b.to_string(),
            }
        }
    }
}

fn predicate(columns: &[String], values: &[(usize, Cell)]) -> String {
    values
        .iter()
        .map(|(i, v)| match v {
            Cell::Null => format!("{} IS NULL", quote_ident(&columns[*i])),
            v => format!("{} = {}", quote_ident(&columns[*i]), v.to_sql_literal()),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Pre-images past this size still restore in one statement but may not fit
/// the server's packet limit.
const MAX_RESTORE_ROWS: usize = 1000;

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(",")
}

fn row_values(row: &[Cell]) -> String {
    row.iter()
        .map(Cell::to_sql_literal)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn restore_rows(table: &str, columns: &[String], rows: &[Vec<Cell>]) -> Undo {
    let cols = column_list(columns);
    Undo {
        statements: rows
            .iter()
            .map(|row| format!("INSERT INTO {table}({cols}) VALUES({})", row_values(row)))
            .collect(),
        partial: Vec::new(),
    }
}

/// A single multi-row INSERT putting back a truncated table's contents.
/// Nothing when the table was empty.
pub fn restore_table(table: &str, columns: &[String], rows: &[Vec<Cell>]) -> Undo {
    let mut undo = Undo::default();
    if rows.is_empty() {
        return undo;
    }
    let values = rows
        .iter()
        .map(|row| format!("({})", row_values(row)))
        .collect::<Vec<_>>()
        .join(",");
    undo.statements.push(format!(
        "INSERT INTO {table}({}) VALUES{values}",
        column_list(columns)
    ));
    if rows.len() > MAX_RESTORE_ROWS {
        undo.partial.push(format!(
            "{} rows restored by one statement; replay may exceed max_allowed_packet",
            rows.len()
        ));
    }
    undo
}

/// One UPDATE per row the forward UPDATE changes, restoring the assigned columns.
pub fn undo_update(
    table: &str,
    meta: &TableMeta,
    update: &ast::Update,
    columns: &[String],
    rows: &[Vec<Cell>],
) -> Result<Undo, InceptionError> {
    let cols = column_map(columns);
    let mut assignments = Vec::with_capacity(update.assignments.len());
    for a in &update.assignments {
        let name = match &a.target {
            ast::AssignmentTarget::ColumnName(name) => name.to_string(),
            ast::AssignmentTarget::Tuple(_) => {
                return Err(capture_error("tuple assignments are not supported"))
            }
        };
        let bare = unquote(name.rsplit('.').next().unwrap_or(&name));
        assignments.push((bare, &a.value));
    }
    undo_assignments(table, meta, &assignments, &cols, columns, rows)
}

/// Undo for one table of a joined UPDATE.
///
/// Expressions may read only this table's columns, spelled with one of
/// `qualifiers`; anything else counts as a server-computed value.
pub fn undo_joined_update(
    table: &str,
    meta: &TableMeta,
    assignments: &[(String, &ast::Expr)],
    qualifiers: &[String],
    columns: &[String],
    rows: &[Vec<Cell>],
) -> Result<Undo, InceptionError> {
    let mut cols = ColMap::new();
    for (i, c) in columns.iter().enumerate() {
        for q in qualifiers {
            cols.insert(
                format!("{}.{}", q.to_ascii_lowercase(), c.to_ascii_lowercase()),
                i,
            );
        }
    }
    let mut undo = undo_assignments(table, meta, assignments, &cols, columns, rows)?;
    if meta.primary_key.is_empty() {
        undo.partial
            .push("joined update of a table without a primary key".into());
    }
    Ok(undo)
}

fn undo_assignments(
    table: &str,
    meta: &TableMeta,
    assigned: &[(String, &ast::Expr)],
    cols: &ColMap,
    columns: &[String],
    rows: &[Vec<Cell>],
) -> Result<Undo, InceptionError> {
    let by_name = column_map(columns);
    let mut assignments = Vec::with_capacity(assigned.len());
    for (name, expr) in assigned {
        let idx = *by_name
            .get(&name.to_ascii_lowercase())
            .ok_or_else(|| capture_error(format!("unknown column {name}")))?;
        assignments.push((idx, *expr));
    }
    let pk: Vec<usize> = meta
        .primary_key
        .iter()
        .filter_map(|c| by_name.get(&c.to_ascii_lowercase()).copied())
        .collect();

    let mut undo = Undo::default();
    if pk.is_empty() {
        let mut seen = HashSet::new();
        if !rows.iter().all(|r| seen.insert(r.clone())) {
            undo.partial
                .push("duplicate rows without a primary key; undo may touch the wrong copy".into());
        }
    }

    let mut incomplete = false;
    for pre in rows {
        let mut post = pre.clone();
        let mut known = vec![true; pre.len()];
        for (idx, expr) in &assignments {
            match eval::eval_expr(expr, &post, cols) {
                Ok(v) => post[*idx] = v,
                Err(_) => {
                    post[*idx] = Cell::Null;
                    known[*idx] = false;
                }
            }
        }
        let changed = assignments
            .iter()
            .any(|(i, _)| !known[*i] || !same_value(&pre[*i], &post[*i]));
        if !changed {
            continue;
        }

        let mut restored: Vec<usize> = Vec::new();
        for (i, _) in &assignments {
            if !restored.contains(i) {
                restored.push(*i);
            }
        }
        let set = restored
            .iter()
            .map(|i| format!("{} = {}", quote_ident(&columns[*i]), pre[*i].to_sql_literal()))
            .collect::<Vec<_>>()
            .join(", ");

        let identity: Vec<usize> = if pk.is_empty() {
            (0..columns.len()).collect()
        } else {
            pk.clone()
        };
        let mut values = Vec::with_capacity(identity.len());
        for i in identity {
            if known[i] {
                values.push((i, post[i].clone()));
            } else {
                incomplete = true;
                values.push((i, pre[i].clone()));
            }
        }
        let limit = if pk.is_empty() { " LIMIT 1" } else { "" };
        undo.statements.push(format!(
            "UPDATE {table} SET {set} WHERE {}{limit}",
            predicate(columns, &values)
        ));
    }
    if incomplete {
        undo.partial
            .push("row identity depends on a value computed by the server".into());
    }
    Ok(undo)
}

/// One DELETE per inserted row, keyed by the inserted key or generated id.
pub fn undo_insert(
    table: &str,
    meta: &TableMeta,
    insert: &ast::Insert,
    result: &ExecResult,
) -> Result<Undo, InceptionError> {
    let (columns, rows): (Vec<String>, Vec<Vec<&ast::Expr>>) = match &insert.source {
        Some(query) => match query.body.as_ref() {
            SetExpr::Values(values) => (
                insert.columns.iter().map(|c| c.value.clone()).collect(),
                values.rows.iter().map(|r| r.iter().collect()).collect(),
            ),
            _ => return Err(capture_error("INSERT ... SELECT cannot be backed up")),
        },
        None => {
            let mut columns = Vec::new();
            let mut row = Vec::new();
            for a in &insert.assignments {
                match &a.target {
                    ast::AssignmentTarget::ColumnName(name) => {
                        columns.push(unquote(&name.to_string()));
                    }
                    ast::AssignmentTarget::Tuple(_) => {
                        return Err(capture_error("tuple assignments are not supported"))
                    }
                }
                row.push(&a.value);
            }
            (columns, vec![row])
        }
    };
    let columns = if columns.is_empty() {
        meta.columns.clone()
    } else {
        columns
    };
    let position = |name: &str| columns.iter().position(|c| c.eq_ignore_ascii_case(name));
    let ai = meta.auto_increment.as_deref();

    let mut undo = Undo::default();
    let mut generated = 0u64;
    let mut incomplete = false;
    for row in &rows {
        // Values of the row by table column, `None` when not a literal.
        let value_of = |name: &str| -> Option<Option<Cell>> {
            position(name).and_then(|i| row.get(i)).map(|e| eval::literal(e))
        };
        let ai_value = match ai.map(|ai| value_of(ai)) {
            None => None,
            // Listed with an explicit id.
            Some(Some(Some(v))) if !matches!(v, Cell::Null | Cell::Int(0)) => Some(v),
            // Listed with an expression the server evaluates.
            Some(Some(None)) => None,
            // Absent, NULL or 0: the server generated the id.
            Some(_) if result.last_insert_id == 0 => None,
            Some(_) => {
                let id = result.last_insert_id + generated;
                generated += 1;
                Some(Cell::Int(i64::try_from(id).unwrap_or(i64::MAX)))
            }
        };

        let key_columns: Vec<String> = if meta.primary_key.is_empty() {
            meta.columns
                .iter()
                .filter(|c| position(c).is_some() || ai.is_some_and(|a| a.eq_ignore_ascii_case(c)))
                .cloned()
                .collect()
        } else {
            meta.primary_key.clone()
        };
        let mut values = Vec::with_capacity(key_columns.len());
        for (n, col) in key_columns.iter().enumerate() {
            let v = if ai.is_some_and(|a| a.eq_ignore_ascii_case(col)) {
                ai_value.clone()
            } else {
                value_of(col).flatten()
            };
            if let Some(v) = v {
                values.push((n, v));
            }
        }
        if values.len() < key_columns.len() {
            incomplete = true;
        }
        // Without LIMIT 1, a DELETE over part of the key could remove rows
        // this INSERT never added.
        let keyed = !meta.primary_key.is_empty();
        if values.is_empty() || (keyed && values.len() < key_columns.len()) {
            continue;
        }
        let limit = if meta.primary_key.is_empty() { " LIMIT 1" } else { "" };
        undo.statements.push(format!(
            "DELETE FROM {table} WHERE {}{limit}",
            predicate(&key_columns, &values)
        ));
    }
    if incomplete {
        undo.partial
            .push("inserted row key is not a literal; undo may miss rows".into());
    }
    if result.affected_rows < rows.len() as u64 {
        undo.partial
            .push("fewer rows inserted than listed; undo may remove rows it did not add".into());
    }
    Ok(undo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split;

    fn stmt(sql: &str) -> Statement {
        split(sql).remove(0).statement.unwrap()
    }

    fn shape() -> TableShape {
        TableShape::parse(
            "CREATE TABLE `t` (`id` int NOT NULL, `c1` int DEFAULT NULL, `c2` varchar(10), \
             PRIMARY KEY (`id`), KEY `idx_c1` (`c1`))",
        )
        .unwrap()
    }

    fn meta() -> TableMeta {
        TableMeta {
            columns: vec!["id".into(), "c1".into(), "a".into()],
            primary_key: vec!["id".into()],
            auto_increment: None,
        }
    }

    #[test]
    fn add_column_inverse_keeps_written_name() {
        let pre = DdlPreState {
            shape: Some(shape()),
            ..Default::default()
        };
        let undo = inverse_ddl(&stmt("ALTER TABLE t ADD COLUMN c INT"), &pre).unwrap();
        assert_eq!(undo.statements, vec!["ALTER TABLE t DROP COLUMN c"]);
        assert!(undo.partial.is_empty());
    }

    #[test]
    fn alter_actions_invert_in_reverse_order() {
        let pre = DdlPreState {
            shape: Some(shape()),
            ..Default::default()
        };
        let undo = inverse_ddl(
            &stmt("alter table t drop column c2, drop index idx_c1, rename to t2"),
            &pre,
        )
        .unwrap();
        assert_eq!(
            undo.statements,
            vec![
                "ALTER TABLE t2 ADD KEY `idx_c1` (`c1`), ADD COLUMN `c2` VARCHAR(10) AFTER `c1`, RENAME TO t"
            ]
        );
    }

    #[test]
    fn if_not_exists_noop_has_no_inverse() {
        let pre = DdlPreState {
            existed: true,
            ..Default::default()
        };
        let undo = inverse_ddl(&stmt("create table if not exists t (id int)"), &pre).unwrap();
        assert!(undo.statements.is_empty());
        let undo = inverse_ddl(&stmt("create table t (id int)"), &pre).unwrap();
        assert_eq!(undo.statements, vec!["DROP TABLE t"]);
    }

    #[test]
    fn drop_table_restores_definition() {
        let pre = DdlPreState {
            create_texts: vec![Some("CREATE TABLE `t` (\n  `id` int\n)".into())],
            ..Default::default()
        };
        let undo = inverse_ddl(&stmt("drop table db1.t"), &pre).unwrap();
        assert_eq!(undo.statements, vec!["CREATE TABLE db1.t (\n  `id` int\n)"]);
    }

    #[test]
    fn update_undo_skips_unchanged_rows() {
        let Statement::Update(update) = stmt("update t1 set c1 = c1 + 1, a = 5 where a = 1") else {
            panic!("not an update");
        };
        let columns = meta().columns;
        let rows = vec![
            vec![Cell::Int(1), Cell::Int(0), Cell::Int(1)],
            vec![Cell::Int(2), Cell::Null, Cell::Int(5)],
        ];
        let undo = undo_update("`d`.`t1`", &meta(), &update, &columns, &rows).unwrap();
        assert_eq!(
            undo.statements,
            vec!["UPDATE `d`.`t1` SET `c1` = 0, `a` = 1 WHERE `id` = 1"],
            "NULL + 1 is NULL and a is already 5"
        );
    }

    #[test]
    fn insert_undo_uses_generated_ids() {
        let Statement::Insert(insert) = stmt("insert into t (v) values ('a'), ('b')") else {
            panic!("not an insert");
        };
        let meta = TableMeta {
            columns: vec!["id".into(), "v".into()],
            primary_key: vec!["id".into()],
            auto_increment: Some("id".into()),
        };
        let result = ExecResult {
            affected_rows: 2,
            last_insert_id: 7,
        };
        let undo = undo_insert("`t`", &meta, &insert, &result).unwrap();
        assert_eq!(
            undo.statements,
            vec!["DELETE FROM `t` WHERE `id` = 7", "DELETE FROM `t` WHERE `id` = 8"]
        );
        assert!(undo.partial.is_empty());
    }

    #[test]
    fn insert_without_key_matches_all_literals() {
        let Statement::Insert(insert) = stmt("insert into t values (1, 'x')") else {
            panic!("not an insert");
        };
        let meta = TableMeta {
            columns: vec!["a".into(), "b".into()],
            primary_key: Vec::new(),
            auto_increment: None,
        };
        let result = ExecResult {
            affected_rows: 1,
            last_insert_id: 0,
        };
        let undo = undo_insert("`t`", &meta, &insert, &result).unwrap();
        assert_eq!(
            undo.statements,
            vec!["DELETE FROM `t` WHERE `a` = 1 AND `b` = 'x' LIMIT 1"]
        );
    }

    #[test]
    fn deleted_rows_come_back_as_inserts() {
        let undo = restore_rows(
            "`t`",
            &["id".to_string(), "name".to_string()],
            &[vec![Cell::Int(1), Cell::Text("o'k".into())]],
        );
        assert_eq!(
            undo.statements,
            vec!["INSERT INTO `t`(`id`,`name`) VALUES(1,'o''k')"]
        );
    }

    #[test]
    fn joined_update_treats_other_tables_as_computed() {
        let Statement::Update(update) = stmt(
            "update t1 a join t2 b on a.id = b.id set a.c1 = b.c1, a.a = a.a + 1 where b.c1 > 0",
        ) else {
            panic!("not an update");
        };
        let assigned: Vec<(String, &ast::Expr)> = update
            .assignments
            .iter()
            .map(|a| {
                let ast::AssignmentTarget::ColumnName(name) = &a.target else {
                    panic!("tuple target");
                };
                let col = name.to_string().rsplit('.').next().unwrap().to_string();
                (col, &a.value)
            })
            .collect();
        let columns = meta().columns;
        let rows = vec![vec![Cell::Int(1), Cell::Int(7), Cell::Int(3)]];
        let undo = undo_joined_update(
            "`d`.`t1`",
            &meta(),
            &assigned,
            &["a".to_string(), "t1".to_string()],
            &columns,
            &rows,
        )
        .unwrap();
        assert_eq!(
            undo.statements,
            vec!["UPDATE `d`.`t1` SET `c1` = 7, `a` = 3 WHERE `id` = 1"]
        );
        assert!(undo.partial.is_empty());
    }

    #[test]
    fn composite_key_with_a_computed_part_is_left_alone() {
        let Statement::Insert(insert) =
            stmt("insert into t values (1, 1, 'a'), (2, uuid_short(), 'b')")
        else {
            panic!("not an insert");
        };
        let meta = TableMeta {
            columns: vec!["k1".into(), "k2".into(), "v".into()],
            primary_key: vec!["k1".into(), "k2".into()],
            auto_increment: None,
        };
        let result = ExecResult {
            affected_rows: 2,
            last_insert_id: 0,
        };
        let undo = undo_insert("`t`", &meta, &insert, &result).unwrap();
        // `k1 = 2` alone would match rows this INSERT never added.
        assert_eq!(
            undo.statements,
            vec!["DELETE FROM `t` WHERE `k1` = 1 AND `k2` = 1"]
        );
        assert_eq!(undo.partial.len(), 1);
    }

    #[test]
    fn truncated_table_comes_back_in_one_statement() {
        let columns = ["id".to_string(), "name".to_string()];
        let undo = restore_table(
            "`d`.`t`",
            &columns,
            &[
                vec![Cell::Int(1), Cell::Text("a".into())],
                vec![Cell::Int(2), Cell::Null],
            ],
        );
        assert_eq!(
            undo.statements,
            vec!["INSERT INTO `d`.`t`(`id`,`name`) VALUES(1,'a'),(2,NULL)"]
        );
        assert!(undo.partial.is_empty());
        assert!(restore_table("`d`.`t`", &columns, &[]).statements.is_empty());
    }
}
