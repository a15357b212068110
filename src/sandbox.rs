use crate::backend::{Backend, Connector, ExecResult, RowSet};
use crate::classify::{
    classify, get_ident_name, name_token, object_name_to_parts, parse_name_text, unquote, words,
    AlterAction, StatementKind,
};
use crate::config::SourceOptions;
use crate::error::InceptionError;
use crate::eval::{self, ColMap};
use crate::model::{quote_ident, Cell, ColumnDef, IndexDef, Row, SqlType, TableDef};
use crate::schema::{column_shape, parse_column_def, IndexKind, IndexShape, TableShape};
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlparser::ast::{self, SetExpr, Statement, TableFactor};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
enum Fault {
    Fail,
    LoseConnection,
    /// The statement takes effect, the reply comes late.
    Delay(Duration),
}

type Faults = Arc<Mutex<Vec<(String, Fault)>>>;

/// Hands out sandbox connections that share one store.
#[derive(Clone)]
pub struct SandboxConnector {
    store: Store,
    faults: Faults,
    next_conn: Arc<AtomicU32>,
}

impl SandboxConnector {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            faults: Arc::new(Mutex::new(Vec::new())),
            next_conn: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn temporary() -> Result<Self, InceptionError> {
        Ok(Self::new(Store::temporary()?))
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Makes every later statement whose text contains `pattern`
    /// (case-insensitive) fail with a backend error.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.add_fault(pattern.into(), Fault::Fail);
    }

    /// Drops the connection when a matching statement arrives. Every later
    /// call on that connection fails too and its open transaction is lost.
    pub fn lose_connection_on(&self, pattern: impl Into<String>) {
        self.add_fault(pattern.into(), Fault::LoseConnection);
    }

    /// Applies a matching statement, then holds the reply back for `delay`.
    pub fn delay_on(&self, pattern: impl Into<String>, delay: Duration) {
        self.add_fault(pattern.into(), Fault::Delay(delay));
    }

    fn add_fault(&self, pattern: String, fault: Fault) {
        self.faults.lock().push((pattern.to_lowercase(), fault));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }
}

#[async_trait]
impl Connector for SandboxConnector {
    async fn connect(&self, source: &SourceOptions) -> Result<Box<dyn Backend>, InceptionError> {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(conn_id, "sandbox connection opened");
        Ok(Box::new(SandboxBackend {
            store: self.store.clone(),
            faults: Arc::clone(&self.faults),
            lost: false,
            conn_id,
            current_db: source.db.clone().filter(|db| !db.is_empty()),
            txn: Txn::default(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct RowKey {
    db: String,
    table: String,
    row_id: i64,
}

// Row writes buffered until COMMIT; catalog changes apply at once.
#[derive(Debug, Default)]
struct Txn {
    active: bool,
    pending: BTreeMap<RowKey, Option<Row>>,
}

pub struct SandboxBackend {
    store: Store,
    faults: Faults,
    lost: bool,
    conn_id: u32,
    current_db: Option<String>,
    txn: Txn,
}

enum Output {
    Done(ExecResult),
    Rows(RowSet),
}

fn done(affected_rows: u64) -> Output {
    Output::Done(ExecResult {
        affected_rows,
        last_insert_id: 0,
    })
}

struct Bound {
    db: String,
    table: String,
    def: TableDef,
    /// Alias, else table name.
    name: String,
    offset: usize,
}

/// Rows of a FROM clause: the source row id per bound table (`None` on the
/// NULL side of an outer join) and the concatenated values.
struct Joined {
    tables: Vec<Bound>,
    cols: ColMap,
    ambiguous: HashSet<String>,
    rows: Vec<(Vec<Option<i64>>, Vec<Cell>)>,
}

impl Joined {
    fn add_columns(&mut self, bound: &Bound) {
        for (i, col) in bound.def.columns.iter().enumerate() {
            let name = col.name.to_ascii_lowercase();
            let pos = bound.offset + i;
            self.cols
                .insert(format!("{}.{}", bound.name.to_ascii_lowercase(), name), pos);
            self.cols
                .insert(format!("{}.{}", bound.table.to_ascii_lowercase(), name), pos);
            if self.ambiguous.contains(&name) {
                continue;
            }
            if self.cols.remove(&name).is_some() {
                self.ambiguous.insert(name);
            } else {
                self.cols.insert(name, pos);
            }
        }
    }

    fn bound_named(&self, name: &str) -> Result<usize, InceptionError> {
        self.tables
            .iter()
            .position(|b| b.name.eq_ignore_ascii_case(name))
            .or_else(|| {
                self.tables
                    .iter()
                    .position(|b| b.table.eq_ignore_ascii_case(name))
            })
            .ok_or_else(|| InceptionError::Invalid(format!("Unknown table '{name}'")))
    }

    fn owner_of(&self, qualifier: Option<&str>, col: &str) -> Result<usize, InceptionError> {
        if let Some(q) = qualifier {
            return self.bound_named(q);
        }
        let owners: Vec<usize> = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, b)| b.def.column_index(col).is_some())
            .map(|(i, _)| i)
            .collect();
        match owners.as_slice() {
            [one] => Ok(*one),
            [] => Err(InceptionError::Invalid(format!(
                "Unknown column '{col}' in 'field list'"
            ))),
            _ => Err(InceptionError::Invalid(format!(
                "Column '{col}' in field list is ambiguous"
            ))),
        }
    }
}

fn server_error(err: InceptionError) -> InceptionError {
    match err {
        InceptionError::Parse(m) => {
            InceptionError::Backend(format!("You have an error in your SQL syntax: {m}"))
        }
        InceptionError::NotFound(m) | InceptionError::Invalid(m) | InceptionError::NotSupported(m) => {
            InceptionError::Backend(m)
        }
        other => other,
    }
}

#[async_trait]
impl Backend for SandboxBackend {
    async fn execute(&mut self, sql: &str) -> Result<ExecResult, InceptionError> {
        match self.call(sql).await? {
            Output::Done(res) => Ok(res),
            Output::Rows(_) => Ok(ExecResult::default()),
        }
    }

    async fn query(&mut self, sql: &str) -> Result<RowSet, InceptionError> {
        match self.call(sql).await? {
            Output::Rows(rs) => Ok(rs),
            Output::Done(_) => Ok(RowSet::default()),
        }
    }

    async fn close(&mut self) -> Result<(), InceptionError> {
        self.discard_pending();
        debug!(conn_id = self.conn_id, "sandbox connection closed");
        Ok(())
    }
}

impl SandboxBackend {
    async fn call(&mut self, sql: &str) -> Result<Output, InceptionError> {
        if self.lost {
            return Err(InceptionError::ConnectionLost(format!(
                "sandbox connection {} is gone",
                self.conn_id
            )));
        }
        let fault = self.fault_for(sql);
        match fault {
            Some(Fault::Fail) => {
                return Err(InceptionError::Backend(format!(
                    "injected failure for statement: {sql}"
                )))
            }
            Some(Fault::LoseConnection) => {
                self.lost = true;
                self.discard_pending();
                return Err(InceptionError::ConnectionLost(format!(
                    "sandbox connection {} dropped",
                    self.conn_id
                )));
            }
            _ => {}
        }
        let out = self.run(sql).map_err(server_error)?;
        if let Some(Fault::Delay(delay)) = fault {
            tokio::time::sleep(delay).await;
        }
        Ok(out)
    }

    fn run(&mut self, sql: &str) -> Result<Output, InceptionError> {
        let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql)
            .map_err(|e| InceptionError::Parse(e.to_string()))?;
        if stmts.len() > 1 {
            return Err(InceptionError::NotSupported(
                "multiple statements in one call".into(),
            ));
        }
        let Some(stmt) = stmts.pop() else {
            return Ok(done(0));
        };
        debug!(conn_id = self.conn_id, sql, "sandbox statement");

        match &stmt {
            Statement::StartTransaction { .. } => {
                // MySQL commits an open transaction implicitly.
                self.commit_pending()?;
                self.txn.active = true;
                Ok(done(0))
            }
            Statement::Commit { .. } => {
                self.commit_pending()?;
                Ok(done(0))
            }
            Statement::Rollback { .. } => {
                self.discard_pending();
                Ok(done(0))
            }
            Statement::Set(_) => Ok(done(0)),
            Statement::Use(_) => self.use_database(&stmt),
            Statement::Insert(insert) => self.insert(insert),
            Statement::Update(update) => self.update(update),
            Statement::Delete(delete) => self.delete(delete),
            Statement::Query(query) => self.select(query).map(Output::Rows),
            Statement::ShowColumns { show_options, .. } => self.show_columns(show_options),
            Statement::ShowCreate { obj_type, obj_name } => {
                if *obj_type != ast::ShowCreateObject::Table {
                    return Err(InceptionError::NotSupported(
                        "Only SHOW CREATE TABLE is supported".into(),
                    ));
                }
                self.show_create_table(obj_name)
            }
            Statement::ShowDatabases { show_options, .. } => self.show_databases(show_options),
            _ => {
                // DDL commits implicitly.
                self.commit_pending()?;
                self.ddl(&stmt)
            }
        }
    }

    fn fault_for(&self, sql: &str) -> Option<Fault> {
        let lowered = sql.to_lowercase();
        self.faults
            .lock()
            .iter()
            .find(|(pattern, _)| lowered.contains(pattern.as_str()))
            .map(|(_, fault)| *fault)
    }

    fn commit_pending(&mut self) -> Result<(), InceptionError> {
        let pending = std::mem::take(&mut self.txn.pending);
        self.txn.active = false;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(conn_id = self.conn_id, rows = pending.len(), "sandbox commit");
        self.store.apply_row_changes(
            pending
                .iter()
                .map(|(k, v)| (k.db.as_str(), k.table.as_str(), k.row_id, v.as_ref())),
        )
    }

    fn discard_pending(&mut self) {
        if !self.txn.pending.is_empty() {
            debug!(
                conn_id = self.conn_id,
                rows = self.txn.pending.len(),
                "sandbox rollback"
            );
        }
        self.txn.pending.clear();
        self.txn.active = false;
    }

    fn write_rows(
        &mut self,
        db: &str,
        table: &str,
        changes: Vec<(i64, Option<Row>)>,
    ) -> Result<(), InceptionError> {
        if changes.is_empty() {
            return Ok(());
        }
        if self.txn.active {
            for (row_id, row) in changes {
                self.txn.pending.insert(
                    RowKey {
                        db: db.to_string(),
                        table: table.to_string(),
                        row_id,
                    },
                    row,
                );
            }
            return Ok(());
        }
        self.store.apply_row_changes(
            changes
                .iter()
                .map(|(row_id, row)| (db, table, *row_id, row.as_ref())),
        )
    }

    /// Committed rows with this connection's pending writes laid over them.
    fn scan(&self, db: &str, table: &str) -> Result<Vec<(i64, Row)>, InceptionError> {
        let base = self.store.scan_rows(db, table)?;
        if self.txn.pending.is_empty() {
            return Ok(base);
        }
        let mut merged: BTreeMap<i64, Row> = base.into_iter().collect();
        for (k, v) in &self.txn.pending {
            if k.db != db || k.table != table {
                continue;
            }
            match v {
                Some(row) => {
                    merged.insert(k.row_id, row.clone());
                }
                None => {
                    merged.remove(&k.row_id);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn database(&self, db: Option<String>) -> Result<String, InceptionError> {
        db.or_else(|| self.current_db.clone())
            .ok_or_else(|| InceptionError::Invalid("No database selected".into()))
    }

    fn resolve(&self, name: &ast::ObjectName) -> Result<(String, String), InceptionError> {
        let (db, table) = object_name_to_parts(name);
        Ok((self.database(db)?, table))
    }

    fn use_database(&mut self, stmt: &Statement) -> Result<Output, InceptionError> {
        let db = classify(stmt)
            .db
            .ok_or_else(|| InceptionError::NotSupported("Only USE <db> is supported".into()))?;
        if !self.store.database_exists(&db)? {
            return Err(InceptionError::NotFound(format!("Unknown database '{db}'")));
        }
        self.current_db = Some(db);
        Ok(done(0))
    }

    fn insert(&mut self, insert: &ast::Insert) -> Result<Output, InceptionError> {
        let name = match &insert.table {
            ast::TableObject::TableName(name) => name,
            _ => {
                return Err(InceptionError::NotSupported(
                    "Complex table insert not supported".into(),
                ))
            }
        };
        if insert.on.is_some() {
            return Err(InceptionError::NotSupported(
                "INSERT ... ON DUPLICATE KEY UPDATE is not supported".into(),
            ));
        }
        let (db, table) = self.resolve(name)?;
        let def = self.store.get_table(&db, &table)?;

        let (columns, rows) = self.insert_source(insert, &def)?;
        let positions = columns
            .iter()
            .map(|c| {
                def.column_index(c).ok_or_else(|| {
                    InceptionError::Invalid(format!("Unknown column '{c}' in 'field list'"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let keys = unique_keys(&def);
        let ai = def.auto_increment_column();
        if ai.is_some() && self.store.auto_increment_next(&db, &table)?.is_none() {
            let max = self
                .scan(&db, &table)?
                .iter()
                .filter_map(|(_, row)| ai.and_then(|i| row.values.get(i)).and_then(Cell::as_i64))
                .max()
                .unwrap_or(0);
            self.store
                .bump_auto_increment_next(&db, &table, max.saturating_add(1).max(1))?;
        }

        let mut live = self.scan(&db, &table)?;
        let mut changes: Vec<(i64, Option<Row>)> = Vec::new();
        let mut affected = 0u64;
        let mut first_generated: Option<i64> = None;

        for (n, values) in rows.into_iter().enumerate() {
            if values.len() != positions.len() {
                return Err(InceptionError::Invalid(format!(
                    "Column count doesn't match value count at row {}",
                    n + 1
                )));
            }
            let mut row_vals: Vec<Cell> = def
                .columns
                .iter()
                .map(|c| c.default.clone().unwrap_or(Cell::Null))
                .collect();
            for (pos, value) in positions.iter().zip(values) {
                row_vals[*pos] = value;
            }
            if let Some(i) = ai {
                match row_vals[i].as_i64() {
                    None | Some(0) => {
                        let id = self.store.allocate_auto_increment(&db, &table)?;
                        row_vals[i] = Cell::Int(id);
                        first_generated.get_or_insert(id);
                    }
                    Some(v) => self
                        .store
                        .bump_auto_increment_next(&db, &table, v.saturating_add(1))?,
                }
            }
            for (value, col) in row_vals.iter_mut().zip(&def.columns) {
                if value.is_null() && (!col.nullable || def.is_primary(&col.name)) {
                    return Err(InceptionError::Invalid(format!(
                        "Column '{}' cannot be null",
                        col.name
                    )));
                }
                *value = eval::coerce_cell(std::mem::replace(value, Cell::Null), &col.ty)?;
            }
            let row = Row { values: row_vals };

            if insert.replace_into {
                while let Some((row_id, _)) = find_conflict(&keys, &live, &row, None) {
                    live.retain(|(id, _)| *id != row_id);
                    changes.push((row_id, None));
                    affected += 1;
                }
            } else if let Some((_, message)) = find_conflict(&keys, &live, &row, None) {
                if insert.ignore {
                    continue;
                }
                return Err(InceptionError::Invalid(message));
            }

            let row_id = self.store.allocate_row_id(&db, &table)?;
            live.push((row_id, row.clone()));
            changes.push((row_id, Some(row)));
            affected += 1;
        }

        self.write_rows(&db, &table, changes)?;
        Ok(Output::Done(ExecResult {
            affected_rows: affected,
            last_insert_id: first_generated.and_then(|id| u64::try_from(id).ok()).unwrap_or(0),
        }))
    }

    fn insert_source(
        &self,
        insert: &ast::Insert,
        def: &TableDef,
    ) -> Result<(Vec<String>, Vec<Vec<Cell>>), InceptionError> {
        let empty = ColMap::new();
        let mut columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();
        let rows = match &insert.source {
            Some(query) => match query.body.as_ref() {
                SetExpr::Values(values) => values
                    .rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|expr| eval::eval_expr(expr, &[], &empty))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                _ => self.select(query)?.rows,
            },
            None => {
                if insert.assignments.is_empty() {
                    return Err(InceptionError::Parse("INSERT missing source".into()));
                }
                columns.clear();
                let mut row = Vec::new();
                for a in &insert.assignments {
                    columns.push(assignment_column(&a.target)?);
                    row.push(eval::eval_expr(&a.value, &[], &empty)?);
                }
                vec![row]
            }
        };
        if columns.is_empty() {
            columns = def.columns.iter().map(|c| c.name.clone()).collect();
        }
        Ok((columns, rows))
    }

    /// Rows of a FROM clause. Comma-separated tables are crossed, JOINs are
    /// nested loops over the rows bound so far.
    fn bind_from(&self, from: &[ast::TableWithJoins]) -> Result<Joined, InceptionError> {
        let mut joined = Joined {
            tables: Vec::new(),
            cols: ColMap::new(),
            ambiguous: HashSet::new(),
            rows: vec![(Vec::new(), Vec::new())],
        };
        for twj in from {
            self.join_table(&mut joined, &twj.relation, None)?;
            for join in &twj.joins {
                let (outer, constraint) = match &join.join_operator {
                    ast::JoinOperator::Join(c)
                    | ast::JoinOperator::Inner(c)
                    | ast::JoinOperator::CrossJoin(c)
                    | ast::JoinOperator::StraightJoin(c) => (false, c),
                    ast::JoinOperator::Left(c) | ast::JoinOperator::LeftOuter(c) => (true, c),
                    other => {
                        return Err(InceptionError::NotSupported(format!(
                            "JOIN operator not supported: {other:?}"
                        )))
                    }
                };
                let on = match constraint {
                    ast::JoinConstraint::On(expr) => Some(expr),
                    ast::JoinConstraint::None => None,
                    _ => {
                        return Err(InceptionError::NotSupported(
                            "JOIN ... USING / NATURAL JOIN is not supported".into(),
                        ))
                    }
                };
                self.join_table(&mut joined, &join.relation, Some((outer, on)))?;
            }
        }
        Ok(joined)
    }

    fn join_table(
        &self,
        joined: &mut Joined,
        factor: &TableFactor,
        join: Option<(bool, Option<&ast::Expr>)>,
    ) -> Result<(), InceptionError> {
        let TableFactor::Table { name, alias, .. } = factor else {
            return Err(InceptionError::NotSupported(
                "Only plain tables are supported in FROM".into(),
            ));
        };
        let (db, table) = self.resolve(name)?;
        let def = self.store.get_table(&db, &table)?;
        let right = self.scan(&db, &table)?;
        let width = def.columns.len();
        let bound = Bound {
            name: alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table.clone()),
            offset: joined.tables.iter().map(|b| b.def.columns.len()).sum(),
            db,
            table,
            def,
        };
        joined.add_columns(&bound);
        joined.tables.push(bound);

        let (outer, on) = join.unwrap_or((false, None));
        let mut rows = Vec::with_capacity(joined.rows.len().saturating_mul(right.len().max(1)));
        for (ids, values) in &joined.rows {
            let mut matched = false;
            for (row_id, row) in &right {
                let mut combined = values.clone();
                combined.extend(row.values.iter().cloned());
                if let Some(on) = on {
                    if !eval::eval_condition(on, &combined, &joined.cols)? {
                        continue;
                    }
                }
                matched = true;
                let mut ids = ids.clone();
                ids.push(Some(*row_id));
                rows.push((ids, combined));
            }
            if outer && !matched {
                let mut combined = values.clone();
                combined.extend(std::iter::repeat(Cell::Null).take(width));
                let mut ids = ids.clone();
                ids.push(None);
                rows.push((ids, combined));
            }
        }
        joined.rows = rows;
        Ok(())
    }

    fn filter(joined: &mut Joined, selection: Option<&ast::Expr>) -> Result<(), InceptionError> {
        let Some(selection) = selection else {
            return Ok(());
        };
        let mut kept = Vec::with_capacity(joined.rows.len());
        for (ids, values) in std::mem::take(&mut joined.rows) {
            if eval::eval_condition(selection, &values, &joined.cols)? {
                kept.push((ids, values));
            }
        }
        joined.rows = kept;
        Ok(())
    }

    fn update(&mut self, update: &ast::Update) -> Result<Output, InceptionError> {
        if update.from.is_some() {
            return Err(InceptionError::NotSupported(
                "UPDATE ... FROM is not supported".into(),
            ));
        }
        let mut joined = self.bind_from(std::slice::from_ref(&update.table))?;
        let multi = joined.tables.len() > 1;

        // (bound table, column position in the joined row, expression)
        let mut assignments: Vec<(usize, usize, &ast::Expr)> = Vec::new();
        for a in &update.assignments {
            let (qualifier, col) = assignment_parts(&a.target)?;
            let t = joined.owner_of(qualifier.as_deref(), &col)?;
            let bound = &joined.tables[t];
            let idx = bound.def.column_index(&col).ok_or_else(|| {
                InceptionError::Invalid(format!("Unknown column '{col}' in 'field list'"))
            })?;
            assignments.push((t, bound.offset + idx, &a.value));
        }
        if multi && update.limit.is_some() {
            return Err(InceptionError::Invalid(
                "Incorrect usage of UPDATE and LIMIT".into(),
            ));
        }
        let limit = update.limit.as_ref().map(limit_value).transpose()?;
        Self::filter(&mut joined, update.selection.as_ref())?;

        let mut live = Vec::with_capacity(joined.tables.len());
        for bound in &joined.tables {
            live.push(self.scan(&bound.db, &bound.table)?);
        }
        let keys: Vec<_> = joined.tables.iter().map(|b| unique_keys(&b.def)).collect();
        let mut changes: Vec<Vec<(i64, Option<Row>)>> = vec![Vec::new(); joined.tables.len()];
        let mut touched: HashSet<(usize, i64)> = HashSet::new();
        let mut matched = 0usize;

        for (ids, values) in &joined.rows {
            if limit.is_some_and(|l| matched >= l) {
                break;
            }
            matched += 1;
            let mut values = values.clone();
            // Assignments see the values already assigned to their left.
            for (t, pos, expr) in &assignments {
                let bound = &joined.tables[*t];
                let col = &bound.def.columns[pos - bound.offset];
                let v = eval::eval_expr(expr, &values, &joined.cols)?;
                if v.is_null() && (!col.nullable || bound.def.is_primary(&col.name)) {
                    return Err(InceptionError::Invalid(format!(
                        "Column '{}' cannot be null",
                        col.name
                    )));
                }
                values[*pos] = eval::coerce_cell(v, &col.ty)?;
            }

            for (t, bound) in joined.tables.iter().enumerate() {
                if !assignments.iter().any(|(at, _, _)| *at == t) {
                    continue;
                }
                // A row matched more than once by the join is updated once.
                let Some(row_id) = ids[t] else { continue };
                if !touched.insert((t, row_id)) {
                    continue;
                }
                let Some(i) = live[t].iter().position(|(id, _)| *id == row_id) else {
                    continue;
                };
                let width = bound.def.columns.len();
                let new_values = values[bound.offset..bound.offset + width].to_vec();
                if new_values == live[t][i].1.values {
                    continue;
                }
                let new_row = Row { values: new_values };
                if let Some((_, message)) = find_conflict(&keys[t], &live[t], &new_row, Some(row_id)) {
                    return Err(InceptionError::Invalid(message));
                }
                live[t][i].1 = new_row.clone();
                changes[t].push((row_id, Some(new_row)));
            }
        }

        let mut affected = 0u64;
        for (bound, changes) in joined.tables.iter().zip(changes) {
            affected += changes.len() as u64;
            self.write_rows(&bound.db, &bound.table, changes)?;
        }
        Ok(done(affected))
    }

    fn delete(&mut self, delete: &ast::Delete) -> Result<Output, InceptionError> {
        let from = match &delete.from {
            ast::FromTable::WithFromKeyword(t) | ast::FromTable::WithoutKeyword(t) => t,
        };
        // DELETE t1 [, t2] FROM <source>, DELETE FROM t1 USING <source>, or
        // DELETE FROM <single table>.
        let (targets, source): (Vec<String>, &[ast::TableWithJoins]) = if !delete.tables.is_empty() {
            (
                delete
                    .tables
                    .iter()
                    .map(|n| object_name_to_parts(n).1)
                    .collect(),
                from,
            )
        } else if let Some(using) = &delete.using {
            let mut names = Vec::new();
            for twj in from {
                let TableFactor::Table { name, .. } = &twj.relation else {
                    return Err(InceptionError::NotSupported(
                        "Only plain tables can be deleted from".into(),
                    ));
                };
                names.push(object_name_to_parts(name).1);
            }
            (names, using)
        } else {
            match from.as_slice() {
                [twj] if twj.joins.is_empty() => (Vec::new(), from),
                _ => {
                    return Err(InceptionError::Invalid(
                        "DELETE FROM over several tables needs a target list".into(),
                    ))
                }
            }
        };
        let multi = !targets.is_empty();
        if multi && (delete.limit.is_some() || !delete.order_by.is_empty()) {
            return Err(InceptionError::Invalid(
                "Incorrect usage of multi-table DELETE and ORDER BY/LIMIT".into(),
            ));
        }

        let mut joined = self.bind_from(source)?;
        let target_tables = if multi {
            targets
                .iter()
                .map(|name| joined.bound_named(name))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            vec![0]
        };
        Self::filter(&mut joined, delete.selection.as_ref())?;

        let mut rows: Vec<(i64, Row)> = joined
            .rows
            .iter()
            .enumerate()
            .map(|(i, (_, values))| {
                (
                    i64::try_from(i).unwrap_or(i64::MAX),
                    Row {
                        values: values.clone(),
                    },
                )
            })
            .collect();
        sort_rows(&mut rows, &delete.order_by, &joined.cols)?;
        if let Some(limit) = delete.limit.as_ref().map(limit_value).transpose()? {
            rows.truncate(limit);
        }

        let mut affected = 0u64;
        for t in target_tables {
            let mut seen = HashSet::new();
            let mut changes = Vec::new();
            for (i, _) in &rows {
                let Some((ids, _)) = usize::try_from(*i).ok().and_then(|i| joined.rows.get(i)) else {
                    continue;
                };
                if let Some(row_id) = ids[t] {
                    if seen.insert(row_id) {
                        changes.push((row_id, None));
                    }
                }
            }
            affected += changes.len() as u64;
            let bound = &joined.tables[t];
            self.write_rows(&bound.db, &bound.table, changes)?;
        }
        Ok(done(affected))
    }

    fn select(&self, query: &ast::Query) -> Result<RowSet, InceptionError> {
        let SetExpr::Select(select) = query.body.as_ref() else {
            return Err(InceptionError::NotSupported("Only SELECT supported".into()));
        };

        let mut joined = self.bind_from(&select.from)?;
        Self::filter(&mut joined, select.selection.as_ref())?;
        let mut rows: Vec<(i64, Row)> = std::mem::take(&mut joined.rows)
            .into_iter()
            .map(|(_, values)| (0, Row { values }))
            .collect();
        if let Some(order_by) = &query.order_by {
            let exprs = match &order_by.kind {
                ast::OrderByKind::Expressions(e) => e,
                _ => {
                    return Err(InceptionError::NotSupported(
                        "Order By ALL not supported".into(),
                    ))
                }
            };
            sort_rows(&mut rows, exprs, &joined.cols)?;
        }

        let mut out = project(select, &joined, &rows)?;
        apply_limit(query, &mut out.rows)?;
        Ok(out)
    }

    fn show_columns(&self, opts: &ast::ShowStatementOptions) -> Result<Output, InceptionError> {
        let name = opts
            .show_in
            .as_ref()
            .and_then(|s| s.parent_name.as_ref())
            .ok_or_else(|| InceptionError::Parse("SHOW COLUMNS requires a table name".into()))?;
        let (db, table) = self.resolve(name)?;
        let def = self.store.get_table(&db, &table)?;

        let rows = def
            .columns
            .iter()
            .map(|col| {
                let key = if def.is_primary(&col.name) {
                    "PRI"
                } else if let Some(idx) = def
                    .indexes
                    .iter()
                    .find(|i| i.columns.first().is_some_and(|c| c.eq_ignore_ascii_case(&col.name)))
                {
                    if idx.unique {
                        "UNI"
                    } else {
                        "MUL"
                    }
                } else {
                    ""
                };
                let nullable = col.nullable && !def.is_primary(&col.name);
                vec![
                    Cell::Text(col.name.clone()),
                    Cell::Text(col.type_name.clone()),
                    Cell::Text(if nullable { "YES" } else { "NO" }.into()),
                    Cell::Text(key.into()),
                    col.default.clone().unwrap_or(Cell::Null),
                    Cell::Text(if col.auto_increment { "auto_increment" } else { "" }.into()),
                ]
            })
            .collect();
        Ok(Output::Rows(RowSet {
            columns: ["Field", "Type", "Null", "Key", "Default", "Extra"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows,
        }))
    }

    fn show_create_table(&self, name: &ast::ObjectName) -> Result<Output, InceptionError> {
        let (db, table) = self.resolve(name)?;
        let def = self.store.get_table(&db, &table)?;
        Ok(Output::Rows(RowSet {
            columns: vec!["Table".into(), "Create Table".into()],
            rows: vec![vec![
                Cell::Text(def.name.clone()),
                Cell::Text(render_create_table(&def)),
            ]],
        }))
    }

    fn show_databases(&self, opts: &ast::ShowStatementOptions) -> Result<Output, InceptionError> {
        let filter = opts.filter_position.as_ref().map(|pos| match pos {
            ast::ShowStatementFilterPosition::Infix(f)
            | ast::ShowStatementFilterPosition::Suffix(f) => f,
        });
        let pattern = match filter {
            None => None,
            Some(ast::ShowStatementFilter::Like(p))
            | Some(ast::ShowStatementFilter::ILike(p))
            | Some(ast::ShowStatementFilter::NoKeyword(p)) => Some(p.as_str()),
            Some(ast::ShowStatementFilter::Where(_)) => {
                return Err(InceptionError::NotSupported(
                    "SHOW DATABASES WHERE is not supported".into(),
                ))
            }
        };
        let rows = self
            .store
            .list_databases()?
            .into_iter()
            .filter(|db| pattern.is_none_or(|p| eval::like_matches(db, p)))
            .map(|db| vec![Cell::Text(db)])
            .collect();
        Ok(Output::Rows(RowSet {
            columns: vec!["Database".into()],
            rows,
        }))
    }

    fn ddl(&mut self, stmt: &Statement) -> Result<Output, InceptionError> {
        match stmt {
            Statement::CreateDatabase {
                db_name,
                if_not_exists,
                ..
            } => {
                let (_, db) = object_name_to_parts(db_name);
                if *if_not_exists && self.store.database_exists(&db)? {
                    return Ok(done(0));
                }
                self.store.create_database(&db)?;
                Ok(done(1))
            }
            Statement::Drop {
                object_type,
                names,
                if_exists,
                ..
            } => match object_type {
                ast::ObjectType::Database | ast::ObjectType::Schema => {
                    let (_, db) = names
                        .first()
                        .map(object_name_to_parts)
                        .ok_or_else(|| InceptionError::Parse("No database name".into()))?;
                    if *if_exists && !self.store.database_exists(&db)? {
                        return Ok(done(0));
                    }
                    self.store.drop_database(&db)?;
                    if self.current_db.as_deref() == Some(db.as_str()) {
                        self.current_db = None;
                    }
                    Ok(done(0))
                }
                ast::ObjectType::Table => {
                    let mut targets = Vec::new();
                    for name in names {
                        let (db, table) = self.resolve(name)?;
                        if self.store.table_exists(&db, &table)? {
                            targets.push((db, table));
                        } else if !*if_exists {
                            return Err(InceptionError::NotFound(format!(
                                "Unknown table '{db}.{table}'"
                            )));
                        }
                    }
                    for (db, table) in targets {
                        self.store.drop_table(&db, &table)?;
                    }
                    Ok(done(0))
                }
                ast::ObjectType::Index => {
                    let target = classify(stmt);
                    let db = self.database(target.db)?;
                    let index = names
                        .first()
                        .map(|n| object_name_to_parts(n).1)
                        .ok_or_else(|| InceptionError::Parse("No index name".into()))?;
                    let mut def = self.store.get_table(&db, &target.table)?;
                    drop_index(&mut def, &index)?;
                    self.store.update_table(&def)?;
                    Ok(done(0))
                }
                other => Err(InceptionError::NotSupported(format!(
                    "DROP {other} is not supported"
                ))),
            },
            Statement::CreateTable(create) => {
                let (db, table) = self.resolve(&create.name)?;
                if !self.store.database_exists(&db)? {
                    return Err(InceptionError::NotFound(format!("Unknown database '{db}'")));
                }
                if self.store.table_exists(&db, &table)? {
                    if create.if_not_exists {
                        return Ok(done(0));
                    }
                    return Err(InceptionError::Invalid(format!(
                        "Table '{table}' already exists"
                    )));
                }
                let def = if create.columns.is_empty() {
                    let source = like_source(&stmt.to_string()).ok_or_else(|| {
                        InceptionError::NotSupported("CREATE TABLE needs columns or LIKE".into())
                    })?;
                    let (src_db, src_table) = parse_name_text(&source);
                    let mut def = self.store.get_table(&self.database(src_db)?, &src_table)?;
                    def.db = db;
                    def.name = table;
                    def
                } else {
                    build_table_def(db, table, &create.columns, &create.constraints)?
                };
                self.store.create_table(&def)?;
                Ok(done(0))
            }
            Statement::AlterTable(alter) => self.alter_table(alter),
            Statement::RenameTable(renames) => {
                for rename in renames {
                    let (db, table) = self.resolve(&rename.old_name)?;
                    let (new_db, new_table) = self.resolve(&rename.new_name)?;
                    self.store.rename_table(&db, &table, &new_db, &new_table)?;
                }
                Ok(done(0))
            }
            Statement::CreateIndex(create) => self.create_index(create),
            other if classify(other).kind == StatementKind::Truncate => {
                let target = classify(other);
                let db = self.database(target.db)?;
                self.store.truncate_table(&db, &target.table)?;
                Ok(done(0))
            }
            other => Err(InceptionError::NotSupported(format!(
                "Statement not implemented: {other}"
            ))),
        }
    }

    fn alter_table(&mut self, alter: &ast::AlterTable) -> Result<Output, InceptionError> {
        let (db, table) = self.resolve(&alter.name)?;
        let mut def = match self.store.get_table(&db, &table) {
            Ok(def) => def,
            Err(InceptionError::NotFound(_)) if alter.if_exists => return Ok(done(0)),
            Err(e) => return Err(e),
        };
        let mut rows = self.store.scan_rows(&db, &table)?;
        let mut rename_to = None;
        for op in &alter.operations {
            apply_alter(&mut def, &mut rows, &mut rename_to, op)?;
        }
        verify_unique(&def, &rows)?;

        self.store.update_table(&def)?;
        self.store.apply_row_changes(
            rows.iter()
                .map(|(id, row)| (db.as_str(), table.as_str(), *id, Some(row))),
        )?;
        if let Some((new_db, new_table)) = rename_to {
            self.store.rename_table(&db, &table, &new_db, &new_table)?;
        }
        Ok(done(0))
    }

    fn create_index(&mut self, create: &ast::CreateIndex) -> Result<Output, InceptionError> {
        let (db, table) = self.resolve(&create.table_name)?;
        let mut def = self.store.get_table(&db, &table)?;
        let mut columns = Vec::new();
        for col in &create.columns {
            match &col.column.expr {
                ast::Expr::Identifier(ident) => columns.push(ident.value.clone()),
                _ => {
                    return Err(InceptionError::NotSupported(
                        "Index on complex expr not supported".into(),
                    ))
                }
            }
        }
        let name = match &create.name {
            Some(n) => object_name_to_parts(n).1,
            None => columns
                .first()
                .cloned()
                .ok_or_else(|| InceptionError::Parse("Index requires columns".into()))?,
        };
        if create.if_not_exists && def.indexes.iter().any(|i| i.name.eq_ignore_ascii_case(&name)) {
            return Ok(done(0));
        }
        let index = IndexShape {
            name,
            kind: if create.unique {
                IndexKind::Unique
            } else {
                IndexKind::Plain
            },
            columns,
        };
        add_index(&mut def, &index)?;
        verify_unique(&def, &self.store.scan_rows(&db, &table)?)?;
        self.store.update_table(&def)?;
        Ok(done(0))
    }
}

fn assignment_column(target: &ast::AssignmentTarget) -> Result<String, InceptionError> {
    assignment_parts(target).map(|(_, col)| col)
}

fn assignment_parts(
    target: &ast::AssignmentTarget,
) -> Result<(Option<String>, String), InceptionError> {
    match target {
        ast::AssignmentTarget::ColumnName(name) => {
            let parts: Vec<String> = name.0.iter().map(get_ident_name).collect();
            match parts.as_slice() {
                [] => Err(InceptionError::Parse("empty assignment target".into())),
                [col] => Ok((None, col.clone())),
                [.., qualifier, col] => Ok((Some(qualifier.clone()), col.clone())),
            }
        }
        ast::AssignmentTarget::Tuple(_) => Err(InceptionError::NotSupported(
            "tuple assignment is not supported".into(),
        )),
    }
}

fn limit_value(expr: &ast::Expr) -> Result<usize, InceptionError> {
    let v = eval::literal(expr)
        .and_then(|c| c.as_i64())
        .ok_or_else(|| InceptionError::Invalid("LIMIT must be an integer".into()))?;
    usize::try_from(v).map_err(|_| InceptionError::Invalid("LIMIT cannot be negative".into()))
}

fn apply_limit(query: &ast::Query, rows: &mut Vec<Vec<Cell>>) -> Result<(), InceptionError> {
    let mut offset = 0usize;
    let mut limit = None::<usize>;
    if let Some(limit_clause) = &query.limit_clause {
        match limit_clause {
            ast::LimitClause::LimitOffset {
                limit: lim,
                offset: off,
                ..
            } => {
                if let Some(lim_expr) = lim {
                    limit = Some(limit_value(lim_expr)?);
                }
                if let Some(off) = off {
                    offset = limit_value(&off.value)?;
                }
            }
            ast::LimitClause::OffsetCommaLimit {
                offset: off,
                limit: lim,
            } => {
                offset = limit_value(off)?;
                limit = Some(limit_value(lim)?);
            }
        }
    }
    rows.drain(0..offset.min(rows.len()));
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    Ok(())
}

fn sort_rows(
    rows: &mut Vec<(i64, Row)>,
    order_by: &[ast::OrderByExpr],
    cols: &ColMap,
) -> Result<(), InceptionError> {
    if order_by.is_empty() {
        return Ok(());
    }
    let mut keyed = Vec::with_capacity(rows.len());
    for (id, row) in rows.drain(..) {
        let key = order_by
            .iter()
            .map(|e| eval::eval_expr(&e.expr, &row.values, cols))
            .collect::<Result<Vec<_>, _>>()?;
        keyed.push((key, (id, row)));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for (i, e) in order_by.iter().enumerate() {
            let cmp = eval::compare_cells(&a[i], &b[i]);
            let cmp = if e.options.asc == Some(false) {
                cmp.reverse()
            } else {
                cmp
            };
            if cmp != std::cmp::Ordering::Equal {
                return cmp;
            }
        }
        std::cmp::Ordering::Equal
    });
    rows.extend(keyed.into_iter().map(|(_, r)| r));
    Ok(())
}

/// `COUNT(*)` / `COUNT(expr)` argument: `Some(None)` for the wildcard form.
fn count_arg(expr: &ast::Expr) -> Option<Option<&ast::Expr>> {
    let ast::Expr::Function(f) = expr else {
        return None;
    };
    if !f.name.to_string().eq_ignore_ascii_case("count") {
        return None;
    }
    match &f.args {
        ast::FunctionArguments::List(l) if l.args.len() == 1 => match &l.args[0] {
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Wildcard) => Some(None),
            ast::FunctionArg::Unnamed(ast::FunctionArgExpr::Expr(e)) => Some(Some(e)),
            _ => None,
        },
        _ => None,
    }
}

fn output_name(expr: &ast::Expr) -> String {
    match expr {
        ast::Expr::Identifier(ident) => ident.value.clone(),
        ast::Expr::CompoundIdentifier(ids) => ids
            .last()
            .map(|i| i.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

fn project(
    select: &ast::Select,
    joined: &Joined,
    rows: &[(i64, Row)],
) -> Result<RowSet, InceptionError> {
    let cols = &joined.cols;
    let items: Vec<(&ast::Expr, String)> = select
        .projection
        .iter()
        .filter_map(|item| match item {
            ast::SelectItem::UnnamedExpr(e) => Some((e, output_name(e))),
            ast::SelectItem::ExprWithAlias { expr, alias } => Some((expr, alias.value.clone())),
            _ => None,
        })
        .collect();

    if !items.is_empty() && items.iter().all(|(e, _)| count_arg(e).is_some()) {
        let mut values = Vec::with_capacity(items.len());
        for (expr, _) in &items {
            let n = match count_arg(expr).flatten() {
                None => rows.len(),
                Some(arg) => {
                    let mut n = 0usize;
                    for (_, row) in rows {
                        if !eval::eval_expr(arg, &row.values, cols)?.is_null() {
                            n += 1;
                        }
                    }
                    n
                }
            };
            values.push(Cell::Int(i64::try_from(n).unwrap_or(i64::MAX)));
        }
        return Ok(RowSet {
            columns: items.into_iter().map(|(_, name)| name).collect(),
            rows: vec![values],
        });
    }

    enum Item<'a> {
        Column(usize),
        Expr(&'a ast::Expr),
    }
    let mut plan = Vec::new();
    let mut columns = Vec::new();
    for item in &select.projection {
        match item {
            ast::SelectItem::Wildcard(_) => {
                if joined.tables.is_empty() {
                    return Err(InceptionError::Invalid("No tables used".into()));
                }
                for bound in &joined.tables {
                    for (i, c) in bound.def.columns.iter().enumerate() {
                        plan.push(Item::Column(bound.offset + i));
                        columns.push(c.name.clone());
                    }
                }
            }
            ast::SelectItem::QualifiedWildcard(kind, _) => {
                let ast::SelectItemQualifiedWildcardKind::ObjectName(name) = kind else {
                    return Err(InceptionError::NotSupported(
                        "Wildcard on expression is not supported".into(),
                    ));
                };
                let bound = &joined.tables[joined.bound_named(&object_name_to_parts(name).1)?];
                for (i, c) in bound.def.columns.iter().enumerate() {
                    plan.push(Item::Column(bound.offset + i));
                    columns.push(c.name.clone());
                }
            }
            ast::SelectItem::UnnamedExpr(e) => {
                if count_arg(e).is_some() {
                    return Err(InceptionError::NotSupported(
                        "mixing COUNT with plain columns is not supported".into(),
                    ));
                }
                plan.push(Item::Expr(e));
                columns.push(output_name(e));
            }
            ast::SelectItem::ExprWithAlias { expr, alias } => {
                plan.push(Item::Expr(expr));
                columns.push(alias.value.clone());
            }
        }
    }
    let mut out = Vec::with_capacity(rows.len());
    for (_, row) in rows {
        let mut values = Vec::with_capacity(plan.len());
        for item in &plan {
            values.push(match item {
                Item::Column(i) => row.values.get(*i).cloned().unwrap_or(Cell::Null),
                Item::Expr(e) => eval::eval_expr(e, &row.values, cols)?,
            });
        }
        out.push(values);
    }
    Ok(RowSet { columns, rows: out })
}

fn unique_keys(def: &TableDef) -> Vec<(String, Vec<usize>)> {
    let mut keys = Vec::new();
    if !def.primary_key.is_empty() {
        keys.push((
            "PRIMARY".to_string(),
            def.primary_key
                .iter()
                .filter_map(|c| def.column_index(c))
                .collect(),
        ));
    }
    for idx in def.indexes.iter().filter(|i| i.unique) {
        keys.push((
            idx.name.clone(),
            idx.columns.iter().filter_map(|c| def.column_index(c)).collect(),
        ));
    }
    keys
}

/// Key tuple with text folded for comparison; `None` when a part is NULL.
fn key_of(positions: &[usize], row: &Row) -> Option<Vec<Cell>> {
    positions
        .iter()
        .map(|i| match row.values.get(*i) {
            None | Some(Cell::Null) => None,
            Some(Cell::Text(s)) => Some(Cell::Text(s.to_lowercase())),
            Some(other) => Some(other.clone()),
        })
        .collect()
}

fn duplicate_message(key: &str, positions: &[usize], row: &Row) -> String {
    let value = positions
        .iter()
        .map(|i| row.values.get(*i).map(|c| c.to_string()).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("-");
    format!("Duplicate entry '{value}' for key '{key}'")
}

fn find_conflict(
    keys: &[(String, Vec<usize>)],
    live: &[(i64, Row)],
    row: &Row,
    skip: Option<i64>,
) -> Option<(i64, String)> {
    for (name, positions) in keys {
        let Some(key) = key_of(positions, row) else {
            continue;
        };
        for (id, other) in live {
            if Some(*id) == skip {
                continue;
            }
            if key_of(positions, other).as_ref() == Some(&key) {
                return Some((*id, duplicate_message(name, positions, row)));
            }
        }
    }
    None
}

fn verify_unique(def: &TableDef, rows: &[(i64, Row)]) -> Result<(), InceptionError> {
    for (name, positions) in unique_keys(def) {
        let mut seen = HashSet::new();
        for (_, row) in rows {
            if let Some(key) = key_of(&positions, row) {
                if !seen.insert(key) {
                    return Err(InceptionError::Invalid(duplicate_message(
                        &name, &positions, row,
                    )));
                }
            }
        }
    }
    Ok(())
}

fn sql_type(type_name: &str) -> SqlType {
    let base = type_name
        .split(|c: char| c == '(' || c.is_whitespace())
        .next()
        .unwrap_or("");
    match base {
        "int" | "integer" | "bigint" | "smallint" | "tinyint" | "mediumint" | "bool"
        | "boolean" | "bit" | "year" => SqlType::Int,
        "float" | "double" | "real" | "decimal" | "numeric" | "dec" => SqlType::Float,
        _ => SqlType::Text,
    }
}

fn to_column_def(col: &ast::ColumnDef) -> ColumnDef {
    let shape = column_shape(col);
    let type_name = col.data_type.to_string().to_ascii_lowercase();
    let mut nullable = true;
    let mut default = None;
    for opt in &col.options {
        match &opt.option {
            ast::ColumnOption::NotNull | ast::ColumnOption::PrimaryKey(_) => nullable = false,
            ast::ColumnOption::Null => nullable = true,
            ast::ColumnOption::Default(expr) => {
                default = eval::eval_expr(expr, &[], &ColMap::new()).ok();
            }
            _ => {}
        }
    }
    let auto_increment = shape
        .definition
        .to_ascii_uppercase()
        .contains("AUTO_INCREMENT");
    ColumnDef {
        name: col.name.value.clone(),
        ty: sql_type(&type_name),
        nullable,
        definition: shape.definition,
        type_name,
        default,
        auto_increment,
    }
}

/// Value MySQL fills into existing rows for a new NOT NULL column without DEFAULT.
fn implicit_default(col: &ColumnDef) -> Cell {
    if col.nullable {
        return Cell::Null;
    }
    match col.ty {
        SqlType::Int => Cell::Int(0),
        SqlType::Float => Cell::Float(0.0),
        SqlType::Text => Cell::Text(String::new()),
    }
}

fn build_table_def(
    db: String,
    name: String,
    columns: &[ast::ColumnDef],
    constraints: &[ast::TableConstraint],
) -> Result<TableDef, InceptionError> {
    let mut def = TableDef {
        db,
        name,
        columns: Vec::with_capacity(columns.len()),
        indexes: Vec::new(),
        primary_key: Vec::new(),
    };
    for col in columns {
        if def.column_index(&col.name.value).is_some() {
            return Err(InceptionError::Invalid(format!(
                "Duplicate column name '{}'",
                col.name.value
            )));
        }
        def.columns.push(to_column_def(col));
    }
    for index in &TableShape::from_parts(columns, constraints).indexes {
        add_index(&mut def, index)?;
    }
    Ok(def)
}

fn add_index(def: &mut TableDef, index: &IndexShape) -> Result<(), InceptionError> {
    let mut columns = Vec::with_capacity(index.columns.len());
    for c in &index.columns {
        let i = def.column_index(c).ok_or_else(|| {
            InceptionError::Invalid(format!("Key column '{c}' doesn't exist in table"))
        })?;
        columns.push(def.columns[i].name.clone());
    }
    match index.kind {
        IndexKind::Primary => {
            if !def.primary_key.is_empty() {
                return Err(InceptionError::Invalid("Multiple primary key defined".into()));
            }
            for col in def.columns.iter_mut() {
                if columns.iter().any(|c| c == &col.name) {
                    col.nullable = false;
                }
            }
            def.primary_key = columns;
        }
        IndexKind::Unique | IndexKind::Plain => {
            if def
                .indexes
                .iter()
                .any(|i| i.name.eq_ignore_ascii_case(&index.name))
            {
                return Err(InceptionError::Invalid(format!(
                    "Duplicate key name '{}'",
                    index.name
                )));
            }
            let shape = IndexShape {
                name: index.name.clone(),
                kind: index.kind,
                columns: columns.clone(),
            };
            def.indexes.push(IndexDef {
                name: index.name.clone(),
                columns,
                unique: index.kind == IndexKind::Unique,
                definition: shape.render(),
            });
        }
    }
    Ok(())
}

fn drop_index(def: &mut TableDef, name: &str) -> Result<(), InceptionError> {
    if name.eq_ignore_ascii_case("PRIMARY") && !def.primary_key.is_empty() {
        def.primary_key.clear();
        return Ok(());
    }
    let pos = def
        .indexes
        .iter()
        .position(|i| i.name.eq_ignore_ascii_case(name))
        .ok_or_else(|| {
            InceptionError::Invalid(format!("Can't DROP '{name}'; check that column/key exists"))
        })?;
    def.indexes.remove(pos);
    Ok(())
}

fn rewrite_key_column(def: &mut TableDef, old: &str, new: Option<&str>) {
    let rewrite = |cols: &mut Vec<String>| {
        match new {
            Some(new) => {
                for c in cols.iter_mut() {
                    if c.eq_ignore_ascii_case(old) {
                        *c = new.to_string();
                    }
                }
            }
            None => cols.retain(|c| !c.eq_ignore_ascii_case(old)),
        }
    };
    rewrite(&mut def.primary_key);
    for idx in def.indexes.iter_mut() {
        rewrite(&mut idx.columns);
        idx.definition = IndexShape {
            name: idx.name.clone(),
            kind: if idx.unique {
                IndexKind::Unique
            } else {
                IndexKind::Plain
            },
            columns: idx.columns.clone(),
        }
        .render();
    }
    def.indexes.retain(|i| !i.columns.is_empty());
}

fn unknown_column(name: &str, def: &TableDef) -> InceptionError {
    InceptionError::Invalid(format!("Unknown column '{name}' in '{}'", def.name))
}

/// Definition text of MODIFY/CHANGE, starting at the (new) column name.
fn definition_text(op_text: &str, names_before: usize) -> String {
    let words = words(op_text);
    let mut at = 1;
    if words
        .get(at)
        .is_some_and(|w| w.eq_ignore_ascii_case("COLUMN"))
    {
        at += 1;
    }
    words[(at + names_before).min(words.len())..].join(" ")
}

fn replace_column(
    def: &mut TableDef,
    rows: &mut [(i64, Row)],
    old: &str,
    spec: &str,
) -> Result<(), InceptionError> {
    let idx = def.column_index(old).ok_or_else(|| unknown_column(old, def))?;
    let mut col = to_column_def(&parse_column_def(spec)?);
    let old_name = def.columns[idx].name.clone();
    if !col.name.eq_ignore_ascii_case(&old_name) && def.column_index(&col.name).is_some() {
        return Err(InceptionError::Invalid(format!(
            "Duplicate column name '{}'",
            col.name
        )));
    }
    if def.is_primary(&old_name) {
        col.nullable = false;
    }
    for (_, row) in rows.iter_mut() {
        let v = std::mem::replace(&mut row.values[idx], Cell::Null);
        if v.is_null() && !col.nullable {
            return Err(InceptionError::Invalid("Invalid use of NULL value".into()));
        }
        row.values[idx] = eval::coerce_cell(v, &col.ty)?;
    }
    let new_name = col.name.clone();
    def.columns[idx] = col;
    if new_name != old_name {
        rewrite_key_column(def, &old_name, Some(&new_name));
    }
    Ok(())
}

fn rename_column(def: &mut TableDef, old: &str, new: &str) -> Result<(), InceptionError> {
    let idx = def.column_index(old).ok_or_else(|| unknown_column(old, def))?;
    if def.column_index(new).is_some_and(|i| i != idx) {
        return Err(InceptionError::Invalid(format!(
            "Duplicate column name '{new}'"
        )));
    }
    let col = &mut def.columns[idx];
    let old_name = std::mem::replace(&mut col.name, new.to_string());
    if let Some(rest) = col.definition.strip_prefix(&quote_ident(&old_name)) {
        col.definition = format!("{}{rest}", quote_ident(new));
    }
    rewrite_key_column(def, &old_name, Some(new));
    Ok(())
}

fn drop_column(
    def: &mut TableDef,
    rows: &mut [(i64, Row)],
    name: &str,
) -> Result<(), InceptionError> {
    let idx = def.column_index(name).ok_or_else(|| {
        InceptionError::Invalid(format!("Can't DROP '{name}'; check that column/key exists"))
    })?;
    if def.columns.len() == 1 {
        return Err(InceptionError::Invalid(
            "You can't delete all columns with ALTER TABLE; use DROP TABLE instead".into(),
        ));
    }
    let removed = def.columns.remove(idx);
    for (_, row) in rows.iter_mut() {
        if idx < row.values.len() {
            row.values.remove(idx);
        }
    }
    rewrite_key_column(def, &removed.name, None);
    Ok(())
}

fn apply_alter(
    def: &mut TableDef,
    rows: &mut [(i64, Row)],
    rename_to: &mut Option<(String, String)>,
    op: &ast::AlterTableOperation,
) -> Result<(), InceptionError> {
    if let ast::AlterTableOperation::AddColumn {
        if_not_exists,
        column_def,
        ..
    } = op
    {
        if def.column_index(&column_def.name.value).is_some() {
            if *if_not_exists {
                return Ok(());
            }
            return Err(InceptionError::Invalid(format!(
                "Duplicate column name '{}'",
                column_def.name.value
            )));
        }
        let col = to_column_def(column_def);
        let fill = col.default.clone().unwrap_or_else(|| implicit_default(&col));
        for (_, row) in rows.iter_mut() {
            row.values.push(fill.clone());
        }
        def.columns.push(col);
        for index in &TableShape::from_parts(std::slice::from_ref(column_def), &[]).indexes {
            add_index(def, index)?;
        }
        return Ok(());
    }

    let text = op.to_string();
    match AlterAction::from_operation(op) {
        AlterAction::DropColumn(name) => drop_column(def, rows, &unquote(&name)),
        AlterAction::ModifyColumn(name) => {
            replace_column(def, rows, &unquote(&name), &definition_text(&text, 0))
        }
        AlterAction::ChangeColumn { old, .. } => {
            replace_column(def, rows, &unquote(&old), &definition_text(&text, 1))
        }
        AlterAction::RenameColumn { old, new } => rename_column(def, &unquote(&old), &unquote(&new)),
        AlterAction::AddIndex(_) | AlterAction::AddPrimaryKey => {
            let index = IndexShape::from_text(&text)
                .ok_or_else(|| InceptionError::NotSupported(format!("ALTER TABLE {text}")))?;
            add_index(def, &index)
        }
        AlterAction::DropIndex(name) => drop_index(def, &unquote(&name)),
        AlterAction::DropPrimaryKey => {
            if def.primary_key.is_empty() {
                return Err(InceptionError::Invalid(
                    "Can't DROP 'PRIMARY'; check that column/key exists".into(),
                ));
            }
            def.primary_key.clear();
            Ok(())
        }
        AlterAction::RenameTable(name) => {
            let (db, table) = parse_name_text(&name);
            *rename_to = Some((db.unwrap_or_else(|| def.db.clone()), table));
            Ok(())
        }
        AlterAction::ConvertCharset | AlterAction::TableOption(_) => Ok(()),
        AlterAction::AddColumn(_) | AlterAction::Other(_) => Err(InceptionError::NotSupported(
            format!("ALTER TABLE {text} is not supported"),
        )),
    }
}

fn like_source(text: &str) -> Option<String> {
    let words = words(text);
    let pos = words.iter().position(|w| {
        w.trim_start_matches('(').eq_ignore_ascii_case("LIKE")
    })?;
    let name = name_token(words.get(pos + 1)?.trim_start_matches('('));
    let name = name.trim_end_matches(')').to_string();
    (!name.is_empty()).then_some(name)
}

pub fn render_create_table(def: &TableDef) -> String {
    let mut lines: Vec<String> = def
        .columns
        .iter()
        .map(|c| format!("  {}", c.definition))
        .collect();
    if !def.primary_key.is_empty() {
        let cols = def
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        lines.push(format!("  PRIMARY KEY ({cols})"));
    }
    for idx in &def.indexes {
        lines.push(format!("  {}", idx.definition));
    }
    format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(&def.name),
        lines.join(",\n")
    )
}
