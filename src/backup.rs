use crate::backend::{qualified, ExecResult, Session, TableMeta};
use crate::classify::{get_ident_name, object_name_to_parts, StatementKind, Target};
use crate::error::InceptionError;
use crate::model::{escape_sql_string, quote_ident, Cell, Opid};
use crate::rollback::{self, DdlPreState, Undo};
use crate::schema::TableShape;
use sha1::{Digest, Sha1};
use sqlparser::ast::{self, FromTable, SetExpr, Statement};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

pub const BACKUP_TABLE: &str = "inception_rollback";
const MAX_SCHEMA_LEN: usize = 64;
/// Opids per lookup query and rows per insert.
const CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupLocation {
    pub schema: String,
    pub table: String,
}

impl BackupLocation {
    pub fn for_schema(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: BACKUP_TABLE.to_string(),
        }
    }

    pub fn qualified(&self) -> String {
        qualified(&self.schema, &self.table)
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// `{host}_{port}_{db}` made identifier-safe, plus a hash of the raw inputs so
/// sources that sanitize to the same text still get distinct schemas.
pub fn derive_location(host: &str, port: u16, db: &str) -> BackupLocation {
    let mut hasher = Sha1::new();
    hasher.update(host.as_bytes());
    hasher.update([0u8]);
    hasher.update(port.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(db.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(4).map(|b| format!("{b:02x}")).collect();

    let mut prefix = format!("{}_{}_{}", sanitize(host), port, sanitize(db));
    prefix.truncate(MAX_SCHEMA_LEN - hex.len() - 1);
    BackupLocation::for_schema(format!("{prefix}_{hex}"))
}

pub async fn ensure_location(
    session: &mut Session,
    loc: &BackupLocation,
) -> Result<(), InceptionError> {
    session
        .execute(&format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            quote_ident(&loc.schema)
        ))
        .await?;
    session
        .execute(&format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             id BIGINT NOT NULL AUTO_INCREMENT, \
             opid VARCHAR(64) NOT NULL, \
             table_name VARCHAR(128) NOT NULL, \
             rollback_statement LONGTEXT NOT NULL, \
             is_sentinel TINYINT NOT NULL DEFAULT 0, \
             PRIMARY KEY (id), \
             KEY idx_opid (opid))",
            loc.qualified()
        ))
        .await?;
    info!(schema = %loc.schema, "backup location ready");
    Ok(())
}

pub async fn write_rows(
    session: &mut Session,
    loc: &BackupLocation,
    opid: Opid,
    table: &str,
    statements: &[String],
) -> Result<(), InceptionError> {
    let opid_text = opid.to_string();
    for chunk in statements.chunks(CHUNK) {
        let values = chunk
            .iter()
            .map(|stmt| {
                format!(
                    "('{}','{}','{}',0)",
                    opid_text,
                    escape_sql_string(table),
                    escape_sql_string(stmt)
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        session
            .execute(&format!(
                "INSERT INTO {} (opid, table_name, rollback_statement, is_sentinel) VALUES {values}",
                loc.qualified()
            ))
            .await?;
    }
    debug!(opid = %opid, rows = statements.len(), "rollback rows written");
    Ok(())
}

pub async fn write_sentinel(
    session: &mut Session,
    loc: &BackupLocation,
    opid: Opid,
) -> Result<(), InceptionError> {
    session
        .execute(&format!(
            "INSERT INTO {} (opid, table_name, rollback_statement, is_sentinel) VALUES ('{opid}','','',1)",
            loc.qualified()
        ))
        .await?;
    Ok(())
}

/// Removes the rows of a statement that did not take effect.
pub async fn delete_rows(
    session: &mut Session,
    loc: &BackupLocation,
    opid: Opid,
) -> Result<(), InceptionError> {
    session
        .execute(&format!(
            "DELETE FROM {} WHERE opid = '{opid}'",
            loc.qualified()
        ))
        .await?;
    Ok(())
}

/// Rollback statements per opid text, in stored order. Sentinel rows are skipped.
pub async fn load_statements(
    session: &mut Session,
    loc: &BackupLocation,
    opids: &[Opid],
) -> Result<HashMap<String, Vec<String>>, InceptionError> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for chunk in opids.chunks(CHUNK) {
        let list = chunk
            .iter()
            .map(|o| format!("'{o}'"))
            .collect::<Vec<_>>()
            .join(",");
        let rs = session
            .query(&format!(
                "SELECT opid, rollback_statement, is_sentinel FROM {} WHERE opid IN ({list}) ORDER BY id",
                loc.qualified()
            ))
            .await?;
        for row in &rs.rows {
            let sentinel = rs
                .value(row, "is_sentinel")
                .and_then(|c| c.as_i64())
                .unwrap_or(0);
            if sentinel != 0 {
                continue;
            }
            let (Some(opid), Some(stmt)) = (rs.value(row, "opid"), rs.value(row, "rollback_statement"))
            else {
                continue;
            };
            out.entry(opid.to_string()).or_default().push(stmt.to_string());
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableUndo {
    pub table: String,
    pub undo: Undo,
}

#[derive(Debug)]
pub enum Capture {
    Ready(Vec<TableUndo>),
    /// INSERT: keys are known once the server reports generated ids.
    PendingInsert {
        label: String,
        table: String,
        meta: TableMeta,
    },
}

impl Capture {
    fn single(label: impl Into<String>, undo: Undo) -> Self {
        Capture::Ready(vec![TableUndo {
            table: label.into(),
            undo,
        }])
    }

    pub fn finish(
        self,
        stmt: &Statement,
        result: &ExecResult,
    ) -> Result<Vec<TableUndo>, InceptionError> {
        match self {
            Capture::Ready(parts) => Ok(parts),
            Capture::PendingInsert { label, table, meta } => match stmt {
                Statement::Insert(insert) => Ok(vec![TableUndo {
                    table: label,
                    undo: rollback::undo_insert(&table, &meta, insert, result)?,
                }]),
                _ => Err(InceptionError::BackupCapture("not an INSERT".into())),
            },
        }
    }
}

fn refuse(msg: impl Into<String>) -> InceptionError {
    InceptionError::BackupCapture(msg.into())
}

#[derive(Debug, Clone)]
struct TableRef {
    db: String,
    table: String,
    /// Alias, else table name.
    name: String,
}

impl TableRef {
    fn qualified(&self) -> String {
        qualified(&self.db, &self.table)
    }

    /// FROM text for a single-table pre-image, keeping the alias the
    /// statement's predicate refers to.
    fn from_text(&self) -> String {
        if self.name == self.table {
            self.qualified()
        } else {
            format!("{} AS {}", self.qualified(), quote_ident(&self.name))
        }
    }
}

fn table_refs(
    from: &[ast::TableWithJoins],
    db: &str,
    out: &mut Vec<TableRef>,
) -> Result<(), InceptionError> {
    for twj in from {
        factor_refs(&twj.relation, db, out)?;
        for join in &twj.joins {
            factor_refs(&join.relation, db, out)?;
        }
    }
    Ok(())
}

fn factor_refs(
    factor: &ast::TableFactor,
    db: &str,
    out: &mut Vec<TableRef>,
) -> Result<(), InceptionError> {
    match factor {
        ast::TableFactor::Table { name, alias, .. } => {
            let (name_db, table) = object_name_to_parts(name);
            out.push(TableRef {
                db: name_db.unwrap_or_else(|| db.to_string()),
                name: alias
                    .as_ref()
                    .map(|a| a.name.value.clone())
                    .unwrap_or_else(|| table.clone()),
                table,
            });
            Ok(())
        }
        ast::TableFactor::NestedJoin {
            table_with_joins, ..
        } => table_refs(std::slice::from_ref(table_with_joins.as_ref()), db, out),
        _ => Err(refuse("derived tables in DML cannot be backed up")),
    }
}

fn ref_named(refs: &[TableRef], name: &str) -> Result<usize, InceptionError> {
    refs.iter()
        .position(|r| r.name.eq_ignore_ascii_case(name))
        .or_else(|| refs.iter().position(|r| r.table.eq_ignore_ascii_case(name)))
        .ok_or_else(|| refuse(format!("unknown table {name} in multi-table statement")))
}

/// A row joined to several partners comes back once per partner.
fn distinct_rows(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|r| seen.insert(r.clone())).collect()
}

fn where_clause(selection: Option<&ast::Expr>) -> String {
    selection.map(|s| format!(" WHERE {s}")).unwrap_or_default()
}

/// Reads the pre-state a unit's undo needs. `db` is the database the unit
/// runs against.
pub async fn prepare(
    session: &mut Session,
    stmt: &Statement,
    target: &Target,
    db: &str,
) -> Result<Option<Capture>, InceptionError> {
    match (target.kind, stmt) {
        (StatementKind::Insert, Statement::Insert(insert)) => {
            if insert.replace_into {
                return Err(refuse("REPLACE cannot be backed up"));
            }
            if insert.on.is_some() {
                return Err(refuse("INSERT ... ON DUPLICATE KEY UPDATE cannot be backed up"));
            }
            if let Some(source) = &insert.source {
                if !matches!(source.body.as_ref(), SetExpr::Values(_)) {
                    return Err(refuse("INSERT ... SELECT cannot be backed up"));
                }
            }
            if target.table.is_empty() {
                return Err(refuse("INSERT target table cannot be resolved"));
            }
            let meta = session.table_meta(db, &target.table).await?;
            Ok(Some(Capture::PendingInsert {
                label: target.table.clone(),
                table: qualified(db, &target.table),
                meta,
            }))
        }
        (StatementKind::Update, Statement::Update(update)) => {
            prepare_update(session, update, db).await.map(Some)
        }
        (StatementKind::Delete, Statement::Delete(delete)) => {
            prepare_delete(session, delete, db).await.map(Some)
        }
        (StatementKind::Truncate, _) => {
            if target.table.is_empty() {
                return Err(refuse("TRUNCATE target table cannot be resolved"));
            }
            let table_db = target.db.as_deref().unwrap_or(db);
            let table_q = qualified(table_db, &target.table);
            let rs = session.query(&format!("SELECT * FROM {table_q}")).await?;
            Ok(Some(Capture::single(
                target.table.clone(),
                rollback::restore_table(&table_q, &rs.columns, &rs.rows),
            )))
        }
        (kind, _) if kind.is_ddl() => {
            let pre = ddl_pre_state(session, stmt, target, db).await?;
            Ok(Some(Capture::single(
                table_label(target),
                rollback::inverse_ddl(stmt, &pre)?,
            )))
        }
        (StatementKind::Insert | StatementKind::Update | StatementKind::Delete, _) => {
            Err(refuse("statement shape does not match its kind"))
        }
        _ => Ok(None),
    }
}

async fn prepare_update(
    session: &mut Session,
    update: &ast::Update,
    db: &str,
) -> Result<Capture, InceptionError> {
    if update.from.is_some() {
        return Err(refuse("UPDATE ... FROM cannot be backed up"));
    }
    let mut refs = Vec::new();
    table_refs(std::slice::from_ref(&update.table), db, &mut refs)?;
    let filter = where_clause(update.selection.as_ref());

    if let [single] = refs.as_slice() {
        let meta = session.table_meta(&single.db, &single.table).await?;
        let mut sql = format!("SELECT * FROM {}{filter}", single.from_text());
        if let Some(limit) = &update.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rs = session.query(&sql).await?;
        let undo =
            rollback::undo_update(&single.qualified(), &meta, update, &rs.columns, &rs.rows)?;
        return Ok(Capture::single(single.table.clone(), undo));
    }

    let mut metas = Vec::with_capacity(refs.len());
    for r in &refs {
        metas.push(session.table_meta(&r.db, &r.table).await?);
    }
    // Assignments grouped by the table reference they write.
    let mut groups: Vec<(usize, Vec<(String, &ast::Expr)>)> = Vec::new();
    for a in &update.assignments {
        let ast::AssignmentTarget::ColumnName(name) = &a.target else {
            return Err(refuse("tuple assignments are not supported"));
        };
        let parts: Vec<String> = name.0.iter().map(get_ident_name).collect();
        let (qualifier, col) = match parts.as_slice() {
            [col] => (None, col.clone()),
            [.., q, col] => (Some(q.as_str()), col.clone()),
            [] => return Err(refuse("empty assignment target")),
        };
        let owner = match qualifier {
            Some(q) => ref_named(&refs, q)?,
            None => {
                let owners: Vec<usize> = metas
                    .iter()
                    .enumerate()
                    .filter(|(_, m)| m.columns.iter().any(|c| c.eq_ignore_ascii_case(&col)))
                    .map(|(i, _)| i)
                    .collect();
                match owners.as_slice() {
                    [one] => *one,
                    [] => return Err(refuse(format!("unknown column {col}"))),
                    _ => return Err(refuse(format!("column {col} is ambiguous"))),
                }
            }
        };
        match groups.iter_mut().find(|(i, _)| *i == owner) {
            Some((_, assigned)) => assigned.push((col, &a.value)),
            None => groups.push((owner, vec![(col, &a.value)])),
        }
    }

    let from = update.table.to_string();
    let mut parts = Vec::with_capacity(groups.len());
    for (i, assigned) in groups {
        let r = &refs[i];
        let rs = session
            .query(&format!(
                "SELECT {}.* FROM {from}{filter}",
                quote_ident(&r.name)
            ))
            .await?;
        let rows = distinct_rows(rs.rows);
        let undo = rollback::undo_joined_update(
            &r.qualified(),
            &metas[i],
            &assigned,
            &[r.name.clone(), r.table.clone()],
            &rs.columns,
            &rows,
        )?;
        parts.push(TableUndo {
            table: r.table.clone(),
            undo,
        });
    }
    parts.sort_by(|a, b| a.table.cmp(&b.table));
    debug!(tables = parts.len(), "joined update captured");
    Ok(Capture::Ready(parts))
}

async fn prepare_delete(
    session: &mut Session,
    delete: &ast::Delete,
    db: &str,
) -> Result<Capture, InceptionError> {
    let from = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    let filter = where_clause(delete.selection.as_ref());

    if delete.tables.is_empty() && delete.using.is_none() {
        let mut refs = Vec::new();
        table_refs(from, db, &mut refs)?;
        let [single] = refs.as_slice() else {
            return Err(refuse("DELETE over several tables needs a target list"));
        };
        let mut sql = format!("SELECT * FROM {}{filter}", single.from_text());
        if !delete.order_by.is_empty() {
            let order = delete
                .order_by
                .iter()
                .map(|o| o.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" ORDER BY {order}"));
        }
        if let Some(limit) = &delete.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        let rs = session.query(&sql).await?;
        return Ok(Capture::single(
            single.table.clone(),
            rollback::restore_rows(&single.qualified(), &rs.columns, &rs.rows),
        ));
    }

    // DELETE a, b FROM <source> or DELETE FROM a, b USING <source>.
    let (targets, source): (Vec<String>, &[ast::TableWithJoins]) = match &delete.using {
        Some(using) if delete.tables.is_empty() => {
            let mut names = Vec::new();
            for twj in from {
                let ast::TableFactor::Table { name, .. } = &twj.relation else {
                    return Err(refuse("derived tables in DML cannot be backed up"));
                };
                names.push(object_name_to_parts(name).1);
            }
            (names, using)
        }
        _ => (
            delete
                .tables
                .iter()
                .map(|n| object_name_to_parts(n).1)
                .collect(),
            from,
        ),
    };
    let mut refs = Vec::new();
    table_refs(source, db, &mut refs)?;
    let source_text = source
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut parts = Vec::with_capacity(targets.len());
    for name in &targets {
        let r = &refs[ref_named(&refs, name)?];
        let meta = session.table_meta(&r.db, &r.table).await?;
        let rs = session
            .query(&format!(
                "SELECT {}.* FROM {source_text}{filter}",
                quote_ident(&r.name)
            ))
            .await?;
        let rows = distinct_rows(rs.rows);
        let mut undo = rollback::restore_rows(&r.qualified(), &rs.columns, &rows);
        if meta.primary_key.is_empty() {
            undo.partial
                .push("multi-table delete from a table without a primary key".into());
        }
        parts.push(TableUndo {
            table: r.table.clone(),
            undo,
        });
    }
    debug!(tables = parts.len(), "multi-table delete captured");
    Ok(Capture::Ready(parts))
}

async fn table_shape(
    session: &mut Session,
    db: &str,
    table: &str,
) -> Result<Option<TableShape>, InceptionError> {
    if !session.table_exists(db, table).await? {
        return Ok(None);
    }
    let text = session.show_create_table(db, table).await?;
    TableShape::parse(&text).map(Some)
}

async fn ddl_pre_state(
    session: &mut Session,
    stmt: &Statement,
    target: &Target,
    db: &str,
) -> Result<DdlPreState, InceptionError> {
    let mut pre = DdlPreState::default();
    match target.kind {
        StatementKind::CreateTable => {
            pre.existed = session.table_exists(db, &target.table).await?;
        }
        StatementKind::AlterTable | StatementKind::CreateIndex | StatementKind::DropIndex => {
            pre.shape = table_shape(session, db, &target.table).await?;
            pre.existed = pre.shape.is_some();
        }
        StatementKind::DropTable => {
            if let Statement::Drop { names, .. } = stmt {
                for name in names {
                    let (name_db, table) = object_name_to_parts(name);
                    let name_db = name_db.unwrap_or_else(|| db.to_string());
                    let text = if session.table_exists(&name_db, &table).await? {
                        Some(session.show_create_table(&name_db, &table).await?)
                    } else {
                        None
                    };
                    pre.create_texts.push(text);
                }
            }
        }
        StatementKind::CreateDatabase | StatementKind::DropDatabase => {
            let name = target.db.as_deref().unwrap_or(db);
            pre.existed = session.database_exists(name).await?;
        }
        _ => {}
    }
    Ok(pre)
}

fn table_label(target: &Target) -> String {
    match (&target.db, target.table.is_empty()) {
        (_, false) => target.table.clone(),
        (Some(db), true) => db.clone(),
        (None, true) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locations_are_deterministic_and_bounded() {
        let a = derive_location("127.0.0.1", 3306, "test_inc");
        assert_eq!(a, derive_location("127.0.0.1", 3306, "test_inc"));
        assert!(a.schema.starts_with("127_0_0_1_3306_test_inc_"));
        assert_eq!(a.table, BACKUP_TABLE);

        let long = derive_location(&"h".repeat(100), 3306, &"d".repeat(100));
        assert!(long.schema.len() <= 64);
    }

    #[test]
    fn sanitized_collisions_still_differ() {
        let a = derive_location("db-1", 3306, "app");
        let b = derive_location("db_1", 3306, "app");
        let c = derive_location("db.1", 3306, "app");
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
        assert_ne!(
            derive_location("h", 3306, "x"),
            derive_location("h", 3307, "x")
        );
    }
}
