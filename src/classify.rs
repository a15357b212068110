use crate::split::StatementUnit;
use serde::Serialize;
use sqlparser::ast::{
    self, AlterTableOperation, FromTable, ObjectName, ObjectNamePart, ObjectType, SetExpr,
    Statement, TableFactor, TableObject, TableWithJoins,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatementKind {
    Use,
    Set,
    Insert,
    Update,
    Delete,
    Select,
    Show,
    CreateTable,
    AlterTable,
    DropTable,
    RenameTable,
    Truncate,
    CreateIndex,
    DropIndex,
    CreateDatabase,
    DropDatabase,
    Transaction,
    Unsupported,
    Invalid,
}

impl StatementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StatementKind::Use => "use",
            StatementKind::Set => "set",
            StatementKind::Insert => "insert",
            StatementKind::Update => "update",
            StatementKind::Delete => "delete",
            StatementKind::Select => "select",
            StatementKind::Show => "show",
            StatementKind::CreateTable => "create table",
            StatementKind::AlterTable => "alter table",
            StatementKind::DropTable => "drop table",
            StatementKind::RenameTable => "rename table",
            StatementKind::Truncate => "truncate",
            StatementKind::CreateIndex => "create index",
            StatementKind::DropIndex => "drop index",
            StatementKind::CreateDatabase => "create database",
            StatementKind::DropDatabase => "drop database",
            StatementKind::Transaction => "transaction control",
            StatementKind::Unsupported => "unsupported",
            StatementKind::Invalid => "invalid",
        }
    }

    pub fn is_dml(self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }

    /// Schema changes: each one commits implicitly and runs alone.
    pub fn is_ddl(self) -> bool {
        matches!(
            self,
            StatementKind::CreateTable
                | StatementKind::AlterTable
                | StatementKind::DropTable
                | StatementKind::RenameTable
                | StatementKind::Truncate
                | StatementKind::CreateIndex
                | StatementKind::DropIndex
                | StatementKind::CreateDatabase
                | StatementKind::DropDatabase
        )
    }

    /// Statements that address a table and therefore need a database.
    pub fn needs_table(self) -> bool {
        self.is_dml()
            || matches!(
                self,
                StatementKind::CreateTable
                    | StatementKind::AlterTable
                    | StatementKind::DropTable
                    | StatementKind::RenameTable
                    | StatementKind::Truncate
                    | StatementKind::CreateIndex
                    | StatementKind::DropIndex
            )
    }
}

/// One sub-operation of an ALTER TABLE. Names keep the quoting they were written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlterAction {
    AddColumn(String),
    DropColumn(String),
    ModifyColumn(String),
    ChangeColumn { old: String, new: String },
    RenameColumn { old: String, new: String },
    AddIndex(Option<String>),
    AddPrimaryKey,
    DropIndex(String),
    DropPrimaryKey,
    RenameTable(String),
    ConvertCharset,
    TableOption(String),
    Other(String),
}

impl AlterAction {
    pub fn from_operation(op: &AlterTableOperation) -> Self {
        match op {
            AlterTableOperation::AddColumn { column_def, .. } => {
                AlterAction::AddColumn(column_def.name.to_string())
            }
            _ => Self::from_text(&op.to_string()),
        }
    }

    fn from_text(text: &str) -> Self {
        let words = words(text);
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let kw = |i: usize| upper.get(i).map(String::as_str).unwrap_or("");
        let word = |i: usize| words.get(i).map(|w| name_token(w)).unwrap_or_default();
        let other = || AlterAction::Other(text.to_string());

        match kw(0) {
            "ADD" => match kw(1) {
                "COLUMN" => {
                    let at = if kw(2) == "IF" { 5 } else { 2 };
                    AlterAction::AddColumn(word(at))
                }
                "PRIMARY" => AlterAction::AddPrimaryKey,
                "CONSTRAINT" => match kw(3) {
                    "PRIMARY" => AlterAction::AddPrimaryKey,
                    "UNIQUE" | "INDEX" | "KEY" => AlterAction::AddIndex(Some(word(2))),
                    _ => other(),
                },
                "UNIQUE" | "INDEX" | "KEY" | "FULLTEXT" | "SPATIAL" => {
                    let mut at = 2;
                    while matches!(kw(at), "INDEX" | "KEY") {
                        at += 1;
                    }
                    let name = words
                        .get(at)
                        .filter(|w| !w.starts_with('('))
                        .map(|w| name_token(w))
                        .filter(|n| !n.is_empty());
                    AlterAction::AddIndex(name)
                }
                "FOREIGN" | "CHECK" | "" => other(),
                _ => AlterAction::AddColumn(word(1)),
            },
            "DROP" => match kw(1) {
                "PRIMARY" => AlterAction::DropPrimaryKey,
                "INDEX" | "KEY" => AlterAction::DropIndex(word(2)),
                "CONSTRAINT" | "FOREIGN" | "CHECK" | "" => other(),
                "COLUMN" => {
                    let at = if kw(2) == "IF" { 4 } else { 2 };
                    AlterAction::DropColumn(word(at))
                }
                "IF" => AlterAction::DropColumn(word(3)),
                _ => AlterAction::DropColumn(word(1)),
            },
            "MODIFY" => {
                let at = if kw(1) == "COLUMN" { 2 } else { 1 };
                AlterAction::ModifyColumn(word(at))
            }
            "CHANGE" => {
                let at = if kw(1) == "COLUMN" { 2 } else { 1 };
                AlterAction::ChangeColumn {
                    old: word(at),
                    new: word(at + 1),
                }
            }
            "RENAME" => match kw(1) {
                "COLUMN" if kw(3) == "TO" => AlterAction::RenameColumn {
                    old: word(2),
                    new: word(4),
                },
                "TO" | "AS" => AlterAction::RenameTable(word(2)),
                "INDEX" | "KEY" | "COLUMN" | "" => other(),
                _ => AlterAction::RenameTable(word(1)),
            },
            "CONVERT" => AlterAction::ConvertCharset,
            first => {
                let option = first.split('=').next().unwrap_or("");
                if matches!(
                    option,
                    "ENGINE"
                        | "AUTO_INCREMENT"
                        | "COMMENT"
                        | "CHARSET"
                        | "CHARACTER"
                        | "DEFAULT"
                        | "COLLATE"
                        | "ROW_FORMAT"
                        | "ALGORITHM"
                        | "LOCK"
                ) {
                    AlterAction::TableOption(text.to_string())
                } else {
                    other()
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub kind: StatementKind,
    /// Explicit database: a `db.` qualifier, the USE target, or the database
    /// a CREATE/DROP DATABASE names.
    pub db: Option<String>,
    /// Empty when the target cannot be resolved unambiguously.
    pub table: String,
    pub actions: Vec<AlterAction>,
}

impl Target {
    fn new(kind: StatementKind) -> Self {
        Self {
            kind,
            db: None,
            table: String::new(),
            actions: Vec::new(),
        }
    }

    fn with_table(kind: StatementKind, (db, table): (Option<String>, String)) -> Self {
        Self {
            kind,
            db,
            table,
            actions: Vec::new(),
        }
    }
}

pub fn classify_unit(unit: &StatementUnit) -> Target {
    match &unit.statement {
        Some(stmt) => classify(stmt),
        None => Target::new(StatementKind::Invalid),
    }
}

pub fn classify(stmt: &Statement) -> Target {
    match stmt {
        Statement::Use(use_stmt) => {
            let mut target = Target::new(StatementKind::Use);
            if let ast::Use::Object(name) | ast::Use::Database(name) = use_stmt {
                target.db = last_part(name);
            }
            target
        }
        Statement::Set(_) => Target::new(StatementKind::Set),
        Statement::Insert(insert) => match &insert.table {
            TableObject::TableName(name) => {
                Target::with_table(StatementKind::Insert, object_name_to_parts(name))
            }
            _ => Target::new(StatementKind::Insert),
        },
        Statement::Update(update) => {
            // Joined and multi-table updates stay unresolved.
            if !update.table.joins.is_empty() || update.from.is_some() {
                return Target::new(StatementKind::Update);
            }
            match single_table(&update.table.relation) {
                Some(parts) => Target::with_table(StatementKind::Update, parts),
                None => Target::new(StatementKind::Update),
            }
        }
        Statement::Delete(delete) => {
            let from = match &delete.from {
                FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
            };
            let multi = !delete.tables.is_empty()
                || delete.using.is_some()
                || from.len() != 1
                || from.iter().any(|t| !t.joins.is_empty());
            let parts = if multi {
                from.first().and_then(leftmost_table)
            } else {
                from.first().and_then(|t| single_table(&t.relation))
            };
            match parts {
                Some(parts) => Target::with_table(StatementKind::Delete, parts),
                None => Target::new(StatementKind::Delete),
            }
        }
        Statement::Query(query) => match leftmost_query(query) {
            Some(parts) => Target::with_table(StatementKind::Select, parts),
            None => Target::new(StatementKind::Select),
        },
        Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowDatabases { .. }
        | Statement::ShowVariables { .. }
        | Statement::ExplainTable { .. }
        | Statement::Explain { .. } => Target::new(StatementKind::Show),
        Statement::CreateTable(create) => {
            Target::with_table(StatementKind::CreateTable, object_name_to_parts(&create.name))
        }
        Statement::AlterTable(alter) => {
            let mut target =
                Target::with_table(StatementKind::AlterTable, object_name_to_parts(&alter.name));
            target.actions = alter
                .operations
                .iter()
                .map(AlterAction::from_operation)
                .collect();
            target
        }
        Statement::Drop {
            object_type, names, ..
        } => match object_type {
            ObjectType::Table => match names.first() {
                Some(name) => {
                    Target::with_table(StatementKind::DropTable, object_name_to_parts(name))
                }
                None => Target::new(StatementKind::DropTable),
            },
            ObjectType::Index => {
                let text = stmt.to_string();
                let mut target = match table_after_on(&text) {
                    Some(parts) => Target::with_table(StatementKind::DropIndex, parts),
                    None => Target::new(StatementKind::DropIndex),
                };
                if let Some(name) = names.first() {
                    target.actions = vec![AlterAction::DropIndex(name.to_string())];
                }
                target
            }
            ObjectType::Database | ObjectType::Schema => {
                let mut target = Target::new(StatementKind::DropDatabase);
                target.db = names.first().and_then(last_part);
                target
            }
            _ => Target::new(StatementKind::Unsupported),
        },
        Statement::RenameTable(renames) => match renames.first() {
            Some(rename) => Target::with_table(
                StatementKind::RenameTable,
                object_name_to_parts(&rename.old_name),
            ),
            None => Target::new(StatementKind::RenameTable),
        },
        Statement::CreateIndex(create) => {
            let mut target = Target::with_table(
                StatementKind::CreateIndex,
                object_name_to_parts(&create.table_name),
            );
            target.actions = vec![AlterAction::AddIndex(
                create.name.as_ref().map(|n| n.to_string()),
            )];
            target
        }
        Statement::CreateDatabase { db_name, .. } => {
            let mut target = Target::new(StatementKind::CreateDatabase);
            target.db = last_part(db_name);
            target
        }
        Statement::StartTransaction { .. }
        | Statement::Commit { .. }
        | Statement::Rollback { .. }
        | Statement::Savepoint { .. }
        | Statement::ReleaseSavepoint { .. } => Target::new(StatementKind::Transaction),
        Statement::Truncate(truncate) => match truncate.table_names.as_slice() {
            [only] => Target::with_table(StatementKind::Truncate, object_name_to_parts(&only.name)),
            _ => Target::new(StatementKind::Truncate),
        },
        _ => Target::new(StatementKind::Unsupported),
    }
}

pub fn get_ident_name(part: &ObjectNamePart) -> String {
    match part {
        ObjectNamePart::Identifier(i) => i.value.clone(),
        _ => String::new(),
    }
}

pub fn object_name_to_parts(name: &ObjectName) -> (Option<String>, String) {
    let parts: Vec<String> = name.0.iter().map(get_ident_name).collect();
    match parts.as_slice() {
        [] => (None, String::new()),
        [table] => (None, table.clone()),
        [.., db, table] => (Some(db.clone()), table.clone()),
    }
}

fn last_part(name: &ObjectName) -> Option<String> {
    name.0.last().map(get_ident_name).filter(|s| !s.is_empty())
}

fn single_table(factor: &TableFactor) -> Option<(Option<String>, String)> {
    match factor {
        TableFactor::Table { name, alias, .. } if alias.is_none() => {
            Some(object_name_to_parts(name))
        }
        _ => None,
    }
}

/// Left-most table of a join tree, descending through nested joins and
/// derived tables. UNIONs and aliased tables have no unambiguous answer.
pub fn leftmost_table(twj: &TableWithJoins) -> Option<(Option<String>, String)> {
    leftmost_factor(&twj.relation)
}

fn leftmost_factor(factor: &TableFactor) -> Option<(Option<String>, String)> {
    match factor {
        TableFactor::Table { .. } => single_table(factor),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => leftmost_table(table_with_joins),
        TableFactor::Derived { subquery, .. } => leftmost_query(subquery),
        _ => None,
    }
}

fn leftmost_query(query: &ast::Query) -> Option<(Option<String>, String)> {
    leftmost_set_expr(&query.body)
}

fn leftmost_set_expr(body: &SetExpr) -> Option<(Option<String>, String)> {
    match body {
        SetExpr::Select(select) => select.from.first().and_then(leftmost_table),
        SetExpr::Query(query) => leftmost_query(query),
        _ => None,
    }
}

pub(crate) fn words(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    for ch in text.chars() {
        match quote {
            Some(q) => {
                cur.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None if ch == '`' || ch == '"' || ch == '\'' => {
                quote = Some(ch);
                cur.push(ch);
            }
            None if ch.is_whitespace() => {
                if !cur.is_empty() {
                    out.push(std::mem::take(&mut cur));
                }
            }
            None => cur.push(ch),
        }
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

/// Trims list punctuation and a trailing column list from a name word.
pub(crate) fn name_token(word: &str) -> String {
    let mut end = word.len();
    let mut in_quote = false;
    for (i, ch) in word.char_indices() {
        match ch {
            '`' | '"' => in_quote = !in_quote,
            '(' | ',' | ';' if !in_quote => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    word[..end].to_string()
}

pub fn unquote(name: &str) -> String {
    let trimmed = name.trim();
    for q in ['`', '"'] {
        if trimmed.len() >= 2 && trimmed.starts_with(q) && trimmed.ends_with(q) {
            let doubled = format!("{q}{q}");
            return trimmed[1..trimmed.len() - 1].replace(&doubled, &q.to_string());
        }
    }
    trimmed.to_string()
}

/// Parses a possibly qualified, possibly quoted name such as `` `db`.`t` ``.
pub fn parse_name_text(text: &str) -> (Option<String>, String) {
    let mut parts = Vec::new();
    let mut cur = String::new();
    let mut in_quote = false;
    for ch in text.chars() {
        match ch {
            '`' | '"' => {
                in_quote = !in_quote;
                cur.push(ch);
            }
            '.' if !in_quote => parts.push(unquote(&std::mem::take(&mut cur))),
            _ => cur.push(ch),
        }
    }
    parts.push(unquote(&cur));
    match parts.as_slice() {
        [.., db, table] => (Some(db.clone()), table.clone()),
        [table] => (None, table.clone()),
        [] => (None, String::new()),
    }
}

pub(crate) fn table_text_after_on(text: &str) -> Option<String> {
    let words = words(text);
    let pos = words.iter().position(|w| w.eq_ignore_ascii_case("ON"))?;
    let name = name_token(words.get(pos + 1)?);
    (!name.is_empty()).then_some(name)
}

fn table_after_on(text: &str) -> Option<(Option<String>, String)> {
    table_text_after_on(text).map(|name| parse_name_text(&name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::split::split;

    fn target_of(sql: &str) -> Target {
        let units = split(sql);
        assert_eq!(units.len(), 1, "{sql}");
        assert!(units[0].is_parsed(), "{sql}: {:?}", units[0].parse_error);
        classify_unit(&units[0])
    }

    #[test]
    fn dml_targets() {
        let t = target_of("insert into test_inc.t1(id) values(1)");
        assert_eq!(t.kind, StatementKind::Insert);
        assert_eq!(t.db.as_deref(), Some("test_inc"));
        assert_eq!(t.table, "t1");

        let t = target_of("update t1 set c1 = 1 where id = 1");
        assert_eq!((t.kind, t.table.as_str()), (StatementKind::Update, "t1"));

        let t = target_of("delete from t1 where id = 1");
        assert_eq!((t.kind, t.table.as_str()), (StatementKind::Delete, "t1"));
    }

    #[test]
    fn aliased_and_joined_updates_are_unresolved() {
        let t = target_of("update t1 a set a.c1 = 1 where a.id = 1");
        assert_eq!(t.kind, StatementKind::Update);
        assert!(t.table.is_empty());

        let t = target_of("update t1 join t2 on t1.id = t2.id set t1.c1 = t2.c1");
        assert!(t.table.is_empty());
    }

    #[test]
    fn multi_table_delete_resolves_leftmost() {
        let t = target_of("delete t1 from t1 join t2 on t1.id = t2.id where t2.c1 = 1");
        assert_eq!(t.kind, StatementKind::Delete);
        assert_eq!(t.table, "t1");

        let t = target_of("delete a from t1 a join t2 b on a.id = b.id");
        assert!(t.table.is_empty());
    }

    #[test]
    fn leftmost_descends_into_derived_tables_but_not_unions() {
        let t = target_of("select * from (select * from t3) x join t4 on x.id = t4.id");
        assert_eq!(t.table, "t3");

        let t = target_of("select * from (select id from t3 union select id from t4) x");
        assert!(t.table.is_empty());
    }

    #[test]
    fn ddl_kinds() {
        assert_eq!(
            target_of("create table t1(id int primary key)").kind,
            StatementKind::CreateTable
        );
        let t = target_of("drop table if exists db1.t1");
        assert_eq!(t.kind, StatementKind::DropTable);
        assert_eq!(t.db.as_deref(), Some("db1"));
        assert_eq!(target_of("truncate table t9").table, "t9");
        let t = target_of("truncate `db2`.`t9`");
        assert_eq!(t.kind, StatementKind::Truncate);
        assert_eq!((t.db.as_deref(), t.table.as_str()), (Some("db2"), "t9"));
        assert_eq!(target_of("rename table t1 to t2").table, "t1");
        let t = target_of("create index idx_c1 on t1(c1)");
        assert_eq!(t.kind, StatementKind::CreateIndex);
        assert_eq!(t.table, "t1");
        let t = target_of("create database if not exists d1");
        assert_eq!(t.db.as_deref(), Some("d1"));
        let t = target_of("drop database d1");
        assert_eq!(t.kind, StatementKind::DropDatabase);
        assert_eq!(target_of("use test_inc").db.as_deref(), Some("test_inc"));
    }

    #[test]
    fn transaction_control_is_its_own_kind() {
        assert_eq!(target_of("begin").kind, StatementKind::Transaction);
        assert_eq!(target_of("commit").kind, StatementKind::Transaction);
    }

    #[test]
    fn alter_actions_decompose() {
        let t = target_of(
            "alter table t1 add column c2 int, drop column c3, modify column c4 bigint, \
             add index idx_c2 (c2)",
        );
        assert_eq!(t.kind, StatementKind::AlterTable);
        assert_eq!(
            t.actions,
            vec![
                AlterAction::AddColumn("c2".into()),
                AlterAction::DropColumn("c3".into()),
                AlterAction::ModifyColumn("c4".into()),
                AlterAction::AddIndex(Some("idx_c2".into())),
            ]
        );
    }

    #[test]
    fn alter_rename_and_drop_index() {
        let t = target_of("alter table t1 drop index idx_old");
        assert_eq!(t.actions, vec![AlterAction::DropIndex("idx_old".into())]);
        let t = target_of("alter table t1 rename to t9");
        assert_eq!(t.actions, vec![AlterAction::RenameTable("t9".into())]);
    }

    #[test]
    fn text_forms_of_alter_actions() {
        assert_eq!(
            AlterAction::from_text("CHANGE COLUMN a b INT"),
            AlterAction::ChangeColumn {
                old: "a".into(),
                new: "b".into()
            }
        );
        assert_eq!(
            AlterAction::from_text("DROP PRIMARY KEY"),
            AlterAction::DropPrimaryKey
        );
        assert_eq!(
            AlterAction::from_text("ADD UNIQUE INDEX `uk` (`a`)"),
            AlterAction::AddIndex(Some("`uk`".into()))
        );
        assert!(matches!(
            AlterAction::from_text("ENGINE=InnoDB"),
            AlterAction::TableOption(_)
        ));
    }

    #[test]
    fn name_text_parsing() {
        assert_eq!(
            parse_name_text("`db`.`my t`"),
            (Some("db".into()), "my t".into())
        );
        assert_eq!(parse_name_text("t1"), (None, "t1".into()));
    }
}
