use crate::classify::{name_token, unquote, words};
use crate::error::InceptionError;
use crate::model::quote_ident;
use sqlparser::ast::{self, Statement};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    Unique,
    Plain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexShape {
    /// Empty for the primary key.
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

impl IndexShape {
    /// Reads an index clause such as `UNIQUE KEY uk (a, b)`, `PRIMARY KEY (id)`,
    /// `CONSTRAINT c UNIQUE (a)` or `ADD INDEX idx (c)`.
    pub fn from_text(text: &str) -> Option<Self> {
        let words = words(text);
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let kw = |i: usize| upper.get(i).map(String::as_str).unwrap_or("");
        let mut at = 0;
        if kw(at) == "ADD" {
            at += 1;
        }
        let mut constraint_name = None;
        if kw(at) == "CONSTRAINT" {
            if !matches!(kw(at + 1), "PRIMARY" | "UNIQUE" | "KEY" | "INDEX") {
                constraint_name = words.get(at + 1).map(|w| unquote(&name_token(w)));
                at += 1;
            }
            at += 1;
        }
        let kind = match kw(at) {
            "PRIMARY" => IndexKind::Primary,
            "UNIQUE" => IndexKind::Unique,
            "KEY" | "INDEX" | "FULLTEXT" | "SPATIAL" => IndexKind::Plain,
            _ => return None,
        };
        at += 1;
        while matches!(kw(at), "KEY" | "INDEX") {
            at += 1;
        }
        let name = words
            .get(at)
            .filter(|w| !w.starts_with('(') && !w.eq_ignore_ascii_case("USING"))
            .map(|w| unquote(&name_token(w)))
            .filter(|n| !n.is_empty())
            .or(constraint_name)
            .unwrap_or_default();
        let columns = column_list(text)?;
        let name = if kind == IndexKind::Primary {
            String::new()
        } else if name.is_empty() {
            columns.first().cloned().unwrap_or_default()
        } else {
            name
        };
        Some(Self {
            name,
            kind,
            columns,
        })
    }

    pub fn render(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(",");
        match self.kind {
            IndexKind::Primary => format!("PRIMARY KEY ({cols})"),
            IndexKind::Unique => format!("UNIQUE KEY {} ({cols})", quote_ident(&self.name)),
            IndexKind::Plain => format!("KEY {} ({cols})", quote_ident(&self.name)),
        }
    }
}

fn column_list(text: &str) -> Option<Vec<String>> {
    let open = text.find('(')?;
    let mut depth = 0usize;
    let mut close = None;
    for (i, ch) in text[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    close = Some(open + i);
                    break;
                }
            }
            _ => {}
        }
    }
    let inner = &text[open + 1..close?];
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut cur = String::new();
    for ch in inner.chars() {
        match ch {
            '(' => {
                depth += 1;
                cur.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                cur.push(ch);
            }
            ',' if depth == 0 => out.push(std::mem::take(&mut cur)),
            _ => cur.push(ch),
        }
    }
    out.push(cur);
    let cols: Vec<String> = out
        .iter()
        .filter_map(|piece| piece.split_whitespace().next())
        .map(|w| unquote(&name_token(w)))
        .filter(|n| !n.is_empty())
        .collect();
    (!cols.is_empty()).then_some(cols)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnShape {
    pub name: String,
    /// Full definition starting with the quoted name, e.g. `` `c1` int DEFAULT NULL ``.
    pub definition: String,
    pub has_comment: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableShape {
    pub columns: Vec<ColumnShape>,
    pub indexes: Vec<IndexShape>,
}

impl TableShape {
    pub fn from_parts(columns: &[ast::ColumnDef], constraints: &[ast::TableConstraint]) -> Self {
        let mut shape = TableShape::default();
        for col in columns {
            let name = col.name.value.clone();
            for opt in &col.options {
                match &opt.option {
                    ast::ColumnOption::PrimaryKey(_) => shape.indexes.push(IndexShape {
                        name: String::new(),
                        kind: IndexKind::Primary,
                        columns: vec![name.clone()],
                    }),
                    ast::ColumnOption::Unique(_) => shape.indexes.push(IndexShape {
                        name: name.clone(),
                        kind: IndexKind::Unique,
                        columns: vec![name.clone()],
                    }),
                    _ => {}
                }
            }
            shape.columns.push(column_shape(col));
        }
        for constraint in constraints {
            if let Some(index) = IndexShape::from_text(&constraint.to_string()) {
                shape.indexes.push(index);
            }
        }
        shape
    }

    pub fn parse(create_sql: &str) -> Result<Self, InceptionError> {
        let stmt = parse_single(create_sql)?;
        match &stmt {
            Statement::CreateTable(create) => Ok(Self::from_parts(&create.columns, &create.constraints)),
            _ => Err(InceptionError::Parse(format!(
                "expected CREATE TABLE, got: {create_sql}"
            ))),
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnShape> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Option<&IndexShape> {
        self.indexes.iter().find(|i| i.kind == IndexKind::Primary)
    }

    pub fn index(&self, name: &str) -> Option<&IndexShape> {
        self.indexes
            .iter()
            .find(|i| i.kind != IndexKind::Primary && i.name.eq_ignore_ascii_case(name))
    }
}

/// Column definition rendered without inline key options, which become indexes.
pub fn column_shape(col: &ast::ColumnDef) -> ColumnShape {
    let mut definition = format!("{} {}", quote_ident(&col.name.value), col.data_type);
    let mut has_comment = false;
    for opt in &col.options {
        if matches!(
            opt.option,
            ast::ColumnOption::PrimaryKey(_) | ast::ColumnOption::Unique(_)
        ) {
            continue;
        }
        let text = opt.option.to_string();
        if text.to_ascii_uppercase().starts_with("COMMENT") {
            has_comment = true;
        }
        definition.push(' ');
        definition.push_str(&text);
    }
    ColumnShape {
        name: col.name.value.clone(),
        definition,
        has_comment,
    }
}

pub fn parse_column_def(text: &str) -> Result<ast::ColumnDef, InceptionError> {
    let stmt = parse_single(&format!("CREATE TABLE _shape ({text})"))?;
    match stmt {
        Statement::CreateTable(create) => create
            .columns
            .into_iter()
            .next()
            .ok_or_else(|| InceptionError::Parse(format!("no column definition in: {text}"))),
        _ => Err(InceptionError::Parse(format!(
            "not a column definition: {text}"
        ))),
    }
}

fn parse_single(sql: &str) -> Result<Statement, InceptionError> {
    let mut stmts = Parser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| InceptionError::Parse(e.to_string()))?;
    if stmts.len() != 1 {
        return Err(InceptionError::Parse(format!(
            "expected one statement, found {}",
            stmts.len()
        )));
    }
    Ok(stmts.remove(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_show_create_output() {
        let shape = TableShape::parse(
            "CREATE TABLE `t1` (\n  `id` int NOT NULL AUTO_INCREMENT,\n  `c1` varchar(20) DEFAULT NULL COMMENT 'name',\n  \
             PRIMARY KEY (`id`),\n  UNIQUE KEY `uk_c1` (`c1`),\n  KEY `idx_c1_id` (`c1`,`id`)\n) ENGINE=InnoDB",
        )
        .unwrap();
        assert_eq!(shape.columns.len(), 2);
        assert!(shape.column("C1").unwrap().has_comment);
        assert!(shape.column("c1").unwrap().definition.starts_with("`c1` VARCHAR(20)"));
        assert_eq!(shape.primary_key().unwrap().columns, vec!["id"]);
        assert_eq!(shape.index("uk_c1").unwrap().kind, IndexKind::Unique);
        assert_eq!(shape.index("idx_c1_id").unwrap().columns, vec!["c1", "id"]);
    }

    #[test]
    fn inline_primary_key_becomes_an_index() {
        let shape = TableShape::parse("create table t (id int primary key, a int)").unwrap();
        assert_eq!(shape.primary_key().unwrap().columns, vec!["id"]);
        assert!(!shape.column("id").unwrap().definition.to_ascii_uppercase().contains("PRIMARY"));
    }

    #[test]
    fn index_clauses_render_back() {
        let idx = IndexShape::from_text("ADD INDEX idx_a (a, b)").unwrap();
        assert_eq!(idx.render(), "KEY `idx_a` (`a`,`b`)");
        let pk = IndexShape::from_text("CONSTRAINT pk PRIMARY KEY (id)").unwrap();
        assert_eq!(pk.render(), "PRIMARY KEY (`id`)");
        let uk = IndexShape::from_text("CONSTRAINT uk UNIQUE (a)").unwrap();
        assert_eq!(uk.name, "uk");
        assert_eq!(IndexShape::from_text("FOREIGN KEY (a) REFERENCES t(b)"), None);
    }

    #[test]
    fn standalone_column_definitions_parse() {
        let col = parse_column_def("c2 bigint NOT NULL").unwrap();
        assert_eq!(col.name.value, "c2");
        assert_eq!(column_shape(&col).definition, "`c2` BIGINT NOT NULL");
    }
}
