use sqlparser::ast::Statement;
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

#[derive(Debug, Clone)]
pub struct StatementUnit {
    pub ordinal: usize,
    pub text: String,
    pub statement: Option<Statement>,
    pub parse_error: Option<String>,
}

impl StatementUnit {
    pub fn is_parsed(&self) -> bool {
        self.statement.is_some()
    }
}

/// Splits `script` into statement units, parsing each one on its own.
pub fn split(script: &str) -> Vec<StatementUnit> {
    split_fragments(script)
        .into_iter()
        .enumerate()
        .map(|(i, text)| parse_unit(i + 1, text))
        .collect()
}

fn parse_unit(ordinal: usize, text: String) -> StatementUnit {
    let dialect = MySqlDialect {};
    match Parser::parse_sql(&dialect, &text) {
        Ok(mut statements) if statements.len() == 1 => StatementUnit {
            ordinal,
            text,
            statement: statements.pop(),
            parse_error: None,
        },
        Ok(statements) => StatementUnit {
            ordinal,
            text,
            statement: None,
            parse_error: Some(format!(
                "expected one statement, found {}",
                statements.len()
            )),
        },
        Err(e) => StatementUnit {
            ordinal,
            text,
            statement: None,
            parse_error: Some(e.to_string()),
        },
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    Single,
    Double,
    Backtick,
    LineComment,
    BlockComment,
}

pub fn split_fragments(script: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut state = Scan::Code;
    let mut start = 0usize;
    let mut has_code = false;
    let mut chars = script.char_indices().peekable();

    while let Some((i, ch)) = chars.next() {
        match state {
            Scan::Code => match ch {
                ';' => {
                    if has_code {
                        out.push(script[start..i].trim().to_string());
                    }
                    start = i + 1;
                    has_code = false;
                }
                '\'' => {
                    state = Scan::Single;
                    mark_code(&mut start, &mut has_code, i);
                }
                '"' => {
                    state = Scan::Double;
                    mark_code(&mut start, &mut has_code, i);
                }
                '`' => {
                    state = Scan::Backtick;
                    mark_code(&mut start, &mut has_code, i);
                }
                '#' => state = Scan::LineComment,
                '-' if matches!(chars.peek(), Some((_, '-'))) => {
                    // MySQL needs whitespace (or end of input) after `--`.
                    let rest = &script[i + 2..];
                    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                        chars.next();
                        state = Scan::LineComment;
                    } else {
                        mark_code(&mut start, &mut has_code, i);
                    }
                }
                '/' if matches!(chars.peek(), Some((_, '*'))) => {
                    chars.next();
                    state = Scan::BlockComment;
                }
                c if c.is_whitespace() => {}
                _ => mark_code(&mut start, &mut has_code, i),
            },
            Scan::Single | Scan::Double => {
                let quote = if state == Scan::Single { '\'' } else { '"' };
                if ch == '\\' {
                    chars.next();
                } else if ch == quote {
                    if matches!(chars.peek(), Some((_, c)) if *c == quote) {
                        chars.next();
                    } else {
                        state = Scan::Code;
                    }
                }
            }
            Scan::Backtick => {
                if ch == '`' {
                    if matches!(chars.peek(), Some((_, '`'))) {
                        chars.next();
                    } else {
                        state = Scan::Code;
                    }
                }
            }
            Scan::LineComment => {
                if ch == '\n' {
                    state = Scan::Code;
                }
            }
            Scan::BlockComment => {
                if ch == '*' && matches!(chars.peek(), Some((_, '/'))) {
                    chars.next();
                    state = Scan::Code;
                }
            }
        }
    }

    if has_code {
        let tail = script[start..].trim();
        if !tail.is_empty() {
            out.push(tail.to_string());
        }
    }
    out
}

fn mark_code(start: &mut usize, has_code: &mut bool, at: usize) {
    if !*has_code {
        *start = at;
        *has_code = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_top_level_semicolons_only() {
        let frags = split_fragments(
            "insert into t values('a;b'); update t set c=\"x;\" where id=1;\nselect `we;ird` from t",
        );
        assert_eq!(
            frags,
            vec![
                "insert into t values('a;b')",
                "update t set c=\"x;\" where id=1",
                "select `we;ird` from t",
            ]
        );
    }

    #[test]
    fn comments_hide_semicolons_and_comment_only_fragments_vanish() {
        let frags = split_fragments(
            "-- leading; comment\nselect 1; /* block ; */ ;\n# hash;\nselect 2;",
        );
        assert_eq!(frags, vec!["select 1", "select 2"]);
    }

    #[test]
    fn escaped_and_doubled_quotes_stay_inside_strings() {
        let frags = split_fragments(r"insert into t values('it\'s;'), ('a''b;c'); select 1");
        assert_eq!(frags.len(), 2);
        assert!(frags[0].ends_with("('a''b;c')"));
    }

    #[test]
    fn double_dash_without_space_is_not_a_comment() {
        let frags = split_fragments("update t set a=a--1 where id=1; select 1");
        assert_eq!(frags.len(), 2);
    }

    #[test]
    fn unparsable_fragment_still_yields_a_unit() {
        let units = split("insert into t1 values(1); this is not sql; delete from t1 where id=1");
        assert_eq!(units.len(), 3);
        assert!(units[0].is_parsed());
        assert!(units[1].parse_error.is_some());
        assert!(units[2].is_parsed());
        assert_eq!(
            units.iter().map(|u| u.ordinal).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn splitting_is_idempotent() {
        let script = "create table t(id int primary key); insert into t values(1);";
        let once = split_fragments(script);
        let again = split_fragments(&once.join(";\n"));
        assert_eq!(once, again);
    }
}
