use crate::error::InceptionError;
use crate::model::{Cell, SqlType};
use sqlparser::ast;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Lower-cased column reference (`col`, `table.col`, `alias.col`) to row position.
pub type ColMap = HashMap<String, usize>;

pub fn parse_sql_number_literal(n: &str) -> Result<Cell, InceptionError> {
    let is_float = n.contains('.') || n.contains('e') || n.contains('E');
    if is_float {
        let v = n
            .parse::<f64>()
            .map_err(|_| InceptionError::Invalid(format!("Invalid number literal: {n}")))?;
        Ok(Cell::Float(v))
    } else {
        let v = n
            .parse::<i64>()
            .map_err(|_| InceptionError::Invalid(format!("Invalid integer literal: {n}")))?;
        Ok(Cell::Int(v))
    }
}

fn value_cell(value: &ast::Value) -> Result<Cell, InceptionError> {
    match value {
        ast::Value::Number(n, _) => parse_sql_number_literal(n),
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Ok(Cell::Text(s.clone()))
        }
        ast::Value::Boolean(b) => Ok(Cell::Int(i64::from(*b))),
        ast::Value::Null => Ok(Cell::Null),
        _ => Err(InceptionError::NotSupported(format!(
            "Value type not supported: {value}"
        ))),
    }
}

pub fn is_constant(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::Value(_) => true,
        ast::Expr::Nested(inner) => is_constant(inner),
        ast::Expr::UnaryOp { op, expr } => {
            matches!(op, ast::UnaryOperator::Minus | ast::UnaryOperator::Plus) && is_constant(expr)
        }
        ast::Expr::BinaryOp { left, op, right } => {
            matches!(
                op,
                ast::BinaryOperator::Plus
                    | ast::BinaryOperator::Minus
                    | ast::BinaryOperator::Multiply
                    | ast::BinaryOperator::Divide
            ) && is_constant(left)
                && is_constant(right)
        }
        _ => false,
    }
}

/// Value of a constant expression, `None` when it depends on row or server state.
pub fn literal(expr: &ast::Expr) -> Option<Cell> {
    if !is_constant(expr) {
        return None;
    }
    eval_expr(expr, &[], &ColMap::new()).ok()
}

fn lookup(name: &str, row: &[Cell], cols: &ColMap) -> Result<Cell, InceptionError> {
    let idx = cols
        .get(&name.to_ascii_lowercase())
        .ok_or_else(|| InceptionError::Invalid(format!("Unknown column '{name}'")))?;
    Ok(row.get(*idx).cloned().unwrap_or(Cell::Null))
}

pub fn eval_expr(expr: &ast::Expr, row: &[Cell], cols: &ColMap) -> Result<Cell, InceptionError> {
    match expr {
        ast::Expr::Nested(inner) => eval_expr(inner, row, cols),
        ast::Expr::Value(v) => value_cell(&v.value),
        ast::Expr::Identifier(ident) => lookup(&ident.value, row, cols),
        ast::Expr::CompoundIdentifier(ids) => {
            let full = ids
                .iter()
                .map(|i| i.value.clone())
                .collect::<Vec<_>>()
                .join(".");
            if let Ok(v) = lookup(&full, row, cols) {
                return Ok(v);
            }
            let last = ids
                .last()
                .ok_or_else(|| InceptionError::Invalid("empty identifier".into()))?;
            lookup(&last.value, row, cols)
        }
        ast::Expr::UnaryOp { op, expr } => {
            let v = eval_expr(expr, row, cols)?;
            match (op, v) {
                (ast::UnaryOperator::Plus, v) => Ok(v),
                (ast::UnaryOperator::Minus, Cell::Int(i)) => Ok(Cell::Int(-i)),
                (ast::UnaryOperator::Minus, Cell::Float(f)) => Ok(Cell::Float(-f)),
                (ast::UnaryOperator::Minus, Cell::Null) => Ok(Cell::Null),
                (op, v) => Err(InceptionError::NotSupported(format!(
                    "Unary operator {op} on {v}"
                ))),
            }
        }
        ast::Expr::BinaryOp { left, op, right }
            if matches!(
                op,
                ast::BinaryOperator::Plus
                    | ast::BinaryOperator::Minus
                    | ast::BinaryOperator::Multiply
                    | ast::BinaryOperator::Divide
            ) =>
        {
            let l = eval_expr(left, row, cols)?;
            let r = eval_expr(right, row, cols)?;
            arithmetic(op, &l, &r)
        }
        ast::Expr::Function(f) => {
            let name = f.name.to_string().to_ascii_lowercase();
            match name.as_str() {
                "now" | "current_timestamp" | "sysdate" => Ok(Cell::Text(
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                )),
                "curdate" | "current_date" => Ok(Cell::Text(
                    chrono::Local::now().format("%Y-%m-%d").to_string(),
                )),
                _ => Err(InceptionError::NotSupported(format!(
                    "Function not supported in expressions: {}",
                    f.name
                ))),
            }
        }
        _ => Err(InceptionError::NotSupported(format!(
            "Expr not supported: {expr}"
        ))),
    }
}

fn arithmetic(op: &ast::BinaryOperator, l: &Cell, r: &Cell) -> Result<Cell, InceptionError> {
    if l.is_null() || r.is_null() {
        return Ok(Cell::Null);
    }
    if let (Some(a), Some(b), ast::BinaryOperator::Plus | ast::BinaryOperator::Minus | ast::BinaryOperator::Multiply) =
        (int_of(l), int_of(r), op)
    {
        let v = match op {
            ast::BinaryOperator::Plus => a.checked_add(b),
            ast::BinaryOperator::Minus => a.checked_sub(b),
            _ => a.checked_mul(b),
        };
        return v
            .map(Cell::Int)
            .ok_or_else(|| InceptionError::Invalid("BIGINT value is out of range".into()));
    }
    let (Some(a), Some(b)) = (num_of(l), num_of(r)) else {
        return Err(InceptionError::Invalid(format!(
            "Non-numeric operands for {op}: {l}, {r}"
        )));
    };
    Ok(match op {
        ast::BinaryOperator::Plus => Cell::Float(a + b),
        ast::BinaryOperator::Minus => Cell::Float(a - b),
        ast::BinaryOperator::Multiply => Cell::Float(a * b),
        _ if b == 0.0 => Cell::Null,
        _ => Cell::Float(a / b),
    })
}

fn int_of(c: &Cell) -> Option<i64> {
    match c {
        Cell::Int(i) => Some(*i),
        _ => None,
    }
}

fn num_of(c: &Cell) -> Option<f64> {
    match c {
        Cell::Text(s) => s.trim().parse().ok(),
        other => other.as_f64(),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum TriBool {
    True,
    False,
    Unknown,
}

impl TriBool {
    fn from_bool(b: bool) -> Self {
        if b {
            TriBool::True
        } else {
            TriBool::False
        }
    }

    fn and(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::False, _) | (_, TriBool::False) => TriBool::False,
            (TriBool::True, b) => b,
            (TriBool::Unknown, _) => TriBool::Unknown,
        }
    }

    fn or(self, other: TriBool) -> TriBool {
        match (self, other) {
            (TriBool::True, _) | (_, TriBool::True) => TriBool::True,
            (TriBool::False, b) => b,
            (TriBool::Unknown, _) => TriBool::Unknown,
        }
    }

    fn not(self) -> TriBool {
        match self {
            TriBool::True => TriBool::False,
            TriBool::False => TriBool::True,
            TriBool::Unknown => TriBool::Unknown,
        }
    }
}

/// WHERE semantics: only a definite TRUE selects the row.
pub fn eval_condition(
    expr: &ast::Expr,
    row: &[Cell],
    cols: &ColMap,
) -> Result<bool, InceptionError> {
    Ok(eval_tri(expr, row, cols)? == TriBool::True)
}

fn eval_tri(expr: &ast::Expr, row: &[Cell], cols: &ColMap) -> Result<TriBool, InceptionError> {
    match expr {
        ast::Expr::Nested(inner) => eval_tri(inner, row, cols),
        ast::Expr::BinaryOp { left, op, right } => {
            let cmp = match op {
                ast::BinaryOperator::And => {
                    return Ok(eval_tri(left, row, cols)?.and(eval_tri(right, row, cols)?));
                }
                ast::BinaryOperator::Or => {
                    return Ok(eval_tri(left, row, cols)?.or(eval_tri(right, row, cols)?));
                }
                ast::BinaryOperator::Eq
                | ast::BinaryOperator::NotEq
                | ast::BinaryOperator::Gt
                | ast::BinaryOperator::Lt
                | ast::BinaryOperator::GtEq
                | ast::BinaryOperator::LtEq => op,
                _ => {
                    let v = eval_expr(expr, row, cols)?;
                    return Ok(truthy(&v));
                }
            };
            let l = eval_expr(left, row, cols)?;
            let r = eval_expr(right, row, cols)?;
            if l.is_null() || r.is_null() {
                return Ok(TriBool::Unknown);
            }
            let ord = compare_cells(&l, &r);
            Ok(TriBool::from_bool(match cmp {
                ast::BinaryOperator::Eq => ord == Ordering::Equal,
                ast::BinaryOperator::NotEq => ord != Ordering::Equal,
                ast::BinaryOperator::Gt => ord == Ordering::Greater,
                ast::BinaryOperator::Lt => ord == Ordering::Less,
                ast::BinaryOperator::GtEq => ord != Ordering::Less,
                _ => ord != Ordering::Greater,
            }))
        }
        ast::Expr::UnaryOp {
            op: ast::UnaryOperator::Not,
            expr,
        } => Ok(eval_tri(expr, row, cols)?.not()),
        ast::Expr::IsNull(inner) => Ok(TriBool::from_bool(eval_expr(inner, row, cols)?.is_null())),
        ast::Expr::IsNotNull(inner) => {
            Ok(TriBool::from_bool(!eval_expr(inner, row, cols)?.is_null()))
        }
        ast::Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval_expr(expr, row, cols)?;
            if needle.is_null() {
                return Ok(TriBool::Unknown);
            }
            let mut has_null = false;
            for item in list {
                let v = eval_expr(item, row, cols)?;
                if v.is_null() {
                    has_null = true;
                    continue;
                }
                if compare_cells(&needle, &v) == Ordering::Equal {
                    return Ok(TriBool::from_bool(!*negated));
                }
            }
            let base = if has_null {
                TriBool::Unknown
            } else {
                TriBool::False
            };
            Ok(if *negated { base.not() } else { base })
        }
        ast::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            let v = eval_expr(expr, row, cols)?;
            let lo = eval_expr(low, row, cols)?;
            let hi = eval_expr(high, row, cols)?;
            if v.is_null() || lo.is_null() || hi.is_null() {
                return Ok(TriBool::Unknown);
            }
            let inside = compare_cells(&v, &lo) != Ordering::Less
                && compare_cells(&v, &hi) != Ordering::Greater;
            let base = TriBool::from_bool(inside);
            Ok(if *negated { base.not() } else { base })
        }
        ast::Expr::Like {
            negated,
            any,
            expr,
            pattern,
            escape_char,
        } => {
            if *any {
                return Err(InceptionError::NotSupported(
                    "LIKE ANY(...) is not supported".into(),
                ));
            }
            let v = eval_expr(expr, row, cols)?;
            let pat = eval_expr(pattern, row, cols)?;
            if v.is_null() || pat.is_null() {
                return Ok(TriBool::Unknown);
            }
            let escape = like_escape_char(escape_char.as_ref())?;
            // MySQL's default collations compare case-insensitively.
            let ok = sql_like_matches(
                &v.to_string().to_lowercase(),
                &pat.to_string().to_lowercase(),
                escape,
            );
            let base = TriBool::from_bool(ok);
            Ok(if *negated { base.not() } else { base })
        }
        other => Ok(truthy(&eval_expr(other, row, cols)?)),
    }
}

fn truthy(v: &Cell) -> TriBool {
    match v {
        Cell::Null => TriBool::Unknown,
        Cell::Int(i) => TriBool::from_bool(*i != 0),
        Cell::Float(f) => TriBool::from_bool(*f != 0.0),
        Cell::Text(s) => TriBool::from_bool(s.trim().parse::<f64>().map(|f| f != 0.0).unwrap_or(false)),
        Cell::Bytes(b) => TriBool::from_bool(!b.is_empty()),
    }
}

fn like_escape_char(escape_char: Option<&ast::Value>) -> Result<char, InceptionError> {
    let Some(v) = escape_char else {
        return Ok('\\');
    };
    let s = match v {
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => s.as_str(),
        _ => {
            return Err(InceptionError::NotSupported(
                "ESCAPE value must be a quoted string".into(),
            ))
        }
    };
    let mut chars = s.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) => Ok(ch),
        _ => Err(InceptionError::Invalid(
            "ESCAPE string must be a single character".into(),
        )),
    }
}

pub fn like_matches(text: &str, pattern: &str) -> bool {
    sql_like_matches(&text.to_lowercase(), &pattern.to_lowercase(), '\\')
}

fn sql_like_matches(text: &str, pattern: &str, escape: char) -> bool {
    let t: Vec<char> = text.chars().collect();
    let p: Vec<char> = pattern.chars().collect();

    let mut ti = 0usize;
    let mut pi = 0usize;
    let mut star_pi: Option<usize> = None;
    let mut star_ti = 0usize;

    while ti < t.len() {
        if pi < p.len() {
            let pc = p[pi];
            if pc == '%' {
                star_pi = Some(pi);
                pi += 1;
                while pi < p.len() && p[pi] == '%' {
                    pi += 1;
                }
                star_ti = ti;
                continue;
            }
            if pc == escape && pi + 1 < p.len() {
                if p[pi + 1] == t[ti] {
                    pi += 2;
                    ti += 1;
                    continue;
                }
            } else if pc == '_' || pc == t[ti] {
                pi += 1;
                ti += 1;
                continue;
            }
        }

        if let Some(star_pos) = star_pi {
            star_ti += 1;
            ti = star_ti;
            pi = star_pos + 1;
            continue;
        }
        return false;
    }

    while pi < p.len() && p[pi] == '%' {
        pi += 1;
    }
    pi == p.len()
}

pub fn compare_cells(a: &Cell, b: &Cell) -> Ordering {
    match (a, b) {
        (Cell::Int(x), Cell::Int(y)) => x.cmp(y),
        (Cell::Null, Cell::Null) => Ordering::Equal,
        (Cell::Null, _) => Ordering::Less,
        (_, Cell::Null) => Ordering::Greater,
        (Cell::Text(x), Cell::Text(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        (Cell::Bytes(x), Cell::Bytes(y)) => x.cmp(y),
        _ => match (num_of(a), num_of(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

pub fn coerce_cell(cell: Cell, target: &SqlType) -> Result<Cell, InceptionError> {
    match (target, &cell) {
        (SqlType::Int, Cell::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Cell::Int)
            .map_err(|_| InceptionError::Invalid(format!("Incorrect integer value: '{s}'"))),
        (SqlType::Int, Cell::Float(f)) => Ok(Cell::Int(f.round() as i64)),
        (SqlType::Float, Cell::Int(i)) => Ok(Cell::Float(*i as f64)),
        (SqlType::Float, Cell::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Cell::Float)
            .map_err(|_| InceptionError::Invalid(format!("Incorrect double value: '{s}'"))),
        (SqlType::Text, Cell::Int(i)) => Ok(Cell::Text(i.to_string())),
        (SqlType::Text, Cell::Float(f)) => Ok(Cell::Text(f.to_string())),
        _ => Ok(cell),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlparser::dialect::MySqlDialect;
    use sqlparser::parser::Parser;

    fn expr(text: &str) -> ast::Expr {
        Parser::new(&MySqlDialect {})
            .try_with_sql(text)
            .unwrap()
            .parse_expr()
            .unwrap()
    }

    fn cols() -> ColMap {
        ColMap::from([("id".to_string(), 0), ("name".to_string(), 1)])
    }

    #[test]
    fn three_valued_where() {
        let row = vec![Cell::Int(3), Cell::Null];
        assert!(eval_condition(&expr("id = 3"), &row, &cols()).unwrap());
        assert!(!eval_condition(&expr("name = 'x'"), &row, &cols()).unwrap());
        assert!(!eval_condition(&expr("NOT (name = 'x')"), &row, &cols()).unwrap());
        assert!(eval_condition(&expr("name IS NULL AND id BETWEEN 1 AND 5"), &row, &cols()).unwrap());
        assert!(eval_condition(&expr("id IN (1, 3)"), &row, &cols()).unwrap());
    }

    #[test]
    fn like_patterns() {
        let row = vec![Cell::Int(1), Cell::Text("Alice".into())];
        assert!(eval_condition(&expr("name LIKE 'al%'"), &row, &cols()).unwrap());
        assert!(eval_condition(&expr("name LIKE '_lic_'"), &row, &cols()).unwrap());
        assert!(!eval_condition(&expr("name NOT LIKE '%ice'"), &row, &cols()).unwrap());
    }

    #[test]
    fn literals_are_recognised() {
        assert_eq!(literal(&expr("-5")), Some(Cell::Int(-5)));
        assert_eq!(literal(&expr("'a'")), Some(Cell::Text("a".into())));
        assert_eq!(literal(&expr("2 * 3")), Some(Cell::Int(6)));
        assert_eq!(literal(&expr("id + 1")), None);
        assert_eq!(literal(&expr("now()")), None);
    }

    #[test]
    fn arithmetic_uses_row_values() {
        let row = vec![Cell::Int(41), Cell::Null];
        assert_eq!(eval_expr(&expr("id + 1"), &row, &cols()).unwrap(), Cell::Int(42));
        assert_eq!(eval_expr(&expr("name + 1"), &row, &cols()).unwrap(), Cell::Null);
    }
}
