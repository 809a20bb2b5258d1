//! Admin query engine (spec §4.F): parses the SQL the admin session sends
//! against the virtual `servers` table and executes it against a
//! [`CredentialStore`](crate::credential::CredentialStore).
//!
//! Grounded on `examples/original_source/pkg/serverconfig/sqlparse.go` for
//! the statement shape (`ParsedQuery`'s fields, default `[User, Password]`
//! column list, equality-only `WHERE`) and on
//! `examples/abiolaogu-LumaDB/rust-core/src/server/query/parser.rs` for the
//! idiomatic `sqlparser` usage (`GenericDialect`, `Parser::parse_sql`,
//! matching on `ast::Statement`/`SetExpr`/`Expr`).

use sqlparser::ast::{
    BinaryOperator, Expr, SetExpr, Statement as SqlStatement, TableFactor, Value as SqlValue,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;

use crate::credential::{CredentialError, CredentialStore};

#[derive(Debug, Error)]
pub enum AdminQueryError {
    #[error("sql parse error: {0}")]
    Parse(String),
    #[error("unsupported statement")]
    UnsupportedStatement,
    #[error("unsupported expression in where clause")]
    UnsupportedWhere,
    #[error(transparent)]
    Credential(#[from] CredentialError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statement {
    Select,
    Insert,
    Update,
    Delete,
}

/// The statement-independent shape `sqlparse.go`'s `Query`/`ParsedQuery`
/// reduces every admin statement to: an explicit column list (empty means
/// "default to `[User, Password]`"), a flat, row-major value list for
/// `INSERT`/`UPDATE`, and an equality-only `WHERE` (empty means "match
/// every row").
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub statement: Statement,
    pub columns: Vec<String>,
    pub values: Vec<String>,
    pub where_columns: Vec<String>,
    pub where_values: Vec<String>,
    pub where_op: Option<String>,
}

pub fn parse(sql: &str) -> Result<ParsedQuery, AdminQueryError> {
    let dialect = MySqlDialect {};
    let mut statements =
        Parser::parse_sql(&dialect, sql).map_err(|e| AdminQueryError::Parse(e.to_string()))?;
    let stmt = statements
        .pop()
        .ok_or_else(|| AdminQueryError::Parse("empty statement".to_string()))?;

    match stmt {
        SqlStatement::Query(query) => {
            let SetExpr::Select(select) = *query.body else {
                return Err(AdminQueryError::UnsupportedStatement);
            };
            let columns = select
                .projection
                .iter()
                .filter_map(|item| match item {
                    sqlparser::ast::SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                        Some(ident.value.clone())
                    }
                    sqlparser::ast::SelectItem::Wildcard(_) => None,
                    _ => None,
                })
                .collect();
            let (where_columns, where_values, where_op) = match select.selection {
                Some(expr) => parse_where(&expr)?,
                None => (Vec::new(), Vec::new(), None),
            };
            Ok(ParsedQuery {
                statement: Statement::Select,
                columns,
                values: Vec::new(),
                where_columns,
                where_values,
                where_op,
            })
        }
        SqlStatement::Insert {
            columns, source, ..
        } => {
            let columns = columns.iter().map(|c| c.value.clone()).collect();
            let mut values = Vec::new();
            if let Some(source) = source {
                if let SetExpr::Values(rows) = *source.body {
                    for row in rows.rows {
                        for expr in row {
                            values.push(literal_string(&expr)?);
                        }
                    }
                }
            }
            Ok(ParsedQuery {
                statement: Statement::Insert,
                columns,
                values,
                where_columns: Vec::new(),
                where_values: Vec::new(),
                where_op: None,
            })
        }
        SqlStatement::Update {
            assignments,
            selection,
            ..
        } => {
            let mut columns = Vec::with_capacity(assignments.len());
            let mut values = Vec::with_capacity(assignments.len());
            for assignment in assignments {
                columns.push(assignment.id.last().map(|i| i.value.clone()).unwrap_or_default());
                values.push(literal_string(&assignment.value)?);
            }
            let (where_columns, where_values, where_op) = match selection {
                Some(expr) => parse_where(&expr)?,
                None => (Vec::new(), Vec::new(), None),
            };
            Ok(ParsedQuery {
                statement: Statement::Update,
                columns,
                values,
                where_columns,
                where_values,
                where_op,
            })
        }
        SqlStatement::Delete { selection, .. } => {
            let (where_columns, where_values, where_op) = match selection {
                Some(expr) => parse_where(&expr)?,
                None => (Vec::new(), Vec::new(), None),
            };
            Ok(ParsedQuery {
                statement: Statement::Delete,
                columns: Vec::new(),
                values: Vec::new(),
                where_columns,
                where_values,
                where_op,
            })
        }
        _ => Err(AdminQueryError::UnsupportedStatement),
    }
}

/// Walks an `AND`-chain of `column = literal` comparisons. Any other
/// operator is recorded (not rejected here — `CredentialStore` is the
/// one that turns a non-`=` op into `WhereNotEqual`, matching
/// `sqlparse.go`'s `whereColumnsToConfig` which defers the check to the
/// point of use).
fn parse_where(expr: &Expr) -> Result<(Vec<String>, Vec<String>, Option<String>), AdminQueryError> {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    let mut op = None;
    collect_where(expr, &mut columns, &mut values, &mut op)?;
    Ok((columns, values, op))
}

fn collect_where(
    expr: &Expr,
    columns: &mut Vec<String>,
    values: &mut Vec<String>,
    op: &mut Option<String>,
) -> Result<(), AdminQueryError> {
    match expr {
        Expr::BinaryOp { left, op: bin_op, right } if *bin_op == BinaryOperator::And => {
            collect_where(left, columns, values, op)?;
            collect_where(right, columns, values, op)?;
            Ok(())
        }
        Expr::BinaryOp { left, op: bin_op, right } => {
            let Expr::Identifier(ident) = left.as_ref() else {
                return Err(AdminQueryError::UnsupportedWhere);
            };
            columns.push(ident.value.clone());
            values.push(literal_string(right)?);
            let symbol = match bin_op {
                BinaryOperator::Eq => "=",
                BinaryOperator::NotEq => "!=",
                BinaryOperator::Lt => "<",
                BinaryOperator::Gt => ">",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::GtEq => ">=",
                _ => return Err(AdminQueryError::UnsupportedWhere),
            };
            *op = Some(symbol.to_string());
            Ok(())
        }
        _ => Err(AdminQueryError::UnsupportedWhere),
    }
}

fn literal_string(expr: &Expr) -> Result<String, AdminQueryError> {
    match expr {
        Expr::Value(SqlValue::SingleQuotedString(s)) => Ok(s.clone()),
        Expr::Value(SqlValue::DoubleQuotedString(s)) => Ok(s.clone()),
        Expr::Value(SqlValue::Number(n, _)) => Ok(n.clone()),
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        _ => Err(AdminQueryError::UnsupportedWhere),
    }
}

#[allow(dead_code)]
fn table_name(factor: &TableFactor) -> String {
    match factor {
        TableFactor::Table { name, .. } => name.to_string(),
        _ => String::new(),
    }
}

/// What the session mediator turns into a resultset or an `OK` packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminOutcome {
    Rows(Vec<String>, Vec<Vec<String>>),
    Affected(u64),
}

/// Parses `sql` and dispatches it to the matching `CredentialStore`
/// method — the single entry point the session mediator's admin loop
/// calls.
pub async fn execute(store: &CredentialStore, sql: &str) -> Result<AdminOutcome, AdminQueryError> {
    let parsed = parse(sql)?;
    match parsed.statement {
        Statement::Select => {
            let (columns, rows) = store.select(&parsed).await?;
            Ok(AdminOutcome::Rows(columns, rows))
        }
        Statement::Insert => Ok(AdminOutcome::Affected(store.insert(&parsed).await?)),
        Statement::Update => Ok(AdminOutcome::Affected(store.update(&parsed).await?)),
        Statement::Delete => Ok(AdminOutcome::Affected(store.delete(&parsed).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_select_star() {
        let parsed = parse("SELECT * FROM servers").unwrap();
        assert_eq!(parsed.statement, Statement::Select);
        assert!(parsed.columns.is_empty());
        assert!(parsed.where_columns.is_empty());
    }

    #[test]
    fn parses_select_with_equality_where() {
        let parsed = parse("SELECT User,Password FROM servers WHERE User = 'admin'").unwrap();
        assert_eq!(parsed.columns, vec!["User".to_string(), "Password".to_string()]);
        assert_eq!(parsed.where_columns, vec!["User".to_string()]);
        assert_eq!(parsed.where_values, vec!["admin".to_string()]);
        assert_eq!(parsed.where_op.as_deref(), Some("="));
    }

    #[test]
    fn parses_insert_multi_row() {
        let parsed = parse(
            "INSERT INTO servers(User,Password) VALUES ('u1','p1'),('u2','p2')",
        )
        .unwrap();
        assert_eq!(parsed.statement, Statement::Insert);
        assert_eq!(
            parsed.values,
            vec![
                "u1".to_string(),
                "p1".to_string(),
                "u2".to_string(),
                "p2".to_string()
            ]
        );
    }

    #[test]
    fn parses_update_set_and_where() {
        let parsed = parse("UPDATE servers SET Password='p2' WHERE User='u1'").unwrap();
        assert_eq!(parsed.statement, Statement::Update);
        assert_eq!(parsed.columns, vec!["Password".to_string()]);
        assert_eq!(parsed.values, vec!["p2".to_string()]);
        assert_eq!(parsed.where_op.as_deref(), Some("="));
    }

    #[test]
    fn non_equal_where_operator_is_recorded_not_rejected_at_parse_time() {
        let parsed = parse("DELETE FROM servers WHERE User < 'z'").unwrap();
        assert_eq!(parsed.where_op.as_deref(), Some("<"));
    }

    #[test]
    fn rejects_unsupported_statement() {
        assert!(matches!(
            parse("CREATE TABLE servers (User TEXT)"),
            Err(AdminQueryError::UnsupportedStatement)
        ));
    }
}
