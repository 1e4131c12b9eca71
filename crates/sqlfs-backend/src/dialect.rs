//! Parser for the restricted statement dialect.
//!
//! This is deliberately not a SQL planner: it recognizes exactly the four
//! statement shapes the SQLFS core emits and nothing else. A production
//! adapter is free to pass the statements through to a real engine instead.

use crate::{BackendError, Result};

/// A column reference on the read side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnRef {
    /// The whole column value.
    Whole(String),
    /// One slot of an array column; the parameter holds the 0-based index.
    Slot { column: String, index_param: usize },
}

/// `WHERE column = $n` (the only filter shape the core needs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub param: usize,
}

/// One `SET` clause item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    /// `Some(p)` for `column[$p] = $value`; `None` for whole-column writes.
    pub index_param: Option<usize>,
    pub value_param: usize,
}

/// A parsed statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select {
        table: String,
        columns: Vec<ColumnRef>,
        filter: Option<Filter>,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        params: Vec<usize>,
    },
    Update {
        table: String,
        sets: Vec<Assignment>,
        filter: Option<Filter>,
    },
    Delete {
        table: String,
        filter: Option<Filter>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    /// 0-based parameter index, parsed from 1-based `$n`.
    Param(usize),
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eq,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() || c == ';' => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '$' => {
                chars.next();
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n: usize = digits
                    .parse()
                    .map_err(|_| BackendError::Statement(format!("bad placeholder in {input:?}")))?;
                if n == 0 {
                    return Err(BackendError::Statement(
                        "placeholders are 1-based".to_string(),
                    ));
                }
                tokens.push(Token::Param(n - 1));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(BackendError::Statement(format!(
                    "unexpected character {other:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Cursor {
    tokens: Vec<Token>,
    pos: usize,
}

impl Cursor {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<()> {
        match self.next() {
            Some(Token::Ident(s)) if s.eq_ignore_ascii_case(kw) => Ok(()),
            other => Err(BackendError::Statement(format!(
                "expected {kw}, found {other:?}"
            ))),
        }
    }

    fn take_keyword(&mut self, kw: &str) -> bool {
        if let Some(Token::Ident(s)) = self.peek() {
            if s.eq_ignore_ascii_case(kw) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(BackendError::Statement(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    fn expect_param(&mut self) -> Result<usize> {
        match self.next() {
            Some(Token::Param(p)) => Ok(p),
            other => Err(BackendError::Statement(format!(
                "expected placeholder, found {other:?}"
            ))),
        }
    }

    fn expect_token(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(BackendError::Statement(format!(
                "expected {want:?}, found {other:?}"
            ))),
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

impl Statement {
    pub fn parse(input: &str) -> Result<Self> {
        let mut cur = Cursor {
            tokens: tokenize(input)?,
            pos: 0,
        };
        let head = cur.expect_ident()?;
        let stmt = if head.eq_ignore_ascii_case("select") {
            parse_select(&mut cur)?
        } else if head.eq_ignore_ascii_case("insert") {
            parse_insert(&mut cur)?
        } else if head.eq_ignore_ascii_case("update") {
            parse_update(&mut cur)?
        } else if head.eq_ignore_ascii_case("delete") {
            parse_delete(&mut cur)?
        } else {
            return Err(BackendError::Statement(format!(
                "unsupported statement {head:?}"
            )));
        };
        if !cur.at_end() {
            return Err(BackendError::Statement(format!(
                "trailing tokens in {input:?}"
            )));
        }
        Ok(stmt)
    }
}

fn parse_column_ref(cur: &mut Cursor) -> Result<ColumnRef> {
    let column = cur.expect_ident()?;
    if let Some(Token::LBracket) = cur.peek() {
        cur.next();
        let index_param = cur.expect_param()?;
        cur.expect_token(Token::RBracket)?;
        Ok(ColumnRef::Slot {
            column,
            index_param,
        })
    } else {
        Ok(ColumnRef::Whole(column))
    }
}

fn parse_filter(cur: &mut Cursor) -> Result<Option<Filter>> {
    if !cur.take_keyword("where") {
        return Ok(None);
    }
    let column = cur.expect_ident()?;
    cur.expect_token(Token::Eq)?;
    let param = cur.expect_param()?;
    Ok(Some(Filter { column, param }))
}

fn parse_select(cur: &mut Cursor) -> Result<Statement> {
    let mut columns = vec![parse_column_ref(cur)?];
    while let Some(Token::Comma) = cur.peek() {
        cur.next();
        columns.push(parse_column_ref(cur)?);
    }
    cur.expect_keyword("from")?;
    let table = cur.expect_ident()?;
    let filter = parse_filter(cur)?;
    Ok(Statement::Select {
        table,
        columns,
        filter,
    })
}

fn parse_insert(cur: &mut Cursor) -> Result<Statement> {
    cur.expect_keyword("into")?;
    let table = cur.expect_ident()?;
    cur.expect_token(Token::LParen)?;
    let mut columns = vec![cur.expect_ident()?];
    while let Some(Token::Comma) = cur.peek() {
        cur.next();
        columns.push(cur.expect_ident()?);
    }
    cur.expect_token(Token::RParen)?;
    cur.expect_keyword("values")?;
    cur.expect_token(Token::LParen)?;
    let mut params = vec![cur.expect_param()?];
    while let Some(Token::Comma) = cur.peek() {
        cur.next();
        params.push(cur.expect_param()?);
    }
    cur.expect_token(Token::RParen)?;
    if params.len() != columns.len() {
        return Err(BackendError::Statement(format!(
            "{} columns but {} values",
            columns.len(),
            params.len()
        )));
    }
    Ok(Statement::Insert {
        table,
        columns,
        params,
    })
}

fn parse_update(cur: &mut Cursor) -> Result<Statement> {
    let table = cur.expect_ident()?;
    cur.expect_keyword("set")?;
    let mut sets = vec![parse_assignment(cur)?];
    while let Some(Token::Comma) = cur.peek() {
        cur.next();
        sets.push(parse_assignment(cur)?);
    }
    let filter = parse_filter(cur)?;
    Ok(Statement::Update {
        table,
        sets,
        filter,
    })
}

fn parse_assignment(cur: &mut Cursor) -> Result<Assignment> {
    let target = parse_column_ref(cur)?;
    cur.expect_token(Token::Eq)?;
    let value_param = cur.expect_param()?;
    let (column, index_param) = match target {
        ColumnRef::Whole(column) => (column, None),
        ColumnRef::Slot {
            column,
            index_param,
        } => (column, Some(index_param)),
    };
    Ok(Assignment {
        column,
        index_param,
        value_param,
    })
}

fn parse_delete(cur: &mut Cursor) -> Result<Statement> {
    cur.expect_keyword("from")?;
    let table = cur.expect_ident()?;
    let filter = parse_filter(cur)?;
    Ok(Statement::Delete { table, filter })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_select() {
        let stmt = Statement::parse("SELECT id, size FROM file_storage WHERE id = $1").unwrap();
        assert_eq!(
            stmt,
            Statement::Select {
                table: "file_storage".to_string(),
                columns: vec![
                    ColumnRef::Whole("id".to_string()),
                    ColumnRef::Whole("size".to_string())
                ],
                filter: Some(Filter {
                    column: "id".to_string(),
                    param: 0
                }),
            }
        );
    }

    #[test]
    fn test_parse_select_slot() {
        let stmt =
            Statement::parse("SELECT sub_contents[$1] FROM file_storage_sparse WHERE row_id = $2")
                .unwrap();
        match stmt {
            Statement::Select { columns, .. } => {
                assert_eq!(
                    columns,
                    vec![ColumnRef::Slot {
                        column: "sub_contents".to_string(),
                        index_param: 0
                    }]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_insert() {
        let stmt =
            Statement::parse("INSERT INTO file_storage (id, size, refcount) VALUES ($1, $2, $3)")
                .unwrap();
        assert_eq!(
            stmt,
            Statement::Insert {
                table: "file_storage".to_string(),
                columns: vec!["id".to_string(), "size".to_string(), "refcount".to_string()],
                params: vec![0, 1, 2],
            }
        );
    }

    #[test]
    fn test_parse_update_with_slot() {
        let stmt = Statement::parse(
            "UPDATE file_storage_sparse SET aggregate_size = $1, sub_sizes[$2] = $3 WHERE row_id = $4",
        )
        .unwrap();
        match stmt {
            Statement::Update { sets, filter, .. } => {
                assert_eq!(sets.len(), 2);
                assert_eq!(sets[1].index_param, Some(1));
                assert_eq!(sets[1].value_param, 2);
                assert_eq!(filter.unwrap().param, 3);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_delete() {
        let stmt = Statement::parse("DELETE FROM file_system WHERE id = $1").unwrap();
        assert_eq!(
            stmt,
            Statement::Delete {
                table: "file_system".to_string(),
                filter: Some(Filter {
                    column: "id".to_string(),
                    param: 0
                }),
            }
        );
    }

    #[test]
    fn test_reject_garbage() {
        assert!(Statement::parse("DROP TABLE file_system").is_err());
        assert!(Statement::parse("SELECT id FROM").is_err());
        assert!(Statement::parse("SELECT id FROM t WHERE id = $0").is_err());
        assert!(Statement::parse("SELECT id FROM t extra").is_err());
    }
}
