//! Recursive-descent parser for the supported statement subset

use crate::ast::{ColumnDef, CompareOp, Filter, Literal, SelectItem, Statement};
use crate::lexer::{tokenize, Token};
use opal_common::{DbError, Result};
use opal_db::{DataType, OnCommit};

/// Parse one SQL statement
pub fn parse_sql(sql: &str) -> Result<Statement> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.parse_statement()?;
    parser.skip_symbol(';');
    if !parser.at_end() {
        return Err(DbError::Syntax(format!(
            "unexpected trailing input in {:?}",
            sql
        )));
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_statement(&mut self) -> Result<Statement> {
        let word = self.expect_any_word()?;
        match word.as_str() {
            "CREATE" => self.parse_create(),
            "DROP" => self.parse_drop(),
            "ALTER" => self.parse_alter(),
            "INSERT" => self.parse_insert(),
            "SELECT" => self.parse_select(),
            "BEGIN" => Ok(Statement::Begin),
            "COMMIT" => Ok(Statement::Commit),
            "ROLLBACK" => {
                if self.skip_word("TO") {
                    self.expect_word("SAVEPOINT")?;
                    Ok(Statement::RollbackToSavepoint(self.expect_any_word()?))
                } else {
                    Ok(Statement::Rollback)
                }
            }
            "SAVEPOINT" => Ok(Statement::Savepoint(self.expect_any_word()?)),
            "SET" => {
                let name = self.expect_any_word()?;
                self.expect_symbol('=')?;
                let value = self.parse_setting_value()?;
                Ok(Statement::Set { name, value })
            }
            other => Err(DbError::Syntax(format!("unsupported statement {}", other))),
        }
    }

    fn parse_create(&mut self) -> Result<Statement> {
        let temporary = if self.skip_word("LOCAL") {
            if !self.skip_word("TEMPORARY") {
                self.expect_word("TEMP")?;
            }
            true
        } else {
            self.skip_word("TEMPORARY") || self.skip_word("TEMP")
        };
        self.expect_word("TABLE")?;
        let if_not_exists = if self.skip_word("IF") {
            self.expect_word("NOT")?;
            self.expect_word("EXISTS")?;
            true
        } else {
            false
        };
        let name = self.expect_any_word()?;
        self.expect_symbol('(')?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column_def()?);
            if !self.skip_symbol(',') {
                break;
            }
        }
        self.expect_symbol(')')?;
        let on_commit = if self.skip_word("ON") {
            self.expect_word("COMMIT")?;
            if self.skip_word("DROP") {
                OnCommit::Drop
            } else if self.skip_word("DELETE") {
                self.expect_word("ROWS")?;
                OnCommit::DeleteRows
            } else {
                self.expect_word("PRESERVE")?;
                self.expect_word("ROWS")?;
                OnCommit::PreserveRows
            }
        } else {
            OnCommit::PreserveRows
        };
        Ok(Statement::CreateTable {
            if_not_exists,
            temporary,
            name,
            columns,
            on_commit,
        })
    }

    fn parse_drop(&mut self) -> Result<Statement> {
        self.expect_word("TABLE")?;
        let if_exists = if self.skip_word("IF") {
            self.expect_word("EXISTS")?;
            true
        } else {
            false
        };
        Ok(Statement::DropTable {
            if_exists,
            name: self.expect_any_word()?,
        })
    }

    fn parse_alter(&mut self) -> Result<Statement> {
        self.expect_word("TABLE")?;
        let table = self.expect_any_word()?;
        self.expect_word("ADD")?;
        self.skip_word("COLUMN");
        let column = self.parse_column_def()?;
        Ok(Statement::AlterTableAddColumn { table, column })
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect_word("INTO")?;
        let table = self.expect_any_word()?;
        let mut columns = Vec::new();
        if self.skip_symbol('(') {
            loop {
                columns.push(self.expect_any_word()?);
                if !self.skip_symbol(',') {
                    break;
                }
            }
            self.expect_symbol(')')?;
        }
        self.expect_word("VALUES")?;
        let mut rows = Vec::new();
        loop {
            self.expect_symbol('(')?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_literal()?);
                if !self.skip_symbol(',') {
                    break;
                }
            }
            self.expect_symbol(')')?;
            rows.push(row);
            if !self.skip_symbol(',') {
                break;
            }
        }
        Ok(Statement::Insert {
            table,
            columns,
            rows,
        })
    }

    fn parse_select(&mut self) -> Result<Statement> {
        let mut items = Vec::new();
        loop {
            if self.skip_symbol('*') {
                items.push(SelectItem::Wildcard);
            } else {
                items.push(SelectItem::Column(self.expect_any_word()?));
            }
            if !self.skip_symbol(',') {
                break;
            }
        }
        self.expect_word("FROM")?;
        let table = self.expect_any_word()?;
        let filter = if self.skip_word("WHERE") {
            let column = self.expect_any_word()?;
            let op = self.parse_compare_op()?;
            let value = self.parse_literal()?;
            Some(Filter { column, op, value })
        } else {
            None
        };
        Ok(Statement::Select {
            table,
            items,
            filter,
        })
    }

    fn parse_column_def(&mut self) -> Result<ColumnDef> {
        let name = self.expect_any_word()?;
        let type_name = self.expect_any_word()?;
        let data_type = match type_name.as_str() {
            "INT" | "INTEGER" => DataType::Int,
            "BIGINT" | "LONG" => DataType::Bigint,
            "DOUBLE" | "FLOAT" => DataType::Double,
            "VARCHAR" | "TEXT" => {
                // optional length, ignored
                if self.skip_symbol('(') {
                    self.expect_any_number()?;
                    self.expect_symbol(')')?;
                }
                DataType::Varchar
            }
            "BOOLEAN" | "BOOL" => DataType::Boolean,
            other => {
                return Err(DbError::Syntax(format!("unknown data type {}", other)));
            }
        };
        Ok(ColumnDef { name, data_type })
    }

    fn parse_compare_op(&mut self) -> Result<CompareOp> {
        match self.next() {
            Some(Token::Symbol('=')) => Ok(CompareOp::Eq),
            Some(Token::Symbol('<')) => Ok(CompareOp::Lt),
            Some(Token::Symbol('>')) => Ok(CompareOp::Gt),
            Some(Token::Op("<=")) => Ok(CompareOp::Le),
            Some(Token::Op(">=")) => Ok(CompareOp::Ge),
            Some(Token::Op("<>")) => Ok(CompareOp::Ne),
            other => Err(DbError::Syntax(format!("expected comparison, got {:?}", other))),
        }
    }

    fn parse_literal(&mut self) -> Result<Literal> {
        let negative = self.skip_symbol('-');
        match self.next() {
            Some(Token::Number(text)) => {
                if text.contains('.') {
                    let value: f64 = text
                        .parse()
                        .map_err(|_| DbError::Syntax(format!("bad number {}", text)))?;
                    Ok(Literal::Float(if negative { -value } else { value }))
                } else {
                    let value: i64 = text
                        .parse()
                        .map_err(|_| DbError::Syntax(format!("bad number {}", text)))?;
                    Ok(Literal::Integer(if negative { -value } else { value }))
                }
            }
            Some(Token::Text(text)) if !negative => Ok(Literal::Text(text.clone())),
            Some(Token::Word(word)) if !negative => match word.as_str() {
                "NULL" => Ok(Literal::Null),
                "TRUE" => Ok(Literal::Bool(true)),
                "FALSE" => Ok(Literal::Bool(false)),
                other => Err(DbError::Syntax(format!("unexpected literal {}", other))),
            },
            other => Err(DbError::Syntax(format!("expected literal, got {:?}", other))),
        }
    }

    /// Setting values: a word, number, string, or comma-joined words
    fn parse_setting_value(&mut self) -> Result<String> {
        let mut parts = Vec::new();
        loop {
            let part = match self.next() {
                Some(Token::Word(word)) => word.clone(),
                Some(Token::Number(number)) => number.clone(),
                Some(Token::Text(text)) => text.clone(),
                other => {
                    return Err(DbError::Syntax(format!(
                        "expected setting value, got {:?}",
                        other
                    )))
                }
            };
            parts.push(part);
            if !self.skip_symbol(',') {
                break;
            }
        }
        Ok(parts.join(","))
    }

    // === Token plumbing ===

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn skip_word(&mut self, keyword: &str) -> bool {
        if self.peek().map(|t| t.is_word(keyword)).unwrap_or(false) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, keyword: &str) -> Result<()> {
        if self.skip_word(keyword) {
            Ok(())
        } else {
            Err(DbError::Syntax(format!(
                "expected {}, got {:?}",
                keyword,
                self.peek()
            )))
        }
    }

    fn expect_any_word(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word.clone()),
            other => Err(DbError::Syntax(format!("expected identifier, got {:?}", other))),
        }
    }

    fn expect_any_number(&mut self) -> Result<String> {
        match self.next() {
            Some(Token::Number(number)) => Ok(number.clone()),
            other => Err(DbError::Syntax(format!("expected number, got {:?}", other))),
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> Result<()> {
        if self.skip_symbol(symbol) {
            Ok(())
        } else {
            Err(DbError::Syntax(format!(
                "expected {:?}, got {:?}",
                symbol,
                self.peek()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_create_table() {
        let statement = parse_sql("CREATE TABLE t(f1 INT, f2 BIGINT)").unwrap();
        match statement {
            Statement::CreateTable {
                if_not_exists,
                temporary,
                name,
                columns,
                ..
            } => {
                assert!(!if_not_exists);
                assert!(!temporary);
                assert_eq!(name, "T");
                assert_eq!(columns.len(), 2);
                assert_eq!(columns[0].data_type, DataType::Int);
                assert_eq!(columns[1].data_type, DataType::Bigint);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_create_temp_table_on_commit() {
        let statement =
            parse_sql("CREATE LOCAL TEMPORARY TABLE s(v INT) ON COMMIT DROP").unwrap();
        match statement {
            Statement::CreateTable {
                temporary,
                on_commit,
                ..
            } => {
                assert!(temporary);
                assert_eq!(on_commit, OnCommit::Drop);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_if_ddl() {
        let statement = parse_sql("CREATE TABLE IF NOT EXISTS t(f INT)").unwrap();
        assert!(statement.is_if_ddl());
        let statement = parse_sql("DROP TABLE IF EXISTS t").unwrap();
        assert!(statement.is_if_ddl());
    }

    #[test]
    fn test_parse_insert_multi_row() {
        let statement =
            parse_sql("INSERT INTO t(f1,f2) VALUES(1,2),(3,-4)").unwrap();
        match statement {
            Statement::Insert { columns, rows, .. } => {
                assert_eq!(columns, vec!["F1".to_string(), "F2".to_string()]);
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1][1], Literal::Integer(-4));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_select_where() {
        let statement = parse_sql("SELECT f1, f2 FROM t WHERE f1 >= 10").unwrap();
        match statement {
            Statement::Select { items, filter, .. } => {
                assert_eq!(items.len(), 2);
                let filter = filter.unwrap();
                assert_eq!(filter.op, CompareOp::Ge);
                assert_eq!(filter.value, Literal::Integer(10));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_transaction_control() {
        assert_eq!(parse_sql("BEGIN").unwrap(), Statement::Begin);
        assert_eq!(parse_sql("COMMIT;").unwrap(), Statement::Commit);
        assert_eq!(parse_sql("ROLLBACK").unwrap(), Statement::Rollback);
        assert_eq!(
            parse_sql("SAVEPOINT a").unwrap(),
            Statement::Savepoint("A".to_string())
        );
        assert_eq!(
            parse_sql("ROLLBACK TO SAVEPOINT a").unwrap(),
            Statement::RollbackToSavepoint("A".to_string())
        );
    }

    #[test]
    fn test_parse_set() {
        assert_eq!(
            parse_sql("SET LOCK_TIMEOUT = 50").unwrap(),
            Statement::Set {
                name: "LOCK_TIMEOUT".to_string(),
                value: "50".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_sql("SELECT").is_err());
        assert!(parse_sql("CREATE TABLE t(f NOPE)").is_err());
        assert!(parse_sql("SELECT * FROM t extra junk +").is_err());
        assert!(parse_sql("TRUNCATE t").is_err());
    }
}
