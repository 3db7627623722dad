//! Recursive-descent SQL parser. Expressions use precedence climbing.

use std::collections::BTreeMap;
use std::iter::Peekable;

use super::ast::{self, Column, DataType, Expression, FromItem, JoinType, Literal, Order, Statement};
use super::lexer::Lexer;
use super::token::{Keyword, Token};
use crate::error::{Error, Result};

pub struct Parser<'a> {
    lexer: Peekable<Lexer<'a>>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            lexer: Lexer::new(input).peekable(),
        }
    }

    /// Parses a single statement, optionally terminated by a semicolon.
    pub fn parse(&mut self) -> Result<Statement> {
        let statement = self.parse_statement()?;
        self.next_is(Token::Semicolon);
        if let Some(token) = self.peek()? {
            return Err(Error::Parse(format!("unexpected token {token}")));
        }
        Ok(statement)
    }

    fn parse_statement(&mut self) -> Result<Statement> {
        let Some(token) = self.peek()? else {
            return Err(Error::Parse("unexpected end of input".into()));
        };
        match token {
            Token::Keyword(Keyword::Begin) => self.parse_begin(),
            Token::Keyword(Keyword::Commit) => {
                self.next()?;
                Ok(Statement::Commit)
            }
            Token::Keyword(Keyword::Rollback) => {
                self.next()?;
                Ok(Statement::Rollback)
            }
            Token::Keyword(Keyword::Explain) => self.parse_explain(),
            Token::Keyword(Keyword::Create) => self.parse_create_table(),
            Token::Keyword(Keyword::Drop) => self.parse_drop_table(),
            Token::Keyword(Keyword::Insert) => self.parse_insert(),
            Token::Keyword(Keyword::Update) => self.parse_update(),
            Token::Keyword(Keyword::Delete) => self.parse_delete(),
            Token::Keyword(Keyword::Select) => self.parse_select(),
            token => Err(Error::Parse(format!("unexpected token {token}"))),
        }
    }

    fn parse_begin(&mut self) -> Result<Statement> {
        self.expect(Keyword::Begin)?;
        self.next_is(Keyword::Transaction);

        let mut read_only = false;
        if self.next_is(Keyword::Read) {
            match self.next()? {
                Token::Keyword(Keyword::Only) => read_only = true,
                Token::Keyword(Keyword::Write) => {}
                token => return Err(Error::Parse(format!("unexpected token {token}"))),
            }
        }

        let mut as_of = None;
        if self.next_is(Keyword::As) {
            self.expect(Keyword::Of)?;
            self.expect(Keyword::System)?;
            self.expect(Keyword::Time)?;
            match self.next()? {
                Token::Number(n) => as_of = Some(n.parse::<u64>()?),
                token => {
                    return Err(Error::Parse(format!("expected version number, got {token}")))
                }
            }
        }
        Ok(Statement::Begin { read_only, as_of })
    }

    fn parse_explain(&mut self) -> Result<Statement> {
        self.expect(Keyword::Explain)?;
        if let Some(Token::Keyword(Keyword::Explain)) = self.peek()? {
            return Err(Error::Parse("cannot nest EXPLAIN statements".into()));
        }
        Ok(Statement::Explain(Box::new(self.parse_statement()?)))
    }

    fn parse_create_table(&mut self) -> Result<Statement> {
        self.expect(Keyword::Create)?;
        self.expect(Keyword::Table)?;
        let name = self.next_ident()?;
        self.expect(Token::OpenParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.parse_column()?);
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        self.expect(Token::CloseParen)?;
        Ok(Statement::CreateTable { name, columns })
    }

    fn parse_column(&mut self) -> Result<Column> {
        let name = self.next_ident()?;
        let datatype = match self.next()? {
            Token::Keyword(Keyword::Bool | Keyword::Boolean) => DataType::Boolean,
            Token::Keyword(Keyword::Int | Keyword::Integer) => DataType::Integer,
            Token::Keyword(Keyword::Float | Keyword::Double) => DataType::Float,
            Token::Keyword(Keyword::Char | Keyword::String | Keyword::Text | Keyword::Varchar) => {
                DataType::String
            }
            token => return Err(Error::Parse(format!("unexpected token {token}"))),
        };
        let mut column = Column::new(name, datatype);

        while let Some(keyword) = self.next_if_keyword() {
            match keyword {
                Keyword::Primary => {
                    self.expect(Keyword::Key)?;
                    column.primary_key = true;
                }
                Keyword::Null => {
                    if column.nullable == Some(false) {
                        return Err(Error::Value(format!(
                            "column {} can't be both not nullable and nullable",
                            column.name
                        )));
                    }
                    column.nullable = Some(true);
                }
                Keyword::Not => {
                    self.expect(Keyword::Null)?;
                    if column.nullable == Some(true) {
                        return Err(Error::Value(format!(
                            "column {} can't be both nullable and not nullable",
                            column.name
                        )));
                    }
                    column.nullable = Some(false);
                }
                Keyword::Default => column.default = Some(self.parse_expression()?),
                Keyword::Unique => column.unique = true,
                Keyword::Index => column.index = true,
                Keyword::References => column.references = Some(self.next_ident()?),
                keyword => return Err(Error::Parse(format!("unexpected keyword {keyword}"))),
            }
        }
        Ok(column)
    }

    fn parse_drop_table(&mut self) -> Result<Statement> {
        self.expect(Keyword::Drop)?;
        self.expect(Keyword::Table)?;
        let mut if_exists = false;
        if self.next_is(Keyword::If) {
            self.expect(Keyword::Exists)?;
            if_exists = true;
        }
        let name = self.next_ident()?;
        Ok(Statement::DropTable { name, if_exists })
    }

    fn parse_insert(&mut self) -> Result<Statement> {
        self.expect(Keyword::Insert)?;
        self.expect(Keyword::Into)?;
        let table = self.next_ident()?;

        let mut columns = None;
        if self.next_is(Token::OpenParen) {
            let mut names = Vec::new();
            loop {
                names.push(self.next_ident()?);
                match self.next()? {
                    Token::CloseParen => break,
                    Token::Comma => {}
                    token => return Err(Error::Parse(format!("unexpected token {token}"))),
                }
            }
            columns = Some(names);
        }

        self.expect(Keyword::Values)?;
        let mut values = Vec::new();
        loop {
            self.expect(Token::OpenParen)?;
            let mut row = Vec::new();
            loop {
                row.push(self.parse_expression()?);
                match self.next()? {
                    Token::CloseParen => break,
                    Token::Comma => {}
                    token => return Err(Error::Parse(format!("unexpected token {token}"))),
                }
            }
            values.push(row);
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(Statement::Insert {
            table,
            columns,
            values,
        })
    }

    fn parse_update(&mut self) -> Result<Statement> {
        self.expect(Keyword::Update)?;
        let table = self.next_ident()?;
        self.expect(Keyword::Set)?;

        let mut set = BTreeMap::new();
        loop {
            let column = self.next_ident()?;
            self.expect(Token::Equal)?;
            let expr = self.parse_expression()?;
            if set.contains_key(&column) {
                return Err(Error::Value(format!("duplicate values given for column {column}")));
            }
            set.insert(column, expr);
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(Statement::Update {
            table,
            set,
            r#where: self.parse_where_clause()?,
        })
    }

    fn parse_delete(&mut self) -> Result<Statement> {
        self.expect(Keyword::Delete)?;
        self.expect(Keyword::From)?;
        let table = self.next_ident()?;
        Ok(Statement::Delete {
            table,
            r#where: self.parse_where_clause()?,
        })
    }

    fn parse_select(&mut self) -> Result<Statement> {
        self.expect(Keyword::Select)?;
        Ok(Statement::Select {
            select: self.parse_select_clause()?,
            from: self.parse_from_clause()?,
            r#where: self.parse_where_clause()?,
            group_by: self.parse_group_by_clause()?,
            having: self.parse_having_clause()?,
            order: self.parse_order_clause()?,
            limit: self
                .next_is(Keyword::Limit)
                .then(|| self.parse_expression())
                .transpose()?,
            offset: self
                .next_is(Keyword::Offset)
                .then(|| self.parse_expression())
                .transpose()?,
        })
    }

    fn parse_select_clause(&mut self) -> Result<Vec<(Expression, Option<String>)>> {
        if self.next_is(Token::Asterisk) {
            return Ok(Vec::new());
        }
        let mut select = Vec::new();
        loop {
            let expr = self.parse_expression()?;
            let alias = self.parse_alias()?;
            select.push((expr, alias));
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(select)
    }

    /// `AS name` or a bare identifier.
    fn parse_alias(&mut self) -> Result<Option<String>> {
        if self.next_is(Keyword::As) {
            return Ok(Some(self.next_ident()?));
        }
        match self.peek()? {
            Some(Token::Identifier(_)) => Ok(Some(self.next_ident()?)),
            _ => Ok(None),
        }
    }

    fn parse_from_clause(&mut self) -> Result<Vec<FromItem>> {
        if !self.next_is(Keyword::From) {
            return Ok(Vec::new());
        }
        let mut from = Vec::new();
        loop {
            let mut item = self.parse_from_table()?;
            while let Some(r#type) = self.parse_join_type()? {
                let right = self.parse_from_table()?;
                let predicate = match r#type {
                    JoinType::Cross => None,
                    _ => {
                        self.expect(Keyword::On)?;
                        Some(self.parse_expression()?)
                    }
                };
                item = FromItem::Join {
                    left: Box::new(item),
                    right: Box::new(right),
                    r#type,
                    predicate,
                };
            }
            from.push(item);
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(from)
    }

    fn parse_from_table(&mut self) -> Result<FromItem> {
        let name = self.next_ident()?;
        let alias = self.parse_alias()?;
        Ok(FromItem::Table { name, alias })
    }

    fn parse_join_type(&mut self) -> Result<Option<JoinType>> {
        // A bare JOIN is an inner join.
        if self.next_is(Keyword::Join) {
            return Ok(Some(JoinType::Inner));
        }
        let r#type = if self.next_is(Keyword::Cross) {
            JoinType::Cross
        } else if self.next_is(Keyword::Inner) {
            JoinType::Inner
        } else if self.next_is(Keyword::Left) {
            self.next_is(Keyword::Outer);
            JoinType::Left
        } else if self.next_is(Keyword::Right) {
            self.next_is(Keyword::Outer);
            JoinType::Right
        } else {
            return Ok(None);
        };
        self.expect(Keyword::Join)?;
        Ok(Some(r#type))
    }

    fn parse_where_clause(&mut self) -> Result<Option<Expression>> {
        if !self.next_is(Keyword::Where) {
            return Ok(None);
        }
        Ok(Some(self.parse_expression()?))
    }

    fn parse_group_by_clause(&mut self) -> Result<Vec<Expression>> {
        let mut group_by = Vec::new();
        if !self.next_is(Keyword::Group) {
            return Ok(group_by);
        }
        self.expect(Keyword::By)?;
        loop {
            group_by.push(self.parse_expression()?);
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(group_by)
    }

    fn parse_having_clause(&mut self) -> Result<Option<Expression>> {
        if !self.next_is(Keyword::Having) {
            return Ok(None);
        }
        Ok(Some(self.parse_expression()?))
    }

    fn parse_order_clause(&mut self) -> Result<Vec<(Expression, Order)>> {
        let mut order = Vec::new();
        if !self.next_is(Keyword::Order) {
            return Ok(order);
        }
        self.expect(Keyword::By)?;
        loop {
            let expr = self.parse_expression()?;
            let direction = if self.next_is(Keyword::Desc) {
                Order::Descending
            } else {
                self.next_is(Keyword::Asc);
                Order::Ascending
            };
            order.push((expr, direction));
            if !self.next_is(Token::Comma) {
                break;
            }
        }
        Ok(order)
    }

    pub fn parse_expression(&mut self) -> Result<Expression> {
        self.parse_expression_at(0)
    }

    /// Precedence climbing: only operators binding at least as tightly as
    /// `min_precedence` are consumed at this level.
    fn parse_expression_at(&mut self, min_precedence: Precedence) -> Result<Expression> {
        let mut lhs = if let Some(prefix) = self.next_if_operator::<PrefixOperator>(min_precedence)? {
            let next = prefix.precedence() + prefix.associativity() as Precedence;
            prefix.build(self.parse_expression_at(next)?)
        } else {
            self.parse_expression_atom()?
        };
        while let Some(postfix) = self.next_if_operator::<PostfixOperator>(min_precedence)? {
            lhs = postfix.build(lhs);
        }
        while let Some(infix) = self.next_if_operator::<InfixOperator>(min_precedence)? {
            let next = infix.precedence() + infix.associativity() as Precedence;
            lhs = infix.build(lhs, self.parse_expression_at(next)?);
        }
        Ok(lhs)
    }

    fn parse_expression_atom(&mut self) -> Result<Expression> {
        Ok(match self.next()? {
            Token::Number(n) if n.chars().all(|c| c.is_ascii_digit()) => {
                Literal::Integer(n.parse()?).into()
            }
            Token::Number(n) => Literal::Float(n.parse()?).into(),
            Token::String(s) => Literal::String(s).into(),
            Token::Keyword(Keyword::True) => Literal::Boolean(true).into(),
            Token::Keyword(Keyword::False) => Literal::Boolean(false).into(),
            Token::Keyword(Keyword::Null) => Literal::Null.into(),
            Token::Keyword(Keyword::Infinity) => Literal::Float(f64::INFINITY).into(),
            Token::Keyword(Keyword::NaN) => Literal::Float(f64::NAN).into(),
            Token::Identifier(name) => {
                if self.next_is(Token::OpenParen) {
                    let mut args = Vec::new();
                    while !self.next_is(Token::CloseParen) {
                        if !args.is_empty() {
                            self.expect(Token::Comma)?;
                        }
                        // count(*) counts every row, same as count(TRUE).
                        if name == "count" && args.is_empty() && self.next_is(Token::Asterisk) {
                            args.push(Literal::Boolean(true).into());
                        } else {
                            args.push(self.parse_expression()?);
                        }
                    }
                    Expression::Function(name, args)
                } else if self.next_is(Token::Period) {
                    Expression::Field(Some(name), self.next_ident()?)
                } else {
                    Expression::Field(None, name)
                }
            }
            Token::OpenParen => {
                let expr = self.parse_expression()?;
                self.expect(Token::CloseParen)?;
                expr
            }
            token => return Err(Error::Parse(format!("expected expression, found {token}"))),
        })
    }

    fn next(&mut self) -> Result<Token> {
        self.lexer
            .next()
            .unwrap_or_else(|| Err(Error::Parse("unexpected end of input".into())))
    }

    fn peek(&mut self) -> Result<Option<Token>> {
        self.lexer.peek().cloned().transpose()
    }

    fn expect(&mut self, expected: impl Into<Token>) -> Result<()> {
        let expected = expected.into();
        let token = self.next()?;
        if token != expected {
            return Err(Error::Parse(format!("expected token {expected}, found {token}")));
        }
        Ok(())
    }

    fn next_ident(&mut self) -> Result<String> {
        match self.next()? {
            Token::Identifier(ident) => Ok(ident),
            token => Err(Error::Parse(format!("expected identifier, got {token}"))),
        }
    }

    /// Consumes the next token if it satisfies the predicate. Lexer errors are
    /// left in place for the next call to `next`.
    fn next_if(&mut self, predicate: impl Fn(&Token) -> bool) -> Option<Token> {
        self.peek().unwrap_or(None).filter(|t| predicate(t))?;
        self.next().ok()
    }

    fn next_is(&mut self, expected: impl Into<Token>) -> bool {
        let expected = expected.into();
        self.next_if(|t| t == &expected).is_some()
    }

    fn next_if_keyword(&mut self) -> Option<Keyword> {
        match self.next_if(|t| matches!(t, Token::Keyword(_))) {
            Some(Token::Keyword(keyword)) => Some(keyword),
            _ => None,
        }
    }

    fn next_if_operator<O: ParseOperator>(&mut self, min_precedence: Precedence) -> Result<Option<O>> {
        let Some(op) = self
            .peek()
            .unwrap_or(None)
            .as_ref()
            .and_then(O::from_token)
            .filter(|op| op.precedence() >= min_precedence)
        else {
            return Ok(None);
        };
        self.next()?;
        op.augment(self).map(Some)
    }
}

type Precedence = u8;

/// Left-associative operators raise the precedence required on their right side.
#[derive(Clone, Copy)]
enum Associativity {
    Left = 1,
    Right = 0,
}

trait ParseOperator: Sized {
    fn from_token(token: &Token) -> Option<Self>;
    /// Consumes any trailing tokens that belong to the operator, e.g. `IS NOT NULL`.
    fn augment(self, parser: &mut Parser) -> Result<Self>;
    fn associativity(&self) -> Associativity;
    fn precedence(&self) -> Precedence;
}

enum PrefixOperator {
    Minus,
    Not,
    Plus,
}

impl ParseOperator for PrefixOperator {
    fn from_token(token: &Token) -> Option<Self> {
        match token {
            Token::Minus => Some(Self::Minus),
            Token::Plus => Some(Self::Plus),
            Token::Keyword(Keyword::Not) => Some(Self::Not),
            _ => None,
        }
    }

    fn augment(self, _parser: &mut Parser) -> Result<Self> {
        Ok(self)
    }

    fn associativity(&self) -> Associativity {
        Associativity::Right
    }

    fn precedence(&self) -> Precedence {
        match self {
            Self::Not => 3,
            Self::Minus | Self::Plus => 10,
        }
    }
}

impl PrefixOperator {
    fn build(&self, rhs: Expression) -> Expression {
        let rhs = Box::new(rhs);
        match self {
            Self::Minus => ast::Operator::Negate(rhs),
            Self::Not => ast::Operator::Not(rhs),
            Self::Plus => ast::Operator::Assert(rhs),
        }
        .into()
    }
}

enum InfixOperator {
    Add,
    And,
    Divide,
    Equal,
    Exponentiate,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    Modulo,
    Multiply,
    NotEqual,
    Or,
    Subtract,
}

impl ParseOperator for InfixOperator {
    fn from_token(token: &Token) -> Option<Self> {
        Some(match token {
            Token::Asterisk => Self::Multiply,
            Token::Caret => Self::Exponentiate,
            Token::Equal => Self::Equal,
            Token::GreaterThan => Self::GreaterThan,
            Token::GreaterThanOrEqual => Self::GreaterThanOrEqual,
            Token::LessThan => Self::LessThan,
            Token::LessThanOrEqual => Self::LessThanOrEqual,
            Token::LessOrGreaterThan | Token::NotEqual => Self::NotEqual,
            Token::Minus => Self::Subtract,
            Token::Percent => Self::Modulo,
            Token::Plus => Self::Add,
            Token::Slash => Self::Divide,
            Token::Keyword(Keyword::And) => Self::And,
            Token::Keyword(Keyword::Like) => Self::Like,
            Token::Keyword(Keyword::Or) => Self::Or,
            _ => return None,
        })
    }

    fn augment(self, _parser: &mut Parser) -> Result<Self> {
        Ok(self)
    }

    fn associativity(&self) -> Associativity {
        match self {
            Self::Exponentiate => Associativity::Right,
            _ => Associativity::Left,
        }
    }

    fn precedence(&self) -> Precedence {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Equal | Self::NotEqual | Self::Like => 4,
            Self::GreaterThan | Self::GreaterThanOrEqual | Self::LessThan | Self::LessThanOrEqual => 5,
            Self::Add | Self::Subtract => 6,
            Self::Multiply | Self::Divide | Self::Modulo => 7,
            Self::Exponentiate => 8,
        }
    }
}

impl InfixOperator {
    fn build(&self, lhs: Expression, rhs: Expression) -> Expression {
        let (lhs, rhs) = (Box::new(lhs), Box::new(rhs));
        match self {
            Self::Add => ast::Operator::Add(lhs, rhs),
            Self::And => ast::Operator::And(lhs, rhs),
            Self::Divide => ast::Operator::Divide(lhs, rhs),
            Self::Equal => ast::Operator::Equal(lhs, rhs),
            Self::Exponentiate => ast::Operator::Exponentiate(lhs, rhs),
            Self::GreaterThan => ast::Operator::GreaterThan(lhs, rhs),
            Self::GreaterThanOrEqual => ast::Operator::GreaterThanOrEqual(lhs, rhs),
            Self::LessThan => ast::Operator::LessThan(lhs, rhs),
            Self::LessThanOrEqual => ast::Operator::LessThanOrEqual(lhs, rhs),
            Self::Like => ast::Operator::Like(lhs, rhs),
            Self::Modulo => ast::Operator::Modulo(lhs, rhs),
            Self::Multiply => ast::Operator::Multiply(lhs, rhs),
            Self::NotEqual => ast::Operator::NotEqual(lhs, rhs),
            Self::Or => ast::Operator::Or(lhs, rhs),
            Self::Subtract => ast::Operator::Subtract(lhs, rhs),
        }
        .into()
    }
}

enum PostfixOperator {
    Factorial,
    IsNull { not: bool },
}

impl ParseOperator for PostfixOperator {
    fn from_token(token: &Token) -> Option<Self> {
        match token {
            Token::Exclamation => Some(Self::Factorial),
            Token::Keyword(Keyword::Is) => Some(Self::IsNull { not: false }),
            _ => None,
        }
    }

    fn augment(self, parser: &mut Parser) -> Result<Self> {
        match self {
            Self::IsNull { .. } => {
                let not = parser.next_is(Keyword::Not);
                parser.expect(Keyword::Null)?;
                Ok(Self::IsNull { not })
            }
            Self::Factorial => Ok(self),
        }
    }

    fn associativity(&self) -> Associativity {
        Associativity::Left
    }

    fn precedence(&self) -> Precedence {
        9
    }
}

impl PostfixOperator {
    fn build(&self, lhs: Expression) -> Expression {
        let lhs = Box::new(lhs);
        match self {
            Self::Factorial => ast::Operator::Factorial(lhs).into(),
            Self::IsNull { not: false } => ast::Operator::IsNull(lhs).into(),
            Self::IsNull { not: true } => {
                ast::Operator::Not(Box::new(ast::Operator::IsNull(lhs).into())).into()
            }
        }
    }
}
