//! Recursive-descent parser for the expression sublanguage.
//!
//! Precedence, low to high: ternary `?:` (right-associative), `||`, `&&`,
//! comparisons, unary `!`, primaries. Parse failures are reported as
//! [`ParseError`] and degrade to `null` at the resolver surface.

use serde_json::Value;

use super::lexer::{tokenize, LexError, Token};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Segment {
    Key(String),
    Index(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParseError(pub String);

impl From<LexError> for ParseError {
    fn from(err: LexError) -> Self {
        ParseError(err.0)
    }
}

pub(crate) fn parse(src: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(ParseError("empty expression".to_string()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(ParseError("unexpected trailing tokens".to_string()));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), ParseError> {
        match self.bump() {
            Some(found) if found == token => Ok(()),
            other => Err(ParseError(format!(
                "expected {:?}, found {:?}",
                token, other
            ))),
        }
    }

    fn ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.or()?;
        if self.peek() == Some(&Token::Question) {
            self.bump();
            // Right-associative: each branch may itself be a ternary.
            let then_branch = self.ternary()?;
            self.expect(Token::Colon)?;
            let else_branch = self.ternary()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            });
        }
        Ok(cond)
    }

    fn or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let rhs = self.and()?;
            lhs = Expr::Binary {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.comparison()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let rhs = self.comparison()?;
            lhs = Expr::Binary {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::NotEq) => BinOp::Ne,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                _ => break,
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Bang) {
            self.bump();
            let inner = self.unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Expr::Literal(Value::from(n))),
            Some(Token::Float(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => self.path(name),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(ParseError(format!("unexpected token {:?}", other))),
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, ParseError> {
        let mut segments = vec![Segment::Key(first)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(name)) => segments.push(Segment::Key(name)),
                        other => {
                            return Err(ParseError(format!(
                                "expected identifier after '.', found {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.bump();
                    match self.bump() {
                        Some(Token::Int(i)) => segments.push(Segment::Index(i)),
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        other => {
                            return Err(ParseError(format!(
                                "expected index or quoted key, found {:?}",
                                other
                            )))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}
