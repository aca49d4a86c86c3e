//! Recursive-descent parser producing [`Expr`] trees.
//!
//! Precedence, loosest first: comparisons, `&`, `+ -`, `* /`, unary `-`.
//! All binary operators are left-associative.

use super::lexer::Token;
use crate::error::FormulaError;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::Ne => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Concat => "&",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    And,
    Or,
    Not,
    Xor,
    If,
    Lower,
    Upper,
    Trim,
    Len,
    Find,
    Concatenate,
    IsBlank,
    Blank,
    True,
    False,
}

impl Func {
    fn lookup(name: &str) -> Option<Func> {
        Some(match name {
            "AND" => Func::And,
            "OR" => Func::Or,
            "NOT" => Func::Not,
            "XOR" => Func::Xor,
            "IF" => Func::If,
            "LOWER" => Func::Lower,
            "UPPER" => Func::Upper,
            "TRIM" => Func::Trim,
            "LEN" => Func::Len,
            "FIND" => Func::Find,
            "CONCATENATE" | "CONCAT" => Func::Concatenate,
            "ISBLANK" => Func::IsBlank,
            "BLANK" => Func::Blank,
            "TRUE" => Func::True,
            "FALSE" => Func::False,
            _ => return None,
        })
    }

    /// Inclusive argument-count bounds; `None` upper bound is variadic.
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Func::And | Func::Or | Func::Xor | Func::Concatenate => (1, None),
            Func::Not | Func::Lower | Func::Upper | Func::Trim | Func::Len | Func::IsBlank => {
                (1, Some(1))
            }
            Func::If => (2, Some(3)),
            Func::Find => (2, Some(2)),
            Func::Blank | Func::True | Func::False => (0, Some(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Func::And => "AND",
            Func::Or => "OR",
            Func::Not => "NOT",
            Func::Xor => "XOR",
            Func::If => "IF",
            Func::Lower => "LOWER",
            Func::Upper => "UPPER",
            Func::Trim => "TRIM",
            Func::Len => "LEN",
            Func::Find => "FIND",
            Func::Concatenate => "CONCATENATE",
            Func::IsBlank => "ISBLANK",
            Func::Blank => "BLANK",
            Func::True => "TRUE",
            Func::False => "FALSE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

/// Parse a complete token stream.
pub fn parse(tokens: &[Token]) -> Result<Expr, FormulaError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.comparison()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(FormulaError::UnexpectedToken {
            found: tok.describe(),
            expected: "end of formula".into(),
        }),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Token, what: &str) -> Result<(), FormulaError> {
        match self.next() {
            Some(tok) if *tok == want => Ok(()),
            Some(tok) => Err(FormulaError::UnexpectedToken {
                found: tok.describe(),
                expected: what.into(),
            }),
            None => Err(FormulaError::UnexpectedToken {
                found: "end of formula".into(),
                expected: what.into(),
            }),
        }
    }

    fn comparison(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.concat()?;
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.concat()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn concat(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.additive()?;
        while let Some(Token::Amp) = self.peek() {
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Expr::Binary(BinOp::Concat, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(*i))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Text(s.clone()))),
            Some(Token::Ref(name)) => Ok(Expr::Field(name.clone())),
            Some(Token::LParen) => {
                let inner = self.comparison()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => self.call_or_constant(name),
            Some(tok) => Err(FormulaError::UnexpectedToken {
                found: tok.describe(),
                expected: "a value".into(),
            }),
            None => Err(FormulaError::UnexpectedToken {
                found: "end of formula".into(),
                expected: "a value".into(),
            }),
        }
    }

    fn call_or_constant(&mut self, name: &str) -> Result<Expr, FormulaError> {
        let has_parens = matches!(self.peek(), Some(Token::LParen));
        if !has_parens {
            return match name {
                "TRUE" => Ok(Expr::Literal(Value::Bool(true))),
                "FALSE" => Ok(Expr::Literal(Value::Bool(false))),
                _ => Err(FormulaError::UnexpectedToken {
                    found: format!("identifier {name}"),
                    expected: "'(' after function name".into(),
                }),
            };
        }
        let func = Func::lookup(name).ok_or_else(|| FormulaError::UnknownFunction {
            name: name.to_string(),
        })?;
        self.pos += 1;

        let mut args = Vec::new();
        if !matches!(self.peek(), Some(Token::RParen)) {
            loop {
                args.push(self.comparison()?);
                match self.peek() {
                    Some(Token::Comma) => self.pos += 1,
                    _ => break,
                }
            }
        }
        self.expect(Token::RParen, "',' or ')'")?;

        let (min, max) = func.arity();
        if args.len() < min || max.is_some_and(|m| args.len() > m) {
            let expected = match max {
                Some(m) if m == min => min.to_string(),
                Some(m) => format!("{min}..{m}"),
                None => format!("at least {min}"),
            };
            return Err(FormulaError::Arity {
                function: func.name().to_string(),
                expected,
                got: args.len(),
            });
        }
        Ok(match func {
            Func::True => Expr::Literal(Value::Bool(true)),
            Func::False => Expr::Literal(Value::Bool(false)),
            Func::Blank => Expr::Literal(Value::Absent),
            other => Expr::Call(other, args),
        })
    }
}
