//! Rule condition language
//!
//! Hybrid rules carry arithmetic comparisons over the named market-context
//! fields ("volatility > 0.30", "abs(trend_strength) > 0.7", ...). Conditions
//! are parsed here by a small recursive-descent parser; anything outside the
//! grammar is rejected at parse time. There is no host-language evaluation of
//! rule text anywhere.
//!
//! Grammar:
//!
//! ```text
//! expr       := and_expr ( "or" and_expr )*
//! and_expr   := not_expr ( "and" not_expr )*
//! not_expr   := "not" not_expr | comparison
//! comparison := operand ( ("<" | ">" | "<=" | ">=" | "==" | "!=") operand )?
//! operand    := "-" operand
//!             | number
//!             | field
//!             | ("abs" | "min" | "max") "(" expr { "," expr } ")"
//!             | "(" expr ")"
//! ```

use thiserror::Error;

use crate::models::MarketContext;

/// Context fields a condition may reference
const FIELDS: &[&str] = &[
    "volatility",
    "liquidity",
    "trend_strength",
    "aum",
    "portfolio_concentration",
    "recent_drawdown",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("condition parse error: {0}")]
    Parse(String),
    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),
    #[error("condition evaluation error: {0}")]
    Eval(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Ident(usize),
    Func(Func),
    Number(f64),
    LParen,
    RParen,
    Comma,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    And,
    Or,
    Not,
    Minus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
}

/// Parsed condition, ready for repeated evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(usize),
    Neg(Box<Expr>),
    Call(Func, Vec<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// One of the two value kinds the evaluator produces
#[derive(Debug, Clone, Copy, PartialEq)]
enum EvalValue {
    Num(f64),
    Bool(bool),
}

/// Parse a condition string into an [`Expr`]
pub fn parse_condition(input: &str) -> Result<Expr, RuleError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(RuleError::Parse(format!(
            "unexpected trailing input at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

/// Evaluate a parsed condition against a market context
///
/// The expression must reduce to a boolean; a numeric result is an
/// evaluation error (which callers treat as "rule did not fire").
pub fn eval_condition(expr: &Expr, context: &MarketContext) -> Result<bool, RuleError> {
    match eval(expr, context)? {
        EvalValue::Bool(result) => Ok(result),
        EvalValue::Num(_) => Err(RuleError::Eval(
            "condition reduced to a number, expected a comparison".into(),
        )),
    }
}

fn lex(input: &str) -> Result<Vec<Token>, RuleError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(RuleError::Parse("single '=' is not an operator".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(RuleError::Parse("single '!' is not an operator".into()));
                }
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| RuleError::Parse(format!("bad number literal: {text}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "abs" => Token::Func(Func::Abs),
                    "min" => Token::Func(Func::Min),
                    "max" => Token::Func(Func::Max),
                    field => match FIELDS.iter().position(|f| *f == field) {
                        Some(index) => Token::Ident(index),
                        None => return Err(RuleError::UnknownIdentifier(word)),
                    },
                };
                tokens.push(token);
            }
            other => {
                return Err(RuleError::Parse(format!("unexpected character: {other:?}")));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), RuleError> {
        match self.bump() {
            Some(token) if token == expected => Ok(()),
            other => Err(RuleError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, RuleError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(Token::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, RuleError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(Token::And) {
            self.bump();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, RuleError> {
        if self.peek() == Some(Token::Not) {
            self.bump();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, RuleError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::EqEq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, RuleError> {
        match self.bump() {
            Some(Token::Minus) => {
                let inner = self.parse_operand()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some(Token::Number(number)) => Ok(Expr::Number(number)),
            Some(Token::Ident(index)) => Ok(Expr::Field(index)),
            Some(Token::Func(func)) => {
                self.expect(Token::LParen)?;
                let mut args = vec![self.parse_or()?];
                while self.peek() == Some(Token::Comma) {
                    self.bump();
                    args.push(self.parse_or()?);
                }
                self.expect(Token::RParen)?;

                let arity = match func {
                    Func::Abs => 1,
                    Func::Min | Func::Max => 2,
                };
                if args.len() != arity {
                    return Err(RuleError::Parse(format!(
                        "{func:?} takes {arity} argument(s), got {}",
                        args.len()
                    )));
                }
                Ok(Expr::Call(func, args))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(RuleError::Parse(format!(
                "expected an operand, found {other:?}"
            ))),
        }
    }
}

fn field_value(index: usize, context: &MarketContext) -> f64 {
    match FIELDS[index] {
        "volatility" => context.volatility,
        "liquidity" => context.liquidity,
        "trend_strength" => context.trend_strength,
        "aum" => context.aum,
        "portfolio_concentration" => context.portfolio_concentration,
        "recent_drawdown" => context.recent_drawdown,
        _ => unreachable!("field table and lexer agree"),
    }
}

fn eval(expr: &Expr, context: &MarketContext) -> Result<EvalValue, RuleError> {
    Ok(match expr {
        Expr::Number(number) => EvalValue::Num(*number),
        Expr::Field(index) => EvalValue::Num(field_value(*index, context)),
        Expr::Neg(inner) => EvalValue::Num(-num(inner, context)?),
        Expr::Call(func, args) => {
            let value = match func {
                Func::Abs => num(&args[0], context)?.abs(),
                Func::Min => num(&args[0], context)?.min(num(&args[1], context)?),
                Func::Max => num(&args[0], context)?.max(num(&args[1], context)?),
            };
            EvalValue::Num(value)
        }
        Expr::Compare(left, op, right) => {
            let left = num(left, context)?;
            let right = num(right, context)?;
            EvalValue::Bool(match op {
                CmpOp::Lt => left < right,
                CmpOp::Gt => left > right,
                CmpOp::Le => left <= right,
                CmpOp::Ge => left >= right,
                CmpOp::Eq => left == right,
                CmpOp::Ne => left != right,
            })
        }
        Expr::And(left, right) => EvalValue::Bool(boolean(left, context)? && boolean(right, context)?),
        Expr::Or(left, right) => EvalValue::Bool(boolean(left, context)? || boolean(right, context)?),
        Expr::Not(inner) => EvalValue::Bool(!boolean(inner, context)?),
    })
}

fn num(expr: &Expr, context: &MarketContext) -> Result<f64, RuleError> {
    match eval(expr, context)? {
        EvalValue::Num(number) => Ok(number),
        EvalValue::Bool(_) => Err(RuleError::Eval("expected a number, found a boolean".into())),
    }
}

fn boolean(expr: &Expr, context: &MarketContext) -> Result<bool, RuleError> {
    match eval(expr, context)? {
        EvalValue::Bool(result) => Ok(result),
        EvalValue::Num(_) => Err(RuleError::Eval("expected a boolean, found a number".into())),
    }
}
