//! Arithmetic formula language: numbers, variable names, `+ - * / **`,
//! unary sign and parentheses.
//!
//! Precedence follows the usual convention: `**` binds tightest and is
//! right-associative, a leading sign applies to the whole power
//! (`-2 ** 2 == -4`), then `* /`, then `+ -`.

use crate::model::{round4, Scenario};
use logos::Logos;
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("**")]
    Pow,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{}", n),
            Token::Ident(name) => write!(f, "{}", name),
            Token::Pow => write!(f, "**"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

/// Formula could not be parsed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormulaError {
    #[error("Formula is empty")]
    Empty,

    #[error("Unexpected character at position {position}")]
    UnexpectedCharacter { position: usize },

    #[error("Unexpected token '{found}' at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("Unexpected end of formula")]
    UnexpectedEnd,
}

/// Formula parsed fine but could not be evaluated at a scenario.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Result is not a finite number")]
    NonFinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    fn apply(self, lhs: f64, rhs: f64) -> Result<f64, EvalError> {
        match self {
            BinaryOp::Add => Ok(lhs + rhs),
            BinaryOp::Sub => Ok(lhs - rhs),
            BinaryOp::Mul => Ok(lhs * rhs),
            BinaryOp::Div if rhs == 0.0 => Err(EvalError::DivisionByZero),
            BinaryOp::Div => Ok(lhs / rhs),
            BinaryOp::Pow if lhs == 0.0 && rhs < 0.0 => Err(EvalError::DivisionByZero),
            BinaryOp::Pow => Ok(lhs.powf(rhs)),
        }
    }
}

/// Parsed expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

impl Expr {
    fn eval(&self, scenario: &Scenario) -> Result<f64, EvalError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(name) => scenario
                .get(name)
                .copied()
                .ok_or_else(|| EvalError::UnknownVariable(name.clone())),
            Expr::Neg(inner) => Ok(-inner.eval(scenario)?),
            Expr::Binary { op, left, right } => {
                let lhs = left.eval(scenario)?;
                let rhs = right.eval(scenario)?;
                op.apply(lhs, rhs)
            }
        }
    }

    fn collect_variables(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_variables(out),
            Expr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }
}

/// A parsed, reusable formula.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    root: Expr,
    variables: BTreeSet<String>,
}

impl Formula {
    /// Parses `source`.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::Empty);
        }

        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if let Some((token, position)) = parser.tokens.get(parser.pos) {
            return Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                position: *position,
            });
        }

        let mut variables = BTreeSet::new();
        root.collect_variables(&mut variables);

        Ok(Self {
            source: source.to_string(),
            root,
            variables,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Names referenced by the formula.
    pub fn variables(&self) -> &BTreeSet<String> {
        &self.variables
    }

    /// Evaluates at `scenario`, rounded to 4 decimals.
    pub fn evaluate(&self, scenario: &Scenario) -> Result<f64, EvalError> {
        let value = self.root.eval(scenario)?;
        if !value.is_finite() {
            return Err(EvalError::NonFinite);
        }
        Ok(round4(value))
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, FormulaError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let position = lexer.span().start;
        match result {
            Ok(token) => tokens.push((token, position)),
            Err(()) => return Err(FormulaError::UnexpectedCharacter { position }),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(token, _)| token)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let next = self.tokens.get(self.pos).cloned();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = binary(op, left, right);
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
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if self.peek() == Some(&Token::Pow) {
            self.pos += 1;
            // Exponent may carry its own sign and chains to the right.
            let exponent = self.unary()?;
            return Ok(binary(BinaryOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.advance() {
            Some((Token::Number(n), _)) => Ok(Expr::Number(n)),
            Some((Token::Ident(name), _)) => Ok(Expr::Variable(name)),
            Some((Token::LParen, _)) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(inner),
                    Some((token, position)) => Err(FormulaError::UnexpectedToken {
                        found: token.to_string(),
                        position,
                    }),
                    None => Err(FormulaError::UnexpectedEnd),
                }
            }
            Some((token, position)) => Err(FormulaError::UnexpectedToken {
                found: token.to_string(),
                position,
            }),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn scenario(pairs: &[(&str, f64)]) -> Scenario {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn eval(source: &str, pairs: &[(&str, f64)]) -> Result<f64, EvalError> {
        Formula::parse(source).unwrap().evaluate(&scenario(pairs))
    }

    #[test]
    fn test_profit_formula() {
        let value = eval("ingresos - costos", &[("ingresos", 150.0), ("costos", 60.0)]).unwrap();
        assert_eq!(value, 90.0);
    }

    #[test]
    fn test_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]).unwrap(), 7.0);
        assert_eq!(eval("(1 + 2) * 3", &[]).unwrap(), 9.0);
        assert_eq!(eval("10 - 4 - 3", &[]).unwrap(), 3.0);
        assert_eq!(eval("2 * 3 ** 2", &[]).unwrap(), 18.0);
    }

    #[test]
    fn test_power_is_right_associative() {
        assert_eq!(eval("2 ** 3 ** 2", &[]).unwrap(), 512.0);
        assert_eq!(eval("2 ** -1", &[]).unwrap(), 0.5);
    }

    #[test]
    fn test_unary_minus_binds_looser_than_power() {
        assert_eq!(eval("-2 ** 2", &[]).unwrap(), -4.0);
        assert_eq!(eval("(-2) ** 2", &[]).unwrap(), 4.0);
        assert_eq!(eval("--3", &[]).unwrap(), 3.0);
    }

    #[test]
    fn test_circle_area() {
        let value = eval("3.14159 * radio ** 2", &[("radio", 2.0)]).unwrap();
        assert_relative_eq!(value, 12.5664, epsilon = 1e-9);
    }

    #[test]
    fn test_result_is_rounded() {
        assert_eq!(eval("1 / 3", &[]).unwrap(), 0.3333);
    }

    #[test]
    fn test_collects_variables() {
        let formula = Formula::parse("distancia / velocidad + distancia").unwrap();
        let names: Vec<&str> = formula.variables().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["distancia", "velocidad"]);
        assert_eq!(formula.to_string(), "distancia / velocidad + distancia");
    }

    #[test]
    fn test_evaluation_errors() {
        assert_eq!(
            eval("a + b", &[("a", 1.0)]),
            Err(EvalError::UnknownVariable("b".to_string()))
        );
        assert_eq!(eval("a / 0", &[("a", 1.0)]), Err(EvalError::DivisionByZero));
        assert_eq!(eval("0 ** -1", &[]), Err(EvalError::DivisionByZero));
        assert_eq!(eval("10 ** 400", &[]), Err(EvalError::NonFinite));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Formula::parse("   "), Err(FormulaError::Empty));
        assert_eq!(Formula::parse("a +"), Err(FormulaError::UnexpectedEnd));
        assert_eq!(Formula::parse("(a + b"), Err(FormulaError::UnexpectedEnd));
        assert!(matches!(
            Formula::parse("a $ b"),
            Err(FormulaError::UnexpectedCharacter { position: 2 })
        ));
        assert!(matches!(
            Formula::parse("a b"),
            Err(FormulaError::UnexpectedToken { position: 2, .. })
        ));
        assert!(matches!(
            Formula::parse("* a"),
            Err(FormulaError::UnexpectedToken { position: 0, .. })
        ));
    }

    #[test]
    fn test_number_forms() {
        assert_eq!(eval(".5 + 1.", &[]).unwrap(), 1.5);
        assert_eq!(eval("1e2", &[]).unwrap(), 100.0);
    }
}
