//! maru2 expression parsing and evaluation.
//!
//! One grammar backs both of maru2's expression surfaces: step `if:`
//! conditionals and the spans inside `${{ ... }}` text templates. The two
//! surfaces differ only in how the resulting value is consumed, which is
//! the caller's business ([`Evaluator::evaluate_condition`] vs
//! [`Evaluator::evaluate`]).

#![forbid(unsafe_code)]
#![deny(missing_docs)]

use itertools::Itertools;
use pest::{Parser, iterators::Pair};
use thiserror::Error;

use self::parser::{ExprParser, Rule};

mod eval;
pub mod op;

pub use eval::{EvalError, Evaluator, Scope, Value};
pub use op::{BinOp, UnOp};

// Isolates the ExprParser, Rule and other generated types
// so that we can do `missing_docs` at the top-level.
// See: https://github.com/pest-parser/pest/issues/326
mod parser {
    use pest_derive::Parser;

    /// A parser for maru2's expression language.
    #[derive(Parser)]
    #[grammar = "expr.pest"]
    pub struct ExprParser;
}

/// An expression failed to parse.
///
/// The message preserves pest's `line:col` diagnostics.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid expression:\n{0}")]
pub struct ParseError(String);

/// Represents a function in a maru2 expression.
///
/// Function names are case-insensitive.
#[derive(Debug)]
pub struct Function<'src>(pub(crate) &'src str);

impl PartialEq for Function<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Function<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Represents an identifier in a maru2 expression, e.g. `os` or `platform`.
///
/// Identifiers are case-insensitive.
#[derive(Debug)]
pub struct Identifier<'src>(pub(crate) &'src str);

impl PartialEq for Identifier<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(other.0)
    }
}

impl PartialEq<str> for Identifier<'_> {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

/// Represents a maru2 expression.
#[derive(Debug, PartialEq)]
pub enum Expr<'src> {
    /// A number literal.
    Number(f64),
    /// A string literal.
    String(String),
    /// A boolean literal.
    Boolean(bool),
    /// The `nil`/`null` literal.
    Null,
    /// A function call.
    Call {
        /// The function name, e.g. `input` in `input("name")`.
        func: Function<'src>,
        /// The function's arguments.
        args: Vec<Expr<'src>>,
    },
    /// A bare identifier, e.g. `os`.
    Identifier(Identifier<'src>),
    /// An index operation, e.g. `foo[0]`.
    Index {
        /// The expression being indexed.
        expr: Box<Expr<'src>>,
        /// The index expression.
        index: Box<Expr<'src>>,
    },
    /// A binary operation, either logical or arithmetic.
    BinOp {
        /// The LHS of the binop.
        lhs: Box<Expr<'src>>,
        /// The binary operator.
        op: BinOp,
        /// The RHS of the binop.
        rhs: Box<Expr<'src>>,
    },
    /// A unary operation. Negation (`!`) is currently the only `UnOp`.
    UnOp {
        /// The unary operator.
        op: UnOp,
        /// The expression to apply the operator to.
        expr: Box<Expr<'src>>,
    },
}

impl<'src> Expr<'src> {
    /// Convenience API for making an [`Expr::String`].
    fn string(s: impl Into<String>) -> Self {
        Self::String(s.into())
    }

    /// Parses the given string into an expression.
    pub fn parse(expr: &'src str) -> Result<Expr<'src>, ParseError> {
        // Top level `expression` is a single `or_expr`.
        let or_expr = ExprParser::parse(Rule::expression, expr)
            .map_err(|e| ParseError(e.to_string()))?
            .next()
            .unwrap()
            .into_inner()
            .next()
            .unwrap();

        parse_pair(or_expr).map(|expr| *expr)
    }
}

fn binop_for(pair: &Pair<'_, Rule>) -> BinOp {
    match (pair.as_rule(), pair.as_str()) {
        (Rule::eq_op, "==") => BinOp::Eq,
        (Rule::eq_op, "!=") => BinOp::Neq,
        (Rule::comp_op, ">") => BinOp::Gt,
        (Rule::comp_op, ">=") => BinOp::Ge,
        (Rule::comp_op, "<") => BinOp::Lt,
        (Rule::comp_op, "<=") => BinOp::Le,
        (Rule::in_op, _) => BinOp::In,
        (Rule::add_op, "+") => BinOp::Add,
        (Rule::add_op, "-") => BinOp::Sub,
        (Rule::mul_op, "*") => BinOp::Mul,
        (Rule::mul_op, "/") => BinOp::Div,
        _ => unreachable!(),
    }
}

fn parse_pair(pair: Pair<'_, Rule>) -> Result<Box<Expr<'_>>, ParseError> {
    // We're parsing a pest grammar, which isn't left-recursive.
    // As a result, we have constructions like
    // `or_expr = { and_expr ~ ("||" ~ and_expr)* }`, which
    // result in wonky ASTs like one or many (>2) headed ORs.
    // We turn these into sane looking ASTs by punching the single
    // pairs down to their primitive type and folding the
    // many-headed pairs appropriately.

    match pair.as_rule() {
        Rule::or_expr | Rule::and_expr => {
            let op = match pair.as_rule() {
                Rule::or_expr => BinOp::Or,
                _ => BinOp::And,
            };
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().unwrap())?;
            pairs.try_fold(lhs, |expr, next| {
                Ok(Expr::BinOp {
                    lhs: expr,
                    op,
                    rhs: parse_pair(next)?,
                }
                .into())
            })
        }
        Rule::eq_expr | Rule::comp_expr | Rule::in_expr | Rule::add_expr | Rule::mul_expr => {
            // These rules capture their operator in a dedicated pair,
            // so we fold with two-tuples of (op, operand).
            let mut pairs = pair.into_inner();
            let lhs = parse_pair(pairs.next().unwrap())?;

            let pair_chunks = pairs.chunks(2);
            pair_chunks.into_iter().try_fold(lhs, |expr, mut next| {
                let op = next.next().unwrap();
                let operand = next.next().unwrap();

                Ok(Expr::BinOp {
                    lhs: expr,
                    op: binop_for(&op),
                    rhs: parse_pair(operand)?,
                }
                .into())
            })
        }
        Rule::unary_expr => {
            let mut pairs = pair.into_inner();
            let pair = pairs.next().unwrap();

            match pair.as_rule() {
                Rule::unary_op => Ok(Expr::UnOp {
                    op: UnOp::Not,
                    expr: parse_pair(pairs.next().unwrap())?,
                }
                .into()),
                Rule::postfix_expr => parse_pair(pair),
                _ => unreachable!(),
            }
        }
        Rule::postfix_expr => {
            let mut pairs = pair.into_inner();
            let primary = parse_pair(pairs.next().unwrap())?;
            pairs.try_fold(primary, |expr, index| {
                Ok(Expr::Index {
                    expr,
                    index: parse_pair(index.into_inner().next().unwrap())?,
                }
                .into())
            })
        }
        Rule::primary_expr => {
            // Punt back to the top level match to keep things simple.
            parse_pair(pair.into_inner().next().unwrap())
        }
        Rule::call => {
            let mut pairs = pair.into_inner();
            let func = Function(pairs.next().unwrap().as_str());
            let args = pairs
                .map(|arg| parse_pair(arg).map(|arg| *arg))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Call { func, args }.into())
        }
        Rule::literal => parse_pair(pair.into_inner().next().unwrap()),
        Rule::number => Ok(Expr::Number(pair.as_str().parse().unwrap()).into()),
        Rule::string => {
            let inner = pair.into_inner().next().unwrap();
            let unescaped = match inner.as_rule() {
                Rule::single_quoted => inner.as_str().replace("''", "'"),
                _ => inner.as_str().to_string(),
            };
            Ok(Expr::string(unescaped).into())
        }
        Rule::boolean => Ok(Expr::Boolean(pair.as_str() == "true").into()),
        Rule::null => Ok(Expr::Null.into()),
        Rule::identifier => Ok(Expr::Identifier(Identifier(pair.as_str())).into()),
        _ => unreachable!(),
    }
}
