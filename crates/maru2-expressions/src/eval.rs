//! Expression evaluation against a caller-provided [`Scope`].

use std::cell::Cell;

use thiserror::Error;

use crate::{BinOp, Expr, UnOp};

/// The runtime value model: plain JSON values.
///
/// Step outputs and effective inputs both round-trip through this type, so
/// `from(...)` and `input(...)` can hand back anything a workflow can
/// express.
pub type Value = serde_json::Value;

/// The evaluation environment an expression runs against.
///
/// The engine implements this once per step; all lookups observe state
/// snapshotted at step entry.
pub trait Scope {
    /// The effective value of a task input, if one is set.
    fn input(&self, name: &str) -> Option<Value>;

    /// A captured output of an earlier identified step.
    fn output(&self, step_id: &str, key: &str) -> Option<Value>;

    /// Whether the surrounding task has recorded a failure.
    fn failed(&self) -> bool {
        false
    }

    /// Whether the surrounding task was cancelled by a signal. Timeouts do
    /// not count.
    fn cancelled(&self) -> bool {
        false
    }

    /// Resolves a `which("name")` lookup: a registered shortcut value, or
    /// an executable on `PATH`.
    fn which(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Errors produced during evaluation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    /// `input("name")` had no effective value.
    #[error("input `{0}` has no value")]
    MissingInput(String),

    /// `from("id", "key")` named an output that was never captured.
    #[error("no output `{key}` recorded for step `{step}`")]
    MissingOutput {
        /// The step id that was queried.
        step: String,
        /// The output key that was queried.
        key: String,
    },

    /// `which("name")` found no shortcut and no executable.
    #[error("`{0}` not found")]
    WhichNotFound(String),

    /// A call to a function this language doesn't have.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// A bare identifier other than `os`, `arch`, or `platform`.
    #[error("unknown identifier `{0}`")]
    UnknownIdentifier(String),

    /// A function was called with the wrong number or kind of arguments.
    #[error("bad arguments to `{func}`: {message}")]
    BadArguments {
        /// The function that was called.
        func: String,
        /// What was wrong.
        message: String,
    },

    /// An operand had an unusable type.
    #[error("type error: {0}")]
    Type(String),
}

/// Evaluates expressions against a [`Scope`].
///
/// The evaluator tracks whether `always()` was called, which the engine
/// uses to force a conditional's result regardless of the rest of the
/// boolean tree.
pub struct Evaluator<'s> {
    scope: &'s dyn Scope,
    dry_run: bool,
    always_called: Cell<bool>,
}

impl<'s> Evaluator<'s> {
    /// Creates an evaluator over the given scope.
    ///
    /// In dry-run mode, missing inputs and outputs evaluate to placeholder
    /// markers instead of erroring.
    pub fn new(scope: &'s dyn Scope, dry_run: bool) -> Self {
        Self {
            scope,
            dry_run,
            always_called: Cell::new(false),
        }
    }

    /// Whether `always()` was called during any evaluation so far.
    pub fn always_called(&self) -> bool {
        self.always_called.get()
    }

    /// Evaluates a conditional: the value must come out boolean or nil
    /// (nil is false), and a call to `always()` anywhere in the tree
    /// forces the result to true.
    pub fn evaluate_condition(&self, expr: &Expr) -> Result<bool, EvalError> {
        let value = self.evaluate(expr)?;
        let result = match value {
            Value::Null => false,
            Value::Bool(b) => b,
            other => {
                return Err(EvalError::Type(format!(
                    "conditional must evaluate to a boolean or nil, got {other}"
                )));
            }
        };

        Ok(self.always_called.get() || result)
    }

    /// Evaluates an expression to a [`Value`].
    pub fn evaluate(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Number(n) => Ok(number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Boolean(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Call { func, args } => self.call(func.0, args),
            Expr::Identifier(ident) => self.identifier(ident.0),
            Expr::Index { expr, index } => {
                let value = self.evaluate(expr)?;
                let index = self.evaluate(index)?;
                Ok(index_value(&value, &index)?)
            }
            Expr::BinOp { lhs, op, rhs } => self.binop(lhs, *op, rhs),
            Expr::UnOp {
                op: UnOp::Not,
                expr,
            } => Ok(Value::Bool(!truthy(&self.evaluate(expr)?)?)),
        }
    }

    fn identifier(&self, name: &str) -> Result<Value, EvalError> {
        if name.eq_ignore_ascii_case("os") {
            Ok(Value::String(std::env::consts::OS.into()))
        } else if name.eq_ignore_ascii_case("arch") {
            Ok(Value::String(std::env::consts::ARCH.into()))
        } else if name.eq_ignore_ascii_case("platform") {
            Ok(Value::String(format!(
                "{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            )))
        } else {
            Err(EvalError::UnknownIdentifier(name.into()))
        }
    }

    fn call(&self, func: &str, args: &[Expr]) -> Result<Value, EvalError> {
        let args = args
            .iter()
            .map(|arg| self.evaluate(arg))
            .collect::<Result<Vec<_>, _>>()?;

        if func.eq_ignore_ascii_case("failure") {
            expect_arity(func, &args, 0)?;
            Ok(Value::Bool(self.scope.failed()))
        } else if func.eq_ignore_ascii_case("always") {
            expect_arity(func, &args, 0)?;
            self.always_called.set(true);
            Ok(Value::Bool(true))
        } else if func.eq_ignore_ascii_case("cancelled") {
            expect_arity(func, &args, 0)?;
            Ok(Value::Bool(self.scope.cancelled()))
        } else if func.eq_ignore_ascii_case("input") {
            expect_arity(func, &args, 1)?;
            let name = string_arg(func, &args[0])?;
            match self.scope.input(name) {
                Some(value) => Ok(value),
                None if self.dry_run => Ok(Value::String(format!("❯ input {name} ❮"))),
                None => Err(EvalError::MissingInput(name.into())),
            }
        } else if func.eq_ignore_ascii_case("from") {
            expect_arity(func, &args, 2)?;
            let step = string_arg(func, &args[0])?;
            let key = string_arg(func, &args[1])?;
            match self.scope.output(step, key) {
                Some(value) => Ok(value),
                None if self.dry_run => Ok(Value::String(format!("❯ from {step} {key} ❮"))),
                None => Err(EvalError::MissingOutput {
                    step: step.into(),
                    key: key.into(),
                }),
            }
        } else if func.eq_ignore_ascii_case("which") {
            expect_arity(func, &args, 1)?;
            let name = string_arg(func, &args[0])?;
            self.scope
                .which(name)
                .map(Value::String)
                .ok_or_else(|| EvalError::WhichNotFound(name.into()))
        } else if func.eq_ignore_ascii_case("len") {
            expect_arity(func, &args, 1)?;
            let len = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(EvalError::Type(format!(
                        "len() wants a string, list, or map, got {other}"
                    )));
                }
            };
            Ok(number(len as f64))
        } else {
            Err(EvalError::UnknownFunction(func.into()))
        }
    }

    fn binop(&self, lhs: &Expr, op: BinOp, rhs: &Expr) -> Result<Value, EvalError> {
        // && and || short-circuit; everything else is strict.
        match op {
            BinOp::And => {
                if !truthy(&self.evaluate(lhs)?)? {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(truthy(&self.evaluate(rhs)?)?));
            }
            BinOp::Or => {
                if truthy(&self.evaluate(lhs)?)? {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(truthy(&self.evaluate(rhs)?)?));
            }
            _ => {}
        }

        let lhs = self.evaluate(lhs)?;
        let rhs = self.evaluate(rhs)?;

        match op {
            BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
            BinOp::Neq => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
            BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
                let ordering = compare(&lhs, &rhs)?;
                Ok(Value::Bool(match op {
                    BinOp::Gt => ordering.is_gt(),
                    BinOp::Ge => ordering.is_ge(),
                    BinOp::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }))
            }
            BinOp::Add => match (&lhs, &rhs) {
                (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
                _ => Ok(number(number_of(&lhs)? + number_of(&rhs)?)),
            },
            BinOp::Sub => Ok(number(number_of(&lhs)? - number_of(&rhs)?)),
            BinOp::Mul => Ok(number(number_of(&lhs)? * number_of(&rhs)?)),
            BinOp::Div => Ok(number(number_of(&lhs)? / number_of(&rhs)?)),
            BinOp::In => contains(&lhs, &rhs).map(Value::Bool),
            BinOp::And | BinOp::Or => unreachable!(),
        }
    }
}

/// Builds a numeric [`Value`], preferring integer representation when the
/// number is integral so that stringification doesn't grow a `.0` suffix.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn number_of(value: &Value) -> Result<f64, EvalError> {
    value
        .as_f64()
        .ok_or_else(|| EvalError::Type(format!("expected a number, got {value}")))
}

fn truthy(value: &Value) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        other => Err(EvalError::Type(format!("expected a boolean, got {other}"))),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering, EvalError> {
    match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => {
            let (a, b) = (number_of(lhs)?, number_of(rhs)?);
            a.partial_cmp(&b)
                .ok_or_else(|| EvalError::Type("numbers are not comparable".into()))
        }
    }
}

fn contains(needle: &Value, haystack: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(needle, item))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(EvalError::Type(format!(
                "`in` on a string wants a string needle, got {other}"
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            other => Err(EvalError::Type(format!(
                "`in` on a map wants a string key, got {other}"
            ))),
        },
        other => Err(EvalError::Type(format!(
            "`in` wants a list, string, or map on the right, got {other}"
        ))),
    }
}

fn index_value(value: &Value, index: &Value) -> Result<Value, EvalError> {
    match (value, index) {
        (Value::Array(items), index) => {
            let i = number_of(index)? as usize;
            Ok(items.get(i).cloned().unwrap_or(Value::Null))
        }
        (Value::Object(map), Value::String(key)) => {
            Ok(map.get(key).cloned().unwrap_or(Value::Null))
        }
        _ => Err(EvalError::Type(format!(
            "cannot index {value} with {index}"
        ))),
    }
}

fn expect_arity(func: &str, args: &[Value], want: usize) -> Result<(), EvalError> {
    if args.len() != want {
        return Err(EvalError::BadArguments {
            func: func.into(),
            message: format!("expected {want} argument(s), got {}", args.len()),
        });
    }
    Ok(())
}

fn string_arg<'v>(func: &str, arg: &'v Value) -> Result<&'v str, EvalError> {
    arg.as_str().ok_or_else(|| EvalError::BadArguments {
        func: func.into(),
        message: format!("expected a string argument, got {arg}"),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::Expr;

    #[derive(Default)]
    struct TestScope {
        inputs: HashMap<String, Value>,
        outputs: HashMap<(String, String), Value>,
        failed: bool,
        cancelled: bool,
    }

    impl Scope for TestScope {
        fn input(&self, name: &str) -> Option<Value> {
            self.inputs.get(name).cloned()
        }

        fn output(&self, step_id: &str, key: &str) -> Option<Value> {
            self.outputs
                .get(&(step_id.to_string(), key.to_string()))
                .cloned()
        }

        fn failed(&self) -> bool {
            self.failed
        }

        fn cancelled(&self) -> bool {
            self.cancelled
        }

        fn which(&self, name: &str) -> Option<String> {
            (name == "go").then(|| "/usr/local/bin/go".to_string())
        }
    }

    fn eval(expr: &str, scope: &TestScope) -> Result<Value, EvalError> {
        Evaluator::new(scope, false).evaluate(&Expr::parse(expr).unwrap())
    }

    fn cond(expr: &str, scope: &TestScope) -> Result<bool, EvalError> {
        Evaluator::new(scope, false).evaluate_condition(&Expr::parse(expr).unwrap())
    }

    #[test]
    fn arithmetic_and_comparison() {
        let scope = TestScope::default();
        assert_eq!(eval("1 + 2 * 3", &scope).unwrap(), json!(7));
        assert_eq!(eval("10 / 4", &scope).unwrap(), json!(2.5));
        assert_eq!(eval("'a' + 'b'", &scope).unwrap(), json!("ab"));
        assert_eq!(cond("2 >= 2", &scope).unwrap(), true);
        assert_eq!(cond("'abc' < 'abd'", &scope).unwrap(), true);
        assert_eq!(cond("1 == 1.0", &scope).unwrap(), true);
        assert_eq!(cond("'1' == 1", &scope).unwrap(), false);
    }

    #[test]
    fn failure_always_cancelled() {
        let scope = TestScope {
            failed: true,
            ..Default::default()
        };
        assert_eq!(cond("failure()", &scope).unwrap(), true);
        assert_eq!(cond("!failure()", &scope).unwrap(), false);
        assert_eq!(cond("cancelled()", &scope).unwrap(), false);

        // always() forces the result even when the tree says false.
        assert_eq!(cond("always() && false", &scope).unwrap(), true);
        // ...but short-circuiting means an unreached always() has no say.
        assert_eq!(cond("false && always()", &scope).unwrap(), false);
    }

    #[test]
    fn inputs_and_outputs() {
        let mut scope = TestScope::default();
        scope.inputs.insert("count".into(), json!(5));
        scope
            .outputs
            .insert(("build".into(), "version".into()), json!("1.2.3"));

        assert_eq!(eval("input('count') + 1", &scope).unwrap(), json!(6));
        assert_eq!(
            eval("from('build', 'version')", &scope).unwrap(),
            json!("1.2.3")
        );
        assert_eq!(
            eval("input('missing')", &scope).unwrap_err(),
            EvalError::MissingInput("missing".into())
        );
        assert_eq!(
            eval("from('build', 'nope')", &scope).unwrap_err(),
            EvalError::MissingOutput {
                step: "build".into(),
                key: "nope".into()
            }
        );
    }

    #[test]
    fn dry_run_placeholders() {
        let scope = TestScope::default();
        let evaluator = Evaluator::new(&scope, true);
        assert_eq!(
            evaluator
                .evaluate(&Expr::parse("input('name')").unwrap())
                .unwrap(),
            json!("❯ input name ❮")
        );
        assert_eq!(
            evaluator
                .evaluate(&Expr::parse("from('a', 'b')").unwrap())
                .unwrap(),
            json!("❯ from a b ❮")
        );
    }

    #[test]
    fn in_len_index() {
        let mut scope = TestScope::default();
        scope.inputs.insert("targets".into(), json!(["amd", "arm"]));

        assert_eq!(cond("'amd' in input('targets')", &scope).unwrap(), true);
        assert_eq!(cond("'x' in input('targets')", &scope).unwrap(), false);
        assert_eq!(cond("'ell' in 'hello'", &scope).unwrap(), true);
        assert_eq!(eval("len(input('targets'))", &scope).unwrap(), json!(2));
        assert_eq!(eval("len('héllo')", &scope).unwrap(), json!(5));
        assert_eq!(
            eval("input('targets')[1]", &scope).unwrap(),
            json!("arm")
        );
        assert_eq!(eval("input('targets')[9]", &scope).unwrap(), Value::Null);
    }

    #[test]
    fn platform_identifiers() {
        let scope = TestScope::default();
        assert_eq!(
            eval("os", &scope).unwrap(),
            json!(std::env::consts::OS)
        );
        // Identifiers are case-insensitive, so the template spellings work.
        assert_eq!(
            eval("PLATFORM", &scope).unwrap(),
            json!(format!(
                "{}/{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            ))
        );
    }

    #[test]
    fn conditions_must_be_boolean() {
        let scope = TestScope::default();
        assert!(matches!(
            cond("1 + 1", &scope).unwrap_err(),
            EvalError::Type(_)
        ));
        // nil is allowed and falsy.
        assert_eq!(cond("nil", &scope).unwrap(), false);
    }

    #[test]
    fn which_lookup() {
        let scope = TestScope::default();
        assert_eq!(
            eval("which('go')", &scope).unwrap(),
            json!("/usr/local/bin/go")
        );
        assert_eq!(
            eval("which('definitely-not-here')", &scope).unwrap_err(),
            EvalError::WhichNotFound("definitely-not-here".into())
        );
    }
}
