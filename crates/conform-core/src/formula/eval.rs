//! Tree-walking evaluator.
//!
//! Field reads go through [`Bindings`], which applies the absence policy.
//! Evaluation here only sees values that are already policy-resolved.

use std::cmp::Ordering;

use super::parser::{BinOp, Expr, Func};
use crate::error::FormulaError;
use crate::value::Value;

/// Source of field values for one record.
pub trait Bindings {
    /// Value of a referenced field, absence policy applied.
    fn lookup(&self, name: &str) -> Result<Value, FormulaError>;
}

/// Truthiness: absent is false, integers are true when non-zero, text when
/// non-empty.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Absent => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Text(s) => !s.is_empty(),
    }
}

/// Type-aware equality. Absent equals absent and the empty string.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Absent, other) | (other, Value::Absent) => other.is_blank(),
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Text(x), Value::Text(y)) => x == y,
        _ => false,
    }
}

pub fn eval(expr: &Expr, env: &dyn Bindings) -> Result<Value, FormulaError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Field(name) => env.lookup(name),
        Expr::Neg(inner) => match eval(inner, env)? {
            Value::Absent => Ok(Value::Absent),
            Value::Int(i) => i
                .checked_neg()
                .map(Value::Int)
                .ok_or(FormulaError::Overflow { op: "-" }),
            other => Err(FormulaError::Type(format!("cannot negate {other}"))),
        },
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, env)?;
            let b = eval(rhs, env)?;
            binary(*op, &a, &b)
        }
        Expr::Call(func, args) => call(*func, args, env),
    }
}

fn binary(op: BinOp, a: &Value, b: &Value) -> Result<Value, FormulaError> {
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(a, b))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(a, b))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let Some(ord) = order(a, b)? else {
                return Ok(Value::Bool(false));
            };
            let result = match op {
                BinOp::Lt => ord == Ordering::Less,
                BinOp::Le => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            Ok(Value::Bool(result))
        }
        BinOp::Concat => Ok(Value::Text(a.coerce_text() + &b.coerce_text())),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arithmetic(op, a, b),
    }
}

/// Ordering for relational operators. `None` when either side is absent.
fn order(a: &Value, b: &Value) -> Result<Option<Ordering>, FormulaError> {
    match (a, b) {
        (Value::Absent, _) | (_, Value::Absent) => Ok(None),
        (Value::Int(x), Value::Int(y)) => Ok(Some(x.cmp(y))),
        (Value::Text(x), Value::Text(y)) => Ok(Some(x.cmp(y))),
        (Value::Bool(x), Value::Bool(y)) => Ok(Some(x.cmp(y))),
        _ => Err(FormulaError::Type(format!("cannot compare {a} with {b}"))),
    }
}

fn arithmetic(op: BinOp, a: &Value, b: &Value) -> Result<Value, FormulaError> {
    let (x, y) = match (a, b) {
        (Value::Absent, _) | (_, Value::Absent) => return Ok(Value::Absent),
        (Value::Int(x), Value::Int(y)) => (*x, *y),
        _ => {
            return Err(FormulaError::Type(format!(
                "'{}' needs integers, got {a} and {b}",
                op.symbol()
            )))
        }
    };
    let result = match op {
        BinOp::Add => x.checked_add(y),
        BinOp::Sub => x.checked_sub(y),
        BinOp::Mul => x.checked_mul(y),
        _ => {
            if y == 0 {
                return Err(FormulaError::DivisionByZero);
            }
            x.checked_div(y)
        }
    };
    result.map(Value::Int).ok_or(FormulaError::Overflow { op: op.symbol() })
}

fn call(func: Func, args: &[Expr], env: &dyn Bindings) -> Result<Value, FormulaError> {
    match func {
        Func::If => {
            let cond = eval(&args[0], env)?;
            if truthy(&cond) {
                eval(&args[1], env)
            } else {
                match args.get(2) {
                    Some(otherwise) => eval(otherwise, env),
                    None => Ok(Value::Bool(false)),
                }
            }
        }
        Func::And => {
            for arg in args {
                if !truthy(&eval(arg, env)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Func::Or => {
            for arg in args {
                if truthy(&eval(arg, env)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Func::Xor => {
            let mut odd = false;
            for arg in args {
                odd ^= truthy(&eval(arg, env)?);
            }
            Ok(Value::Bool(odd))
        }
        Func::Not => Ok(Value::Bool(!truthy(&eval(&args[0], env)?))),
        Func::Lower => Ok(Value::Text(text_arg(args, 0, env)?.to_lowercase())),
        Func::Upper => Ok(Value::Text(text_arg(args, 0, env)?.to_uppercase())),
        Func::Trim => Ok(Value::Text(text_arg(args, 0, env)?.trim().to_string())),
        Func::Len => {
            let n = text_arg(args, 0, env)?.chars().count();
            i64::try_from(n)
                .map(Value::Int)
                .map_err(|_| FormulaError::Overflow { op: "LEN" })
        }
        Func::Find => {
            let needle = text_arg(args, 0, env)?;
            let haystack = text_arg(args, 1, env)?;
            let position = haystack
                .find(&needle)
                .map(|byte| haystack[..byte].chars().count() + 1)
                .unwrap_or(0);
            i64::try_from(position)
                .map(Value::Int)
                .map_err(|_| FormulaError::Overflow { op: "FIND" })
        }
        Func::Concatenate => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&eval(arg, env)?.coerce_text());
            }
            Ok(Value::Text(out))
        }
        Func::IsBlank => Ok(Value::Bool(eval(&args[0], env)?.is_blank())),
        Func::Blank => Ok(Value::Absent),
        Func::True => Ok(Value::Bool(true)),
        Func::False => Ok(Value::Bool(false)),
    }
}

fn text_arg(args: &[Expr], idx: usize, env: &dyn Bindings) -> Result<String, FormulaError> {
    Ok(eval(&args[idx], env)?.coerce_text())
}

#[cfg(test)]
mod tests {
    use super::super::Formula;
    use super::*;
    use std::collections::BTreeMap;

    struct Map(BTreeMap<&'static str, Value>);

    impl Bindings for Map {
        fn lookup(&self, name: &str) -> Result<Value, FormulaError> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| FormulaError::UnknownField { name: name.into() })
        }
    }

    fn run(src: &str, fields: &[(&'static str, Value)]) -> Result<Value, FormulaError> {
        let env = Map(fields.iter().cloned().collect());
        Formula::compile(src)?.eval(&env)
    }

    #[test]
    fn question_concatenation() {
        let v = run(
            "=\"Is \" & {{Name}} & \" a language?\"",
            &[("Name", Value::text("English"))],
        )
        .unwrap();
        assert_eq!(v, Value::text("Is English a language?"));
    }

    #[test]
    fn and_not_combination() {
        let v = run(
            "=AND({{HasSyntax}}, {{RequiresParsing}}, NOT({{CanBeHeld}}))",
            &[
                ("HasSyntax", Value::Bool(true)),
                ("RequiresParsing", Value::Bool(true)),
                ("CanBeHeld", Value::Bool(false)),
            ],
        )
        .unwrap();
        assert_eq!(v, Value::Bool(true));
    }

    #[test]
    fn if_selects_branch() {
        let src = "=IF({{DistanceFromConcept}} = 1, \"IsMirrorOf\", \"IsDescriptionOf\")";
        assert_eq!(
            run(src, &[("DistanceFromConcept", Value::Int(1))]).unwrap(),
            Value::text("IsMirrorOf")
        );
        assert_eq!(
            run(src, &[("DistanceFromConcept", Value::Int(2))]).unwrap(),
            Value::text("IsDescriptionOf")
        );
    }

    #[test]
    fn find_is_one_based_and_zero_when_missing() {
        assert_eq!(run("=FIND(\"b\", \"abc\")", &[]).unwrap(), Value::Int(2));
        assert_eq!(run("=FIND(\"z\", \"abc\")", &[]).unwrap(), Value::Int(0));
        assert_eq!(
            run("=FIND(\"lang\", LOWER(\"A LANGuage\"))", &[]).unwrap(),
            Value::Int(3)
        );
    }

    #[test]
    fn absent_semantics() {
        assert_eq!(
            run("={{N}} = \"\"", &[("N", Value::Absent)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            run("={{N}} > 3", &[("N", Value::Absent)]).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            run("={{N}} + 3", &[("N", Value::Absent)]).unwrap(),
            Value::Absent
        );
        assert_eq!(
            run("=\"[\" & {{N}} & \"]\"", &[("N", Value::Absent)]).unwrap(),
            Value::text("[]")
        );
        assert_eq!(
            run("=ISBLANK({{N}})", &[("N", Value::Absent)]).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn checked_arithmetic() {
        assert_eq!(run("=7 / 2", &[]).unwrap(), Value::Int(3));
        assert_eq!(run("=-(2 - 5) * 2", &[]).unwrap(), Value::Int(6));
        assert_eq!(run("=1 / 0", &[]), Err(FormulaError::DivisionByZero));
        assert!(matches!(
            run("=9223372036854775807 + 1", &[]),
            Err(FormulaError::Overflow { .. })
        ));
    }

    #[test]
    fn mixed_type_ordering_is_an_error() {
        assert!(matches!(
            run("=1 < \"a\"", &[]),
            Err(FormulaError::Type(_))
        ));
    }

    #[test]
    fn xor_and_or() {
        assert_eq!(run("=XOR(TRUE, TRUE, TRUE)", &[]).unwrap(), Value::Bool(true));
        assert_eq!(run("=OR(FALSE, 0, \"\")", &[]).unwrap(), Value::Bool(false));
        assert_eq!(run("=OR(FALSE, \"x\")", &[]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn bools_concatenate_as_words() {
        assert_eq!(
            run("=CONCATENATE(TRUE, \"/\", 3)", &[]).unwrap(),
            Value::text("true/3")
        );
    }

    #[test]
    fn if_without_else_is_false() {
        assert_eq!(run("=IF(FALSE, 1)", &[]).unwrap(), Value::Bool(false));
    }
}
