use std::collections::BTreeMap;

use crate::api::CalcError;
use crate::parse::{BinOp, Expr};
use crate::value::Value;

pub(crate) fn eval(expr: &Expr, bindings: &BTreeMap<String, Value>) -> Result<Value, CalcError> {
    match expr {
        Expr::Num(v) => Ok(*v),
        Expr::Var(name) => bindings
            .get(name)
            .copied()
            .ok_or_else(|| CalcError::UndefinedVariable(name.clone())),
        Expr::Neg(inner) => eval(inner, bindings)?.neg(),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, bindings)?;
            let rhs = eval(rhs, bindings)?;
            match op {
                BinOp::Add => lhs.add(rhs),
                BinOp::Sub => lhs.sub(rhs),
                BinOp::Mul => lhs.mul(rhs),
                BinOp::Div => lhs.div(rhs),
                BinOp::Rem => lhs.rem(rhs),
                BinOp::Pow => lhs.pow(rhs),
            }
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, bindings))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &args)
        }
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), CalcError> {
    if args.len() != expected {
        return Err(CalcError::Arity {
            name: name.to_string(),
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

fn call(name: &str, args: &[Value]) -> Result<Value, CalcError> {
    match name {
        "abs" => {
            arity(name, args, 1)?;
            match args[0] {
                Value::Int(v) => v.checked_abs().map(Value::Int).ok_or(CalcError::Overflow),
                Value::Float(v) => Ok(Value::Float(v.abs())),
            }
        }
        "sqrt" => {
            arity(name, args, 1)?;
            let v = args[0].as_f64();
            if v < 0.0 {
                let shown = args[0].display(6);
                return Err(CalcError::Domain(format!("sqrt of negative number {shown}")));
            }
            let root = v.sqrt();
            if matches!(args[0], Value::Int(_)) && root.fract() == 0.0 {
                return Ok(Value::Int(root as i64));
            }
            Ok(Value::Float(root))
        }
        "floor" | "ceil" => {
            arity(name, args, 1)?;
            let Value::Float(v) = args[0] else {
                return Ok(args[0]);
            };
            let rounded = if name == "floor" { v.floor() } else { v.ceil() };
            if rounded.is_finite() && rounded.abs() < 9.0e18 {
                Ok(Value::Int(rounded as i64))
            } else {
                Ok(Value::Float(rounded))
            }
        }
        "min" | "max" => {
            let Some((first, rest)) = args.split_first() else {
                return Err(CalcError::Arity {
                    name: name.to_string(),
                    expected: 1,
                    got: 0,
                });
            };
            let mut best = *first;
            for v in rest {
                let better = if name == "min" {
                    v.as_f64() < best.as_f64()
                } else {
                    v.as_f64() > best.as_f64()
                };
                if better {
                    best = *v;
                }
            }
            Ok(best)
        }
        _ => Err(CalcError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{parse_statement, Stmt};

    fn eval_str(input: &str, bindings: &BTreeMap<String, Value>) -> Result<Value, CalcError> {
        match parse_statement(input)? {
            Stmt::Expr(expr) => eval(&expr, bindings),
            Stmt::Assign(..) => panic!("unexpected assignment"),
        }
    }

    #[test]
    fn evaluates_arithmetic() {
        let env = BTreeMap::new();
        assert_eq!(eval_str("2 + 2", &env).unwrap(), Value::Int(4));
        assert_eq!(eval_str("(1 + 2) * 3 - 4 / 2", &env).unwrap(), Value::Int(7));
        assert_eq!(eval_str("2 ** 10 % 1000", &env).unwrap(), Value::Int(24));
        assert_eq!(eval_str("2 ** -1", &env).unwrap(), Value::Float(0.5));
    }

    #[test]
    fn resolves_bindings() {
        let mut env = BTreeMap::new();
        env.insert("x".to_string(), Value::Int(6));
        assert_eq!(eval_str("x * 7", &env).unwrap(), Value::Int(42));
        assert!(matches!(
            eval_str("y", &env),
            Err(CalcError::UndefinedVariable(name)) if name == "y"
        ));
    }

    #[test]
    fn builtins() {
        let env = BTreeMap::new();
        assert_eq!(eval_str("sqrt(16)", &env).unwrap(), Value::Int(4));
        assert_eq!(eval_str("abs(-3)", &env).unwrap(), Value::Int(3));
        assert_eq!(eval_str("max(1, 7.5, 3)", &env).unwrap(), Value::Float(7.5));
        assert_eq!(eval_str("min(4, -2)", &env).unwrap(), Value::Int(-2));
        assert_eq!(eval_str("floor(7 / 2)", &env).unwrap(), Value::Int(3));
        assert_eq!(eval_str("ceil(7 / 2)", &env).unwrap(), Value::Int(4));
        assert!(matches!(eval_str("sqrt(-1)", &env), Err(CalcError::Domain(_))));
        assert!(matches!(eval_str("abs(1, 2)", &env), Err(CalcError::Arity { .. })));
        assert!(matches!(eval_str("nope(1)", &env), Err(CalcError::UnknownFunction(_))));
    }
}
