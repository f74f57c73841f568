//! Predicate and scalar evaluation over a materialized record.

use std::cmp::Ordering;

use talon_common::error::ExecError;
use talon_common::value::Value;
use talon_proto::{Expr, ExprOp, Record};

/// Evaluate an expression to a value. `MatchAgainst` is handled by the scan
/// layer and evaluates to TRUE here (its filtering already happened).
pub fn eval(expr: &Expr, record: &Record) -> Result<Value, ExecError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::FieldRef { field_id } => Ok(record.get_or_null(*field_id)),
        Expr::Binary { op, left, right } => {
            let l = eval(left, record)?;
            let r = eval(right, record)?;
            if l.is_null() || r.is_null() {
                return Ok(Value::Null);
            }
            let ord = l.compare(&r);
            let out = match op {
                ExprOp::Eq => ord == Ordering::Equal,
                ExprOp::Ne => ord != Ordering::Equal,
                ExprOp::Lt => ord == Ordering::Less,
                ExprOp::Le => ord != Ordering::Greater,
                ExprOp::Gt => ord == Ordering::Greater,
                ExprOp::Ge => ord != Ordering::Less,
            };
            Ok(Value::Bool(out))
        }
        Expr::In { field_id, list } => {
            let v = record.get_or_null(*field_id);
            if v.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Bool(list.iter().any(|cand| v.compare(cand) == Ordering::Equal)))
        }
        Expr::LikePrefix { field_id, prefix } => {
            let v = record.get_or_null(*field_id);
            if v.is_null() {
                return Ok(Value::Null);
            }
            Ok(Value::Bool(v.get_string().starts_with(prefix.as_str())))
        }
        Expr::And(list) => {
            let mut saw_null = false;
            for e in list {
                match eval(e, record)? {
                    Value::Null => saw_null = true,
                    v if !truthy(&v) => return Ok(Value::Bool(false)),
                    _ => {}
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(true) })
        }
        Expr::Or(list) => {
            let mut saw_null = false;
            for e in list {
                match eval(e, record)? {
                    Value::Null => saw_null = true,
                    v if truthy(&v) => return Ok(Value::Bool(true)),
                    _ => {}
                }
            }
            Ok(if saw_null { Value::Null } else { Value::Bool(false) })
        }
        Expr::Not(inner) => match eval(inner, record)? {
            Value::Null => Ok(Value::Null),
            v => Ok(Value::Bool(!truthy(&v))),
        },
        Expr::MatchAgainst { .. } => Ok(Value::Bool(true)),
    }
}

/// SQL three-valued truthiness collapsed for filtering: NULL is not true.
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        other => other.get_i64() != 0,
    }
}

/// Does the record pass every conjunct?
pub fn passes_conjuncts(conjuncts: &[Expr], record: &Record) -> Result<bool, ExecError> {
    for c in conjuncts {
        if !truthy(&eval(c, record)?) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: i32, name: &str) -> Record {
        let mut r = Record::new();
        r.set(1, Value::Int32(id));
        r.set(2, Value::String(name.into()));
        r
    }

    fn field(id: u32) -> Box<Expr> {
        Box::new(Expr::FieldRef { field_id: id })
    }

    fn lit(v: Value) -> Box<Expr> {
        Box::new(Expr::Literal(v))
    }

    #[test]
    fn test_binary_comparisons() {
        let r = rec(5, "x");
        let ge = Expr::Binary { op: ExprOp::Ge, left: field(1), right: lit(Value::Int32(5)) };
        assert_eq!(eval(&ge, &r).unwrap(), Value::Bool(true));
        let lt = Expr::Binary { op: ExprOp::Lt, left: field(1), right: lit(Value::Int32(5)) };
        assert_eq!(eval(&lt, &r).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_null_propagates() {
        let r = rec(5, "x");
        let cmp = Expr::Binary { op: ExprOp::Eq, left: field(9), right: lit(Value::Int32(1)) };
        assert_eq!(eval(&cmp, &r).unwrap(), Value::Null);
        assert!(!truthy(&Value::Null));
    }

    #[test]
    fn test_in_and_like() {
        let r = rec(5, "hello");
        let inn = Expr::In { field_id: 1, list: vec![Value::Int32(3), Value::Int32(5)] };
        assert_eq!(eval(&inn, &r).unwrap(), Value::Bool(true));
        let like = Expr::LikePrefix { field_id: 2, prefix: "he".into() };
        assert_eq!(eval(&like, &r).unwrap(), Value::Bool(true));
        let like = Expr::LikePrefix { field_id: 2, prefix: "ha".into() };
        assert_eq!(eval(&like, &r).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let r = rec(5, "x");
        let t = Expr::Literal(Value::Bool(true));
        let f = Expr::Literal(Value::Bool(false));
        assert_eq!(eval(&Expr::And(vec![t.clone(), f.clone()]), &r).unwrap(), Value::Bool(false));
        assert_eq!(eval(&Expr::Or(vec![f.clone(), t.clone()]), &r).unwrap(), Value::Bool(true));
        assert_eq!(eval(&Expr::Not(Box::new(f)), &r).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_passes_conjuncts() {
        let r = rec(10, "abc");
        let conjuncts = vec![
            Expr::Binary { op: ExprOp::Gt, left: field(1), right: lit(Value::Int32(5)) },
            Expr::LikePrefix { field_id: 2, prefix: "a".into() },
        ];
        assert!(passes_conjuncts(&conjuncts, &r).unwrap());
        let r2 = rec(1, "abc");
        assert!(!passes_conjuncts(&conjuncts, &r2).unwrap());
    }
}
