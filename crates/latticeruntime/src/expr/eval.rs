use super::parser::{BinaryOp, Expr, UnaryOp};
use chrono::Utc;
use latticecore::Value;
use std::cmp::Ordering;

/// Name lookup used by the interpreter
pub trait Lookup {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// Functions callable from expressions. Nothing outside this list is reachable.
pub const FUNCTIONS: &[&str] = &[
    "len", "str", "int", "float", "bool", "abs", "round", "min", "max", "upper", "lower", "strip",
    "json_loads", "json_dumps", "now", "timestamp",
];

pub fn eval(expr: &Expr, scope: &dyn Lookup) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Name(name) => scope
            .lookup(name)
            .ok_or_else(|| format!("name '{}' is not defined", name)),
        Expr::Attr(target, attr) => {
            let target = eval(target, scope)?;
            match &target {
                Value::Object(map) => map
                    .get(attr)
                    .cloned()
                    .ok_or_else(|| format!("record has no field '{}'", attr)),
                other => Err(format!("cannot read '{}' of {}", attr, other.type_name())),
            }
        }
        Expr::Index(target, index) => {
            let target = eval(target, scope)?;
            let index = eval(index, scope)?;
            index_value(&target, &index)
        }
        Expr::Call(name, args) => {
            let args = args
                .iter()
                .map(|arg| eval(arg, scope))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, args)
        }
        Expr::Unary(UnaryOp::Not, operand) => Ok(Value::Bool(!eval(operand, scope)?.is_truthy())),
        Expr::Unary(UnaryOp::Neg, operand) => match eval(operand, scope)? {
            Value::Number(n) => Ok(Value::Number(-n)),
            other => Err(format!("cannot negate {}", other.type_name())),
        },
        // and/or return the deciding operand, like the languages users write these in
        Expr::Binary(BinaryOp::And, left, right) => {
            let left = eval(left, scope)?;
            if left.is_truthy() {
                eval(right, scope)
            } else {
                Ok(left)
            }
        }
        Expr::Binary(BinaryOp::Or, left, right) => {
            let left = eval(left, scope)?;
            if left.is_truthy() {
                Ok(left)
            } else {
                eval(right, scope)
            }
        }
        Expr::Binary(op, left, right) => {
            let left = eval(left, scope)?;
            let right = eval(right, scope)?;
            binary(*op, left, right)
        }
    }
}

fn index_value(target: &Value, index: &Value) -> Result<Value, String> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = position(*n, items.len())?;
            Ok(items[i].clone())
        }
        (Value::String(s), Value::Number(n)) => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(*n, chars.len())?;
            Ok(Value::String(chars[i].to_string()))
        }
        (Value::Object(map), Value::String(key)) => map
            .get(key)
            .cloned()
            .ok_or_else(|| format!("record has no key '{}'", key)),
        (target, index) => Err(format!(
            "cannot index {} with {}",
            target.type_name(),
            index.type_name()
        )),
    }
}

/// Resolve a possibly negative index against `len`
fn position(n: f64, len: usize) -> Result<usize, String> {
    if n.fract() != 0.0 {
        return Err(format!("index {} is not an integer", n));
    }
    let i = if n < 0.0 { len as f64 + n } else { n };
    if i < 0.0 || i >= len as f64 {
        return Err(format!("index {} out of range for length {}", n, len));
    }
    Ok(i as usize)
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, String> {
    use BinaryOp::*;
    match op {
        Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (Value::String(a), b) => Ok(Value::String(a + &b.render())),
            (a, Value::String(b)) => Ok(Value::String(a.render() + &b)),
            (a, b) => Err(type_error("+", &a, &b)),
        },
        Sub | Mul | Div | Rem => {
            let (Value::Number(a), Value::Number(b)) = (&left, &right) else {
                return Err(type_error(symbol(op), &left, &right));
            };
            let (a, b) = (*a, *b);
            match op {
                Sub => Ok(Value::Number(a - b)),
                Mul => Ok(Value::Number(a * b)),
                Div | Rem if b == 0.0 => Err("division by zero".to_string()),
                Div => Ok(Value::Number(a / b)),
                _ => Ok(Value::Number(a.rem_euclid(b))),
            }
        }
        Eq => Ok(Value::Bool(left == right)),
        NotEq => Ok(Value::Bool(left != right)),
        Lt | LtEq | Gt | GtEq => {
            let ordering = compare(&left, &right)?;
            Ok(Value::Bool(match op {
                Lt => ordering == Ordering::Less,
                LtEq => ordering != Ordering::Greater,
                Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        In => contains(&right, &left).map(Value::Bool),
        NotIn => contains(&right, &left).map(|found| Value::Bool(!found)),
        And => Ok(if left.is_truthy() { right } else { left }),
        Or => Ok(if left.is_truthy() { left } else { right }),
    }
}

fn symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        _ => "%",
    }
}

fn type_error(op: &str, left: &Value, right: &Value) -> String {
    format!(
        "unsupported operand types for {}: {} and {}",
        op,
        left.type_name(),
        right.type_name()
    )
}

fn compare(left: &Value, right: &Value) -> Result<Ordering, String> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a
            .partial_cmp(b)
            .ok_or_else(|| "cannot compare NaN".to_string()),
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (a, b) => Err(format!(
            "cannot compare {} with {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool, String> {
    match (haystack, needle) {
        (Value::Array(items), needle) => Ok(items.contains(needle)),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        (haystack, needle) => Err(format!(
            "'in' is not supported between {} and {}",
            needle.type_name(),
            haystack.type_name()
        )),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, String> {
    match name {
        "len" => match one(name, args)? {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Bytes(bytes) => Ok(Value::from(bytes.len())),
            other => Err(format!("len() of {}", other.type_name())),
        },
        "str" => Ok(Value::String(one(name, args)?.render())),
        "int" => to_number(one(name, args)?).map(|n| Value::Number(n.trunc())),
        "float" => to_number(one(name, args)?).map(Value::Number),
        "bool" => Ok(Value::Bool(one(name, args)?.is_truthy())),
        "abs" => number_arg(name, one(name, args)?).map(|n| Value::Number(n.abs())),
        "round" => {
            let (value, digits) = match args.len() {
                1 | 2 => {
                    let mut args = args.into_iter();
                    let value = args.next().unwrap_or_default();
                    let digits = args.next();
                    (value, digits)
                }
                n => return Err(format!("round() takes 1 or 2 arguments, got {}", n)),
            };
            let value = number_arg(name, value)?;
            match digits {
                None => Ok(Value::Number(value.round())),
                Some(digits) => {
                    let factor = 10f64.powi(number_arg(name, digits)? as i32);
                    Ok(Value::Number((value * factor).round() / factor))
                }
            }
        }
        "min" | "max" => {
            let items = match args.as_slice() {
                [Value::Array(items)] => items.clone(),
                [] => return Err(format!("{}() expects at least one argument", name)),
                _ => args,
            };
            let mut best: Option<Value> = None;
            for item in items {
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let ordering = compare(&item, &current)?;
                        let replace = if name == "min" {
                            ordering == Ordering::Less
                        } else {
                            ordering == Ordering::Greater
                        };
                        if replace {
                            item
                        } else {
                            current
                        }
                    }
                });
            }
            best.ok_or_else(|| format!("{}() of an empty sequence", name))
        }
        "upper" => text_arg(name, one(name, args)?).map(|s| Value::String(s.to_uppercase())),
        "lower" => text_arg(name, one(name, args)?).map(|s| Value::String(s.to_lowercase())),
        "strip" => text_arg(name, one(name, args)?).map(|s| Value::String(s.trim().to_string())),
        "json_loads" => match one(name, args)? {
            Value::String(text) => serde_json::from_str::<serde_json::Value>(&text)
                .map(Value::from)
                .map_err(|e| format!("json_loads(): {}", e)),
            other => Err(format!("json_loads() of {}", other.type_name())),
        },
        "json_dumps" => Ok(Value::String(one(name, args)?.to_json().to_string())),
        "now" => {
            none(name, &args)?;
            Ok(Value::String(Utc::now().to_rfc3339()))
        }
        "timestamp" => {
            none(name, &args)?;
            // whole seconds since the epoch
            Ok(Value::Number(Utc::now().timestamp() as f64))
        }
        other => Err(format!("function '{}' is not available", other)),
    }
}

fn one(name: &str, args: Vec<Value>) -> Result<Value, String> {
    let count = args.len();
    let mut args = args.into_iter();
    match (args.next(), count) {
        (Some(value), 1) => Ok(value),
        _ => Err(format!("{}() takes exactly one argument, got {}", name, count)),
    }
}

fn none(name: &str, args: &[Value]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("{}() takes no arguments", name))
    }
}

fn number_arg(name: &str, value: Value) -> Result<f64, String> {
    value
        .as_f64()
        .ok_or_else(|| format!("{}() expects a number, got {}", name, value.type_name()))
}

fn text_arg(name: &str, value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("{}() expects text, got {}", name, other.type_name())),
    }
}

fn to_number(value: Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => Ok(n),
        Value::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("cannot convert '{}' to a number", s)),
        other => Err(format!("cannot convert {} to a number", other.type_name())),
    }
}
