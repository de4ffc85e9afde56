//! Builtin functions callable from expressions.

use super::expr::ValueType;
use crate::errors::EvalError;
use serde_json::Value;

/// Names of all builtin functions.
pub const BUILTIN_FUNCTIONS: &[&str] = &["coalesce", "env", "join", "length", "lower", "upper"];

/// Calls builtin `name` with already-evaluated arguments.
pub fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "upper" => Ok(Value::String(single_string(name, args)?.to_uppercase())),
        "lower" => Ok(Value::String(single_string(name, args)?.to_lowercase())),
        "env" => {
            let key = single_string(name, args)?;
            Ok(Value::String(std::env::var(key).unwrap_or_default()))
        }
        "join" => join(args),
        "length" => length(args),
        "coalesce" => Ok(args
            .iter()
            .find(|v| !matches!(v, Value::Null) && v.as_str() != Some(""))
            .cloned()
            .unwrap_or(Value::Null)),
        _ => Err(EvalError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn arity(function: &str, args: &[Value], expected: usize) -> Result<(), EvalError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(EvalError::InvalidArguments {
            function: function.to_string(),
            message: format!("expected {expected} argument(s), got {}", args.len()),
        })
    }
}

fn single_string<'a>(function: &str, args: &'a [Value]) -> Result<&'a str, EvalError> {
    arity(function, args, 1)?;
    args[0].as_str().ok_or_else(|| EvalError::TypeMismatch {
        context: format!("argument to {function}()"),
        expected: "string",
        found: ValueType::of(&args[0]).to_string(),
    })
}

fn join(args: &[Value]) -> Result<Value, EvalError> {
    arity("join", args, 2)?;
    let sep = args[0].as_str().ok_or_else(|| EvalError::TypeMismatch {
        context: "separator of join()".to_string(),
        expected: "string",
        found: ValueType::of(&args[0]).to_string(),
    })?;
    let items = args[1].as_array().ok_or_else(|| EvalError::TypeMismatch {
        context: "list of join()".to_string(),
        expected: "list",
        found: ValueType::of(&args[1]).to_string(),
    })?;
    let parts = items
        .iter()
        .map(|v| match v {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(EvalError::TypeMismatch {
                context: "element of join()".to_string(),
                expected: "string",
                found: ValueType::of(other).to_string(),
            }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::String(parts.join(sep)))
}

fn length(args: &[Value]) -> Result<Value, EvalError> {
    arity("length", args, 1)?;
    let len = match &args[0] {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(EvalError::TypeMismatch {
                context: "argument to length()".to_string(),
                expected: "string, list or object",
                found: ValueType::of(other).to_string(),
            })
        }
    };
    Ok(Value::from(len))
}
