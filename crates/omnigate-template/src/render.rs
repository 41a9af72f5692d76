//! Template evaluation and the safe function set.

use serde_json::Value;

use crate::context::RenderContext;
use crate::error::RenderError;
use crate::parse::{Call, Expr, Pipeline, Segment, Template};

impl Template {
    /// Render the template against a context.
    pub fn render(&self, ctx: &RenderContext) -> Result<String, RenderError> {
        let root = ctx.to_value();
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Action(pipeline) => {
                    let value = eval_pipeline(pipeline, &root)?;
                    out.push_str(&stringify(&value));
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a single-action template to its raw value.
    ///
    /// Used for body fields where JSON types must survive rendering. A
    /// template that mixes actions with non-whitespace text renders to a
    /// string instead.
    pub fn render_value(&self, ctx: &RenderContext) -> Result<Value, RenderError> {
        let mut sole_action: Option<&Pipeline> = None;
        for segment in &self.segments {
            match segment {
                Segment::Text(t) if t.trim().is_empty() => {}
                Segment::Text(_) => {
                    sole_action = None;
                    break;
                }
                Segment::Action(p) => {
                    if sole_action.is_some() {
                        sole_action = None;
                        break;
                    }
                    sole_action = Some(p);
                }
            }
        }
        match sole_action {
            Some(pipeline) => eval_pipeline(pipeline, &ctx.to_value()),
            None => self.render(ctx).map(Value::String),
        }
    }
}

fn eval_pipeline(pipeline: &Pipeline, root: &Value) -> Result<Value, RenderError> {
    let mut value = eval_expr(&pipeline.head, root)?;
    for stage in &pipeline.stages {
        let mut args = Vec::with_capacity(stage.args.len() + 1);
        for arg in &stage.args {
            args.push(eval_expr(arg, root)?);
        }
        args.push(value);
        value = call_function(&stage.name, args)?;
    }
    Ok(value)
}

fn eval_expr(expr: &Expr, root: &Value) -> Result<Value, RenderError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(lookup_path(root, segments)),
        Expr::Call(call) => eval_call(call, root),
    }
}

fn eval_call(call: &Call, root: &Value) -> Result<Value, RenderError> {
    let mut args = Vec::with_capacity(call.args.len());
    for arg in &call.args {
        args.push(eval_expr(arg, root)?);
    }
    call_function(&call.name, args)
}

/// Walk a dotted path; missing steps yield null.
fn lookup_path(root: &Value, segments: &[String]) -> Value {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get(segment) {
                Some(v) => v,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current.clone()
}

/// Convert a value to its textual form. Null renders empty so missing
/// keys disappear from endpoints and headers.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => to_json_string(value),
    }
}

/// Compact JSON encoding used by `toJSON` and for composite values.
#[must_use]
pub fn to_json_string(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn call_function(name: &str, mut args: Vec<Value>) -> Result<Value, RenderError> {
    let arity = |n: usize| -> Result<(), RenderError> {
        if args.len() == n {
            Ok(())
        } else {
            Err(RenderError::new(
                name,
                format!("expected {n} argument(s), got {}", args.len()),
            ))
        }
    };

    match name {
        "env" => {
            arity(1)?;
            let key = as_str(name, &args[0])?;
            Ok(std::env::var(&key).map_or(Value::Null, Value::String))
        }
        "add" => {
            arity(2)?;
            add_values(&args[0], &args[1]).ok_or_else(|| {
                RenderError::new(name, "both operands must be numbers".to_string())
            })
        }
        "fromJSON" => {
            arity(1)?;
            let raw = as_str(name, &args[0])?;
            serde_json::from_str(&raw)
                .map_err(|e| RenderError::new(name, format!("invalid JSON: {e}")))
        }
        "toJSON" => {
            arity(1)?;
            Ok(Value::String(to_json_string(&args[0])))
        }
        "safeGet" => {
            arity(2)?;
            let path = as_str(name, &args[0])?;
            Ok(safe_get(&args[1], &path))
        }
        "safeGetOr" => {
            arity(3)?;
            let path = as_str(name, &args[0])?;
            let found = safe_get(&args[1], &path);
            if found.is_null() {
                Ok(args.remove(2))
            } else {
                Ok(found)
            }
        }
        "upper" => {
            arity(1)?;
            Ok(Value::String(stringify(&args[0]).to_uppercase()))
        }
        "lower" => {
            arity(1)?;
            Ok(Value::String(stringify(&args[0]).to_lowercase()))
        }
        "trim" => {
            arity(1)?;
            Ok(Value::String(stringify(&args[0]).trim().to_string()))
        }
        "replace" => {
            arity(3)?;
            let from = as_str(name, &args[0])?;
            let to = as_str(name, &args[1])?;
            Ok(Value::String(stringify(&args[2]).replace(&from, &to)))
        }
        "split" => {
            arity(2)?;
            let sep = as_str(name, &args[0])?;
            let input = stringify(&args[1]);
            Ok(Value::Array(
                input
                    .split(&sep)
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            ))
        }
        "join" => {
            arity(2)?;
            let sep = as_str(name, &args[0])?;
            let Value::Array(items) = &args[1] else {
                return Err(RenderError::new(name, "second argument must be a list"));
            };
            Ok(Value::String(
                items.iter().map(stringify).collect::<Vec<_>>().join(&sep),
            ))
        }
        "len" => {
            arity(1)?;
            let n = match &args[0] {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                _ => {
                    return Err(RenderError::new(name, "value has no length"));
                }
            };
            Ok(Value::Number(n.into()))
        }
        "default" => {
            arity(2)?;
            let is_empty = match &args[1] {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(items) => items.is_empty(),
                Value::Object(map) => map.is_empty(),
                _ => false,
            };
            if is_empty {
                Ok(args.remove(0))
            } else {
                Ok(args.remove(1))
            }
        }
        other => Err(RenderError::new(other, "unknown function")),
    }
}

fn as_str(step: &str, value: &Value) -> Result<String, RenderError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(RenderError::new(
            step,
            format!("expected string argument, got {}", type_name(other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn add_values(a: &Value, b: &Value) -> Option<Value> {
    let (a, b) = (a.as_f64()?, b.as_f64()?);
    let sum = a + b;
    // Keep integer results integral so rendered ids stay clean.
    if sum.fract() == 0.0 && sum.abs() < i64::MAX as f64 {
        Some(Value::Number((sum as i64).into()))
    } else {
        serde_json::Number::from_f64(sum).map(Value::Number)
    }
}

/// Dotted-path lookup over arbitrary data; missing paths yield null.
fn safe_get(data: &Value, path: &str) -> Value {
    if path.is_empty() {
        return data.clone();
    }
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    lookup_path(data, &segments)
}
