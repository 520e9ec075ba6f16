//! Batch parameter fan-out.
//!
//! Array-valued parameters are expanded into one argument tuple per element
//! before any cache or coalescing work happens. Key and version resolution
//! only ever see scalar tuples.

use crate::args::BoundArgs;
use crate::error::TemplateError;
use serde_json::Value;

/// Expand `batch_params` (all arrays of equal length) into one `BoundArgs`
/// per element. Parameters not listed are copied into every tuple.
///
/// An empty batch yields no tuples. With no batch parameters the input is
/// returned as the only tuple.
pub fn expand_batch(args: &BoundArgs, batch_params: &[&str]) -> Result<Vec<BoundArgs>, TemplateError> {
    if batch_params.is_empty() {
        return Ok(vec![args.clone()]);
    }

    let mut columns: Vec<(&str, &Vec<Value>)> = Vec::with_capacity(batch_params.len());
    for param in batch_params {
        match args.get(param) {
            Some(Value::Array(items)) => columns.push((*param, items)),
            Some(other) => {
                return Err(TemplateError::BatchMismatch {
                    param: param.to_string(),
                    reason: format!("expected an array, found {}", kind(other)),
                })
            }
            None => {
                return Err(TemplateError::BatchMismatch {
                    param: param.to_string(),
                    reason: "parameter is not bound".to_string(),
                })
            }
        }
    }

    let len = columns[0].1.len();
    if let Some((param, items)) = columns.iter().find(|(_, items)| items.len() != len) {
        return Err(TemplateError::BatchMismatch {
            param: param.to_string(),
            reason: format!("length {} differs from {}", items.len(), len),
        });
    }

    let base: BoundArgs = args
        .iter()
        .filter(|(name, _)| !batch_params.contains(&name.as_str()))
        .fold(BoundArgs::new(), |mut acc, (name, value)| {
            acc.insert_raw(name.clone(), value.clone());
            acc
        });

    Ok((0..len)
        .map(|i| {
            let mut tuple = base.clone();
            for (param, items) in &columns {
                tuple.insert_raw(param.to_string(), items[i].clone());
            }
            tuple
        })
        .collect())
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
