use serde_json::Value;

use crate::CoreError;

/// Evaluates flow conditions, multi-instance collections and script tasks
pub trait ConditionEvaluator: Send + Sync {
    /// Evaluate `expression` against `context`
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, CoreError>;

    /// Evaluate `expression` and interpret the result as a boolean
    fn evaluate_condition(&self, expression: &str, context: &Value) -> Result<bool, CoreError> {
        Ok(is_truthy(&self.evaluate(expression, context)?))
    }
}

/// JMESPath evaluator
#[derive(Debug, Default, Clone, Copy)]
pub struct JmesPathEvaluator;

impl ConditionEvaluator for JmesPathEvaluator {
    fn evaluate(&self, expression: &str, context: &Value) -> Result<Value, CoreError> {
        let path = expression.strip_prefix("$.").unwrap_or(expression);
        let compiled = jmespath::compile(path).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        let result = compiled.search(context).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        Ok(serde_json::to_value(&*result)?)
    }
}

/// JMESPath truthiness: `false`, `null` and empty strings, arrays and objects are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) => true,
    }
}
