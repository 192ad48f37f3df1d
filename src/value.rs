use serde_json::{Map, Number, Value};

use crate::ast::{BinaryOperator, Expression, UnaryOperator};
use crate::error::{ErrorCode, Position, PromptlateError, PromptlateResult};
use crate::params::Scope;

/// Evaluates `expression` against `scope`.
///
/// `position` is used for every error raised, since expressions do not carry
/// their own spans apart from identifiers.
pub(crate) fn evaluate(
    expression: &Expression,
    scope: &Scope<'_>,
    position: Position,
) -> PromptlateResult<Value> {
    match expression {
        Expression::Identifier(ident) => {
            scope.lookup(&ident.name).cloned().ok_or_else(|| {
                PromptlateError::new(
                    ErrorCode::VariableNotDeclared,
                    format!("Variable '{}' is not declared", ident.name),
                    ident.span.start,
                )
            })
        }
        Expression::Literal { value } => Ok(value.clone()),
        Expression::UnaryExpression { operator, argument } => {
            let value = evaluate(argument, scope, position)?;
            match operator {
                UnaryOperator::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOperator::Plus => to_number(&value)
                    .map(number_value)
                    .ok_or_else(|| unsupported(position, "+", &value, None)),
                UnaryOperator::Minus => match &value {
                    Value::Number(n) => Ok(n
                        .as_i64()
                        .and_then(i64::checked_neg)
                        .map_or_else(|| number_value(-n.as_f64().unwrap_or(f64::NAN)), Value::from)),
                    Value::Null
                    | Value::Bool(_)
                    | Value::String(_)
                    | Value::Array(_)
                    | Value::Object(_) => Err(unsupported(position, "-", &value, None)),
                },
            }
        }
        Expression::BinaryExpression {
            operator,
            left,
            right,
        } => {
            let left = evaluate(left, scope, position)?;
            // Logical operators short-circuit.
            match operator {
                BinaryOperator::And if !is_truthy(&left) => return Ok(left),
                BinaryOperator::Or if is_truthy(&left) => return Ok(left),
                BinaryOperator::NullishCoalescing if !left.is_null() => return Ok(left),
                BinaryOperator::And | BinaryOperator::Or | BinaryOperator::NullishCoalescing => {
                    return evaluate(right, scope, position);
                }
                BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::StrictEqual
                | BinaryOperator::StrictNotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterEqual
                | BinaryOperator::Add
                | BinaryOperator::Subtract
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
                | BinaryOperator::Remainder => {}
            }
            let right = evaluate(right, scope, position)?;
            binary(*operator, &left, &right, position)
        }
        Expression::MemberExpression {
            object,
            property,
            computed,
            ..
        } => {
            let object = evaluate(object, scope, position)?;
            let key = if *computed {
                evaluate(property, scope, position)?
            } else {
                match property.as_ref() {
                    Expression::Identifier(ident) => Value::String(ident.name.clone()),
                    other => evaluate(other, scope, position)?,
                }
            };
            Ok(member(&object, &key))
        }
        Expression::ConditionalExpression {
            test,
            consequent,
            alternate,
        } => {
            if is_truthy(&evaluate(test, scope, position)?) {
                evaluate(consequent, scope, position)
            } else {
                evaluate(alternate, scope, position)
            }
        }
        Expression::ArrayExpression { elements } => elements
            .iter()
            .map(|element| evaluate(element, scope, position))
            .collect::<PromptlateResult<Vec<_>>>()
            .map(Value::Array),
        Expression::ObjectExpression { properties } => {
            let mut object = Map::new();
            for (key, value) in properties {
                object.insert(key.clone(), evaluate(value, scope, position)?);
            }
            Ok(Value::Object(object))
        }
    }
}

/// Property lookup. Missing properties, and lookups on non-containers, give `null`.
fn member(object: &Value, key: &Value) -> Value {
    match (object, key) {
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().unwrap_or(Value::Null),
        (Value::Array(items), Value::Number(n)) => n
            .as_u64()
            .and_then(|i| usize::try_from(i).ok())
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or(Value::Null),
        (Value::Array(items), Value::String(key)) if key == "length" => Value::from(items.len()),
        (Value::String(s), Value::String(key)) if key == "length" => {
            Value::from(s.chars().count())
        }
        _ => Value::Null,
    }
}

/// Falsy: `null`, `false`, `0`, `""`, and empty arrays or objects.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Structural equality, treating numbers by value (`3 == 3.0`).
pub(crate) fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(k, v)| b.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => left == right,
    }
}

/// Renders a value as message text.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => format_number(n),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        Some(_) | None => n.to_string(),
    }
}

fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        Value::String(s) => s.trim().parse().ok(),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// Keeps integral results as JSON integers.
fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map_or(Value::Null, Value::Number)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn unsupported(position: Position, op: &str, left: &Value, right: Option<&Value>) -> PromptlateError {
    let message = match right {
        Some(right) => format!(
            "Operator '{}' is not supported between {} and {}",
            op,
            type_name(left),
            type_name(right)
        ),
        None => format!("Operator '{}' is not supported on {}", op, type_name(left)),
    };
    PromptlateError::new(ErrorCode::UnsupportedOperation, message, position)
}

fn binary(
    operator: BinaryOperator,
    left: &Value,
    right: &Value,
    position: Position,
) -> PromptlateResult<Value> {
    let fail = || unsupported(position, operator.as_str(), left, Some(right));
    match operator {
        BinaryOperator::Equal | BinaryOperator::StrictEqual => {
            Ok(Value::Bool(values_equal(left, right)))
        }
        BinaryOperator::NotEqual | BinaryOperator::StrictNotEqual => {
            Ok(Value::Bool(!values_equal(left, right)))
        }
        BinaryOperator::Less
        | BinaryOperator::LessEqual
        | BinaryOperator::Greater
        | BinaryOperator::GreaterEqual => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                _ => return Err(fail()),
            };
            Ok(Value::Bool(ordering.is_some_and(|ordering| match operator {
                BinaryOperator::Less => ordering.is_lt(),
                BinaryOperator::LessEqual => ordering.is_le(),
                BinaryOperator::Greater => ordering.is_gt(),
                BinaryOperator::GreaterEqual
                | BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::StrictEqual
                | BinaryOperator::StrictNotEqual
                | BinaryOperator::Add
                | BinaryOperator::Subtract
                | BinaryOperator::Multiply
                | BinaryOperator::Divide
                | BinaryOperator::Remainder
                | BinaryOperator::And
                | BinaryOperator::Or
                | BinaryOperator::NullishCoalescing => ordering.is_ge(),
            })))
        }
        BinaryOperator::Add => match (left, right) {
            (Value::String(_), _) | (_, Value::String(_)) => Ok(Value::String(format!(
                "{}{}",
                stringify(left),
                stringify(right)
            ))),
            (Value::Number(a), Value::Number(b)) => Ok(match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.checked_add(b).map_or_else(
                    || number_value(a as f64 + b as f64),
                    Value::from,
                ),
                _ => number_value(a.as_f64().unwrap_or(f64::NAN) + b.as_f64().unwrap_or(f64::NAN)),
            }),
            _ => Err(fail()),
        },
        BinaryOperator::Subtract
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Remainder => {
            let (Value::Number(a), Value::Number(b)) = (left, right) else {
                return Err(fail());
            };
            let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                return Err(fail());
            };
            let result = match operator {
                BinaryOperator::Subtract => a - b,
                BinaryOperator::Multiply => a * b,
                BinaryOperator::Divide => a / b,
                BinaryOperator::Remainder
                | BinaryOperator::Equal
                | BinaryOperator::NotEqual
                | BinaryOperator::StrictEqual
                | BinaryOperator::StrictNotEqual
                | BinaryOperator::Less
                | BinaryOperator::LessEqual
                | BinaryOperator::Greater
                | BinaryOperator::GreaterEqual
                | BinaryOperator::Add
                | BinaryOperator::And
                | BinaryOperator::Or
                | BinaryOperator::NullishCoalescing => a % b,
            };
            Ok(number_value(result))
        }
        // Handled by the short-circuiting caller.
        BinaryOperator::And | BinaryOperator::Or | BinaryOperator::NullishCoalescing => {
            Ok(right.clone())
        }
    }
}
