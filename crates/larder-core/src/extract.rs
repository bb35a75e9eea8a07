//! Turns a recognition service's free-form reply into vetted item observations.
//!
//! Structural defects (no JSON, no item list, no named item) fail the whole response.
//! Field-level defects are repaired in place: numbers clamp, categories fall back,
//! bounding boxes are discarded.

use serde_json::{Map, Value};

use crate::{BoundingBox, CategoryConfig, ItemObservation, LarderError};

const FENCE: &str = "```";

/// Parse one recognition response body into item observations.
///
/// # Errors
/// Returns [`LarderError::MalformedResponse`] when no JSON value can be recovered, when the
/// value carries no item array, or when every item lacks a non-empty `name`.
pub fn parse_recognition_response(
    raw: &str,
    categories: &CategoryConfig,
) -> Result<Vec<ItemObservation>, LarderError> {
    let body = strip_code_fence(raw);
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        return observations_from_value(&value, categories);
    }

    // Prose may carry stray bracketed fragments; take the first span that yields items.
    let mut first_error = None;
    for value in recovered_values(body) {
        match observations_from_value(&value, categories) {
            Ok(observations) => return Ok(observations),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| {
        LarderError::MalformedResponse("response does not contain a parseable JSON value".into())
    }))
}

fn observations_from_value(
    value: &Value,
    categories: &CategoryConfig,
) -> Result<Vec<ItemObservation>, LarderError> {
    let items = item_array(value)?;

    let observations = items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|item| observation_from_item(item, categories))
        .collect::<Vec<_>>();

    if !items.is_empty() && observations.is_empty() {
        return Err(LarderError::MalformedResponse(
            "no item in the response carries a non-empty name".into(),
        ));
    }

    Ok(observations)
}

/// Remove a leading code fence (optionally tagged `json`) and its closing fence.
fn strip_code_fence(raw: &str) -> &str {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix(FENCE) {
        body = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
    }
    if let Some(rest) = body.trim_end().strip_suffix(FENCE) {
        body = rest;
    }
    body.trim()
}

/// JSON values found inside surrounding text: every `{` span in order, then every `[` span.
fn recovered_values(body: &str) -> impl Iterator<Item = Value> + '_ {
    [('{', '}'), ('[', ']')]
        .into_iter()
        .flat_map(move |(opener, closer)| {
            body.match_indices(opener).flat_map(move |(start, _)| {
                [balanced_span(body, start), greedy_span(body, start, closer)].into_iter().flatten()
            })
        })
        .filter_map(|span| serde_json::from_str::<Value>(span).ok())
}

/// The bracket-balanced span starting at `start`, ignoring brackets inside JSON strings.
fn balanced_span(body: &str, start: usize) -> Option<&str> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in body[start..].char_indices() {
        if in_string {
            match (escaped, ch) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(&body[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Everything from `start` through the last `closer` in the body.
fn greedy_span(body: &str, start: usize, closer: char) -> Option<&str> {
    let end = body.rfind(closer)?;
    (end > start).then(|| &body[start..=end])
}

fn item_array(value: &Value) -> Result<&Vec<Value>, LarderError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(object) => object.get("items").and_then(Value::as_array).ok_or_else(|| {
            LarderError::MalformedResponse("response object has no `items` array".into())
        }),
        _ => Err(LarderError::MalformedResponse(
            "response is neither an object with `items` nor an array".into(),
        )),
    }
}

fn observation_from_item(
    item: &Map<String, Value>,
    categories: &CategoryConfig,
) -> Option<ItemObservation> {
    let name = item.get("name").and_then(Value::as_str).map(str::trim)?;
    if name.is_empty() {
        return None;
    }

    Some(ItemObservation {
        name: name.to_string(),
        quantity: safe_non_negative_int(item.get("quantity")),
        expires_in_days: safe_non_negative_int(field(item, "expiresInDays", "expires_in_days")),
        category: categories.normalize(item.get("category").and_then(Value::as_str)),
        bounding_box: field(item, "boundingBox", "bounding_box").and_then(parse_bounding_box),
    })
}

fn field<'a>(item: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    item.get(camel).or_else(|| item.get(snake))
}

/// Coerce anything number-like to a non-negative integer; never fails.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn safe_non_negative_int(value: Option<&Value>) -> u32 {
    let number = match value {
        None | Some(Value::Null) => 0.0,
        Some(Value::Number(number)) => number.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(text)) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(Value::Bool(flag)) => f64::from(u8::from(*flag)),
        Some(_) => f64::NAN,
    };

    if !number.is_finite() {
        return 0;
    }
    let rounded = number.round();
    if rounded <= 0.0 {
        0
    } else if rounded >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        rounded as u32
    }
}

fn parse_bounding_box(value: &Value) -> Option<BoundingBox> {
    let components = value.as_array()?;
    if components.len() != 4 {
        return None;
    }
    let mut values = [0.0_f64; 4];
    for (slot, component) in values.iter_mut().zip(components) {
        *slot = component.as_f64()?;
    }
    BoundingBox::from_components(values)
}
