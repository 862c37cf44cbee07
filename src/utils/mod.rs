// JSON helpers shared by the workflow engine and the handoff router.

use serde_json::Value;

/// Resolve a dotted path (`result.summary`, `items.0`) against `value`.
///
/// A key that literally contains dots is matched before the path is split, so
/// `{"a.b": 1}` resolves `a.b`.
pub fn extract_json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = value.as_object().and_then(|m| m.get(path)) {
        return Some(direct);
    }

    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Overlay `overlay`'s top-level fields onto `base`, values included verbatim.
pub fn overlay_fields(base: &mut serde_json::Map<String, Value>, overlay: serde_json::Map<String, Value>) {
    base.extend(overlay);
}
