//! Message template rendering.
//!
//! A template goes through three passes, in order: image markers
//! (`{img:...}`) are rendered and pulled out, calculation blocks (`[...]`)
//! are evaluated, then variable references (`{...}`) are substituted. The
//! order is load-bearing: each pass operates on the output of the previous
//! one, so a calculation can reference variables and an image marker can
//! carry a whole template fragment.
//!
//! Rendering never fails. Missing references print as `N/A`, calculation
//! problems as `CALC_ERROR`, internal faults as `ERROR`.

pub mod calc;
pub mod lookup;

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use calc::CalcValue;
use lookup::{display_string, lookup_path, normalize_path};

/// Sentinel for a reference that did not resolve.
pub const MISSING: &str = "N/A";
/// Sentinel for an internal rendering fault.
pub const FAULT: &str = "ERROR";
/// Sentinel for a failed calculation block.
pub const CALC_FAULT: &str = "CALC_ERROR";

/// Result of rendering a template with image extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub text: String,
    pub image_urls: Vec<String>,
}

fn var_regex() -> &'static Regex {
    static VAR_REGEX: OnceLock<Regex> = OnceLock::new();
    VAR_REGEX.get_or_init(|| Regex::new(r"\{([^{}]+)\}").expect("valid regex"))
}

/// Render a template, extracting `{img:...}` references.
pub fn render(template: &str, data: &Value, user_vars: &Map<String, Value>) -> Rendered {
    let mut image_urls = Vec::new();
    let text = extract_images(template, data, user_vars, &mut image_urls);
    let text = apply_calculations(&text, data, user_vars);
    let text = substitute_variables(&text, data, user_vars);
    Rendered { text, image_urls }
}

/// Render a template without image extraction. Used for embed text fields
/// and recursively for the fragments inside image markers.
pub fn render_text(template: &str, data: &Value, user_vars: &Map<String, Value>) -> String {
    let text = apply_calculations(template, data, user_vars);
    substitute_variables(&text, data, user_vars)
}

/// Current timestamp in the fixed template format.
pub fn now_string() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn is_sentinel(text: &str) -> bool {
    matches!(text, MISSING | FAULT | CALC_FAULT)
}

/// Pass 1: locate `{img:<fragment>}` markers with a brace-depth scan (the
/// fragment may itself contain `{...}` references), render each fragment,
/// and collect non-empty non-sentinel results.
fn extract_images(
    template: &str,
    data: &Value,
    user_vars: &Map<String, Value>,
    image_urls: &mut Vec<String>,
) -> String {
    const MARKER: &str = "{img:";
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(MARKER) {
        out.push_str(&rest[..start]);
        let after = &rest[start + MARKER.len()..];

        // Find the closing brace of the marker itself.
        let mut depth = 0usize;
        let mut close = None;
        for (i, c) in after.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    if depth == 0 {
                        close = Some(i);
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        match close {
            Some(end) => {
                let fragment = &after[..end];
                let url = render_text(fragment, data, user_vars);
                let url = url.trim();
                if !url.is_empty() && !is_sentinel(url) {
                    image_urls.push(url.to_string());
                }
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated marker: leave it verbatim.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Pass 2: evaluate `[...]` calculation blocks. A `[` only opens a block at
/// brace depth zero, so bracket path syntax like `{a['b']}` is never
/// misread as arithmetic.
fn apply_calculations(template: &str, data: &Value, user_vars: &Map<String, Value>) -> String {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut brace_depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '{' => {
                brace_depth += 1;
                out.push(c);
                i += 1;
            }
            '}' => {
                brace_depth = brace_depth.saturating_sub(1);
                out.push(c);
                i += 1;
            }
            '[' if brace_depth == 0 => {
                // Find the closing bracket, ignoring any inside braces.
                let mut inner_depth = 0usize;
                let mut close = None;
                for (offset, &ic) in chars[i + 1..].iter().enumerate() {
                    match ic {
                        '{' => inner_depth += 1,
                        '}' => inner_depth = inner_depth.saturating_sub(1),
                        ']' if inner_depth == 0 => {
                            close = Some(i + 1 + offset);
                            break;
                        }
                        _ => {}
                    }
                }
                match close {
                    Some(end) => {
                        let body: String = chars[i + 1..end].iter().collect();
                        out.push_str(&evaluate_calculation(&body, data, user_vars));
                        i = end + 1;
                    }
                    None => {
                        out.push(c);
                        i += 1;
                    }
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Resolve the `{...}` references inside a calculation body into bound
/// operands, then hand the remaining source to the arithmetic interpreter.
fn evaluate_calculation(body: &str, data: &Value, user_vars: &Map<String, Value>) -> String {
    let mut operands: HashMap<String, CalcValue> = HashMap::new();
    let mut failed = false;
    let mut counter = 0usize;

    let source = var_regex().replace_all(body, |caps: &regex_lite::Captures| {
        let expr = caps[1].trim();
        let name = format!("op{}", counter);
        counter += 1;
        match resolve_operand(expr, data, user_vars) {
            Some(value) => {
                operands.insert(name.clone(), value);
                // Pad so the identifier does not glue onto adjacent tokens.
                format!(" {} ", name)
            }
            None => {
                failed = true;
                String::new()
            }
        }
    });

    if failed {
        tracing::debug!("calculation reference did not resolve in '{}'", body);
        return CALC_FAULT.to_string();
    }

    match calc::evaluate(&source, &operands) {
        Ok(value) => value.to_string(),
        Err(e) => {
            tracing::debug!("calculation error in '{}': {}", body, e);
            CALC_FAULT.to_string()
        }
    }
}

fn resolve_operand(expr: &str, data: &Value, user_vars: &Map<String, Value>) -> Option<CalcValue> {
    if expr == "time" {
        return Some(CalcValue::Str(now_string()));
    }
    let value = resolve_reference(expr, data, user_vars)?;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(CalcValue::Int(i))
            } else {
                n.as_f64().map(CalcValue::Float)
            }
        }
        Value::String(s) => Some(CalcValue::Str(s)),
        Value::Bool(b) => Some(CalcValue::Int(b as i64)),
        // Mappings, sequences and null are not calculable.
        _ => None,
    }
}

/// Pass 3: substitute `{...}` variable references.
fn substitute_variables(template: &str, data: &Value, user_vars: &Map<String, Value>) -> String {
    var_regex()
        .replace_all(template, |caps: &regex_lite::Captures| {
            let expr = caps[1].trim();
            if expr == "time" {
                return now_string();
            }
            if expr == "data" {
                return serde_json::to_string_pretty(data).unwrap_or_else(|_| FAULT.to_string());
            }
            match resolve_reference(expr, data, user_vars) {
                Some(value) => display_string(&value),
                None => MISSING.to_string(),
            }
        })
        .to_string()
}

/// Resolve a single reference expression against the context.
///
/// Priority: `{$name}` user variables, then dotted/bracket paths into the
/// payload, then a direct top-level key.
fn resolve_reference(expr: &str, data: &Value, user_vars: &Map<String, Value>) -> Option<Value> {
    if let Some(name) = expr.strip_prefix('$') {
        return user_vars.get(name).cloned();
    }

    let path = normalize_path(expr);
    // `data['key']` addresses the payload root explicitly.
    let path = path.strip_prefix("data.").unwrap_or(&path);
    if path.contains('.') {
        return lookup_path(data, path).cloned();
    }

    data.get(path).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_vars() -> Map<String, Value> {
        Map::new()
    }

    fn vars(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_plain_text_unchanged() {
        let r = render("no placeholders here", &json!({}), &no_vars());
        assert_eq!(r.text, "no placeholders here");
        assert!(r.image_urls.is_empty());
    }

    #[test]
    fn test_simple_variable() {
        let r = render("Hello {name}", &json!({"name": "Alice"}), &no_vars());
        assert_eq!(r.text, "Hello Alice");
    }

    #[test]
    fn test_nested_dotted_path() {
        let r = render("{a.b.0}", &json!({"a": {"b": [10, 20]}}), &no_vars());
        assert_eq!(r.text, "10");
        assert!(r.image_urls.is_empty());
    }

    #[test]
    fn test_bracket_path() {
        let data = json!({"result": {"downloaded_issues": 7}});
        let r = render("{result['downloaded_issues']} issues", &data, &no_vars());
        assert_eq!(r.text, "7 issues");
    }

    #[test]
    fn test_data_prefixed_path() {
        let data = json!({"result": {"n": 3}});
        let r = render("{data['result']['n']}", &data, &no_vars());
        assert_eq!(r.text, "3");
    }

    #[test]
    fn test_missing_renders_na() {
        let r = render("{nope} and {a.b.c}", &json!({}), &no_vars());
        assert_eq!(r.text, "N/A and N/A");
    }

    #[test]
    fn test_user_variable() {
        let r = render("{$region}", &json!({}), &vars(&[("region", json!("eu-west"))]));
        assert_eq!(r.text, "eu-west");
        let r = render("{$missing}", &json!({}), &no_vars());
        assert_eq!(r.text, "N/A");
    }

    #[test]
    fn test_time_renders_timestamp() {
        let r = render("{time}", &json!({}), &no_vars());
        assert_ne!(r.text, "N/A");
        // Fixed format: "YYYY-MM-DD HH:MM:SS".
        assert_eq!(r.text.len(), 19);
    }

    #[test]
    fn test_image_marker_extracted() {
        let r = render("{img:http://x/y.png} hi", &json!({}), &no_vars());
        assert_eq!(r.text, " hi");
        assert_eq!(r.image_urls, vec!["http://x/y.png"]);
    }

    #[test]
    fn test_image_marker_with_nested_reference() {
        let data = json!({"poster": "http://img.example/p.jpg"});
        let r = render("New release! {img:{poster}}", &data, &no_vars());
        assert_eq!(r.text, "New release! ");
        assert_eq!(r.image_urls, vec!["http://img.example/p.jpg"]);
    }

    #[test]
    fn test_image_marker_unresolved_dropped() {
        let r = render("{img:{missing}}", &json!({}), &no_vars());
        assert_eq!(r.text, "");
        assert!(r.image_urls.is_empty());
    }

    #[test]
    fn test_calculation_with_references() {
        let r = render("[{v}+{o}]", &json!({"v": 5, "o": 3}), &no_vars());
        assert_eq!(r.text, "8");
    }

    #[test]
    fn test_calculation_float_two_decimals() {
        let data = json!({"price": 25.50, "quantity": 4});
        let r = render("[{price} * {quantity}] total", &data, &no_vars());
        // 102.0 is integral, so it prints bare.
        assert_eq!(r.text, "102 total");
        let r = render("[{v} / {o}] ratio", &json!({"v": 100, "o": 80}), &no_vars());
        assert_eq!(r.text, "1.25 ratio");
    }

    #[test]
    fn test_calculation_unresolved_is_error_token() {
        let r = render("[{nope} + 5]", &json!({}), &no_vars());
        assert_eq!(r.text, "CALC_ERROR");
        let r = render("[bogus + 5]", &json!({}), &no_vars());
        assert_eq!(r.text, "CALC_ERROR");
    }

    #[test]
    fn test_calculation_with_user_variable() {
        let data = json!({"value": 100});
        let uvars = vars(&[("bonus", json!(10))]);
        let r = render("[{value} + {$bonus}]", &data, &uvars);
        assert_eq!(r.text, "110");
    }

    #[test]
    fn test_bracket_path_not_mistaken_for_calculation() {
        let data = json!({"a": {"b": "ok"}});
        let r = render("{a['b']}", &data, &no_vars());
        assert_eq!(r.text, "ok");
    }

    #[test]
    fn test_mixed_template() {
        let data = json!({"value": 100, "old_value": 80});
        let r = render(
            "Current: {value}, previous: {old_value}, gain: [{value} - {old_value}]",
            &data,
            &no_vars(),
        );
        assert_eq!(r.text, "Current: 100, previous: 80, gain: 20");
    }

    #[test]
    fn test_whole_data_pretty_printed() {
        let r = render("{data}", &json!({"k": 1}), &no_vars());
        assert!(r.text.contains("\"k\": 1"));
    }

    #[test]
    fn test_mapping_value_pretty_printed() {
        let data = json!({"obj": {"x": 1}});
        let r = render("{obj}", &data, &no_vars());
        assert!(r.text.contains("\"x\": 1"));
    }
}
