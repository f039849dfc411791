//! Rich-embed construction.
//!
//! An embed configuration is rendered through the template engine field by
//! field and assembled into the outbound wire shape. Color can be a fixed
//! hex value, the first matching rule of an ordered condition list, or a
//! linear gradient over a numeric range.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition;
use crate::template::{
    self,
    lookup::{lookup_path, normalize_path},
};

/// Fallback when a configured hex color does not parse.
pub const DEFAULT_COLOR: u32 = 0x3498DB;
/// Fallback when no `if` rule matches.
const RULE_DEFAULT_COLOR: u32 = 0xFFFFFF;

// ---------------------------------------------------------------------------
// Wire shape
// ---------------------------------------------------------------------------

/// The embed object as delivered to the webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<EmbedMedia>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<EmbedMedia>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedFooter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedAuthor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedMedia {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-flow embed configuration. All text fields are templates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub color: Option<ColorSpec>,
    /// Stamp the embed with the render time.
    #[serde(default = "default_true")]
    pub timestamp: bool,
    #[serde(default)]
    pub footer_text: Option<String>,
    #[serde(default)]
    pub footer_icon: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_icon: Option<String>,
    #[serde(default)]
    pub author_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub fields: Vec<StaticField>,
    #[serde(default)]
    pub dynamic_fields: Vec<DynamicField>,
}

fn default_true() -> bool {
    true
}

/// A literal field; name and value are templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// A field resolved from the payload at render time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicField {
    #[serde(default)]
    pub enabled: bool,
    pub name: String,
    /// Lookup path into the payload.
    pub path: String,
    #[serde(default)]
    pub format: FieldFormat,
    #[serde(default)]
    pub inline: bool,
}

/// Literal formatting rule for a dynamic field value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFormat {
    Number,
    Percentage,
    FileSize,
    Currency,
    Date,
    Boolean,
    Status,
    #[default]
    Text,
}

/// How the embed color is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ColorSpec {
    /// A fixed `#RRGGBB` value.
    Static { color: String },
    /// First matching rule wins; no match falls back to white.
    If { rules: Vec<ColorRule> },
    /// Linear RGB interpolation over a numeric range, clamped at the
    /// endpoints. `path` defaults to the monitored `value`.
    Gradient {
        start_color: String,
        end_color: String,
        min: f64,
        max: f64,
        #[serde(default)]
        path: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColorRule {
    pub condition: String,
    pub color: String,
}

// ---------------------------------------------------------------------------
// Building
// ---------------------------------------------------------------------------

/// Build an embed from its configuration.
///
/// Returns `None` when the embed is disabled. The second element collects
/// image URLs extracted from the thumbnail/image fields; when a field
/// carried an `{img:...}` marker the extracted URL is preferred over the
/// raw rendered string.
pub fn build(
    config: &EmbedConfig,
    data: &Value,
    user_vars: &Map<String, Value>,
) -> Option<(Embed, Vec<String>)> {
    if !config.enabled {
        return None;
    }

    let mut embed = Embed::default();
    let mut image_urls = Vec::new();

    let text = |tpl: &Option<String>| -> Option<String> {
        tpl.as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| template::render_text(t, data, user_vars))
    };

    embed.title = text(&config.title);
    embed.description = text(&config.description);
    embed.url = text(&config.url);

    embed.color = Some(resolve_color(config.color.as_ref(), data, user_vars));

    if config.timestamp {
        embed.timestamp = Some(chrono::Utc::now().to_rfc3339());
    }

    let footer_text = text(&config.footer_text);
    let footer_icon = text(&config.footer_icon);
    if footer_text.is_some() || footer_icon.is_some() {
        embed.footer = Some(EmbedFooter { text: footer_text, icon_url: footer_icon });
    }

    let author_name = text(&config.author_name);
    let author_icon = text(&config.author_icon);
    let author_url = text(&config.author_url);
    if author_name.is_some() || author_icon.is_some() || author_url.is_some() {
        embed.author =
            Some(EmbedAuthor { name: author_name, icon_url: author_icon, url: author_url });
    }

    embed.thumbnail =
        render_media(&config.thumbnail_url, data, user_vars, &mut image_urls);
    embed.image = render_media(&config.image_url, data, user_vars, &mut image_urls);

    for field in &config.fields {
        if field.name.is_empty() || field.value.is_empty() {
            continue;
        }
        embed.fields.push(EmbedField {
            name: template::render_text(&field.name, data, user_vars),
            value: template::render_text(&field.value, data, user_vars),
            inline: field.inline,
        });
    }
    embed.fields.extend(dynamic_fields(&config.dynamic_fields, data, user_vars));

    Some((embed, image_urls))
}

/// Render a thumbnail/image field with image extraction.
fn render_media(
    tpl: &Option<String>,
    data: &Value,
    user_vars: &Map<String, Value>,
    image_urls: &mut Vec<String>,
) -> Option<EmbedMedia> {
    let tpl = tpl.as_deref().filter(|t| !t.is_empty())?;
    let rendered = template::render(tpl, data, user_vars);
    let url = match rendered.image_urls.first() {
        Some(extracted) => extracted.clone(),
        None => rendered.text.trim().to_string(),
    };
    image_urls.extend(rendered.image_urls);
    if url.is_empty() {
        return None;
    }
    Some(EmbedMedia { url })
}

fn dynamic_fields(
    configs: &[DynamicField],
    data: &Value,
    user_vars: &Map<String, Value>,
) -> Vec<EmbedField> {
    let mut fields = Vec::new();
    for cfg in configs {
        if !cfg.enabled || cfg.name.is_empty() || cfg.path.is_empty() {
            continue;
        }
        let Some(value) = lookup_path(data, &normalize_path(&cfg.path)) else {
            continue;
        };
        fields.push(EmbedField {
            name: template::render_text(&cfg.name, data, user_vars),
            value: format_field_value(value, cfg.format),
            inline: cfg.inline,
        });
    }
    fields
}

// ---------------------------------------------------------------------------
// Colors
// ---------------------------------------------------------------------------

/// Parse a `#RRGGBB` hex color to its integer form.
pub fn parse_hex_color(raw: &str) -> Option<u32> {
    let hex = raw.trim().trim_start_matches('#');
    if hex.is_empty() || hex.len() > 6 {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

fn resolve_color(spec: Option<&ColorSpec>, data: &Value, user_vars: &Map<String, Value>) -> u32 {
    match spec {
        None => DEFAULT_COLOR,
        Some(ColorSpec::Static { color }) => parse_hex_color(color).unwrap_or(DEFAULT_COLOR),
        Some(ColorSpec::If { rules }) => {
            for rule in rules {
                if condition::evaluate(&rule.condition, data, user_vars) {
                    return parse_hex_color(&rule.color).unwrap_or(DEFAULT_COLOR);
                }
            }
            RULE_DEFAULT_COLOR
        }
        Some(ColorSpec::Gradient { start_color, end_color, min, max, path }) => {
            let start = parse_hex_color(start_color).unwrap_or(DEFAULT_COLOR);
            let end = parse_hex_color(end_color).unwrap_or(DEFAULT_COLOR);
            let source = path.as_deref().unwrap_or("value");
            let value = lookup_path(data, &normalize_path(source)).and_then(numeric);
            match value {
                Some(v) => gradient_color(start, end, *min, *max, v),
                None => start,
            }
        }
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Interpolate each RGB channel linearly over `[min, max]`, clamped at the
/// endpoints.
fn gradient_color(start: u32, end: u32, min: f64, max: f64, value: f64) -> u32 {
    let t = if max <= min { 1.0 } else { ((value - min) / (max - min)).clamp(0.0, 1.0) };

    let channel = |shift: u32| -> u32 {
        let s = ((start >> shift) & 0xFF) as f64;
        let e = ((end >> shift) & 0xFF) as f64;
        ((s + (e - s) * t).round() as u32).min(0xFF)
    };

    (channel(16) << 16) | (channel(8) << 8) | channel(0)
}

// ---------------------------------------------------------------------------
// Field value formatting
// ---------------------------------------------------------------------------

/// Apply a dynamic field's declared format to its resolved value.
pub fn format_field_value(value: &Value, format: FieldFormat) -> String {
    let plain = || crate::template::lookup::display_string(value);
    match format {
        FieldFormat::Number | FieldFormat::Text => plain(),
        FieldFormat::Percentage => match numeric(value) {
            Some(f) => format!("{:.1}%", f),
            None => plain(),
        },
        FieldFormat::FileSize => match numeric(value) {
            Some(f) => format_file_size(f),
            None => plain(),
        },
        FieldFormat::Currency => match numeric(value) {
            Some(f) => format!("${}", thousands(f)),
            None => plain(),
        },
        FieldFormat::Date => match value.as_i64().or_else(|| numeric(value).map(|f| f as i64)) {
            Some(secs) => chrono::DateTime::from_timestamp(secs, 0)
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(plain),
            None => plain(),
        },
        FieldFormat::Boolean => match value {
            Value::Bool(true) => "✅ Yes".to_string(),
            Value::Bool(false) => "❌ No".to_string(),
            Value::Number(n) => {
                if n.as_f64().unwrap_or(0.0) != 0.0 {
                    "✅ Yes".to_string()
                } else {
                    "❌ No".to_string()
                }
            }
            _ => plain(),
        },
        FieldFormat::Status => match value {
            Value::String(s) => {
                let glyph = match s.to_lowercase().as_str() {
                    "active" | "online" | "running" | "success" => Some("🟢"),
                    "inactive" | "offline" | "stopped" | "error" | "failed" => Some("🔴"),
                    "warning" | "pending" | "processing" => Some("🟡"),
                    _ => None,
                };
                match glyph {
                    Some(g) => format!("{} {}", g, s),
                    None => s.clone(),
                }
            }
            _ => plain(),
        },
    }
}

/// Binary-prefix units scaled to the largest unit not exceeding the value,
/// two decimals above bytes.
pub fn format_file_size(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    if bytes < KB {
        format!("{} B", bytes as i64)
    } else if bytes < MB {
        format!("{:.2} KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.2} MB", bytes / MB)
    } else if bytes < TB {
        format!("{:.2} GB", bytes / GB)
    } else {
        format!("{:.2} TB", bytes / TB)
    }
}

/// `1234567.891` -> `1,234,567.89`.
fn thousands(value: f64) -> String {
    let negative = value < 0.0;
    let formatted = format!("{:.2}", value.abs());
    let (int_part, frac_part) = formatted.split_once('.').unwrap_or((&formatted, "00"));

    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }

    let sign = if negative { "-" } else { "" };
    format!("{}{}.{}", sign, grouped, frac_part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_vars() -> Map<String, Value> {
        Map::new()
    }

    fn enabled_config() -> EmbedConfig {
        EmbedConfig { enabled: true, timestamp: false, ..Default::default() }
    }

    #[test]
    fn test_disabled_returns_none() {
        let config = EmbedConfig::default();
        assert!(build(&config, &json!({}), &no_vars()).is_none());
    }

    #[test]
    fn test_text_fields_rendered() {
        let mut config = enabled_config();
        config.title = Some("Deploy {status}".to_string());
        config.description = Some("by {user}".to_string());

        let data = json!({"status": "done", "user": "ci"});
        let (embed, _) = build(&config, &data, &no_vars()).unwrap();
        assert_eq!(embed.title.as_deref(), Some("Deploy done"));
        assert_eq!(embed.description.as_deref(), Some("by ci"));
    }

    #[test]
    fn test_static_color_and_fallback() {
        let mut config = enabled_config();
        config.color = Some(ColorSpec::Static { color: "#ff0000".to_string() });
        let (embed, _) = build(&config, &json!({}), &no_vars()).unwrap();
        assert_eq!(embed.color, Some(0xFF0000));

        config.color = Some(ColorSpec::Static { color: "not-a-color".to_string() });
        let (embed, _) = build(&config, &json!({}), &no_vars()).unwrap();
        assert_eq!(embed.color, Some(DEFAULT_COLOR));
    }

    #[test]
    fn test_if_color_first_match_wins() {
        let mut config = enabled_config();
        config.color = Some(ColorSpec::If {
            rules: vec![
                ColorRule { condition: "value > 90".to_string(), color: "#ff0000".to_string() },
                ColorRule { condition: "value > 50".to_string(), color: "#ffff00".to_string() },
            ],
        });

        let (embed, _) = build(&config, &json!({"value": 95}), &no_vars()).unwrap();
        assert_eq!(embed.color, Some(0xFF0000));

        let (embed, _) = build(&config, &json!({"value": 60}), &no_vars()).unwrap();
        assert_eq!(embed.color, Some(0xFFFF00));

        // No rule matches: default white.
        let (embed, _) = build(&config, &json!({"value": 10}), &no_vars()).unwrap();
        assert_eq!(embed.color, Some(0xFFFFFF));
    }

    #[test]
    fn test_gradient_boundaries_and_midpoint() {
        let spec = ColorSpec::Gradient {
            start_color: "#202020".to_string(),
            end_color: "#404040".to_string(),
            min: 0.0,
            max: 100.0,
            path: None,
        };

        let color = |v: f64| {
            resolve_color(Some(&spec), &json!({ "value": v }), &Map::new())
        };

        // Start boundary and anything below it.
        assert_eq!(color(0.0), 0x202020);
        assert_eq!(color(-50.0), 0x202020);
        // End boundary and anything above it.
        assert_eq!(color(100.0), 0x404040);
        assert_eq!(color(250.0), 0x404040);
        // Midpoint: arithmetic mean of each channel.
        assert_eq!(color(50.0), 0x303030);
    }

    #[test]
    fn test_media_prefers_extracted_image() {
        let mut config = enabled_config();
        config.image_url = Some("{img:http://x/pic.png}".to_string());
        let (embed, images) = build(&config, &json!({}), &no_vars()).unwrap();
        assert_eq!(embed.image.unwrap().url, "http://x/pic.png");
        assert_eq!(images, vec!["http://x/pic.png"]);

        let mut config = enabled_config();
        config.thumbnail_url = Some("http://x/thumb.png".to_string());
        let (embed, images) = build(&config, &json!({}), &no_vars()).unwrap();
        assert_eq!(embed.thumbnail.unwrap().url, "http://x/thumb.png");
        assert!(images.is_empty());
    }

    #[test]
    fn test_dynamic_field_missing_path_omitted() {
        let mut config = enabled_config();
        config.dynamic_fields = vec![DynamicField {
            enabled: true,
            name: "Count".to_string(),
            path: "result.count".to_string(),
            format: FieldFormat::Number,
            inline: true,
        }];

        let (embed, _) = build(&config, &json!({"result": {"count": 3}}), &no_vars()).unwrap();
        assert_eq!(embed.fields.len(), 1);
        assert_eq!(embed.fields[0].value, "3");

        let (embed, _) = build(&config, &json!({}), &no_vars()).unwrap();
        assert!(embed.fields.is_empty());
    }

    #[test]
    fn test_file_size_formatting() {
        assert_eq!(format_file_size(500.0), "500 B");
        assert_eq!(format_file_size(1536.0), "1.50 KB");
        assert_eq!(format_file_size(5.0 * 1024.0 * 1024.0), "5.00 MB");
        assert_eq!(format_file_size(1.5 * 1024.0 * 1024.0 * 1024.0), "1.50 GB");
    }

    #[test]
    fn test_currency_formatting() {
        assert_eq!(format_field_value(&json!(1234.5), FieldFormat::Currency), "$1,234.50");
        assert_eq!(format_field_value(&json!(42), FieldFormat::Currency), "$42.00");
        assert_eq!(
            format_field_value(&json!(1234567.891), FieldFormat::Currency),
            "$1,234,567.89"
        );
    }

    #[test]
    fn test_boolean_and_status_glyphs() {
        assert_eq!(format_field_value(&json!(true), FieldFormat::Boolean), "✅ Yes");
        assert_eq!(format_field_value(&json!(0), FieldFormat::Boolean), "❌ No");
        assert_eq!(format_field_value(&json!("online"), FieldFormat::Status), "🟢 online");
        assert_eq!(format_field_value(&json!("error"), FieldFormat::Status), "🔴 error");
        assert_eq!(format_field_value(&json!("pending"), FieldFormat::Status), "🟡 pending");
        assert_eq!(format_field_value(&json!("odd"), FieldFormat::Status), "odd");
    }

    #[test]
    fn test_percentage_formatting() {
        assert_eq!(format_field_value(&json!(85.25), FieldFormat::Percentage), "85.2%");
        assert_eq!(format_field_value(&json!("n/a"), FieldFormat::Percentage), "n/a");
    }
}
