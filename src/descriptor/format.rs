//! Human-readable rendering of the descriptor document.
//!
//! Objects are indented four spaces per level with `"key" : value` pairs.
//! Floats keep three significant digits. Arrays of up to four elements stay
//! on one line. Strings are escaped to plain ASCII.

use std::fmt::Write as _;

use serde_json::{Number, Value};

const INDENT: usize = 4;
const INLINE_ARRAY_LEN: usize = 4;

pub fn to_readable_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, 1);
    out
}

fn write_value(out: &mut String, value: &Value, level: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            let sep = if items.len() <= INLINE_ARRAY_LEN {
                ", ".to_string()
            } else {
                format!(",\n{}", " ".repeat((level + 1) * INDENT))
            };
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(&sep);
                }
                write_value(out, item, level + 1);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let indent = " ".repeat(level * INDENT);
            out.push('{');
            for (i, (key, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push('\n');
                out.push_str(&indent);
                write_string(out, key);
                out.push_str(" : ");
                write_value(out, v, level + 1);
            }
            out.push('\n');
            out.push_str(&" ".repeat((level - 1) * INDENT));
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &Number) {
    if n.is_f64() {
        match n.as_f64() {
            Some(v) => out.push_str(&format_significant(v, 3)),
            None => out.push_str("null"),
        }
    } else {
        out.push_str(&n.to_string());
    }
}

/// Format `v` like C's `%.{digits}g`: fixed notation for moderate
/// exponents, scientific otherwise, trailing zeros removed.
pub fn format_significant(v: f64, digits: usize) -> String {
    if !v.is_finite() {
        // Not representable in JSON.
        return "null".to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let precision = digits.max(1) - 1;
    // Rounding to the requested digits may bump the exponent (9.999 -> 10.0).
    let sci = format!("{v:.precision$e}");
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= digits as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            strip_zeros(mantissa),
            exponent.unsigned_abs()
        )
    } else {
        let decimals = (digits as i32 - 1 - exponent).max(0) as usize;
        strip_zeros(&format!("{v:.decimals$}")).to_string()
    }
}

fn strip_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c.is_ascii() && !c.is_ascii_control() => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}
