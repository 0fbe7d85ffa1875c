//! printf-style single value templates.
//!
//! A template is literal text around exactly one conversion
//! `%[flags][width][.precision]type`. `%%` is a literal percent sign.
//!
//! Supported flags are `-` (left align), `+`, space, `0` and `#`; supported
//! types are `s r d i u f F e E g G x X o`. Text conversions render booleans
//! as `True`/`False` and null as `None`, matching the templates found in
//! existing station configurations.

use std::{fmt, iter::Peekable, str::Chars};

use serde_json::Value;
use thiserror::Error;

const TYPES: &str = "srdiufFeEgGxXo";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("'{template}': {reason}")]
    Invalid { template: String, reason: String },

    #[error("%{conversion} format: a number is required, not {value}")]
    NotANumber { conversion: char, value: String },

    #[error("%{conversion} format: an integer is required, not {value}")]
    NotAnInteger { conversion: char, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Flags {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alternate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Conversion {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    kind: char,
}

/// A parsed format template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    prefix: String,
    conversion: Conversion,
    suffix: String,
}

impl Default for Template {
    fn default() -> Self {
        Self {
            source: "%s".to_string(),
            prefix: String::new(),
            conversion: Conversion {
                flags: Flags::default(),
                width: None,
                precision: None,
                kind: 's',
            },
            suffix: String::new(),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, FormatError> {
        let invalid = |reason: &str| FormatError::Invalid {
            template: source.to_string(),
            reason: reason.to_string(),
        };

        let mut prefix = String::new();
        let mut suffix = String::new();
        let mut conversion = None;
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            let text = if conversion.is_some() {
                &mut suffix
            } else {
                &mut prefix
            };
            if c != '%' {
                text.push(c);
                continue;
            }
            if chars.peek() == Some(&'%') {
                chars.next();
                text.push('%');
                continue;
            }
            if conversion.is_some() {
                return Err(invalid("more than one conversion"));
            }
            conversion = Some(Conversion::parse(&mut chars).map_err(|reason| invalid(&reason))?);
        }

        let conversion = conversion.ok_or_else(|| invalid("no conversion"))?;
        Ok(Self {
            source: source.to_string(),
            prefix,
            conversion,
            suffix,
        })
    }

    /// Renders `value` through the template.
    pub fn apply(&self, value: &Value) -> Result<String, FormatError> {
        let body = self.conversion.render(value)?;
        Ok(format!("{}{}{}", self.prefix, body, self.suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn digits(chars: &mut Peekable<Chars<'_>>) -> Result<Option<usize>, String> {
    let mut text = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        text.push(c);
        chars.next();
    }
    if text.is_empty() {
        return Ok(None);
    }
    text.parse()
        .map(Some)
        .map_err(|_| format!("number too large: {text}"))
}

impl Conversion {
    fn parse(chars: &mut Peekable<Chars<'_>>) -> Result<Self, String> {
        let mut flags = Flags::default();
        while let Some(&c) = chars.peek() {
            match c {
                '-' => flags.left = true,
                '+' => flags.plus = true,
                ' ' => flags.space = true,
                '0' => flags.zero = true,
                '#' => flags.alternate = true,
                _ => break,
            }
            chars.next();
        }

        let width = digits(chars)?;
        let precision = if chars.peek() == Some(&'.') {
            chars.next();
            Some(digits(chars)?.unwrap_or(0))
        } else {
            None
        };

        // Length modifiers carry no meaning here.
        while matches!(chars.peek(), Some('h' | 'l' | 'L')) {
            chars.next();
        }

        let kind = chars.next().ok_or("incomplete conversion")?;
        if !TYPES.contains(kind) {
            return Err(format!("unsupported conversion type '{kind}'"));
        }

        Ok(Self {
            flags,
            width,
            precision,
            kind,
        })
    }

    fn render(&self, value: &Value) -> Result<String, FormatError> {
        let upper = self.kind.is_ascii_uppercase();
        match self.kind {
            's' | 'r' => {
                let text = if self.kind == 's' {
                    text_of(value)
                } else {
                    repr_of(value)
                };
                let text = match self.precision {
                    Some(p) => text.chars().take(p).collect(),
                    None => text,
                };
                Ok(self.pad("", "", &text, false))
            }
            'd' | 'i' | 'u' => {
                let (negative, mut body) = self.truncated(value)?;
                if let Some(p) = self.precision {
                    if body.len() < p {
                        body = format!("{}{body}", "0".repeat(p - body.len()));
                    }
                }
                Ok(self.pad(self.sign(negative), "", &body, true))
            }
            'x' | 'X' | 'o' => {
                let (negative, magnitude) = self.exact(value)?;
                let (body, prefix) = match self.kind {
                    'x' => (format!("{magnitude:x}"), "0x"),
                    'X' => (format!("{magnitude:X}"), "0X"),
                    _ => (format!("{magnitude:o}"), "0o"),
                };
                let prefix = if self.flags.alternate { prefix } else { "" };
                Ok(self.pad(self.sign(negative), prefix, &body, true))
            }
            'f' | 'F' => {
                let number = self.number(value)?;
                let p = self.precision.unwrap_or(6);
                let mut body = format!("{:.*}", p, number.abs());
                if self.flags.alternate && p == 0 {
                    body.push('.');
                }
                Ok(self.pad(self.sign(number.is_sign_negative()), "", &body, true))
            }
            'e' | 'E' => {
                let number = self.number(value)?;
                let body = exponential(
                    number.abs(),
                    self.precision.unwrap_or(6),
                    upper,
                    self.flags.alternate,
                );
                Ok(self.pad(self.sign(number.is_sign_negative()), "", &body, true))
            }
            _ => {
                let number = self.number(value)?;
                let body = general(number.abs(), self.precision, upper, self.flags.alternate);
                Ok(self.pad(self.sign(number.is_sign_negative()), "", &body, true))
            }
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.flags.plus {
            "+"
        } else if self.flags.space {
            " "
        } else {
            ""
        }
    }

    fn pad(&self, sign: &str, prefix: &str, body: &str, numeric: bool) -> String {
        let len = sign.len() + prefix.len() + body.chars().count();
        let width = self.width.unwrap_or(0);
        if len >= width {
            return format!("{sign}{prefix}{body}");
        }
        let fill = width - len;
        if self.flags.left {
            format!("{sign}{prefix}{body}{}", " ".repeat(fill))
        } else if self.flags.zero && numeric {
            format!("{sign}{prefix}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{sign}{prefix}{body}", " ".repeat(fill))
        }
    }

    fn number(&self, value: &Value) -> Result<f64, FormatError> {
        match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| self.not_a_number(value)),
            Value::Bool(b) => Ok(f64::from(u8::from(*b))),
            _ => Err(self.not_a_number(value)),
        }
    }

    /// Sign and decimal digits of `value` truncated toward zero.
    fn truncated(&self, value: &Value) -> Result<(bool, String), FormatError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok((i < 0, i.unsigned_abs().to_string()))
                } else if let Some(u) = n.as_u64() {
                    Ok((false, u.to_string()))
                } else {
                    let t = self.number(value)?.trunc();
                    Ok((t < 0.0, format!("{:.0}", t.abs())))
                }
            }
            Value::Bool(b) => Ok((false, u8::from(*b).to_string())),
            _ => Err(self.not_a_number(value)),
        }
    }

    /// Sign and magnitude of an integral `value`.
    fn exact(&self, value: &Value) -> Result<(bool, u64), FormatError> {
        match value {
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok((i < 0, i.unsigned_abs()))
                } else if let Some(u) = n.as_u64() {
                    Ok((false, u))
                } else {
                    Err(FormatError::NotAnInteger {
                        conversion: self.kind,
                        value: text_of(value),
                    })
                }
            }
            Value::Bool(b) => Ok((false, u64::from(*b))),
            _ => Err(self.not_a_number(value)),
        }
    }

    fn not_a_number(&self, value: &Value) -> FormatError {
        FormatError::NotANumber {
            conversion: self.kind,
            value: repr_of(value),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn repr_of(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        other => text_of(other),
    }
}

/// `d.ddde+XX` with at least two exponent digits.
fn exponential(value: f64, precision: usize, upper: bool, alternate: bool) -> String {
    let raw = format!("{:.*e}", precision, value);
    let (mantissa, exponent) = raw.split_once('e').unwrap_or((raw.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let dot = if alternate && precision == 0 { "." } else { "" };
    let e = if upper { 'E' } else { 'e' };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{mantissa}{dot}{e}{sign}{:02}", exponent.abs())
}

fn general(value: f64, precision: Option<usize>, upper: bool, alternate: bool) -> String {
    let p = match precision {
        Some(0) => 1,
        Some(p) => p,
        None => 6,
    };
    let exponent = if value == 0.0 {
        0
    } else {
        format!("{:.*e}", p - 1, value)
            .split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };

    let body = if (-4..p as i32).contains(&exponent) {
        format!("{:.*}", (p as i32 - 1 - exponent) as usize, value)
    } else {
        exponential(value, p - 1, upper, alternate)
    };

    if alternate {
        body
    } else {
        strip_trailing_zeros(&body)
    }
}

fn strip_trailing_zeros(body: &str) -> String {
    let (mantissa, exponent) = match body.find(|c| c == 'e' || c == 'E') {
        Some(i) => body.split_at(i),
        None => (body, ""),
    };
    let mantissa = if mantissa.contains('.') {
        mantissa.trim_end_matches('0').trim_end_matches('.')
    } else {
        mantissa
    };
    format!("{mantissa}{exponent}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn render(template: &str, value: Value) -> String {
        Template::parse(template).unwrap().apply(&value).unwrap()
    }

    #[test]
    fn test_text_conversion() {
        assert_eq!(render("%s", json!(72.5)), "72.5");
        assert_eq!(render("%s", json!(72)), "72");
        assert_eq!(render("%s", json!("N")), "N");
        assert_eq!(render("%s", json!(null)), "None");
        assert_eq!(render("%s", json!(true)), "True");
        assert_eq!(render("%r", json!("N")), "'N'");
        assert_eq!(render("%5.2s", json!("abcdef")), "   ab");
        assert_eq!(render("%-6s|", json!("ab")), "ab    |");
        assert_eq!(render("%05s", json!("ab")), "   ab");
    }

    #[test]
    fn test_literal_text_and_percent() {
        assert_eq!(render("Temp: %.1f F", json!(72.53)), "Temp: 72.5 F");
        assert_eq!(render("%d%%", json!(45)), "45%");
    }

    #[test]
    fn test_integer_conversion_truncates() {
        assert_eq!(render("%d", json!(72.9)), "72");
        assert_eq!(render("%d", json!(-72.9)), "-72");
        assert_eq!(render("%i", json!(-0.5)), "0");
        assert_eq!(render("%.3d", json!(5)), "005");
        assert_eq!(render("%+d", json!(5)), "+5");
        assert_eq!(render("% d", json!(5)), " 5");
        assert_eq!(render("%05d", json!(-42)), "-0042");
        assert_eq!(render("%d", json!(true)), "1");
    }

    #[test]
    fn test_fixed_conversion() {
        assert_eq!(render("%f", json!(1.5)), "1.500000");
        assert_eq!(render("%.1f", json!(72)), "72.0");
        assert_eq!(render("%05.1f", json!(-1.5)), "-01.5");
        assert_eq!(render("%-7.2f|", json!(3.25)), "3.25   |");
        assert_eq!(render("%#.0f", json!(3.0)), "3.");
    }

    #[test]
    fn test_exponent_conversion() {
        assert_eq!(render("%e", json!(1234.5)), "1.234500e+03");
        assert_eq!(render("%.2E", json!(0.00012)), "1.20E-04");
        assert_eq!(render("%.1e", json!(-5)), "-5.0e+00");
    }

    #[test]
    fn test_general_conversion() {
        assert_eq!(render("%g", json!(72.5)), "72.5");
        assert_eq!(render("%g", json!(0.0001)), "0.0001");
        assert_eq!(render("%g", json!(0.00001)), "1e-05");
        assert_eq!(render("%g", json!(1234567.0)), "1.23457e+06");
        assert_eq!(render("%G", json!(0.000001)), "1E-06");
        assert_eq!(render("%g", json!(0)), "0");
        assert_eq!(render("%#g", json!(1.5)), "1.50000");
    }

    #[test]
    fn test_radix_conversions() {
        assert_eq!(render("%x", json!(255)), "ff");
        assert_eq!(render("%#X", json!(255)), "0XFF");
        assert_eq!(render("%o", json!(8)), "10");
        assert_eq!(render("%#06x", json!(-255)), "-0x0ff");
    }

    #[test]
    fn test_value_errors() {
        let template = Template::parse("%d").unwrap();
        assert_eq!(
            template.apply(&json!("abc")).unwrap_err(),
            FormatError::NotANumber {
                conversion: 'd',
                value: "'abc'".into()
            }
        );
        assert!(template.apply(&json!(null)).is_err());

        let hex = Template::parse("%x").unwrap();
        assert!(matches!(
            hex.apply(&json!(2.5)),
            Err(FormatError::NotAnInteger { conversion: 'x', .. })
        ));
    }

    #[test]
    fn test_parse_errors() {
        for source in ["no conversion", "%s and %s", "%q", "%", "%5"] {
            assert!(
                matches!(Template::parse(source), Err(FormatError::Invalid { .. })),
                "{source} should be rejected"
            );
        }
    }

    #[test]
    fn test_default_template() {
        let template = Template::default();
        assert_eq!(template, Template::parse("%s").unwrap());
        assert_eq!(template.to_string(), "%s");
    }
}
