//! Value-template parsing and rendering.
//!
//! Header fields, column labels, row cells, and file-name prefixes are all
//! described by *value templates*: literal text with embedded references into
//! a document's nested key/value body, e.g.
//!
//! ```text
//! {md[XDI][Element_symbol]}
//! {data[det][0]:.3f} eV
//! {uid}-
//! ```
//!
//! A reference is a bare first key followed by bracketed path segments; a
//! numeric segment indexes into an array. An optional format spec renders a
//! numeric value: `:.N` with N significant digits (general notation, trailing
//! zeros stripped), `:.Nf` with exactly N fixed decimal places. Doubled
//! braces (`{{`, `}}`) are literal-brace escapes.
//!
//! Rendering never fails just because a referenced path is absent: the result
//! is [`Rendered::Unresolved`] and the caller decides whether the value is
//! still pending (header fields) or fatal (row cells, file prefixes). A
//! present value of the wrong shape is a hard [`RenderError`].
//!
//! Templates are parsed once, at configuration load; syntax problems surface
//! before any output exists.

use serde_json::Value;

/// Errors raised while parsing a value-template string.
#[derive(Debug, thiserror::Error)]
pub enum TemplateParseError {
    /// A `{` without a matching `}`.
    #[error("unclosed '{{' in template {template:?}")]
    UnclosedBrace {
        /// The offending template text.
        template: String,
    },

    /// A `}` with no opening `{` (and not part of a `}}` escape).
    #[error("unmatched '}}' in template {template:?}")]
    UnmatchedBrace {
        /// The offending template text.
        template: String,
    },

    /// A `{}` or `{:spec}` group with no reference path.
    #[error("empty reference in template {template:?}")]
    EmptyReference {
        /// The offending template text.
        template: String,
    },

    /// A reference path that is not `name` followed by `[segment]` groups.
    #[error("malformed reference path {path:?} in template {template:?}")]
    BadPath {
        /// The malformed path text.
        path: String,
        /// The offending template text.
        template: String,
    },

    /// A format spec other than `.N` / `.Nf`.
    #[error("unsupported format spec {spec:?} in template {template:?}")]
    BadFormatSpec {
        /// The rejected spec text.
        spec: String,
        /// The offending template text.
        template: String,
    },
}

/// Errors raised while rendering a parsed template against a document.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// A fixed-decimal format spec was applied to a non-numeric value.
    #[error("reference '{reference}' is not numeric but has format spec '.{precision}'")]
    NotNumeric {
        /// The reference path, as written in the template.
        reference: String,
        /// Requested decimal places.
        precision: u8,
    },

    /// The referenced value is a composite (object or array) and cannot be
    /// stringified into a single cell.
    #[error("reference '{reference}' points at a composite value")]
    Unrenderable {
        /// The reference path, as written in the template.
        reference: String,
    },

    /// A reference required to resolve (row cell, file prefix, mandatory
    /// header) is absent from the document.
    #[error("document has no value for required reference '{reference}'")]
    MissingReference {
        /// The reference path, as written in the template.
        reference: String,
    },
}

/// Outcome of rendering a template against one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// Every reference resolved; the substituted text.
    Resolved(String),
    /// At least one reference was absent; carries the first missing
    /// reference path for diagnostics.
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSeg {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormatSpec {
    /// `.N`: N significant digits, general notation.
    Significant(u8),
    /// `.Nf`: exactly N digits after the decimal point.
    Fixed(u8),
}

impl FormatSpec {
    fn digits(self) -> u8 {
        match self {
            FormatSpec::Significant(n) | FormatSpec::Fixed(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldRef {
    path: Vec<PathSeg>,
    format: Option<FormatSpec>,
}

impl FieldRef {
    fn reference_text(&self) -> String {
        let mut out = String::new();
        for (i, seg) in self.path.iter().enumerate() {
            match seg {
                PathSeg::Key(k) if i == 0 => out.push_str(k),
                PathSeg::Key(k) => {
                    out.push('[');
                    out.push_str(k);
                    out.push(']');
                }
                PathSeg::Index(n) => {
                    out.push('[');
                    out.push_str(&n.to_string());
                    out.push(']');
                }
            }
        }
        out
    }

    fn lookup<'a>(&self, document: &'a Value) -> Option<&'a Value> {
        let mut current = document;
        for seg in &self.path {
            current = match seg {
                PathSeg::Key(k) => current.get(k.as_str())?,
                PathSeg::Index(n) => current.get(*n)?,
            };
        }
        Some(current)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Field(FieldRef),
}

/// A parsed value template, ready to render against any document body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueTemplate {
    raw: String,
    parts: Vec<Part>,
}

impl ValueTemplate {
    /// Parse a template string. Errors describe the first syntax problem.
    pub fn parse(text: &str) -> Result<Self, TemplateParseError> {
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => {
                    return Err(TemplateParseError::UnmatchedBrace { template: text.to_owned() })
                }
                '{' => {
                    if !literal.is_empty() {
                        parts.push(Part::Literal(std::mem::take(&mut literal)));
                    }
                    let mut group = String::new();
                    let mut closed = false;
                    for gc in chars.by_ref() {
                        if gc == '}' {
                            closed = true;
                            break;
                        }
                        group.push(gc);
                    }
                    if !closed {
                        return Err(TemplateParseError::UnclosedBrace {
                            template: text.to_owned(),
                        });
                    }
                    parts.push(Part::Field(parse_field(&group, text)?));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }

        Ok(Self { raw: text.to_owned(), parts })
    }

    /// The template text as written.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// True when the template contains no references at all.
    pub fn is_literal(&self) -> bool {
        self.parts.iter().all(|p| matches!(p, Part::Literal(_)))
    }

    /// Render against a document body. Absent references yield
    /// [`Rendered::Unresolved`]; wrong-shaped present values are fatal.
    pub fn render(&self, document: &Value) -> Result<Rendered, RenderError> {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Field(field) => {
                    let value = match field.lookup(document) {
                        Some(v) => v,
                        None => return Ok(Rendered::Unresolved(field.reference_text())),
                    };
                    out.push_str(&stringify(field, value)?);
                }
            }
        }
        Ok(Rendered::Resolved(out))
    }

    /// Render where every reference must resolve; an absent reference becomes
    /// [`RenderError::MissingReference`]. Used for row cells and file
    /// prefixes, where a silent gap would corrupt the output.
    pub fn render_required(&self, document: &Value) -> Result<String, RenderError> {
        match self.render(document)? {
            Rendered::Resolved(text) => Ok(text),
            Rendered::Unresolved(reference) => Err(RenderError::MissingReference { reference }),
        }
    }
}

fn parse_field(group: &str, template: &str) -> Result<FieldRef, TemplateParseError> {
    let (path_text, spec_text) = match group.split_once(':') {
        Some((p, s)) => (p, Some(s)),
        None => (group, None),
    };

    if path_text.is_empty() {
        return Err(TemplateParseError::EmptyReference { template: template.to_owned() });
    }

    let mut path = Vec::new();
    let mut rest = path_text;
    let head_end = rest.find('[').unwrap_or(rest.len());
    let (head, mut tail) = rest.split_at(head_end);
    if head.is_empty() || head.contains(']') {
        return Err(TemplateParseError::BadPath {
            path: path_text.to_owned(),
            template: template.to_owned(),
        });
    }
    path.push(PathSeg::Key(head.to_owned()));

    while !tail.is_empty() {
        rest = tail
            .strip_prefix('[')
            .ok_or_else(|| TemplateParseError::BadPath {
                path: path_text.to_owned(),
                template: template.to_owned(),
            })?;
        let close = rest.find(']').ok_or_else(|| TemplateParseError::BadPath {
            path: path_text.to_owned(),
            template: template.to_owned(),
        })?;
        let seg = &rest[..close];
        if seg.is_empty() {
            return Err(TemplateParseError::BadPath {
                path: path_text.to_owned(),
                template: template.to_owned(),
            });
        }
        match seg.parse::<usize>() {
            Ok(index) => path.push(PathSeg::Index(index)),
            Err(_) => path.push(PathSeg::Key(seg.to_owned())),
        }
        tail = &rest[close + 1..];
    }

    let format = match spec_text {
        None | Some("") => None,
        Some(spec) => Some(parse_format_spec(spec).ok_or_else(|| {
            TemplateParseError::BadFormatSpec {
                spec: spec.to_owned(),
                template: template.to_owned(),
            }
        })?),
    };

    Ok(FieldRef { path, format })
}

// Accepts `.N` (significant digits) and `.Nf` (fixed decimal places).
fn parse_format_spec(spec: &str) -> Option<FormatSpec> {
    let digits = spec.strip_prefix('.')?;
    match digits.strip_suffix('f') {
        Some(digits) if !digits.is_empty() => digits.parse().ok().map(FormatSpec::Fixed),
        Some(_) => None,
        None if !digits.is_empty() => digits.parse().ok().map(FormatSpec::Significant),
        None => None,
    }
}

fn stringify(field: &FieldRef, value: &Value) -> Result<String, RenderError> {
    if let Some(format) = field.format {
        let number = value.as_f64().ok_or_else(|| RenderError::NotNumeric {
            reference: field.reference_text(),
            precision: format.digits(),
        })?;
        return Ok(match format {
            FormatSpec::Fixed(places) => format!("{:.*}", usize::from(places), number),
            FormatSpec::Significant(digits) => format_significant(number, digits),
        });
    }

    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("None".to_owned()),
        Value::Array(_) | Value::Object(_) => Err(RenderError::Unrenderable {
            reference: field.reference_text(),
        }),
    }
}

/// General notation with `digits` significant digits: fixed-point for
/// moderate exponents with trailing zeros stripped (but keeping the result
/// recognizably a float), scientific otherwise.
fn format_significant(value: f64, digits: u8) -> String {
    let digits = digits.max(1);
    if value == 0.0 {
        return "0.0".to_owned();
    }

    // Round to the requested significant digits first; the exponent of the
    // rounded value decides the notation.
    let sci = format!("{:.*e}", usize::from(digits - 1), value);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e),
        None => return sci,
    };
    let exp: i32 = exponent.parse().unwrap_or(0);

    // Fixed-point only while the rounded value keeps at least one digit
    // after the decimal point; anything wider goes scientific.
    if -4 <= exp && exp < i32::from(digits) - 1 {
        let decimals = (i32::from(digits) - 1 - exp).max(0) as usize;
        let mut out = strip_trailing_zeros(format!("{value:.decimals$}"));
        if !out.contains('.') {
            out.push_str(".0");
        }
        out
    } else {
        let mantissa = strip_trailing_zeros(mantissa.to_owned());
        format!("{mantissa}e{}{:02}", if exp < 0 { '-' } else { '+' }, exp.abs())
    }
}

fn strip_trailing_zeros(mut text: String) -> String {
    if text.contains('.') {
        while text.ends_with('0') {
            text.pop();
        }
        if text.ends_with('.') {
            text.pop();
        }
    }
    text
}
