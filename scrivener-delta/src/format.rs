//! Conversion between [`Content`] and external document formats.
//!
//! Used for import/export only, never on the sync path.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::content::Content;
use crate::op::{Attributes, InsertValue};

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("unsupported input: {0}")]
    Unsupported(String),
}

/// Produces a file body from document content.
pub trait ContentExporter {
    fn export(&self, content: &Content) -> String;
}

/// Builds document content from a file body.
pub trait ContentImporter {
    fn import(&self, input: &str) -> Result<Content, FormatError>;
}

/// Unformatted text. Embeds are dropped on export.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl ContentExporter for PlainText {
    fn export(&self, content: &Content) -> String {
        content.text()
    }
}

impl ContentImporter for PlainText {
    fn import(&self, input: &str) -> Result<Content, FormatError> {
        if input.contains('\0') {
            return Err(FormatError::Unsupported("NUL byte in text".into()));
        }
        Ok(Content::from_text(input))
    }
}

/// HTML export, one `<p>` (or `<hN>`) per line.
///
/// With `standalone` set the body is wrapped in a complete UTF-8 page, the
/// form word processors accept when opening an `.html`/`.doc` file.
#[derive(Debug, Clone, Copy)]
pub struct Html {
    pub standalone: bool,
}

impl Default for Html {
    fn default() -> Self {
        Self { standalone: true }
    }
}

impl Html {
    pub fn fragment() -> Self {
        Self { standalone: false }
    }
}

impl ContentExporter for Html {
    fn export(&self, content: &Content) -> String {
        let mut body = String::new();
        let mut line = String::new();

        for run in content.runs() {
            match run.value {
                InsertValue::Text(text) => {
                    let mut parts = text.split('\n').peekable();
                    while let Some(part) = parts.next() {
                        push_inline(&mut line, part, run.attributes);
                        if parts.peek().is_some() {
                            close_block(&mut body, &mut line, run.attributes);
                        }
                    }
                }
                InsertValue::Embed(embed) => push_embed(&mut line, embed),
            }
        }
        if !line.is_empty() {
            close_block(&mut body, &mut line, None);
        }

        if self.standalone {
            format!("<html><head><meta charset=\"UTF-8\"></head><body>{body}</body></html>")
        } else {
            body
        }
    }
}

/// Block attributes live on the newline that ends the line.
fn close_block(body: &mut String, line: &mut String, attributes: Option<&Attributes>) {
    let tag = match attributes
        .and_then(|a| a.get("header"))
        .and_then(Value::as_u64)
    {
        Some(level @ 1..=6) => format!("h{level}"),
        _ => "p".to_string(),
    };
    if line.is_empty() {
        line.push_str("<br>");
    }
    body.push_str(&format!("<{tag}>{line}</{tag}>"));
    line.clear();
}

fn push_inline(line: &mut String, text: &str, attributes: Option<&Attributes>) {
    if text.is_empty() {
        return;
    }
    let mut html = escape(text);
    let Some(attributes) = attributes else {
        line.push_str(&html);
        return;
    };

    for (key, tag) in [("strike", "s"), ("underline", "u"), ("italic", "em"), ("bold", "strong")] {
        if attributes.get(key).and_then(Value::as_bool) == Some(true) {
            html = format!("<{tag}>{html}</{tag}>");
        }
    }
    if let Some(href) = attributes.get("link").and_then(Value::as_str) {
        html = format!("<a href=\"{}\">{html}</a>", escape(href));
    }
    line.push_str(&html);
}

fn push_embed(line: &mut String, embed: &Map<String, Value>) {
    if let Some(src) = embed.get("image").and_then(Value::as_str) {
        line.push_str(&format!("<img src=\"{}\">", escape(src)));
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
