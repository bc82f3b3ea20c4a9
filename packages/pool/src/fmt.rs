//! ANSI fallback formatting for engine diagnostics.
//!
//! Used when the engine itself lacks a formatter. Formatted entries are
//! merged against the engine's raw stderr stream so callers see each
//! diagnostic exactly once.

use owo_colors::OwoColorize as _;

use crate::engine::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
}

/// Render diagnostics with line/column markers.
#[must_use]
pub fn format_messages(kind: MessageKind, messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|message| format_message(kind, message))
        .collect()
}

fn format_message(kind: MessageKind, message: &Message) -> String {
    let label = match kind {
        MessageKind::Error => "error".red().bold().to_string(),
        MessageKind::Warning => "warning".yellow().bold().to_string(),
    };

    let mut out = format!("{label}: {}", message.text.bold());

    if let Some(location) = &message.location {
        out.push_str(&format!(
            "\n    {}:{}:{}:",
            location.file, location.line, location.column
        ));
        if let Some(line_text) = &location.line_text {
            let caret = format!("{}{}", " ".repeat(location.column), "^".green().bold());
            out.push_str(&format!("\n      {line_text}\n      {caret}"));
        }
    }

    out
}

/// Remove ANSI CSI escape sequences.
#[must_use]
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            // Parameter and intermediate bytes run until a final byte in @..~
            for c in chars.by_ref() {
                if ('@'..='~').contains(&c) {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }

    out
}

/// Merge formatted diagnostics with the raw stderr stream.
///
/// Entries already present in the raw stream (with or without ANSI escapes)
/// are suppressed; unique entries are prepended. An empty diagnostics list
/// returns the raw stream unchanged.
#[must_use]
pub fn merge_stderr(formatted: &[String], raw: &str) -> String {
    if formatted.is_empty() {
        return raw.to_string();
    }

    let raw_plain = strip_ansi(raw);

    let mut parts = formatted
        .iter()
        .filter(|entry| {
            let plain = strip_ansi(entry);
            !raw.contains(entry.as_str()) && !raw_plain.contains(&plain)
        })
        .cloned()
        .collect::<Vec<_>>();

    if !raw.is_empty() {
        parts.push(raw.to_string());
    }

    parts.join("\n")
}
