//! # Parse Tree Rendering
//!
//! Debug rendering of a telegram's annotated byte ranges. Each line is
//!
//! ```text
//! NNN [ |C][ !pCE?]: description
//! ```
//!
//! where `NNN` is the byte offset, the first marker column distinguishes
//! protocol bytes (space) from meter content (`C`), and the second
//! column shows how well the bytes were understood: `!` fully, `p`
//! partially, `E` encrypted, `C` compressed, `?` not at all.
//!
//! Three renderers share the line format: plain text for logs, ANSI SGR
//! for terminals and colored `<span>`s for HTML reports.

use crate::telegram::{KindOfData, Telegram, Understanding};
use std::fmt::Write as _;

fn kind_char(kind: KindOfData) -> char {
    match kind {
        KindOfData::Protocol => ' ',
        KindOfData::Content => 'C',
    }
}

fn understanding_char(u: Understanding) -> char {
    match u {
        Understanding::Full => '!',
        Understanding::Partial => 'p',
        Understanding::Encrypted => 'E',
        Understanding::Compressed => 'C',
        Understanding::None => '?',
    }
}

/// Render the parse annotations as plain text, one line per range.
pub fn render_analysis(t: &Telegram) -> String {
    let mut out = String::new();
    for e in &t.explanations {
        let _ = writeln!(
            out,
            "{:03} {}{}: {}",
            e.offset,
            kind_char(e.kind),
            understanding_char(e.understanding),
            e.text
        );
    }
    out
}

/// ANSI SGR codes per understanding level.
fn ansi_color(u: Understanding) -> &'static str {
    match u {
        Understanding::Full => "\x1b[32m",       // green
        Understanding::Partial => "\x1b[33m",    // yellow
        Understanding::Encrypted => "\x1b[31m",  // red
        Understanding::Compressed => "\x1b[36m", // cyan
        Understanding::None => "\x1b[90m",       // bright black
    }
}

/// Render with ANSI colors for terminal output.
pub fn render_analysis_ansi(t: &Telegram) -> String {
    const RESET: &str = "\x1b[0m";
    let mut out = String::new();
    for e in &t.explanations {
        let _ = writeln!(
            out,
            "{}{:03} {}{}: {}{}",
            ansi_color(e.understanding),
            e.offset,
            kind_char(e.kind),
            understanding_char(e.understanding),
            e.text,
            RESET
        );
    }
    out
}

fn html_color(u: Understanding) -> &'static str {
    match u {
        Understanding::Full => "#00aa00",
        Understanding::Partial => "#aaaa00",
        Understanding::Encrypted => "#aa0000",
        Understanding::Compressed => "#00aaaa",
        Understanding::None => "#888888",
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Render as colored HTML spans, one per line.
pub fn render_analysis_html(t: &Telegram) -> String {
    let mut out = String::new();
    for e in &t.explanations {
        let _ = writeln!(
            out,
            "<span style=\"color:{}\">{:03} {}{}: {}</span><br/>",
            html_color(e.understanding),
            e.offset,
            kind_char(e.kind),
            understanding_char(e.understanding),
            html_escape(&e.text)
        );
    }
    out
}
