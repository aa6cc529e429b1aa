//! Comment stripping for JSON-with-comments config files.
//!
//! Config files are JSON that may carry `//` line comments and `/* */` block
//! comments. Stripping walks the text once, tracking string literals so that
//! `//` inside a value such as a URL is left alone. Newlines are preserved so
//! parse errors still point at the right line.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StripError {
    #[error("unterminated block comment starting on line {0}")]
    UnterminatedComment(usize),
}

/// Remove comments from `input`, leaving strict JSON behind.
pub fn strip_comments(input: &str) -> Result<String, StripError> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut line = 1usize;
    let mut in_string = false;

    while let Some(ch) = chars.next() {
        if ch == '\n' {
            line += 1;
        }

        if in_string {
            out.push(ch);
            match ch {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match (ch, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(ch);
            }
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                let start = line;
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\n' => {
                            line += 1;
                            out.push('\n');
                        }
                        '*' if chars.peek() == Some(&'/') => {
                            chars.next();
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(StripError::UnterminatedComment(start));
                }
                out.push(' ');
            }
            _ => out.push(ch),
        }
    }

    Ok(out)
}
