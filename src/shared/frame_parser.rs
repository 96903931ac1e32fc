//! Fast parser for per-line stack-frame records of the form
//! `{"ip":"0x7f2b44d01234","sp":"0x7ffd2e001000"}`.
//!
//! Keys may come in any order and extra keys with arbitrary value types are
//! skipped. Only the `ip` value is kept; the stack pointer of the parsed
//! frame is normalized to 0.

use crate::shared::types::StackFrame;

fn skip_whitespace(p: &mut &str) {
    *p = p.trim_start_matches([' ', '\t', '\r', '\n']);
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn peek_char(p: &str) -> Option<char> {
    p.chars().next()
}

fn expect_char(p: &mut &str, expected: char) -> Option<()> {
    skip_whitespace(p);
    if get_char(p)? == expected {
        Some(())
    } else {
        None
    }
}

/// Consumes a double-quoted string, handling `\"` and other backslash
/// escapes, and returns its raw (unescaped-length) content.
fn get_string<'a>(p: &mut &'a str) -> Option<&'a str> {
    skip_whitespace(p);
    if get_char(p)? != '"' {
        return None;
    }
    let rest = *p;
    let mut escaped = false;
    for (index, ch) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '"' => {
                *p = &rest[index + 1..];
                return Some(&rest[..index]);
            }
            _ => {}
        }
    }
    // Unterminated string: truncated input.
    None
}

/// Skips one value of any supported type: string, number, boolean, null,
/// array, or object. Returns `None` if the value is truncated.
fn skip_value(p: &mut &str) -> Option<()> {
    skip_whitespace(p);
    match peek_char(p)? {
        '"' => {
            get_string(p)?;
            Some(())
        }
        '[' | '{' => {
            let open = get_char(p)?;
            let close = if open == '[' { ']' } else { '}' };
            let mut depth = 1usize;
            let mut in_string = false;
            let mut escaped = false;
            while let Some(ch) = get_char(p) {
                if in_string {
                    if escaped {
                        escaped = false;
                    } else if ch == '\\' {
                        escaped = true;
                    } else if ch == '"' {
                        in_string = false;
                    }
                    continue;
                }
                match ch {
                    '"' => in_string = true,
                    c if c == open => depth += 1,
                    c if c == close => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(());
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        _ => {
            // Number, boolean or null: consume until a delimiter.
            let end = p
                .char_indices()
                .find(|(_, c)| matches!(c, ',' | '}' | ']') || c.is_whitespace())
                .map(|(i, _)| i)?;
            if end == 0 {
                return None;
            }
            *p = &p[end..];
            Some(())
        }
    }
}

fn parse_hex_address(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parses one `{"ip":"0x<hex>", ...}` line into a frame with the stack
/// pointer normalized to 0. Returns `None` when the input is truncated or
/// no `ip` key is present.
pub fn parse_frame_line(line: &str) -> Option<StackFrame> {
    let mut p = line;
    expect_char(&mut p, '{')?;

    let mut ip: Option<u64> = None;
    skip_whitespace(&mut p);
    if peek_char(p)? == '}' {
        return None;
    }

    loop {
        let key = get_string(&mut p)?;
        expect_char(&mut p, ':')?;
        if key == "ip" {
            let value = get_string(&mut p)?;
            ip = Some(parse_hex_address(value)?);
        } else {
            skip_value(&mut p)?;
        }

        skip_whitespace(&mut p);
        match get_char(&mut p)? {
            ',' => {
                skip_whitespace(&mut p);
            }
            '}' => break,
            _ => return None,
        }
    }

    ip.map(|ip| StackFrame::new(ip, 0))
}
