use std::borrow::Cow;

/// Remove terminal control characters and ANSI escape sequences.
///
/// Feed titles and server-supplied names end up on a terminal, so CSI
/// (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences are dropped
/// along with C0 controls and DEL. Tab, newline and carriage return survive.
///
/// Borrows when nothing needs removing.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.chars().any(is_stripped) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            if !is_stripped(c) {
                out.push(c);
            }
            continue;
        }

        match chars.peek() {
            Some('[') => {
                chars.next();
                // Parameter bytes until the final byte in 0x40..=0x7e
                for c in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&c) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    Cow::Owned(out)
}

fn is_stripped(c: char) -> bool {
    c == '\x7f' || (c.is_ascii_control() && !matches!(c, '\t' | '\n' | '\r'))
}

/// Normalize a user-supplied feed title: control characters removed,
/// surrounding whitespace trimmed. `None` when nothing is left.
pub fn normalize_title(raw: &str) -> Option<String> {
    let cleaned = strip_control_chars(raw);
    let trimmed = cleaned.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
