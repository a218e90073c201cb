use std::borrow::Cow;

/// Truncates a string to at most `max_chars` characters, keeping the head.
///
/// Counts Unicode scalar values, never splits a code point, and appends no
/// ellipsis: outputs that enforce a payload limit need the exact prefix.
///
/// # Examples
///
/// ```
/// use feedrelay::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Hello World", 5), "Hello");
/// assert_eq!(truncate_chars("Short", 10), "Short");
/// assert_eq!(truncate_chars("héllo", 2), "hé");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_end, _)) => Cow::Owned(s[..byte_end].to_string()),
        None => Cow::Borrowed(s),
    }
}

fn is_control(b: u8) -> bool {
    b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Strip terminal control characters and ANSI escape sequences.
///
/// Feed content is attacker controlled; the stdout output runs it through this
/// before writing to a terminal. Tab, newline and carriage return survive.
/// CSI (`ESC [ ... final`) and OSC (`ESC ] ... BEL|ST`) sequences are removed
/// whole, as is a bare ESC.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let bytes = s.as_bytes();
    if !bytes.iter().any(|&b| b == 0x1b || is_control(b)) {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            0x1b => {
                i += 1;
                match bytes.get(i) {
                    Some(b'[') => {
                        i += 1;
                        while let Some(&c) = bytes.get(i) {
                            i += 1;
                            if (0x40..=0x7e).contains(&c) {
                                break;
                            }
                        }
                    }
                    Some(b']') => {
                        i += 1;
                        while let Some(&c) = bytes.get(i) {
                            if c == 0x07 {
                                i += 1;
                                break;
                            }
                            if c == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                                i += 2;
                                break;
                            }
                            i += 1;
                        }
                    }
                    _ => {}
                }
            }
            b if is_control(b) => i += 1,
            _ => {
                let start = i;
                while i < bytes.len() && bytes[i] != 0x1b && !is_control(bytes[i]) {
                    i += 1;
                }
                // Only ASCII bytes end a run, so the slice is on a char boundary
                out.push_str(&s[start..i]);
            }
        }
    }
    Cow::Owned(out)
}
