//! Symbolic keystroke encoding.
//!
//! Translates strings such as `"ls -la Enter"` or `"C-c"` into the raw bytes
//! written to a session's input stream. The scan is a single greedy pass from
//! left to right; anything that is not a recognised token is copied through.

/// Escape byte that starts ANSI sequences and meta-prefixed keys.
const ESC: u8 = 0x1b;

/// Named keys and their byte sequences.
///
/// Where one name is a prefix of another (`Esc`/`Escape`, `F1`/`F10`) the
/// longer name comes first so it wins the match.
const NAMED_KEYS: &[(&str, &[u8])] = &[
    ("Enter", b"\r"),
    ("Return", b"\r"),
    ("Tab", b"\t"),
    ("S-Tab", b"\x1b[Z"),
    ("Escape", b"\x1b"),
    ("Esc", b"\x1b"),
    ("Space", b" "),
    ("Backspace", b"\x7f"),
    ("Delete", b"\x1b[3~"),
    ("Up", b"\x1b[A"),
    ("Down", b"\x1b[B"),
    ("Right", b"\x1b[C"),
    ("Left", b"\x1b[D"),
    ("Home", b"\x1b[H"),
    ("End", b"\x1b[F"),
    ("PageUp", b"\x1b[5~"),
    ("PageDown", b"\x1b[6~"),
    ("Insert", b"\x1b[2~"),
    ("F10", b"\x1b[21~"),
    ("F11", b"\x1b[23~"),
    ("F12", b"\x1b[24~"),
    ("F1", b"\x1bOP"),
    ("F2", b"\x1bOQ"),
    ("F3", b"\x1bOR"),
    ("F4", b"\x1bOS"),
    ("F5", b"\x1b[15~"),
    ("F6", b"\x1b[17~"),
    ("F7", b"\x1b[18~"),
    ("F8", b"\x1b[19~"),
    ("F9", b"\x1b[20~"),
];

/// Encode a symbolic keystroke string into raw input bytes.
///
/// Rules, tried in order at every position:
///
/// - `C-<char>`: control code. Letters map to `1..=26` regardless of case;
///   `@ [ \ ] ^ _ ?` map to their control bytes. Any other character is
///   emitted as-is and the prefix is dropped.
/// - `M-<char>`: ESC followed by the character.
/// - A named key from [`NAMED_KEYS`], but only when the next character is
///   not alphanumeric, so `"Entertain"` stays literal text.
/// - Anything else is copied unchanged.
///
/// Never fails; every input has an encoding.
pub fn encode_keys(input: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut rest = input;

    while let Some(first) = rest.chars().next() {
        let consumed = encode_modified(rest, &mut out).or_else(|| encode_named(rest, &mut out));

        let advance = match consumed {
            Some(len) => len,
            None => {
                push_char(&mut out, first);
                first.len_utf8()
            }
        };
        rest = &rest[advance..];
    }

    out
}

/// Handle `C-x` and `M-x`. Returns the number of input bytes consumed.
fn encode_modified(rest: &str, out: &mut Vec<u8>) -> Option<usize> {
    let (is_control, tail) = if let Some(tail) = rest.strip_prefix("C-") {
        (true, tail)
    } else if let Some(tail) = rest.strip_prefix("M-") {
        (false, tail)
    } else {
        return None;
    };

    let c = tail.chars().next()?;
    if is_control {
        match control_byte(c) {
            Some(byte) => out.push(byte),
            None => push_char(out, c),
        }
    } else {
        out.push(ESC);
        push_char(out, c);
    }

    Some(2 + c.len_utf8())
}

/// Handle named keys with the trailing boundary check.
fn encode_named(rest: &str, out: &mut Vec<u8>) -> Option<usize> {
    for (name, bytes) in NAMED_KEYS {
        if !rest.starts_with(name) {
            continue;
        }
        let at_boundary = rest[name.len()..]
            .chars()
            .next()
            .is_none_or(|next| !next.is_alphanumeric());
        if at_boundary {
            out.extend_from_slice(bytes);
            return Some(name.len());
        }
    }
    None
}

fn control_byte(c: char) -> Option<u8> {
    match c {
        'a'..='z' | 'A'..='Z' => Some(c.to_ascii_lowercase() as u8 - 96),
        '@' => Some(0x00),
        '[' => Some(0x1b),
        '\\' => Some(0x1c),
        ']' => Some(0x1d),
        '^' => Some(0x1e),
        '_' => Some(0x1f),
        '?' => Some(0x7f),
        _ => None,
    }
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}
