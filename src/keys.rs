//! Translation of symbolic key names into the bytes a terminal would send.

/// Symbolic key names understood by `send_keys`, matched case-insensitively.
const KEY_TABLE: &[(&str, &str)] = &[
    ("enter", "\r"),
    ("return", "\r"),
    ("tab", "\t"),
    ("space", " "),
    ("backspace", "\x7f"),
    ("bspace", "\x7f"),
    ("escape", "\x1b"),
    ("esc", "\x1b"),
    ("delete", "\x1b[3~"),
    ("up", "\x1b[A"),
    ("down", "\x1b[B"),
    ("right", "\x1b[C"),
    ("left", "\x1b[D"),
    ("home", "\x1b[H"),
    ("end", "\x1b[F"),
    ("pageup", "\x1b[5~"),
    ("ppage", "\x1b[5~"),
    ("pagedown", "\x1b[6~"),
    ("npage", "\x1b[6~"),
    ("ctrl+a", "\x01"),
    ("ctrl+c", "\x03"),
    ("ctrl+d", "\x04"),
    ("ctrl+e", "\x05"),
    ("ctrl+k", "\x0b"),
    ("ctrl+l", "\x0c"),
    ("ctrl+r", "\x12"),
    ("ctrl+u", "\x15"),
    ("ctrl+w", "\x17"),
    ("ctrl+x", "\x18"),
    ("ctrl+z", "\x1a"),
];

/// Look up a key name. `C-x` and `ctrl-x` are accepted for `ctrl+x`.
pub fn lookup_key(token: &str) -> Option<&'static str> {
    let lower = token.to_ascii_lowercase();
    let name = match lower.strip_prefix("c-").or_else(|| lower.strip_prefix("ctrl-")) {
        Some(key) => format!("ctrl+{key}"),
        None => lower.clone(),
    };
    KEY_TABLE
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, bytes)| *bytes)
}

struct KeyToken {
    text: String,
    /// Quoted or escaped tokens are always typed literally.
    quoted: bool,
}

/// Split on unquoted whitespace, keeping each token's raw text.
/// `None` when a quote or escape is left open.
fn raw_tokens(keys: &str) -> Option<Vec<&str>> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in keys.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match (quote, c) {
            (Some('\''), '\'') => quote = None,
            (Some('\''), _) => {}
            (_, '\\') => {
                escaped = true;
                start.get_or_insert(idx);
            }
            (Some(_), '"') => quote = None,
            (Some(_), _) => {}
            (None, c) if c.is_whitespace() => {
                if let Some(begin) = start.take() {
                    tokens.push(&keys[begin..idx]);
                }
            }
            (None, '\'' | '"') => {
                quote = Some(c);
                start.get_or_insert(idx);
            }
            (None, _) => {
                start.get_or_insert(idx);
            }
        }
    }
    if quote.is_some() || escaped {
        return None;
    }
    if let Some(begin) = start {
        tokens.push(&keys[begin..]);
    }
    Some(tokens)
}

fn tokenize(keys: &str) -> Vec<KeyToken> {
    let Some(raw) = raw_tokens(keys) else {
        return keys
            .split_whitespace()
            .map(|text| KeyToken {
                text: text.to_string(),
                quoted: false,
            })
            .collect();
    };
    raw.into_iter()
        .map(|raw| {
            let quoted = raw.contains(['\'', '"', '\\']);
            let text = if quoted {
                shlex::split(raw)
                    .map(|parts| parts.concat())
                    .unwrap_or_else(|| raw.to_string())
            } else {
                raw.to_string()
            };
            KeyToken { text, quoted }
        })
        .collect()
}

/// Turn a keystroke description such as `"y Enter"` or `"'git status' Enter"`
/// into the raw input to write.
///
/// Tokens are split shell-style so quoted text stays together. Unquoted key
/// names map through the key table; quoting a word (`'delete'`) types it
/// instead. Adjacent literal tokens are joined by one space and key sequences
/// are concatenated with no separator.
pub fn translate_keys(keys: &str) -> String {
    let mut out = String::new();
    let mut previous_literal = false;
    for token in tokenize(keys) {
        let sequence = if token.quoted {
            None
        } else {
            lookup_key(&token.text)
        };
        match sequence {
            Some(sequence) => {
                out.push_str(sequence);
                previous_literal = false;
            }
            None => {
                if previous_literal {
                    out.push(' ');
                }
                out.push_str(&token.text);
                previous_literal = true;
            }
        }
    }
    out
}
