use xxhash_rust::xxh3::xxh3_64;

/// Reduces a shell command to a stable key so superficially different
/// invocations of the same command collapse together for loop detection.
pub trait CommandNormalizer: Send + Sync {
    /// Hex digest of the canonical command, or empty when the command
    /// normalizes away entirely.
    fn normalize(&self, command: &str) -> String;
}

/// The built-in normalization pipeline. Transformations, in order:
/// lowercase + whitespace collapse, quoted-literal collapse, `:line[:col]`
/// suffix stripping, absolute-path basename reduction, and canonical alias
/// rewriting for the common JS test runners.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultNormalizer;

impl CommandNormalizer for DefaultNormalizer {
    fn normalize(&self, command: &str) -> String {
        let canonical = canonicalize(command);
        if canonical.is_empty() {
            return String::new();
        }
        format!("{:016x}", xxh3_64(canonical.as_bytes()))
    }
}

/// Command aliases that mean the same thing to the loop detector. Matched
/// against the canonicalized command prefix.
const ALIASES: &[(&str, &str)] = &[
    ("npm run test", "npm test"),
    ("npx jest", "npm test"),
    ("npx vitest", "npm test"),
    ("yarn test", "npm test"),
    ("pnpm test", "npm test"),
];

fn canonicalize(command: &str) -> String {
    let lowered = command.to_lowercase();
    let unquoted = collapse_quoted(&lowered);

    let tokens: Vec<String> = unquoted
        .split_whitespace()
        .map(strip_line_suffix)
        .map(|token| collapse_path(&token))
        .collect();

    let mut canonical = tokens.join(" ");

    for (alias, replacement) in ALIASES {
        if canonical == *alias {
            canonical = (*replacement).to_string();
            break;
        }
        if let Some(rest) = canonical.strip_prefix(&format!("{alias} ")) {
            canonical = format!("{replacement} {rest}");
            break;
        }
    }

    canonical
}

/// Replaces single- or double-quoted literals with `""`. An unterminated
/// quote swallows the rest of the command.
fn collapse_quoted(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c == '"' || c == '\'' {
            for inner in chars.by_ref() {
                if inner == c {
                    break;
                }
            }
            out.push_str("\"\"");
        } else {
            out.push(c);
        }
    }

    out
}

/// Strips `:123` or `:123:45` line/column suffixes from a token.
fn strip_line_suffix(token: &str) -> String {
    let mut token = token;
    for _ in 0..2 {
        match token.rsplit_once(':') {
            Some((head, tail))
                if !head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) =>
            {
                token = head;
            }
            _ => break,
        }
    }
    token.to_string()
}

/// Collapses an absolute path to its final segment.
fn collapse_path(token: &str) -> String {
    if token.starts_with('/') {
        if let Some(base) = token.rsplit('/').next() {
            if !base.is_empty() {
                return base.to_string();
            }
        }
    }
    token.to_string()
}
