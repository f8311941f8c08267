//! Minimal POSIX-ish `.env` parser: `KEY=VALUE` lines, `#` comments,
//! single/double-quoted values, and `\n`/`\r`/`\t` escapes inside
//! double-quoted values.

pub fn parse(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.push((key.to_string(), parse_value(value.trim())));
    }
    out
}

fn parse_value(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return unescape(&raw[1..raw.len() - 1]);
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_string();
    }
    // Unquoted: strip a trailing inline comment.
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_assignments() {
        let vars = parse("FOO=bar\nBAZ=qux\n");
        assert_eq!(vars, vec![("FOO".into(), "bar".into()), ("BAZ".into(), "qux".into())]);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        let vars = parse("# a comment\n\nFOO=bar\n");
        assert_eq!(vars, vec![("FOO".into(), "bar".into())]);
    }

    #[test]
    fn double_quoted_values_unescape_control_chars() {
        let vars = parse("MSG=\"line1\\nline2\"\n");
        assert_eq!(vars[0].1, "line1\nline2");
    }

    #[test]
    fn single_quoted_values_are_literal() {
        let vars = parse("MSG='no \\n escapes here'\n");
        assert_eq!(vars[0].1, "no \\n escapes here");
    }

    #[test]
    fn export_prefix_is_stripped() {
        let vars = parse("export FOO=bar\n");
        assert_eq!(vars, vec![("FOO".into(), "bar".into())]);
    }
}
