//! Dialect-aware SQL statement splitting and directive-comment parsing.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

const DIRECTIVE_RE: &str = r"^--\s*(transactional|depends)\s*:\s*(.*)$";

/// Matches a leading `-- key: value` directive comment line.
fn directive_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DIRECTIVE_RE).unwrap())
}

/// Split `sql` into top-level statements on `;`, tracking single/double
/// quoted string literals, `--`/`/* */` comments, and `$tag$...$tag$`
/// dollar-quoted blocks so that a semicolon inside any of those is never
/// mistaken for a statement terminator. Empty/whitespace-only statements
/// are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' | '"' => {
                let quote = c;
                current.push(c);
                i += 1;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    current.push(ch);
                    i += 1;
                    if ch == quote {
                        if i < bytes.len() && bytes[i] as char == quote {
                            current.push(quote);
                            i += 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] as char == '-' => {
                while i < bytes.len() && bytes[i] as char != '\n' {
                    current.push(bytes[i] as char);
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] as char == '*' => {
                current.push('/');
                current.push('*');
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] as char == '*' && bytes[i + 1] as char == '/') {
                    current.push(bytes[i] as char);
                    i += 1;
                }
                if i + 1 < bytes.len() {
                    current.push('*');
                    current.push('/');
                    i += 2;
                }
            }
            '$' => {
                if let Some((tag_end, tag)) = dollar_tag(sql, i) {
                    if let Some(close) = sql[tag_end..].find(&tag) {
                        let end = tag_end + close + tag.len();
                        current.push_str(&sql[i..end]);
                        i = end;
                        continue;
                    }
                }
                current.push(c);
                i += 1;
            }
            ';' => {
                let stmt = current.trim().to_string();
                if !stmt.is_empty() {
                    statements.push(stmt);
                }
                current.clear();
                i += 1;
            }
            _ => {
                current.push(c);
                i += 1;
            }
        }
    }

    let tail = current.trim().to_string();
    if !tail.is_empty() {
        statements.push(tail);
    }

    statements
}

/// Recognize a `$tag$` dollar-quote opener starting at byte offset `start`
/// (which must point at `$`). Returns the offset just past the opening tag
/// and the full tag text (e.g. `"$tag$"`) to search for as the closer.
fn dollar_tag(sql: &str, start: usize) -> Option<(usize, String)> {
    let rest = &sql[start..];
    let mut chars = rest.char_indices().skip(1);
    let mut end = None;
    for (i, ch) in &mut chars {
        if ch == '$' {
            end = Some(i);
            break;
        }
        if !(ch.is_ascii_alphanumeric() || ch == '_') {
            return None;
        }
    }
    let end = end?;
    let tag = &rest[..=end];
    Some((start + end + 1, tag.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct Directives {
    pub transactional: Option<bool>,
    pub depends: Vec<String>,
}

/// Extract directive lines from the leading comment block of `first_statement`
/// (`-- transactional: true`, `-- depends: a b`, case-sensitive keys,
/// case-insensitive boolean). Returns the directives, the leading
/// documentation comment with directive lines stripped, and the remaining
/// statement text.
pub fn parse_leading_directives(first_statement: &str) -> (Directives, String, String) {
    let mut raw: HashMap<String, String> = HashMap::new();
    let mut doc_lines = Vec::new();
    let mut lines = first_statement.lines();
    let mut sql_lines: Vec<&str> = Vec::new();

    for line in lines.by_ref() {
        if let Some((key, value)) = match_directive(line) {
            raw.entry(key)
                .and_modify(|v| {
                    v.push(' ');
                    v.push_str(&value);
                })
                .or_insert(value);
        } else if is_comment_or_blank(line) {
            doc_lines.push(line.trim().trim_start_matches("--").trim().to_string());
        } else {
            sql_lines.push(line);
            break;
        }
    }
    sql_lines.extend(lines);

    let directives = Directives {
        transactional: raw.get("transactional").map(|v| v.trim().eq_ignore_ascii_case("true")),
        depends: raw
            .get("depends")
            .map(|v| v.split_whitespace().map(String::from).collect())
            .unwrap_or_default(),
    };

    (directives, doc_lines.join("\n"), sql_lines.join("\n"))
}

fn is_comment_or_blank(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with("--")
}

fn match_directive(line: &str) -> Option<(String, String)> {
    let captures = directive_re().captures(line.trim_start())?;
    Some((captures[1].to_string(), captures[2].trim().to_string()))
}
