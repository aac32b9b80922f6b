//! Translation of `:name`-style named parameters into driver-native form.
//!
//! Steps and internal queries write SQL with `:name` placeholders
//! regardless of backend. Each [`BackendAdapter`](crate::backend::BackendAdapter)
//! binds positionally, so this module rewrites the SQL to `?` placeholders
//! and produces a parallel vector of values in the order they're
//! referenced, skipping over quoted string/identifier literals and `--`/`/*
//! */` comments so that a colon inside a literal is never mistaken for a
//! placeholder.

use std::collections::HashMap;

use crate::error::Error;
use crate::value::Value;

/// The result of translating a `:name`-parameterized statement: SQL with
/// `?` placeholders in binding order, plus the values to bind.
#[derive(Debug)]
pub struct Translated {
    pub sql: String,
    pub values: Vec<Value>,
}

/// Rewrite `sql`'s `:name` placeholders to `?`, looking each name up in
/// `params`. Returns [`Error::Usage`] if a placeholder has no matching
/// entry in `params`.
pub fn translate(sql: &str, params: &HashMap<String, Value>) -> Result<Translated, Error> {
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push(c);
                i += 1;
                while i < bytes.len() {
                    let ch = bytes[i] as char;
                    out.push(ch);
                    i += 1;
                    if ch == quote {
                        // doubled quote is an escaped literal quote, keep scanning
                        if i < bytes.len() && bytes[i] as char == quote {
                            out.push(quote);
                            i += 1;
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] as char == '-' => {
                while i < bytes.len() && bytes[i] as char != '\n' {
                    out.push(bytes[i] as char);
                    i += 1;
                }
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] as char == '*' => {
                out.push('/');
                out.push('*');
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] as char == '*' && bytes[i + 1] as char == '/') {
                    out.push(bytes[i] as char);
                    i += 1;
                }
                if i + 1 < bytes.len() {
                    out.push('*');
                    out.push('/');
                    i += 2;
                }
            }
            ':' if i + 1 < bytes.len() && is_name_start(bytes[i + 1] as char) => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && is_name_char(bytes[end] as char) {
                    end += 1;
                }
                let name = &sql[start..end];
                let value = params.get(name).cloned().ok_or_else(|| {
                    Error::Usage(format!("no value supplied for parameter `:{name}`"))
                })?;
                values.push(value);
                out.push('?');
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(Translated { sql: out, values })
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn rewrites_named_placeholders_in_order() {
        let p = params(&[("id", Value::Integer(1)), ("name", Value::Text("x".into()))]);
        let t = translate("select * from t where id = :id and name = :name", &p).unwrap();
        assert_eq!(t.sql, "select * from t where id = ? and name = ?");
        assert_eq!(t.values, vec![Value::Integer(1), Value::Text("x".into())]);
    }

    #[test]
    fn ignores_colons_inside_string_literals() {
        let p = params(&[]);
        let t = translate("select 'time: 09:30' as label", &p).unwrap();
        assert_eq!(t.sql, "select 'time: 09:30' as label");
        assert!(t.values.is_empty());
    }

    #[test]
    fn ignores_colons_inside_comments() {
        let p = params(&[("id", Value::Integer(1))]);
        let t = translate("select :id -- not :a_placeholder\n from t", &p).unwrap();
        assert_eq!(t.values, vec![Value::Integer(1)]);
        assert!(t.sql.contains("-- not :a_placeholder"));
    }

    #[test]
    fn missing_parameter_is_a_usage_error() {
        let p = params(&[]);
        let err = translate("select :missing", &p).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn repeated_placeholder_binds_twice() {
        let p = params(&[("id", Value::Integer(7))]);
        let t = translate("select :id, :id", &p).unwrap();
        assert_eq!(t.values, vec![Value::Integer(7), Value::Integer(7)]);
    }
}
