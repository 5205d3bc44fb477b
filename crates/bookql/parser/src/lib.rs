//! BookQL Parser - turns GraphQL-shaped operation text into a field tree.
//!
//! This is a schema-less structural parser, not a spec-compliant GraphQL
//! frontend: no type system, no fragments, no directives. Malformed input
//! never fails the parser; it degrades to an operation with an empty field
//! list, and [`validate`] turns that into a uniform rejection upstream.
//!
//! Known limitation: quoted argument values only have their first and last
//! character stripped. Escape sequences inside quotes are passed through
//! untouched; changing that would silently alter stored argument values.

#![deny(unsafe_code)]

use bookql_types::{Field, OperationKind, OperationTree};
use std::collections::BTreeMap;

/// Parse raw operation text into an [`OperationTree`].
///
/// Total over arbitrary input. Text without a top-level `{` yields a tree
/// with an empty field list and the default `query` kind.
pub fn parse_query(query: &str) -> OperationTree {
    let mut tree = OperationTree::default();

    let trimmed = query.trim();
    let Some(brace_open) = trimmed.find('{') else {
        return tree;
    };

    // The header is everything before the selection set or an argument list,
    // whichever comes first: `<kind token> [name]`.
    let head_end = trimmed.find('(').unwrap_or(brace_open).min(brace_open);
    let head = trimmed[..head_end].trim();
    if !head.is_empty() {
        let token_end = head.find(char::is_whitespace).unwrap_or(head.len());
        let token = &head[..token_end];
        if token.eq_ignore_ascii_case("mutation") {
            tree.kind = OperationKind::Mutation;
        } else if token.eq_ignore_ascii_case("subscription") {
            tree.kind = OperationKind::Subscription;
        }
        let name = head[token_end..].trim();
        if !name.is_empty() {
            tree.name = Some(name.to_string());
        }
    }

    // Outer selection set: between the first `{` and the final `}`. A missing
    // closing brace still parses whatever fields are present.
    let body = &trimmed[brace_open + 1..];
    let body = match body.rfind('}') {
        Some(close) => &body[..close],
        None => body,
    };
    tree.fields = parse_fields(body);

    tree
}

/// True iff the tree selects at least one top-level field.
pub fn validate(tree: &OperationTree) -> bool {
    !tree.fields.is_empty()
}

/// Build the structured error payload used whenever parsing or validation
/// fails. At most the first location is carried as a line hint.
pub fn error_payload(message: &str, locations: &[u32]) -> serde_json::Value {
    let mut error = serde_json::json!({ "message": message });
    if let Some(line) = locations.first() {
        error["locations"] = serde_json::json!([{ "line": line }]);
    }
    serde_json::json!({ "errors": [error] })
}

/// Split a selection-set body into field definitions by brace depth.
///
/// A top-level `,` ends a definition, and so does brace depth returning to
/// zero when a nested selection closes. Argument lists are opaque at this
/// level: braces and commas inside parentheses belong to composite argument
/// values and never split. Fields whose computed name is empty are dropped.
fn parse_fields(body: &str) -> Vec<Field> {
    let mut fields = Vec::new();
    let mut brace_depth: i32 = 0;
    let mut paren_depth: i32 = 0;
    let mut current = String::new();

    let mut flush = |buf: &mut String, fields: &mut Vec<Field>| {
        if !buf.trim().is_empty() {
            let field = parse_single_field(buf);
            if !field.name.is_empty() {
                fields.push(field);
            }
        }
        buf.clear();
    };

    for ch in body.chars() {
        match ch {
            '(' => {
                paren_depth += 1;
                current.push(ch);
            }
            ')' => {
                if paren_depth > 0 {
                    paren_depth -= 1;
                }
                current.push(ch);
            }
            '{' if paren_depth == 0 => {
                brace_depth += 1;
                current.push(ch);
            }
            '}' if paren_depth == 0 => {
                brace_depth -= 1;
                current.push(ch);
                if brace_depth == 0 {
                    flush(&mut current, &mut fields);
                }
            }
            ',' if paren_depth == 0 && brace_depth == 0 => flush(&mut current, &mut fields),
            _ => current.push(ch),
        }
    }
    flush(&mut current, &mut fields);

    fields
}

/// Parse one field definition: `[alias:] name [(args)] [{ subfields }]`.
fn parse_single_field(raw: &str) -> Field {
    let mut field = Field::default();

    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "{}" {
        return field;
    }

    // An alias is separated by the first colon outside any bracket pair;
    // colons inside argument lists or nested selections do not count.
    let head = match top_level_colon(trimmed) {
        Some(pos) => {
            let alias = trimmed[..pos].trim();
            if !alias.is_empty() {
                field.alias = Some(alias.to_string());
            }
            trimmed[pos + 1..].trim()
        }
        None => trimmed,
    };

    let name_end = head.find(|c| c == '(' || c == '{').unwrap_or(head.len());
    field.name = head[..name_end].trim().to_string();
    let mut rest = &head[name_end..];

    if let Some(stripped) = rest.strip_prefix('(') {
        match stripped.find(')') {
            Some(close) => {
                field.arguments = parse_arguments(&stripped[..close]);
                rest = &stripped[close + 1..];
            }
            // Unterminated argument list: the intended arguments are
            // unknowable, so the field must not be dispatchable at all.
            // Dropping it means an ownership-gated handler can never see a
            // truncated argument snapshot.
            None => {
                field.name.clear();
                return field;
            }
        }
    }

    if let Some(open) = rest.find('{') {
        let inner = &rest[open + 1..];
        if let Some(close) = inner.rfind('}') {
            field.sub_fields = parse_fields(&inner[..close]);
        }
    }

    field
}

/// Find the first `:` outside `()`, `{}`, and `[]` pairs.
fn top_level_colon(text: &str) -> Option<usize> {
    let mut depth: i32 = 0;
    for (pos, ch) in text.char_indices() {
        match ch {
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => depth -= 1,
            ':' if depth == 0 => return Some(pos),
            _ => {}
        }
    }
    None
}

/// Split an argument list into key/value pairs.
///
/// Commas inside composite values (`{...}` or `[...]`) do not split; a
/// fragment without a `:` is ignored. Keys are unique per field, so a
/// repeated key keeps the last value.
fn parse_arguments(args: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();

    let trimmed = args.trim();
    if trimmed.is_empty() {
        return out;
    }

    let mut depth: i32 = 0;
    let mut current = String::new();
    for ch in trimmed.chars() {
        match ch {
            '{' | '[' => {
                depth += 1;
                current.push(ch);
            }
            '}' | ']' => {
                depth -= 1;
                current.push(ch);
                if depth == 0 {
                    record_argument(&current, &mut out);
                    current.clear();
                }
            }
            ',' if depth == 0 => {
                record_argument(&current, &mut out);
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    record_argument(&current, &mut out);

    out
}

fn record_argument(fragment: &str, out: &mut BTreeMap<String, String>) {
    let trimmed = fragment.trim();
    if trimmed.is_empty() {
        return;
    }

    let Some(colon) = trimmed.find(':') else {
        return;
    };
    let key = trimmed[..colon].trim();
    let value = trimmed[colon + 1..].trim();
    if key.is_empty() {
        return;
    }

    out.insert(key.to_string(), strip_quotes(value).to_string());
}

/// Strip exactly the first and last character when the value is wrapped in
/// matching single or double quotes. No escape processing.
fn strip_quotes(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let wrapped = (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'');
        if wrapped {
            return &value[1..value.len() - 1];
        }
    }
    value
}
