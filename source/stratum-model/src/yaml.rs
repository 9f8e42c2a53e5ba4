use std::collections::HashSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_yaml::value::TaggedValue;
use serde_yaml::Value;
use thiserror::Error;

use crate::element::{Element, Map, Tag};
use crate::pool::StringPool;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The outcome of parsing one source file.
#[derive(Debug, Clone)]
pub struct ParsedConfig {
    pub element: Element,
    /// Documents named as the first step of `!ref` paths.
    pub references: Vec<String>,
}

/// Parse one YAML document into an element tree.
///
/// Structural oddities (unknown tags, non-string map keys, malformed ref
/// paths) degrade the offending node to `undefined` with a warning, the
/// request-level merge decides what that means; only unparsable input is an
/// error.
pub fn parse_document(pool: &StringPool, src: &str) -> Result<ParsedConfig, ParseError> {
    if src.trim().is_empty() {
        return Ok(ParsedConfig {
            element: Element::null(),
            references: Vec::new(),
        });
    }
    let value: Value = serde_yaml::from_str(src)?;
    let mut references = HashSet::new();
    let element = build(pool, value, &mut references);
    let mut references: Vec<String> = references.into_iter().collect();
    references.sort();
    Ok(ParsedConfig { element, references })
}

fn build(pool: &StringPool, value: Value, refs: &mut HashSet<String>) -> Element {
    match value {
        Value::Null => Element::null(),
        Value::Bool(v) => Element::bool(v),
        Value::Number(n) => number_element(&n),
        Value::String(s) => Element::str(pool.intern_str(&s)),
        Value::Sequence(items) => {
            let seq = items.into_iter().map(|v| build(pool, v, refs)).collect();
            Element::sequence(seq)
        }
        Value::Mapping(mapping) => {
            let mut entries = Map::with_capacity(mapping.len());
            for (key, val) in mapping {
                let Some(key) = scalar_string(&key) else {
                    tracing::warn!("the key of a map must be a string");
                    return Element::undefined();
                };
                entries.insert(pool.intern_str(&key), build(pool, val, refs));
            }
            Element::map(entries)
        }
        Value::Tagged(tagged) => build_tagged(pool, *tagged, refs),
    }
}

fn build_tagged(pool: &StringPool, tagged: TaggedValue, refs: &mut HashSet<String>) -> Element {
    let name = tag_name(&tagged.tag);
    let value = tagged.value;
    match (name.as_str(), value) {
        ("null", Value::Null) => Element::null(),
        ("str", v) => match scalar_string(&v) {
            Some(s) => Element::str(pool.intern_str(&s)),
            None => unknown_tag("str", &v),
        },
        ("binary", v) => match scalar_string(&v) {
            Some(encoded) => match base64_sanitize(&encoded) {
                Some(sanitized) => match BASE64.decode(sanitized.as_bytes()) {
                    Ok(bytes) => Element::bin(pool.intern(&bytes)),
                    Err(_) => {
                        tracing::warn!(value = %encoded, "the base64 value can't be decoded");
                        Element::undefined()
                    }
                },
                None => {
                    tracing::warn!(value = %encoded, "the base64 value doesn't have a valid structure");
                    Element::undefined()
                }
            },
            None => unknown_tag("binary", &v),
        },
        ("int", v) => match scalar_string(&v).and_then(|s| s.parse::<i64>().ok()) {
            Some(parsed) => Element::int(parsed),
            None => {
                tracing::warn!("the value can't be parsed as an int");
                Element::undefined()
            }
        },
        ("float", v) => match scalar_string(&v).and_then(|s| s.parse::<f64>().ok()) {
            Some(parsed) => Element::double(parsed),
            None => {
                tracing::warn!("the value can't be parsed as a float");
                Element::undefined()
            }
        },
        ("bool", v) => match scalar_string(&v).as_deref() {
            Some("true") => Element::bool(true),
            Some("false") => Element::bool(false),
            _ => {
                tracing::warn!("the value can't be parsed as a bool");
                Element::undefined()
            }
        },
        ("delete", v) if is_scalar_value(&v) => Element::delete_marker(),
        ("override", Value::Mapping(mapping)) => {
            build(pool, Value::Mapping(mapping), refs).with_tag(Tag::Override)
        }
        ("override", Value::Sequence(items)) => {
            build(pool, Value::Sequence(items), refs).with_tag(Tag::Override)
        }
        ("override", Value::String(s)) => {
            Element::str(pool.intern_str(&s)).with_tag(Tag::Override)
        }
        ("override", Value::Null) => Element::null().with_tag(Tag::Override),
        ("ref", Value::Sequence(items)) => {
            let seq = build(pool, Value::Sequence(items), refs);
            match ref_target(&seq, "!ref") {
                Some(document) => {
                    refs.insert(document);
                    seq.with_tag(Tag::Ref)
                }
                None => Element::undefined(),
            }
        }
        ("sref", Value::Sequence(items)) => {
            let seq = build(pool, Value::Sequence(items), refs);
            match ref_target(&seq, "!sref") {
                Some(_) => seq.with_tag(Tag::Sref),
                None => Element::undefined(),
            }
        }
        ("format", Value::Sequence(items)) => {
            build(pool, Value::Sequence(items), refs).with_tag(Tag::Format)
        }
        (_, v) => unknown_tag(&name, &v),
    }
}

fn unknown_tag(name: &str, value: &Value) -> Element {
    tracing::warn!(tag = name, kind = value_kind(value), "unknown tag for the value");
    Element::undefined()
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged",
    }
}

/// Path checks shared by `!ref` and `!sref`: a non-empty sequence of
/// strings. Returns the first step.
fn ref_target(seq: &Element, tag: &str) -> Option<String> {
    let items = seq.as_sequence()?;
    if items.is_empty() {
        tracing::warn!(tag, "the path must be a sequence with at least one element");
        return None;
    }
    if !items.iter().all(|e| e.is_string()) {
        tracing::warn!(tag, "all the elements of the path must be strings");
        return None;
    }
    Some(items[0].as_str()?.to_string_lossy())
}

fn number_element(n: &serde_yaml::Number) -> Element {
    if let Some(v) = n.as_i64() {
        Element::int(v)
    } else if let Some(v) = n.as_u64() {
        if let Ok(v) = i64::try_from(v) {
            Element::int(v)
        } else {
            tracing::warn!(value = v, "the integer doesn't fit a signed 64 bit value");
            Element::undefined()
        }
    } else {
        Element::double(n.as_f64().unwrap_or(f64::NAN))
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn is_scalar_value(value: &Value) -> bool {
    matches!(
        value,
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)
    )
}

fn tag_name(tag: &serde_yaml::value::Tag) -> String {
    let repr = tag.to_string();
    let repr = repr.trim_start_matches('!');
    repr.strip_prefix("tag:yaml.org,2002:")
        .unwrap_or(repr)
        .to_string()
}

/// Accept the original base64 alphabet plus interleaved spaces and newlines,
/// then pad to a multiple of four. A remainder of one is unrecoverable.
pub fn base64_sanitize(value: &str) -> Option<String> {
    let mut out = String::with_capacity(value.len() + 2);
    for c in value.chars() {
        match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '+' | '/' | '=' => out.push(c),
            ' ' | '\n' => {}
            _ => return None,
        }
    }
    match out.len() & 3 {
        1 => return None,
        2 => out.push_str("=="),
        3 => out.push('='),
        _ => {}
    }
    Some(out)
}
