//! Query-string serialization.
//!
//! The wire envelope cannot carry a serializer function, so when a caller
//! supplies one the dispatcher resolves the full URL locally before
//! publishing and clears `params` from the envelope. Serialization is an
//! explicit recursive descent over the closed set of JSON value kinds,
//! with an optional visitor injected as a strategy for custom encodings.

use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;

/// Characters left intact by query encoding, `encodeURIComponent`-style.
const QUERY_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How array members are keyed in the query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexStyle {
    /// `items[0]=a&items[1]=b`
    Indices,
    /// `items[]=a&items[]=b`
    #[default]
    Brackets,
    /// `items=a&items=b`
    Plain,
}

/// What a [`ParamVisitor`] decided about one node.
pub enum Visited {
    /// Emit `key=value` with this pre-encoded value.
    Value(String),
    /// JSON-stringify the subtree under the key with its `{}` suffix
    /// stripped.
    Json,
    /// Flatten the array under the key with its `[]` suffix stripped.
    Flatten,
    /// Descend into the node with default handling.
    Recurse,
    /// Drop the node.
    Skip,
}

/// Pluggable per-node encoding strategy.
pub trait ParamVisitor: Send + Sync {
    /// Inspects the value reached at `key` (full bracket-notation path)
    /// via `path` (the individual segments).
    fn visit(&self, value: &Value, key: &str, path: &[String]) -> Visited;
}

/// Options controlling the default recursive descent.
#[derive(Clone, Default)]
pub struct SerializeOptions {
    /// Full-serializer override: receives the params and these options,
    /// returns the complete query string.
    pub serialize: Option<Arc<dyn Fn(&Value, &SerializeOptions) -> String + Send + Sync>>,
    /// Per-node strategy.
    pub visitor: Option<Arc<dyn ParamVisitor>>,
    /// Percent-encode keys and values.
    pub encode: bool,
    /// Array member keying.
    pub indexes: IndexStyle,
    /// Join object paths with `.` instead of brackets.
    pub dots: bool,
    /// Mark object-valued keys with a `{}` suffix and JSON-stringify them.
    pub meta_tokens: bool,
}

impl std::fmt::Debug for SerializeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerializeOptions")
            .field("has_serialize", &self.serialize.is_some())
            .field("has_visitor", &self.visitor.is_some())
            .field("encode", &self.encode)
            .field("indexes", &self.indexes)
            .field("dots", &self.dots)
            .field("meta_tokens", &self.meta_tokens)
            .finish()
    }
}

/// A caller-supplied query serializer.
#[derive(Clone)]
pub enum ParamsSerializer {
    /// A bare function producing the whole query string.
    Function(Arc<dyn Fn(&Value) -> String + Send + Sync>),
    /// Options for the default descent, possibly with a full-serializer
    /// member or a visitor strategy.
    Options(SerializeOptions),
}

impl std::fmt::Debug for ParamsSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function(_) => f.write_str("ParamsSerializer::Function"),
            Self::Options(opts) => f.debug_tuple("ParamsSerializer::Options").field(opts).finish(),
        }
    }
}

/// Resolves `url` plus `params` into a full URL.
///
/// Appends with `?`, or `&` when the URL already carries a query.
#[must_use]
pub fn build_url(url: &str, params: Option<&Value>, serializer: Option<&ParamsSerializer>) -> String {
    let Some(params) = params else {
        return url.to_owned();
    };

    let query = match serializer {
        Some(ParamsSerializer::Function(f)) => f(params),
        Some(ParamsSerializer::Options(opts)) => serialize_with_options(params, opts),
        None => serialize_with_options(params, &SerializeOptions::default()),
    };

    if query.is_empty() {
        return url.to_owned();
    }
    let joiner = if url.contains('?') { '&' } else { '?' };
    format!("{url}{joiner}{query}")
}

fn serialize_with_options(params: &Value, opts: &SerializeOptions) -> String {
    if let Some(serialize) = &opts.serialize {
        return serialize(params, opts);
    }
    // Pre-serialized query string passthrough.
    if let Value::String(raw) = params {
        return raw.clone();
    }

    let mut pairs = Vec::new();
    descend(params, None, &mut Vec::new(), opts, &mut pairs);

    let encode = |s: &str| -> String {
        if opts.encode {
            utf8_percent_encode(s, QUERY_ENCODE).to_string()
        } else {
            s.to_owned()
        }
    };
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn child_key(parent: Option<&str>, key: &str, opts: &SerializeOptions) -> String {
    match parent {
        None => key.to_owned(),
        Some(p) if opts.dots => format!("{p}.{key}"),
        Some(p) => format!("{p}[{key}]"),
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(String::new()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn descend(
    value: &Value,
    key: Option<&str>,
    path: &mut Vec<String>,
    opts: &SerializeOptions,
    out: &mut Vec<(String, String)>,
) {
    match value {
        Value::Object(map) => {
            for (name, child) in map {
                let mut full = child_key(key, name, opts);
                if opts.meta_tokens && child.is_object() {
                    full.push_str("{}");
                }
                path.push(name.clone());
                emit(child, &full, path, opts, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                let idx = i.to_string();
                let full = match (key, opts.indexes) {
                    (Some(k), IndexStyle::Indices) => format!("{k}[{idx}]"),
                    (Some(k), IndexStyle::Brackets) => format!("{k}[]"),
                    (Some(k), IndexStyle::Plain) => k.to_owned(),
                    (None, _) => idx.clone(),
                };
                path.push(idx);
                emit(child, &full, path, opts, out);
                path.pop();
            }
        }
        scalar => {
            if let (Some(k), Some(text)) = (key, scalar_text(scalar)) {
                out.push((k.to_owned(), text));
            }
        }
    }
}

fn emit(
    value: &Value,
    full_key: &str,
    path: &mut Vec<String>,
    opts: &SerializeOptions,
    out: &mut Vec<(String, String)>,
) {
    let step = match &opts.visitor {
        Some(visitor) => visitor.visit(value, full_key, path),
        None => default_visit(value, full_key),
    };
    match step {
        Visited::Value(text) => out.push((full_key.to_owned(), text)),
        Visited::Json => {
            let key = full_key.strip_suffix("{}").unwrap_or(full_key);
            out.push((key.to_owned(), value.to_string()));
        }
        Visited::Flatten => {
            let key = full_key.strip_suffix("[]").unwrap_or(full_key);
            if let Value::Array(items) = value {
                for item in items {
                    if let Some(text) = scalar_text(item) {
                        out.push((key.to_owned(), text));
                    }
                }
            } else if let Some(text) = scalar_text(value) {
                out.push((key.to_owned(), text));
            }
        }
        Visited::Recurse => descend(value, Some(full_key), path, opts, out),
        Visited::Skip => {}
    }
}

/// The built-in per-node strategy.
///
/// `{}`-suffixed keys force JSON-stringified sub-objects, `[]`-suffixed
/// keys force array flattening, scalar arrays flatten, everything else
/// recurses or emits a scalar pair.
fn default_visit(value: &Value, full_key: &str) -> Visited {
    if full_key.ends_with("{}") && (value.is_object() || value.is_array()) {
        return Visited::Json;
    }
    if let Value::Array(items) = value {
        let all_scalar = items.iter().all(|v| !v.is_object() && !v.is_array());
        if full_key.ends_with("[]") || all_scalar {
            return Visited::Flatten;
        }
        return Visited::Recurse;
    }
    if value.is_object() {
        return Visited::Recurse;
    }
    match scalar_text(value) {
        Some(text) => Visited::Value(text),
        None => Visited::Skip,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn no_params_leaves_url_untouched() {
        assert_eq!(build_url("/search", None, None), "/search");
    }

    #[test]
    fn scalar_params_default_encoding() {
        // serde_json maps iterate in key order.
        let params = json!({"q": "hello world", "page": 2});
        let url = build_url("/search", Some(&params), None);
        assert_eq!(url, "/search?page=2&q=hello world");
    }

    #[test]
    fn nested_objects_use_bracket_paths() {
        let params = json!({"user": {"name": "fred", "age": 52}});
        let url = build_url("/", Some(&params), None);
        assert_eq!(url, "/?user[age]=52&user[name]=fred");
    }

    #[test]
    fn dots_option_joins_with_dots() {
        let opts = SerializeOptions {
            dots: true,
            ..SerializeOptions::default()
        };
        let params = json!({"user": {"name": "fred"}});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, "/?user.name=fred");
    }

    #[test]
    fn scalar_arrays_flatten_by_default() {
        let params = json!({"tags": ["a", "b"]});
        let url = build_url("/", Some(&params), None);
        assert_eq!(url, "/?tags=a&tags=b");
    }

    #[test]
    fn indices_style_numbers_array_members() {
        let opts = SerializeOptions {
            indexes: IndexStyle::Indices,
            ..SerializeOptions::default()
        };
        let params = json!({"items": [{"id": 1}, {"id": 2}]});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, "/?items[0][id]=1&items[1][id]=2");
    }

    #[test]
    fn meta_tokens_json_stringify_objects() {
        let opts = SerializeOptions {
            meta_tokens: true,
            ..SerializeOptions::default()
        };
        let params = json!({"filter": {"active": true}});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, r#"/?filter={"active":true}"#);
    }

    #[test]
    fn raw_string_params_pass_through() {
        let params = json!("a=1&b=2");
        let url = build_url("/", Some(&params), None);
        assert_eq!(url, "/?a=1&b=2");
    }

    #[test]
    fn function_serializer_is_used_verbatim() {
        let serializer = ParamsSerializer::Function(Arc::new(|_| "custom=1".to_owned()));
        let params = json!({"ignored": true});
        let url = build_url("/path", Some(&params), Some(&serializer));
        assert_eq!(url, "/path?custom=1");
    }

    #[test]
    fn serialize_member_overrides_descent() {
        let opts = SerializeOptions {
            serialize: Some(Arc::new(|_, _| "from-member=yes".to_owned())),
            ..SerializeOptions::default()
        };
        let params = json!({"ignored": true});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, "/?from-member=yes");
    }

    #[test]
    fn visitor_strategy_controls_encoding() {
        struct Upper;
        impl ParamVisitor for Upper {
            fn visit(&self, value: &Value, _key: &str, _path: &[String]) -> Visited {
                match value {
                    Value::String(s) => Visited::Value(s.to_uppercase()),
                    _ => Visited::Recurse,
                }
            }
        }
        let opts = SerializeOptions {
            visitor: Some(Arc::new(Upper)),
            ..SerializeOptions::default()
        };
        let params = json!({"name": "fred"});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, "/?name=FRED");
    }

    #[test]
    fn percent_encoding_applies_when_enabled() {
        let opts = SerializeOptions {
            encode: true,
            ..SerializeOptions::default()
        };
        let params = json!({"q": "a&b c"});
        let url = build_url("/", Some(&params), Some(&ParamsSerializer::Options(opts)));
        assert_eq!(url, "/?q=a%26b%20c");
    }

    #[test]
    fn appends_with_ampersand_when_query_exists() {
        let params = json!({"b": 2});
        let url = build_url("/x?a=1", Some(&params), None);
        assert_eq!(url, "/x?a=1&b=2");
    }
}
