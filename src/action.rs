//! The Action DSL: the tagged variant the LM emits one of per turn, and the
//! coercion function that tolerates the LM's off-spec JSON before an
//! [`Action`] is ever constructed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::document::{Comparator, Format};
use crate::error::{Error, Result};

/// One action, as validated from the LM's JSON. `op` is the wire tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Action {
    PromptMeta,
    DocParse {
        #[serde(default)]
        format: Format,
        #[serde(default)]
        delimiter: Option<char>,
        out: String,
    },
    DocSelectSection {
        #[serde(rename = "in")]
        input: String,
        title: String,
        out: String,
    },
    DocTableSum {
        #[serde(rename = "in")]
        input: String,
        column: ColumnArg,
        out: String,
    },
    DocSelectRows {
        #[serde(rename = "in")]
        input: String,
        column: ColumnArg,
        #[serde(default)]
        comparator: Comparator,
        value: String,
        out: String,
    },
    DocProjectColumns {
        #[serde(rename = "in")]
        input: String,
        columns: Vec<ColumnArg>,
        out: String,
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default)]
        include_header: bool,
    },
    SlicePrompt {
        start: i64,
        end: i64,
        out: String,
    },
    Find {
        needle: String,
        #[serde(default)]
        from: Option<String>,
        out: String,
    },
    ChunkNewlines {
        max_lines: usize,
        out: String,
    },
    ChunkTokens {
        max_tokens: usize,
        #[serde(default)]
        overlap: usize,
        out: String,
    },
    SumCsvColumn {
        column: ColumnArg,
        #[serde(default)]
        delimiter: Option<char>,
        out: String,
    },
    PickWord {
        #[serde(default)]
        index: usize,
        out: String,
    },
    SubMap {
        #[serde(rename = "in")]
        input: String,
        query_template: String,
        out: String,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default = "default_concurrency")]
        concurrency: usize,
    },
    ReduceJoin {
        #[serde(rename = "in")]
        input: String,
        sep: String,
        out: String,
    },
    Set {
        path: String,
        value: Value,
    },
    Finalize {
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        value: Option<Value>,
    },
    CallSymbol {
        symbol: String,
        out: String,
        #[serde(default)]
        args: Option<Value>,
        #[serde(default)]
        input: Option<Value>,
    },
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_concurrency() -> usize {
    1
}

/// A column reference as it appears on the wire: either a non-negative
/// integer index or a header name. Deserializes from either a JSON number
/// or a JSON string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnArg {
    Index(usize),
    Name(String),
}

impl From<&ColumnArg> for crate::document::ColumnRef {
    fn from(c: &ColumnArg) -> Self {
        match c {
            ColumnArg::Index(i) => crate::document::ColumnRef::Index(*i),
            ColumnArg::Name(n) => crate::document::ColumnRef::Name(n.clone()),
        }
    }
}

/// Apply the Root Loop's field-alias/type-coercion normalizations to a raw
/// action object before attempting to deserialize it into an [`Action`].
/// Mutates in place and returns the same map for chaining.
pub fn coerce_action(mut raw: Map<String, Value>) -> Result<Map<String, Value>> {
    let op = raw
        .get("op")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::dsl_validation("missing op"))?
        .to_string();

    alias_field(&mut raw, "whereColumn", "column");
    alias_field(&mut raw, "cols", "columns");
    alias_field(&mut raw, "sep", "separator");
    alias_field(&mut raw, "match", "value");
    alias_field(&mut raw, "equals", "value");
    alias_field(&mut raw, "operator", "comparator");
    if op == "finalize" {
        if let Some(Value::Object(env)) = raw.remove("env") {
            if let Some(v) = env.get("final") {
                raw.insert("value".to_string(), v.clone());
            }
        }
    }
    if op == "set" {
        alias_field(&mut raw, "key", "path");
    } else {
        alias_field(&mut raw, "path", "from");
        alias_field(&mut raw, "key", "from");
    }

    coerce_bool_ish(&mut raw, "includeHeader");
    coerce_numeric_strings(&mut raw, &["start", "end", "maxLines", "maxTokens", "overlap", "limit", "concurrency", "index"]);

    fill_default_out(&mut raw, &op);

    if !KNOWN_OPS.contains(&op.as_str()) {
        return Err(Error::dsl_validation(format!("unknown op: {op}")));
    }

    Ok(raw)
}

const KNOWN_OPS: &[&str] = &[
    "prompt_meta",
    "doc_parse",
    "doc_select_section",
    "doc_table_sum",
    "doc_select_rows",
    "doc_project_columns",
    "slice_prompt",
    "find",
    "chunk_newlines",
    "chunk_tokens",
    "sum_csv_column",
    "pick_word",
    "sub_map",
    "reduce_join",
    "set",
    "finalize",
    "call_symbol",
];

fn alias_field(raw: &mut Map<String, Value>, from: &str, to: &str) {
    if !raw.contains_key(to) {
        if let Some(v) = raw.remove(from) {
            raw.insert(to.to_string(), v);
        }
    }
}

fn coerce_bool_ish(raw: &mut Map<String, Value>, field: &str) {
    if let Some(Value::String(s)) = raw.get(field) {
        match s.as_str() {
            "true" => {
                raw.insert(field.to_string(), Value::Bool(true));
            }
            "false" => {
                raw.insert(field.to_string(), Value::Bool(false));
            }
            _ => {}
        }
    }
}

fn coerce_numeric_strings(raw: &mut Map<String, Value>, fields: &[&str]) {
    for field in fields {
        if let Some(Value::String(s)) = raw.get(*field) {
            if let Ok(n) = s.trim().parse::<i64>() {
                raw.insert(field.to_string(), Value::from(n));
            }
        }
    }
}

fn fill_default_out(raw: &mut Map<String, Value>, op: &str) {
    if raw.contains_key("out") {
        return;
    }
    let default = match op {
        "doc_parse" => "doc",
        "doc_select_section" => "section",
        "doc_table_sum" => "answer",
        "doc_select_rows" => "rows",
        "doc_project_columns" => "projected",
        "slice_prompt" => "slice",
        "find" => "hits",
        "chunk_newlines" => "chunks",
        "chunk_tokens" => "chunks",
        "sum_csv_column" => "answer",
        "pick_word" => "word",
        "sub_map" => "mapped",
        "reduce_join" => "joined",
        "call_symbol" => "result",
        _ => return,
    };
    raw.insert("out".to_string(), Value::String(default.to_string()));
}

/// Parse+coerce a raw JSON value into a validated [`Action`].
pub fn parse_action(value: Value) -> Result<Action> {
    let obj = match value {
        Value::Object(m) => m,
        _ => return Err(Error::dsl_validation("action must be a JSON object")),
    };
    let coerced = coerce_action(obj)?;
    serde_json::from_value(Value::Object(coerced))
        .map_err(|e| Error::dsl_validation(format!("invalid action shape: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_op_fails() {
        let v = json!({"op": "nonsense"});
        assert!(parse_action(v).is_err());
    }

    #[test]
    fn alias_fields_resolve() {
        let v = json!({"op": "doc_select_rows", "in": "doc", "whereColumn": "name", "equals": "alice"});
        let action = parse_action(v).unwrap();
        match action {
            Action::DocSelectRows { column, value, out, .. } => {
                assert!(matches!(column, ColumnArg::Name(ref n) if n == "name"));
                assert_eq!(value, "alice");
                assert_eq!(out, "rows");
            }
            _ => panic!("expected DocSelectRows"),
        }
    }

    #[test]
    fn set_key_alias_maps_to_path() {
        let v = json!({"op": "set", "key": "answer", "value": "42"});
        let action = parse_action(v).unwrap();
        match action {
            Action::Set { path, value } => {
                assert_eq!(path, "answer");
                assert_eq!(value, json!("42"));
            }
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn default_out_filled_for_sub_map() {
        let v = json!({"op": "sub_map", "in": "items", "queryTemplate": "q: {{item}}"});
        let action = parse_action(v).unwrap();
        match action {
            Action::SubMap { out, concurrency, .. } => {
                assert_eq!(out, "mapped");
                assert_eq!(concurrency, 1);
            }
            _ => panic!("expected SubMap"),
        }
    }

    #[test]
    fn numeric_strings_coerced() {
        let v = json!({"op": "slice_prompt", "start": "3", "end": "10", "out": "slice"});
        let action = parse_action(v).unwrap();
        match action {
            Action::SlicePrompt { start, end, .. } => {
                assert_eq!(start, 3);
                assert_eq!(end, 10);
            }
            _ => panic!("expected SlicePrompt"),
        }
    }

    #[test]
    fn bool_ish_string_coerced() {
        let v = json!({
            "op": "doc_project_columns",
            "in": "doc",
            "columns": ["score"],
            "out": "out",
            "includeHeader": "true"
        });
        let action = parse_action(v).unwrap();
        match action {
            Action::DocProjectColumns { include_header, .. } => assert!(include_header),
            _ => panic!("expected DocProjectColumns"),
        }
    }

    #[test]
    fn finalize_from_path_alias() {
        let v = json!({"op": "finalize", "path": "answer"});
        let action = parse_action(v).unwrap();
        match action {
            Action::Finalize { from, value } => {
                assert_eq!(from.as_deref(), Some("answer"));
                assert_eq!(value, None);
            }
            _ => panic!("expected Finalize"),
        }
    }

    #[test]
    fn finalize_env_compat_shape() {
        let v = json!({"op": "finalize", "env": {"final": "ok"}});
        let action = parse_action(v).unwrap();
        match action {
            Action::Finalize { from, value } => {
                assert_eq!(from, None);
                assert_eq!(value, Some(json!("ok")));
            }
            _ => panic!("expected Finalize"),
        }
    }

    #[test]
    fn missing_op_is_validation_error() {
        let v = json!({"foo": "bar"});
        assert!(parse_action(v).is_err());
    }
}
