//! Action Interpreter: executes one [`Action`] against an [`Environment`],
//! returning a short JSON summary string.

use regex::Regex;
use serde_json::{json, Value};

use crate::action::Action;
use crate::dispatcher::SubRLMDispatcher;
use crate::document::{self, ParseOptions};
use crate::env::{Environment, SymbolCall, SymbolTable};
use crate::error::{Error, Result};

pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn word_splitter() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}_-]+").expect("valid regex"))
}

/// Executes actions against one environment. Holds the external seams
/// (`symbols`, `dispatcher`) an action may need (`call_symbol`, `sub_map`).
pub struct ActionInterpreter<'a> {
    pub env: &'a mut Environment,
    pub symbols: &'a SymbolTable,
    pub dispatcher: &'a SubRLMDispatcher,
    pub require_prompt_read_before_finalize: bool,
}

impl<'a> ActionInterpreter<'a> {
    pub async fn exec(&mut self, action: Action, step: u64) -> Result<String> {
        let op_name = op_name(&action);
        let stdout = self.exec_inner(action, step).await?;
        let scratch_keys = self.env.scratch.keys();
        self.env.trace.push_repl_exec(op_name, &stdout, scratch_keys);
        Ok(stdout)
    }

    async fn exec_inner(&mut self, action: Action, _step: u64) -> Result<String> {
        match action {
            Action::PromptMeta => {
                let summary = json!({
                    "promptId": self.env.prompt_id,
                    "length": self.env.prompt.chars().count(),
                });
                Ok(summary.to_string())
            }

            Action::DocParse { format, delimiter, out } => {
                let content = self.env.doc_store.read_all(&self.env.prompt_id).await?;
                self.env.budget.consume_prompt_chars(content.chars().count() as i64)?;
                let doc = document::parse_structured_document(&content, ParseOptions { format, delimiter })?;
                let summary = match &doc {
                    document::StructuredDocument::Text { line_count, raw_length, .. } => json!({
                        "format": "text", "lineCount": line_count, "rawLength": raw_length,
                    }),
                    document::StructuredDocument::Markdown { line_count, raw_length, sections } => json!({
                        "format": "markdown", "lineCount": line_count, "rawLength": raw_length,
                        "sectionCount": sections.len(),
                    }),
                    document::StructuredDocument::Csv { line_count, raw_length, headers, rows, .. } => json!({
                        "format": "csv", "lineCount": line_count, "rawLength": raw_length,
                        "columnCount": headers.len(), "rowCount": rows.len(),
                    }),
                };
                self.env.scratch.set(out, serde_json::to_value(doc)?);
                Ok(summary.to_string())
            }

            Action::DocSelectSection { input, title, out } => {
                let doc = self.get_document(&input)?;
                let sections = doc.markdown_sections().ok_or_else(|| Error::execution("not a markdown document"))?;
                let section = document::find_section(sections, &title)
                    .ok_or_else(|| Error::execution("markdown section not found"))?;
                let body = section.body.clone();
                self.env.scratch.set(out, Value::String(body.clone()));
                Ok(json!({"length": body.chars().count()}).to_string())
            }

            Action::DocTableSum { input, column, out } => {
                let doc = self.get_document(&input)?;
                let (_, headers, rows) = doc.csv_parts().ok_or_else(|| Error::execution("not a csv document"))?;
                let total = document::sum_column(headers, rows, &(&column).into())?;
                let text = format_number(total);
                self.env.scratch.set(out, Value::String(text.clone()));
                Ok(json!({"sum": text}).to_string())
            }

            Action::DocSelectRows { input, column, comparator, value, out } => {
                let doc = self.get_document(&input)?;
                let (delimiter, headers, rows) = doc.csv_parts().ok_or_else(|| Error::execution("not a csv document"))?;
                let filtered = document::filter_rows(headers, rows, &(&column).into(), comparator, &value)?;
                let filtered_doc = document::StructuredDocument::Csv {
                    line_count: filtered.len() + 1,
                    raw_length: 0,
                    delimiter,
                    headers: headers.to_vec(),
                    rows: filtered.clone(),
                };
                self.env.scratch.set(out, serde_json::to_value(filtered_doc)?);
                Ok(json!({"rowCount": filtered.len()}).to_string())
            }

            Action::DocProjectColumns { input, columns, out, separator, include_header } => {
                let doc = self.get_document(&input)?;
                let (_, headers, rows) = doc.csv_parts().ok_or_else(|| Error::execution("not a csv document"))?;
                let column_refs: Vec<_> = columns.iter().map(Into::into).collect();
                let projection = document::project_columns(headers, rows, &column_refs)?;
                let mut lines: Vec<String> = projection
                    .rows
                    .iter()
                    .map(|row| row.join(&separator))
                    .collect();
                if include_header {
                    lines.insert(0, projection.headers.join(&separator));
                }
                let count = lines.len();
                self.env.scratch.set(out, Value::Array(lines.into_iter().map(Value::String).collect()));
                Ok(json!({"count": count}).to_string())
            }

            Action::SlicePrompt { start, end, out } => {
                let start = start.max(0);
                let end = end.max(start);
                let chars: Vec<char> = self.env.prompt.chars().collect();
                let s = (start as usize).min(chars.len());
                let e = (end as usize).min(chars.len()).max(s);
                self.env.budget.consume_prompt_chars((e - s) as i64)?;
                let slice: String = chars[s..e].iter().collect();
                let len = slice.chars().count();
                self.env.scratch.set(out, Value::String(slice));
                Ok(json!({"length": len}).to_string())
            }

            Action::Find { needle, from, out } => {
                self.env.budget.consume_prompt_chars(self.env.prompt.chars().count() as i64)?;
                let source = match &from {
                    Some(path) => self
                        .env
                        .scratch
                        .get_path(path)
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| self.env.prompt.clone()),
                    None => self.env.prompt.clone(),
                };
                let hits = find_hits(&source, &needle);
                let count = hits.len();
                self.env.scratch.set(out, Value::Array(hits.into_iter().map(|i| Value::from(i as u64)).collect()));
                Ok(json!({"hitCount": count}).to_string())
            }

            Action::ChunkNewlines { max_lines, out } => {
                let newline_re = newline_splitter();
                let lines: Vec<&str> = newline_re.split(&self.env.prompt).collect();
                let max_lines = max_lines.max(1);
                let chunks: Vec<String> = lines
                    .chunks(max_lines)
                    .map(|chunk| chunk.join("\n"))
                    .collect();
                let count = chunks.len();
                self.env.scratch.set(out, Value::Array(chunks.into_iter().map(Value::String).collect()));
                Ok(json!({"chunkCount": count}).to_string())
            }

            Action::ChunkTokens { max_tokens, overlap, out } => {
                let tokens: Vec<&str> = self.env.prompt.split_whitespace().collect();
                let max_tokens = max_tokens.max(1);
                let overlap = overlap.min(max_tokens.saturating_sub(1));
                let step = max_tokens - overlap;
                let mut chunks = Vec::new();
                let mut i = 0;
                while i < tokens.len() {
                    let end = (i + max_tokens).min(tokens.len());
                    chunks.push(tokens[i..end].join(" "));
                    if end == tokens.len() {
                        break;
                    }
                    i += step;
                }
                if tokens.is_empty() {
                    chunks.clear();
                }
                let count = chunks.len();
                self.env.scratch.set(out, Value::Array(chunks.into_iter().map(Value::String).collect()));
                Ok(json!({"chunkCount": count}).to_string())
            }

            Action::SumCsvColumn { column, delimiter, out } => {
                // Ad-hoc sum straight off the raw prompt text, deliberately
                // skipping the StructuredDocument IR (unlike doc_table_sum,
                // which operates on an already-parsed `doc_parse` output).
                let delimiter = delimiter.unwrap_or(',');
                let (headers, rows) = document::parse_csv(&self.env.prompt, delimiter);
                let total = document::sum_column(&headers, &rows, &(&column).into())?;
                let text = format_number(total);
                self.env.scratch.set(out, Value::String(text.clone()));
                Ok(json!({"sum": text}).to_string())
            }

            Action::PickWord { index, out } => {
                let words: Vec<&str> = word_splitter()
                    .split(&self.env.prompt)
                    .filter(|w| !w.is_empty())
                    .collect();
                if words.is_empty() {
                    self.env.scratch.set(out, Value::String(String::new()));
                    return Ok(json!({"word": ""}).to_string());
                }
                let idx = index.min(words.len() - 1);
                let word = words[idx].to_string();
                self.env.scratch.set(out, Value::String(word.clone()));
                Ok(json!({"word": word}).to_string())
            }

            Action::SubMap { input, query_template, out, limit, concurrency } => {
                let items = self
                    .env
                    .scratch
                    .get(&input)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::execution("non-array input to reduce/sub_map"))?;
                let items: Vec<String> = items.iter().map(stringify).collect();
                let items = match limit {
                    Some(n) => items.into_iter().take(n).collect(),
                    None => items,
                };
                let results = self
                    .dispatcher
                    .dispatch_map(self.env, &query_template, items, concurrency.max(1))
                    .await?;
                let mut final_values = Vec::with_capacity(results.len());
                for r in results {
                    self.env.trace.push_sub_call(r.cached, &r.fingerprint, &r.final_value);
                    final_values.push(r.final_value);
                }
                self.env.scratch.set(out, Value::Array(final_values.into_iter().map(Value::String).collect()));
                Ok(json!({"mapped": true}).to_string())
            }

            Action::ReduceJoin { input, sep, out } => {
                let items = self
                    .env
                    .scratch
                    .get(&input)
                    .and_then(Value::as_array)
                    .cloned()
                    .ok_or_else(|| Error::execution("non-array input to reduce/sub_map"))?;
                let joined = items.iter().map(stringify).collect::<Vec<_>>().join(&sep);
                self.env.scratch.set(out, Value::String(joined.clone()));
                Ok(json!({"length": joined.chars().count()}).to_string())
            }

            Action::Set { path, value } => {
                if path == "final" {
                    self.env.final_value = Some(stringify(&value));
                } else {
                    self.env.scratch.set_path(&path, value);
                }
                Ok(json!({"ok": true}).to_string())
            }

            Action::Finalize { from, value } => {
                if self.require_prompt_read_before_finalize && self.env.budget.prompt_read_chars_used() == 0 {
                    return Err(Error::execution("finalize requires a prior prompt read"));
                }
                let resolved = if let Some(v) = value {
                    stringify(&v)
                } else {
                    let from = from.ok_or_else(|| Error::dsl_validation("finalize requires from or value"))?;
                    let v = self
                        .env
                        .scratch
                        .get_path(&from)
                        .ok_or_else(|| Error::execution("finalize value missing"))?;
                    stringify(v)
                };
                self.env.final_value = Some(resolved.clone());
                Ok(json!({"final": resolved}).to_string())
            }

            Action::CallSymbol { symbol, out, args, input } => {
                let handler = self
                    .symbols
                    .get(&symbol)
                    .ok_or_else(|| Error::execution(format!("unknown symbol: {symbol}")))?;
                let call = SymbolCall {
                    symbol: symbol.clone(),
                    prompt: self.env.prompt.clone(),
                    prompt_id: self.env.prompt_id.clone(),
                    depth: self.env.depth,
                    scratch: self.env.scratch.as_object().clone(),
                    args,
                    input,
                };
                let result = handler.call(call).await?;
                let text = stringify(&result);
                self.env.scratch.set(out, Value::String(text.clone()));
                Ok(json!({"result": text}).to_string())
            }
        }
    }

    fn get_document(&self, key: &str) -> Result<document::StructuredDocument> {
        let value = self
            .env
            .scratch
            .get(key)
            .ok_or_else(|| Error::execution(format!("undefined scratch lookup: {key}")))?;
        serde_json::from_value(value.clone())
            .map_err(|_| Error::execution("scratch value is not a parsed document"))
    }
}

fn op_name(action: &Action) -> &'static str {
    match action {
        Action::PromptMeta => "prompt_meta",
        Action::DocParse { .. } => "doc_parse",
        Action::DocSelectSection { .. } => "doc_select_section",
        Action::DocTableSum { .. } => "doc_table_sum",
        Action::DocSelectRows { .. } => "doc_select_rows",
        Action::DocProjectColumns { .. } => "doc_project_columns",
        Action::SlicePrompt { .. } => "slice_prompt",
        Action::Find { .. } => "find",
        Action::ChunkNewlines { .. } => "chunk_newlines",
        Action::ChunkTokens { .. } => "chunk_tokens",
        Action::SumCsvColumn { .. } => "sum_csv_column",
        Action::PickWord { .. } => "pick_word",
        Action::SubMap { .. } => "sub_map",
        Action::ReduceJoin { .. } => "reduce_join",
        Action::Set { .. } => "set",
        Action::Finalize { .. } => "finalize",
        Action::CallSymbol { .. } => "call_symbol",
    }
}

fn newline_splitter() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\r?\n").expect("valid regex"))
}

/// Non-overlapping hit indices of `needle` in `source`, advancing by
/// `max(1, needle.len())` chars after each match.
fn find_hits(source: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = source.chars().collect();
    let needle_chars: Vec<char> = needle.chars().collect();
    let step = needle_chars.len().max(1);
    let mut hits = Vec::new();
    let mut i = 0;
    while i + needle_chars.len() <= chars.len() {
        if chars[i..i + needle_chars.len()] == needle_chars[..] {
            hits.push(i);
            i += step;
        } else {
            i += 1;
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_hits_non_overlapping() {
        assert_eq!(find_hits("aaaa", "aa"), vec![0, 2]);
        assert_eq!(find_hits("abcabc", "abc"), vec![0, 3]);
        assert_eq!(find_hits("xyz", "q"), Vec::<usize>::new());
    }

    #[test]
    fn format_number_drops_trailing_zero() {
        assert_eq!(format_number(8.0), "8");
        assert_eq!(format_number(8.5), "8.5");
    }
}
