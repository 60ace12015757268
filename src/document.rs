//! `StructuredDocument`: the in-memory IR for text/markdown/CSV documents,
//! with the index lookups the Action Interpreter needs (section lookup,
//! column resolution, row filtering, projection).

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Requested parse format. `Auto` runs the detection heuristic in
/// [`detect_format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Auto,
    Text,
    Markdown,
    Csv,
}

impl Default for Format {
    fn default() -> Self {
        Format::Auto
    }
}

/// Options for [`parse_structured_document`].
#[derive(Debug, Clone, Default)]
pub struct ParseOptions {
    pub format: Format,
    pub delimiter: Option<char>,
}

/// A markdown section produced by grouping heading lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownSection {
    pub title: String,
    pub level: u8,
    pub start_line: usize,
    pub end_line: usize,
    pub body: String,
}

/// The parsed, tagged in-memory form of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum StructuredDocument {
    Text {
        line_count: usize,
        raw_length: usize,
        content: String,
    },
    Markdown {
        line_count: usize,
        raw_length: usize,
        sections: Vec<MarkdownSection>,
    },
    Csv {
        line_count: usize,
        raw_length: usize,
        delimiter: char,
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

impl StructuredDocument {
    pub fn line_count(&self) -> usize {
        match self {
            Self::Text { line_count, .. }
            | Self::Markdown { line_count, .. }
            | Self::Csv { line_count, .. } => *line_count,
        }
    }

    pub fn raw_length(&self) -> usize {
        match self {
            Self::Text { raw_length, .. }
            | Self::Markdown { raw_length, .. }
            | Self::Csv { raw_length, .. } => *raw_length,
        }
    }

    pub fn csv_parts(&self) -> Option<(char, &[String], &[Vec<String>])> {
        match self {
            Self::Csv {
                delimiter,
                headers,
                rows,
                ..
            } => Some((*delimiter, headers.as_slice(), rows.as_slice())),
            _ => None,
        }
    }

    pub fn markdown_sections(&self) -> Option<&[MarkdownSection]> {
        match self {
            Self::Markdown { sections, .. } => Some(sections),
            _ => None,
        }
    }

    pub fn format_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Markdown { .. } => "markdown",
            Self::Csv { .. } => "csv",
        }
    }
}

const HEADING_PREFIXES: [&str; 6] = ["# ", "## ", "### ", "#### ", "##### ", "###### "];

fn heading_level(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    for (i, prefix) in HEADING_PREFIXES.iter().enumerate() {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            if !rest.trim().is_empty() {
                return Some(((i + 1) as u8, rest.trim()));
            }
        }
    }
    None
}

fn looks_like_markdown(prompt: &str) -> bool {
    prompt.lines().any(|line| heading_level(line).is_some())
}

fn split_csv_line(line: &str, delimiter: char) -> Vec<String> {
    line.split(delimiter).map(|c| c.to_string()).collect()
}

fn looks_like_csv(prompt: &str, delimiter: char) -> bool {
    let non_empty: Vec<&str> = prompt.lines().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.len() < 2 {
        return false;
    }
    let first_cells = split_csv_line(non_empty[0], delimiter).len();
    if first_cells < 2 {
        return false;
    }
    non_empty
        .iter()
        .all(|line| split_csv_line(line, delimiter).len() == first_cells)
}

/// `auto` format detection per spec: a markdown heading line wins first,
/// then a uniform multi-column split on the delimiter, else plain text.
pub fn detect_format(prompt: &str, delimiter: char) -> Format {
    if looks_like_markdown(prompt) {
        Format::Markdown
    } else if looks_like_csv(prompt, delimiter) {
        Format::Csv
    } else {
        Format::Text
    }
}

fn is_finite_number(s: &str) -> bool {
    s.trim().parse::<f64>().map(|n| n.is_finite()).unwrap_or(false)
}

fn parse_markdown(prompt: &str) -> Vec<MarkdownSection> {
    let lines: Vec<&str> = prompt.lines().collect();
    let mut headings: Vec<(usize, u8, String)> = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some((level, title)) = heading_level(line) {
            headings.push((i, level, title.to_string()));
        }
    }

    let mut sections = Vec::with_capacity(headings.len());
    for (idx, (start, level, title)) in headings.iter().enumerate() {
        // body runs until the next heading of equal-or-lower depth (i.e. <= level)
        let mut end = lines.len();
        for (next_start, next_level, _) in headings.iter().skip(idx + 1) {
            if *next_level <= *level {
                end = *next_start;
                break;
            }
        }
        let body_start = start + 1;
        let mut body_lines = &lines[body_start.min(end)..end];
        while body_lines.first().map(|l| l.trim().is_empty()).unwrap_or(false) {
            body_lines = &body_lines[1..];
        }
        while body_lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
            body_lines = &body_lines[..body_lines.len() - 1];
        }
        sections.push(MarkdownSection {
            title: title.clone(),
            level: *level,
            start_line: *start,
            end_line: end.saturating_sub(1).max(*start),
            body: body_lines.join("\n"),
        });
    }
    sections
}

/// Split `prompt` into CSV headers/rows with the same header-detection
/// heuristic [`parse_structured_document`] uses, without building a
/// [`StructuredDocument`]. `sum_csv_column` uses this directly for its
/// ad-hoc, no-IR column sum.
pub(crate) fn parse_csv(prompt: &str, delimiter: char) -> (Vec<String>, Vec<Vec<String>>) {
    let non_empty: Vec<&str> = prompt.lines().filter(|l| !l.trim().is_empty()).collect();
    if non_empty.is_empty() {
        return (Vec::new(), Vec::new());
    }

    let all_rows: Vec<Vec<String>> = non_empty
        .iter()
        .map(|line| split_csv_line(line, delimiter))
        .collect();

    let first_row_all_non_numeric = all_rows[0].iter().all(|c| !is_finite_number(c));
    let has_header = first_row_all_non_numeric
        && all_rows.len() >= 2
        && all_rows[0]
            .iter()
            .enumerate()
            .any(|(i, c)| !is_finite_number(c) && all_rows[1].get(i).map(|v| is_finite_number(v)).unwrap_or(false));

    if has_header {
        let headers = all_rows[0].clone();
        let rows = all_rows[1..].to_vec();
        (headers, rows)
    } else {
        let width = all_rows[0].len();
        let headers = (0..width).map(|i| format!("col{i}")).collect();
        (headers, all_rows)
    }
}

/// Parse `prompt` into a [`StructuredDocument`] per the format rules in
/// §4.3 of the spec.
pub fn parse_structured_document(prompt: &str, opts: ParseOptions) -> Result<StructuredDocument> {
    let delimiter = opts.delimiter.unwrap_or(',');
    let format = match opts.format {
        Format::Auto => detect_format(prompt, delimiter),
        other => other,
    };
    let line_count = prompt.lines().count();
    let raw_length = prompt.chars().count();

    Ok(match format {
        Format::Text => StructuredDocument::Text {
            line_count,
            raw_length,
            content: prompt.to_string(),
        },
        Format::Markdown => StructuredDocument::Markdown {
            line_count,
            raw_length,
            sections: parse_markdown(prompt),
        },
        Format::Csv => {
            let (headers, rows) = parse_csv(prompt, delimiter);
            StructuredDocument::Csv {
                line_count,
                raw_length,
                delimiter,
                headers,
                rows,
            }
        }
        Format::Auto => unreachable!("resolved above"),
    })
}

/// A column reference as emitted by the LM: either a non-negative integer
/// index or a header name.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRef {
    Index(usize),
    Name(String),
}

/// Resolve a [`ColumnRef`] against `headers`: numeric indices must be
/// non-negative integers; name references first exact-match, then
/// case-insensitively.
pub fn resolve_column(headers: &[String], column: &ColumnRef) -> Result<usize> {
    match column {
        ColumnRef::Index(i) => {
            if *i < headers.len() {
                Ok(*i)
            } else {
                Err(Error::execution("csv column not found"))
            }
        }
        ColumnRef::Name(name) => {
            if let Some(i) = headers.iter().position(|h| h == name) {
                return Ok(i);
            }
            let lower = name.to_lowercase();
            headers
                .iter()
                .position(|h| h.to_lowercase() == lower)
                .ok_or_else(|| Error::execution("csv column not found"))
        }
    }
}

/// Row filter comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Eq,
    Contains,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Default for Comparator {
    fn default() -> Self {
        Comparator::Eq
    }
}

/// Compare one cell against `value` per §4.3's row-filter rule: `eq`/
/// `contains` compare trimmed string forms; ordering comparators require
/// both sides to parse as finite numbers, else `false`.
pub fn compare_cell(cell: &str, comparator: Comparator, value: &str) -> bool {
    match comparator {
        Comparator::Eq => cell.trim() == value.trim(),
        Comparator::Contains => cell.trim().contains(value.trim()),
        Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
            let (Ok(a), Ok(b)) = (
                cell.trim().parse::<f64>(),
                value.trim().parse::<f64>(),
            ) else {
                return false;
            };
            if !a.is_finite() || !b.is_finite() {
                return false;
            }
            match comparator {
                Comparator::Gt => a > b,
                Comparator::Gte => a >= b,
                Comparator::Lt => a < b,
                Comparator::Lte => a <= b,
                _ => unreachable!(),
            }
        }
    }
}

/// Filter `rows` on `column`, keeping rows whose cell passes the
/// comparator against `value`. A JSON `null` value normalizes to `""`.
pub fn filter_rows(
    headers: &[String],
    rows: &[Vec<String>],
    column: &ColumnRef,
    comparator: Comparator,
    value: &str,
) -> Result<Vec<Vec<String>>> {
    let idx = resolve_column(headers, column)?;
    Ok(rows
        .iter()
        .filter(|row| {
            let cell = row.get(idx).map(|s| s.as_str()).unwrap_or("");
            compare_cell(cell, comparator, value)
        })
        .cloned()
        .collect())
}

/// Result of [`project_columns`]: the projected headers, rows, and the
/// resolved source column indices.
#[derive(Debug, Clone)]
pub struct Projection {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub indices: Vec<usize>,
}

/// Project `rows`/`headers` down to `columns` (by [`ColumnRef`]). Missing
/// cells (short rows) become empty strings. `columns` must be non-empty.
pub fn project_columns(
    headers: &[String],
    rows: &[Vec<String>],
    columns: &[ColumnRef],
) -> Result<Projection> {
    if columns.is_empty() {
        return Err(Error::dsl_validation("doc_project_columns requires a non-empty columns list"));
    }
    let indices: Vec<usize> = columns
        .iter()
        .map(|c| resolve_column(headers, c))
        .collect::<Result<_>>()?;
    let projected_headers: Vec<String> = indices.iter().map(|&i| headers[i].clone()).collect();
    let projected_rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            indices
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    Ok(Projection {
        headers: projected_headers,
        rows: projected_rows,
        indices,
    })
}

/// Look up a markdown section: exact-title match first, then
/// case-insensitive.
pub fn find_section<'a>(sections: &'a [MarkdownSection], title: &str) -> Option<&'a MarkdownSection> {
    sections
        .iter()
        .find(|s| s.title == title)
        .or_else(|| {
            let lower = title.to_lowercase();
            sections.iter().find(|s| s.title.to_lowercase() == lower)
        })
}

/// Sum numeric cells in a CSV column, skipping empty and non-numeric
/// cells.
pub fn sum_column(headers: &[String], rows: &[Vec<String>], column: &ColumnRef) -> Result<f64> {
    let idx = resolve_column(headers, column)?;
    let mut total = 0.0;
    for row in rows {
        if let Some(cell) = row.get(idx) {
            let trimmed = cell.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(n) = trimmed.parse::<f64>() {
                if n.is_finite() {
                    total += n;
                }
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_markdown_over_csv() {
        let doc = "# Title\nsome text";
        assert_eq!(detect_format(doc, ','), Format::Markdown);
    }

    #[test]
    fn detects_csv_uniform_columns() {
        let doc = "name,score\nalice,3\nbob,5";
        assert_eq!(detect_format(doc, ','), Format::Csv);
    }

    #[test]
    fn detects_plain_text() {
        let doc = "just some\nplain lines\nwith no structure at all here";
        assert_eq!(detect_format(doc, ','), Format::Text);
    }

    #[test]
    fn csv_header_detection_with_header_row() {
        let (headers, rows) = parse_csv("name,score\nalice,3\nbob,5", ',');
        assert_eq!(headers, vec!["name", "score"]);
        assert_eq!(rows, vec![vec!["alice", "3"], vec!["bob", "5"]]);
    }

    #[test]
    fn csv_synthesizes_headers_when_no_header_row_detected() {
        let (headers, rows) = parse_csv("1,2\n3,4", ',');
        assert_eq!(headers, vec!["col0", "col1"]);
        assert_eq!(rows, vec![vec!["1", "2"], vec!["3", "4"]]);
    }

    #[test]
    fn markdown_sections_group_by_depth_with_blank_trim() {
        let doc = "# A\n\nbody a\n\n## A1\nbody a1\n# B\nbody b\n";
        let sections = parse_markdown(doc);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].title, "A");
        assert_eq!(sections[0].body, "body a");
        assert_eq!(sections[1].title, "A1");
        assert_eq!(sections[1].body, "body a1");
        assert_eq!(sections[2].title, "B");
        assert_eq!(sections[2].body, "body b");
    }

    #[test]
    fn resolve_column_by_name_exact_then_case_insensitive() {
        let headers = vec!["Name".to_string(), "Score".to_string()];
        assert_eq!(
            resolve_column(&headers, &ColumnRef::Name("Score".into())).unwrap(),
            1
        );
        assert_eq!(
            resolve_column(&headers, &ColumnRef::Name("score".into())).unwrap(),
            1
        );
        assert!(resolve_column(&headers, &ColumnRef::Name("missing".into())).is_err());
    }

    #[test]
    fn compare_cell_ordering_requires_numeric() {
        assert!(compare_cell("5", Comparator::Gt, "3"));
        assert!(!compare_cell("abc", Comparator::Gt, "3"));
        assert!(compare_cell(" alice ", Comparator::Eq, "alice"));
        assert!(compare_cell("alice bob", Comparator::Contains, "bob"));
    }

    #[test]
    fn project_columns_fills_missing_cells() {
        let headers = vec!["a".to_string(), "b".to_string()];
        let rows = vec![vec!["1".to_string()]];
        let projection =
            project_columns(&headers, &rows, &[ColumnRef::Name("b".into())]).unwrap();
        assert_eq!(projection.rows[0], vec!["".to_string()]);
    }

    #[test]
    fn sum_column_skips_non_numeric() {
        let headers = vec!["score".to_string()];
        let rows = vec![
            vec!["3".to_string()],
            vec!["".to_string()],
            vec!["not a number".to_string()],
            vec!["5".to_string()],
        ];
        let total = sum_column(&headers, &rows, &ColumnRef::Index(0)).unwrap();
        assert_eq!(total, 8.0);
    }

    #[test]
    fn find_section_case_insensitive_fallback() {
        let sections = parse_markdown("# Intro\nhello\n");
        assert!(find_section(&sections, "intro").is_some());
        assert!(find_section(&sections, "Intro").is_some());
        assert!(find_section(&sections, "missing").is_none());
    }
}
