//! Dataset loading and normalization.
//!
//! Uploaded corpora arrive in four shapes: line-delimited JSON, a single
//! JSON array or object, delimited rows with a header line, or freeform
//! text split on blank lines. All of them normalize into prompt/response
//! pairs before a backend sees them.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse dataset: {0}")]
    Parse(String),

    #[error(
        "no valid training examples found; expected fields like \
         \"prompt\"/\"response\", \"instruction\"/\"response\", \
         \"input\"/\"output\", or \"question\"/\"answer\""
    )]
    NoExamples,
}

/// Detected on-disk format of an uploaded dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Jsonl,
    Json,
    Csv,
    Text,
}

impl DatasetKind {
    /// Classify a dataset by file name; anything unrecognized is treated
    /// as freeform text.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("jsonl") => DatasetKind::Jsonl,
            Some("json") => DatasetKind::Json,
            Some("csv") => DatasetKind::Csv,
            _ => DatasetKind::Text,
        }
    }
}

/// A single normalized instruction/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub prompt: String,
    pub response: String,
}

/// Read a dataset file and normalize it into training examples.
pub async fn load_examples(path: &Path) -> Result<Vec<TrainingExample>, DatasetError> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_examples(&content, DatasetKind::from_path(path))
}

/// Normalize raw dataset content into training examples.
///
/// Rejects content that yields zero recognizable pairs.
pub fn parse_examples(
    content: &str,
    kind: DatasetKind,
) -> Result<Vec<TrainingExample>, DatasetError> {
    let records = match kind {
        DatasetKind::Jsonl => parse_json_lines(content)?,
        DatasetKind::Json => parse_json(content)?,
        DatasetKind::Csv => parse_delimited(content),
        DatasetKind::Text => {
            let examples = parse_text_segments(content);
            if examples.is_empty() {
                return Err(DatasetError::NoExamples);
            }
            return Ok(examples);
        }
    };

    let examples: Vec<TrainingExample> =
        records.iter().filter_map(example_from_value).collect();

    if examples.is_empty() {
        return Err(DatasetError::NoExamples);
    }
    // Flag datasets where a meaningful share of records was dropped.
    if examples.len() * 5 < records.len() * 4 {
        warn!(
            valid = examples.len(),
            total = records.len(),
            "dataset contains records without a recognizable prompt/response pair"
        );
    }

    Ok(examples)
}

/// Best-effort example count for an uploaded file, used when registering a
/// dataset. Does not validate pair fields.
pub fn count_examples(content: &str, kind: DatasetKind) -> usize {
    match kind {
        DatasetKind::Jsonl => content.lines().filter(|l| !l.trim().is_empty()).count(),
        DatasetKind::Json => match serde_json::from_str::<Value>(content) {
            Ok(Value::Array(items)) => items.len(),
            Ok(_) => 1,
            Err(_) => 0,
        },
        DatasetKind::Csv => content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count()
            .saturating_sub(1),
        DatasetKind::Text => parse_text_segments(content).len(),
    }
}

fn parse_json_lines(content: &str) -> Result<Vec<Value>, DatasetError> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| DatasetError::Parse(e.to_string()))
        })
        .collect()
}

fn parse_json(content: &str) -> Result<Vec<Value>, DatasetError> {
    let value: Value =
        serde_json::from_str(content).map_err(|e| DatasetError::Parse(e.to_string()))?;
    Ok(match value {
        Value::Array(items) => items,
        other => vec![other],
    })
}

/// Simple comma-delimited rows under a header line. Values are taken
/// verbatim between commas; a trailing `\r` on headers is stripped.
fn parse_delimited(content: &str) -> Vec<Value> {
    let mut lines = content.lines().filter(|line| !line.trim().is_empty());
    let Some(header_line) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = header_line
        .split(',')
        .map(|h| h.trim().trim_end_matches('\r').to_string())
        .collect();

    lines
        .map(|line| {
            let values: Vec<&str> = line.split(',').collect();
            let mut record = Map::new();
            for (i, header) in headers.iter().enumerate() {
                let value = values.get(i).map(|v| v.trim()).unwrap_or_default();
                record.insert(header.clone(), Value::String(value.to_string()));
            }
            Value::Object(record)
        })
        .collect()
}

/// Freeform text: each blank-line-delimited segment becomes one example
/// with a synthetic prompt.
fn parse_text_segments(content: &str) -> Vec<TrainingExample> {
    content
        .split("\n\n")
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .enumerate()
        .map(|(i, segment)| TrainingExample {
            prompt: format!("Conversation {}", i + 1),
            response: segment.to_string(),
        })
        .collect()
}

/// Recognized pair-field conventions, in priority order.
const PAIR_FIELDS: &[(&str, &str)] = &[
    ("prompt", "response"),
    ("instruction", "response"),
    ("input", "output"),
    ("prompt", "completion"),
    ("question", "answer"),
];

fn example_from_value(value: &Value) -> Option<TrainingExample> {
    let record = value.as_object()?;

    for (prompt_field, response_field) in PAIR_FIELDS {
        if let (Some(prompt), Some(response)) = (
            text_field(record, prompt_field),
            text_field(record, response_field),
        ) {
            return Some(TrainingExample { prompt, response });
        }
    }

    // Fallback heuristic for arbitrary field names.
    let input_key = record
        .keys()
        .find(|k| k.contains("input") || k.contains("question") || k.contains("prompt"))?;
    let output_key = record
        .keys()
        .find(|k| {
            *k != input_key
                && (k.contains("output") || k.contains("answer") || k.contains("response"))
        })?;

    let prompt = text_field(record, input_key)?;
    let response = text_field(record, output_key)?;
    Some(TrainingExample { prompt, response })
}

fn text_field(record: &Map<String, Value>, key: &str) -> Option<String> {
    let text = record.get(key)?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn single_prompt_response_pair() {
        let examples =
            parse_examples(r#"[{"prompt":"p1","response":"r1"}]"#, DatasetKind::Json).unwrap();
        assert_eq!(
            examples,
            vec![TrainingExample {
                prompt: "p1".into(),
                response: "r1".into()
            }]
        );
    }

    #[test]
    fn blank_text_is_rejected() {
        let err = parse_examples("\n\n\n  \n\n", DatasetKind::Text).unwrap_err();
        assert!(matches!(err, DatasetError::NoExamples));
    }

    #[test_case(r#"{"instruction":"i","response":"r"}"# ; "instruction response")]
    #[test_case(r#"{"input":"i","output":"r"}"# ; "input output")]
    #[test_case(r#"{"prompt":"i","completion":"r"}"# ; "prompt completion")]
    #[test_case(r#"{"question":"i","answer":"r"}"# ; "question answer")]
    #[test_case(r#"{"user_input":"i","bot_response":"r"}"# ; "heuristic fallback")]
    fn pair_conventions(record: &str) {
        let examples = parse_examples(record, DatasetKind::Json).unwrap();
        assert_eq!(examples.len(), 1);
    }

    #[test]
    fn json_lines() {
        let content = "{\"prompt\":\"a\",\"response\":\"b\"}\n\n{\"prompt\":\"c\",\"response\":\"d\"}\n";
        let examples = parse_examples(content, DatasetKind::Jsonl).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[1].prompt, "c");
    }

    #[test]
    fn malformed_json_line_fails() {
        let err = parse_examples("{not json}", DatasetKind::Jsonl).unwrap_err();
        assert!(matches!(err, DatasetError::Parse(_)));
    }

    #[test]
    fn delimited_rows_with_crlf_header() {
        let content = "prompt,response\r\nhello,world\nfoo,bar\n";
        let examples = parse_examples(content, DatasetKind::Csv).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].prompt, "hello");
        assert_eq!(examples[0].response, "world");
    }

    #[test]
    fn records_without_pairs_are_rejected() {
        let err =
            parse_examples(r#"[{"title":"x"},{"author":"y"}]"#, DatasetKind::Json).unwrap_err();
        assert!(matches!(err, DatasetError::NoExamples));
    }

    #[test]
    fn text_segments_get_synthetic_prompts() {
        let examples =
            parse_examples("first segment\n\nsecond segment", DatasetKind::Text).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].prompt, "Conversation 1");
        assert_eq!(examples[1].response, "second segment");
    }

    #[test]
    fn kind_detection() {
        assert_eq!(
            DatasetKind::from_path(Path::new("data/train.jsonl")),
            DatasetKind::Jsonl
        );
        assert_eq!(
            DatasetKind::from_path(Path::new("corpus.md")),
            DatasetKind::Text
        );
    }

    #[test]
    fn example_counting() {
        assert_eq!(count_examples("a\nb\n\nc\n", DatasetKind::Jsonl), 3);
        assert_eq!(count_examples(r#"[1,2,3]"#, DatasetKind::Json), 3);
        assert_eq!(count_examples(r#"{"a":1}"#, DatasetKind::Json), 1);
        assert_eq!(count_examples("h1,h2\na,b\nc,d\n", DatasetKind::Csv), 2);
        assert_eq!(count_examples("x\n\ny", DatasetKind::Text), 2);
    }
}
