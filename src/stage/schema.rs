//! Stage output schemas and parsing
//!
//! Agent answers are free text. This module pulls the JSON document out of an
//! answer, folds the field spellings models commonly produce onto the
//! canonical names, validates against the stage schema and deserializes into
//! the typed output.

use crate::error::{PipelineError, Result};
use crate::stage::types::{NotifyAck, PromptSet, ResearchFindings, StageId, StageOutput};
use jsonschema::JSONSchema;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

fn fence_pattern() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").ok())
        .as_ref()
}

/// Strip Markdown code fences and surrounding prose from a JSON answer.
///
/// The first complete JSON document wins; anything after it is ignored.
pub fn clean_json_block(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = fence_pattern()
        .and_then(|fence| fence.captures(trimmed))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    let mut starts: Vec<usize> = [inner.find('{'), inner.find('[')].into_iter().flatten().collect();
    starts.sort_unstable();

    for start in starts {
        let candidate = &inner[start..];
        let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
        if let Some(Ok(_)) = stream.next() {
            return candidate[..stream.byte_offset()].to_string();
        }
    }

    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if start < end => inner[start..=end].to_string(),
        _ => inner.to_string(),
    }
}

/// JSON Schema a stage's answer must satisfy after alias folding
pub fn stage_schema(stage: StageId) -> Option<Value> {
    match stage {
        StageId::Research => Some(json!({
            "type": "object",
            "required": ["pathogen"],
            "properties": {
                "pathogen": {"type": "string", "minLength": 1},
                "treatment": {"type": "string"},
                "medicine": {"type": "string"}
            }
        })),
        StageId::PromptSynthesis => Some(json!({
            "type": "object",
            "required": ["prompts"],
            "properties": {
                "prompts": {
                    "type": "array",
                    "minItems": 1,
                    "items": {"type": "string", "minLength": 1}
                },
                "captions": {"type": "array", "items": {"type": "string"}}
            }
        })),
        StageId::Notify => Some(json!({
            "type": "object",
            "required": ["status"],
            "properties": {
                "status": {"type": "string", "enum": ["success", "failure"]},
                "message": {"type": ["string", "null"]}
            }
        })),
        StageId::Render => None,
    }
}

fn text_of(value: &Value, separator: &str) -> Value {
    match value {
        Value::Null => Value::String(String::new()),
        Value::Array(items) => Value::String(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(separator),
        ),
        other => other.clone(),
    }
}

fn list_of(value: Value) -> Value {
    match value {
        Value::String(s) => Value::Array(vec![Value::String(s)]),
        other => other,
    }
}

/// Collect `prompt1`, `prompt2`, ... style keys in numeric order
fn numbered(object: &Map<String, Value>, prefix: &str) -> Vec<Value> {
    let mut numbered: Vec<(u32, Value)> = object
        .iter()
        .filter_map(|(key, value)| {
            let ordinal = key.strip_prefix(prefix)?.parse::<u32>().ok()?;
            Some((ordinal, value.clone()))
        })
        .collect();
    numbered.sort_by_key(|(ordinal, _)| *ordinal);
    numbered.into_iter().map(|(_, value)| value).collect()
}

fn rename(object: &mut Map<String, Value>, canonical: &str, aliases: &[&str]) {
    if object.contains_key(canonical) {
        return;
    }
    for alias in aliases {
        if let Some(value) = object.remove(*alias) {
            object.insert(canonical.to_string(), value);
            return;
        }
    }
}

/// Fold alias spellings onto canonical field names
pub fn normalize(stage: StageId, value: Value) -> Value {
    let mut object = match value {
        Value::Object(object) => object,
        other => return other,
    };

    match stage {
        StageId::Research => {
            rename(&mut object, "pathogen", &["pathogens", "pathsogens"]);
            if let Some(pathogen) = object.get("pathogen") {
                let pathogen = text_of(pathogen, ", ");
                object.insert("pathogen".to_string(), pathogen);
            }
            for field in ["treatment", "medicine"] {
                if let Some(value) = object.get(field) {
                    let value = text_of(value, "; ");
                    object.insert(field.to_string(), value);
                }
            }
        }
        StageId::PromptSynthesis => {
            rename(&mut object, "prompts", &["prompt"]);
            rename(&mut object, "captions", &["caption"]);

            if !object.contains_key("prompts") {
                let prompts = numbered(&object, "prompt");
                if !prompts.is_empty() {
                    object.insert("prompts".to_string(), Value::Array(prompts));
                }
            }
            if !object.contains_key("captions") {
                let captions = numbered(&object, "caption");
                if !captions.is_empty() {
                    object.insert("captions".to_string(), Value::Array(captions));
                }
            }

            for field in ["prompts", "captions"] {
                if let Some(value) = object.remove(field) {
                    object.insert(field.to_string(), list_of(value));
                }
            }
        }
        StageId::Notify => {
            if let Some(Value::String(status)) = object.get("status") {
                let status = status.trim().to_lowercase();
                object.insert("status".to_string(), Value::String(status));
            }
        }
        StageId::Render => {}
    }

    Value::Object(object)
}

fn validate(stage: StageId, value: &Value, raw: &str) -> Result<()> {
    let schema = match stage_schema(stage) {
        Some(schema) => schema,
        None => return Ok(()),
    };

    let compiled = JSONSchema::compile(&schema)
        .map_err(|e| PipelineError::schema(stage, format!("invalid stage schema: {}", e), raw))?;

    let messages: Vec<String> = match compiled.validate(value) {
        Ok(()) => Vec::new(),
        Err(errors) => errors.map(|e| format!("{} at '{}'", e, e.instance_path)).collect(),
    };

    if messages.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::schema(stage, messages.join("; "), raw))
    }
}

/// Validate an already-parsed JSON value and build the typed output
pub fn parse_value(stage: StageId, value: Value, raw: &str) -> Result<StageOutput> {
    let value = normalize(stage, value);
    validate(stage, &value, raw)?;

    let output = match stage {
        StageId::Research => StageOutput::Research(
            serde_json::from_value::<ResearchFindings>(value)
                .map_err(|e| PipelineError::schema(stage, e.to_string(), raw))?,
        ),
        StageId::PromptSynthesis => StageOutput::Prompts(
            serde_json::from_value::<PromptSet>(value)
                .map_err(|e| PipelineError::schema(stage, e.to_string(), raw))?,
        ),
        StageId::Notify => StageOutput::Notified(
            serde_json::from_value::<NotifyAck>(value)
                .map_err(|e| PipelineError::schema(stage, e.to_string(), raw))?,
        ),
        StageId::Render => {
            return Err(PipelineError::schema(
                stage,
                "render output is produced by the pipeline, not parsed",
                raw,
            ))
        }
    };
    Ok(output)
}

/// Parse an agent answer into the stage's typed output.
///
/// With `structured` off the answer is kept as `StageOutput::Unvalidated`.
pub fn parse_stage_output(stage: StageId, raw: &str, structured: bool) -> Result<StageOutput> {
    if !structured {
        return Ok(StageOutput::Unvalidated(raw.to_string()));
    }

    let cleaned = clean_json_block(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| PipelineError::schema(stage, format!("answer is not JSON: {}", e), raw))?;

    parse_value(stage, value, raw)
}
