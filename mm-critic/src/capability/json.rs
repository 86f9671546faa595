//! Decoding of model replies that are supposed to be JSON.
//!
//! Models wrap JSON in Markdown fences or add prose around it. Decoding tries
//! a strict parse of the unfenced reply first and then the outermost `{…}`
//! block; callers pick the typed default when both fail.

use serde::de::DeserializeOwned;

use super::{CapabilityError, CapabilityResult, CompletionRequest, LlmClient};

pub fn decode<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let unfenced = strip_fences(raw);
    serde_json::from_str(unfenced).ok().or_else(|| {
        outermost_object(unfenced).and_then(|inner| serde_json::from_str(inner).ok())
    })
}

pub fn decode_or_default<T: DeserializeOwned + Default>(raw: &str) -> T {
    decode(raw).unwrap_or_default()
}

/// Completes a structured request and decodes the reply.
pub async fn ask_json<T: DeserializeOwned>(
    llm: &dyn LlmClient,
    request: CompletionRequest,
) -> CapabilityResult<T> {
    let raw = llm.complete(request.structured()).await?;
    decode(&raw).ok_or_else(|| {
        let preview: String = raw.chars().take(160).collect();
        CapabilityError::Malformed(preview)
    })
}

fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```JSON"))
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

fn outermost_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Deserialize, PartialEq)]
    struct Verdict {
        ok: bool,
        #[serde(default)]
        reason: String,
    }

    #[test]
    fn decodes_fenced_reply() {
        let raw = "```json\n{\"ok\": true, \"reason\": \"fine\"}\n```";
        assert_eq!(
            decode::<Verdict>(raw),
            Some(Verdict {
                ok: true,
                reason: "fine".to_string()
            })
        );
    }

    #[test]
    fn recovers_object_surrounded_by_prose() {
        let raw = "Sure! Here is the verdict: {\"ok\": false} Hope this helps.";
        assert_eq!(decode::<Verdict>(raw).map(|v| v.ok), Some(false));
    }

    #[test]
    fn falls_back_to_default_on_garbage() {
        assert_eq!(decode_or_default::<Verdict>("no json here"), Verdict::default());
        assert_eq!(decode_or_default::<Verdict>("} backwards {"), Verdict::default());
    }
}
