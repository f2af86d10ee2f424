//! Token accounting.
//!
//! Upstream-reported counts are used when present; otherwise a coarse
//! word-based estimate (0.75 words per token) covers the usage row.

use serde_json::Value;

/// Estimate a token count from raw text at 0.75 words per token.
pub fn estimate_tokens(text: &str) -> i64 {
    let words = text.split_whitespace().count() as i64;
    // ceil(words / 0.75)
    (words * 4 + 2) / 3
}

/// Prompt/completion counts from a standard OpenAI `usage` object.
pub fn usage_from_response(body: &Value) -> Option<(i64, i64)> {
    let usage = body.get("usage")?;
    let prompt = usage.get("prompt_tokens")?.as_i64()?;
    let completion = usage
        .get("completion_tokens")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    Some((prompt, completion))
}

/// All client-supplied text in a request body, for prompt estimation.
pub fn request_text(body: &Value) -> String {
    let mut text = String::new();

    if let Some(messages) = body.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(|c| c.as_str()) {
                text.push_str(content);
                text.push(' ');
            }
        }
    }
    if let Some(prompt) = body.get("prompt").and_then(|p| p.as_str()) {
        text.push_str(prompt);
    }
    match body.get("input") {
        Some(Value::String(s)) => text.push_str(s),
        Some(Value::Array(items)) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    text.push_str(s);
                    text.push(' ');
                }
            }
        }
        _ => {}
    }

    text
}

/// All generated text in a buffered response body, for completion
/// estimation.
pub fn response_text(body: &Value) -> String {
    let mut text = String::new();
    if let Some(choices) = body.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            if let Some(s) = choice.get("text").and_then(|t| t.as_str()) {
                text.push_str(s);
                text.push(' ');
            }
            if let Some(s) = choice
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
            {
                text.push_str(s);
                text.push(' ');
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 2); // 1 word / 0.75 -> 1.33 -> 2
        assert_eq!(estimate_tokens("one two three"), 4);
        assert_eq!(estimate_tokens("a b c d e f"), 8);
    }

    #[test]
    fn test_usage_preferred_when_reported() {
        let body = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 34}});
        assert_eq!(usage_from_response(&body), Some((12, 34)));
    }

    #[test]
    fn test_usage_absent() {
        assert_eq!(usage_from_response(&json!({"choices": []})), None);
    }

    #[test]
    fn test_embeddings_usage_has_no_completion_tokens() {
        let body = json!({"usage": {"prompt_tokens": 8, "total_tokens": 8}});
        assert_eq!(usage_from_response(&body), Some((8, 0)));
    }

    #[test]
    fn test_request_text_from_chat_messages() {
        let body = json!({"messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hello there"},
        ]});
        let text = request_text(&body);
        assert!(text.contains("be brief"));
        assert!(text.contains("hello there"));
    }

    #[test]
    fn test_request_text_from_embedding_input_array() {
        let body = json!({"input": ["first doc", "second doc"]});
        let text = request_text(&body);
        assert!(text.contains("first doc"));
        assert!(text.contains("second doc"));
    }

    #[test]
    fn test_response_text_covers_both_shapes() {
        let chat = json!({"choices": [{"message": {"content": "hi there"}}]});
        let completion = json!({"choices": [{"text": "plain completion"}]});
        assert!(response_text(&chat).contains("hi there"));
        assert!(response_text(&completion).contains("plain completion"));
    }
}
