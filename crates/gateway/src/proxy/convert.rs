//! Chat-template fallback.
//!
//! Some quantized checkpoints ship without a chat template; the engine then
//! rejects chat requests. The proxy converts the chat request into a plain
//! completion and wraps the result back into a chat envelope, so clients
//! never see the difference.

use serde_json::{json, Value};

/// Delimiter between rendered messages in the fallback prompt.
pub const MESSAGE_DELIMITER: &str = "\n\n";

/// Whether an upstream rejection means "no chat template".
pub fn is_chat_template_missing(status: u16, body: &Value) -> bool {
    if !(400..600).contains(&status) {
        return false;
    }
    let haystack = body.to_string().to_ascii_lowercase();
    haystack.contains("chat_template_missing") || haystack.contains("chat template")
}

/// Rewrite a chat-completion request as a plain completion request.
/// Messages render as `role: content` paragraphs with a trailing
/// `assistant:` cue.
pub fn chat_to_completion(chat: &Value) -> Value {
    let mut prompt = String::new();
    if let Some(messages) = chat.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            let role = message.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let content = message.get("content").and_then(|c| c.as_str()).unwrap_or("");
            prompt.push_str(role);
            prompt.push_str(": ");
            prompt.push_str(content);
            prompt.push_str(MESSAGE_DELIMITER);
        }
    }
    prompt.push_str("assistant:");

    let mut completion = json!({
        "model": chat.get("model").cloned().unwrap_or(Value::Null),
        "prompt": prompt,
    });

    // Sampling and length knobs carry over unchanged.
    for key in [
        "temperature",
        "top_p",
        "top_k",
        "max_tokens",
        "stop",
        "stream",
        "repetition_penalty",
        "presence_penalty",
        "frequency_penalty",
        "logit_bias",
    ] {
        if let Some(value) = chat.get(key) {
            completion[key] = value.clone();
        }
    }
    completion
}

/// Wrap a completion response back into a chat-completion envelope.
pub fn completion_to_chat(completion: &Value) -> Value {
    let text = completion
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("text"))
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .trim_start()
        .to_string();

    let finish_reason = completion
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("finish_reason"))
        .cloned()
        .unwrap_or(Value::Null);

    json!({
        "id": completion.get("id").cloned().unwrap_or(Value::Null),
        "object": "chat.completion",
        "created": completion.get("created").cloned().unwrap_or(Value::Null),
        "model": completion.get("model").cloned().unwrap_or(Value::Null),
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": completion.get("usage").cloned().unwrap_or(Value::Null),
    })
}
