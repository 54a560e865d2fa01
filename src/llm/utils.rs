/// Removes a surrounding markdown code fence (with or without a language tag).
/// Text without a fence comes back trimmed.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    // language tag, e.g. ```json
    let body_start = after_open
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '-')
        .unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Slice from the first `{` to the last `}`, or the trimmed input when there is none.
pub fn clean_json_output(raw: &str) -> &str {
    if let Some(start) = raw.find('{') {
        if let Some(end) = raw.rfind('}') {
            if end > start {
                return &raw[start..=end];
            }
        }
    }
    raw.trim()
}

/// Undoes one level of JSON string escaping, for payloads that were
/// serialized twice before being returned.
pub fn unescape_one_level(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('"') {
        if let Ok(inner) = serde_json::from_str::<String>(trimmed) {
            return inner;
        }
    }
    trimmed
        .replace("\\\"", "\"")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\\", "\\")
}

/// Decodes the body of a JSON string literal captured without its quotes.
pub fn decode_json_string(body: &str) -> String {
    serde_json::from_str::<String>(&format!("\"{}\"", body)).unwrap_or_else(|_| {
        body.replace("\\\"", "\"")
            .replace("\\n", "\n")
            .replace("\\\\", "\\")
    })
}

/// Caps `text` at `max_chars` characters, marking the cut with "...".
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}...", kept.trim_end())
}

/// Evenly spaced, order-preserving sample of at most `n` options, plus the
/// number left out.
pub fn sample_options(options: &[String], n: usize) -> (Vec<&str>, usize) {
    if options.len() <= n {
        return (options.iter().map(String::as_str).collect(), 0);
    }
    if n == 0 {
        return (Vec::new(), options.len());
    }
    let picked = (0..n)
        .map(|i| options[i * options.len() / n].as_str())
        .collect::<Vec<_>>();
    (picked, options.len() - n)
}
