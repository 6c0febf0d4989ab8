use reqwest::StatusCode;
use serde_json::Value;

/// Summarize a failed Google API response for error messages
///
/// Prefers `error.message`, then `error_description`, then the raw body.
pub fn describe_response(status: StatusCode, body: &str) -> String {
    let status = status.as_u16();

    if let Ok(Value::Object(json)) = serde_json::from_str::<Value>(body) {
        if let Some(message) = json
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
        {
            return format!("status={status} message={message}");
        }
        if let Some(description) = json.get("error_description").and_then(Value::as_str) {
            return format!("status={status} error_description={description}");
        }
    }

    format!("status={status} body='{body}'")
}

/// Whether a v1 error body carries `error.code == 404`, as number or string
pub fn is_not_found(body: &str) -> bool {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    match json.get("error").and_then(|e| e.get("code")) {
        Some(Value::Number(code)) => code.as_u64() == Some(404),
        Some(Value::String(code)) => code == "404",
        _ => false,
    }
}
