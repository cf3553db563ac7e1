#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

const TRANSPORT_PREFIX: &str = "bt_header_";

/// Application-layer header block extracted from a data packet's payload.
///
/// Extraction is advisory: every field defaults to `None` and no payload,
/// however malformed, makes it fail. Three extractors run in order and the
/// first that recognizes the payload shape wins: a JSON object, an
/// HTTP-like headers-then-body split, and a generic `key: value` line scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationHeaders {
    pub name: Option<String>,
    pub dendrite_hotkey: Option<String>,
    pub dendrite_ip: Option<String>,
    pub dendrite_port: Option<u64>,
    pub dendrite_version: Option<u64>,
    pub dendrite_nonce: Option<u64>,
    pub axon_ip: Option<String>,
    pub axon_port: Option<u64>,
    pub computed_body_hash: Option<String>,
}

impl ApplicationHeaders {
    pub fn from_payload(payload: &[u8]) -> ApplicationHeaders {
        let Ok(text) = std::str::from_utf8(payload) else {
            return ApplicationHeaders::default();
        };
        from_json_object(text)
            .or_else(|| from_headers_and_body(text))
            .or_else(|| from_lines(text))
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        *self == ApplicationHeaders::default()
    }

    fn assign(&mut self, key: &str, value: &Value) -> bool {
        let key = key.trim();
        let key = key.strip_prefix(TRANSPORT_PREFIX).unwrap_or(key);
        match key {
            "name" => self.name = as_string(value),
            "dendrite_hotkey" => self.dendrite_hotkey = as_string(value),
            "dendrite_ip" => self.dendrite_ip = as_string(value),
            "dendrite_port" => self.dendrite_port = as_integer(value),
            "dendrite_version" => self.dendrite_version = as_integer(value),
            "dendrite_nonce" => self.dendrite_nonce = as_integer(value),
            "axon_ip" => self.axon_ip = as_string(value),
            "axon_port" => self.axon_port = as_integer(value),
            "computed_body_hash" => self.computed_body_hash = as_string(value),
            _ => return false,
        }
        true
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn from_json_object(text: &str) -> Option<ApplicationHeaders> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let object = value.as_object()?;
    let mut headers = ApplicationHeaders::default();
    for (key, value) in object {
        headers.assign(key, value);
    }
    Some(headers)
}

/// Split a headers-then-body payload on the first blank line. Header lines
/// are `key: value`; a JSON-object body contributes fields too.
fn from_headers_and_body(text: &str) -> Option<ApplicationHeaders> {
    let (head, body) = split_on_blank_line(text)?;
    let mut headers = ApplicationHeaders::default();
    let mut recognized = false;
    for line in head.lines().skip_while(|l| !l.contains(':')) {
        if let Some((key, value)) = line.split_once(':') {
            recognized |= headers.assign(key, &Value::String(value.trim().to_string()));
        }
    }
    let body = body.trim();
    if body.starts_with('{') {
        if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(body) {
            for (key, value) in &object {
                recognized |= headers.assign(key, value);
            }
        }
    }
    if recognized {
        Some(headers)
    } else {
        None
    }
}

fn from_lines(text: &str) -> Option<ApplicationHeaders> {
    let mut headers = ApplicationHeaders::default();
    let mut recognized = false;
    for line in text.lines() {
        if let Some((key, value)) = line.split_once(':') {
            recognized |= headers.assign(key, &Value::String(value.trim().to_string()));
        }
    }
    if recognized {
        Some(headers)
    } else {
        None
    }
}

fn split_on_blank_line(text: &str) -> Option<(&str, &str)> {
    if let Some(pos) = text.find("\r\n\r\n") {
        return Some((&text[..pos], &text[pos + 4..]));
    }
    text.find("\n\n").map(|pos| (&text[..pos], &text[pos + 2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_object_payload() {
        let payload = br#"{"name": "Score", "dendrite_hotkey": "5Fq", "dendrite_version": 225}"#;
        let headers = ApplicationHeaders::from_payload(payload);
        assert_eq!(headers.name.as_deref(), Some("Score"));
        assert_eq!(headers.dendrite_hotkey.as_deref(), Some("5Fq"));
        assert_eq!(headers.dendrite_version, Some(225));
    }

    #[test]
    fn extracts_headers_then_json_body() {
        let payload = b"POST /Score HTTP/1.1\r\n\
            bt_header_dendrite_hotkey: 5Fq\r\n\
            bt_header_axon_port: 8091\r\n\
            \r\n\
            {\"name\": \"Score\", \"computed_body_hash\": \"0xabc\"}";
        let headers = ApplicationHeaders::from_payload(payload);
        assert_eq!(headers.dendrite_hotkey.as_deref(), Some("5Fq"));
        assert_eq!(headers.axon_port, Some(8091));
        assert_eq!(headers.name.as_deref(), Some("Score"));
        assert_eq!(headers.computed_body_hash.as_deref(), Some("0xabc"));
    }

    #[test]
    fn line_extractor_strips_prefix_and_coerces_integers() {
        let payload = b"bt_header_name: Foo\n\
            bt_header_dendrite_version: 224\n\
            bt_header_dendrite_nonce: 1699000000\n\
            bt_header_dendrite_ip: 10.0.0.9";
        let headers = ApplicationHeaders::from_payload(payload);
        assert_eq!(headers.name.as_deref(), Some("Foo"));
        assert_eq!(headers.dendrite_version, Some(224));
        assert_eq!(headers.dendrite_nonce, Some(1699000000));
        assert_eq!(headers.dendrite_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn malformed_payload_yields_empty_headers() {
        assert!(ApplicationHeaders::from_payload(&[0xff, 0xfe, 0x00]).is_empty());
        assert!(ApplicationHeaders::from_payload(b"no separators here").is_empty());
        assert!(ApplicationHeaders::from_payload(b"").is_empty());
    }

    #[test]
    fn unparseable_integer_fields_stay_none() {
        let payload = b"bt_header_dendrite_port: not-a-number\nbt_header_name: Foo";
        let headers = ApplicationHeaders::from_payload(payload);
        assert_eq!(headers.dendrite_port, None);
        assert_eq!(headers.name.as_deref(), Some("Foo"));
    }
}
