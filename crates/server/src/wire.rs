#![forbid(unsafe_code)]

//! Just enough HTTP/1.1 for the lease endpoints: one request per connection, bodies sized by
//! `Content-Length`, JSON responses.

use serde_json::Value;
use std::collections::HashMap;
use std::io::{self, BufRead, Read, Write};

const MAX_LINE_BYTES: u64 = 4096;
const MAX_HEADERS: usize = 64;
const MAX_BODY_BYTES: usize = 16 * 1024;
const MAX_FIELD_BYTES: usize = 256;

pub(crate) struct HttpRequest {
    pub method: String,
    /// Without the query string or a trailing slash.
    pub path: String,
    pub query: HashMap<String, String>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// `Ok(None)` when the peer closed before sending anything. Malformed input is
    /// `InvalidData`.
    pub fn read_from(reader: &mut impl BufRead) -> io::Result<Option<Self>> {
        let Some(request_line) = read_line(reader)? else {
            return Ok(None);
        };
        let mut words = request_line.split_whitespace();
        let (Some(method), Some(target)) = (words.next(), words.next()) else {
            return Err(invalid("malformed request line"));
        };
        let (path, query) = target.split_once('?').unwrap_or((target, ""));

        let mut content_length = 0usize;
        let mut content_type = None;
        let mut headers = 0usize;
        loop {
            let line = read_line(reader)?.unwrap_or_default();
            if line.is_empty() {
                break;
            }
            headers += 1;
            if headers > MAX_HEADERS {
                return Err(invalid("too many headers"));
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value
                    .parse()
                    .map_err(|_| invalid("content-length is not a number"))?;
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_ascii_lowercase());
            }
        }
        if content_length > MAX_BODY_BYTES {
            return Err(invalid("body too large"));
        }
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body)?;

        Ok(Some(Self {
            method: method.to_string(),
            path: normalize_path(path),
            query: form_pairs(query).collect(),
            content_type,
            body,
        }))
    }

    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn has_json_body(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|content_type| content_type.starts_with("application/json"))
            || self.body.first() == Some(&b'{')
    }
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = Vec::new();
    let read = Read::take(&mut *reader, MAX_LINE_BYTES).read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') && read as u64 == MAX_LINE_BYTES {
        return Err(invalid("header line too long"));
    }
    let line = String::from_utf8(line).map_err(|_| invalid("header is not UTF-8"))?;
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn normalize_path(raw: &str) -> String {
    let path = raw.trim_end_matches('/');
    if path.is_empty() || path.contains("..") {
        return "/".to_string();
    }
    path.to_string()
}

/// `a=1&b=x%2Fy` pairs from a query string or form body. Empty and undecodable values are
/// dropped.
pub(crate) fn form_pairs(text: &str) -> impl Iterator<Item = (String, String)> + '_ {
    text.split('&').filter_map(|pair| {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = percent_decode(name.trim())?;
        let value = percent_decode(value.trim())?;
        (!name.is_empty() && !value.is_empty()).then_some((name, value))
    })
}

fn percent_decode(raw: &str) -> Option<String> {
    if raw.len() > MAX_FIELD_BYTES {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.bytes();
    while let Some(byte) = bytes.next() {
        out.push(match byte {
            b'+' => b' ',
            b'%' => {
                let hi = bytes.next().and_then(hex_digit)?;
                let lo = bytes.next().and_then(hex_digit)?;
                (hi << 4) | lo
            }
            other => other,
        });
    }
    String::from_utf8(out).ok()
}

fn hex_digit(byte: u8) -> Option<u8> {
    char::from(byte).to_digit(16).and_then(|digit| u8::try_from(digit).ok())
}

pub(crate) fn write_json(out: &mut impl Write, status: &str, body: &Value) -> io::Result<()> {
    let body = body.to_string();
    write!(
        out,
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\r\n\
         {body}",
        body.len()
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn parse(raw: &str) -> io::Result<Option<HttpRequest>> {
        HttpRequest::read_from(&mut Cursor::new(raw.as_bytes()))
    }

    #[test]
    fn request_line_headers_and_body_are_read() {
        let request = parse(
            "POST /createcluster/?token=Ab%2Bc+d&wait_s=5&empty= HTTP/1.1\r\n\
             Host: x\r\n\
             Content-Type: Application/X-WWW-Form-Urlencoded\r\n\
             Content-Length: 7\r\n\r\n\
             nodes=2trailing",
        )
        .expect("read")
        .expect("request");
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/createcluster");
        assert_eq!(request.query("token"), Some("Ab+c d"));
        assert_eq!(request.query("wait_s"), Some("5"));
        assert_eq!(request.query("empty"), None);
        assert_eq!(request.body, b"nodes=2");
        assert!(!request.has_json_body());
    }

    #[test]
    fn closed_connection_reads_as_nothing() {
        assert!(parse("").expect("read").is_none());
    }

    #[test]
    fn malformed_requests_are_invalid_data() {
        let kind = |raw: &str| parse(raw).err().map(|err| err.kind());
        assert_eq!(kind("GARBAGE\r\n\r\n"), Some(io::ErrorKind::InvalidData));
        assert_eq!(
            kind("POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n"),
            Some(io::ErrorKind::InvalidData)
        );
        assert_eq!(
            kind("POST / HTTP/1.1\r\nContent-Length: 999999\r\n\r\n"),
            Some(io::ErrorKind::InvalidData)
        );
        assert_eq!(
            kind("POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nshort"),
            Some(io::ErrorKind::UnexpectedEof)
        );
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path("/healthz/"), "/healthz");
        assert_eq!(normalize_path("/../etc/passwd"), "/");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn form_pairs_decode_and_skip_bad_values() {
        let pairs: HashMap<_, _> = form_pairs("prowjobid=job%2F9&nodes=2&bad=%zz&=x&flag").collect();
        assert_eq!(pairs.get("prowjobid").map(String::as_str), Some("job/9"));
        assert_eq!(pairs.get("nodes").map(String::as_str), Some("2"));
        assert_eq!(pairs.len(), 2);
        assert_eq!(percent_decode("%41%42"), Some("AB".to_string()));
        assert_eq!(percent_decode("%4"), None);
    }

    #[test]
    fn json_responses_carry_their_length() {
        let mut out = Vec::new();
        write_json(&mut out, "202 Accepted", &json!({ "ok": true })).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.starts_with("HTTP/1.1 202 Accepted\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
    }
}
