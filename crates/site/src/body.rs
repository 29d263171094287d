//! Streaming request-body parsers, dispatched by content type.
//!
//! All parsers enforce two ceilings: `request_max` bounds what is held in
//! memory and `upload_max` bounds each streamed file. Overflow fails the
//! request with 413 and unlinks every temp file the parser created. Temp
//! files that survive parsing belong to the request; the pipeline removes
//! them after the response unless a middleware moved them.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use bytes::Bytes;
use haven_common::HttpError;
use haven_config::LimitsConfig;
use http_body_util::BodyExt;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A parsed request body.
#[derive(Debug)]
pub enum ParsedBody {
    Empty,
    Json(Value),
    Form(Map<String, Value>),
    Text(String),
    Octet { temp_file: PathBuf, size: u64 },
    Upload { fields: Map<String, Value>, files: Vec<UploadFile> },
}

impl ParsedBody {
    /// The body as a JSON value, for middleware that accepts several
    /// shapes.
    pub fn as_json(&self) -> Option<Value> {
        match self {
            Self::Json(v) => Some(v.clone()),
            Self::Form(m) => Some(Value::Object(m.clone())),
            _ => None,
        }
    }
}

/// One streamed upload from a multipart body.
#[derive(Debug, Clone, Serialize)]
pub struct UploadFile {
    pub filename: String,
    pub mime: String,
    #[serde(rename = "tempFile")]
    pub temp_file: PathBuf,
    pub size: u64,
}

/// Parse a request body. Returns the parsed value and every temp file
/// created along the way.
pub async fn parse<B>(
    content_type: Option<&str>,
    body: B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut body = body;
    let base = content_type
        .map(|c| c.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default();

    match base.as_str() {
        "application/json" => parse_json(&mut body, limits).await,
        "multipart/form-data" => {
            let boundary = content_type
                .and_then(boundary_of)
                .ok_or_else(|| HttpError::bad_request("multipart body without boundary"))?;
            parse_multipart(&boundary, &mut body, limits).await
        }
        "application/x-www-form-urlencoded" => parse_urlencoded(&mut body, limits).await,
        "application/octet-stream" => parse_octet(&mut body, limits).await,
        t if t.starts_with("text/") => parse_text(&mut body, limits).await,
        "" => {
            // No declared type: accept an empty body, refuse anything else.
            match next_chunk(&mut body).await? {
                None => Ok((ParsedBody::Empty, Vec::new())),
                Some(chunk) if chunk.is_empty() => Ok((ParsedBody::Empty, Vec::new())),
                Some(_) => Err(HttpError::NotImplemented(
                    "body without a content type".into(),
                )),
            }
        }
        other => Err(HttpError::NotImplemented(format!("content type {other}"))),
    }
}

fn boundary_of(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("boundary=")
            .map(|b| b.trim_matches('"').to_string())
    })
}

async fn next_chunk<B>(body: &mut B) -> Result<Option<Bytes>, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| HttpError::bad_request(format!("body read failed: {e}")))?;
        if let Ok(data) = frame.into_data() {
            return Ok(Some(data));
        }
        // Trailer frames are ignored.
    }
    Ok(None)
}

/// A fresh temp file with a random 8-char base-36 name.
async fn temp_file(dir: &Path) -> Result<(PathBuf, tokio::fs::File), HttpError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| HttpError::internal(format!("temp dir: {e}")))?;
    let path = dir.join(format!("{}.tmp", random_token(8)));
    let file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| HttpError::internal(format!("temp file: {e}")))?;
    Ok((path, file))
}

pub(crate) fn random_token(len: usize) -> String {
    const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..36)] as char)
        .collect()
}

async fn cleanup(temps: &[PathBuf]) {
    for path in temps {
        let _ = tokio::fs::remove_file(path).await;
    }
}

// ============================================================================
// Text / urlencoded / octet
// ============================================================================

async fn collect_capped<B>(body: &mut B, cap: u64) -> Result<Vec<u8>, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut out = Vec::new();
    while let Some(chunk) = next_chunk(body).await? {
        if out.len() as u64 + chunk.len() as u64 > cap {
            return Err(HttpError::PayloadTooLarge(format!(
                "body exceeds {cap} bytes"
            )));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

async fn parse_text<B>(
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let raw = collect_capped(body, limits.request_max).await?;
    let text = String::from_utf8(raw)
        .map_err(|_| HttpError::bad_request("text body is not valid UTF-8"))?;
    Ok((ParsedBody::Text(text), Vec::new()))
}

async fn parse_urlencoded<B>(
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let raw = collect_capped(body, limits.request_max).await?;
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(&raw)
        .map_err(|e| HttpError::bad_request(format!("urlencoded body: {e}")))?;
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert(k, Value::String(v));
    }
    Ok((ParsedBody::Form(map), Vec::new()))
}

async fn parse_octet<B>(
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let (path, mut file) = temp_file(&limits.temp_dir).await?;
    let mut size: u64 = 0;
    while let Some(chunk) = next_chunk(body).await? {
        size += chunk.len() as u64;
        if size > limits.upload_max {
            drop(file);
            cleanup(&[path]).await;
            return Err(HttpError::PayloadTooLarge(format!(
                "upload exceeds {} bytes",
                limits.upload_max
            )));
        }
        file.write_all(&chunk)
            .await
            .map_err(|e| HttpError::internal(format!("temp write: {e}")))?;
    }
    file.flush()
        .await
        .map_err(|e| HttpError::internal(format!("temp flush: {e}")))?;
    Ok((
        ParsedBody::Octet {
            temp_file: path.clone(),
            size,
        },
        vec![path],
    ))
}

// ============================================================================
// JSON with embedded data URLs
// ============================================================================

/// Scanner states for [`parse_json`].
enum JsonMode {
    /// Copying JSON text into the accumulator.
    Plain,
    /// Inside a value string, deciding whether it opens with a data URL.
    Probe,
    /// Streaming a base64 payload to a temp file.
    Payload,
}

const PROBE_CAP: usize = 256;

struct JsonScan {
    acc: Vec<u8>,
    /// Open containers, `b'{'` or `b'['`.
    stack: Vec<u8>,
    /// Last significant byte seen outside strings.
    last_sig: u8,
    in_string: bool,
    escaped: bool,
    mode: JsonMode,
    probe: Vec<u8>,
    carry: String,
    upload: Option<Upload>,
    temps: Vec<PathBuf>,
}

struct Upload {
    path: PathBuf,
    file: tokio::fs::File,
    size: u64,
    mime: String,
}

async fn parse_json<B>(
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut scan = JsonScan {
        acc: Vec::new(),
        stack: Vec::new(),
        last_sig: 0,
        in_string: false,
        escaped: false,
        mode: JsonMode::Plain,
        probe: Vec::new(),
        carry: String::new(),
        upload: None,
        temps: Vec::new(),
    };

    let result = scan_json(&mut scan, body, limits).await;
    match result {
        Ok(value) => {
            let temps = std::mem::take(&mut scan.temps);
            Ok((ParsedBody::Json(value), temps))
        }
        Err(e) => {
            if let Some(upload) = scan.upload.take() {
                drop(upload.file);
                cleanup(&[upload.path]).await;
            }
            cleanup(&scan.temps).await;
            Err(e)
        }
    }
}

async fn scan_json<B>(
    scan: &mut JsonScan,
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<Value, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    while let Some(chunk) = next_chunk(body).await? {
        for &byte in chunk.iter() {
            scan.step(byte, limits).await?;
            if scan.acc.len() as u64 > limits.request_max {
                return Err(HttpError::PayloadTooLarge(format!(
                    "body exceeds {} bytes",
                    limits.request_max
                )));
            }
        }
    }
    if scan.upload.is_some() || matches!(scan.mode, JsonMode::Payload) {
        return Err(HttpError::bad_request("truncated data URL in JSON body"));
    }
    if matches!(scan.mode, JsonMode::Probe) {
        return Err(HttpError::bad_request("unterminated string in JSON body"));
    }
    serde_json::from_slice(&scan.acc)
        .map_err(|e| HttpError::bad_request(format!("invalid JSON body: {e}")))
}

impl JsonScan {
    async fn step(&mut self, byte: u8, limits: &LimitsConfig) -> Result<(), HttpError> {
        match self.mode {
            JsonMode::Plain => self.step_plain(byte),
            JsonMode::Probe => self.step_probe(byte, limits).await,
            JsonMode::Payload => self.step_payload(byte, limits).await,
        }
    }

    fn step_plain(&mut self, byte: u8) -> Result<(), HttpError> {
        if self.in_string {
            self.acc.push(byte);
            if self.escaped {
                self.escaped = false;
            } else if byte == b'\\' {
                self.escaped = true;
            } else if byte == b'"' {
                self.in_string = false;
                self.last_sig = b'"';
            }
            return Ok(());
        }
        if byte == b'"' {
            // Keys cannot hold uploads; only value strings are probed.
            let is_key = self.stack.last() == Some(&b'{') && self.last_sig != b':';
            if is_key {
                self.acc.push(byte);
                self.in_string = true;
            } else {
                self.mode = JsonMode::Probe;
                self.probe.clear();
            }
            return Ok(());
        }
        self.acc.push(byte);
        if !byte.is_ascii_whitespace() {
            self.last_sig = byte;
            match byte {
                b'{' | b'[' => self.stack.push(byte),
                b'}' | b']' => {
                    self.stack.pop();
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn step_probe(&mut self, byte: u8, limits: &LimitsConfig) -> Result<(), HttpError> {
        if byte == b'"' {
            // Short ordinary string, ended before a marker could appear.
            self.flush_probe_as_string();
            self.acc.push(b'"');
            self.in_string = false;
            self.last_sig = b'"';
            self.mode = JsonMode::Plain;
            return Ok(());
        }
        self.probe.push(byte);

        const MARKER_HEAD: &[u8] = b"data:";
        let head = &MARKER_HEAD[..MARKER_HEAD.len().min(self.probe.len())];
        if !self.probe.starts_with(head) || byte == b'\\' || self.probe.len() > PROBE_CAP {
            // Not a data URL; replay as an ordinary in-progress string.
            self.flush_probe_as_string();
            self.mode = JsonMode::Plain;
            return Ok(());
        }

        if byte == b',' {
            // `data:<mime>;base64,` complete?
            let text = String::from_utf8_lossy(&self.probe);
            if let Some(mime) = text
                .strip_prefix("data:")
                .and_then(|rest| rest.strip_suffix(";base64,"))
            {
                let (path, file) = temp_file(&limits.temp_dir).await?;
                self.upload = Some(Upload {
                    path,
                    file,
                    size: 0,
                    mime: mime.to_string(),
                });
                self.carry.clear();
                self.mode = JsonMode::Payload;
            } else {
                self.flush_probe_as_string();
                self.mode = JsonMode::Plain;
            }
        }
        Ok(())
    }

    /// Replay a failed probe into the accumulator as ordinary string text.
    fn flush_probe_as_string(&mut self) {
        self.acc.push(b'"');
        self.in_string = true;
        self.escaped = false;
        for i in 0..self.probe.len() {
            let b = self.probe[i];
            self.acc.push(b);
            if self.escaped {
                self.escaped = false;
            } else if b == b'\\' {
                self.escaped = true;
            }
        }
        self.probe.clear();
    }

    async fn step_payload(&mut self, byte: u8, limits: &LimitsConfig) -> Result<(), HttpError> {
        match byte {
            b'"' => {
                self.drain_carry(true, limits).await?;
                let upload = self.upload.take().expect("payload mode has an upload");
                let Upload {
                    path,
                    mut file,
                    size,
                    mime,
                } = upload;
                file.flush()
                    .await
                    .map_err(|e| HttpError::internal(format!("temp flush: {e}")))?;
                drop(file);

                let stub = json!({
                    "size": size,
                    "tag": random_token(8),
                    "tempFile": path,
                    "mime": mime,
                    "encoding": "base64",
                });
                self.acc
                    .extend_from_slice(stub.to_string().as_bytes());
                self.temps.push(path);
                debug!(bytes = size, "embedded upload extracted from JSON body");
                self.in_string = false;
                self.last_sig = b'"';
                self.mode = JsonMode::Plain;
                Ok(())
            }
            b'=' => Ok(()),
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'+' | b'/' => {
                self.carry.push(byte as char);
                if self.carry.len() >= 4096 {
                    self.drain_carry(false, limits).await?;
                }
                Ok(())
            }
            _ => Err(HttpError::bad_request("malformed base64 in data URL")),
        }
    }

    /// Decode and write the carried base64. Keeps a remainder of < 4 chars
    /// unless `last`, preserving 4-char alignment across chunks.
    async fn drain_carry(&mut self, last: bool, limits: &LimitsConfig) -> Result<(), HttpError> {
        let usable = if last {
            self.carry.len()
        } else {
            self.carry.len() - self.carry.len() % 4
        };
        if usable == 0 {
            return Ok(());
        }
        let rest = self.carry.split_off(usable);
        let encoded = std::mem::replace(&mut self.carry, rest);
        let decoded = STANDARD_NO_PAD
            .decode(&encoded)
            .map_err(|e| HttpError::bad_request(format!("malformed base64 in data URL: {e}")))?;

        let upload = self.upload.as_mut().expect("payload mode has an upload");
        upload.size += decoded.len() as u64;
        if upload.size > limits.upload_max {
            return Err(HttpError::PayloadTooLarge(format!(
                "upload exceeds {} bytes",
                limits.upload_max
            )));
        }
        upload
            .file
            .write_all(&decoded)
            .await
            .map_err(|e| HttpError::internal(format!("temp write: {e}")))?;
        Ok(())
    }
}

// ============================================================================
// Multipart/form-data
// ============================================================================

enum MultipartState {
    Preamble,
    PostDelim,
    Headers,
    FieldValue { name: String },
    FilePayload { part: UploadFile, file: tokio::fs::File },
    Done,
}

async fn parse_multipart<B>(
    boundary: &str,
    body: &mut B,
    limits: &LimitsConfig,
) -> Result<(ParsedBody, Vec<PathBuf>), HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let mut temps: Vec<PathBuf> = Vec::new();
    match multipart_inner(boundary, body, limits, &mut temps).await {
        Ok(parsed) => Ok((parsed, temps)),
        Err(e) => {
            cleanup(&temps).await;
            Err(e)
        }
    }
}

async fn multipart_inner<B>(
    boundary: &str,
    body: &mut B,
    limits: &LimitsConfig,
    temps: &mut Vec<PathBuf>,
) -> Result<ParsedBody, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    let delim = format!("--{boundary}").into_bytes();
    // A payload runs until `\r\n--boundary`; this tail must be withheld
    // from the file until the delimiter is ruled out.
    let needle = {
        let mut n = b"\r\n".to_vec();
        n.extend_from_slice(&delim);
        n
    };

    let mut buf: Vec<u8> = Vec::new();
    let mut ended = false;
    let mut state = MultipartState::Preamble;
    let mut fields = Map::new();
    let mut files: Vec<UploadFile> = Vec::new();

    loop {
        match state {
            MultipartState::Preamble => {
                if let Some(pos) = find(&buf, &delim) {
                    buf.drain(..pos + delim.len());
                    state = MultipartState::PostDelim;
                } else if ended {
                    return Err(HttpError::bad_request("multipart body without boundary"));
                } else if !fill(&mut buf, body, &mut ended).await? {
                    continue;
                }
            }
            MultipartState::PostDelim => {
                if buf.len() >= 2 {
                    if buf.starts_with(b"--") {
                        state = MultipartState::Done;
                    } else if buf.starts_with(b"\r\n") {
                        buf.drain(..2);
                        state = MultipartState::Headers;
                    } else {
                        return Err(HttpError::bad_request("malformed multipart delimiter"));
                    }
                } else if ended {
                    return Err(HttpError::bad_request("truncated multipart body"));
                } else {
                    fill(&mut buf, body, &mut ended).await?;
                }
            }
            MultipartState::Headers => {
                let Some(pos) = find(&buf, b"\r\n\r\n") else {
                    if ended {
                        return Err(HttpError::bad_request("truncated multipart headers"));
                    }
                    fill(&mut buf, body, &mut ended).await?;
                    continue;
                };
                let head = String::from_utf8_lossy(&buf[..pos]).to_string();
                buf.drain(..pos + 4);
                let (name, filename, mime) = part_headers(&head)?;
                state = match filename {
                    Some(filename) => {
                        let (path, file) = temp_file(&limits.temp_dir).await?;
                        temps.push(path.clone());
                        MultipartState::FilePayload {
                            part: UploadFile {
                                filename,
                                mime: mime
                                    .unwrap_or_else(|| "application/octet-stream".into()),
                                temp_file: path,
                                size: 0,
                            },
                            file,
                        }
                    }
                    None => MultipartState::FieldValue { name },
                };
            }
            MultipartState::FieldValue { ref name } => {
                if let Some(pos) = find(&buf, &needle) {
                    let value = String::from_utf8_lossy(&buf[..pos]).to_string();
                    fields.insert(name.clone(), Value::String(value));
                    buf.drain(..pos + needle.len());
                    state = MultipartState::PostDelim;
                } else if ended {
                    return Err(HttpError::bad_request("truncated multipart field"));
                } else {
                    if buf.len() as u64 > limits.request_max {
                        return Err(HttpError::PayloadTooLarge(format!(
                            "body exceeds {} bytes",
                            limits.request_max
                        )));
                    }
                    fill(&mut buf, body, &mut ended).await?;
                }
            }
            MultipartState::FilePayload {
                ref mut part,
                ref mut file,
            } => {
                if let Some(pos) = find(&buf, &needle) {
                    part.size += pos as u64;
                    check_upload(part.size, limits)?;
                    file.write_all(&buf[..pos])
                        .await
                        .map_err(|e| HttpError::internal(format!("temp write: {e}")))?;
                    file.flush()
                        .await
                        .map_err(|e| HttpError::internal(format!("temp flush: {e}")))?;
                    buf.drain(..pos + needle.len());
                    debug!(file = %part.filename, bytes = part.size, "multipart upload complete");
                    files.push(part.clone());
                    state = MultipartState::PostDelim;
                } else if ended {
                    return Err(HttpError::bad_request("truncated multipart upload"));
                } else {
                    // Flush all but a needle-sized tail, which may hold the
                    // start of the delimiter split across chunks.
                    if buf.len() > needle.len() {
                        let flushable = buf.len() - needle.len();
                        part.size += flushable as u64;
                        check_upload(part.size, limits)?;
                        file.write_all(&buf[..flushable])
                            .await
                            .map_err(|e| HttpError::internal(format!("temp write: {e}")))?;
                        buf.drain(..flushable);
                    }
                    fill(&mut buf, body, &mut ended).await?;
                }
            }
            MultipartState::Done => {
                // Drain the epilogue.
                while !ended {
                    fill(&mut buf, body, &mut ended).await?;
                    buf.clear();
                }
                return Ok(ParsedBody::Upload { fields, files });
            }
        }
    }
}

fn check_upload(size: u64, limits: &LimitsConfig) -> Result<(), HttpError> {
    if size > limits.upload_max {
        return Err(HttpError::PayloadTooLarge(format!(
            "upload exceeds {} bytes",
            limits.upload_max
        )));
    }
    Ok(())
}

/// Append the next chunk to `buf`. Returns false once the stream is done.
async fn fill<B>(
    buf: &mut Vec<u8>,
    body: &mut B,
    ended: &mut bool,
) -> Result<bool, HttpError>
where
    B: http_body::Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    if *ended {
        return Ok(false);
    }
    match next_chunk(body).await? {
        Some(chunk) => {
            buf.extend_from_slice(&chunk);
            Ok(true)
        }
        None => {
            *ended = true;
            Ok(false)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract `name`, `filename` and content type from a part's header block.
fn part_headers(head: &str) -> Result<(String, Option<String>, Option<String>), HttpError> {
    let mut name = None;
    let mut filename = None;
    let mut mime = None;
    for line in head.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim().to_lowercase().as_str() {
            "content-disposition" => {
                for param in value.split(';') {
                    let param = param.trim();
                    if let Some(v) = param.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = param.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            }
            "content-type" => mime = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let name = name.ok_or_else(|| HttpError::bad_request("multipart part without a name"))?;
    Ok((name, filename, mime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use futures::stream;
    use http_body_util::StreamBody;
    use hyper::body::Frame;

    fn limits(dir: &Path) -> LimitsConfig {
        LimitsConfig {
            request_max: 64 * 1024,
            upload_max: 1024,
            temp_dir: dir.to_path_buf(),
            timeout_secs: 30,
        }
    }

    /// A body delivered in deliberately awkward chunk sizes.
    fn chunked(raw: &[u8], chunk: usize) -> impl http_body::Body<Data = Bytes, Error = std::convert::Infallible> + Unpin {
        let frames: Vec<Result<Frame<Bytes>, std::convert::Infallible>> = raw
            .chunks(chunk.max(1))
            .map(|c| Ok(Frame::data(Bytes::copy_from_slice(c))))
            .collect();
        StreamBody::new(stream::iter(frames))
    }

    #[tokio::test]
    async fn urlencoded_produces_a_flat_map() {
        let dir = tempfile::tempdir().unwrap();
        let (body, temps) = parse(
            Some("application/x-www-form-urlencoded"),
            chunked(b"name=Alice+B&city=Z%C3%BCrich", 7),
            &limits(dir.path()),
        )
        .await
        .unwrap();
        assert!(temps.is_empty());
        let ParsedBody::Form(map) = body else {
            panic!("expected form body")
        };
        assert_eq!(map["name"], "Alice B");
        assert_eq!(map["city"], "Zürich");
    }

    #[tokio::test]
    async fn text_collects_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let (body, _) = parse(
            Some("text/plain; charset=utf-8"),
            chunked("héllo wörld".as_bytes(), 3),
            &limits(dir.path()),
        )
        .await
        .unwrap();
        let ParsedBody::Text(t) = body else {
            panic!("expected text body")
        };
        assert_eq!(t, "héllo wörld");
    }

    #[tokio::test]
    async fn octet_streams_to_a_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let (body, temps) = parse(
            Some("application/octet-stream"),
            chunked(&[7u8; 600], 64),
            &limits(dir.path()),
        )
        .await
        .unwrap();
        let ParsedBody::Octet { temp_file, size } = body else {
            panic!("expected octet body")
        };
        assert_eq!(size, 600);
        assert_eq!(temps, vec![temp_file.clone()]);
        assert_eq!(std::fs::read(&temp_file).unwrap(), vec![7u8; 600]);
        let name = temp_file.file_name().unwrap().to_str().unwrap();
        assert_eq!(name.len(), 12);
        assert!(name.ends_with(".tmp"));
    }

    #[tokio::test]
    async fn octet_over_ceiling_unlinks_and_413s() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse(
            Some("application/octet-stream"),
            chunked(&[7u8; 2048], 100),
            &limits(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 413);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn unknown_content_type_is_501() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse(
            Some("application/x-custom"),
            chunked(b"data", 4),
            &limits(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 501);
    }

    #[tokio::test]
    async fn plain_json_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let raw = br#"{"a": [1, 2], "b": {"c": "text with data inside"}, "d": "x"}"#;
        for chunk in [1usize, 3, 64] {
            let (body, temps) = parse(
                Some("application/json"),
                chunked(raw, chunk),
                &limits(dir.path()),
            )
            .await
            .unwrap();
            assert!(temps.is_empty());
            let ParsedBody::Json(v) = body else {
                panic!("expected json body")
            };
            assert_eq!(v["a"], json!([1, 2]));
            assert_eq!(v["b"]["c"], "text with data inside");
        }
    }

    #[tokio::test]
    async fn embedded_data_url_is_streamed_out() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0u8..=255).collect();
        let encoded = STANDARD.encode(&payload);
        let raw = format!(
            r#"{{"name": "shot", "image": "data:image/png;base64,{encoded}", "after": true}}"#
        );
        // Odd chunk sizes exercise base64 alignment across chunk seams.
        for chunk in [1usize, 5, 7, 1024] {
            let (body, temps) = parse(
                Some("application/json"),
                chunked(raw.as_bytes(), chunk),
                &limits(dir.path()),
            )
            .await
            .unwrap();
            assert_eq!(temps.len(), 1);
            let ParsedBody::Json(v) = body else {
                panic!("expected json body")
            };
            assert_eq!(v["name"], "shot");
            assert_eq!(v["after"], true);
            assert_eq!(v["image"]["size"], 256);
            assert_eq!(v["image"]["mime"], "image/png");
            assert_eq!(v["image"]["encoding"], "base64");
            let temp: PathBuf = v["image"]["tempFile"].as_str().unwrap().into();
            assert_eq!(std::fs::read(&temp).unwrap(), payload);
            std::fs::remove_file(&temp).unwrap();
        }
    }

    #[tokio::test]
    async fn data_url_over_ceiling_unlinks_and_413s() {
        let dir = tempfile::tempdir().unwrap();
        let encoded = STANDARD.encode(vec![9u8; 4096]);
        let raw = format!(r#"{{"image": "data:application/zip;base64,{encoded}"}}"#);
        let err = parse(
            Some("application/json"),
            chunked(raw.as_bytes(), 512),
            &limits(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 413);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn keys_are_never_treated_as_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let raw = br#"{"data:image/png;base64,AAAA": "value"}"#;
        let (body, temps) = parse(
            Some("application/json"),
            chunked(raw, 8),
            &limits(dir.path()),
        )
        .await
        .unwrap();
        assert!(temps.is_empty());
        let ParsedBody::Json(v) = body else {
            panic!("expected json body")
        };
        assert_eq!(v["data:image/png;base64,AAAA"], "value");
    }

    fn multipart_raw(boundary: &str, file_bytes: &[u8]) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        raw.extend_from_slice(
            b"Content-Disposition: form-data; name=\"folder\"\r\n\r\nuploads\r\n",
        );
        raw.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        raw.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"pic.png\"\r\n",
        );
        raw.extend_from_slice(b"Content-Type: image/png\r\n\r\n");
        raw.extend_from_slice(file_bytes);
        raw.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        raw
    }

    #[tokio::test]
    async fn multipart_splits_fields_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let file_bytes: Vec<u8> = (0u8..200).cycle().take(900).collect();
        let raw = multipart_raw("XBOUND", &file_bytes);

        // Small chunks force the boundary across seams.
        for chunk in [3usize, 17, 4096] {
            let (body, temps) = parse(
                Some("multipart/form-data; boundary=XBOUND"),
                chunked(&raw, chunk),
                &limits(dir.path()),
            )
            .await
            .unwrap();
            assert_eq!(temps.len(), 1);
            let ParsedBody::Upload { fields, files } = body else {
                panic!("expected upload body")
            };
            assert_eq!(fields["folder"], "uploads");
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].filename, "pic.png");
            assert_eq!(files[0].mime, "image/png");
            assert_eq!(files[0].size, 900);
            assert_eq!(std::fs::read(&files[0].temp_file).unwrap(), file_bytes);
            std::fs::remove_file(&files[0].temp_file).unwrap();
        }
    }

    #[tokio::test]
    async fn multipart_upload_over_ceiling_unlinks_and_413s() {
        let dir = tempfile::tempdir().unwrap();
        let raw = multipart_raw("XBOUND", &vec![1u8; 5000]);
        let err = parse(
            Some("multipart/form-data; boundary=XBOUND"),
            chunked(&raw, 256),
            &limits(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 413);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn multipart_without_boundary_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse(
            Some("multipart/form-data"),
            chunked(b"x", 1),
            &limits(dir.path()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 400);
    }

    #[tokio::test]
    async fn empty_untyped_body_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let (body, _) = parse(None, chunked(b"", 1), &limits(dir.path())).await.unwrap();
        assert!(matches!(body, ParsedBody::Empty));
    }

}
