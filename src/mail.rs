use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::MailError;

static ENCODED_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"=\?([^?]+)\?([BbQq])\?([^?]*)\?=").unwrap());
static ENCODED_GAP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\?=\s+=\?").unwrap());
static SCRIPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<(script|style|head)\b.*?</(script|style|head)>").unwrap());
static BLOCK_END_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>|</(p|div|tr|li|h[1-6])>").unwrap());
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n[ \t]*(\n[ \t]*){2,}").unwrap());
static ADDRESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[^\s<>,;:"()]+@[^\s<>,;:"()]+"#).unwrap());

/// Opaque handle for acknowledging a message. For Maildir this is the path
/// the message had when it was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: String,
    pub body: String,
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Unseen messages in `mailbox`, optionally only those addressed to
    /// `address_filter`. Fetching does not mark anything seen.
    async fn fetch_unseen(
        &self,
        mailbox: &str,
        address_filter: Option<&str>,
    ) -> Result<Vec<RawMessage>, MailError>;

    async fn mark_seen(&self, id: &MessageId) -> Result<(), MailError>;
}

// ── Maildir ──

/// A Maildir++ tree. `INBOX` is the root; other mailboxes live in
/// `.<Name>` subfolders.
#[derive(Debug, Clone)]
pub struct Maildir {
    root: PathBuf,
}

impl Maildir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn folder(&self, mailbox: &str) -> PathBuf {
        if mailbox.eq_ignore_ascii_case("INBOX") {
            self.root.clone()
        } else {
            self.root.join(format!(".{}", mailbox))
        }
    }

    async fn unseen_paths(&self, folder: &Path) -> Result<Vec<PathBuf>, MailError> {
        let mut paths = Vec::new();
        for sub in ["new", "cur"] {
            let dir = folder.join(sub);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(MailError::Io { path: dir, source }),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|source| MailError::Io {
                    path: dir.clone(),
                    source,
                })?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                if sub == "new" || !split_flags(&name).1.contains('S') {
                    paths.push(entry.path());
                }
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[async_trait]
impl Mailbox for Maildir {
    async fn fetch_unseen(
        &self,
        mailbox: &str,
        address_filter: Option<&str>,
    ) -> Result<Vec<RawMessage>, MailError> {
        let folder = self.folder(mailbox);
        if !tokio::fs::try_exists(&folder).await.unwrap_or(false) {
            return Err(MailError::MissingMailbox(folder));
        }

        let mut messages = Vec::new();
        for path in self.unseen_paths(&folder).await? {
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Skipping unreadable message {}: {}", path.display(), e);
                    continue;
                }
            };
            let parsed = ParsedMessage::parse(&raw);
            if let Some(address) = address_filter {
                if !parsed.addressed_to(address) {
                    continue;
                }
            }
            messages.push(parsed.into_raw(MessageId(path.to_string_lossy().into_owned())));
        }
        debug!(mailbox, count = messages.len(), "unseen messages fetched");
        Ok(messages)
    }

    async fn mark_seen(&self, id: &MessageId) -> Result<(), MailError> {
        let path = PathBuf::from(&id.0);
        let (Some(name), Some(folder)) = (
            path.file_name().map(|n| n.to_string_lossy().into_owned()),
            path.parent().and_then(Path::parent),
        ) else {
            return Err(MailError::UnknownMessage(id.0.clone()));
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(MailError::UnknownMessage(id.0.clone()));
        }

        let (unique, flags) = split_flags(&name);
        let mut flags: Vec<char> = flags.chars().chain(['S']).collect();
        flags.sort_unstable();
        flags.dedup();
        let flags: String = flags.into_iter().collect();

        let target = folder.join("cur").join(format!("{}:2,{}", unique, flags));
        tokio::fs::rename(&path, &target)
            .await
            .map_err(|source| MailError::Io { path, source })
    }
}

/// Splits `unique:2,FLAGS` into its unique part and flags.
fn split_flags(name: &str) -> (&str, &str) {
    match name.split_once(":2,") {
        Some((unique, flags)) => (unique, flags),
        None => (name, ""),
    }
}

// ── RFC 822 ──

struct Headers(Vec<(String, String)>);

impl Headers {
    fn parse(block: &str) -> Self {
        let mut headers: Vec<(String, String)> = Vec::new();
        for line in block.lines() {
            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = headers.last_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }
        Self(headers)
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    fn all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Media type (lowercased) and a parameter lookup over Content-Type.
    fn content_type(&self) -> (String, Vec<(String, String)>) {
        let raw = self.get("content-type").unwrap_or("text/plain");
        let mut parts = raw.split(';');
        let media = parts.next().unwrap_or("").trim().to_ascii_lowercase();
        let params = parts
            .filter_map(|p| p.split_once('='))
            .map(|(k, v)| {
                (
                    k.trim().to_ascii_lowercase(),
                    v.trim().trim_matches('"').to_string(),
                )
            })
            .collect();
        (media, params)
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn split_head(raw: &str) -> (&str, &str) {
    if raw.starts_with('\n') {
        return ("", &raw[1..]);
    }
    match raw.split_once("\n\n") {
        Some((head, body)) => (head, body),
        None => (raw, ""),
    }
}

struct ParsedMessage {
    headers: Headers,
    body: String,
}

impl ParsedMessage {
    fn parse(raw: &[u8]) -> Self {
        let text = String::from_utf8_lossy(raw).replace("\r\n", "\n");
        let (head, body) = split_head(&text);
        let headers = Headers::parse(head);
        let body = extract_body(&headers, body);
        Self { headers, body }
    }

    fn header(&self, name: &str) -> String {
        self.headers.get(name).map(decode_words).unwrap_or_default()
    }

    /// Whole-address match on any recipient header, ignoring case.
    fn addressed_to(&self, address: &str) -> bool {
        let address = address.trim();
        ["to", "cc", "delivered-to", "x-original-to"]
            .iter()
            .flat_map(|h| self.headers.all(*h))
            .flat_map(|v| ADDRESS_RE.find_iter(v))
            .any(|m| m.as_str().eq_ignore_ascii_case(address))
    }

    fn into_raw(self, id: MessageId) -> RawMessage {
        RawMessage {
            id,
            subject: self.header("subject"),
            from: self.header("from"),
            to: self.header("to"),
            date: self.header("date"),
            body: self.body,
        }
    }
}

/// Prefers text/plain, falls back to text/html with the markup stripped.
fn extract_body(headers: &Headers, body: &str) -> String {
    let mut plain = None;
    let mut html = None;
    collect_parts(headers, body, &mut plain, &mut html);
    plain
        .filter(|p: &String| !p.trim().is_empty())
        .or_else(|| html.map(|h| html_to_text(&h)))
        .unwrap_or_default()
}

fn collect_parts(headers: &Headers, body: &str, plain: &mut Option<String>, html: &mut Option<String>) {
    let (media, params) = headers.content_type();

    if media.starts_with("multipart/") {
        let Some(boundary) = param(&params, "boundary") else {
            return;
        };
        let delimiter = format!("--{}", boundary);
        for chunk in body.split(delimiter.as_str()).skip(1) {
            if chunk.starts_with("--") {
                break;
            }
            let chunk = chunk.strip_prefix('\n').unwrap_or(chunk);
            let (head, part_body) = split_head(chunk);
            collect_parts(&Headers::parse(head), part_body, plain, html);
        }
        return;
    }

    let slot = match media.as_str() {
        "text/plain" if plain.is_none() => plain,
        "text/html" if html.is_none() => html,
        _ => return,
    };
    let encoding = headers
        .get("content-transfer-encoding")
        .unwrap_or("7bit")
        .to_ascii_lowercase();
    let bytes = match encoding.as_str() {
        "base64" => {
            let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
            match BASE64.decode(compact) {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!("undecodable base64 part: {}", e);
                    body.as_bytes().to_vec()
                }
            }
        }
        "quoted-printable" => decode_quoted_printable(body, false),
        _ => body.as_bytes().to_vec(),
    };
    *slot = Some(decode_charset(&bytes, param(&params, "charset")));
}

fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    match charset.map(str::to_ascii_lowercase).as_deref() {
        Some("iso-8859-1" | "latin1" | "windows-1252" | "us-ascii") => {
            bytes.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn decode_quoted_printable(input: &str, underscores: bool) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'=' if bytes.get(i + 1) == Some(&b'\n') => i += 2,
            b'=' => match bytes.get(i + 1..i + 3).and_then(hex_byte) {
                Some(b) => {
                    out.push(b);
                    i += 3;
                }
                None => {
                    out.push(b'=');
                    i += 1;
                }
            },
            b'_' if underscores => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    out
}

fn hex_byte(pair: &[u8]) -> Option<u8> {
    std::str::from_utf8(pair)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
}

/// Decodes RFC 2047 encoded words (`=?utf-8?B?...?=`) in a header value.
fn decode_words(value: &str) -> String {
    let joined = ENCODED_GAP_RE.replace_all(value, "?==?");
    ENCODED_WORD_RE
        .replace_all(&joined, |caps: &regex::Captures| {
            let bytes = match &caps[2] {
                "B" | "b" => BASE64.decode(&caps[3]).ok(),
                _ => Some(decode_quoted_printable(&caps[3], true)),
            };
            match bytes {
                Some(bytes) => decode_charset(&bytes, Some(&caps[1])),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn html_to_text(html: &str) -> String {
    let text = SCRIPT_RE.replace_all(html, "");
    let text = BLOCK_END_RE.replace_all(&text, "\n");
    let text = TAG_RE.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    BLANKS_RE.replace_all(text.trim(), "\n\n").into_owned()
}
