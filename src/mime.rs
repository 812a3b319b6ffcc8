//! Raw RFC 5322 message loading.
//!
//! Turns bytes (an `.eml` file, an IMAP `BODY[]`) into the header list and
//! part tree the pipeline works on.

use std::path::Path;

use mail_parser::{Addr, Address, Header, HeaderValue, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::debug;

use crate::error::ExtractionError;
use crate::pipeline::types::{FullMessage, Headers, MimeLeaf, MimePartNode};

/// Multipart nesting deeper than this is rejected.
const MAX_DEPTH: usize = 64;

/// Parse a raw message into headers and a part tree.
pub fn parse_message(raw: &[u8]) -> Result<FullMessage, ExtractionError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| ExtractionError::Parse("input is not an RFC 5322 message".into()))?;

    let headers: Headers = parsed
        .headers()
        .iter()
        .map(|header| (header.name().to_ascii_lowercase(), header_text(raw, header)))
        .collect();

    let parts = if parsed.parts.is_empty() {
        Vec::new()
    } else {
        vec![build_node(&parsed.parts, 0, 0)?]
    };

    debug!(headers = headers.len(), parts = parsed.parts.len(), "Parsed message");
    Ok(FullMessage { headers, parts })
}

/// Read a message from disk and parse it.
pub async fn load_file(path: impl AsRef<Path>) -> Result<FullMessage, ExtractionError> {
    let raw = tokio::fs::read(path.as_ref()).await?;
    parse_message(&raw)
}

fn build_node(
    parts: &[MessagePart<'_>],
    index: usize,
    depth: usize,
) -> Result<MimePartNode, ExtractionError> {
    if depth > MAX_DEPTH {
        return Err(ExtractionError::Parse(format!(
            "multipart nesting exceeds {MAX_DEPTH} levels"
        )));
    }
    let part = parts
        .get(index)
        .ok_or_else(|| ExtractionError::Parse(format!("part {index} referenced but missing")))?;

    let (body, default_type) = match &part.body {
        PartType::Multipart(children) => {
            let children = children
                .iter()
                .map(|&child| build_node(parts, child as usize, depth + 1))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(MimePartNode::multipart(children));
        }
        PartType::Text(text) => (Some(text.to_string()), "text/plain"),
        PartType::Html(html) => (Some(html.to_string()), "text/html"),
        PartType::Binary(_) | PartType::InlineBinary(_) => (None, "application/octet-stream"),
        PartType::Message(_) => (None, "message/rfc822"),
    };

    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .unwrap_or_else(|| default_type.to_string())
        .to_ascii_lowercase();

    Ok(MimePartNode::Leaf(MimeLeaf {
        content_type,
        body,
        is_attachment: part
            .content_disposition()
            .is_some_and(|disposition| disposition.is_attachment()),
        name: part.attachment_name().map(str::to_string),
        size: part.contents().len() as u64,
    }))
}

/// Header value as the model should read it.
///
/// Values carrying RFC 2047 encoded words use mail-parser's decoded text or
/// address form; everything else keeps its raw, unfolded wire form.
fn header_text(raw: &[u8], header: &Header<'_>) -> String {
    let wire = raw
        .get(header.offset_start as usize..header.offset_end as usize)
        .map(|bytes| unfold(&String::from_utf8_lossy(bytes)))
        .unwrap_or_default();
    if !wire.contains("=?") {
        return wire;
    }

    match &header.value {
        HeaderValue::Text(text) => text.trim().to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(address) => display_address(address),
        _ => wire,
    }
}

fn display_address(address: &Address<'_>) -> String {
    match address {
        Address::List(addrs) => addrs.iter().map(display_addr).collect::<Vec<_>>().join(", "),
        Address::Group(groups) => groups
            .iter()
            .map(|group| {
                let members = group.addresses.iter().map(display_addr).collect::<Vec<_>>().join(", ");
                match group.name.as_deref() {
                    Some(name) => format!("{name}: {members};"),
                    None => members,
                }
            })
            .collect::<Vec<_>>()
            .join(", "),
    }
}

fn display_addr(addr: &Addr<'_>) -> String {
    match (addr.name.as_deref(), addr.address.as_deref()) {
        (Some(name), Some(email)) => format!("{name} <{email}>"),
        (Some(name), None) => name.to_string(),
        (None, Some(email)) => email.to_string(),
        (None, None) => String::new(),
    }
}

/// Join folded header lines into one trimmed value.
fn unfold(value: &str) -> String {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
