//! Header rewriting for forwarded messages.
//!
//! Works on the raw header block: untouched fields keep their exact bytes
//! (folding, encoded words and 8-bit text included) and the body is copied
//! verbatim. `mail_parser` reads the decoded `From` and `Subject`; new
//! fields are rendered by lettre, which handles quoting, encoded words and
//! folding.

use lettre::Address;
use lettre::message::header::{self, Header, Headers};
use lettre::message::{Mailbox, Mailboxes};
use mail_parser::MessageParser;
use uuid::Uuid;

use crate::error::{DispatchError, ForwardError};

/// Fields that break re-sending from a different identity.
const STRIPPED: &[&str] = &["return-path", "sender", "message-id", "dkim-signature"];

/// One header field with its raw bytes, continuation lines included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub raw: Vec<u8>,
}

impl HeaderField {
    fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            raw: format!("{name}: {value}").into_bytes(),
        }
    }

    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Bytes after the colon, leading whitespace included.
    pub fn value(&self) -> &[u8] {
        let colon = self.raw.iter().position(|&b| b == b':').unwrap_or(self.raw.len());
        self.raw.get(colon + 1..).unwrap_or_default()
    }

    fn renamed(&self, name: &str) -> Self {
        let mut raw = format!("{name}:").into_bytes();
        raw.extend_from_slice(self.value());
        Self {
            name: name.to_string(),
            raw,
        }
    }
}

/// A message split at the first empty line.
#[derive(Debug)]
pub struct ParsedMessage<'a> {
    pub fields: Vec<HeaderField>,
    pub line_ending: &'static [u8],
    pub body: &'a [u8],
}

/// Split `raw` into header fields and body.
pub fn parse(raw: &[u8]) -> Result<ParsedMessage<'_>, ForwardError> {
    let crlf = find(raw, b"\r\n\r\n");
    let lf = find(raw, b"\n\n");
    let lf_only: &'static [u8] = b"\n";
    let crlf_ending: &'static [u8] = b"\r\n";
    let (header_end, line_ending, separator_len) = match (crlf, lf) {
        (Some(c), Some(l)) if l < c => (l, lf_only, 2),
        (Some(c), _) => (c, crlf_ending, 4),
        (None, Some(l)) => (l, lf_only, 2),
        (None, None) => {
            return Err(ForwardError::Malformed(
                "no separator between headers and body".into(),
            ));
        }
    };

    let block = &raw[..header_end];
    let mut fields: Vec<HeaderField> = Vec::new();
    for line in split(block, line_ending) {
        if line.is_empty() {
            continue;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            let Some(last) = fields.last_mut() else {
                return Err(ForwardError::Malformed(
                    "continuation line before the first header".into(),
                ));
            };
            last.raw.extend_from_slice(line_ending);
            last.raw.extend_from_slice(line);
            continue;
        }

        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(ForwardError::Malformed(format!(
                "header line without a colon: {:?}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ForwardError::Malformed(format!("invalid header name {name:?}")));
        }
        fields.push(HeaderField {
            name,
            raw: line.to_vec(),
        });
    }

    if fields.is_empty() {
        return Err(ForwardError::Malformed("message has no headers".into()));
    }

    Ok(ParsedMessage {
        fields,
        line_ending,
        body: &raw[header_end + separator_len..],
    })
}

/// Parameters of one rewrite.
#[derive(Debug, Clone, Copy)]
pub struct Rewrite<'a> {
    /// Verified sending identity, the new `From` address.
    pub sending_identity: &'a str,
    /// Resolved destinations, the new `To`.
    pub destinations: &'a [String],
    pub subject_marker: Option<&'a str>,
    /// Used when the message carries no `From` header.
    pub envelope_sender: &'a str,
}

impl Rewrite<'_> {
    /// Rewrite the headers of `raw` for forwarding.
    pub fn apply(&self, raw: &[u8]) -> Result<Vec<u8>, ForwardError> {
        let message = parse(raw)?;
        let decoded = MessageParser::default().parse_headers(raw);
        let original_from = decoded
            .as_ref()
            .and_then(|m| m.from())
            .and_then(|a| a.first());
        let from_address = original_from
            .and_then(|a| a.address())
            .map(str::to_string)
            .unwrap_or_else(|| self.envelope_sender.to_string());
        let from_name = original_from
            .and_then(|a| a.name())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        let subject = decoded.as_ref().and_then(|m| m.subject()).map(str::to_string);

        let eol = message.line_ending;
        let has_reply_to = message.fields.iter().any(|f| f.is("Reply-To"));
        let phrase = format!(
            "{} at {}",
            from_name.as_deref().unwrap_or(&from_address),
            from_address
        );
        let identity = parse_address(self.sending_identity)?;
        let new_from = render(
            "From",
            header::From::from(Mailboxes::from(Mailbox::new(Some(phrase), identity))),
            eol,
        );
        let destinations = self
            .destinations
            .iter()
            .map(|d| parse_address(d).map(|addr| Mailbox::new(None, addr)))
            .collect::<Result<Mailboxes, _>>()?;
        let new_to = render("To", header::To::from(destinations), eol);

        let mut out: Vec<HeaderField> = Vec::with_capacity(message.fields.len() + 4);
        let mut reply_to: Option<HeaderField> = None;
        let (mut saw_from, mut saw_to, mut saw_subject) = (false, false, false);

        for field in &message.fields {
            if STRIPPED.iter().any(|name| field.is(name)) {
                continue;
            }
            if field.is("From") {
                if !saw_from {
                    if !has_reply_to {
                        reply_to = Some(field.renamed("Reply-To"));
                    }
                    out.push(new_from.clone());
                    saw_from = true;
                }
            } else if field.is("To") {
                out.push(field.renamed("X-Original-To"));
                if !saw_to {
                    out.push(new_to.clone());
                    saw_to = true;
                }
            } else if field.is("Subject") && !saw_subject {
                saw_subject = true;
                out.push(match self.subject_marker {
                    Some(marker) => mark_subject(field, subject.as_deref(), marker, eol),
                    None => field.clone(),
                });
            } else {
                out.push(field.clone());
            }
        }

        if !saw_from {
            out.insert(0, new_from);
            if !has_reply_to {
                reply_to = Some(HeaderField::new("Reply-To", &from_address));
            }
        }
        if !saw_to {
            out.push(new_to);
        }
        if let Some(reply_to) = reply_to {
            out.push(reply_to);
        }
        if !saw_subject && let Some(marker) = self.subject_marker {
            out.push(render("Subject", header::Subject::from(marker.to_string()), eol));
        }
        out.push(HeaderField::new(
            "Message-ID",
            &new_message_id(self.sending_identity),
        ));

        let mut rewritten = Vec::with_capacity(raw.len() + 256);
        for field in &out {
            rewritten.extend_from_slice(&field.raw);
            rewritten.extend_from_slice(eol);
        }
        rewritten.extend_from_slice(eol);
        rewritten.extend_from_slice(message.body);
        Ok(rewritten)
    }
}

/// Prefix the subject with `marker` unless it already starts with it.
///
/// An ASCII marker is spliced in front of the raw value. A non-ASCII marker
/// cannot sit as 8-bit text next to encoded words, so the whole subject is
/// re-encoded.
fn mark_subject(
    field: &HeaderField,
    decoded: Option<&str>,
    marker: &str,
    eol: &[u8],
) -> HeaderField {
    let already_marked = decoded
        .map(|s| s.trim_start().starts_with(marker))
        .unwrap_or_else(|| {
            String::from_utf8_lossy(field.value())
                .trim_start()
                .starts_with(marker)
        });
    if already_marked {
        return field.clone();
    }

    let value = field.value();
    if !marker.is_ascii() {
        let current = decoded
            .map(str::to_string)
            .unwrap_or_else(|| String::from_utf8_lossy(value).to_string());
        let current = current.trim();
        let subject = if current.is_empty() {
            marker.to_string()
        } else {
            format!("{marker} {current}")
        };
        return render(&field.name, header::Subject::from(subject), eol);
    }

    let rest = &value[value
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(value.len())..];

    let mut raw = format!("{}: {marker}", field.name).into_bytes();
    if !rest.is_empty() {
        raw.push(b' ');
        raw.extend_from_slice(rest);
    }
    HeaderField {
        name: field.name.clone(),
        raw,
    }
}

/// Render one header through lettre, using the message's line endings for
/// folded lines.
fn render<H: Header>(name: &str, value: H, eol: &[u8]) -> HeaderField {
    let mut headers = Headers::new();
    headers.set(value);
    let rendered = headers.to_string();
    let line = rendered.strip_suffix("\r\n").unwrap_or(&rendered);
    let raw = if eol == b"\r\n" {
        line.as_bytes().to_vec()
    } else {
        line.replace("\r\n", "\n").into_bytes()
    };
    HeaderField {
        name: name.to_string(),
        raw,
    }
}

fn parse_address(raw: &str) -> Result<Address, ForwardError> {
    raw.trim().parse().map_err(|e: lettre::address::AddressError| {
        ForwardError::Dispatch(DispatchError::InvalidAddress {
            address: raw.to_string(),
            reason: e.to_string(),
        })
    })
}

fn new_message_id(sending_identity: &str) -> String {
    let domain = sending_identity
        .rsplit_once('@')
        .map(|(_, d)| d)
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{domain}>", Uuid::new_v4())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split<'a>(block: &'a [u8], eol: &'a [u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
    let mut rest = Some(block);
    std::iter::from_fn(move || {
        let current = rest?;
        match find(current, eol) {
            Some(i) => {
                rest = Some(&current[i + eol.len()..]);
                Some(&current[..i])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}
