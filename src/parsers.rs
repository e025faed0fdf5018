use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use serde_json::Value;

use crate::domain::DocKind;

/// What a parser extracted from one document. Always carries `doc_type`;
/// everything else is best-effort. Serialized verbatim into
/// `parsed_items.payload_json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ParsedPayload {
    pub doc_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invoice_no: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ParsedPayload {
    fn with_doc_type(doc_type: &str) -> Self {
        Self { doc_type: doc_type.to_owned(), ..Self::default() }
    }

    /// The subset echoed in `InboxItemParsed.summary_fields`.
    pub fn summary_fields(&self) -> Value {
        let mut summary = json!({ "doc_type": &self.doc_type });
        if let Some(v) = &self.invoice_no {
            summary["invoice_no"] = json!(v);
        }
        if let Some(v) = &self.amount {
            summary["amount"] = json!(v);
        }
        if let Some(v) = &self.due_date {
            summary["due_date"] = json!(v);
        }
        summary
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseFault {
    #[error("document exceeds the parser byte cap")]
    TooLarge,
}

// German and English invoice conventions, matched over a lossy text view
static INVOICE_NO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Rechnungsnummer|Invoice(?:\s*No\.?)?)[:\s]*([A-Z0-9\-/]{4,})")
        .expect("invalid invoice_no pattern")
});
static AMOUNT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(Betrag|Amount)[:\s]*([0-9]{1,3}(?:[.,][0-9]{3})*(?:[.,][0-9]{2})?)\b")
        .expect("invalid amount pattern")
});
static DUE_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(Fälligkeit|Due\s*Date)[:\s]*([0-9]{2,4}[./-][0-9]{1,2}[./-][0-9]{2,4})\b")
        .expect("invalid due_date pattern")
});

/// Route to the per-format parser. Pure over bytes; the only failure is the
/// size cap, everything else degrades to sparser fields.
pub fn parse_content(kind: DocKind, data: &[u8], max_bytes: usize) -> Result<ParsedPayload, ParseFault> {
    if data.len() > max_bytes {
        return Err(ParseFault::TooLarge);
    }
    Ok(match kind {
        DocKind::Pdf => parse_pdf(data),
        DocKind::Png | DocKind::Jpeg => parse_image(kind),
        DocKind::Csv => parse_csv(data),
        DocKind::Json => parse_json_doc(data),
        DocKind::Xml => parse_xml(data),
        // no structured parser; text heuristics only
        DocKind::Xlsx | DocKind::Unknown => parse_text_like(data),
    })
}

fn decode_text(data: &[u8]) -> String { String::from_utf8_lossy(data).into_owned() }

fn extract_fields(text: &str, payload: &mut ParsedPayload) {
    if let Some(caps) = INVOICE_NO.captures(text) {
        payload.invoice_no = caps.get(2).map(|m| m.as_str().to_owned());
    }
    if let Some(caps) = AMOUNT.captures(text) {
        payload.amount = caps.get(2).map(|m| m.as_str().to_owned());
    }
    if let Some(caps) = DUE_DATE.captures(text) {
        payload.due_date = caps.get(2).map(|m| m.as_str().to_owned());
    }
}

pub fn parse_text_like(data: &[u8]) -> ParsedPayload {
    let mut payload = ParsedPayload::with_doc_type(DocKind::Unknown.as_str());
    extract_fields(&decode_text(data), &mut payload);
    payload
}

/// Many PDFs carry their text uncompressed; the field extractors often work
/// directly on the raw bytes. No OCR.
pub fn parse_pdf(data: &[u8]) -> ParsedPayload {
    let mut payload = parse_text_like(data);
    payload.doc_type = DocKind::Pdf.as_str().to_owned();
    payload
}

pub fn parse_image(kind: DocKind) -> ParsedPayload {
    ParsedPayload::with_doc_type(kind.as_str())
}

pub fn parse_csv(data: &[u8]) -> ParsedPayload {
    let text = decode_text(data);
    let header: Vec<String> = text
        .lines()
        .next()
        .map(|line| line.split(',').take(10).map(|c| c.trim().to_owned()).collect())
        .unwrap_or_default();
    let mut payload = parse_text_like(data);
    payload.doc_type = DocKind::Csv.as_str().to_owned();
    payload.meta = Some(json!({ "header": header }));
    payload
}

pub fn parse_json_doc(data: &[u8]) -> ParsedPayload {
    let mut payload = ParsedPayload::with_doc_type(DocKind::Json.as_str());
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return payload;
    };
    let Some(object) = value.as_object() else {
        return payload;
    };
    payload.invoice_no = first_scalar(object, &["invoice", "invoice_no", "invoiceId", "invoice_id"]);
    payload.amount = first_scalar(object, &["amount", "total", "sum"]);
    payload.due_date = first_scalar(object, &["due_date", "dueDate"]);
    payload
}

fn first_scalar(object: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match object.get(*key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

pub fn parse_xml(data: &[u8]) -> ParsedPayload {
    let text = decode_text(data);
    let mut payload = ParsedPayload::with_doc_type(DocKind::Xml.as_str());
    payload.invoice_no = first_tag_text(&text, &["invoice_no", "InvoiceNo", "InvoiceID", "invoice"]);
    payload.amount = first_tag_text(&text, &["amount", "total", "Amount"]);
    payload.due_date = first_tag_text(&text, &["due_date", "DueDate"]);
    payload
}

/// Naive element lookup: first `<tag>text</tag>` occurrence, no namespace or
/// attribute awareness.
fn first_tag_text(text: &str, tags: &[&str]) -> Option<String> {
    tags.iter().find_map(|tag| tag_text(text, tag))
}

fn tag_text(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    let value = text[start..end].trim();
    (!value.is_empty()).then(|| value.to_owned())
}
