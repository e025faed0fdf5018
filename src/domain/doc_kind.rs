/// The closed set of document kinds the pipeline understands. Routing from a
/// detected MIME type happens here, once, instead of string comparisons
/// scattered through the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocKind {
    Pdf,
    Png,
    Jpeg,
    Csv,
    Xlsx,
    Json,
    Xml,
    Unknown,
}

impl DocKind {
    pub fn from_mime(mime: &str) -> Self {
        match mime {
            "application/pdf" => Self::Pdf,
            "image/png" => Self::Png,
            "image/jpeg" => Self::Jpeg,
            "text/csv" => Self::Csv,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Self::Xlsx,
            "application/json" => Self::Json,
            "application/xml" => Self::Xml,
            _ => Self::Unknown,
        }
    }

    /// The short name carried in `doc_type` fields of parsed payloads and
    /// follow-on events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Unknown => "unknown",
        }
    }

    /// File extension (with dot) used for the content-store path.
    pub fn file_ext(&self) -> &'static str {
        match self {
            Self::Pdf => ".pdf",
            Self::Png => ".png",
            Self::Jpeg => ".jpg",
            Self::Csv => ".csv",
            Self::Xlsx => ".xlsx",
            Self::Json => ".json",
            Self::Xml => ".xml",
            Self::Unknown => "",
        }
    }
}
