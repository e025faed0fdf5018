use unicode_segmentation::UnicodeSegmentation;

/// The filename a client claims for an upload. Advisory metadata only (the
/// content store is addressed by hash), but it is persisted and echoed back,
/// so path separators and control characters are rejected outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFilename(String);

impl ClientFilename {
    pub fn parse(raw: String) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("filename must not be empty".into());
        }
        if trimmed.graphemes(true).count() > 256 {
            return Err("filename longer than 256 graphemes".into());
        }
        let forbidden = |c: char| c == '/' || c == '\\' || c.is_control();
        if trimmed.chars().any(forbidden) {
            return Err(format!("filename contains forbidden characters: {trimmed:?}"));
        }
        Ok(Self(trimmed.to_owned()))
    }
}

impl AsRef<str> for ClientFilename {
    fn as_ref(&self) -> &str { &self.0 }
}

impl From<ClientFilename> for String {
    fn from(value: ClientFilename) -> Self { value.0 }
}
