/// Short label recording which channel a document arrived through (`upload`,
/// `api`, ...). Free-form but bounded; anything longer is truncated rather
/// than rejected, since it is operator-facing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTag(String);

const MAX_LEN: usize = 64;

impl SourceTag {
    pub fn parse(raw: Option<&str>, default: &str) -> Self {
        let trimmed = raw.unwrap_or(default).trim();
        let value = if trimmed.is_empty() { default } else { trimmed };
        let mut value = value.to_owned();
        if value.len() > MAX_LEN {
            // truncate on a char boundary
            let cut = (0..=MAX_LEN).rev().find(|i| value.is_char_boundary(*i)).unwrap_or(0);
            value.truncate(cut);
        }
        Self(value)
    }
}

impl AsRef<str> for SourceTag {
    fn as_ref(&self) -> &str { &self.0 }
}

impl From<SourceTag> for String {
    fn from(value: SourceTag) -> Self { value.0 }
}
