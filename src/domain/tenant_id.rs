use std::fmt;

use uuid::Uuid;

/// A validated tenant identifier. Every ingress path and every worker lease
/// goes through `parse` (shape) and the allowlist (membership); raw header
/// strings never travel further than this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TenantId(Uuid);

/// Why a candidate tenant was turned away. `Missing` and `Malformed` map to
/// 401, `Unknown` to 403 at the API and to a `tenant_unknown` dead letter at
/// the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TenantRejection {
    #[error("tenant header missing")]
    Missing,
    #[error("tenant identifier is not a UUID")]
    Malformed,
    #[error("tenant is not on the allowlist")]
    Unknown,
}

impl TenantId {
    pub fn parse(candidate: &str) -> Result<Self, TenantRejection> {
        Uuid::parse_str(candidate.trim())
            .map(Self)
            .map_err(|_| TenantRejection::Malformed)
    }

    /// Parse an optional header value, distinguishing absence from shape.
    pub fn parse_header(candidate: Option<&str>) -> Result<Self, TenantRejection> {
        match candidate {
            None => Err(TenantRejection::Missing),
            Some(raw) if raw.trim().is_empty() => Err(TenantRejection::Missing),
            Some(raw) => Self::parse(raw),
        }
    }

    pub fn as_uuid(&self) -> Uuid { self.0 }
}

impl fmt::Display for TenantId {
    // always the lowercase hyphenated form; this is what gets persisted
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.hyphenated().fmt(f) }
}
