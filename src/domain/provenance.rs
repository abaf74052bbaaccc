use serde::{Deserialize, Serialize};
use std::fmt;

/// Origin of the last authorized mutation of a resource.
///
/// `None` marks an unmanaged resource that anyone may edit. Any other value
/// pins the resource to that provisioning source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Provenance {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "api")]
    Api,
    #[serde(rename = "file")]
    File,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::None => "",
            Provenance::Api => "api",
            Provenance::File => "file",
        }
    }

    /// Parse from the stored string representation.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "" => Some(Provenance::None),
            "api" => Some(Provenance::Api),
            "file" => Some(Provenance::File),
            _ => None,
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        *self == Provenance::None
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can carry a provenance record.
pub trait Provisionable: Send + Sync {
    /// Kind of resource, part of the provenance record key.
    fn resource_type(&self) -> &'static str;

    /// Identifier of the resource within its organization.
    fn resource_id(&self) -> &str;
}

/// Mutation attempted against a provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvenanceAction {
    Update,
    Delete,
}

impl fmt::Display for ProvenanceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvenanceAction::Update => write!(f, "update"),
            ProvenanceAction::Delete => write!(f, "delete"),
        }
    }
}

/// Provenance pinning policy.
///
/// A resource whose stored provenance is `None` may be mutated under any
/// provenance. Once the stored provenance is set, only callers presenting the
/// identical value may mutate it; this includes attempts to go back to `None`.
/// Returns the stored value as `Err` when the transition is refused.
pub fn check_transition(stored: Provenance, requested: Provenance) -> Result<(), Provenance> {
    if stored != requested && !stored.is_none() {
        return Err(stored);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_round_trip_strings() {
        for p in [Provenance::None, Provenance::Api, Provenance::File] {
            assert_eq!(Provenance::from_str(p.as_str()), Some(p));
        }
        assert_eq!(Provenance::from_str("terraform"), None);
    }

    #[test]
    fn test_provenance_serialization() {
        assert_eq!(serde_json::to_string(&Provenance::Api).unwrap(), "\"api\"");
        assert_eq!(serde_json::to_string(&Provenance::None).unwrap(), "\"\"");

        let parsed: Provenance = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(parsed, Provenance::File);
    }

    #[test]
    fn test_unmanaged_accepts_any_provenance() {
        assert!(check_transition(Provenance::None, Provenance::None).is_ok());
        assert!(check_transition(Provenance::None, Provenance::Api).is_ok());
        assert!(check_transition(Provenance::None, Provenance::File).is_ok());
    }

    #[test]
    fn test_pinned_provenance() {
        assert!(check_transition(Provenance::Api, Provenance::Api).is_ok());
        assert_eq!(
            check_transition(Provenance::Api, Provenance::File),
            Err(Provenance::Api)
        );
        // No way back to unmanaged
        assert_eq!(
            check_transition(Provenance::File, Provenance::None),
            Err(Provenance::File)
        );
    }
}
