//! Step capability tags.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Category of step operation. Each provider declares exactly one concrete
/// capability when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Supertype of every capability; only meaningful in lookups.
    Any,
    Preprocessing,
    Alignment,
    BamProcessing,
    Assembly,
    SingleCellProcessing,
    GenericOutputHandler,
}

impl Capability {
    /// Every capability a provider may declare.
    pub const CONCRETE: [Capability; 6] = [
        Capability::Preprocessing,
        Capability::Alignment,
        Capability::BamProcessing,
        Capability::Assembly,
        Capability::SingleCellProcessing,
        Capability::GenericOutputHandler,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Preprocessing => "preprocessing",
            Self::Alignment => "alignment",
            Self::BamProcessing => "bam_processing",
            Self::Assembly => "assembly",
            Self::SingleCellProcessing => "single_cell_processing",
            Self::GenericOutputHandler => "generic_output_handler",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        std::iter::once(Self::Any)
            .chain(Self::CONCRETE)
            .find(|c| c.as_str() == raw)
    }

    /// True when a provider declaring `declared` satisfies a request for
    /// `self`.
    #[must_use]
    pub fn is_assignable_from(self, declared: Capability) -> bool {
        self == Self::Any || self == declared
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_accepts_every_capability() {
        for cap in Capability::CONCRETE {
            assert!(Capability::Any.is_assignable_from(cap));
        }
    }

    #[test]
    fn concrete_capabilities_are_disjoint() {
        assert!(!Capability::Alignment.is_assignable_from(Capability::Preprocessing));
        assert!(!Capability::Preprocessing.is_assignable_from(Capability::Any));
        assert!(Capability::BamProcessing.is_assignable_from(Capability::BamProcessing));
    }

    #[test]
    fn parse_matches_serde_names() {
        for cap in Capability::CONCRETE {
            let json = serde_json::to_string(&cap).unwrap();
            assert_eq!(json, format!("\"{}\"", cap.as_str()));
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("bogus"), None);
    }
}
