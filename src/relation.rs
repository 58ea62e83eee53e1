//! Relation types - cardinality of a link between two classes
//!
//! Every relation is seen from the side that declares it:
//! - `OneToOne`: at most one target, target points back at most once
//! - `OneToMany`: many targets, each pointing back to this row
//! - `ManyToOne`: one target, shared with other rows
//! - `ManyToMany`: many targets through a join table

use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationType {
    /// Get the string representation of the relation type
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::OneToOne => "one_to_one",
            RelationType::OneToMany => "one_to_many",
            RelationType::ManyToOne => "many_to_one",
            RelationType::ManyToMany => "many_to_many",
        }
    }

    /// Get all relation types
    pub fn all() -> &'static [RelationType] {
        &[
            RelationType::OneToOne,
            RelationType::OneToMany,
            RelationType::ManyToOne,
            RelationType::ManyToMany,
        ]
    }

    /// This side holds at most one related row
    pub fn is_x_to_one(&self) -> bool {
        matches!(self, RelationType::OneToOne | RelationType::ManyToOne)
    }

    /// This side holds a collection of related rows
    pub fn is_x_to_many(&self) -> bool {
        matches!(self, RelationType::OneToMany | RelationType::ManyToMany)
    }

    /// The target may be shared with other rows of this class
    pub fn is_many_to_x(&self) -> bool {
        matches!(self, RelationType::ManyToOne | RelationType::ManyToMany)
    }

    /// The relation type as seen from the other side
    pub fn reverse(&self) -> RelationType {
        match self {
            RelationType::OneToOne => RelationType::OneToOne,
            RelationType::OneToMany => RelationType::ManyToOne,
            RelationType::ManyToOne => RelationType::OneToMany,
            RelationType::ManyToMany => RelationType::ManyToMany,
        }
    }
}

impl FromStr for RelationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "one_to_one" => Ok(RelationType::OneToOne),
            "one_to_many" => Ok(RelationType::OneToMany),
            "many_to_one" => Ok(RelationType::ManyToOne),
            "many_to_many" => Ok(RelationType::ManyToMany),
            _ => Err(crate::Error::InvalidConfig(format!("unknown relation type: {}", s))),
        }
    }
}

impl std::fmt::Display for RelationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_type_roundtrip() {
        for kind in RelationType::all() {
            let parsed: RelationType = kind.as_str().parse().unwrap();
            assert_eq!(*kind, parsed);
        }
        assert!("one_to_few".parse::<RelationType>().is_err());
    }

    #[test]
    fn test_cardinality_predicates() {
        assert!(RelationType::OneToOne.is_x_to_one());
        assert!(RelationType::ManyToOne.is_x_to_one());
        assert!(RelationType::OneToMany.is_x_to_many());
        assert!(RelationType::ManyToMany.is_many_to_x());
        assert!(!RelationType::OneToMany.is_many_to_x());
    }

    #[test]
    fn test_reverse() {
        for kind in RelationType::all() {
            assert_eq!(kind.reverse().reverse(), *kind);
        }
        assert_eq!(RelationType::OneToMany.reverse(), RelationType::ManyToOne);
    }
}
