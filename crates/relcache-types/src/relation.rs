//! Relation paths: which relations to populate when loading an entity.
//!
//! A [`RelationPath`] is a tree keyed by relation field name. A leaf is a
//! boolean "include this relation" flag; an inner node names the relations
//! to populate on the related entity in turn.
//!
//! ```text
//! { from: true, to: { owner: true } }
//!   load `from`, load `to`, and on `to` also load `owner`
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One entry of a [`RelationPath`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationSelect {
    /// Include (or explicitly not include) the relation, nothing nested.
    Flag(bool),
    /// Include the relation and populate these relations on it.
    Nested(RelationPath),
}

impl RelationSelect {
    /// Whether the relation is loaded at all.
    pub const fn is_included(&self) -> bool {
        match self {
            Self::Flag(include) => *include,
            Self::Nested(_) => true,
        }
    }

    /// The nested path, if any.
    pub const fn nested(&self) -> Option<&RelationPath> {
        match self {
            Self::Flag(_) => None,
            Self::Nested(path) => Some(path),
        }
    }

    fn merge(&mut self, other: &Self) {
        match other {
            Self::Nested(theirs) => match self {
                Self::Nested(mine) => mine.merge(theirs),
                Self::Flag(_) => *self = Self::Nested(theirs.clone()),
            },
            Self::Flag(theirs) => {
                // A nested selection already implies inclusion.
                if let Self::Flag(mine) = self {
                    *mine = *mine || *theirs;
                }
            }
        }
    }
}

/// Which relations to populate, nested per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationPath(BTreeMap<String, RelationSelect>);

impl RelationPath {
    /// An empty path: populate nothing.
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Include `field` without nesting.
    #[must_use]
    pub fn include(mut self, field: &str) -> Self {
        self.merge_entry(field, &RelationSelect::Flag(true));
        self
    }

    /// Include `field` and populate `path` on it.
    #[must_use]
    pub fn nested(mut self, field: &str, path: Self) -> Self {
        self.merge_entry(field, &RelationSelect::Nested(path));
        self
    }

    /// Merge `other` into `self`.
    ///
    /// Structural union: keys present on one side are kept, nested paths on
    /// both sides are merged recursively and flags are OR'd.
    pub fn merge(&mut self, other: &Self) {
        for (field, select) in &other.0 {
            self.merge_entry(field, select);
        }
    }

    /// Owned variant of [`RelationPath::merge`].
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    fn merge_entry(&mut self, field: &str, select: &RelationSelect) {
        match self.0.get_mut(field) {
            Some(existing) => existing.merge(select),
            None => {
                self.0.insert(field.to_owned(), select.clone());
            }
        }
    }

    /// True when no relation is included.
    pub fn is_empty(&self) -> bool {
        !self.0.values().any(RelationSelect::is_included)
    }

    /// Included relations in field order, with their nested path if any.
    pub fn included(&self) -> impl Iterator<Item = (&str, Option<&Self>)> {
        self.0
            .iter()
            .filter(|(_, select)| select.is_included())
            .map(|(field, select)| (field.as_str(), select.nested()))
    }
}
