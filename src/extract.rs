// 🧮 Parcel-ID Extraction
// Distinct parcel identifiers out of the filtered change set

use crate::query::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A parcel identifier (PIN). Never empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParcelId(String);

impl ParcelId {
    /// Build from a raw attribute. NULL and blank values have no identifier.
    /// Other text is kept verbatim, padding included, so it still equals the
    /// stored `PIN` when selecting parcels.
    pub fn from_field(value: &FieldValue) -> Option<Self> {
        if value.is_null() {
            return None;
        }
        let text = value.to_string();
        if text.trim().is_empty() {
            None
        } else {
            Some(ParcelId(text))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name safe form: anything outside `[A-Za-z0-9._-]` becomes `_`.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
            .collect()
    }

    pub fn to_field(&self) -> FieldValue {
        FieldValue::Text(self.0.clone())
    }
}

impl fmt::Display for ParcelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParcelId {
    fn from(s: &str) -> Self {
        ParcelId(s.to_string())
    }
}

/// Sorted, distinct parcel identifiers. Iteration order is the render order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParcelIdSet {
    ids: BTreeSet<ParcelId>,

    /// Rows skipped because their identifier was NULL or blank.
    #[serde(skip)]
    pub skipped: usize,
}

impl ParcelIdSet {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &ParcelId) -> bool {
        self.ids.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParcelId> {
        self.ids.iter()
    }

    /// Values for an `IN` predicate, in sorted order.
    pub fn to_fields(&self) -> Vec<FieldValue> {
        self.ids.iter().map(ParcelId::to_field).collect()
    }
}

impl<'a> IntoIterator for &'a ParcelIdSet {
    type Item = &'a ParcelId;
    type IntoIter = std::collections::btree_set::Iter<'a, ParcelId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Deduplicate a column of parcel identifiers.
pub fn distinct_parcel_ids<'a, I>(values: I) -> ParcelIdSet
where
    I: IntoIterator<Item = &'a FieldValue>,
{
    let mut set = ParcelIdSet::default();
    for value in values {
        match ParcelId::from_field(value) {
            Some(id) => {
                set.ids.insert(id);
            }
            None => set.skipped += 1,
        }
    }
    set
}
