use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Identity of the individual or entity a value was contributed by. Privacy
/// budget is tracked per subject.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Index structure mapping every value of a query to its owning subject.
///
/// `unique` holds the distinct subjects in first-seen order and `indexed[i]`
/// is the position in `unique` of the subject owning value `i`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSubjectList {
    unique: Vec<SubjectId>,
    indexed: Vec<usize>,
}

impl DataSubjectList {
    pub fn from_subjects<I, S>(subjects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SubjectId>,
    {
        let mut unique = Vec::new();
        let mut positions: HashMap<SubjectId, usize> = HashMap::new();
        let mut indexed = Vec::new();
        for subject in subjects {
            let subject = subject.into();
            let slot = *positions.entry(subject.clone()).or_insert_with(|| {
                unique.push(subject);
                unique.len() - 1
            });
            indexed.push(slot);
        }
        Self { unique, indexed }
    }

    /// Distinct subjects referenced by the query.
    pub fn one_hot_lookup(&self) -> &[SubjectId] {
        &self.unique
    }

    pub fn entities_indexed(&self) -> &[usize] {
        &self.indexed
    }

    /// Owning subject per value, aligned with the query's values.
    pub fn per_value(&self) -> Vec<SubjectId> {
        self.indexed
            .iter()
            .map(|slot| self.unique[*slot].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.indexed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexed.is_empty()
    }
}

impl From<String> for SubjectId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_subjects_share_an_index() {
        let list = DataSubjectList::from_subjects(["alice", "bob", "alice", "carol"]);
        assert_eq!(list.len(), 4);
        assert_eq!(
            list.one_hot_lookup(),
            &[
                SubjectId::from("alice"),
                SubjectId::from("bob"),
                SubjectId::from("carol")
            ]
        );
        assert_eq!(list.entities_indexed(), &[0, 1, 0, 2]);
        assert_eq!(list.per_value()[2], SubjectId::from("alice"));
    }
}
