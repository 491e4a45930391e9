use indexmap::IndexMap;

use crate::Ciphertext;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: String,
    pub name: String,

    /// Application specific properties.
    ///
    /// Hashmaps are not allowed because their unstable ordering leads to non-determinism.
    #[serde(default)]
    #[serde(skip_serializing_if = "IndexMap::is_empty")]
    pub properties: IndexMap<String, serde_json::Value>,
}

impl Candidate {
    pub fn new(id: &str, name: &str) -> Self {
        Candidate {
            id: id.to_owned(),
            name: name.to_owned(),
            properties: IndexMap::new(),
        }
    }
}

/// An encrypted vote for one candidate: the ciphertext encrypts 1 under the
/// election's tally key and is folded into that candidate's accumulator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ballot {
    pub candidate_id: String,
    pub ciphertext: Ciphertext,
}
