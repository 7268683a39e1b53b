//! Container and pod ID generation, validation, and name generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MinidockError, MinidockResult};

/// A validated container (or pod) ID: exactly 12 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Length of a full ID.
    pub const LENGTH: usize = 12;

    /// Shortest prefix accepted when resolving an ID.
    pub const MIN_PREFIX: usize = 3;

    /// Create a new container ID, validating the format.
    pub fn new(id: impl Into<String>) -> MinidockResult<Self> {
        let id = id.into();
        if id.len() != Self::LENGTH || !id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return Err(MinidockError::ConfigInvalid {
                message: format!("invalid container id: {id}"),
            });
        }
        Ok(Self(id))
    }

    /// Generate a new random container ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// The ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, used for interface naming.
    #[must_use]
    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// Whether `candidate` is a usable prefix of this ID (at least
    /// [`Self::MIN_PREFIX`] characters).
    #[must_use]
    pub fn matches_prefix(&self, candidate: &str) -> bool {
        candidate.len() >= Self::MIN_PREFIX && self.0.starts_with(candidate)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = MinidockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Adjectives for docker-style generated names.
const ADJECTIVES: &[&str] = &[
    "admiring", "amazing", "bold", "brave", "busy", "charming", "clever", "cool", "dazzling",
    "determined", "dreamy", "eager", "elastic", "elegant", "epic", "fervent", "festive", "focused",
    "friendly", "frosty", "gallant", "gifted", "goofy", "gracious", "happy", "hopeful", "hungry",
    "inspiring", "jolly", "keen", "kind", "lucid", "magical", "modest", "mystifying", "nifty",
    "nostalgic", "optimistic", "peaceful", "pensive", "practical", "quirky", "relaxed", "serene",
    "sharp", "silent", "sleepy", "stoic", "sweet", "swift", "tender", "trusting", "upbeat",
    "vibrant", "vigilant", "wizardly", "wonderful", "youthful", "zealous", "zen",
];

/// Animals for docker-style generated names.
const ANIMALS: &[&str] = &[
    "albatross", "antelope", "badger", "bat", "bear", "beaver", "bison", "camel", "cheetah",
    "cobra", "coyote", "crane", "crow", "deer", "dolphin", "eagle", "falcon", "ferret", "finch",
    "fox", "gazelle", "gecko", "giraffe", "hare", "hawk", "hedgehog", "heron", "hyena", "jackal",
    "jaguar", "koala", "lemur", "leopard", "lion", "lynx", "manatee", "meerkat", "mongoose",
    "moose", "narwhal", "newt", "ocelot", "orca", "otter", "owl", "panda", "panther", "pelican",
    "penguin", "raven", "salmon", "seal", "shark", "sloth", "sparrow", "squid", "stork", "swan",
    "tiger", "walrus", "weasel", "wolf", "wolverine", "wombat", "yak", "zebra",
];

/// Generate a docker-style `adjective-animal` name.
#[must_use]
pub fn generate_name() -> String {
    use rand::seq::SliceRandom;

    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty list");
    let animal = ANIMALS.choose(&mut rng).expect("non-empty list");
    format!("{adjective}-{animal}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        let id = ContainerId::generate();
        assert_eq!(id.as_str().len(), 12);
        assert!(ContainerId::new(id.as_str()).is_ok());
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(ContainerId::generate(), ContainerId::generate());
    }

    #[test]
    fn invalid_ids() {
        assert!(ContainerId::new("").is_err());
        assert!(ContainerId::new("abc").is_err());
        assert!(ContainerId::new("ABCDEF123456").is_err());
        assert!(ContainerId::new("ghijklmnopqr").is_err());
        assert!(ContainerId::new("0123456789abcd").is_err());
    }

    #[test]
    fn prefix_matching() {
        let id = ContainerId::new("a1b2c3d4e5f6").unwrap();
        assert!(id.matches_prefix("a1b"));
        assert!(id.matches_prefix("a1b2c3d4e5f6"));
        assert!(!id.matches_prefix("a1"));
        assert!(!id.matches_prefix("b2c"));
    }

    #[test]
    fn name_generation() {
        let name = generate_name();
        assert!(name.contains('-'));
        let (adjective, animal) = name.split_once('-').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(ANIMALS.contains(&animal));
    }
}
