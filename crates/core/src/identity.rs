//! Room and participant identifier generation.

use rand::Rng;

const SUFFIX_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 6;

/// The identifiers a single session is created with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentifiers {
    pub room: String,
    pub participant: String,
}

/// Produces fresh identifiers for every connect attempt.
///
/// Injected into the session manager so tests can pin the values.
pub trait IdentityGenerator: Send + Sync {
    fn generate(&self, room_base_name: &str) -> SessionIdentifiers;
}

/// Default generator: `<base>-<suffix>` rooms and `<prefix>-<suffix>` participants,
/// with short lowercase base36 suffixes.
pub struct RandomIdentityGenerator {
    participant_prefix: String,
}

impl RandomIdentityGenerator {
    pub fn new(participant_prefix: impl Into<String>) -> Self {
        Self {
            participant_prefix: participant_prefix.into(),
        }
    }
}

impl IdentityGenerator for RandomIdentityGenerator {
    fn generate(&self, room_base_name: &str) -> SessionIdentifiers {
        SessionIdentifiers {
            room: format!("{}-{}", room_base_name, random_suffix()),
            participant: format!("{}-{}", self.participant_prefix, random_suffix()),
        }
    }
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
