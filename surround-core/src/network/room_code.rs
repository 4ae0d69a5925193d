//! Room Id Generation and Parsing
//!
//! Room ids are short, case-insensitive and shared verbally, so input is
//! normalized to uppercase alphanumerics.

use std::fmt;

/// Characters used in generated room ids
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated room ids
const ID_LENGTH: usize = 6;

/// Longest room id accepted from user input
const MAX_ID_LENGTH: usize = 16;

/// A room id that can be shared to join a room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Generate a random room id
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();

        let id = (0..ID_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        RoomId(id)
    }

    /// Get the room id as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse a room id from user input
    ///
    /// Drops separators and whitespace and uppercases the rest.
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.is_empty() || normalized.len() > MAX_ID_LENGTH {
            return None;
        }
        Some(RoomId(normalized))
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
