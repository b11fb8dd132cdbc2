//! Player identifiers and human-typable room codes

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::util::time::unix_millis;

/// Symbols a room code may contain (no `0/O/1/I`)
pub const ROOM_CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Number of symbols in a room code
pub const ROOM_CODE_LEN: usize = 4;

/// Length of the random part of a player id
const PLAYER_ID_SUFFIX_LEN: usize = 8;

/// Opaque player identifier, unique for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Four-symbol room code in canonical (upper) case
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

/// Input that is not a valid room code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room code {0:?}: expected 4 characters from ABCDEFGHJKLMNPQRSTUVWXYZ23456789")]
pub struct InvalidRoomCode(pub String);

impl RoomCode {
    /// Parse user input. Case and surrounding whitespace are ignored.
    pub fn parse(input: &str) -> Result<Self, InvalidRoomCode> {
        let canonical = input.trim().to_ascii_uppercase();
        let valid = canonical.len() == ROOM_CODE_LEN
            && canonical.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));

        if valid {
            Ok(Self(canonical))
        } else {
            Err(InvalidRoomCode(input.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = InvalidRoomCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Generate a player id: base36 timestamp prefix plus a random suffix
pub fn generate_player_id() -> PlayerId {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PLAYER_ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    PlayerId(format!("p-{}-{}", to_base36(unix_millis()), suffix))
}

/// Generate a room code from the thread-local RNG
pub fn generate_room_code() -> RoomCode {
    generate_room_code_with(&mut rand::thread_rng())
}

/// Generate a room code from the given RNG
pub fn generate_room_code_with<R: Rng + ?Sized>(rng: &mut R) -> RoomCode {
    let code = (0..ROOM_CODE_LEN)
        .map(|_| char::from(ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())]))
        .collect();
    RoomCode(code)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
