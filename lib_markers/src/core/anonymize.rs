//! # Identifier Anonymiser
//!
//! Analysis exports must not reveal which player produced which marker, yet
//! markers from the same player should still group together within one
//! export. Each export therefore gets a fresh random salt, and every user
//! identifier is replaced by `sha1(ident + salt)`. Two exports never share a
//! salt, so identifiers cannot be correlated across requests.
//!
//! [`create_user_ident`] derives the stable identifier stored with a marker
//! when the submitter did not supply one.

use rand::distr::Alphanumeric;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::core::codec::{Row, Value};
use crate::core::encoder::RowTransform;

/// Random characters in a salt, after the leading `_`.
pub const SALT_LEN: usize = 10;

/// Hex encoded SHA-1 of `input`.
fn sha1_hex(input: &[u8]) -> String {
    hex::encode(Sha1::digest(input))
}

/// The stored identifier for a player on a level: `sha1("{username}_{userid}_{levelid}")`.
pub fn create_user_ident(userid: impl std::fmt::Display, username: &str, levelid: i64) -> String {
    sha1_hex(format!("{username}_{userid}_{levelid}").as_bytes())
}

/// # Anonymizer
///
/// Salted identifier hashing for a single export.
#[derive(Debug, Clone)]
pub struct Anonymizer {
    salt: String,
}

impl Anonymizer {
    /// A new anonymiser with a fresh random salt.
    pub fn new() -> Self {
        let random: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(SALT_LEN)
            .map(char::from)
            .collect();
        Self::with_salt(format!("_{random}"))
    }

    /// An anonymiser with a fixed salt. Deterministic, for tests.
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// The salt in use.
    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// `sha1(ident + salt)`, hex encoded.
    pub fn hash_ident(&self, ident: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(ident.as_bytes());
        hasher.update(self.salt.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// A row transform that replaces the first field (the user identifier)
    /// with its salted hash. Non-identifier first fields pass through.
    pub fn into_transform(self) -> RowTransform {
        Box::new(move |mut row: Row| {
            if let Some(Value::Ident(ident)) = row.first_mut() {
                *ident = self.hash_ident(ident);
            }
            row
        })
    }
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENT: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_create_user_ident_is_sha1_of_joined_fields() {
        // sha1("abc")
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        let ident = create_user_ident(42, "player", 7);
        assert_eq!(ident, sha1_hex(b"player_42_7"));
        assert_eq!(ident.len(), 40);
    }

    #[test]
    fn test_salt_shape() {
        let anon = Anonymizer::new();
        assert_eq!(anon.salt().len(), SALT_LEN + 1);
        assert!(anon.salt().starts_with('_'));
        assert!(anon.salt()[1..].chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_hash_is_stable_within_an_export() {
        let anon = Anonymizer::with_salt("_salt");
        assert_eq!(anon.hash_ident(IDENT), anon.hash_ident(IDENT));
        assert_eq!(anon.hash_ident(IDENT), sha1_hex(format!("{IDENT}_salt").as_bytes()));
        assert_ne!(anon.hash_ident(IDENT), Anonymizer::with_salt("_other").hash_ident(IDENT));
    }

    #[test]
    fn test_transform_replaces_only_the_identifier() {
        let anon = Anonymizer::with_salt("_salt");
        let expected = anon.hash_ident(IDENT);
        let mut transform = anon.into_transform();
        let row = transform(vec![Value::from(IDENT), Value::from(3u16), Value::from(1.5f32)]);
        assert_eq!(row[0], Value::Ident(expected));
        assert_eq!(row[1], Value::from(3u16));
        assert_eq!(row[2], Value::from(1.5f32));
    }
}
