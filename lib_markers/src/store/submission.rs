//! # Submission Validation
//!
//! Turns the loosely typed JSON a game client posts into a [`DeathMarker`].
//! Clients in the wild send numbers as numbers, flags as anything truthy and
//! sometimes leave fields out, so parsing works on a raw
//! [`serde_json::Value`] and applies the same lenient coercions for every
//! field:
//!
//! - `format` must be a number, `1` or `2`.
//! - `levelid` comes from the body, falling back to the query string.
//!   Excluded levels are accepted and skipped.
//! - `levelversion` defaults to `0`; `practice` is any truthy value.
//! - `userident` must be 40 hex characters, or is derived from `playername`
//!   and `userid`.
//! - `percentage` is required and clamped to `0..=99`; `x` and `y` are required.
//! - Format 2 adds `coins` (defaulting to the `coin1..coin3` bitmask) and
//!   `itemdata` (defaulting to `0`).

use serde_json::Value as Json;
use thiserror::Error;

use crate::core::anonymize::create_user_ident;

use super::{DeathMarker, MarkerFormat};

/// Highest percentage a death can be stored with.
pub const MAX_PERCENTAGE: f64 = 99.0;

/// Why a submission was refused. The message is sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The body is not JSON.
    #[error("Wrongly formatted JSON")]
    Json,
    /// No numeric `format` field.
    #[error("Format not supplied")]
    MissingFormat,
    /// A format other than 1 or 2.
    #[error("Unsupported format {0}")]
    UnsupportedFormat(String),
    /// No usable level id in body or query.
    #[error("levelid was not supplied or not numerical")]
    MissingLevelId,
    /// Neither an identifier nor the fields to derive one.
    #[error("Neither userident nor playername and userid were supplied")]
    MissingIdentity,
    /// A supplied identifier that is not 40 hex characters.
    #[error("userident has incorrect length or illegal characters (should be 40 hex characters)")]
    InvalidUserIdent,
    /// A required numeric field is absent or not a number.
    #[error("{0} was not supplied or not numerical")]
    MissingNumber(&'static str),
}

/// Outcome of a valid submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Store this marker.
    Store(DeathMarker),
    /// The level is excluded from collection; nothing is stored.
    Excluded(i32),
}

/// Parses and validates a raw submission body.
///
/// `query_levelid` is the `levelid` query parameter, used when the body has
/// none. `excluded` lists levels that are silently skipped.
///
/// # Errors
/// A [`SubmitError`] describing the first rule the body breaks.
pub fn parse_submission(
    body: &[u8],
    query_levelid: Option<&str>,
    excluded: &[i32],
) -> Result<Submission, SubmitError> {
    let body: Json = serde_json::from_slice(body).map_err(|_| SubmitError::Json)?;

    let format = body.get("format").ok_or(SubmitError::MissingFormat)?;
    let Json::Number(format) = format else {
        return Err(SubmitError::MissingFormat);
    };
    let version = match format.as_u64() {
        Some(v @ (1 | 2)) => v,
        _ => return Err(SubmitError::UnsupportedFormat(format.to_string())),
    };

    let level_id = level_id(body.get("levelid"), query_levelid)?;
    if excluded.contains(&level_id) {
        return Ok(Submission::Excluded(level_id));
    }

    let level_version = number(body.get("levelversion")).unwrap_or(0.0) as i16;
    let practice = truthy(body.get("practice"));

    let userident = match body.get("userident") {
        Some(Json::String(ident)) => {
            if ident.len() != 40 || !ident.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(SubmitError::InvalidUserIdent);
            }
            ident.to_ascii_lowercase()
        }
        _ => {
            let (Some(name), Some(id)) = (body.get("playername"), body.get("userid")) else {
                return Err(SubmitError::MissingIdentity);
            };
            if !truthy(Some(name)) || !truthy(Some(id)) {
                return Err(SubmitError::MissingIdentity);
            }
            create_user_ident(text(id), &text(name), i64::from(level_id))
        }
    };

    let percentage = number(body.get("percentage"))
        .ok_or(SubmitError::MissingNumber("percentage"))?
        .clamp(0.0, MAX_PERCENTAGE)
        .round() as i16;
    let x = number(body.get("x")).ok_or(SubmitError::MissingNumber("x"))? as f32;
    let y = number(body.get("y")).ok_or(SubmitError::MissingNumber("y"))? as f32;

    let format = if version >= 2 {
        let coins = if truthy(body.get("coins")) {
            number(body.get("coins")).unwrap_or(0.0) as i16
        } else {
            ["coin1", "coin2", "coin3"]
                .iter()
                .enumerate()
                .filter(|(_, key)| truthy(body.get(**key)))
                .fold(0i16, |mask, (bit, _)| mask | (1i16 << bit))
        };
        let itemdata = number(body.get("itemdata")).unwrap_or(0.0) as i32;
        MarkerFormat::V2 { coins, itemdata }
    } else {
        MarkerFormat::V1
    };

    Ok(Submission::Store(DeathMarker {
        userident,
        level_id,
        level_version,
        practice,
        x,
        y,
        percentage,
        format,
    }))
}

fn level_id(body: Option<&Json>, query: Option<&str>) -> Result<i32, SubmitError> {
    if truthy(body) {
        return body
            .and_then(Json::as_i64)
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(SubmitError::MissingLevelId);
    }
    query
        .and_then(|q| q.trim().parse::<i32>().ok())
        .ok_or(SubmitError::MissingLevelId)
}

fn number(value: Option<&Json>) -> Option<f64> {
    value.and_then(Json::as_f64)
}

/// Loose truthiness: absent, `null`, `false`, `0` and `""` are false.
fn truthy(value: Option<&Json>) -> bool {
    match value {
        None | Some(Json::Null) => false,
        Some(Json::Bool(b)) => *b,
        Some(Json::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Json::String(s)) => !s.is_empty(),
        Some(Json::Array(_) | Json::Object(_)) => true,
    }
}

/// Strings verbatim, anything else in its JSON form.
fn text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}
