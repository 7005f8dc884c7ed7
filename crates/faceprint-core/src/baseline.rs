//! Object key layout for enrolled faces.
//!
//! ```text
//! face_detection/{user_id}/baseline_{unix_ts}_{run}_{index}.jpg   raw enrollment images
//! face_detection/{user_id}/embedding.npy                          aggregated embedding
//! ```
//!
//! `run` is random per enrollment so two runs in the same second never share
//! an image key.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ROOT_PREFIX: &str = "face_detection";
pub const BASELINE_IMAGE_PREFIX: &str = "baseline_";
pub const EMBEDDING_OBJECT: &str = "embedding.npy";
pub const BASELINE_CONTENT_TYPE: &str = "image/jpeg";
pub const EMBEDDING_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserIdError {
    #[error("user_id is empty")]
    Empty,
    #[error("user_id {0:?} cannot be used as a storage path segment")]
    InvalidCharacters(String),
}

/// A trimmed, non-empty user identifier that is safe to use as one key segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, UserIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(UserIdError::Empty);
        }
        if trimmed.starts_with('.')
            || trimmed.contains(['/', '\\', '\0'])
            || trimmed.chars().any(char::is_control)
        {
            return Err(UserIdError::InvalidCharacters(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `face_detection/{user_id}`
    pub fn root(&self) -> String {
        format!("{ROOT_PREFIX}/{}", self.0)
    }

    /// Key of the aggregated baseline embedding.
    pub fn embedding_key(&self) -> String {
        format!("{}/{EMBEDDING_OBJECT}", self.root())
    }

    /// Key of the `index`-th (1-based) raw image of enrollment run `run` at `unix_ts`.
    pub fn baseline_image_key(&self, unix_ts: i64, run: &str, index: usize) -> String {
        format!("{}/{BASELINE_IMAGE_PREFIX}{unix_ts}_{run}_{index}.jpg", self.root())
    }

    /// Full key for a name returned by listing [`root`](Self::root).
    pub fn object_key(&self, name: &str) -> String {
        format!("{}/{name}", self.root())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for UserId {
    type Error = UserIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(id: UserId) -> Self {
        id.0
    }
}

/// Whether a listed object name is a raw baseline image.
pub fn is_baseline_image(name: &str) -> bool {
    name.starts_with(BASELINE_IMAGE_PREFIX)
}
