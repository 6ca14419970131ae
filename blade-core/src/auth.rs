//! Server-declared auth policy and the login gate.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthPolicy {
    pub auth_enabled: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Hex SHA-256 of the expected password. Preferred over `password` when present.
    #[serde(default, rename = "passwordSha256")]
    pub password_sha256: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Bypass,
    PromptLogin,
}

/// What to do when the policy itself cannot be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyFailureAction {
    ResumeSilently,
    ShowConnectionError,
}

impl AuthPolicy {
    pub fn decide(&self) -> GateDecision {
        if self.auth_enabled {
            GateDecision::PromptLogin
        } else {
            GateDecision::Bypass
        }
    }

    pub fn verify(&self, username: Option<&str>, password: &str) -> Result<(), CoreError> {
        if !self.auth_enabled {
            return Err(CoreError::AuthNotEnabled);
        }

        if let Some(expected_user) = self.username.as_deref()
            && !expected_user.is_empty()
            && !digests_equal(&sha256(expected_user), &sha256(username.unwrap_or_default()))
        {
            return Err(CoreError::CredentialsRejected);
        }

        let expected = match (&self.password_sha256, &self.password) {
            (Some(hex_digest), _) => decode_digest(hex_digest)?,
            (None, Some(plain)) => sha256(plain),
            (None, None) => return Err(CoreError::CredentialsRejected),
        };

        if digests_equal(&expected, &sha256(password)) {
            Ok(())
        } else {
            Err(CoreError::CredentialsRejected)
        }
    }
}

pub fn on_policy_failure(has_persisted_session: bool) -> PolicyFailureAction {
    if has_persisted_session {
        PolicyFailureAction::ResumeSilently
    } else {
        PolicyFailureAction::ShowConnectionError
    }
}

pub fn password_digest_hex(password: &str) -> String {
    hex::encode(sha256(password))
}

fn sha256(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn decode_digest(hex_digest: &str) -> Result<[u8; 32], CoreError> {
    let bytes = hex::decode(hex_digest.trim()).map_err(|_| CoreError::InvalidDigest)?;
    bytes.try_into().map_err(|_| CoreError::InvalidDigest)
}

fn digests_equal(left: &[u8; 32], right: &[u8; 32]) -> bool {
    left.iter()
        .zip(right.iter())
        .fold(0_u8, |acc, (l, r)| acc | (l ^ r))
        == 0
}
