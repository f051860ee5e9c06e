//! Environment variable name validation.

use std::sync::LazyLock;

use regex::Regex;

use super::error::BoundaryError;

static ENV_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key regex"));

/// Accept only `[A-Za-z_][A-Za-z0-9_]*`.
///
/// This is the only defense against name injection once env vars are serialized
/// into a shell prefix, so it runs before any command string is assembled.
pub fn validate_env_key(key: &str) -> Result<(), BoundaryError> {
    if ENV_KEY.is_match(key) {
        Ok(())
    } else {
        Err(BoundaryError::InvalidEnvKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_conventional_names() {
        for key in ["PATH", "_private", "API_KEY_2", "a"] {
            validate_env_key(key).expect(key);
        }
    }

    #[test]
    fn rejects_injection_shapes() {
        for key in ["", "1ABC", "A=B", "A B", "A;B", "$(id)", "A\nB", "A-B", "ÄPFEL"] {
            assert_eq!(
                validate_env_key(key),
                Err(BoundaryError::InvalidEnvKey(key.to_string())),
                "{key:?} should be rejected"
            );
        }
    }
}
