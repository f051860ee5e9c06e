//! POSIX shell quoting for the one boundary that needs a command string.
//!
//! Local execution never goes through a shell. The remote backend's session API
//! accepts only a command line, so argv is quoted here and nowhere else.

use std::collections::BTreeMap;

use super::env::validate_env_key;
use super::error::BoundaryError;

/// Quote a single argument: wrap in single quotes, embedded `'` becomes `'\''`.
pub fn quote_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('\'');
    for ch in arg.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Join `argv` into one shell-safe string. Every element is quoted, even plain words.
pub fn shell_quote<S: AsRef<str>>(argv: &[S]) -> Result<String, BoundaryError> {
    if argv.is_empty() {
        return Err(BoundaryError::EmptyArgv);
    }
    Ok(argv
        .iter()
        .map(|arg| quote_arg(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" "))
}

/// Render `KEY='value'` assignments for a command prefix.
///
/// Every key is validated before anything is assembled.
pub fn env_assignments(env: &BTreeMap<String, String>) -> Result<String, BoundaryError> {
    for key in env.keys() {
        validate_env_key(key)?;
    }
    Ok(env
        .iter()
        .map(|(key, value)| format!("{key}={}", quote_arg(value)))
        .collect::<Vec<_>>()
        .join(" "))
}

#[cfg(test)]
pub(crate) fn split_single_quoted(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\'' => {
                in_word = true;
                for inner in chars.by_ref() {
                    if inner == '\'' {
                        break;
                    }
                    current.push(inner);
                }
            }
            '\\' => {
                in_word = true;
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ' ' => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            other => {
                in_word = true;
                current.push(other);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn quotes_every_element() {
        let quoted = shell_quote(&["echo", "hello world"]).expect("quote");
        assert_eq!(quoted, "'echo' 'hello world'");
    }

    #[test]
    fn escapes_embedded_single_quotes() {
        let quoted = shell_quote(&["it's"]).expect("quote");
        assert_eq!(quoted, r"'it'\''s'");
    }

    #[test]
    fn metacharacters_stay_literal() {
        let argv = ["$(rm -rf /)", "`id`", "a;b", "", "x'y\"z"];
        let quoted = shell_quote(&argv).expect("quote");
        assert_eq!(split_single_quoted(&quoted), argv);
    }

    #[test]
    fn empty_argv_is_rejected() {
        let empty: [&str; 0] = [];
        assert_eq!(shell_quote(&empty), Err(BoundaryError::EmptyArgv));
    }

    #[test]
    fn env_assignments_quote_values_and_reject_bad_keys() {
        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "a b".to_string());
        env.insert("BAR_2".to_string(), "it's".to_string());
        assert_eq!(
            env_assignments(&env).expect("render"),
            r"BAR_2='it'\''s' FOO='a b'"
        );

        env.insert("X;rm".to_string(), "1".to_string());
        assert!(matches!(
            env_assignments(&env),
            Err(BoundaryError::InvalidEnvKey(_))
        ));
    }

    proptest! {
        #[test]
        fn quoting_round_trips_under_posix_rules(
            argv in proptest::collection::vec(r#"[a-zA-Z0-9 '`$"\\;|&*?<>(){}\n-]{0,12}"#, 1..6)
        ) {
            let quoted = shell_quote(&argv).expect("non-empty argv");
            prop_assert_eq!(split_single_quoted(&quoted), argv);
        }
    }
}
