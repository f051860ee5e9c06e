//! Secret redaction for command output and agent transcripts.

use std::collections::BTreeMap;

use regex::Regex;

/// Values shorter than this are never redacted.
pub const MIN_REDACT_LEN: usize = 8;

const SECRET_NAME_SUFFIXES: [&str; 5] = ["KEY", "TOKEN", "SECRET", "PASSWORD", "CREDENTIAL"];

/// Whether an env var name looks like it holds a credential.
pub fn is_secret_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_NAME_SUFFIXES
        .iter()
        .any(|suffix| upper.ends_with(suffix))
}

/// Replace env values found in `text`.
///
/// Values of secret-named vars become `[REDACTED:<NAME>]`; any other value of at
/// least [`MIN_REDACT_LEN`] bytes becomes `[REDACTED]`. Matching is a single
/// left-to-right scan that prefers the longest value at each position, so a
/// long secret is never partially matched by a shorter one sharing its prefix.
pub fn redact(text: &str, env: &BTreeMap<String, String>) -> String {
    let mut replacements: BTreeMap<&str, String> = BTreeMap::new();
    for (name, value) in env {
        if value.len() < MIN_REDACT_LEN {
            continue;
        }
        let tag = if is_secret_name(name) {
            format!("[REDACTED:{name}]")
        } else {
            "[REDACTED]".to_string()
        };
        // A named tag wins over an anonymous one for the same value.
        let entry = replacements.entry(value.as_str()).or_insert(tag.clone());
        if entry.as_str() == "[REDACTED]" {
            *entry = tag;
        }
    }
    if replacements.is_empty() {
        return text.to_string();
    }

    let mut values: Vec<&str> = replacements.keys().copied().collect();
    values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    let pattern = values
        .iter()
        .map(|value| regex::escape(value))
        .collect::<Vec<_>>()
        .join("|");

    match Regex::new(&pattern) {
        Ok(re) => re
            .replace_all(text, |caps: &regex::Captures<'_>| {
                replacements
                    .get(&caps[0])
                    .cloned()
                    .unwrap_or_else(|| "[REDACTED]".to_string())
            })
            .into_owned(),
        // Pattern too large for the regex engine; fall back to sequential replacement.
        Err(_) => {
            let mut out = text.to_string();
            for value in values {
                out = out.replace(value, &replacements[value]);
            }
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn secret_names_get_named_tags() {
        let env = env(&[("GITHUB_TOKEN", "ghp_abcdefgh1234"), ("db_password", "hunter2hunter2")]);
        let out = redact("token=ghp_abcdefgh1234 pw=hunter2hunter2", &env);
        assert_eq!(
            out,
            "token=[REDACTED:GITHUB_TOKEN] pw=[REDACTED:db_password]"
        );
    }

    #[test]
    fn long_values_are_redacted_regardless_of_name() {
        let env = env(&[("WORKSPACE_ID", "ws-0123456789")]);
        assert_eq!(redact("id ws-0123456789.", &env), "id [REDACTED].");
    }

    #[test]
    fn short_values_are_never_redacted() {
        let env = env(&[("API_KEY", "short"), ("MODE", "debug")]);
        assert_eq!(redact("short debug", &env), "short debug");
    }

    #[test]
    fn longest_value_wins_over_shared_prefix() {
        let env = env(&[("A_TOKEN", "abcdefgh"), ("B_TOKEN", "abcdefghijkl")]);
        assert_eq!(redact("abcdefghijkl", &env), "[REDACTED:B_TOKEN]");
        assert_eq!(redact("abcdefgh!", &env), "[REDACTED:A_TOKEN]!");
    }

    #[test]
    fn regex_metacharacters_in_values_are_literal() {
        let env = env(&[("X_SECRET", "a.b*c+d?(e)")]);
        assert_eq!(redact("axbbc a.b*c+d?(e)", &env), "axbbc [REDACTED:X_SECRET]");
    }

    proptest! {
        #[test]
        fn never_leaks_long_values_or_touches_short_ones(
            long in proptest::collection::vec("[a-z0-9]{8,16}", 1..4),
            short in "[A-Z]{1,7}",
            filler in "[ .:=]{0,4}",
        ) {
            let mut vars = BTreeMap::new();
            for (i, value) in long.iter().enumerate() {
                vars.insert(format!("VAR_{i}"), value.clone());
            }
            vars.insert("SHORT_TOKEN".to_string(), short.clone());
            let text = format!("{}{filler}{short}{filler}", long.join(&filler));

            let out = redact(&text, &vars);
            for value in &long {
                prop_assert!(!out.contains(value.as_str()), "leaked {value} in {out}");
            }
            prop_assert!(out.contains(short.as_str()));
        }
    }
}
