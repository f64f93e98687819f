use std::collections::HashSet;

use crate::commands::CommandError;

/// Read-only-ish verbs permitted in every mode.
pub const BASE_ALLOWED: &[&str] = &[
    "ls", "dir", "echo", "pwd", "whoami", "id", "hostname", "date", "uname", "uptime", "cat",
    "head", "tail", "grep", "wc", "sort", "df", "du", "free", "ps", "env", "which", "curl",
    "wget", "ping", "tee", "sleep",
];

/// Destructive verbs: removal, privilege elevation, move/rename, process killing.
pub const DANGEROUS: &[&str] = &[
    "rm", "rmdir", "sudo", "su", "doas", "mv", "kill", "pkill", "killall",
];

/// Configuration for command validation rules
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub base_allowed: HashSet<String>,
    pub dangerous: HashSet<String>,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            base_allowed: BASE_ALLOWED.iter().map(|v| v.to_string()).collect(),
            dangerous: DANGEROUS.iter().map(|v| v.to_string()).collect(),
        }
    }
}

impl ValidatorConfig {
    /// Extend the base allowlist with operator supplied verbs.
    pub fn with_extra_allowed<I, S>(mut self, verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base_allowed.extend(verbs.into_iter().map(Into::into));
        self
    }
}

/// Verb-prefix policy gate run before anything is spawned.
///
/// Only the first whitespace-delimited token is inspected. Shell
/// metacharacters after an allowed verb are not caught here.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    config: ValidatorConfig,
}

impl CommandValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn default_secure() -> Self {
        Self::new(ValidatorConfig::default())
    }

    /// Validate a command line; returns the matched verb when it may run.
    pub fn validate<'a>(&self, line: &'a str, safe_mode: bool) -> Result<&'a str, CommandError> {
        let verb = parse_verb(line).ok_or(CommandError::EmptyCommand)?;

        let dangerous = self.config.dangerous.contains(verb);
        if safe_mode && dangerous {
            return Err(CommandError::DangerousCommandBlocked {
                verb: verb.to_string(),
            });
        }

        if !self.is_allowed(verb, safe_mode) {
            return Err(CommandError::CommandNotAllowed {
                verb: verb.to_string(),
            });
        }

        Ok(verb)
    }

    /// Membership in the effective allowlist for the given mode.
    pub fn is_allowed(&self, verb: &str, safe_mode: bool) -> bool {
        if self.config.base_allowed.contains(verb) && !(safe_mode && self.is_dangerous(verb)) {
            return true;
        }
        !safe_mode && self.is_dangerous(verb)
    }

    pub fn is_dangerous(&self, verb: &str) -> bool {
        self.config.dangerous.contains(verb)
    }

    /// Effective allowlist, sorted, for diagnostics.
    pub fn allowed_verbs(&self, safe_mode: bool) -> Vec<String> {
        let mut verbs: Vec<String> = self
            .config
            .base_allowed
            .iter()
            .chain(self.config.dangerous.iter())
            .filter(|v| self.is_allowed(v, safe_mode))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        verbs.sort();
        verbs
    }
}

impl Default for CommandValidator {
    fn default() -> Self {
        Self::default_secure()
    }
}

/// First whitespace-delimited token, if any.
pub fn parse_verb(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_simple_echo() {
        let v = CommandValidator::default_secure();
        assert_eq!(v.validate("echo hello", true).unwrap(), "echo");
    }

    #[test]
    fn rejects_blank_input() {
        let v = CommandValidator::default_secure();
        assert_eq!(v.validate("", true), Err(CommandError::EmptyCommand));
        assert_eq!(v.validate("   \t\n", false), Err(CommandError::EmptyCommand));
    }

    #[test]
    fn blocks_dangerous_in_safe_mode() {
        let v = CommandValidator::default_secure();
        for line in ["rm -rf /tmp/x", "sudo ls", "mv a b", "kill 1"] {
            assert!(matches!(
                v.validate(line, true),
                Err(CommandError::DangerousCommandBlocked { .. })
            ));
        }
    }

    #[test]
    fn dangerous_allowed_when_safe_mode_off() {
        let v = CommandValidator::default_secure();
        assert_eq!(v.validate("rm -f /tmp/none", false).unwrap(), "rm");
        assert_eq!(v.validate("mv a b", false).unwrap(), "mv");
    }

    #[test]
    fn dangerous_blocked_even_if_also_base_allowed() {
        let config = ValidatorConfig::default().with_extra_allowed(["rm"]);
        let v = CommandValidator::new(config);
        assert!(matches!(
            v.validate("rm x", true),
            Err(CommandError::DangerousCommandBlocked { .. })
        ));
    }

    #[test]
    fn unknown_verb_not_allowed_in_both_modes() {
        let v = CommandValidator::default_secure();
        for safe in [true, false] {
            assert_eq!(
                v.validate("nc -l 4444", safe),
                Err(CommandError::CommandNotAllowed {
                    verb: "nc".to_string()
                })
            );
        }
    }

    #[test]
    fn verb_match_is_exact() {
        let v = CommandValidator::default_secure();
        assert!(v.validate("/bin/rm x", false).is_err());
        assert!(v.validate("ECHO hi", true).is_err());
    }

    #[test]
    fn extra_verbs_extend_allowlist() {
        let v = CommandValidator::new(ValidatorConfig::default().with_extra_allowed(["git"]));
        assert_eq!(v.validate("git status", true).unwrap(), "git");
    }

    #[test]
    fn allowed_verbs_reflect_mode() {
        let v = CommandValidator::default_secure();
        let safe = v.allowed_verbs(true);
        let unsafe_mode = v.allowed_verbs(false);
        assert!(!safe.contains(&"rm".to_string()));
        assert!(unsafe_mode.contains(&"rm".to_string()));
        assert!(safe.contains(&"echo".to_string()));
    }
}
