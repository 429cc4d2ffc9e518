//! Configuration types.
//!
//! Everything is read from the environment. Each `from_env()` delegates to a
//! `from_lookup()` that takes a key lookup closure so tests never have to touch
//! the process environment.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default number of messages that forces an immediate flush.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 20;
/// Default silence before a pending batch flushes.
pub const DEFAULT_INACTIVITY_SECS: u64 = 60;
/// Default staleness bound for the oldest pending message.
pub const DEFAULT_MAX_WAIT_SECS: u64 = 300;

const DEFAULT_JUDGE_ENDPOINT: &str = "https://api.openai.com/v1";
const DEFAULT_JUDGE_MODEL: &str = "gpt-4o-mini";
const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RETRY_BASE_SECS: u64 = 20;
const DEFAULT_RETRY_STEP_SECS: u64 = 10;

/// A moderation action that can be enabled or disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Recall,
    Mute,
    Kick,
    Forward,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "recall" | "delete" => Ok(Self::Recall),
            "mute" => Ok(Self::Mute),
            "kick" | "remove" => Ok(Self::Kick),
            "forward" => Ok(Self::Forward),
            other => Err(format!("unknown action '{other}'")),
        }
    }
}

/// The enabled subset of moderation actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSet(HashSet<Action>);

impl ActionSet {
    pub fn all() -> Self {
        Self(
            [Action::Recall, Action::Mute, Action::Kick, Action::Forward]
                .into_iter()
                .collect(),
        )
    }

    pub fn none() -> Self {
        Self(HashSet::new())
    }

    pub fn with(mut self, action: Action) -> Self {
        self.0.insert(action);
        self
    }

    pub fn contains(&self, action: Action) -> bool {
        self.0.contains(&action)
    }

    /// Parse a comma-separated list such as `"recall,mute"`.
    pub fn parse_list(list: &str) -> Result<Self, String> {
        let mut set = HashSet::new();
        for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            set.insert(item.parse::<Action>()?);
        }
        Ok(Self(set))
    }
}

impl Default for ActionSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Batching and dispatch configuration.
#[derive(Debug, Clone)]
pub struct ModerationConfig {
    /// Pending size that forces an immediate flush.
    pub max_batch_size: usize,
    /// Silence after the last message before the pending batch flushes.
    pub inactivity_timeout: Duration,
    /// Upper bound on how long the oldest pending message may wait.
    pub max_batch_wait: Duration,
    /// User ids exempt from moderation.
    pub whitelist: Vec<String>,
    /// Enabled actions.
    pub actions: ActionSet,
    /// Qualified channel ids (`platform:id`) receiving the audit forward.
    pub forward_targets: Vec<String>,
    /// Append a raw rendering of non-text segments to forwarded entries.
    pub forward_raw: bool,
    /// How long shutdown waits for in-flight batches. `None` waits forever.
    pub shutdown_grace: Option<Duration>,
}

impl Default for ModerationConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            inactivity_timeout: Duration::from_secs(DEFAULT_INACTIVITY_SECS),
            max_batch_wait: Duration::from_secs(DEFAULT_MAX_WAIT_SECS),
            whitelist: Vec::new(),
            actions: ActionSet::all(),
            forward_targets: Vec::new(),
            forward_raw: false,
            shutdown_grace: None,
        }
    }
}

impl ModerationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let max_batch_size =
            parse_or(&lookup, "MODERATOR_MAX_BATCH_SIZE", defaults.max_batch_size)?;
        if max_batch_size == 0 {
            return Err(invalid("MODERATOR_MAX_BATCH_SIZE", "must be at least 1"));
        }

        let inactivity_secs =
            parse_or(&lookup, "MODERATOR_INACTIVITY_SECS", DEFAULT_INACTIVITY_SECS)?;
        let max_wait_secs = parse_or(&lookup, "MODERATOR_MAX_WAIT_SECS", DEFAULT_MAX_WAIT_SECS)?;
        if inactivity_secs == 0 {
            return Err(invalid("MODERATOR_INACTIVITY_SECS", "must be positive"));
        }
        if max_wait_secs == 0 {
            return Err(invalid("MODERATOR_MAX_WAIT_SECS", "must be positive"));
        }
        if max_wait_secs < inactivity_secs {
            tracing::warn!(
                inactivity_secs,
                max_wait_secs,
                "Max batch wait is shorter than the inactivity timeout; max wait will always fire first"
            );
        }

        let actions = match lookup("MODERATOR_ACTIONS") {
            Some(list) => ActionSet::parse_list(&list)
                .map_err(|message| invalid("MODERATOR_ACTIONS", &message))?,
            None => defaults.actions,
        };

        let shutdown_grace = match lookup("MODERATOR_SHUTDOWN_GRACE_SECS") {
            Some(raw) => Some(Duration::from_secs(parse_value(
                "MODERATOR_SHUTDOWN_GRACE_SECS",
                &raw,
            )?)),
            None => None,
        };

        Ok(Self {
            max_batch_size,
            inactivity_timeout: Duration::from_secs(inactivity_secs),
            max_batch_wait: Duration::from_secs(max_wait_secs),
            whitelist: split_list(lookup("MODERATOR_WHITELIST")),
            actions,
            forward_targets: split_list(lookup("MODERATOR_FORWARD_TARGETS")),
            forward_raw: parse_or(&lookup, "MODERATOR_FORWARD_RAW", false)?,
            shutdown_grace,
        })
    }

    /// Whether `user_id` is exempt from moderation.
    pub fn is_whitelisted(&self, user_id: &str) -> bool {
        self.whitelist.iter().any(|u| u == user_id)
    }

    /// Whether `channel_id` is one of the audit forward targets.
    pub fn is_forward_target(&self, channel_id: &str) -> bool {
        self.forward_targets.iter().any(|t| t == channel_id)
    }
}

/// LLM judge configuration.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    /// Base URL; requests go to `{endpoint}/chat/completions`.
    pub endpoint: String,
    pub api_key: SecretString,
    pub model: String,
    /// Operator rule text, passed to the model verbatim.
    pub rules: String,
    /// Bound on a single request attempt.
    pub request_timeout: Duration,
    /// Fixed part of the retry delay.
    pub retry_base: Duration,
    /// Added to the retry delay once per consecutive failure.
    pub retry_step: Duration,
}

impl JudgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("JUDGE_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("JUDGE_API_KEY".into()))?;

        let rules = match (lookup("JUDGE_RULES"), lookup("JUDGE_RULES_FILE")) {
            (Some(rules), _) => rules,
            (None, Some(path)) => std::fs::read_to_string(&path)?,
            (None, None) => String::new(),
        };
        if rules.trim().is_empty() {
            tracing::warn!("No moderation rules configured; the judge will rely on its defaults");
        }

        let timeout_secs: u64 =
            parse_or(&lookup, "JUDGE_TIMEOUT_SECS", DEFAULT_JUDGE_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(invalid("JUDGE_TIMEOUT_SECS", "must be positive"));
        }

        Ok(Self {
            endpoint: lookup("JUDGE_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_JUDGE_ENDPOINT.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: SecretString::from(api_key),
            model: lookup("JUDGE_MODEL").unwrap_or_else(|| DEFAULT_JUDGE_MODEL.to_string()),
            rules,
            request_timeout: Duration::from_secs(timeout_secs),
            retry_base: Duration::from_secs(parse_or(
                &lookup,
                "JUDGE_RETRY_BASE_SECS",
                DEFAULT_RETRY_BASE_SECS,
            )?),
            retry_step: Duration::from_secs(parse_or(
                &lookup,
                "JUDGE_RETRY_STEP_SECS",
                DEFAULT_RETRY_STEP_SECS,
            )?),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| invalid(key, &e.to_string()))
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn moderation_defaults_when_env_empty() {
        let config = ModerationConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(config.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(config.max_batch_wait, Duration::from_secs(300));
        assert_eq!(config.actions, ActionSet::all());
        assert!(config.forward_targets.is_empty());
        assert!(config.shutdown_grace.is_none());
    }

    #[test]
    fn moderation_parses_lists_and_actions() {
        let config = ModerationConfig::from_lookup(lookup_from(&[
            ("MODERATOR_MAX_BATCH_SIZE", "5"),
            ("MODERATOR_WHITELIST", "admin, 42 ,"),
            ("MODERATOR_ACTIONS", "recall,forward"),
            ("MODERATOR_FORWARD_TARGETS", "telegram:-100200"),
            ("MODERATOR_FORWARD_RAW", "true"),
            ("MODERATOR_SHUTDOWN_GRACE_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.max_batch_size, 5);
        assert_eq!(config.whitelist, vec!["admin", "42"]);
        assert!(config.is_whitelisted("42"));
        assert!(!config.is_whitelisted("4"));
        assert!(config.actions.contains(Action::Recall));
        assert!(config.actions.contains(Action::Forward));
        assert!(!config.actions.contains(Action::Mute));
        assert!(config.is_forward_target("telegram:-100200"));
        assert!(config.forward_raw);
        assert_eq!(config.shutdown_grace, Some(Duration::from_secs(30)));
    }

    #[test]
    fn moderation_rejects_zero_batch_size() {
        let err = ModerationConfig::from_lookup(lookup_from(&[("MODERATOR_MAX_BATCH_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn moderation_rejects_unknown_action() {
        let err = ModerationConfig::from_lookup(lookup_from(&[("MODERATOR_ACTIONS", "ban")]))
            .unwrap_err();
        assert!(err.to_string().contains("ban"));
    }

    #[test]
    fn moderation_accepts_short_max_wait() {
        let config = ModerationConfig::from_lookup(lookup_from(&[
            ("MODERATOR_INACTIVITY_SECS", "60"),
            ("MODERATOR_MAX_WAIT_SECS", "10"),
        ]))
        .unwrap();
        assert!(config.max_batch_wait < config.inactivity_timeout);
    }

    #[test]
    fn judge_requires_api_key() {
        let err = JudgeConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "JUDGE_API_KEY"));
    }

    #[test]
    fn judge_rejects_zero_timeout() {
        let err = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_API_KEY", "sk-test"),
            ("JUDGE_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "JUDGE_TIMEOUT_SECS"));
    }

    #[test]
    fn judge_trims_endpoint_and_reads_rules() {
        let config = JudgeConfig::from_lookup(lookup_from(&[
            ("JUDGE_API_KEY", "sk-test"),
            ("JUDGE_ENDPOINT", "http://localhost:8000/v1/"),
            ("JUDGE_RULES", "No advertising."),
            ("JUDGE_RETRY_BASE_SECS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.endpoint, "http://localhost:8000/v1");
        assert_eq!(config.api_key.expose_secret(), "sk-test");
        assert_eq!(config.rules, "No advertising.");
        assert_eq!(config.retry_base, Duration::from_secs(1));
        assert_eq!(config.retry_step, Duration::from_secs(DEFAULT_RETRY_STEP_SECS));
    }

    #[test]
    fn action_set_parse_ignores_blanks() {
        let set = ActionSet::parse_list(" mute , ,kick").unwrap();
        assert!(set.contains(Action::Mute));
        assert!(set.contains(Action::Kick));
        assert!(!set.contains(Action::Recall));
    }
}
