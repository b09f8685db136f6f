//! Configuration: settings and rules, loaded once per invocation.
//!
//! Two TOML files feed the pipeline. `settings.toml` holds credentials and
//! endpoints (with `${VAR}` expansion from the environment); `rules.toml` holds
//! the ordered routing rules. The loaded [`Config`] is immutable and threaded
//! explicitly into every component.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};
use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::llm::{Backend, ProviderRegistry};
use crate::pipeline::types::{DeliveryMode, Rule, RuleAction};

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/mail-agent/settings.toml";
pub const DEFAULT_RULES_PATH: &str = "/etc/mail-agent/rules.toml";

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env var pattern compiles"));

// ── Settings ────────────────────────────────────────────────────────

/// Contents of `settings.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm: LlmSettings,
    pub mail: Option<MailSettings>,
    pub imap: Option<ImapSettings>,
    pub delivery: DeliverySettings,
    pub retry: RetrySettings,
    pub runtime: RuntimeSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub default_provider: String,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            default_provider: "openai".to_string(),
            providers: BTreeMap::new(),
        }
    }
}

/// Per-provider settings. Which fields matter depends on the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<SecretString>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: None,
            base_url: None,
            timeout_secs: 60,
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain SMTP, typical for a local submission port.
    #[default]
    None,
    /// Upgrade with STARTTLS.
    Starttls,
    /// Implicit TLS (port 465).
    Tls,
}

/// Outbound submission (`[mail]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailSettings {
    pub from_address: String,
    pub from_name: Option<String>,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<SecretString>,
    pub tls: SmtpTls,
    pub timeout_secs: u64,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            from_address: String::new(),
            from_name: None,
            smtp_host: "localhost".to_string(),
            smtp_port: 25,
            smtp_user: None,
            smtp_password: None,
            tls: SmtpTls::None,
            timeout_secs: 30,
        }
    }
}

/// Drafts mailbox access (`[imap]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: Option<SecretString>,
    pub drafts_folder: String,
    pub create_folder: bool,
    pub timeout_secs: u64,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 993,
            tls: true,
            username: String::new(),
            password: None,
            drafts_folder: "Drafts".to_string(),
            create_folder: true,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub default_mode: DeliveryMode,
    /// Save to drafts when a send fails. Off unless explicitly enabled.
    pub fallback_to_draft: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Overall invocation deadline. Keep below the transport's own time limit.
    pub deadline_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self { deadline_secs: 90 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

// ── Rules ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

/// A rule as written in `rules.toml`, before pattern compilation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleSpec {
    pub name: Option<String>,
    pub sender_pattern: String,
    pub recipient_filter: Option<String>,
    pub llm_provider: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    pub priority: i64,
    pub system_prompt: Option<String>,
    pub enabled: bool,
    pub headers_match: BTreeMap<String, String>,
    pub action: RuleAction,
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            name: None,
            sender_pattern: ".*".to_string(),
            recipient_filter: None,
            llm_provider: None,
            delivery_mode: None,
            priority: 0,
            system_prompt: None,
            enabled: true,
            headers_match: BTreeMap::new(),
            action: RuleAction::Reply,
        }
    }
}

// ── Config ──────────────────────────────────────────────────────────

/// Everything one invocation needs, loaded up front.
#[derive(Debug, Clone)]
pub struct Config {
    pub settings: Settings,
    pub rule_specs: Vec<RuleSpec>,
    pub settings_path: Option<PathBuf>,
    pub rules_path: Option<PathBuf>,
}

impl Config {
    /// Load settings and rules from disk.
    pub fn load(settings_path: &Path, rules_path: &Path) -> Result<Self, ConfigError> {
        let settings_raw = read_file(settings_path)?;
        let rules_raw = read_file(rules_path)?;
        let mut config = Self::from_toml_strs(&settings_raw, &rules_raw).map_err(|e| match e {
            ConfigError::ParseError { path, message } => ConfigError::ParseError {
                path: match path.as_str() {
                    "settings" => settings_path.display().to_string(),
                    _ => rules_path.display().to_string(),
                },
                message,
            },
            other => other,
        })?;
        config.settings_path = Some(settings_path.to_path_buf());
        config.rules_path = Some(rules_path.to_path_buf());
        Ok(config)
    }

    /// Build a config from in-memory TOML documents.
    pub fn from_toml_strs(settings: &str, rules: &str) -> Result<Self, ConfigError> {
        let mut settings_value: toml::Value =
            toml::from_str(settings).map_err(|e| ConfigError::ParseError {
                path: "settings".into(),
                message: e.to_string(),
            })?;
        expand_env_vars(&mut settings_value);
        let settings: Settings =
            settings_value
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::ParseError {
                    path: "settings".into(),
                    message: e.to_string(),
                })?;

        let rules_file: RulesFile = toml::from_str(rules).map_err(|e| ConfigError::ParseError {
            path: "rules".into(),
            message: e.to_string(),
        })?;

        Ok(Self {
            settings,
            rule_specs: rules_file.rules,
            settings_path: None,
            rules_path: None,
        })
    }

    /// Outbound mail settings, required for any reply.
    pub fn mail(&self) -> Result<&MailSettings, ConfigError> {
        match &self.settings.mail {
            Some(mail) if !mail.from_address.trim().is_empty() => Ok(mail),
            _ => Err(ConfigError::MissingRequired {
                key: "mail.from_address".into(),
                hint: "Set the address replies are sent from.".into(),
            }),
        }
    }

    /// Compile the rules in declaration order.
    ///
    /// Disabled rules are kept: the matcher is responsible for never
    /// selecting them.
    pub fn rules(&self) -> Result<Vec<Rule>, ConfigError> {
        self.rule_specs
            .iter()
            .enumerate()
            .map(|(index, spec)| self.compile_rule(index, spec))
            .collect()
    }

    fn compile_rule(&self, index: usize, spec: &RuleSpec) -> Result<Rule, ConfigError> {
        let name = spec
            .name
            .clone()
            .unwrap_or_else(|| format!("rule-{index}"));

        let sender_pattern = compile_pattern(&name, &spec.sender_pattern)?;
        let recipient_filter = spec
            .recipient_filter
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(|p| compile_pattern(&name, p))
            .transpose()?;
        let headers_match = spec
            .headers_match
            .iter()
            .map(|(header, pattern)| Ok((header.clone(), compile_pattern(&name, pattern)?)))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        Ok(Rule {
            name,
            sender_pattern,
            recipient_filter,
            headers_match,
            provider: spec
                .llm_provider
                .clone()
                .unwrap_or_else(|| self.settings.llm.default_provider.clone()),
            mode: spec
                .delivery_mode
                .unwrap_or(self.settings.delivery.default_mode),
            priority: spec.priority,
            system_prompt: spec.system_prompt.clone().unwrap_or_default(),
            enabled: spec.enabled,
            action: spec.action,
        })
    }

    /// Check the configuration and return every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let settings = &self.settings;

        if let Err(e) = self.mail() {
            errors.push(e.to_string());
        }

        let default_provider = &settings.llm.default_provider;
        if settings.llm.providers.is_empty() {
            errors.push("No LLM providers configured under [llm.providers]".to_string());
        } else if !settings.llm.providers.contains_key(default_provider) {
            errors.push(format!(
                "Default LLM provider '{default_provider}' not configured"
            ));
        }
        for name in settings.llm.providers.keys() {
            if name.parse::<Backend>().is_err() {
                errors.push(format!("Unknown LLM provider '{name}' in [llm.providers]"));
            }
        }

        // Configured but unusable (e.g. `${VAR}` credential with VAR unset).
        let registry = ProviderRegistry::from_settings(&settings.llm);
        let in_use: BTreeSet<&str> = self
            .rule_specs
            .iter()
            .filter(|r| r.enabled && r.action == RuleAction::Reply)
            .map(|r| r.llm_provider.as_deref().unwrap_or(default_provider))
            .chain([default_provider.as_str()])
            .collect();
        for (name, reason) in registry.unavailable() {
            if in_use.contains(name) {
                errors.push(format!("LLM provider '{name}' is unavailable: {reason}"));
            }
        }

        if settings.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if settings.runtime.deadline_secs == 0 {
            errors.push("runtime.deadline_secs must be greater than 0".to_string());
        }

        let needs_imap = settings.delivery.default_mode == DeliveryMode::Draft
            || settings.delivery.fallback_to_draft
            || self
                .rule_specs
                .iter()
                .any(|r| r.enabled && r.delivery_mode == Some(DeliveryMode::Draft));
        if needs_imap && settings.imap.is_none() {
            errors.push("IMAP configuration required for draft delivery mode".to_string());
        }

        if self.rule_specs.is_empty() {
            errors.push("No auto-reply rules defined".to_string());
        }

        for (index, spec) in self.rule_specs.iter().enumerate() {
            if spec.name.as_deref().is_none_or(|n| n.trim().is_empty()) {
                errors.push(format!("Rule {index}: name is required"));
            }
            if spec.action == RuleAction::Reply
                && spec
                    .system_prompt
                    .as_deref()
                    .is_none_or(|p| p.trim().is_empty())
            {
                errors.push(format!("Rule {index}: system_prompt is required"));
            }
            if let Some(provider) = &spec.llm_provider {
                if provider.parse::<Backend>().is_err() {
                    errors.push(format!("Rule {index}: unknown llm_provider '{provider}'"));
                } else if !settings.llm.providers.contains_key(provider) {
                    errors.push(format!(
                        "Rule {index}: llm_provider '{provider}' not configured"
                    ));
                }
            }
            if let Err(e) = self.compile_rule(index, spec) {
                errors.push(format!("Rule {index}: {e}"));
            }
        }

        errors
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Compile a rule pattern with regex search semantics, case-insensitive.
pub fn compile_pattern(rule: &str, pattern: &str) -> Result<Regex, ConfigError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ConfigError::InvalidPattern {
            rule: rule.to_string(),
            source,
        })
}

/// Replace `${VAR}` in every string value. Unset variables become empty.
fn expand_env_vars(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => {
            if ENV_VAR_PATTERN.is_match(s) {
                *s = ENV_VAR_PATTERN
                    .replace_all(s, |caps: &regex::Captures<'_>| {
                        std::env::var(&caps[1]).unwrap_or_default()
                    })
                    .into_owned();
            }
        }
        toml::Value::Array(items) => items.iter_mut().for_each(expand_env_vars),
        toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| expand_env_vars(v)),
        _ => {}
    }
}
