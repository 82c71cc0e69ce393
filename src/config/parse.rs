use super::types::*;
use crate::timeutil;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("unresolved environment variable '{0}' referenced in config")]
    UnresolvedEnv(String),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;
    load_config_str(&yaml_string)
}

/// Parse and validate a config document from a YAML string.
pub fn load_config_str(yaml: &str) -> Result<AppConfig, ConfigError> {
    let mut raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
    resolve_env_placeholders(&mut raw)?;
    let config: AppConfig = serde_yaml::from_value(raw)?;
    validate_config(&config)?;
    Ok(config)
}

/// Replace `${VAR}` placeholders anywhere in the document with the value of
/// the named environment variable. An unset variable is a startup error so
/// that missing secrets never reach the wire as literal placeholders.
fn resolve_env_placeholders(value: &mut serde_yaml::Value) -> Result<(), ConfigError> {
    match value {
        serde_yaml::Value::String(s) => {
            if let Some(name) = s.strip_prefix("${").and_then(|rest| rest.strip_suffix('}')) {
                match std::env::var(name) {
                    Ok(resolved) => *s = resolved,
                    Err(_) => return Err(ConfigError::UnresolvedEnv(name.to_string())),
                }
            }
            Ok(())
        }
        serde_yaml::Value::Sequence(items) => {
            for item in items {
                resolve_env_placeholders(item)?;
            }
            Ok(())
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                resolve_env_placeholders(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.scraper.max_global_concurrency < 1 {
        errors.push("scraper: maxGlobalConcurrency must be >= 1".to_string());
    }
    if config.scraper.default_source_concurrency < 1 {
        errors.push("scraper: defaultSourceConcurrency must be >= 1".to_string());
    }
    if config.scraper.enable_admin_api {
        match &config.scraper.admin_secret_env {
            None => errors.push(
                "scraper: enableAdminApi requires adminSecretEnv to name an environment variable"
                    .to_string(),
            ),
            Some(name) => require_env(name, "scraper.adminSecretEnv", &mut errors),
        }
    }
    if let Some(password_env) = &config.scraper.fingerprint_store.valkey.password {
        require_env(password_env, "fingerprintStore.valkey.password", &mut errors);
    }

    let mut names = HashSet::new();
    for source in &config.sources {
        if !names.insert(source.name.as_str()) {
            errors.push(format!("duplicate source name '{}'", source.name));
        }
        validate_source(source, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_source(source: &SourceConfig, errors: &mut Vec<String>) {
    let prefix = format!("source '{}'", source.name);

    if let Err(e) = timeutil::parse_frequency(&source.frequency) {
        errors.push(format!("{}: {}", prefix, e));
    }

    let scrape = &source.scrape;
    match scrape.mode {
        ScrapeMode::Range => match &scrape.range_keys {
            None => errors.push(format!("{}: range scrape requires rangeKeys", prefix)),
            Some(rk) => {
                if !rk.has_explicit_bounds() && !rk.is_relative() {
                    errors.push(format!(
                        "{}: rangeKeys needs startKey/endKey or a relative unit",
                        prefix
                    ));
                }
                if rk.has_explicit_bounds() && rk.is_relative() {
                    errors.push(format!(
                        "{}: rangeKeys cannot mix explicit bounds with a relative unit",
                        prefix
                    ));
                }
                if rk.is_relative() && scrape.parallel_window.is_some() {
                    errors.push(format!(
                        "{}: parallelWindow does not apply to relative ranges",
                        prefix
                    ));
                }
                if let RelativeValue::Keyword(k) = &rk.value {
                    if k != "from-config" {
                        errors.push(format!(
                            "{}: rangeKeys.value must be an integer or \"from-config\", got '{}'",
                            prefix, k
                        ));
                    }
                }
            }
        },
        ScrapeMode::Instant => {
            if scrape.parallel_window.is_some() {
                errors.push(format!(
                    "{}: parallelWindow is only valid for range scrapes",
                    prefix
                ));
            }
        }
    }
    if let Some(pw) = &scrape.parallel_window {
        if pw.value == 0 {
            errors.push(format!("{}: parallelWindow.value must be >= 1", prefix));
        }
    }
    if scrape.max_concurrency == Some(0) {
        errors.push(format!("{}: maxConcurrency must be >= 1", prefix));
    }

    validate_auth(&prefix, source.auth.as_ref(), errors);

    for (i, rule) in source.filters.drop.iter().enumerate() {
        for predicate in &rule.any {
            validate_predicate(&format!("{}, drop rule {}", prefix, i), predicate, errors);
        }
    }
    for (i, rule) in source.filters.keep.iter().enumerate() {
        for predicate in &rule.all {
            validate_predicate(&format!("{}, keep rule {}", prefix, i), predicate, errors);
        }
    }

    let dd = &source.delta_detection;
    if dd.enabled && dd.fingerprint_mode == FingerprintMode::Keys {
        match &dd.fingerprint_keys {
            Some(keys) if !keys.is_empty() => {}
            _ => errors.push(format!(
                "{}: deltaDetection fingerprintMode=keys requires non-empty fingerprintKeys",
                prefix
            )),
        }
    }

    for hist in &source.histogram_readings {
        if hist.buckets.is_empty() {
            errors.push(format!(
                "{}: histogram '{}' needs at least one bucket boundary",
                prefix, hist.name
            ));
        }
        if hist.buckets.windows(2).any(|w| w[0] >= w[1]) {
            errors.push(format!(
                "{}: histogram '{}' bucket boundaries must be strictly ascending",
                prefix, hist.name
            ));
        }
        if hist.data_key.is_none() && hist.fixed_value.is_none() {
            errors.push(format!(
                "{}: histogram '{}' needs dataKey or fixedValue",
                prefix, hist.name
            ));
        }
    }
    for gauge in &source.gauge_readings {
        if gauge.data_key.is_none() && gauge.fixed_value.is_none() {
            errors.push(format!(
                "{}: gauge '{}' needs dataKey or fixedValue",
                prefix, gauge.name
            ));
        }
    }

    if let Some(field) = &source.log_status_field {
        for (i, rule) in field.rules.iter().enumerate() {
            if rule.match_type == MatchType::Regex {
                match rule.value.as_str() {
                    Some(pattern) => {
                        if let Err(e) = Regex::new(pattern) {
                            errors.push(format!(
                                "{}: logStatusField rule {} has invalid regex '{}': {}",
                                prefix, i, pattern, e
                            ));
                        }
                    }
                    None => errors.push(format!(
                        "{}: logStatusField rule {} regex value must be a string",
                        prefix, i
                    )),
                }
            }
        }
    }
}

fn validate_auth(prefix: &str, auth: Option<&AuthConfig>, errors: &mut Vec<String>) {
    let Some(auth) = auth else { return };
    match auth {
        AuthConfig::Basic {
            username_env,
            password_env,
        } => {
            require_env(username_env, prefix, errors);
            require_env(password_env, prefix, errors);
        }
        AuthConfig::Apikey { key_value_env, .. } => {
            require_env(key_value_env, prefix, errors);
        }
        AuthConfig::Oauth {
            token_env,
            get_token_endpoint,
            token_key,
            username_env,
            password_env,
            ..
        } => {
            let runtime = get_token_endpoint.is_some() && token_key.is_some();
            if token_env.is_none() && !runtime {
                errors.push(format!(
                    "{}: oauth auth requires tokenEnv or getTokenEndpoint + tokenKey",
                    prefix
                ));
            }
            if let Some(name) = token_env {
                require_env(name, prefix, errors);
            }
            if let Some(name) = username_env {
                require_env(name, prefix, errors);
            }
            if let Some(name) = password_env {
                require_env(name, prefix, errors);
            }
        }
        AuthConfig::Azuread {
            client_id_env,
            client_secret_env,
            ..
        } => {
            require_env(client_id_env, prefix, errors);
            require_env(client_secret_env, prefix, errors);
        }
    }
}

fn validate_predicate(context: &str, predicate: &MatchPredicate, errors: &mut Vec<String>) {
    if predicate.match_type == MatchType::Regex {
        let Some(pattern) = predicate.value.as_str() else {
            errors.push(format!("{}: regex predicate value must be a string", context));
            return;
        };
        if let Err(e) = Regex::new(pattern) {
            errors.push(format!("{}: invalid regex '{}': {}", context, pattern, e));
        }
    }
}

fn require_env(name: &str, context: &str, errors: &mut Vec<String>) {
    if std::env::var(name).is_err() {
        errors.push(format!(
            "{}: environment variable '{}' is not set",
            context, name
        ));
    }
}
