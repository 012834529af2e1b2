use anyhow::Context;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }

    pub fn from_env() -> Self {
        match env_or("ENVIRONMENT", "development").to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Value of `key`, or `default` when unset.
pub fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Value of `key` when set and not blank.
pub fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse `key`, or return `default` when unset. A value that does not parse
/// is an error rather than a silent fallback.
pub fn env_parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, value)),
        None => Ok(default),
    }
}

/// Boolean flag accepting true/false, 1/0, yes/no and on/off.
pub fn env_flag_or(key: &str, default: bool) -> anyhow::Result<bool> {
    let Some(value) = env_opt(key) else {
        return Ok(default);
    };
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => anyhow::bail!("Invalid value for {}: {:?}", key, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set(key: &str, value: &str) {
        unsafe { env::set_var(key, value) };
    }

    fn unset(key: &str) {
        unsafe { env::remove_var(key) };
    }

    #[test]
    #[serial]
    fn test_environment_from_env() {
        set("ENVIRONMENT", "PROD");
        assert_eq!(Environment::from_env(), Environment::Production);

        set("ENVIRONMENT", "staging");
        assert_eq!(Environment::from_env(), Environment::Development);

        unset("ENVIRONMENT");
        assert_eq!(Environment::from_env(), Environment::Development);
        assert_eq!(Environment::Production.as_str(), "production");
    }

    #[test]
    #[serial]
    fn test_env_parse_or() {
        unset("COMMON_TEST_PORT");
        assert_eq!(env_parse_or("COMMON_TEST_PORT", 5037u16).unwrap(), 5037);

        set("COMMON_TEST_PORT", " 6520 ");
        assert_eq!(env_parse_or("COMMON_TEST_PORT", 5037u16).unwrap(), 6520);

        set("COMMON_TEST_PORT", "70000");
        let err = env_parse_or("COMMON_TEST_PORT", 5037u16).unwrap_err();
        assert!(
            err.to_string().contains("COMMON_TEST_PORT"),
            "error should name the variable: {}",
            err
        );
        unset("COMMON_TEST_PORT");
    }

    #[test]
    #[serial]
    fn test_env_flag_or() {
        unset("COMMON_TEST_FLAG");
        assert!(env_flag_or("COMMON_TEST_FLAG", true).unwrap());

        set("COMMON_TEST_FLAG", "No");
        assert!(!env_flag_or("COMMON_TEST_FLAG", true).unwrap());

        set("COMMON_TEST_FLAG", "1");
        assert!(env_flag_or("COMMON_TEST_FLAG", false).unwrap());

        set("COMMON_TEST_FLAG", "maybe");
        assert!(env_flag_or("COMMON_TEST_FLAG", false).is_err());
        unset("COMMON_TEST_FLAG");
    }

    #[test]
    #[serial]
    fn test_blank_values_count_as_unset() {
        set("COMMON_TEST_BLANK", "   ");
        assert_eq!(env_opt("COMMON_TEST_BLANK"), None);
        assert_eq!(env_parse_or("COMMON_TEST_BLANK", 3u32).unwrap(), 3);
        unset("COMMON_TEST_BLANK");
    }
}
