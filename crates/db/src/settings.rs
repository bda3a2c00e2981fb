//! Database and session settings

use opal_common::{DbError, Result};
use std::collections::HashMap;
use std::str::FromStr;

/// Database-level settings built from a string property map
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// Per-session query cache capacity; 0 disables the cache
    pub query_cache_size: usize,
    /// Upper bound for any session's query timeout (ms); 0 = unbounded
    pub max_query_timeout: u64,
    /// Lock timeout for new sessions (ms)
    pub default_lock_timeout: u64,
    /// Number of session handler threads
    pub session_handler_count: usize,
    /// Handler selection strategy
    pub session_handler_factory_type: HandlerFactoryType,
    /// Expiry of the per-session cursor cache (ms)
    pub cache_expire_millis: u64,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            query_cache_size: 32,
            max_query_timeout: 0,
            default_lock_timeout: 10_000,
            session_handler_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            session_handler_factory_type: HandlerFactoryType::RoundRobin,
            cache_expire_millis: 3_600_000,
        }
    }
}

impl DbSettings {
    /// Build settings from a property map, falling back to defaults
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut settings = DbSettings::default();
        for (key, value) in properties {
            match key.to_ascii_uppercase().as_str() {
                "QUERY_CACHE_SIZE" => settings.query_cache_size = parse(key, value)?,
                "MAX_QUERY_TIMEOUT" => settings.max_query_timeout = parse(key, value)?,
                "DEFAULT_LOCK_TIMEOUT" => settings.default_lock_timeout = parse(key, value)?,
                "SESSION_HANDLER_COUNT" => {
                    settings.session_handler_count = parse::<usize>(key, value)?.max(1)
                }
                "SESSION_HANDLER_FACTORY_TYPE" => {
                    settings.session_handler_factory_type = value.parse()?
                }
                "CACHE_EXPIRE_MILLIS" => settings.cache_expire_millis = parse(key, value)?,
                _ => {}
            }
        }
        Ok(settings)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| DbError::invalid_value(key, value))
}

/// How a session is assigned to a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerFactoryType {
    RoundRobin,
    Random,
    LoadBalance,
}

impl FromStr for HandlerFactoryType {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "roundrobin" => Ok(HandlerFactoryType::RoundRobin),
            "random" => Ok(HandlerFactoryType::Random),
            "loadbalance" => Ok(HandlerFactoryType::LoadBalance),
            _ => Err(DbError::invalid_value("SESSION_HANDLER_FACTORY_TYPE", s)),
        }
    }
}

/// Session settings recognized by `Session::set_setting`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSetting {
    LockTimeout,
    QueryTimeout,
    Schema,
    SchemaSearchPath,
    Throttle,
    TransactionIsolationLevel,
    ValueVectorFactoryName,
    ExpressionCompileThreshold,
    OlapOperatorFactoryName,
    OlapThreshold,
}

impl SessionSetting {
    /// All settings in their reporting order
    pub fn all() -> &'static [SessionSetting] {
        &[
            SessionSetting::LockTimeout,
            SessionSetting::QueryTimeout,
            SessionSetting::Schema,
            SessionSetting::SchemaSearchPath,
            SessionSetting::Throttle,
            SessionSetting::TransactionIsolationLevel,
            SessionSetting::ValueVectorFactoryName,
            SessionSetting::ExpressionCompileThreshold,
            SessionSetting::OlapOperatorFactoryName,
            SessionSetting::OlapThreshold,
        ]
    }

    pub fn name(self) -> &'static str {
        match self {
            SessionSetting::LockTimeout => "LOCK_TIMEOUT",
            SessionSetting::QueryTimeout => "QUERY_TIMEOUT",
            SessionSetting::Schema => "SCHEMA",
            SessionSetting::SchemaSearchPath => "SCHEMA_SEARCH_PATH",
            SessionSetting::Throttle => "THROTTLE",
            SessionSetting::TransactionIsolationLevel => "TRANSACTION_ISOLATION_LEVEL",
            SessionSetting::ValueVectorFactoryName => "VALUE_VECTOR_FACTORY_NAME",
            SessionSetting::ExpressionCompileThreshold => "EXPRESSION_COMPILE_THRESHOLD",
            SessionSetting::OlapOperatorFactoryName => "OLAP_OPERATOR_FACTORY_NAME",
            SessionSetting::OlapThreshold => "OLAP_THRESHOLD",
        }
    }
}

impl FromStr for SessionSetting {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        SessionSetting::all()
            .iter()
            .copied()
            .find(|setting| setting.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| DbError::invalid_value("session setting", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = DbSettings::default();
        assert_eq!(settings.query_cache_size, 32);
        assert_eq!(settings.default_lock_timeout, 10_000);
        assert!(settings.session_handler_count >= 1);
    }

    #[test]
    fn test_from_properties() {
        let mut props = HashMap::new();
        props.insert("QUERY_CACHE_SIZE".to_string(), "8".to_string());
        props.insert(
            "session_handler_factory_type".to_string(),
            "LoadBalance".to_string(),
        );
        let settings = DbSettings::from_properties(&props).unwrap();
        assert_eq!(settings.query_cache_size, 8);
        assert_eq!(
            settings.session_handler_factory_type,
            HandlerFactoryType::LoadBalance
        );
    }

    #[test]
    fn test_invalid_property_value() {
        let mut props = HashMap::new();
        props.insert("QUERY_CACHE_SIZE".to_string(), "lots".to_string());
        assert!(matches!(
            DbSettings::from_properties(&props),
            Err(DbError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_session_setting_names() {
        assert_eq!(
            "lock_timeout".parse::<SessionSetting>().unwrap(),
            SessionSetting::LockTimeout
        );
        assert!("NO_SUCH_SETTING".parse::<SessionSetting>().is_err());
    }
}
