//! Connection URLs
//!
//! ```text
//! <url> ::= "opal:" ("tcp://" host ":" port | "mem:" | "embed:") "/" dbname ("?" kv ("&" kv)*)?
//! kv    ::= key "=" value
//! ```

use opal_common::{DbError, Result};
use std::collections::HashMap;
use std::fmt;

const URL_PREFIX: &str = "opal:";

/// How the connection reaches its database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionScheme {
    /// Remote server
    Tcp { host: String, port: u16 },
    /// In-memory, in-process
    Mem,
    /// On-disk, in-process
    Embed,
}

/// Parsed connection URL plus session construction state
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    url: String,
    scheme: ConnectionScheme,
    database_name: String,
    properties: HashMap<String, String>,
    user_name: String,
    network_timeout_millis: i64,
}

impl ConnectionInfo {
    /// Parse a connection URL
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| DbError::invalid_value("url", url))?;

        let (scheme, rest) = if let Some(rest) = rest.strip_prefix("tcp://") {
            let slash = rest
                .find('/')
                .ok_or_else(|| DbError::invalid_value("url", url))?;
            let authority = &rest[..slash];
            let colon = authority
                .rfind(':')
                .ok_or_else(|| DbError::invalid_value("url", url))?;
            let host = authority[..colon].to_string();
            let port = authority[colon + 1..]
                .parse::<u16>()
                .map_err(|_| DbError::invalid_value("url", url))?;
            if host.is_empty() {
                return Err(DbError::invalid_value("url", url));
            }
            (ConnectionScheme::Tcp { host, port }, &rest[slash + 1..])
        } else if let Some(rest) = rest.strip_prefix("mem:/") {
            (ConnectionScheme::Mem, rest)
        } else if let Some(rest) = rest.strip_prefix("embed:/") {
            (ConnectionScheme::Embed, rest)
        } else {
            return Err(DbError::invalid_value("url", url));
        };

        let (database_name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        if database_name.is_empty() {
            return Err(DbError::invalid_value("url", url));
        }

        let mut properties = HashMap::new();
        if let Some(query) = query {
            for pair in query.split('&') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| DbError::invalid_value("url", url))?;
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            url: url.to_string(),
            scheme,
            database_name: database_name.to_string(),
            properties,
            user_name: String::new(),
            network_timeout_millis: -1,
        })
    }

    /// Build a TCP URL for the given peer and database
    pub fn tcp_url(host_and_port: &str, database_name: &str) -> String {
        format!("{}tcp://{}/{}", URL_PREFIX, host_and_port, database_name)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn scheme(&self) -> &ConnectionScheme {
        &self.scheme
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Whether the connection is in-process
    pub fn is_embedded(&self) -> bool {
        !matches!(self.scheme, ConnectionScheme::Tcp { .. })
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn set_user_name(&mut self, user_name: impl Into<String>) {
        self.user_name = user_name.into();
    }

    pub fn network_timeout_millis(&self) -> i64 {
        self.network_timeout_millis
    }

    pub fn set_network_timeout_millis(&mut self, millis: i64) {
        self.network_timeout_millis = millis;
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let info = ConnectionInfo::parse("opal:tcp://10.0.0.1:9210/orders?a=1&b=two").unwrap();
        assert_eq!(
            info.scheme(),
            &ConnectionScheme::Tcp {
                host: "10.0.0.1".to_string(),
                port: 9210
            }
        );
        assert_eq!(info.database_name(), "orders");
        assert_eq!(info.properties().get("a").map(String::as_str), Some("1"));
        assert_eq!(info.properties().get("b").map(String::as_str), Some("two"));
        assert!(!info.is_embedded());
    }

    #[test]
    fn test_parse_mem_and_embed() {
        let mem = ConnectionInfo::parse("opal:mem:/test").unwrap();
        assert_eq!(mem.scheme(), &ConnectionScheme::Mem);
        assert_eq!(mem.database_name(), "test");
        assert!(mem.is_embedded());

        let embed = ConnectionInfo::parse("opal:embed:/test").unwrap();
        assert_eq!(embed.scheme(), &ConnectionScheme::Embed);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for url in [
            "tcp://h:1/db",
            "opal:tcp://h/db",
            "opal:tcp://:1/db",
            "opal:tcp://h:x/db",
            "opal:mem:/",
            "opal:mem:/db?novalue",
            "opal:file:/db",
        ] {
            assert!(
                ConnectionInfo::parse(url).is_err(),
                "should reject {:?}",
                url
            );
        }
    }

    #[test]
    fn test_tcp_url_roundtrip() {
        let url = ConnectionInfo::tcp_url("127.0.0.1:9210", "test");
        let info = ConnectionInfo::parse(&url).unwrap();
        assert_eq!(info.database_name(), "test");
    }
}
