// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;
use serde::{Deserialize, Serialize};
use std::io::Read;

// constants to define default values
const POOL_SIZE: usize = 2;

// helper functions
fn pool_size() -> usize {
    POOL_SIZE
}

fn endpoints() -> Vec<String> {
    Vec::new()
}

fn locator() -> String {
    "round_robin".to_string()
}

// definitions
#[derive(Serialize, Deserialize, Debug)]
pub struct ClientConfig {
    /// endpoints as `host:port` strings; cluster membership is supplied,
    /// not discovered
    #[serde(default = "endpoints")]
    endpoints: Vec<String>,
    /// transports per endpoint
    #[serde(default = "pool_size")]
    pool_size: usize,
    /// one of `round_robin`, `ketama`, `vbucket`
    #[serde(default = "locator")]
    locator: String,

    #[serde(default)]
    connection: Connection,
    #[serde(default)]
    sasl: Sasl,
}

// implementation
impl ClientConfig {
    pub fn load(file: &str) -> Result<Self, std::io::Error> {
        let mut file = std::fs::File::open(file)?;
        let mut content = String::new();
        file.read_to_string(&mut content)?;
        match toml::from_str(&content) {
            Ok(t) => Ok(t),
            Err(e) => {
                error!("{}", e);
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "Error parsing config",
                ))
            }
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn pool_size(&self) -> usize {
        std::cmp::max(self.pool_size, 1)
    }

    pub fn locator(&self) -> &str {
        &self.locator
    }
}

// trait implementations
impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: endpoints(),
            pool_size: pool_size(),
            locator: locator(),
            connection: Connection::default(),
            sasl: Sasl::default(),
        }
    }
}

impl ConnectionConfig for ClientConfig {
    fn connection(&self) -> &Connection {
        &self.connection
    }
}

impl SaslConfig for ClientConfig {
    fn sasl(&self) -> &Sasl {
        &self.sasl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert!(config.endpoints().is_empty());
        assert_eq!(config.pool_size(), 2);
        assert_eq!(config.locator(), "round_robin");
        assert_eq!(config.connection().queue_length(), 0);
        assert!(!config.sasl().enabled());
    }

    #[test]
    fn parse() {
        let config: ClientConfig = toml::from_str(
            r#"
            endpoints = ["127.0.0.1:11211", "127.0.0.1:11212"]
            pool_size = 4
            locator = "ketama"

            [connection]
            pinned_buffer_size = 8192
            queue_length = 128

            [sasl]
            enabled = true
            username = "user"
            password = "pass"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(config.pool_size(), 4);
        assert_eq!(config.locator(), "ketama");
        assert_eq!(config.connection().pinned_buffer_size(), 8192);
        assert_eq!(config.connection().queue_length(), 128);
        assert!(config.sasl().enabled());
        assert_eq!(config.sasl().username(), "user");
    }
}
