// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

// helper functions
fn enabled() -> bool {
    false
}

fn username() -> String {
    String::new()
}

fn password() -> String {
    String::new()
}

// definitions
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Sasl {
    #[serde(default = "enabled")]
    enabled: bool,
    #[serde(default = "username")]
    username: String,
    #[serde(default = "password")]
    password: String,
}

// implementation
impl Sasl {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

// trait implementations
impl Default for Sasl {
    fn default() -> Self {
        Self {
            enabled: enabled(),
            username: username(),
            password: password(),
        }
    }
}

// trait definitions
pub trait SaslConfig {
    fn sasl(&self) -> &Sasl;
}
