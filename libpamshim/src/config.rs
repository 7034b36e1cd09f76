// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::env;

use crate::consts::{DEFAULT_LOG_FILTER, DEFAULT_SERVER_BINARY, LOG_ENV_VAR, SERVER_ENV_VAR};

/// Process-level configuration, resolved once from the environment.
///
/// There is no file-based configuration: the shim has no persisted state,
/// so the only thing worth configuring is where to find the server binary
/// and how chatty to be about it.
#[derive(Debug, Clone)]
pub struct ShimConfig {
    pub server_path: String,
    pub log_filter: String,
}

impl ShimConfig {
    pub fn from_env() -> Self {
        ShimConfig {
            server_path: env::var(SERVER_ENV_VAR)
                .unwrap_or_else(|_| DEFAULT_SERVER_BINARY.to_string()),
            log_filter: env::var(LOG_ENV_VAR).unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string()),
        }
    }
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            server_path: DEFAULT_SERVER_BINARY.to_string(),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        // SAFETY: test-only, no other thread in this test binary touches
        // these two variables.
        unsafe {
            env::remove_var(SERVER_ENV_VAR);
            env::remove_var(LOG_ENV_VAR);
        }
        let cfg = ShimConfig::from_env();
        assert_eq!(cfg.server_path, DEFAULT_SERVER_BINARY);
        assert_eq!(cfg.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn reads_overrides() {
        // SAFETY: test-only, no other thread in this test binary touches
        // these two variables.
        unsafe {
            env::set_var(SERVER_ENV_VAR, "/opt/pam/custom_server");
            env::set_var(LOG_ENV_VAR, "libpamshim=trace");
        }
        let cfg = ShimConfig::from_env();
        assert_eq!(cfg.server_path, "/opt/pam/custom_server");
        assert_eq!(cfg.log_filter, "libpamshim=trace");
        unsafe {
            env::remove_var(SERVER_ENV_VAR);
            env::remove_var(LOG_ENV_VAR);
        }
    }
}
