//! Configuration for the aria CLI conversion service.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Executable names searched on `PATH`, in order.
pub const EXECUTABLE_CANDIDATES: [&str; 6] = [
    "aria_mps",
    "aria_mps.exe",
    "aria_mps.bat",
    "aria-cli",
    "aria-cli.exe",
    "aria-cli.bat",
];

/// Environment variable pointing at the CLI executable.
pub const EXECUTABLE_ENV_VAR: &str = "ARIA_CLI_PATH";

/// Configuration for [`AriaCliService`](super::AriaCliService).
#[derive(Clone, Serialize, Deserialize)]
pub struct AriaConfig {
    /// Explicit CLI path. Falls back to `ARIA_CLI_PATH`, then a `PATH` search.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// How long the auth lock is held after starting a CLI process so
    /// concurrent logins do not race.
    #[serde(default = "default_auth_settle_ms")]
    pub auth_settle_ms: u64,

    /// Lines of CLI output kept for error reports.
    #[serde(default = "default_output_tail_lines")]
    pub output_tail_lines: usize,

    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_auth_settle_ms() -> u64 {
    3_000
}

fn default_output_tail_lines() -> usize {
    50
}

impl Default for AriaConfig {
    fn default() -> Self {
        Self {
            executable: None,
            username: String::new(),
            password: String::new(),
            auth_settle_ms: default_auth_settle_ms(),
            output_tail_lines: default_output_tail_lines(),
            extra_args: Vec::new(),
        }
    }
}

impl AriaConfig {
    pub fn with_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_auth_settle_ms(mut self, ms: u64) -> Self {
        self.auth_settle_ms = ms;
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl std::fmt::Debug for AriaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AriaConfig")
            .field("executable", &self.executable)
            .field("username", &self.username)
            .field("password", &"***")
            .field("auth_settle_ms", &self.auth_settle_ms)
            .field("output_tail_lines", &self.output_tail_lines)
            .field("extra_args", &self.extra_args)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AriaConfig::default();
        assert_eq!(config.auth_settle_ms, 3_000);
        assert!(config.executable.is_none());
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_debug_masks_password() {
        let config = AriaConfig::default().with_credentials("me@example.com", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("***"));
    }
}
