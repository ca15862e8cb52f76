//! # Configuration
//!
//! All configuration comes from the environment (a `.env` file is read
//! when present). The worker roles only start when the gitops repository
//! and its deploy key are configured; the HTTP API runs either way.

use serde::Serialize;

const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    /// SSH-form gitops repository reference (`org/repo` shorthand or a
    /// full URL). Required for the worker to run.
    pub gitops_repo: String,
    pub gitops_repo_deploy_key_path: String,

    /// Deploy key for git-hosted charts.
    pub github_chart_access_deploy_key_path: String,

    /// Where mirrored source repositories live for branch-deletion
    /// detection.
    pub repo_cache_path: String,

    pub database: Database,
    pub notifications: Notifications,
    pub logging: Logging,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Database {
    pub driver: String,
    pub config: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Notifications {
    pub provider: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub default_channel: String,
    /// `env=channel,env=channel` pairs routing messages per environment.
    pub channel_mapping: String,
    pub send_progressing: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Logging {
    pub debug: bool,
    pub trace: bool,
    pub color: bool,
    pub pretty: bool,
    pub text: bool,
}

impl Config {
    /// Reads the settings from the environment and applies defaults.
    pub fn from_env() -> Config {
        let mut config = Config {
            host: env_string("HOST"),
            port: std::env::var("PORT")
                .ok()
                .and_then(|port| port.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            gitops_repo: env_string("GITOPS_REPO"),
            gitops_repo_deploy_key_path: env_string("GITOPS_REPO_DEPLOY_KEY_PATH"),
            github_chart_access_deploy_key_path: env_string("GITHUB_CHART_ACCESS_DEPLOY_KEY_PATH"),
            repo_cache_path: env_string("REPO_CACHE_PATH"),
            database: Database {
                driver: env_string("DATABASE_DRIVER"),
                config: env_string("DATABASE_CONFIG"),
            },
            notifications: Notifications {
                provider: env_string("NOTIFICATIONS_PROVIDER"),
                token: env_string("NOTIFICATIONS_TOKEN"),
                default_channel: env_string("NOTIFICATIONS_DEFAULT_CHANNEL"),
                channel_mapping: env_string("NOTIFICATIONS_CHANNEL_MAPPING"),
                send_progressing: env_bool("NOTIFICATIONS_SEND_PROGRESSING"),
            },
            logging: Logging {
                debug: env_bool("DEBUG"),
                trace: env_bool("TRACE"),
                color: env_bool("LOGS_COLOR"),
                pretty: env_bool("LOGS_PRETTY"),
                text: env_bool("LOGS_TEXT"),
            },
        };
        config.apply_defaults();
        config
    }

    fn apply_defaults(&mut self) {
        if self.database.driver.is_empty() {
            self.database.driver = "sqlite3".to_string();
        }
        if self.database.config.is_empty() {
            self.database.config = "gimletd.sqlite".to_string();
        }
    }

    /// True once both the repository and its deploy key are set; the
    /// worker does not run without them.
    pub fn gitops_repo_configured(&self) -> bool {
        !self.gitops_repo.is_empty() && !self.gitops_repo_deploy_key_path.is_empty()
    }

    /// The configuration in YAML, for trace-level startup logging.
    /// Secrets are not serialized.
    pub fn as_string(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}

fn env_bool(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_defaults() {
        let mut config = Config::default();
        config.apply_defaults();
        assert_eq!("sqlite3", config.database.driver);
        assert_eq!("gimletd.sqlite", config.database.config);
    }

    #[test]
    fn test_gitops_repo_configured() {
        let mut config = Config::default();
        assert!(!config.gitops_repo_configured());

        config.gitops_repo = "acme/gitops".to_string();
        assert!(!config.gitops_repo_configured());

        config.gitops_repo_deploy_key_path = "/deploy/key".to_string();
        assert!(config.gitops_repo_configured());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let config = Config {
            notifications: Notifications {
                token: "xoxb-secret".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!config.as_string().contains("xoxb-secret"));
    }
}
