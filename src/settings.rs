//! Settings read from the environment
//!
//! Command line flags take precedence; these are the fallbacks.

use crate::error::{ConvoyError, Result};
use crate::parallel::{ExecContext, DEFAULT_PARALLEL_LIMIT};
use crate::progress::AnsiMode;
use std::path::PathBuf;

pub const ENV_PARALLEL_LIMIT: &str = "CONVOY_PARALLEL_LIMIT";
pub const ENV_ANSI: &str = "CONVOY_ANSI";
pub const ENV_PROJECT_NAME: &str = "CONVOY_PROJECT_NAME";
pub const ENV_FILE: &str = "CONVOY_FILE";
pub const ENV_NO_COLOR: &str = "NO_COLOR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub parallel_limit: usize,
    /// `None` when the environment does not choose
    pub ansi: Option<AnsiMode>,
    pub no_color: bool,
    pub project_name: Option<String>,
    pub compose_files: Vec<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            ansi: None,
            no_color: false,
            project_name: None,
            compose_files: Vec::new(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut settings = Settings::default();

        if let Some(value) = get(ENV_PARALLEL_LIMIT) {
            settings.parallel_limit = parse_parallel_limit(&value)?;
        }

        if let Some(value) = get(ENV_ANSI) {
            let mode = value.parse::<AnsiMode>().map_err(|_| {
                ConvoyError::InvalidConfig(format!(
                    "{} must be one of never, always or auto, got \"{}\"",
                    ENV_ANSI, value
                ))
            })?;
            settings.ansi = Some(mode);
        }

        settings.no_color = get(ENV_NO_COLOR).is_some();
        settings.project_name = get(ENV_PROJECT_NAME);
        if let Some(value) = get(ENV_FILE) {
            settings.compose_files = std::env::split_paths(&value).collect();
        }

        Ok(settings)
    }

    /// Install the concurrency limit and ANSI preference on `ctx`. `ansi`
    /// overrides the environment.
    pub fn apply(&self, ctx: &ExecContext, ansi: Option<AnsiMode>) {
        ctx.limit().set(Some(self.parallel_limit));
        let mode = ansi.or(self.ansi).unwrap_or_default();
        ctx.set_ansi_mode(mode, self.no_color);
    }
}

/// Parse a global parallel limit. Values below 2 would let nested runs
/// starve, so they are rejected.
pub fn parse_parallel_limit(value: &str) -> Result<usize> {
    let limit: i64 = value.trim().parse().map_err(|_| {
        ConvoyError::InvalidConfig(format!(
            "{} must be an integer (found: \"{}\")",
            ENV_PARALLEL_LIMIT, value
        ))
    })?;

    if limit <= 1 {
        return Err(ConvoyError::InvalidConfig(format!(
            "{} can not be less than 2",
            ENV_PARALLEL_LIMIT
        )));
    }
    Ok(limit as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<Settings> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let settings = settings(&[]).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.parallel_limit, DEFAULT_PARALLEL_LIMIT);
    }

    #[test]
    fn test_parallel_limit() {
        assert_eq!(settings(&[(ENV_PARALLEL_LIMIT, "8")]).unwrap().parallel_limit, 8);
        assert_eq!(settings(&[(ENV_PARALLEL_LIMIT, " 2 ")]).unwrap().parallel_limit, 2);

        let err = settings(&[(ENV_PARALLEL_LIMIT, "1")]).unwrap_err();
        assert!(err.to_string().contains("CONVOY_PARALLEL_LIMIT can not be less than 2"));
        assert!(settings(&[(ENV_PARALLEL_LIMIT, "0")]).is_err());
        assert!(settings(&[(ENV_PARALLEL_LIMIT, "-3")]).is_err());
        assert!(settings(&[(ENV_PARALLEL_LIMIT, "many")]).is_err());
    }

    #[test]
    fn test_empty_values_are_unset() {
        let settings = settings(&[(ENV_PARALLEL_LIMIT, ""), (ENV_NO_COLOR, "")]).unwrap();
        assert_eq!(settings.parallel_limit, DEFAULT_PARALLEL_LIMIT);
        assert!(!settings.no_color);
    }

    #[test]
    fn test_ansi_and_color() {
        let settings = settings(&[(ENV_ANSI, "never"), (ENV_NO_COLOR, "1")]).unwrap();
        assert_eq!(settings.ansi, Some(AnsiMode::Never));
        assert!(settings.no_color);

        assert!(super::Settings::from_lookup(|key| {
            (key == ENV_ANSI).then(|| "sometimes".to_string())
        })
        .is_err());
    }

    #[test]
    fn test_project_and_files() {
        let settings = settings(&[(ENV_PROJECT_NAME, "shop"), (ENV_FILE, "a.yml")]).unwrap();
        assert_eq!(settings.project_name.as_deref(), Some("shop"));
        assert_eq!(settings.compose_files, vec![PathBuf::from("a.yml")]);
    }

    #[test]
    fn test_apply() {
        let ctx = ExecContext::new();
        let settings = Settings {
            parallel_limit: 5,
            ansi: Some(AnsiMode::Always),
            ..Settings::default()
        };

        settings.apply(&ctx, None);
        assert_eq!(ctx.limit().value(), 5);
        assert_eq!(ctx.ansi_mode(), AnsiMode::Always);

        settings.apply(&ctx, Some(AnsiMode::Never));
        assert_eq!(ctx.ansi_mode(), AnsiMode::Never);
    }
}
