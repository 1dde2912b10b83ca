//! Compose file parser

use super::config::ComposeConfig;
use crate::error::{ConvoyError, Result};
use crate::parallel::graph;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// `$$`, `${VAR}`, `${VAR:-default}`, `${VAR-default}`, `${VAR:?err}`, `${VAR?err}` or `$VAR`
static VARIABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(?:(\$)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?])([^}]*))?\}|([A-Za-z_][A-Za-z0-9_]*))",
    )
    .expect("variable pattern is valid")
});

/// Compose file parser
pub struct ComposeParser {
    env: HashMap<String, String>,
}

impl ComposeParser {
    /// Parser interpolating from the process environment
    pub fn new() -> Self {
        Self::with_env(std::env::vars().collect())
    }

    pub fn with_env(env: HashMap<String, String>) -> Self {
        Self { env }
    }

    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Parse compose file from path
    pub fn parse_file(&self, path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvoyError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        self.parse_str(&content)
    }

    /// Parse and interpolate compose file content
    pub fn parse_str(&self, content: &str) -> Result<ComposeConfig> {
        let mut value: Value = serde_yaml::from_str(content)
            .map_err(|e| ConvoyError::ComposeParse(format!("Failed to parse YAML: {}", e)))?;

        if value.is_null() {
            return Ok(ComposeConfig::default());
        }

        self.interpolate(&mut value)?;

        serde_yaml::from_value(value)
            .map_err(|e| ConvoyError::ComposeParse(format!("Invalid compose file: {}", e)))
    }

    /// Parse several compose files, merge them in order and validate the result
    pub fn parse_files(&self, paths: &[PathBuf]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            tracing::debug!("Loading compose file {}", path.display());
            let file_config = self.parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        for warning in Self::validate(&config)? {
            tracing::warn!("{}", warning);
        }

        Ok(config)
    }

    /// Merge two compose configurations. Services present in both are
    /// merged field by field with `overlay` winning.
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            if let Some(existing) = result.services.get_mut(&name) {
                existing.merge(service);
            } else {
                result.services.insert(name, service);
            }
        }

        result
    }

    /// Validate compose configuration, returning warnings for things that
    /// are allowed but probably unintended
    pub fn validate(config: &ComposeConfig) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        for (name, service) in &config.services {
            // Service must have either image or build
            if service.image.is_none() && service.build.is_none() {
                return Err(ConvoyError::ComposeParse(format!(
                    "Service '{}' must have either 'image' or 'build' specified",
                    name
                )));
            }

            for (dep, _) in service.dependencies()? {
                if !config.services.contains_key(&dep) {
                    return Err(ConvoyError::ComposeParse(format!(
                        "Service '{}' depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }

            service.port_mappings()?;
            service.healthcheck()?;
            service.stop_timeout()?;
            service.pull_policy()?;

            if service.container_name.is_some() && service.replicas() > 1 {
                return Err(ConvoyError::InvalidConfig(format!(
                    "Service '{}' sets container_name and can not be scaled beyond 1 container",
                    name
                )));
            }

            if service.replicas() == 0 {
                warnings.push(format!("Service '{}' is scaled to 0 containers", name));
            }
        }

        let names: Vec<&String> = config.services.keys().collect();
        let cycle = graph::find_cycle(&names, |name| {
            config
                .services
                .get(*name)
                .map(|service| {
                    service
                        .dependency_names()
                        .iter()
                        .filter_map(|dep| config.services.get_key_value(dep).map(|(k, _)| k))
                        .collect()
                })
                .unwrap_or_default()
        });
        if let Some(cycle) = cycle {
            let names: Vec<&str> = cycle.iter().map(|name| name.as_str()).collect();
            return Err(ConvoyError::ComposeParse(format!(
                "Circular dependency between services: {}",
                names.join(" -> ")
            )));
        }

        Ok(warnings)
    }

    /// Interpolate environment variables in every string of the document.
    /// Mapping keys are left alone.
    fn interpolate(&self, value: &mut Value) -> Result<()> {
        match value {
            Value::String(s) => {
                *s = interpolate_string(s, &self.env)?;
            }
            Value::Sequence(items) => {
                for item in items {
                    self.interpolate(item)?;
                }
            }
            Value::Mapping(map) => {
                for (_, item) in map.iter_mut() {
                    self.interpolate(item)?;
                }
            }
            Value::Tagged(tagged) => self.interpolate(&mut tagged.value)?,
            Value::Null | Value::Bool(_) | Value::Number(_) => {}
        }
        Ok(())
    }
}

impl Default for ComposeParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Interpolate environment variables in a string
fn interpolate_string(s: &str, env: &HashMap<String, String>) -> Result<String> {
    let mut result = String::with_capacity(s.len());
    let mut last = 0;

    for caps in VARIABLE.captures_iter(s) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        result.push_str(&s[last..whole.start()]);
        result.push_str(&substitute(&caps, env)?);
        last = whole.end();
    }

    result.push_str(&s[last..]);
    Ok(result)
}

fn substitute(caps: &Captures<'_>, env: &HashMap<String, String>) -> Result<String> {
    if caps.get(1).is_some() {
        return Ok("$".to_string());
    }

    let Some(name) = caps.get(2).or_else(|| caps.get(5)).map(|m| m.as_str()) else {
        return Ok(String::new());
    };
    let value = env.get(name);
    let operator = caps.get(3).map(|m| m.as_str());
    let argument = caps.get(4).map_or("", |m| m.as_str());

    // The ':' forms also treat an empty value as unset
    let unset = |strict: bool| match value {
        None => true,
        Some(v) => strict && v.is_empty(),
    };

    match operator {
        Some(op @ (":-" | "-")) => {
            if unset(op == ":-") {
                Ok(argument.to_string())
            } else {
                Ok(value.cloned().unwrap_or_default())
            }
        }
        Some(op @ (":?" | "?")) => {
            if unset(op == ":?") {
                Err(ConvoyError::ComposeParse(format!(
                    "required variable {} is missing a value: {}",
                    name, argument
                )))
            } else {
                Ok(value.cloned().unwrap_or_default())
            }
        }
        _ => match value {
            Some(v) => Ok(v.clone()),
            None => {
                tracing::warn!(
                    "The {} variable is not set. Defaulting to a blank string.",
                    name
                );
                Ok(String::new())
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parser(vars: &[(&str, &str)]) -> ComposeParser {
        ComposeParser::with_env(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn interpolate(s: &str, vars: &[(&str, &str)]) -> Result<String> {
        interpolate_string(s, &parser(vars).env)
    }

    #[test]
    fn test_parse_simple_compose() {
        let yaml = r#"
version: "3.8"
services:
  web:
    image: nginx:latest
    ports:
      - "80:80"
  db:
    image: postgres:13
    environment:
      POSTGRES_PASSWORD: secret
"#;

        let config = parser(&[]).parse_str(yaml).unwrap();
        assert_eq!(config.services.len(), 2);
        assert!(config.services.contains_key("web"));
        assert!(config.services.contains_key("db"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let yaml = r#"
services:
  web:
    image: nginx
    networks: [front]
    restart: always
volumes:
  data: {}
"#;
        let config = parser(&[]).parse_str(yaml).unwrap();
        assert_eq!(config.services["web"].image.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_empty_file() {
        let config = parser(&[]).parse_str("").unwrap();
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_validate_missing_image() {
        let yaml = r#"
services:
  web:
    ports:
      - "80:80"
"#;

        let config = parser(&[]).parse_str(yaml).unwrap();
        let result = ComposeParser::validate(&config);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let yaml = r#"
services:
  web:
    image: nginx
    depends_on: [db]
"#;
        let config = parser(&[]).parse_str(yaml).unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown service 'db'"));
    }

    #[test]
    fn test_validate_cycle() {
        let yaml = r#"
services:
  a:
    image: busybox
    depends_on: [b]
  b:
    image: busybox
    depends_on: [a]
  c:
    image: busybox
"#;
        let config = parser(&[]).parse_str(yaml).unwrap();
        let err = ComposeParser::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Circular dependency"));
    }

    #[test]
    fn test_validate_scaled_container_name() {
        let yaml = r#"
services:
  web:
    image: nginx
    container_name: fixed
    scale: 2
"#;
        let config = parser(&[]).parse_str(yaml).unwrap();
        assert!(ComposeParser::validate(&config).is_err());
    }

    #[test]
    fn test_interpolate() {
        assert_eq!(interpolate("nginx:${TAG}", &[("TAG", "1.0.0")]).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate("nginx:$TAG", &[("TAG", "1.0.0")]).unwrap(), "nginx:1.0.0");
        assert_eq!(interpolate("nginx:${TAG}", &[]).unwrap(), "nginx:");
        assert_eq!(interpolate("cost: $$5", &[]).unwrap(), "cost: $5");
    }

    #[test]
    fn test_interpolate_defaults() {
        assert_eq!(interpolate("${TAG:-latest}", &[]).unwrap(), "latest");
        assert_eq!(interpolate("${TAG:-latest}", &[("TAG", "")]).unwrap(), "latest");
        assert_eq!(interpolate("${TAG-latest}", &[("TAG", "")]).unwrap(), "");
        assert_eq!(interpolate("${TAG-latest}", &[("TAG", "2")]).unwrap(), "2");
    }

    #[test]
    fn test_interpolate_required() {
        let err = interpolate("${DB_URL:?database url}", &[]).unwrap_err();
        assert!(err.to_string().contains("DB_URL"));
        assert_eq!(interpolate("${DB_URL?x}", &[("DB_URL", "")]).unwrap(), "");
    }

    #[test]
    fn test_interpolation_reaches_nested_values() {
        let yaml = r#"
services:
  web:
    image: "app:${TAG}"
    environment:
      - MODE=${MODE:-dev}
    ports:
      - "${PORT}:80"
"#;
        let config = parser(&[("TAG", "3"), ("PORT", "8080")]).parse_str(yaml).unwrap();
        let web = &config.services["web"];
        assert_eq!(web.image.as_deref(), Some("app:3"));
        assert_eq!(web.environment_map()["MODE"], "dev");
        assert_eq!(web.port_mappings().unwrap()[0].host_port, 8080);
    }

    #[test]
    fn test_parse_files_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("compose.yaml");
        let overlay = dir.path().join("compose.override.yaml");

        let mut f = std::fs::File::create(&base).unwrap();
        writeln!(f, "services:\n  web:\n    image: app:1\n  db:\n    image: postgres").unwrap();
        let mut f = std::fs::File::create(&overlay).unwrap();
        writeln!(f, "services:\n  web:\n    image: app:2\n    depends_on: [db]").unwrap();

        let config = parser(&[]).parse_files(&[base, overlay]).unwrap();
        assert_eq!(config.services["web"].image.as_deref(), Some("app:2"));
        assert_eq!(config.services["web"].dependency_names(), vec!["db"]);
        assert_eq!(config.services.len(), 2);
    }

    #[test]
    fn test_find_compose_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ComposeParser::find_compose_file(dir.path()).is_none());

        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let found = ComposeParser::find_compose_file(dir.path()).unwrap();
        assert!(found.ends_with("docker-compose.yml"));
    }
}
