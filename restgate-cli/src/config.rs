use serde::Deserialize;

/// YAML configuration file contents.
///
/// The file is optional: a missing file yields defaults, while a present but
/// malformed file is a startup failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Base level filter (trace/debug/info/warn/error). RUST_LOG and the
    /// -v/-q flags take precedence.
    pub level: Option<String>,
}

pub fn load(path: &str) -> Result<Config, String> {
    match std::fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(Config::default()),
        Ok(raw) => serde_yaml::from_str(&raw)
            .map_err(|e| format!("malformed config file '{path}': {e}")),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(e) => Err(format!("failed to read config file '{path}': {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load("/nonexistent/restgate.yml").unwrap();
        assert!(config.logging.level.is_none());
    }

    #[test]
    fn reads_logging_level() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  level: debug").unwrap();
        let config = load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging: [not, a, mapping").unwrap();
        assert!(load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn empty_mapping_is_fine() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{}}").unwrap();
        let config = load(file.path().to_str().unwrap()).unwrap();
        assert!(config.logging.level.is_none());
    }
}
