//! Secrets file parsing
//!
//! The secrets file is INI-style with one section per export, holding the
//! credentials used to reach its container.

use ini::Ini;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("secrets parse error: {0}")]
    Parse(String),

    #[error("{0} not found in the secrets file")]
    UnknownExport(String),

    #[error("invalid secrets: {0}")]
    Invalid(String),
}

/// Credentials and options for one export.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub username: String,
    pub password: String,
    pub authurl: String,
    pub read_only: bool,
}

/// Read-only view over the secrets file, in section order.
#[derive(Debug)]
pub struct Secrets {
    exports: Vec<(String, ExportConfig)>,
}

impl Secrets {
    /// Load the secrets file. Sections without their own `authurl` fall
    /// back to `default_authurl`.
    pub fn load<P: AsRef<Path>>(path: P, default_authurl: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o004 != 0 {
            log::warn!(
                "{} is world readable, please consider changing its permissions to 0600",
                path.display()
            );
        }

        let conf = Ini::load_from_file(path).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_ini(&conf, default_authurl)
    }

    /// Parse secrets from a string.
    pub fn parse(content: &str, default_authurl: &str) -> Result<Self, ConfigError> {
        let conf = Ini::load_from_str(content).map_err(|err| ConfigError::Parse(err.to_string()))?;
        Self::from_ini(&conf, default_authurl)
    }

    fn from_ini(conf: &Ini, default_authurl: &str) -> Result<Self, ConfigError> {
        let mut exports = Vec::new();

        for (section, properties) in conf.iter() {
            let name = match section {
                Some(name) => name,
                None => continue,
            };

            let username = properties
                .get("username")
                .ok_or_else(|| ConfigError::Invalid(format!("{}: missing username", name)))?;
            let password = properties
                .get("password")
                .ok_or_else(|| ConfigError::Invalid(format!("{}: missing password", name)))?;
            let authurl = properties.get("authurl").unwrap_or(default_authurl);
            let read_only = properties.get("read-only").map(is_true).unwrap_or(false);

            exports.push((
                name.to_string(),
                ExportConfig {
                    username: username.to_string(),
                    password: password.to_string(),
                    authurl: authurl.to_string(),
                    read_only,
                },
            ));
        }

        Ok(Self { exports })
    }

    /// Credentials for one export.
    pub fn get(&self, name: &str) -> Result<&ExportConfig, ConfigError> {
        self.exports
            .iter()
            .find(|(export, _)| export == name)
            .map(|(_, values)| values)
            .ok_or_else(|| ConfigError::UnknownExport(name.to_string()))
    }

    /// All exports, in the order they appear in the file.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExportConfig)> {
        self.exports
            .iter()
            .map(|(name, values)| (name.as_str(), values))
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

fn is_true(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "yes" | "true" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const AUTH_URL: &str = "https://auth.example.com/v1.0";

    #[test]
    fn test_parse_minimal() {
        let secrets = Secrets::parse(
            r#"
[disk0]
username = account:user
password = secret
"#,
            AUTH_URL,
        )
        .unwrap();

        assert_eq!(secrets.len(), 1);
        let values = secrets.get("disk0").unwrap();
        assert_eq!(values.username, "account:user");
        assert_eq!(values.password, "secret");
        assert_eq!(values.authurl, AUTH_URL);
        assert!(!values.read_only);
    }

    #[test]
    fn test_parse_overrides() {
        let secrets = Secrets::parse(
            r#"
[disk0]
username = u1
password = p1

[disk1]
username = u2
password = p2
authurl = https://other.example.com/v1.0
read-only = yes
"#,
            AUTH_URL,
        )
        .unwrap();

        assert_eq!(secrets.len(), 2);
        let names: Vec<&str> = secrets.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["disk0", "disk1"]);

        let values = secrets.get("disk1").unwrap();
        assert_eq!(values.authurl, "https://other.example.com/v1.0");
        assert!(values.read_only);
    }

    #[test]
    fn test_read_only_spellings() {
        for (spelling, expected) in [
            ("1", true),
            ("yes", true),
            ("TRUE", true),
            ("on", true),
            ("0", false),
            ("no", false),
            ("false", false),
            ("off", false),
        ] {
            let content = format!("[x]\nusername = u\npassword = p\nread-only = {}\n", spelling);
            let secrets = Secrets::parse(&content, AUTH_URL).unwrap();
            assert_eq!(secrets.get("x").unwrap().read_only, expected, "{}", spelling);
        }
    }

    #[test]
    fn test_unknown_export() {
        let secrets = Secrets::parse("[disk0]\nusername = u\npassword = p\n", AUTH_URL).unwrap();
        assert!(matches!(
            secrets.get("nope"),
            Err(ConfigError::UnknownExport(_))
        ));
    }

    #[test]
    fn test_missing_credentials() {
        let result = Secrets::parse("[disk0]\nusername = u\n", AUTH_URL);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[disk0]\nusername = u\npassword = p").unwrap();
        file.flush().unwrap();

        let secrets = Secrets::load(file.path(), AUTH_URL).unwrap();
        assert_eq!(secrets.len(), 1);
    }
}
