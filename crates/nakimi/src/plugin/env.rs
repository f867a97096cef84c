//! Generic environment-variable credentials
//!
//! The `env` namespace holds arbitrary key/value pairs meant to be exported
//! into a shell.

use serde_json::Value;

use super::{ArgSpec, Args, CommandSpec, CredentialRecord, Plugin, PluginFailure};

pub struct EnvPlugin;

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "list",
        description: "List stored variable names",
        args: &[],
    },
    CommandSpec {
        name: "get",
        description: "Print one variable",
        args: &[ArgSpec {
            name: "key",
            help: "Variable name",
            required: true,
        }],
    },
    CommandSpec {
        name: "export",
        description: "Print shell export statements",
        args: &[ArgSpec {
            name: "prefix",
            help: "Only export keys starting with this prefix",
            required: false,
        }],
    },
];

/// Environment variable name for a stored key
fn env_var_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Plugin for EnvPlugin {
    fn namespace(&self) -> &'static str {
        "env"
    }

    fn description(&self) -> &'static str {
        "Arbitrary environment variables"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    fn execute(
        &self,
        command: &str,
        credentials: &CredentialRecord,
        args: &Args,
    ) -> Result<String, PluginFailure> {
        match command {
            "list" => Ok(credentials
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join("\n")),
            "get" => {
                let key = args.get("key").unwrap_or_default();
                credentials
                    .get(key)
                    .map(value_text)
                    .ok_or_else(|| PluginFailure::new(format!("no such key: {}", key)))
            }
            "export" => {
                let prefix = args.get("prefix").unwrap_or_default();
                let lines: Vec<String> = credentials
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| {
                        let escaped = value_text(value).replace('\'', "'\\''");
                        format!("export {}='{}'", env_var_name(key), escaped)
                    })
                    .collect();
                Ok(lines.join("\n"))
            }
            other => Err(PluginFailure::new(format!("unsupported command: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::plugin::{CredentialMap, DispatchError, PluginRegistry};
    use serde_json::json;

    fn credentials() -> CredentialMap {
        serde_json::from_value(json!({
            "env": {
                "github/token": "ghp_example",
                "API_KEY": "it's-quoted",
                "port": 8080
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_env_available_without_required_fields() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        assert!(registry.available_namespaces(&credentials).contains("env"));
    }

    #[test]
    fn test_list_and_get() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let bound = registry.bind(&credentials);

        assert_eq!(
            bound.dispatch("env", "list", &[]).unwrap(),
            "API_KEY\ngithub/token\nport"
        );
        assert_eq!(
            bound.dispatch("env", "get", &["port".to_string()]).unwrap(),
            "8080"
        );
        assert!(matches!(
            bound.dispatch("env", "get", &["missing".to_string()]),
            Err(DispatchError::CommandFailed(m)) if m.contains("missing")
        ));
    }

    #[test]
    fn test_export_quotes_values() {
        let registry = PluginRegistry::builtin();
        let credentials = credentials();
        let bound = registry.bind(&credentials);

        let all = bound.dispatch("env", "export", &[]).unwrap();
        assert!(all.contains("export API_KEY='it'\\''s-quoted'"));
        assert!(all.contains("export GITHUB_TOKEN='ghp_example'"));

        let filtered = bound
            .dispatch("env", "export", &["github".to_string()])
            .unwrap();
        assert_eq!(filtered, "export GITHUB_TOKEN='ghp_example'");
    }
}
