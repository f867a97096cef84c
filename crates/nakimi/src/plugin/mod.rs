//! Credential-consuming plugins
//!
//! A plugin owns one namespace of the credential store and exposes named
//! commands. Plugins are registered statically; a plugin is available only
//! when its namespace is present and every required field is non-empty.

pub mod env;
pub mod gmail;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::VaultError;

/// Fields of one namespace
pub type CredentialRecord = Map<String, Value>;

const REDACTED: &str = "[redacted]";
/// Shorter values are too common in ordinary text to redact
const MIN_SCRUB_LEN: usize = 4;

/// Decrypted payload: namespace -> field -> value
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialMap(BTreeMap<String, CredentialRecord>);

impl std::fmt::Debug for CredentialMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.namespaces()).finish()
    }
}

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse decrypted bytes. The top level must map namespaces to objects.
    pub fn from_json(bytes: &[u8]) -> Result<Self, VaultError> {
        serde_json::from_slice(bytes).map_err(|e| {
            VaultError::InvalidInput(format!(
                "credential store must be a JSON object of namespace objects (line {}, column {})",
                e.line(),
                e.column()
            ))
        })
    }

    pub fn to_json(&self) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        serde_json::to_vec_pretty(&self.0)
            .map(Zeroizing::new)
            .map_err(|e| VaultError::InvalidInput(e.to_string()))
    }

    pub fn get(&self, namespace: &str) -> Option<&CredentialRecord> {
        self.0.get(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Set one field, creating the namespace if needed
    pub fn set_field(&mut self, namespace: &str, field: &str, value: Value) {
        self.0
            .entry(namespace.to_string())
            .or_default()
            .insert(field.to_string(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every scalar value long enough to redact, longest first
    fn secret_values(&self) -> Vec<String> {
        let mut values = Vec::new();
        for record in self.0.values() {
            for value in record.values() {
                collect_scalars(value, &mut values);
            }
        }
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        values
    }
}

fn collect_scalars(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if s.chars().count() >= MIN_SCRUB_LEN => out.push(s.clone()),
        Value::Number(n) if n.to_string().len() >= MIN_SCRUB_LEN => out.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|v| collect_scalars(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_scalars(v, out)),
        _ => {}
    }
}

/// Whether a required field counts as present
pub fn field_present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
        Some(_) => true,
    }
}

/// Replace every credential value occurring in `message`
pub fn scrub(message: &str, credentials: &CredentialMap) -> String {
    let mut scrubbed = message.to_string();
    for secret in credentials.secret_values() {
        if scrubbed.contains(&secret) {
            scrubbed = scrubbed.replace(&secret, REDACTED);
        }
    }
    scrubbed
}

/// One positional argument of a command
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ArgSpec {
    pub name: &'static str,
    pub help: &'static str,
    pub required: bool,
}

/// A named operation of a plugin
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub args: &'static [ArgSpec],
}

/// Dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Plugin '{0}' is not available (missing namespace or required credentials)")]
    NamespaceUnavailable(String),

    #[error("Unknown command '{command}' for plugin '{namespace}'")]
    UnknownCommand { namespace: String, command: String },

    #[error("Command failed: {0}")]
    CommandFailed(String),
}

impl DispatchError {
    /// Dispatch failures never clear up on their own
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Failure raised by a plugin handler, before credential scrubbing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginFailure(pub String);

impl PluginFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Bound positional arguments, by name
#[derive(Debug, Default)]
pub struct Args(BTreeMap<&'static str, String>);

impl Args {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }
}

/// A credential consumer
pub trait Plugin: Send + Sync {
    /// Credential namespace this plugin reads
    fn namespace(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Fields that must be present and non-empty
    fn required_fields(&self) -> &'static [&'static str];

    fn commands(&self) -> &'static [CommandSpec];

    /// Run a command. `command` is always one of [`Plugin::commands`].
    fn execute(
        &self,
        command: &str,
        credentials: &CredentialRecord,
        args: &Args,
    ) -> Result<String, PluginFailure>;
}

static BUILTIN_PLUGINS: &[&dyn Plugin] = &[&gmail::GmailPlugin, &env::EnvPlugin];

/// Split `namespace.command`
pub fn split_command(full: &str) -> Option<(&str, &str)> {
    let (namespace, command) = full.split_once('.')?;
    (!namespace.is_empty() && !command.is_empty()).then_some((namespace, command))
}

/// Statically assembled set of plugins
pub struct PluginRegistry {
    plugins: Vec<&'static dyn Plugin>,
}

impl PluginRegistry {
    pub fn builtin() -> Self {
        Self::with_plugins(BUILTIN_PLUGINS.to_vec())
    }

    pub fn with_plugins(plugins: Vec<&'static dyn Plugin>) -> Self {
        Self { plugins }
    }

    /// All registered plugins, available or not
    pub fn plugins(&self) -> impl Iterator<Item = &'static dyn Plugin> + '_ {
        self.plugins.iter().copied()
    }

    pub fn plugin(&self, namespace: &str) -> Option<&'static dyn Plugin> {
        self.plugins().find(|p| p.namespace() == namespace)
    }

    pub fn is_available(&self, plugin: &dyn Plugin, credentials: &CredentialMap) -> bool {
        let Some(record) = credentials.get(plugin.namespace()) else {
            return false;
        };
        plugin
            .required_fields()
            .iter()
            .all(|field| field_present(record.get(*field)))
    }

    /// Namespaces whose plugin can run against `credentials`
    pub fn available_namespaces(&self, credentials: &CredentialMap) -> BTreeSet<String> {
        self.plugins()
            .filter(|p| self.is_available(*p, credentials))
            .map(|p| p.namespace().to_string())
            .collect()
    }

    /// Route a command to its plugin.
    ///
    /// Handler failures come back as `CommandFailed` with every credential
    /// value removed from the message.
    pub fn dispatch(
        &self,
        credentials: &CredentialMap,
        namespace: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, DispatchError> {
        let plugin = self
            .plugin(namespace)
            .filter(|p| self.is_available(*p, credentials))
            .ok_or_else(|| DispatchError::NamespaceUnavailable(namespace.to_string()))?;

        let spec = plugin
            .commands()
            .iter()
            .find(|c| c.name == command)
            .ok_or_else(|| DispatchError::UnknownCommand {
                namespace: namespace.to_string(),
                command: command.to_string(),
            })?;

        let record = credentials
            .get(namespace)
            .ok_or_else(|| DispatchError::NamespaceUnavailable(namespace.to_string()))?;

        let bound = bind_args(namespace, spec, args)
            .map_err(|msg| DispatchError::CommandFailed(scrub(&msg, credentials)))?;

        debug!("Dispatching {}.{}", namespace, command);
        plugin.execute(command, record, &bound).map_err(|failure| {
            info!("{}.{} failed", namespace, command);
            DispatchError::CommandFailed(scrub(&failure.0, credentials))
        })
    }

    /// Fix a credential map for repeated dispatch
    pub fn bind<'a>(&'a self, credentials: &'a CredentialMap) -> BoundRegistry<'a> {
        BoundRegistry {
            registry: self,
            credentials,
        }
    }
}

fn bind_args(namespace: &str, spec: &CommandSpec, args: &[String]) -> Result<Args, String> {
    if args.len() > spec.args.len() {
        return Err(format!(
            "{}.{} takes at most {} argument(s), got {}",
            namespace,
            spec.name,
            spec.args.len(),
            args.len()
        ));
    }

    let mut bound = BTreeMap::new();
    for (i, arg) in spec.args.iter().enumerate() {
        match args.get(i) {
            Some(value) => {
                bound.insert(arg.name, value.clone());
            }
            None if arg.required => {
                return Err(format!("missing required argument '{}'", arg.name));
            }
            None => {}
        }
    }
    Ok(Args(bound))
}

/// A registry bound to one session's credentials
pub struct BoundRegistry<'a> {
    registry: &'a PluginRegistry,
    credentials: &'a CredentialMap,
}

impl<'a> BoundRegistry<'a> {
    pub fn available_namespaces(&self) -> BTreeSet<String> {
        self.registry.available_namespaces(self.credentials)
    }

    /// Commands of every available plugin
    pub fn commands(&self) -> Vec<(&'static dyn Plugin, &'static CommandSpec)> {
        self.registry
            .plugins()
            .filter(|p| self.registry.is_available(*p, self.credentials))
            .flat_map(|p| p.commands().iter().map(move |c| (p, c)))
            .collect()
    }

    pub fn dispatch(
        &self,
        namespace: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, DispatchError> {
        self.registry
            .dispatch(self.credentials, namespace, command, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoPlugin;

    impl Plugin for EchoPlugin {
        fn namespace(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echo test plugin"
        }

        fn required_fields(&self) -> &'static [&'static str] {
            &["token"]
        }

        fn commands(&self) -> &'static [CommandSpec] {
            &[
                CommandSpec {
                    name: "say",
                    description: "Echo a word",
                    args: &[ArgSpec {
                        name: "word",
                        help: "Word to echo",
                        required: true,
                    }],
                },
                CommandSpec {
                    name: "leak",
                    description: "Fail with the token in the message",
                    args: &[],
                },
            ]
        }

        fn execute(
            &self,
            command: &str,
            credentials: &CredentialRecord,
            args: &Args,
        ) -> Result<String, PluginFailure> {
            match command {
                "say" => Ok(args.get("word").unwrap_or_default().to_string()),
                _ => Err(PluginFailure::new(format!(
                    "upstream rejected token {}",
                    credentials["token"].as_str().unwrap_or_default()
                ))),
            }
        }
    }

    static ECHO: EchoPlugin = EchoPlugin;

    fn registry() -> PluginRegistry {
        PluginRegistry::with_plugins(vec![&ECHO as &dyn Plugin])
    }

    fn creds(value: Value) -> CredentialMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_availability_requires_all_fields() {
        let registry = registry();

        for (value, available) in [
            (json!({}), false),
            (json!({"echo": {}}), false),
            (json!({"echo": {"token": ""}}), false),
            (json!({"echo": {"token": null}}), false),
            (json!({"echo": {"token": "t0k3n-secret"}}), true),
        ] {
            let credentials = creds(value.clone());
            assert_eq!(
                registry.available_namespaces(&credentials).contains("echo"),
                available,
                "{value}"
            );
        }
    }

    #[test]
    fn test_dispatch_routes_and_validates() {
        let registry = registry();
        let credentials = creds(json!({"echo": {"token": "t0k3n-secret"}}));
        let bound = registry.bind(&credentials);

        assert_eq!(bound.dispatch("echo", "say", &["hi".to_string()]).unwrap(), "hi");

        assert!(matches!(
            bound.dispatch("echo", "shout", &[]),
            Err(DispatchError::UnknownCommand { .. })
        ));
        assert!(matches!(
            bound.dispatch("nope", "say", &[]),
            Err(DispatchError::NamespaceUnavailable(_))
        ));
        assert!(matches!(
            bound.dispatch("echo", "say", &[]),
            Err(DispatchError::CommandFailed(_))
        ));
        assert!(matches!(
            bound.dispatch("echo", "say", &["a".to_string(), "b".to_string()]),
            Err(DispatchError::CommandFailed(_))
        ));
    }

    #[test]
    fn test_unavailable_namespace_is_not_dispatchable() {
        let registry = registry();
        let credentials = creds(json!({"echo": {"token": ""}}));

        assert_eq!(
            registry.dispatch(&credentials, "echo", "say", &["x".to_string()]),
            Err(DispatchError::NamespaceUnavailable("echo".to_string()))
        );
    }

    #[test]
    fn test_failure_messages_never_contain_credentials() {
        let registry = registry();
        let credentials = creds(json!({"echo": {"token": "t0k3n-secret"}}));

        let err = registry
            .dispatch(&credentials, "echo", "leak", &[])
            .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("t0k3n-secret"));
        assert!(message.contains(REDACTED));
    }

    #[test]
    fn test_scrub_longest_first() {
        let credentials = creds(json!({
            "a": {"short": "abcd", "long": "abcdef", "n": 12345, "empty": ""}
        }));
        assert_eq!(
            scrub("x abcdef y abcd z 12345", &credentials),
            "x [redacted] y [redacted] z [redacted]"
        );
    }

    #[test]
    fn test_scrub_ignores_short_values() {
        let credentials = creds(json!({
            "a": {"retries": 1, "flag": "on", "region": "eu", "token": "t0k3n-secret"}
        }));
        assert_eq!(
            scrub("takes at most 1 argument(s), got t0k3n-secret on eu", &credentials),
            "takes at most 1 argument(s), got [redacted] on eu"
        );
    }

    #[test]
    fn test_credential_map_parsing() {
        let parsed = CredentialMap::from_json(br#"{"gmail": {"client_id": "x"}}"#).unwrap();
        assert_eq!(parsed.namespaces().collect::<Vec<_>>(), vec!["gmail"]);

        assert!(CredentialMap::from_json(b"[1, 2]").is_err());
        assert!(CredentialMap::from_json(br#"{"gmail": "flat"}"#).is_err());
        assert!(CredentialMap::from_json(b"not json").is_err());
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("gmail.unread"), Some(("gmail", "unread")));
        assert_eq!(split_command("gmail"), None);
        assert_eq!(split_command(".x"), None);
        assert_eq!(split_command("x."), None);
    }

    #[test]
    fn test_builtin_plugins() {
        let registry = PluginRegistry::builtin();
        let namespaces: Vec<_> = registry.plugins().map(|p| p.namespace()).collect();
        assert_eq!(namespaces, vec!["gmail", "env"]);
    }
}
