//! Gmail OAuth credentials
//!
//! Offline checks of a Google OAuth client and refresh token. Nothing here
//! talks to the network.

use super::{CommandSpec, CredentialRecord, Args, Plugin, PluginFailure};

const CLIENT_ID_SUFFIX: &str = ".apps.googleusercontent.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const MIN_REFRESH_TOKEN_LEN: usize = 20;

pub struct GmailPlugin;

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "health",
        description: "Check that the stored OAuth credentials are well formed",
        args: &[],
    },
    CommandSpec {
        name: "account",
        description: "Show the configured account with secrets masked",
        args: &[],
    },
];

fn field<'a>(credentials: &'a CredentialRecord, name: &str) -> &'a str {
    credentials
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
}

/// Keep the first few characters of a value
fn mask(value: &str) -> String {
    let visible: String = value.chars().take(6).collect();
    if visible.len() == value.len() {
        "*".repeat(value.chars().count())
    } else {
        format!("{}...", visible)
    }
}

impl GmailPlugin {
    fn health(&self, credentials: &CredentialRecord) -> Result<String, PluginFailure> {
        let mut problems = Vec::new();

        if !field(credentials, "client_id").ends_with(CLIENT_ID_SUFFIX) {
            problems.push(format!("client_id does not end with {}", CLIENT_ID_SUFFIX));
        }
        if field(credentials, "client_secret").trim().len() < 8 {
            problems.push("client_secret is too short".to_string());
        }
        let token = field(credentials, "refresh_token");
        if token.len() < MIN_REFRESH_TOKEN_LEN || token.contains(char::is_whitespace) {
            problems.push("refresh_token is malformed".to_string());
        }

        if problems.is_empty() {
            Ok("gmail: credentials look valid".to_string())
        } else {
            Err(PluginFailure::new(format!(
                "gmail credentials are invalid: {}",
                problems.join("; ")
            )))
        }
    }

    fn account(&self, credentials: &CredentialRecord) -> String {
        let email = match field(credentials, "email") {
            "" => "(not recorded)",
            email => email,
        };
        let token_uri = match field(credentials, "token_uri") {
            "" => DEFAULT_TOKEN_URI,
            uri => uri,
        };

        format!(
            "email:     {}\nclient_id: {}\ntoken_uri: {}",
            email,
            mask(field(credentials, "client_id")),
            token_uri
        )
    }
}

impl Plugin for GmailPlugin {
    fn namespace(&self) -> &'static str {
        "gmail"
    }

    fn description(&self) -> &'static str {
        "Gmail OAuth credentials"
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["client_id", "client_secret", "refresh_token"]
    }

    fn commands(&self) -> &'static [CommandSpec] {
        COMMANDS
    }

    fn execute(
        &self,
        command: &str,
        credentials: &CredentialRecord,
        _args: &Args,
    ) -> Result<String, PluginFailure> {
        match command {
            "health" => self.health(credentials),
            "account" => Ok(self.account(credentials)),
            other => Err(PluginFailure::new(format!("unsupported command: {}", other))),
        }
    }
}
