//! nakimi - Credential vault with session-scoped plaintext
//!
//! Commands:
//! - init [--force]: Generate the identity key pair
//! - key: Show the public key
//! - set <NAMESPACE> <FIELD> [VALUE]: Store one credential field
//! - encrypt <PATH> / decrypt <PATH>: Encrypt or decrypt files
//! - session start | end: Run a shell with decrypted credentials, sweep leftovers
//! - dispatch <NAMESPACE>.<COMMAND> [ARGS]: Run a plugin command
//! - plugins [list | commands]: Show what the current credentials enable
//! - hardware status | setup | wrap-key: YubiKey key wrapping
//! - serve: MCP server exposing plugin commands as tools

use anyhow::{anyhow, bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use nakimi::mcp::McpServer;
use nakimi::plugin::{field_present, split_command};
use nakimi::storage::shred_file;
use nakimi::{
    install_signal_handlers, CleanupRegistry, CredentialMap, PluginRegistry, SessionManager,
    Vault, VaultError, YubikeyPiv,
};
use nakimi_core::config::ENV_SESSION_FILE;
use nakimi_core::{Config, FileConfig};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Exit code for errors that may clear up on retry (EX_TEMPFAIL)
const EXIT_RETRYABLE: i32 = 75;
/// Exit code for errors a retry cannot fix
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "nakimi")]
#[command(about = "Credential vault - decrypts secrets only for the lifetime of a session")]
#[command(version)]
#[command(after_help = r#"CREDENTIAL LAYOUT:
    The store is one JSON object of namespaces, each a map of fields:
    {"gmail": {"client_id": "...", "client_secret": "...", "refresh_token": "..."},
     "env":   {"OPENAI_API_KEY": "..."}}

SECURITY:
    - Encrypted with age (X25519 + ChaCha20-Poly1305)
    - Plaintext only exists on RAM-backed storage for the session lifetime
    - Identity key can be wrapped by a YubiKey (nakimi hardware setup)

SHORTHAND:
    nakimi gmail.health     same as: nakimi dispatch gmail.health"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the identity key pair
    Init {
        /// Discard an existing key pair (and its backup) first
        #[arg(long)]
        force: bool,
    },

    /// Show the public key
    Key,

    /// Store one credential field (prompts securely if value not provided)
    Set {
        /// Credential namespace (e.g., gmail, env)
        namespace: String,
        /// Field name within the namespace
        field: String,
        /// Field value (omit for secure hidden prompt)
        value: Option<String>,
    },

    /// Encrypt a file (default output: the credential store)
    Encrypt {
        /// Plaintext file
        path: PathBuf,
        /// Write the ciphertext here instead of the credential store
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Securely remove the plaintext afterwards
        #[arg(long)]
        shred: bool,
    },

    /// Decrypt a file (default output: stdout)
    Decrypt {
        /// Encrypted file
        path: PathBuf,
        /// Write the plaintext here (created owner-only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start or clean up sessions
    #[command(subcommand)]
    Session(SessionCommands),

    /// Run a plugin command: <namespace>.<command> [args...]
    Dispatch {
        /// Command in namespace.command form (e.g., gmail.health)
        command: String,
        /// Positional arguments for the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Show plugins and their commands
    Plugins {
        #[command(subcommand)]
        action: Option<PluginCommands>,
        /// Output as JSON for scripting
        #[arg(long, global = true)]
        json: bool,
    },

    /// YubiKey key wrapping
    #[command(subcommand)]
    Hardware(HardwareCommands),

    /// Serve plugin commands as MCP tools over stdio
    Serve,

    #[command(external_subcommand)]
    External(Vec<String>),
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Decrypt the store and run a shell (or command) with access to it
    Start {
        /// Run an interactive shell (default)
        #[arg(long, conflicts_with = "exec")]
        shell: bool,
        /// Run this command instead of a shell
        #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "CMD")]
        exec: Vec<String>,
    },

    /// Remove artifacts left behind by sessions that did not end cleanly
    End,
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List plugins and whether the stored credentials enable them
    List,
    /// List every runnable namespace.command
    Commands,
}

#[derive(Subcommand)]
enum HardwareCommands {
    /// Show tool, device and slot status
    Status {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Enable YubiKey wrapping and save the settings
    Setup {
        /// PIV slot holding the age identity
        #[arg(long)]
        slot: Option<String>,
        /// Do not require a touch per decryption
        #[arg(long)]
        no_touch: bool,
        /// Do not prompt for the PIN
        #[arg(long)]
        no_pin_prompt: bool,
        /// Generate a new identity in the slot
        #[arg(long)]
        generate: bool,
    },

    /// Wrap the identity key with the token, keeping a plain backup
    WrapKey,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            exit_code(&e)
        }
    };

    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let registry = CleanupRegistry::global();
    install_signal_handlers(registry.clone()).context("Failed to install signal handlers")?;

    let config = Config::load()?;
    let vault = Vault::new(config, registry.clone());

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(0);
    };

    match command {
        Commands::Init { force } => cmd_init(&vault, force)?,
        Commands::Key => cmd_key(&vault)?,
        Commands::Set {
            namespace,
            field,
            value,
        } => cmd_set(&vault, &namespace, &field, value)?,
        Commands::Encrypt {
            path,
            output,
            shred,
        } => cmd_encrypt(&vault, &path, output.as_deref(), shred)?,
        Commands::Decrypt { path, output } => cmd_decrypt(&vault, &path, output.as_deref())?,
        Commands::Session(SessionCommands::Start { exec, .. }) => {
            return cmd_session_start(&vault, registry, &exec)
        }
        Commands::Session(SessionCommands::End) => cmd_session_end(&vault)?,
        Commands::Dispatch { command, args } => cmd_dispatch(&vault, &command, &args)?,
        Commands::Plugins { action, json } => match action {
            Some(PluginCommands::Commands) => cmd_plugin_commands(&vault, json)?,
            Some(PluginCommands::List) | None => cmd_plugin_list(&vault, json)?,
        },
        Commands::Hardware(HardwareCommands::Status { json }) => cmd_hardware_status(&vault, json)?,
        Commands::Hardware(HardwareCommands::Setup {
            slot,
            no_touch,
            no_pin_prompt,
            generate,
        }) => cmd_hardware_setup(&vault, registry, slot, !no_touch, !no_pin_prompt, generate)?,
        Commands::Hardware(HardwareCommands::WrapKey) => cmd_hardware_wrap_key(&vault)?,
        Commands::Serve => cmd_serve(&vault)?,
        Commands::External(args) => {
            let (full, rest) = args
                .split_first()
                .ok_or_else(|| anyhow!("Command required"))?;
            if split_command(full).is_none() {
                bail!("Unknown command: {} (see nakimi --help)", full);
            }
            cmd_dispatch(&vault, full, rest)?
        }
    }

    Ok(0)
}

/// Map an error to the process exit code
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<VaultError>() {
        Some(e) if e.is_retryable() => EXIT_RETRYABLE,
        Some(_) => EXIT_FATAL,
        None => 1,
    }
}

/// Generate the identity key pair
fn cmd_init(vault: &Vault, force: bool) -> Result<()> {
    println!("info: Generating new identity key...");
    let pair = vault.init(force)?;

    println!("success: Vault initialized");
    println!();
    println!("Your public key:");
    println!("  {}", pair.public);
    println!();
    println!("Store credentials with: nakimi set <namespace> <field>");

    Ok(())
}

/// Show public key
fn cmd_key(vault: &Vault) -> Result<()> {
    println!("{}", vault.public_key()?);
    Ok(())
}

/// Store one credential field
fn cmd_set(vault: &Vault, namespace: &str, field: &str, value: Option<String>) -> Result<()> {
    let secret_value = match value {
        Some(v) => Zeroizing::new(v),
        None => {
            let password = Zeroizing::new(
                rpassword::prompt_password(format!("Enter value for {}.{}: ", namespace, field))
                    .context("Failed to read value")?,
            );

            if password.is_empty() {
                bail!("Empty value not allowed");
            }

            password
        }
    };

    vault.set_field(namespace, field, Value::String(secret_value.to_string()), None)?;

    println!("success: Stored {}.{}", namespace, field);

    Ok(())
}

/// Encrypt a file
fn cmd_encrypt(vault: &Vault, path: &Path, output: Option<&Path>, shred: bool) -> Result<()> {
    let plaintext = Zeroizing::new(
        fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?,
    );

    let target = match output {
        Some(out) => out.to_path_buf(),
        None => {
            CredentialMap::from_json(&plaintext)
                .context("The credential store must be a JSON object of namespaces")?;
            vault.config().secrets_file.clone()
        }
    };

    vault.encrypt(&plaintext)?.write(&target)?;
    println!("success: Encrypted {} -> {}", path.display(), target.display());

    if shred {
        shred_file(path).with_context(|| format!("Failed to remove {}", path.display()))?;
        println!("info: Removed plaintext {}", path.display());
    }

    Ok(())
}

/// Decrypt a file to stdout or an owner-only file
fn cmd_decrypt(vault: &Vault, path: &Path, output: Option<&Path>) -> Result<()> {
    let plaintext = vault.decrypt_file(path, None)?;

    match output {
        Some(out) => {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            file.set_permissions(fs::Permissions::from_mode(0o600))?;
            file.write_all(&plaintext)?;
            eprintln!("success: Decrypted {} -> {}", path.display(), out.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&plaintext)?;
            stdout.flush()?;
        }
    }

    Ok(())
}

/// Run a shell or command against a live session, then end it
fn cmd_session_start(vault: &Vault, registry: Arc<CleanupRegistry>, exec: &[String]) -> Result<i32> {
    let mut manager = vault.session_manager();
    let session = manager.start()?;

    let (program, args) = match exec.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => (
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            Vec::new(),
        ),
    };

    println!(
        "info: Session {} active ({} namespace(s), {} storage)",
        session.id(),
        session.credentials().namespaces().count(),
        session.artifact().medium().as_str()
    );
    println!("info: {} is set for child processes", ENV_SESSION_FILE);

    let child = Command::new(&program)
        .args(&args)
        .env(ENV_SESSION_FILE, session.artifact_path())
        .spawn();

    let status = child.and_then(|mut child| {
        registry.track_child(child.id());
        let status = child.wait();
        registry.untrack_child(child.id());
        status
    });

    if registry.is_purging() {
        // The signal thread destroys the artifact and exits with 128 + signo
        loop {
            std::thread::park();
        }
    }

    let ended = manager.end();
    let status = status.with_context(|| format!("Failed to run {}", program))?;
    ended?;

    println!("success: Session ended");

    Ok(status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0)))
}

/// Remove leftover artifacts
fn cmd_session_end(vault: &Vault) -> Result<()> {
    if vault.config().session_file.is_some() {
        println!("warning: Running inside a session; its artifact is removed too");
    }

    let removed = vault.storage().sweep_stale()?;

    if removed.is_empty() {
        println!("info: No leftover session artifacts");
        return Ok(());
    }

    for path in &removed {
        println!("  {}", path.display());
    }
    println!("success: Removed {} artifact(s)", removed.len());

    Ok(())
}

/// Run one plugin command
fn cmd_dispatch(vault: &Vault, full: &str, args: &[String]) -> Result<()> {
    let (namespace, command) = split_command(full)
        .ok_or_else(|| anyhow!("Expected <namespace>.<command>, got '{}'", full))?;
    let plugins = PluginRegistry::builtin();

    let output = match &vault.config().session_file {
        Some(path) => {
            let credentials = read_session_file(path)?;
            plugins.dispatch(&credentials, namespace, command, args)
        }
        None => {
            let mut manager = vault.session_manager();
            let session = manager.start()?;
            let output = plugins.dispatch(session.credentials(), namespace, command, args);
            manager.end()?;
            output
        }
    }
    .map_err(VaultError::from)?;

    println!("{}", output);

    Ok(())
}

/// Credentials of the session this process was started from
fn read_session_file(path: &Path) -> Result<CredentialMap> {
    let bytes = Zeroizing::new(
        fs::read(path).with_context(|| format!("Session artifact {} is gone", path.display()))?,
    );
    Ok(CredentialMap::from_json(&bytes)?)
}

/// Credentials for read-only listings; no artifact is written
fn current_credentials(vault: &Vault) -> Result<CredentialMap> {
    match &vault.config().session_file {
        Some(path) => read_session_file(path),
        None => Ok(vault.load_credentials(None)?),
    }
}

/// List plugins and availability
fn cmd_plugin_list(vault: &Vault, json: bool) -> Result<()> {
    let credentials = current_credentials(vault)?;
    let plugins = PluginRegistry::builtin();

    if json {
        let available: Vec<String> = plugins.available_namespaces(&credentials).into_iter().collect();
        println!("{}", serde_json::to_string_pretty(&available)?);
        return Ok(());
    }

    println!("Plugins");
    println!();

    for plugin in plugins.plugins() {
        let record = credentials.get(plugin.namespace());
        let missing: Vec<&str> = plugin
            .required_fields()
            .iter()
            .copied()
            .filter(|field| !field_present(record.and_then(|r| r.get(*field))))
            .collect();

        let state = if record.is_none() {
            "not configured".to_string()
        } else if missing.is_empty() {
            "available".to_string()
        } else {
            format!("missing: {}", missing.join(", "))
        };

        println!("  {:<8} {:<40} {}", plugin.namespace(), plugin.description(), state);
    }

    Ok(())
}

/// List runnable commands
fn cmd_plugin_commands(vault: &Vault, json: bool) -> Result<()> {
    let credentials = current_credentials(vault)?;
    let plugins = PluginRegistry::builtin();
    let bound = plugins.bind(&credentials);
    let commands = bound.commands();

    if json {
        let names: Vec<String> = commands
            .iter()
            .map(|(p, c)| format!("{}.{}", p.namespace(), c.name))
            .collect();
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    if commands.is_empty() {
        println!("No plugins available. Add credentials with: nakimi set <namespace> <field>");
        return Ok(());
    }

    for (plugin, command) in commands {
        let usage: Vec<String> = command
            .args
            .iter()
            .map(|a| {
                if a.required {
                    format!("<{}>", a.name)
                } else {
                    format!("[{}]", a.name)
                }
            })
            .collect();
        let name = format!("{}.{} {}", plugin.namespace(), command.name, usage.join(" "));
        println!("  {:<28} {}", name.trim_end(), command.description);
    }

    Ok(())
}

/// Show token status
fn cmd_hardware_status(vault: &Vault, json: bool) -> Result<()> {
    let status = vault.key_wrapper().status();

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let yes_no = |b: bool| if b { "yes" } else { "no" };

    println!("Hardware ({})", status.device);
    println!();
    println!("  Enabled:          {}", yes_no(vault.config().hardware.enabled));
    println!("  ykman:            {}", yes_no(status.manager_installed));
    println!("  age plugin:       {}", yes_no(status.plugin_installed));
    println!("  Device present:   {}", yes_no(status.present));
    println!("  Slot:             {}", status.slot);
    println!("  Require touch:    {}", yes_no(status.require_touch));
    println!("  PIN prompt:       {}", yes_no(status.pin_prompt));

    if vault.keystore().is_initialized() {
        let wrapped = vault.keystore().is_wrapped()?;
        println!("  Key wrapped:      {}", yes_no(wrapped));
    }

    if !status.slot_info.is_empty() {
        println!();
        println!("Slot info");
        for (key, value) in &status.slot_info {
            println!("  {}: {}", key, value);
        }
    }

    if let Some(detail) = &status.detail {
        println!();
        println!("warning: {}", detail);
    }

    Ok(())
}

/// Enable wrapping and persist the settings
fn cmd_hardware_setup(
    vault: &Vault,
    registry: Arc<CleanupRegistry>,
    slot: Option<String>,
    require_touch: bool,
    pin_prompt: bool,
    generate: bool,
) -> Result<()> {
    let mut config = vault.config().clone();
    config.hardware.enabled = true;
    if let Some(slot) = slot {
        config.hardware.slot = slot;
    }
    config.hardware.require_touch = require_touch;
    config.hardware.pin_prompt = pin_prompt;

    if generate {
        println!("info: Generating identity in slot {} (touch the key if it blinks)...", config.hardware.slot);
        let recipient = YubikeyPiv::new(&config, registry).generate()?;
        println!("success: Token recipient: {}", recipient);
    }

    let mut file = FileConfig::read(&config.config_file)?;
    file.yubikey_enabled = Some(true);
    file.yubikey_slot = Some(config.hardware.slot.clone());
    file.yubikey_require_touch = Some(require_touch);
    file.yubikey_pin_prompt = Some(pin_prompt);
    file.write(&config.config_file)?;

    println!("success: Hardware wrapping enabled (slot {})", config.hardware.slot);
    println!("info: Settings saved to {}", config.config_file.display());
    println!();
    println!("Wrap the identity key with: nakimi hardware wrap-key");

    Ok(())
}

/// Wrap the identity key
fn cmd_hardware_wrap_key(vault: &Vault) -> Result<()> {
    let wrapper = vault.key_wrapper();
    let backup = wrapper.wrap_key(vault.keystore())?;

    println!("success: Identity key wrapped with {}", wrapper.device().name());
    println!("info: Plain backup kept at {}", backup.display());
    println!("warning: Move the backup offline once decryption with the token works");

    if !vault.config().hardware.enabled {
        println!("warning: Hardware wrapping is not enabled; run: nakimi hardware setup");
    }

    Ok(())
}

/// Serve plugin commands over MCP until the client disconnects
fn cmd_serve(vault: &Vault) -> Result<()> {
    let mut manager = vault.session_manager();
    let session = manager.start()?;
    let plugins = PluginRegistry::builtin();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    let served = runtime.block_on(async {
        let mut server = McpServer::new(plugins.bind(session.credentials()));
        server.run().await
    });

    manager.end()?;
    served
}
