//! Hardware-token key wrapping
//!
//! With wrapping enabled the stored identity is itself age-encrypted to a
//! PIV token, so decrypting the credential store requires the token to be
//! present (and possibly a PIN and a touch).

use age::secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use nakimi_core::process::{is_installed, locate};
use nakimi_core::Config;

use crate::cleanup::CleanupRegistry;
use crate::error::{Result, VaultError};
use crate::exec::{self, ExecError, ToolOutput};
use crate::keystore::{KeyStore, PrivateMaterial};

const YKMAN: &str = "ykman";
const AGE_PLUGIN: &str = "age-plugin-yubikey";
const DEFAULT_PIN_RETRIES: u8 = 3;

/// What a token reports about itself
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceStatus {
    pub device: String,
    pub manager_installed: bool,
    pub plugin_installed: bool,
    pub present: bool,
    pub slot: String,
    pub require_touch: bool,
    pub pin_prompt: bool,
    /// Key/value lines reported for the slot
    pub slot_info: BTreeMap<String, String>,
    /// Human-readable hint when something is missing
    pub detail: Option<String>,
}

/// A token able to wrap and unwrap identities
pub trait TokenDevice: Send + Sync {
    fn name(&self) -> &str;

    fn status(&self) -> DeviceStatus;

    /// Recipient that wraps to this token
    fn recipient(&self) -> Result<String>;

    fn wrap(&self, private: &PrivateMaterial) -> Result<Vec<u8>>;

    /// Recover the identity. May block on PIN entry or touch.
    fn unwrap(&self, wrapped: &[u8], pin: Option<&SecretString>) -> Result<PrivateMaterial>;
}

/// Wraps and unwraps identities through a token
pub struct KeyWrapper {
    device: Box<dyn TokenDevice>,
}

impl KeyWrapper {
    pub fn new(device: Box<dyn TokenDevice>) -> Self {
        Self { device }
    }

    /// A PIV YubiKey configured from `config.hardware`
    pub fn from_config(config: &Config, registry: Arc<CleanupRegistry>) -> Self {
        Self::new(Box::new(YubikeyPiv::new(config, registry)))
    }

    pub fn device(&self) -> &dyn TokenDevice {
        self.device.as_ref()
    }

    pub fn status(&self) -> DeviceStatus {
        self.device.status()
    }

    pub fn wrap(&self, private: &PrivateMaterial) -> Result<Vec<u8>> {
        if !private.is_plain_identity() {
            return Err(VaultError::InvalidInput(
                "only a plain identity can be wrapped".to_string(),
            ));
        }
        let wrapped = self.device.wrap(private)?;
        info!("Wrapped identity with {}", self.device.name());
        Ok(wrapped)
    }

    pub fn unwrap(&self, wrapped: &[u8], pin: Option<&SecretString>) -> Result<PrivateMaterial> {
        if wrapped.is_empty() {
            return Err(VaultError::InvalidInput("wrapped key is empty".to_string()));
        }

        let private = self.device.unwrap(wrapped, pin)?;
        if !private.is_plain_identity() {
            return Err(VaultError::DeviceIncompatible(
                "token returned something that is not an identity".to_string(),
            ));
        }
        debug!("Unwrapped identity with {}", self.device.name());
        Ok(private)
    }

    /// Wrap the key in `keystore` in place, keeping a plain backup.
    ///
    /// Returns the backup path.
    pub fn wrap_key(&self, keystore: &KeyStore) -> Result<PathBuf> {
        let private = keystore.read_private()?;
        let wrapped = self.wrap(&private)?;
        keystore.store_wrapped(&wrapped)
    }
}

/// A YubiKey driven through `ykman`, `age-plugin-yubikey` and `age`
pub struct YubikeyPiv {
    slot: String,
    require_touch: bool,
    pin_prompt: bool,
    age_bin: PathBuf,
    timeout: Duration,
    registry: Arc<CleanupRegistry>,
}

impl YubikeyPiv {
    pub fn new(config: &Config, registry: Arc<CleanupRegistry>) -> Self {
        Self {
            slot: config.hardware.slot.clone(),
            require_touch: config.hardware.require_touch,
            pin_prompt: config.hardware.pin_prompt,
            age_bin: config.age_bin.clone(),
            timeout: config.tool_timeout,
            registry,
        }
    }

    /// Run a token tool. `timeout` of `None` means the user may be prompted.
    fn tool(
        &self,
        name: &str,
        args: &[&OsStr],
        input: Option<&[u8]>,
        timeout: Option<Duration>,
    ) -> Result<ToolOutput> {
        let program = locate(Path::new(name)).ok_or_else(|| {
            VaultError::ToolUnavailable(format!("'{}' not found on PATH", name))
        })?;

        exec::run(&program, args, input, timeout, &self.registry).map_err(|e| match e {
            ExecError::NotFound(_) => VaultError::ToolUnavailable(format!("'{}' not found", name)),
            ExecError::TimedOut(limit) => VaultError::DeviceNotPresent(format!(
                "'{}' did not answer within {}s",
                name,
                limit.as_secs()
            )),
            ExecError::Io(e) => VaultError::ToolUnavailable(format!("failed to run '{}': {}", name, e)),
        })
    }

    fn age(&self, args: &[&OsStr], input: &[u8], timeout: Option<Duration>) -> Result<ToolOutput> {
        let program = locate(&self.age_bin).ok_or_else(|| {
            VaultError::ToolUnavailable(format!("'{}' not found", self.age_bin.display()))
        })?;

        exec::run(&program, args, Some(input), timeout, &self.registry).map_err(|e| {
            VaultError::ToolUnavailable(format!("'{}': {}", self.age_bin.display(), e))
        })
    }

    fn slot_info(&self) -> BTreeMap<String, String> {
        let args = [OsStr::new("piv"), OsStr::new("info")];
        let Ok(out) = self.tool(YKMAN, &args, None, Some(self.timeout)) else {
            return BTreeMap::new();
        };
        if !out.status.success() {
            return BTreeMap::new();
        }

        String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, _)| !k.is_empty())
            .collect()
    }

    /// Generate an age identity in the configured slot.
    ///
    /// Touch and PIN policies follow the hardware settings.
    pub fn generate(&self) -> Result<String> {
        let touch = if self.require_touch { "always" } else { "never" };
        let pin = if self.pin_prompt { "once" } else { "never" };

        let out = self.tool(
            AGE_PLUGIN,
            &[
                OsStr::new("--generate"),
                OsStr::new("--slot"),
                OsStr::new(&self.slot),
                OsStr::new("--touch-policy"),
                OsStr::new(touch),
                OsStr::new("--pin-policy"),
                OsStr::new(pin),
            ],
            None,
            None,
        )?;
        if !out.status.success() {
            return Err(classify_failure(&out.stderr_summary()));
        }
        find_recipient(&out.stdout).ok_or_else(|| {
            VaultError::DeviceIncompatible("generation produced no recipient".to_string())
        })
    }

    fn identity_stub(&self) -> Result<Zeroizing<Vec<u8>>> {
        let out = self.tool(
            AGE_PLUGIN,
            &[OsStr::new("--identity"), OsStr::new("--slot"), OsStr::new(&self.slot)],
            None,
            Some(self.timeout),
        )?;
        if !out.status.success() {
            return Err(classify_failure(&out.stderr_summary()));
        }
        if out.stdout.iter().all(u8::is_ascii_whitespace) {
            return Err(VaultError::DeviceIncompatible(format!(
                "slot {} holds no age identity",
                self.slot
            )));
        }
        Ok(out.stdout)
    }
}

impl TokenDevice for YubikeyPiv {
    fn name(&self) -> &str {
        "yubikey-piv"
    }

    fn status(&self) -> DeviceStatus {
        let manager_installed = is_installed(YKMAN);
        let plugin_installed = is_installed(AGE_PLUGIN);

        let mut detail = None;
        let present = if manager_installed {
            match self.tool(YKMAN, &[OsStr::new("info")], None, Some(self.timeout)) {
                Ok(out) if out.status.success() => true,
                Ok(out) => {
                    let summary = out.stderr_summary();
                    if summary.contains("PC/SC not available") {
                        detail = Some("PC/SC service not available (is pcscd running?)".to_string());
                    } else {
                        detail = Some(summary);
                    }
                    false
                }
                Err(e) => {
                    detail = Some(e.to_string());
                    false
                }
            }
        } else {
            detail = Some("ykman not found (pip install yubikey-manager)".to_string());
            false
        };

        if present && !plugin_installed {
            detail = Some(
                "age-plugin-yubikey not found (https://github.com/str4d/age-plugin-yubikey)"
                    .to_string(),
            );
        }

        DeviceStatus {
            device: self.name().to_string(),
            manager_installed,
            plugin_installed,
            present,
            slot: self.slot.clone(),
            require_touch: self.require_touch,
            pin_prompt: self.pin_prompt,
            slot_info: if present { self.slot_info() } else { BTreeMap::new() },
            detail,
        }
    }

    fn recipient(&self) -> Result<String> {
        let out = self.tool(
            AGE_PLUGIN,
            &[OsStr::new("--list"), OsStr::new("--slot"), OsStr::new(&self.slot)],
            None,
            Some(self.timeout),
        )?;
        if !out.status.success() {
            return Err(classify_failure(&out.stderr_summary()));
        }

        find_recipient(&out.stdout).ok_or_else(|| {
            VaultError::DeviceIncompatible(format!(
                "no age recipient in slot {} (run 'nakimi hardware setup --generate')",
                self.slot
            ))
        })
    }

    fn wrap(&self, private: &PrivateMaterial) -> Result<Vec<u8>> {
        let recipient = self.recipient()?;

        let mut recipients = tempfile::NamedTempFile::new()
            .map_err(|e| VaultError::storage("create recipients file", e))?;
        writeln!(recipients, "{}", recipient)
            .and_then(|_| recipients.flush())
            .map_err(|e| VaultError::storage("write recipients file", e))?;

        let out = self.age(
            &[OsStr::new("-e"), OsStr::new("-R"), recipients.path().as_os_str()],
            private.expose().as_bytes(),
            Some(self.timeout),
        )?;
        if !out.status.success() || out.stdout.is_empty() {
            return Err(VaultError::EncryptionFailed(out.stderr_summary()));
        }
        Ok(out.stdout.to_vec())
    }

    fn unwrap(&self, wrapped: &[u8], pin: Option<&SecretString>) -> Result<PrivateMaterial> {
        if pin.is_some() {
            debug!("PIN is collected by age-plugin-yubikey itself; ignoring supplied PIN");
        }

        let stub = self.identity_stub()?;
        let mut identity = tempfile::NamedTempFile::new()
            .map_err(|e| VaultError::storage("create identity stub", e))?;
        identity
            .write_all(&stub)
            .and_then(|_| identity.flush())
            .map_err(|e| VaultError::storage("write identity stub", e))?;

        if self.require_touch {
            eprintln!("info: touch your YubiKey when it blinks");
        }

        // No timeout: the plugin waits on PIN entry and touch
        let out = self.age(
            &[OsStr::new("-d"), OsStr::new("-i"), identity.path().as_os_str()],
            wrapped,
            None,
        )?;
        if !out.status.success() {
            return Err(classify_failure(&out.stderr_summary()));
        }

        let text = String::from_utf8(out.stdout.to_vec()).map_err(|_| {
            VaultError::DeviceIncompatible("unwrapped key is not valid UTF-8".to_string())
        })?;
        Ok(PrivateMaterial::new(text))
    }
}

fn find_recipient(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .find(|l| l.starts_with("age1"))
        .map(str::to_string)
}

/// Map token tool diagnostics onto error kinds
fn classify_failure(stderr: &str) -> VaultError {
    let lower = stderr.to_lowercase();

    if lower.contains("blocked") {
        VaultError::AuthenticationFailed("PIN is blocked".to_string())
    } else if lower.contains("pin")
        && ["incorrect", "wrong", "invalid"].iter().any(|w| lower.contains(w))
    {
        VaultError::AuthenticationFailed("incorrect PIN".to_string())
    } else if lower.contains("touch") && lower.contains("timed out") {
        VaultError::AuthenticationFailed("touch not confirmed".to_string())
    } else if lower.contains("no yubikey")
        || lower.contains("not connected")
        || lower.contains("could not find")
        || lower.contains("pc/sc not available")
    {
        VaultError::DeviceNotPresent(stderr.to_string())
    } else {
        warn!("Token tool failed: {}", stderr);
        VaultError::DeviceIncompatible("token could not unwrap the key".to_string())
    }
}

struct TokenState {
    retries_left: u8,
}

/// A software token for tests and dry runs.
///
/// Holds its own age identity and PIN and keeps a device-side retry
/// counter: wrong PINs decrement it, a correct PIN resets it, and at zero
/// the token refuses every attempt.
pub struct SimulatedToken {
    identity: age::x25519::Identity,
    pin: SecretString,
    present: bool,
    state: Mutex<TokenState>,
}

impl SimulatedToken {
    pub fn new(pin: &str) -> Self {
        Self {
            identity: age::x25519::Identity::generate(),
            pin: SecretString::new(pin.to_string()),
            present: true,
            state: Mutex::new(TokenState {
                retries_left: DEFAULT_PIN_RETRIES,
            }),
        }
    }

    /// A token that is not plugged in
    pub fn absent(pin: &str) -> Self {
        Self {
            present: false,
            ..Self::new(pin)
        }
    }

    pub fn retries_left(&self) -> u8 {
        self.state
            .lock()
            .map(|s| s.retries_left)
            .unwrap_or_default()
    }

    fn check_pin(&self, pin: Option<&SecretString>) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| VaultError::DeviceIncompatible("token state poisoned".to_string()))?;

        if state.retries_left == 0 {
            return Err(VaultError::AuthenticationFailed("PIN is blocked".to_string()));
        }

        let Some(pin) = pin else {
            return Err(VaultError::AuthenticationFailed("PIN required".to_string()));
        };

        if pin.expose_secret() != self.pin.expose_secret() {
            state.retries_left -= 1;
            return Err(VaultError::AuthenticationFailed(format!(
                "incorrect PIN ({} attempt(s) left)",
                state.retries_left
            )));
        }

        state.retries_left = DEFAULT_PIN_RETRIES;
        Ok(())
    }
}

impl TokenDevice for SimulatedToken {
    fn name(&self) -> &str {
        "simulated"
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device: self.name().to_string(),
            manager_installed: true,
            plugin_installed: true,
            present: self.present,
            slot: "simulated".to_string(),
            require_touch: false,
            pin_prompt: true,
            slot_info: BTreeMap::from([(
                "PIN tries remaining".to_string(),
                self.retries_left().to_string(),
            )]),
            detail: None,
        }
    }

    fn recipient(&self) -> Result<String> {
        if !self.present {
            return Err(VaultError::DeviceNotPresent("simulated token unplugged".to_string()));
        }
        Ok(self.identity.to_public().to_string())
    }

    fn wrap(&self, private: &PrivateMaterial) -> Result<Vec<u8>> {
        let recipient = age::x25519::Recipient::from_str(&self.recipient()?)
            .map_err(|e| VaultError::DeviceIncompatible(e.to_string()))?;
        let recipients: Vec<Box<dyn age::Recipient + Send>> = vec![Box::new(recipient)];
        let encryptor = age::Encryptor::with_recipients(recipients)
            .ok_or_else(|| VaultError::EncryptionFailed("no recipients".to_string()))?;

        let mut out = Vec::new();
        let mut writer = encryptor
            .wrap_output(&mut out)
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        writer
            .write_all(private.expose().as_bytes())
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;
        Ok(out)
    }

    fn unwrap(&self, wrapped: &[u8], pin: Option<&SecretString>) -> Result<PrivateMaterial> {
        if !self.present {
            return Err(VaultError::DeviceNotPresent("simulated token unplugged".to_string()));
        }
        self.check_pin(pin)?;

        let incompatible =
            || VaultError::DeviceIncompatible("key was not wrapped by this token".to_string());

        let decryptor = match age::Decryptor::new(wrapped) {
            Ok(age::Decryptor::Recipients(d)) => d,
            _ => return Err(incompatible()),
        };
        let mut reader = decryptor
            .decrypt(std::iter::once(&self.identity as &dyn age::Identity))
            .map_err(|_| incompatible())?;

        let mut plain = Zeroizing::new(Vec::new());
        reader.read_to_end(&mut plain).map_err(|_| incompatible())?;
        let text = String::from_utf8(plain.to_vec()).map_err(|_| incompatible())?;
        Ok(PrivateMaterial::new(text))
    }
}
