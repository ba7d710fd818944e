use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::entry::{Identity, ProviderTag};
use crate::notify::{Notice, Notifier};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("sign-in was cancelled")]
    PopupCancelled,
    #[error("the sign-in window could not be opened")]
    PopupBlocked,
    #[error("an account with the same address exists under another provider")]
    AccountConflict,
    #[error("identity provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// The user-facing notice for a failed sign-in. Raw provider details stay
    /// in the log.
    pub fn notice(&self) -> Notice {
        match self {
            AuthError::PopupCancelled => Notice::info("Sign-in was cancelled."),
            AuthError::PopupBlocked => Notice::error(
                "The sign-in window was blocked. Run the command from an interactive terminal or pass --yes.",
            ),
            AuthError::AccountConflict => Notice::error(
                "This account is already registered with a different sign-in method. Use that provider instead.",
            ),
            AuthError::Provider(_) => Notice::error("Sign-in failed. Please try again."),
        }
    }
}

/// The identity provider boundary.
pub trait IdentityProvider {
    /// The identity the provider currently considers signed in, if any.
    fn current(&self) -> Result<Option<Identity>, AuthError>;

    fn interactive_sign_in(&self, provider: ProviderTag) -> Result<Identity, AuthError>;

    fn sign_out(&self) -> Result<(), AuthError>;
}

/// Process-wide holder of the signed-in identity. Every change goes through a
/// single watch channel, so subscribers see it as soon as it is published.
pub struct IdentitySession<P> {
    provider: P,
    state: watch::Sender<Option<Identity>>,
    notifier: Arc<dyn Notifier>,
}

impl<P: IdentityProvider> IdentitySession<P> {
    pub fn new(provider: P, notifier: Arc<dyn Notifier>) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            provider,
            state,
            notifier,
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Loads whatever session the provider already holds.
    #[instrument(skip(self))]
    pub fn restore(&self) {
        match self.provider.current() {
            Ok(identity) => self.on_auth_state_changed(identity),
            Err(err) => {
                warn!(error = %err, "could not restore previous session");
                self.on_auth_state_changed(None);
            }
        }
    }

    pub fn current_identity(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.state.subscribe()
    }

    /// Auth-state callback of the provider.
    pub fn on_auth_state_changed(&self, identity: Option<Identity>) {
        let changed = self.state.send_if_modified(|current| {
            if *current == identity {
                return false;
            }
            *current = identity;
            true
        });
        if changed {
            match self.state.borrow().as_ref() {
                Some(identity) => {
                    info!(user = %identity.id, provider = %identity.provider, "signed in")
                }
                None => info!("signed out"),
            }
        }
    }

    /// Runs the provider's interactive flow. Failures never reach the caller;
    /// they become a notice and the current identity is left as it was.
    #[instrument(skip(self))]
    pub fn sign_in(&self, provider: ProviderTag) {
        match self.provider.interactive_sign_in(provider) {
            Ok(identity) => {
                let name = identity.name_or_anonymous().to_string();
                self.on_auth_state_changed(Some(identity));
                self.notifier
                    .notify(Notice::success(format!("Signed in as {name}.")));
            }
            Err(err) => {
                warn!(%provider, error = %err, "sign-in failed");
                self.notifier.notify(err.notice());
            }
        }
    }

    #[instrument(skip(self))]
    pub fn sign_out(&self) {
        match self.provider.sign_out() {
            Ok(()) => {
                self.on_auth_state_changed(None);
                self.notifier.notify(Notice::info("Signed out."));
            }
            Err(err) => {
                warn!(error = %err, "sign-out failed");
                self.notifier
                    .notify(Notice::error("Sign-out failed. Please try again."));
            }
        }
    }
}

/// A configured account for one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub identity: Identity,
    pub email: Option<String>,
}

/// Signs in against profiles declared in the rc file
/// (`auth.<provider>.id`, `.name`, `.avatar`, `.email`) and keeps the active
/// session in `session.json` inside the data directory.
///
/// An email is bound to the first provider that signs in with it
/// (`accounts.json`). Signing in with the same email through the other
/// provider is an account conflict.
#[derive(Debug)]
pub struct LocalIdentityProvider {
    session_path: PathBuf,
    accounts_path: PathBuf,
    profiles: BTreeMap<ProviderTag, Profile>,
    assume_yes: bool,
}

impl LocalIdentityProvider {
    pub fn new(data_dir: &Path, profiles: BTreeMap<ProviderTag, Profile>) -> Self {
        Self {
            session_path: data_dir.join("session.json"),
            accounts_path: data_dir.join("accounts.json"),
            profiles,
            assume_yes: false,
        }
    }

    pub fn from_config(data_dir: &Path, cfg: &Config) -> Self {
        let profiles = ProviderTag::ALL
            .into_iter()
            .filter_map(|tag| {
                let prefix = format!("auth.{tag}");
                let id = cfg.get(&format!("{prefix}.id"))?;
                debug!(provider = %tag, "found configured profile");
                Some((
                    tag,
                    Profile {
                        identity: Identity {
                            id,
                            display_name: cfg.get(&format!("{prefix}.name")),
                            avatar_url: cfg.get(&format!("{prefix}.avatar")),
                            provider: tag,
                        },
                        email: cfg.get(&format!("{prefix}.email")),
                    },
                ))
            })
            .collect();
        Self::new(data_dir, profiles)
    }

    pub fn assume_yes(mut self, yes: bool) -> Self {
        self.assume_yes = yes;
        self
    }

    fn load_accounts(&self) -> Result<BTreeMap<String, ProviderTag>, AuthError> {
        let raw = match fs::read_to_string(&self.accounts_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(err) => return Err(AuthError::Provider(err.to_string())),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw)
            .map_err(|err| AuthError::Provider(format!("unreadable accounts file: {err}")))
    }

    /// Binds the profile's email to its provider unless another provider
    /// already holds it. Emails compare case-insensitively.
    fn bind_account(&self, profile: &Profile) -> Result<(), AuthError> {
        let Some(email) = profile.email.as_deref() else {
            return Ok(());
        };
        let email = email.trim().to_ascii_lowercase();
        let provider = profile.identity.provider;

        let mut accounts = self.load_accounts()?;
        match accounts.get(&email).copied() {
            Some(bound) if bound == provider => Ok(()),
            Some(bound) => {
                debug!(%bound, requested = %provider, "email already bound to another provider");
                Err(AuthError::AccountConflict)
            }
            None => {
                accounts.insert(email, provider);
                write_json_atomic(&self.accounts_path, &accounts)
            }
        }
    }

    fn check_account(&self, profile: &Profile) -> Result<(), AuthError> {
        let Some(email) = profile.email.as_deref() else {
            return Ok(());
        };
        let bound = self
            .load_accounts()?
            .get(&email.trim().to_ascii_lowercase())
            .copied();
        match bound {
            Some(bound) if bound != profile.identity.provider => Err(AuthError::AccountConflict),
            _ => Ok(()),
        }
    }

    fn confirm(&self, identity: &Identity) -> Result<bool, AuthError> {
        if self.assume_yes {
            return Ok(true);
        }
        if !io::stdin().is_terminal() {
            return Err(AuthError::PopupBlocked);
        }

        let mut stderr = io::stderr().lock();
        write!(
            stderr,
            "Sign in with {} as {}? [y/N] ",
            identity.provider.label(),
            identity.name_or_anonymous()
        )
        .and_then(|_| stderr.flush())
        .map_err(|err| AuthError::Provider(err.to_string()))?;

        let mut answer = String::new();
        io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|err| AuthError::Provider(err.to_string()))?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), AuthError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let write = || -> anyhow::Result<()> {
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, value)?;
        temp.flush()?;
        temp.persist(path)?;
        Ok(())
    };
    write().map_err(|err| AuthError::Provider(format!("failed to save {}: {err:#}", path.display())))
}

impl IdentityProvider for LocalIdentityProvider {
    fn current(&self) -> Result<Option<Identity>, AuthError> {
        let raw = match fs::read_to_string(&self.session_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(AuthError::Provider(err.to_string())),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| AuthError::Provider(format!("unreadable session file: {err}")))
    }

    #[instrument(skip(self))]
    fn interactive_sign_in(&self, provider: ProviderTag) -> Result<Identity, AuthError> {
        let profile = self.profiles.get(&provider).ok_or_else(|| {
            AuthError::Provider(format!(
                "no {provider} account configured; set auth.{provider}.id in your adventrc"
            ))
        })?;

        self.check_account(profile)?;

        if !self.confirm(&profile.identity)? {
            return Err(AuthError::PopupCancelled);
        }

        self.bind_account(profile)?;
        write_json_atomic(&self.session_path, &profile.identity)?;
        Ok(profile.identity.clone())
    }

    fn sign_out(&self) -> Result<(), AuthError> {
        match fs::remove_file(&self.session_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(AuthError::Provider(err.to_string())),
        }
    }
}
