//! # Control Panel Protocol
//!
//! The reference application protocol on top of the bundle channel:
//! challenge/response authentication, then a bidirectional exchange of named
//! commands with structured payloads. The whole protocol is implemented as a
//! [`ChannelState`], driven through the channel's hook contract.
//!
//! ## Handshake
//! ```text
//! client: SEND_ID ──────────▶ DECRYPT_CHALLENGE ──▶ OPEN
//! server: RECV_ID ──▶ SEND_CHALLENGE ──▶ VERIFY_RESPONSE ──▶ OPEN
//! ```
//!
//! The handshake is strictly sequential: no command traffic is accepted or
//! sent before OPEN. A wrong echo or an unknown id closes the channel as an
//! authentication failure with no retry.
//!
//! ## Command Exchange
//! Once open, each bundle carries a tagged structure with a `"Commands"`
//! list of `{ "Command": name, "Payload": structure }` entries. Listeners
//! registered with run-once semantics are consumed before persistent ones.
//! [`ControlPanel::send`] is fire-and-forget: it enqueues and wakes the
//! worker so the bundle flushes promptly.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::trace;

use crate::core::tag::{TagStructure, TagValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::{
    echo_matches, generate_challenge, generate_salt, ChallengeCipher, CipherDirectory,
    SecretCipher, CHALLENGE_LEN, KEYED_CHALLENGE_LEN, SALT_LEN,
};
use crate::transport::channel::{BundleReader, BundleWriter, ChannelControl, ChannelState};
use crate::worker::ConnectionHandle;

/// Built-in request: enumerate the peer's registered command names.
pub const COMMANDS_LIST: &str = "Commands-List";

/// Built-in response to [`COMMANDS_LIST`].
pub const COMMANDS_SEND: &str = "Commands-Send";

/// Root key holding the command list in every open-phase bundle.
pub const KEY_COMMANDS: &str = "Commands";

const KEY_COMMAND: &str = "Command";
const KEY_PAYLOAD: &str = "Payload";

type CommandListener = Box<dyn FnMut(&TagStructure, &ControlPanel) + Send>;
type OnceListener = Box<dyn FnOnce(&TagStructure, &ControlPanel) + Send>;
type OpenHook = Box<dyn FnMut(&ControlPanel) + Send>;
type CloseHook = Box<dyn FnMut() + Send>;
type DisconnectHook = Box<dyn FnMut(&ProtocolError) + Send>;

#[derive(Default)]
struct ListenerTable {
    persistent: HashMap<String, Vec<CommandListener>>,
    once: HashMap<String, Vec<OnceListener>>,
}

#[derive(Default)]
struct PanelShared {
    identity: Mutex<Option<String>>,
    salt: Mutex<Option<Vec<u8>>>,
    outbound: Mutex<VecDeque<(String, TagStructure)>>,
    listeners: Mutex<ListenerTable>,
    open_hooks: Mutex<Vec<OpenHook>>,
    close_hooks: Mutex<Vec<CloseHook>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
    wake: Mutex<Option<Arc<ConnectionHandle>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Thread-safe handle to one control connection: queue commands, register
/// listeners and lifecycle hooks, inspect the authenticated identity.
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct ControlPanel {
    shared: Arc<PanelShared>,
}

impl ControlPanel {
    pub fn new() -> Self {
        let panel = Self {
            shared: Arc::new(PanelShared::default()),
        };
        // Built-in: answer Commands-List with every registered command name.
        panel.on_command(COMMANDS_LIST, |_payload, panel| {
            let names: Vec<TagValue> = panel
                .registered_commands()
                .into_iter()
                .map(TagValue::from)
                .collect();
            let payload = TagStructure::new().with(KEY_COMMANDS, names);
            panel.send(COMMANDS_SEND, payload);
        });
        panel
    }

    /// Queue a command for the peer and wake the worker so it flushes
    /// promptly. Fire-and-forget; delivery fails only with the connection.
    pub fn send(&self, command: impl Into<String>, payload: TagStructure) {
        lock(&self.shared.outbound).push_back((command.into(), payload));
        if let Some(handle) = lock(&self.shared.wake).as_ref() {
            handle.wake();
        }
    }

    /// Ask the connection to close gracefully once pending output flushes.
    /// A no-op until the connection is being driven.
    pub fn close(&self) {
        if let Some(handle) = lock(&self.shared.wake).as_ref() {
            handle.request_close();
        }
    }

    /// Register a persistent listener for a command name. Listeners run in
    /// registration order, after any one-shot listeners.
    pub fn on_command<F>(&self, command: impl Into<String>, listener: F)
    where
        F: FnMut(&TagStructure, &ControlPanel) + Send + 'static,
    {
        lock(&self.shared.listeners)
            .persistent
            .entry(command.into())
            .or_default()
            .push(Box::new(listener));
    }

    /// Register a listener consumed by the first matching command.
    pub fn once_command<F>(&self, command: impl Into<String>, listener: F)
    where
        F: FnOnce(&TagStructure, &ControlPanel) + Send + 'static,
    {
        lock(&self.shared.listeners)
            .once
            .entry(command.into())
            .or_default()
            .push(Box::new(listener));
    }

    /// Runs exactly once, right after authentication succeeds.
    pub fn on_open<F>(&self, hook: F)
    where
        F: FnMut(&ControlPanel) + Send + 'static,
    {
        lock(&self.shared.open_hooks).push(Box::new(hook));
    }

    /// Runs on graceful local or remote close, with no error.
    pub fn on_close<F>(&self, hook: F)
    where
        F: FnMut() + Send + 'static,
    {
        lock(&self.shared.close_hooks).push(Box::new(hook));
    }

    /// Runs when the connection dies with a fatal transport, authentication,
    /// or timeout error.
    pub fn on_disconnect<F>(&self, hook: F)
    where
        F: FnMut(&ProtocolError) + Send + 'static,
    {
        lock(&self.shared.disconnect_hooks).push(Box::new(hook));
    }

    /// The authenticated identity, absent until the handshake completes.
    pub fn identity(&self) -> Option<String> {
        lock(&self.shared.identity).clone()
    }

    /// The session salt from the salted handshake variant, if any.
    pub fn session_salt(&self) -> Option<Vec<u8>> {
        lock(&self.shared.salt).clone()
    }

    /// Every command name with at least one registered listener, sorted.
    pub fn registered_commands(&self) -> Vec<String> {
        let table = lock(&self.shared.listeners);
        let mut names: Vec<String> = table
            .persistent
            .keys()
            .chain(table.once.keys())
            .cloned()
            .collect();
        names.sort();
        names.dedup();
        names
    }

    fn bind(&self, handle: Arc<ConnectionHandle>) {
        let mut wake = lock(&self.shared.wake);
        if wake.is_none() {
            *wake = Some(handle);
        }
    }

    fn set_identity(&self, id: String) {
        let mut identity = lock(&self.shared.identity);
        if identity.is_none() {
            *identity = Some(id);
        }
    }

    fn set_salt(&self, salt: Vec<u8>) {
        *lock(&self.shared.salt) = Some(salt);
    }

    fn drain_outbound(&self) -> Vec<(String, TagStructure)> {
        lock(&self.shared.outbound).drain(..).collect()
    }

    /// Dispatch one command: one-shot listeners first (consumed), then every
    /// persistent listener. Listeners may send replies and register further
    /// listeners from inside the callback.
    fn dispatch(&self, command: &str, payload: &TagStructure) {
        let once = lock(&self.shared.listeners).once.remove(command);
        let had_once = once.is_some();
        if let Some(listeners) = once {
            for listener in listeners {
                listener(payload, self);
            }
        }

        // Take the listeners out but leave the key registered, so a listener
        // asking for the command catalogue mid-dispatch still sees this name.
        let persistent = lock(&self.shared.listeners)
            .persistent
            .get_mut(command)
            .map(std::mem::take);
        let had_persistent = persistent.as_ref().is_some_and(|entries| !entries.is_empty());
        if let Some(mut listeners) = persistent {
            for listener in listeners.iter_mut() {
                listener(payload, self);
            }
            // Merge back, keeping listeners registered during dispatch after
            // the existing ones.
            let mut table = lock(&self.shared.listeners);
            let entry = table.persistent.entry(command.to_string()).or_default();
            listeners.append(entry);
            *entry = listeners;
        }

        if !had_once && !had_persistent {
            trace!(command, "no listener registered for command");
        }
    }

    fn run_open_hooks(&self) {
        let mut hooks = std::mem::take(&mut *lock(&self.shared.open_hooks));
        for hook in hooks.iter_mut() {
            hook(self);
        }
    }

    fn run_close_hooks(&self) {
        for hook in lock(&self.shared.close_hooks).iter_mut() {
            hook();
        }
    }

    fn run_disconnect_hooks(&self, error: &ProtocolError) {
        for hook in lock(&self.shared.disconnect_hooks).iter_mut() {
            hook(error);
        }
    }
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

enum Role {
    ClientSalted { cipher: Arc<dyn ChallengeCipher> },
    ClientKeyed { cipher: Arc<dyn ChallengeCipher> },
    ServerSalted { directory: Arc<dyn CipherDirectory> },
    ServerKeyed { directory: Arc<dyn CipherDirectory> },
}

impl Role {
    fn is_salted(&self) -> bool {
        matches!(self, Role::ClientSalted { .. } | Role::ServerSalted { .. })
    }

    fn challenge_len(&self) -> usize {
        if self.is_salted() {
            CHALLENGE_LEN
        } else {
            KEYED_CHALLENGE_LEN
        }
    }
}

enum Phase {
    /// Client: about to send its id.
    SendId,
    /// Client: waiting for the encrypted challenge.
    AwaitChallenge,
    /// Server: waiting for the claimed id.
    AwaitId,
    /// Server: challenge sent, waiting for the plaintext echo.
    AwaitEcho {
        challenge: Vec<u8>,
        claimed_id: String,
    },
    /// Authenticated; symmetric command exchange.
    Open,
}

/// The protocol state machine driving one control connection.
pub struct ControlPanelProtocol {
    panel: ControlPanel,
    role: Role,
    phase: Phase,
    local_id: Option<String>,
    opened: bool,
    activity_timeout: Duration,
}

impl ControlPanelProtocol {
    /// Client with pre-shared secret key material (salted exchange).
    pub fn client_salted(panel: ControlPanel, id: impl Into<String>, secret: &[u8]) -> Self {
        Self {
            panel,
            role: Role::ClientSalted {
                cipher: Arc::new(SecretCipher::new(secret)),
            },
            phase: Phase::SendId,
            local_id: Some(id.into()),
            opened: false,
            activity_timeout: Duration::from_secs(300),
        }
    }

    /// Client with asymmetric key material (keyed exchange).
    pub fn client_keyed(
        panel: ControlPanel,
        id: impl Into<String>,
        cipher: Arc<dyn ChallengeCipher>,
    ) -> Self {
        Self {
            panel,
            role: Role::ClientKeyed { cipher },
            phase: Phase::SendId,
            local_id: Some(id.into()),
            opened: false,
            activity_timeout: Duration::from_secs(300),
        }
    }

    /// Server for the salted exchange; ids resolve through `directory`.
    pub fn server_salted(panel: ControlPanel, directory: Arc<dyn CipherDirectory>) -> Self {
        Self {
            panel,
            role: Role::ServerSalted { directory },
            phase: Phase::AwaitId,
            local_id: None,
            opened: false,
            activity_timeout: Duration::from_secs(300),
        }
    }

    /// Server for the keyed exchange; ids resolve through `directory`.
    pub fn server_keyed(panel: ControlPanel, directory: Arc<dyn CipherDirectory>) -> Self {
        Self {
            panel,
            role: Role::ServerKeyed { directory },
            phase: Phase::AwaitId,
            local_id: None,
            opened: false,
            activity_timeout: Duration::from_secs(300),
        }
    }

    /// Override the idle window granted after each successful exchange.
    pub fn with_activity_timeout(mut self, window: Duration) -> Self {
        self.activity_timeout = window;
        self
    }

    pub fn panel(&self) -> &ControlPanel {
        &self.panel
    }

    fn open(&mut self, ctl: &mut ChannelControl<'_>) {
        self.phase = Phase::Open;
        self.opened = true;
        if let Some(id) = self.local_id.take() {
            self.panel.set_identity(id);
        }
        ctl.extend_deadline(self.activity_timeout);
        trace!("control connection open");
        self.panel.run_open_hooks();
    }

    fn encode_commands(queued: &[(String, TagStructure)], out: &mut BundleWriter<'_>) {
        let entries: Vec<TagValue> = queued
            .iter()
            .map(|(name, payload)| {
                TagValue::Structure(
                    TagStructure::new()
                        .with(KEY_COMMAND, name.as_str())
                        .with(KEY_PAYLOAD, payload.clone()),
                )
            })
            .collect();
        TagStructure::new()
            .with(KEY_COMMANDS, entries)
            .encode(out.buffer());
    }

    fn dispatch_bundle(&mut self, bundle: &mut BundleReader) -> Result<()> {
        let root = TagStructure::decode(bundle)?;
        let commands = root
            .get(KEY_COMMANDS)
            .and_then(TagValue::as_list)
            .ok_or_else(|| ProtocolError::MalformedPayload("missing Commands list".into()))?;

        for entry in commands {
            let entry = entry.as_structure().ok_or_else(|| {
                ProtocolError::MalformedPayload("command entry is not a structure".into())
            })?;
            let name = entry
                .get(KEY_COMMAND)
                .and_then(TagValue::as_text)
                .ok_or_else(|| {
                    ProtocolError::MalformedPayload("command entry has no name".into())
                })?;
            let payload = match entry.get(KEY_PAYLOAD) {
                Some(TagValue::Structure(payload)) => payload.clone(),
                None => TagStructure::new(),
                Some(_) => {
                    return Err(ProtocolError::MalformedPayload(
                        "command payload is not a structure".into(),
                    ))
                }
            };
            self.panel.dispatch(name, &payload);
        }
        Ok(())
    }
}

impl ChannelState for ControlPanelProtocol {
    fn on_bundle(
        &mut self,
        bundle: &mut BundleReader,
        out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        self.panel.bind(ctl.handle().clone());

        match &self.phase {
            Phase::AwaitId => {
                let id = bundle.read_string()?;
                let directory = match &self.role {
                    Role::ServerSalted { directory } | Role::ServerKeyed { directory } => directory,
                    _ => {
                        return Err(ProtocolError::MalformedPayload(
                            "unexpected id bundle".into(),
                        ))
                    }
                };
                let cipher = directory
                    .cipher_for(&id)
                    .ok_or_else(|| ProtocolError::UnknownPeer(id.clone()))?;

                let challenge = generate_challenge(self.role.challenge_len());
                let mut plain = challenge.clone();
                if self.role.is_salted() {
                    let salt = generate_salt();
                    self.panel.set_salt(salt.to_vec());
                    plain.extend_from_slice(&salt);
                }

                let ciphertext = cipher.encrypt(&plain)?;
                out.write_bytes(&ciphertext);
                self.phase = Phase::AwaitEcho {
                    challenge,
                    claimed_id: id,
                };
                Ok(true)
            }

            Phase::AwaitEcho { .. } => {
                let echoed = bundle.read_to_end();
                let (challenge, claimed_id) =
                    match std::mem::replace(&mut self.phase, Phase::AwaitId) {
                        Phase::AwaitEcho {
                            challenge,
                            claimed_id,
                        } => (challenge, claimed_id),
                        _ => unreachable!("phase checked above"),
                    };
                if !echo_matches(&challenge, &echoed) {
                    return Err(ProtocolError::AuthenticationFailed(format!(
                        "bad challenge echo from '{claimed_id}'"
                    )));
                }
                self.panel.set_identity(claimed_id);
                self.open(ctl);
                Ok(false)
            }

            Phase::AwaitChallenge => {
                let ciphertext = bundle.read_to_end();
                let cipher = match &self.role {
                    Role::ClientSalted { cipher } | Role::ClientKeyed { cipher } => cipher.clone(),
                    _ => {
                        return Err(ProtocolError::MalformedPayload(
                            "unexpected challenge bundle".into(),
                        ))
                    }
                };
                let plain = cipher.decrypt(&ciphertext)?;

                let challenge = if self.role.is_salted() {
                    if plain.len() != CHALLENGE_LEN + SALT_LEN {
                        return Err(ProtocolError::AuthenticationFailed(
                            "salted challenge has unexpected length".into(),
                        ));
                    }
                    self.panel.set_salt(plain[CHALLENGE_LEN..].to_vec());
                    plain[..CHALLENGE_LEN].to_vec()
                } else {
                    if plain.len() != KEYED_CHALLENGE_LEN {
                        return Err(ProtocolError::AuthenticationFailed(
                            "keyed challenge has unexpected length".into(),
                        ));
                    }
                    plain
                };

                out.write_bytes(&challenge);
                self.open(ctl);
                Ok(true)
            }

            Phase::Open => {
                self.dispatch_bundle(bundle)?;
                ctl.extend_deadline(self.activity_timeout);

                let queued = self.panel.drain_outbound();
                if queued.is_empty() {
                    Ok(false)
                } else {
                    Self::encode_commands(&queued, out);
                    Ok(true)
                }
            }

            Phase::SendId => Err(ProtocolError::MalformedPayload(
                "bundle received before id was sent".into(),
            )),
        }
    }

    fn on_send_ready(
        &mut self,
        out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        self.panel.bind(ctl.handle().clone());

        match &self.phase {
            Phase::SendId => {
                let id = self.local_id.clone().ok_or_else(|| {
                    ProtocolError::Config("client protocol built without an id".into())
                })?;
                out.write_string(&id)?;
                self.phase = Phase::AwaitChallenge;
                Ok(true)
            }
            Phase::Open => {
                let queued = self.panel.drain_outbound();
                if queued.is_empty() {
                    return Ok(false);
                }
                Self::encode_commands(&queued, out);
                ctl.extend_deadline(self.activity_timeout);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn on_shutdown(&mut self, result: &Result<()>) {
        match result {
            Ok(()) if self.opened => self.panel.run_close_hooks(),
            Ok(()) => {
                // The peer went away mid-handshake; surface it as a failure.
                self.panel
                    .run_disconnect_hooks(&ProtocolError::ConnectionClosed);
            }
            Err(error) => self.panel.run_disconnect_hooks(error),
        }
    }
}
