//! # Inbound Connection Demultiplexing
//!
//! A freshly accepted channel carries no type information: its first bundle
//! must hold the fixed connection header followed by one selector byte naming
//! the protocol to attach. The header travels as a regular bundle — inside
//! the TLS and compression envelope, not before it.
//!
//! [`Demultiplexer`] reads that bundle, looks the selector up in its
//! registry, and replaces itself with the state the registered builder
//! produces. Anything else rejects the connection: the socket is closed
//! without further handshake and the event is logged at trace level only.
//!
//! [`Introduce`] is the outbound twin: it emits the header bundle and then
//! hands the channel to the real protocol state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CONNECTION_HEADER;
use crate::error::{ProtocolError, Result};
use crate::transport::channel::{BundleReader, BundleWriter, ChannelControl, ChannelState};

/// Builds the concrete connection state once a selector byte has been
/// accepted. Runs on the worker thread owning the connection.
pub type StateBuilder = Box<dyn Fn(&mut ChannelControl<'_>) -> Box<dyn ChannelState> + Send + Sync>;

/// Selector-byte registry shared by all inbound connections.
#[derive(Default)]
pub struct DemuxRegistry {
    handlers: HashMap<u8, StateBuilder>,
}

impl DemuxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol under a selector byte, replacing any previous
    /// registration.
    pub fn register<F>(&mut self, selector: u8, builder: F) -> &mut Self
    where
        F: Fn(&mut ChannelControl<'_>) -> Box<dyn ChannelState> + Send + Sync + 'static,
    {
        self.handlers.insert(selector, Box::new(builder));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn build(&self, selector: u8, ctl: &mut ChannelControl<'_>) -> Option<Box<dyn ChannelState>> {
        self.handlers.get(&selector).map(|builder| builder(ctl))
    }
}

/// Channel state for a connection whose type is not yet known.
pub struct Demultiplexer {
    registry: Arc<DemuxRegistry>,
}

impl Demultiplexer {
    pub fn new(registry: Arc<DemuxRegistry>) -> Self {
        Self { registry }
    }
}

impl ChannelState for Demultiplexer {
    fn on_bundle(
        &mut self,
        bundle: &mut BundleReader,
        _out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        let header = bundle.read_exact(CONNECTION_HEADER.len())?;
        if header != CONNECTION_HEADER {
            return Err(ProtocolError::Rejected);
        }
        let selector = bundle.read_u8()?;

        match self.registry.build(selector, ctl) {
            Some(next) => {
                ctl.replace_state(next);
                Ok(false)
            }
            None => Err(ProtocolError::UnknownSelector(selector)),
        }
    }

    fn on_send_ready(
        &mut self,
        _out: &mut BundleWriter<'_>,
        _ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Client-side opener: sends the connection header + selector as the first
/// bundle, then installs the real protocol state.
pub struct Introduce {
    selector: u8,
    next: Option<Box<dyn ChannelState>>,
}

impl Introduce {
    pub fn new(selector: u8, next: Box<dyn ChannelState>) -> Self {
        Self {
            selector,
            next: Some(next),
        }
    }
}

impl ChannelState for Introduce {
    fn on_bundle(
        &mut self,
        _bundle: &mut BundleReader,
        _out: &mut BundleWriter<'_>,
        _ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        // The peer must not speak before our introduction went out.
        Err(ProtocolError::MalformedPayload(
            "bundle received before introduction".into(),
        ))
    }

    fn on_send_ready(
        &mut self,
        out: &mut BundleWriter<'_>,
        ctl: &mut ChannelControl<'_>,
    ) -> Result<bool> {
        out.write_bytes(&CONNECTION_HEADER);
        out.write_u8(self.selector);
        if let Some(next) = self.next.take() {
            ctl.replace_state(next);
        }
        Ok(true)
    }

    fn on_shutdown(&mut self, result: &Result<()>) {
        // Hand lifecycle notifications to the protocol that never got
        // installed (e.g. the channel died before the introduction).
        if let Some(next) = &mut self.next {
            next.on_shutdown(result);
        }
    }
}
