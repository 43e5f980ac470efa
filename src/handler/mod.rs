// Handler collaborator interfaces
// Frame parsing, response composition and persistence are supplied by the protocol

pub mod echo;

use crate::config::EngineConfig;
use crate::engine::ServerEngine;
use crate::state::{ClientConnectionState, ProviderConnectionState};
use serde::Serialize;
use std::fmt;

/// Result code attached to every transaction
///
/// Numeric values are part of the contract with protocol handlers; the
/// engine only branches on the variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseCode {
    #[default]
    Success,
    TransactionDenied,
    /// Connect, send or receive to the provider failed
    NetworkError,
    /// The client's own budget ran out while processing
    InternalTimeOut,
    /// Unparseable input; the client is closed without a reply
    FormatError,
    /// Handler failure; the client is closed without a reply
    ProcessError,
    /// Failure while initiating provider I/O
    SocketCriticalError,
    /// Provider send/receive failed or timed out
    NoResponseProvider,
    ProviderDown,
    /// Protocol-specific code passed through untouched
    Other(u16),
}

impl ResponseCode {
    pub fn code(&self) -> u16 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::TransactionDenied => 5,
            ResponseCode::FormatError => 30,
            ResponseCode::InternalTimeOut => 68,
            ResponseCode::NoResponseProvider => 82,
            ResponseCode::ProviderDown => 91,
            ResponseCode::SocketCriticalError => 92,
            ResponseCode::NetworkError => 93,
            ResponseCode::ProcessError => 96,
            ResponseCode::Other(code) => *code,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            0 => ResponseCode::Success,
            5 => ResponseCode::TransactionDenied,
            30 => ResponseCode::FormatError,
            68 => ResponseCode::InternalTimeOut,
            82 => ResponseCode::NoResponseProvider,
            91 => ResponseCode::ProviderDown,
            92 => ResponseCode::SocketCriticalError,
            93 => ResponseCode::NetworkError,
            96 => ResponseCode::ProcessError,
            other => ResponseCode::Other(other),
        }
    }

    /// Codes after which no reply is trusted and the client is dropped
    pub fn closes_connection(&self) -> bool {
        matches!(self, ResponseCode::FormatError | ResponseCode::ProcessError)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.code())
    }
}

/// Engine-visible result of a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub response_code: ResponseCode,
    pub authorization_code: Option<String>,
}

impl Outcome {
    /// Copy codes from another outcome (provider -> client)
    pub fn adopt(&mut self, other: &Outcome) {
        self.response_code = other.response_code;
        self.authorization_code = other.authorization_code.clone();
    }
}

/// Per-client handler state, reset to `Default` on every checkout
pub trait ClientSession: Default + Send + 'static {
    /// Parsed request handed to the provider side
    type Request: Clone + Send + 'static;

    /// Parse a received frame and set `outcome.response_code`
    fn process_incoming_frame(&mut self, frame: &str, outcome: &mut Outcome) -> anyhow::Result<()>;

    /// Build the reply; an empty string means "no reply, keep listening"
    fn compose_response_frame(&mut self, outcome: &Outcome) -> anyhow::Result<String>;

    /// Record the transaction before the reply goes out
    fn persist_transaction(&mut self, _outcome: &Outcome) -> anyhow::Result<()> {
        Ok(())
    }

    /// Request to seed a provider call with
    fn request(&self) -> Option<Self::Request>;

    /// Receive the provider-derived response before composing the reply
    fn accept_provider_response(&mut self, _response: String) {}
}

/// Per-provider-call handler state, reset to `Default` on every checkout
pub trait ProviderSession: Default + Send + 'static {
    type Request: Clone + Send + 'static;

    /// Copy the client's request in; may flag a non-success code to skip the call
    fn seed_request(&mut self, request: Option<Self::Request>, outcome: &mut Outcome);

    fn build_outgoing_frame(&mut self) -> anyhow::Result<String>;

    /// Record the call before it is sent, whatever the result turns out to be
    fn persist_provider_transaction(&mut self, _outcome: &Outcome) -> anyhow::Result<()> {
        Ok(())
    }

    fn process_provider_frame(&mut self, frame: &str, outcome: &mut Outcome) -> anyhow::Result<()>;

    /// Build the response for the client; empty means nothing usable came back
    fn compose_provider_derived_response(&mut self, outcome: &mut Outcome) -> anyhow::Result<String>;
}

/// A complete protocol plugged into the engine
pub trait Protocol: Send + Sync + Sized + 'static {
    type Client: ClientSession;
    type Provider: ProviderSession<Request = <Self::Client as ClientSession>::Request>;

    /// Environment/licence validation run by `pre_initialize`
    fn verify_environment(&self, config: &EngineConfig) -> anyhow::Result<()> {
        crate::runtime::verify_environment(config)
    }

    fn on_start(&self) {}

    fn on_accept(&self, _client: &ClientConnectionState<Self>) {}

    fn on_client_closed(&self, _client: &ClientConnectionState<Self>) {}

    /// Called once a provider request is on the wire, before its single receive
    ///
    /// A protocol that wants to give up on the call early does it here with
    /// `engine.close_socket_provider(call)`; the client then answers with
    /// `NoResponseProvider`.
    fn on_provider_request_sent(
        &self,
        _engine: &ServerEngine<Self>,
        _call: &ProviderConnectionState<Self>,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping_is_stable() {
        for code in [
            ResponseCode::Success,
            ResponseCode::TransactionDenied,
            ResponseCode::NetworkError,
            ResponseCode::InternalTimeOut,
            ResponseCode::FormatError,
            ResponseCode::ProcessError,
            ResponseCode::SocketCriticalError,
            ResponseCode::NoResponseProvider,
            ResponseCode::ProviderDown,
            ResponseCode::Other(55),
        ] {
            assert_eq!(ResponseCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn test_display_is_two_digits() {
        assert_eq!(ResponseCode::Success.to_string(), "00");
        assert_eq!(ResponseCode::TransactionDenied.to_string(), "05");
        assert_eq!(ResponseCode::Other(123).to_string(), "123");
    }

    #[test]
    fn test_only_format_and_process_errors_close() {
        assert!(ResponseCode::FormatError.closes_connection());
        assert!(ResponseCode::ProcessError.closes_connection());
        assert!(!ResponseCode::NetworkError.closes_connection());
        assert!(!ResponseCode::Other(12).closes_connection());
    }

    #[test]
    fn test_outcome_adopt() {
        let mut client = Outcome::default();
        let provider = Outcome {
            response_code: ResponseCode::TransactionDenied,
            authorization_code: Some("A1B2".to_string()),
        };
        client.adopt(&provider);
        assert_eq!(client, provider);
    }
}
