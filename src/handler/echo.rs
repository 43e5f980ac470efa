// Line-oriented reference protocol
// Used by the daemon binary and the integration tests

use super::{ClientSession, Outcome, Protocol, ProviderSession, ResponseCode};
use crate::state::ClientConnectionState;
use tracing::{debug, info};

/// Newline-terminated text protocol
///
/// * `PING` is answered with `PONG`
/// * an empty line produces no reply
/// * `FWD <payload>` is forwarded to the provider when routing is enabled
/// * any frame containing `?` is a format error
/// * everything else is echoed back as `ECHO <frame>`
#[derive(Debug, Default)]
pub struct EchoProtocol;

impl Protocol for EchoProtocol {
    type Client = EchoClient;
    type Provider = EchoProvider;

    fn on_start(&self) {
        info!("Echo protocol ready");
    }

    fn on_accept(&self, client: &ClientConnectionState<Self>) {
        debug!(client_id = %client.id(), peer = ?client.peer_addr(), "Echo client accepted");
    }

    fn on_client_closed(&self, client: &ClientConnectionState<Self>) {
        debug!(client_id = %client.id(), "Echo client closed");
    }
}

#[derive(Debug, Default)]
pub struct EchoClient {
    request: Option<String>,
    reply: Option<String>,
    provider_reply: Option<String>,
}

impl ClientSession for EchoClient {
    type Request = String;

    fn process_incoming_frame(&mut self, frame: &str, outcome: &mut Outcome) -> anyhow::Result<()> {
        let line = frame.trim_end_matches(['\r', '\n']);
        self.reply = None;
        self.provider_reply = None;
        self.request = None;

        if line.contains('?') {
            outcome.response_code = ResponseCode::FormatError;
            return Ok(());
        }

        outcome.response_code = ResponseCode::Success;
        if line.is_empty() {
            return Ok(());
        }

        if line == "PING" {
            self.reply = Some("PONG".to_string());
        } else if let Some(payload) = line.strip_prefix("FWD ") {
            self.request = Some(payload.to_string());
            self.reply = Some(format!("ECHO {payload}"));
        } else {
            self.reply = Some(format!("ECHO {line}"));
        }
        Ok(())
    }

    fn compose_response_frame(&mut self, outcome: &Outcome) -> anyhow::Result<String> {
        if outcome.response_code != ResponseCode::Success {
            return Ok(format!("ERR {}\n", outcome.response_code));
        }

        let body = self.provider_reply.take().or_else(|| self.reply.take());
        Ok(body.map(|body| format!("{body}\n")).unwrap_or_default())
    }

    fn request(&self) -> Option<String> {
        self.request.clone()
    }

    fn accept_provider_response(&mut self, response: String) {
        self.provider_reply = Some(response);
    }
}

#[derive(Debug, Default)]
pub struct EchoProvider {
    request: String,
    reply: Option<String>,
}

impl ProviderSession for EchoProvider {
    type Request = String;

    fn seed_request(&mut self, request: Option<String>, outcome: &mut Outcome) {
        match request {
            Some(request) if !request.is_empty() => self.request = request,
            _ => outcome.response_code = ResponseCode::TransactionDenied,
        }
    }

    fn build_outgoing_frame(&mut self) -> anyhow::Result<String> {
        Ok(format!("{}\n", self.request))
    }

    fn persist_provider_transaction(&mut self, outcome: &Outcome) -> anyhow::Result<()> {
        debug!(request = %self.request, code = %outcome.response_code, "Provider call recorded");
        Ok(())
    }

    /// `OK <auth> <body>` or `DENY`
    fn process_provider_frame(&mut self, frame: &str, outcome: &mut Outcome) -> anyhow::Result<()> {
        let line = frame.trim_end_matches(['\r', '\n']);
        let mut parts = line.splitn(3, ' ');

        match parts.next() {
            Some("OK") => {
                outcome.response_code = ResponseCode::Success;
                outcome.authorization_code = parts.next().map(str::to_string);
                self.reply = Some(parts.next().unwrap_or_default().to_string());
            }
            Some("DENY") => {
                outcome.response_code = ResponseCode::TransactionDenied;
            }
            _ => anyhow::bail!("unrecognised provider frame: {line}"),
        }
        Ok(())
    }

    fn compose_provider_derived_response(&mut self, outcome: &mut Outcome) -> anyhow::Result<String> {
        Ok(match (&outcome.authorization_code, self.reply.take()) {
            (Some(auth), Some(body)) => format!("AUTH {auth} {body}"),
            (None, Some(body)) => body,
            (_, None) if outcome.response_code == ResponseCode::TransactionDenied => {
                "DENIED".to_string()
            }
            _ => String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(frame: &str) -> (EchoClient, Outcome) {
        let mut client = EchoClient::default();
        let mut outcome = Outcome::default();
        client.process_incoming_frame(frame, &mut outcome).unwrap();
        (client, outcome)
    }

    #[test]
    fn test_ping_pong() {
        let (mut client, outcome) = process("PING\r\n");
        assert_eq!(outcome.response_code, ResponseCode::Success);
        assert_eq!(client.compose_response_frame(&outcome).unwrap(), "PONG\n");
    }

    #[test]
    fn test_question_mark_is_format_error() {
        let (_, outcome) = process("???");
        assert_eq!(outcome.response_code, ResponseCode::FormatError);
    }

    #[test]
    fn test_empty_line_has_no_reply() {
        let (mut client, outcome) = process("\n");
        assert_eq!(client.compose_response_frame(&outcome).unwrap(), "");
    }

    #[test]
    fn test_forward_request_and_error_reply() {
        let (mut client, _) = process("FWD balance 42\n");
        assert_eq!(client.request().as_deref(), Some("balance 42"));

        let failed = Outcome {
            response_code: ResponseCode::NetworkError,
            authorization_code: None,
        };
        assert_eq!(client.compose_response_frame(&failed).unwrap(), "ERR 93\n");
    }

    #[test]
    fn test_provider_reply_flows_to_client() {
        let mut provider = EchoProvider::default();
        let mut outcome = Outcome::default();
        provider.seed_request(Some("balance".to_string()), &mut outcome);
        assert_eq!(provider.build_outgoing_frame().unwrap(), "balance\n");

        provider.process_provider_frame("OK 7F3A 100.00\n", &mut outcome).unwrap();
        assert_eq!(outcome.authorization_code.as_deref(), Some("7F3A"));
        let derived = provider.compose_provider_derived_response(&mut outcome).unwrap();
        assert_eq!(derived, "AUTH 7F3A 100.00");

        let (mut client, _) = process("FWD balance\n");
        client.accept_provider_response(derived);
        assert_eq!(client.compose_response_frame(&outcome).unwrap(), "AUTH 7F3A 100.00\n");
    }

    #[test]
    fn test_empty_request_is_denied_before_connecting() {
        let mut provider = EchoProvider::default();
        let mut outcome = Outcome::default();
        provider.seed_request(None, &mut outcome);
        assert_eq!(outcome.response_code, ResponseCode::TransactionDenied);
    }

    #[test]
    fn test_garbage_provider_frame_is_an_error() {
        let mut provider = EchoProvider::default();
        let mut outcome = Outcome::default();
        assert!(provider.process_provider_frame("WAT\n", &mut outcome).is_err());
    }
}
