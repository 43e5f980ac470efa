// Provider forwarding path
// One-shot outbound call per client request, supervised against the client's budget

use super::{ProviderEndpoints, ServerEngine};
use crate::buffer::BufferSlice;
use crate::handler::{ClientSession, Outcome, Protocol, ProviderSession, ResponseCode};
use crate::state::{ClientConnectionState, ProviderConnectionState};
use crate::supervisor;
use std::io;
use socket2::SockRef;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info_span, warn, Instrument};

/// Why a provider call ended without a usable reply
#[derive(Debug, Error)]
enum ExchangeError {
    #[error("provider call closed before its reply was used")]
    Cancelled,

    #[error("client closed during the provider call")]
    ClientGone,

    #[error("connect failed: {0}")]
    Connect(io::Error),

    #[error("connect did not complete within {0:?}")]
    ConnectTimeout(Duration),

    #[error("building the outgoing frame failed: {0:#}")]
    Build(anyhow::Error),

    #[error("outgoing frame of {size} bytes exceeds the {slice_size}-byte slice")]
    Oversize { size: usize, slice_size: usize },

    #[error("send failed: {0}")]
    Send(io::Error),

    #[error("receive failed: {0}")]
    Receive(io::Error),

    #[error("provider closed the connection without replying")]
    NoReply,
}

impl ExchangeError {
    fn response_code(&self) -> ResponseCode {
        match self {
            ExchangeError::Connect(_) | ExchangeError::ConnectTimeout(_) => {
                ResponseCode::NetworkError
            }
            ExchangeError::Build(_) | ExchangeError::Oversize { .. } => {
                ResponseCode::SocketCriticalError
            }
            ExchangeError::Cancelled
            | ExchangeError::ClientGone
            | ExchangeError::Send(_)
            | ExchangeError::Receive(_)
            | ExchangeError::NoReply => ResponseCode::NoResponseProvider,
        }
    }
}

impl<P: Protocol> ServerEngine<P> {
    /// Forward the client's request and leave the result on the client state
    ///
    /// At most one provider attempt is made per client request. Whatever
    /// happens, the client state ends up with a response code to reply with.
    pub(super) async fn forward(
        &self,
        client: &Arc<ClientConnectionState<P>>,
        endpoints: &ProviderEndpoints,
    ) {
        let shutdown = client.shutdown_token();
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            permit = self.admission.acquire_provider() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    client.set_response_code(ResponseCode::ProviderDown);
                    return;
                }
            },
        };

        let state = match self.providers.acquire() {
            Ok(state) => state,
            Err(e) => {
                self.log_pool_failure("provider", &e);
                client.set_response_code(ResponseCode::ProviderDown);
                return;
            }
        };

        let request = client.with_session(|session, _| session.request());
        state.link_client(client.clone());
        state.clear_timed_out();
        let seeded = state.with_session(|session, outcome| {
            session.seed_request(request, outcome);
            outcome.clone()
        });

        if seeded.response_code != ResponseCode::Success {
            debug!(code = %seeded.response_code, "Provider call skipped by pre-check");
            client.adopt_outcome(&seeded);
            self.release_provider(state, None, permit);
            return;
        }

        let buffer = match self.buffers.acquire() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.log_pool_failure("buffer", &e);
                client.set_response_code(ResponseCode::SocketCriticalError);
                self.release_provider(state, None, permit);
                return;
            }
        };

        let endpoint = endpoints.next();
        state.set_endpoint(endpoint);
        let span = info_span!("provider", call_id = %state.call_id(), endpoint = %endpoint);

        let mut exchange = ProviderExchange {
            engine: self,
            state,
            client: client.clone(),
            buffer,
            stream: None,
        };

        async {
            if let Err(e) = exchange.run(endpoint).await {
                warn!(error = %e, "Provider call failed");
                exchange.fail(e.response_code());
            }
            exchange.close();
        }
        .instrument(span)
        .await;

        drop(permit);
    }
}

/// Resources held for one provider call
struct ProviderExchange<'a, P: Protocol> {
    engine: &'a ServerEngine<P>,
    state: Arc<ProviderConnectionState<P>>,
    client: Arc<ClientConnectionState<P>>,
    buffer: BufferSlice,
    stream: Option<TcpStream>,
}

impl<'a, P: Protocol> ProviderExchange<'a, P> {
    async fn run(&mut self, endpoint: SocketAddr) -> Result<(), ExchangeError> {
        let cancel = self.state.cancel_token();
        let client_gone = self.client.shutdown_token();

        // The supervisor is not armed yet, so the budget bounds the connect directly
        let spent = self.client.elapsed_since_activity().unwrap_or_default();
        let remaining = self.client.timeout_budget().saturating_sub(spent);

        let connected = tokio::select! {
            biased;
            _ = client_gone.cancelled() => return Err(ExchangeError::ClientGone),
            connected = tokio::time::timeout(remaining, TcpStream::connect(endpoint)) => connected,
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ExchangeError::Connect(e)),
            Err(_) => return Err(ExchangeError::ConnectTimeout(remaining)),
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Could not disable Nagle on provider socket");
        }
        let stream = self.stream.insert(stream);

        let frame = self
            .state
            .with_session(|session, outcome| {
                let frame = session.build_outgoing_frame()?;
                if let Err(e) = session.persist_provider_transaction(outcome) {
                    warn!(error = %format!("{e:#}"), "Persisting provider transaction failed");
                }
                Ok::<_, anyhow::Error>(frame)
            })
            .map_err(ExchangeError::Build)?;

        let bytes = self.engine.config.charset.encode(&frame);
        if bytes.len() > self.buffer.len() {
            return Err(ExchangeError::Oversize {
                size: bytes.len(),
                slice_size: self.buffer.len(),
            });
        }
        self.buffer[..bytes.len()].copy_from_slice(&bytes);

        self.state
            .arm_timer(supervisor::spawn(self.state.clone(), self.client.clone()));

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            _ = client_gone.cancelled() => return Err(ExchangeError::ClientGone),
            sent = stream.write_all(&self.buffer[..bytes.len()]) => sent,
        };
        sent.map_err(ExchangeError::Send)?;
        self.engine.traffic.record(bytes.len());
        self.engine
            .protocol
            .on_provider_request_sent(self.engine, &self.state);

        // Exactly one receive per call
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            _ = client_gone.cancelled() => return Err(ExchangeError::ClientGone),
            received = stream.read(&mut self.buffer[..]) => received,
        };
        let n = match received {
            Ok(0) => return Err(ExchangeError::NoReply),
            Ok(n) => n,
            Err(e) => return Err(ExchangeError::Receive(e)),
        };
        self.engine.traffic.record(n);

        self.state.dispose_timer();
        self.process_reply(n)
    }

    fn process_reply(&self, n: usize) -> Result<(), ExchangeError> {
        let frame = self.engine.config.charset.decode(&self.buffer[..n]);

        // Decided under the call lock so a concurrent supervisor tick cannot interleave
        let settled = self.state.with_session(|session, outcome| {
            if self.state.is_timed_out() {
                return None;
            }

            let derived = session
                .process_provider_frame(&frame, outcome)
                .and_then(|()| session.compose_provider_derived_response(outcome));

            let derived = match derived {
                Ok(response) if response.is_empty() => {
                    warn!("Provider reply produced no response for the client");
                    outcome.response_code = ResponseCode::ProcessError;
                    None
                }
                Ok(response) => Some(response),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Provider frame handler failed");
                    outcome.response_code = ResponseCode::ProcessError;
                    None
                }
            };
            Some((outcome.clone(), derived))
        });

        let Some((outcome, derived)) = settled else {
            return Err(ExchangeError::Cancelled);
        };

        self.client.adopt_outcome(&outcome);
        if let Some(response) = derived {
            self.client
                .with_session(|session, _| session.accept_provider_response(response));
        }
        debug!(code = %outcome.response_code, "Provider reply processed");
        Ok(())
    }

    /// Put the failure code on both sides of the call
    fn fail(&self, code: ResponseCode) {
        self.state.set_response_code(code);
        let outcome = Outcome {
            response_code: code,
            authorization_code: None,
        };
        self.client.adopt_outcome(&outcome);
    }

    fn close(self) {
        let ProviderExchange {
            engine,
            state,
            buffer,
            stream,
            ..
        } = self;

        state.dispose_timer();

        // A timed-out call was already abandoned; just drop the socket
        if let Some(stream) = stream {
            if !state.is_timed_out() {
                if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
                    debug!(error = %e, "Provider socket shutdown failed");
                }
            }
        }

        engine.buffers.release(buffer);
        engine.providers.release(state);
    }
}
