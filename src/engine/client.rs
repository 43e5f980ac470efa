// Client connection path
// Accept loop plus the per-client receive, process and respond cycle

use super::ServerEngine;
use crate::buffer::BufferSlice;
use crate::handler::{ClientSession, Protocol, ResponseCode};
use crate::state::ClientConnectionState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Pause after a failed accept so a persistent error (EMFILE) does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// What the receive loop does after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Continue,
    Close,
}

impl<P: Protocol> ServerEngine<P> {
    /// Admit clients until the stop token fires
    pub(super) async fn accept_loop(self: Arc<Self>, listener: TcpListener, stop: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.is_draining() {
                        break;
                    }
                    warn!(error = %e, "Accept failed, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            // Backpressure: the loop stalls here until a client slot frees up
            let permit = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                permit = self.admission.acquire_client() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.admit(stream, peer, permit);
        }

        debug!("Accept loop stopped");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let state = match self.clients.acquire() {
            Ok(state) => state,
            Err(e) => {
                self.log_pool_failure("client", &e);
                return;
            }
        };

        let buffer = match self.buffers.acquire() {
            Ok(buffer) => buffer,
            Err(e) => {
                self.log_pool_failure("buffer", &e);
                self.clients.release(state);
                return;
            }
        };

        state.clear_response_in_flight();
        state.set_peer_addr(peer);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Could not disable Nagle");
        }
        self.protocol.on_accept(&state);

        if let Err(e) = self.registry.register(&state) {
            warn!(peer = %peer, error = %e, "Rejecting client");
            self.protocol.on_client_closed(&state);
            self.buffers.release(buffer);
            self.clients.release(state);
            return;
        }

        info!(client_id = %state.id(), peer = %peer, "Client connected");

        let span = info_span!("client", id = %state.id(), peer = %peer);
        let connection = ClientConnection {
            engine: self.clone(),
            state,
            stream,
            buffer,
            permit,
        };
        self.tasks.spawn(connection.run().instrument(span));
    }
}

/// One accepted client and everything it holds until teardown
struct ClientConnection<P: Protocol> {
    engine: Arc<ServerEngine<P>>,
    state: Arc<ClientConnectionState<P>>,
    stream: TcpStream,
    buffer: BufferSlice,
    permit: OwnedSemaphorePermit,
}

impl<P: Protocol> ClientConnection<P> {
    async fn run(mut self) {
        let shutdown = self.state.shutdown_token();

        loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.stream.read(&mut self.buffer[..]) => received,
            };

            match received {
                Ok(0) => {
                    debug!("Client closed the connection");
                    break;
                }
                Ok(n) => {
                    self.engine.traffic.record(n);
                    if self.process_frame(n).await == Disposition::Close {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Receive failed");
                    break;
                }
            }
        }

        self.teardown().await;
    }

    async fn process_frame(&mut self, n: usize) -> Disposition {
        self.state.clear_response_in_flight();
        self.state.touch();

        let frame = self.engine.config.charset.decode(&self.buffer[..n]);
        let processed = self
            .state
            .with_session(|session, outcome| session.process_incoming_frame(&frame, outcome));
        if let Err(e) = processed {
            warn!(error = %format!("{e:#}"), "Client frame handler failed");
            self.state.set_response_code(ResponseCode::ProcessError);
            return Disposition::Close;
        }

        let settings = self.engine.settings();

        let code = if self.state.budget_exceeded() {
            warn!(budget = ?self.state.timeout_budget(), "Client budget exceeded while processing");
            self.state.set_response_code(ResponseCode::InternalTimeOut);
            ResponseCode::InternalTimeOut
        } else {
            self.state.response_code()
        };

        match code {
            ResponseCode::Success if settings.router_mode && !settings.test_mode => {
                match settings.endpoints.as_ref() {
                    Some(endpoints) => self.engine.forward(&self.state, endpoints).await,
                    None => self.state.set_response_code(ResponseCode::ProviderDown),
                }
                self.respond(settings.test_mode).await
            }
            code if code.closes_connection() => {
                debug!(code = %code, "Closing client without reply");
                Disposition::Close
            }
            _ => self.respond(settings.test_mode).await,
        }
    }

    /// Send at most one reply for the current receive cycle
    async fn respond(&mut self, test_mode: bool) -> Disposition {
        if !self.state.mark_response_in_flight() {
            debug!("Response already in flight");
            return Disposition::Continue;
        }

        let composed = self.state.with_session(|session, outcome| {
            let frame = session.compose_response_frame(outcome)?;
            if !frame.is_empty() && !test_mode {
                if let Err(e) = session.persist_transaction(outcome) {
                    warn!(error = %format!("{e:#}"), "Persisting transaction failed");
                }
            }
            Ok::<_, anyhow::Error>(frame)
        });

        let frame = match composed {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Composing response failed");
                self.state.set_response_code(ResponseCode::ProcessError);
                return Disposition::Close;
            }
        };

        // Nothing to say; keep listening on the same socket
        if frame.is_empty() {
            return Disposition::Continue;
        }

        let bytes = self.engine.config.charset.encode(&frame);
        if bytes.len() > self.buffer.len() {
            warn!(
                size = bytes.len(),
                slice_size = self.buffer.len(),
                "Response does not fit the buffer slice"
            );
            return Disposition::Close;
        }
        self.buffer[..bytes.len()].copy_from_slice(&bytes);

        let shutdown = self.state.shutdown_token();
        let sent = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Disposition::Close,
            sent = self.stream.write_all(&self.buffer[..bytes.len()]) => sent,
        };

        match sent {
            Ok(()) => {
                self.engine.traffic.record(bytes.len());
                debug!(bytes = bytes.len(), code = %self.state.response_code(), "Response sent");
                Disposition::Continue
            }
            Err(e) => {
                debug!(error = %e, "Send failed");
                Disposition::Close
            }
        }
    }

    async fn teardown(self) {
        let ClientConnection {
            engine,
            state,
            mut stream,
            buffer,
            permit,
        } = self;
        let id = state.id();

        // Unbounded wait: the state is recycled below and must not stay registered
        if engine.registry.evict(id).is_some() {
            debug!(client_id = %id, "Client unregistered");
        }

        if let Err(e) = stream.shutdown().await {
            debug!(error = %e, "Socket shutdown failed");
        }
        drop(stream);

        engine.protocol.on_client_closed(&state);
        engine.buffers.release(buffer);
        engine.clients.release(state);
        drop(permit);

        info!(client_id = %id, "Client disconnected");
    }
}
