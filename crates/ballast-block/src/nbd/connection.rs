//! Per-connection NBD session
//!
//! Drives one client through handshake, option negotiation, and the
//! transmission phase. Negotiating an export acquires its lease and binds a
//! fresh storage engine to the session; both are torn down on disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ballast_store::ObjectClient;

use super::{
    encode_option_reply, encode_simple_reply, export_info_payload, handshake_greeting,
    parse_go_payload, ClientFlags, NbdCommand, NbdOption, NbdRequest, NbdReplyType, OptionHeader,
    TransmissionFlags, MAX_IO_LEN,
};
use crate::config::ServerConfig;
use crate::error::{BlockError, BlockResult, NbdErrno};
use crate::lease::LeaseManager;
use crate::storage::ExportStorage;

/// Consecutive storage failures tolerated before the session closes
const MAX_STORAGE_FAILURES: u32 = 3;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Preface not yet sent
    AwaitHandshake,
    /// Waiting for the 32-bit client flags
    AwaitClientFlags,
    /// Option negotiation phase
    Option,
    /// Command phase
    Transmission,
    /// Terminal
    Closing,
}

/// Server-wide pieces each session borrows.
pub struct SessionContext {
    /// Server configuration
    pub config: ServerConfig,
    /// Shared object client
    pub client: Arc<ObjectClient>,
    /// Lease issuer
    pub leases: Arc<LeaseManager>,
}

/// How one handled command left the session.
enum CmdOutcome {
    Done,
    StorageError,
}

/// One client connection.
pub struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    id: u64,
    ctx: Arc<SessionContext>,
    shutdown: broadcast::Receiver<()>,
    state: SessionState,
    commands_handled: u64,
}

impl Session {
    /// Create a session over an accepted stream.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        id: u64,
        ctx: Arc<SessionContext>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            peer,
            id,
            ctx,
            shutdown,
            state: SessionState::AwaitHandshake,
            commands_handled: 0,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> BlockResult<()> {
        self.stream.write_all(&handshake_greeting()).await?;
        self.state = SessionState::AwaitClientFlags;

        let flags = ClientFlags::new(self.stream.read_u32().await?);
        if !flags.has_fixed_newstyle() {
            warn!(
                session = self.id,
                flags = flags.bits(),
                "client does not speak fixed newstyle, closing"
            );
            self.state = SessionState::Closing;
            return Ok(());
        }
        self.state = SessionState::Option;

        let storage = match self.negotiate().await? {
            Some(storage) => storage,
            None => {
                self.state = SessionState::Closing;
                return Ok(());
            }
        };

        self.state = SessionState::Transmission;
        info!(
            session = self.id,
            peer = %self.peer,
            export = storage.export(),
            "entering transmission phase"
        );

        let result = self.transmission(&storage).await;
        self.state = SessionState::Closing;
        // NBD semantics: only client-issued FLUSHes are durable. Whatever
        // is still buffered is discarded with the engine.
        storage.release().await;
        match result {
            Err(BlockError::ShuttingDown) => Ok(()),
            other => other,
        }
    }

    /// Option phase. Returns the bound storage engine, or `None` when the
    /// client aborted or was refused.
    async fn negotiate(&mut self) -> BlockResult<Option<ExportStorage>> {
        loop {
            let mut header = [0u8; OptionHeader::SIZE];
            self.stream.read_exact(&mut header).await?;
            let header = OptionHeader::parse(&header)?;

            let mut data = vec![0u8; header.length as usize];
            if header.length > 0 {
                self.stream.read_exact(&mut data).await?;
            }

            match NbdOption::try_from(header.option) {
                Ok(NbdOption::Go) => {
                    let export = parse_go_payload(&data)?;
                    return self.handle_go(header.option, &export).await;
                }
                Ok(NbdOption::Abort) => {
                    debug!(session = self.id, "client aborted negotiation");
                    self.send_option_reply(header.option, NbdReplyType::Ack, &[])
                        .await?;
                    return Ok(None);
                }
                Err(_) => {
                    debug!(
                        session = self.id,
                        option = header.option,
                        "unsupported option"
                    );
                    self.send_option_reply(header.option, NbdReplyType::ErrUnsup, &[])
                        .await?;
                }
            }
        }
    }

    async fn handle_go(&mut self, option: u32, export: &str) -> BlockResult<Option<ExportStorage>> {
        let holder_id = Uuid::new_v4().simple().to_string();
        info!(
            session = self.id,
            export,
            holder = %holder_id,
            "client requested export"
        );

        match self.ctx.leases.acquire(export, &holder_id).await {
            Ok(lease) => {
                let info = export_info_payload(
                    self.ctx.config.export_size,
                    TransmissionFlags::export_default(),
                );
                let sent = match self.send_option_reply(option, NbdReplyType::Info, &info).await {
                    Ok(()) => self.send_option_reply(option, NbdReplyType::Ack, &[]).await,
                    Err(e) => Err(e),
                };
                // A dead socket after a successful acquire must still hand
                // the lease back; dropping the handle would leave the
                // record blocking other clients until the ttl.
                if let Err(e) = sent {
                    warn!(
                        session = self.id,
                        export,
                        "reply failed after lease acquire, releasing: {e}"
                    );
                    lease.release().await;
                    return Err(e);
                }

                let storage = ExportStorage::new(
                    export,
                    self.ctx.config.export_size,
                    Arc::clone(&self.ctx.client),
                    lease,
                    self.ctx.config.flush_parallelism,
                );
                Ok(Some(storage))
            }
            Err(BlockError::LeaseConflict(_)) => {
                warn!(session = self.id, export, "export leased elsewhere, refusing");
                self.send_option_reply(option, NbdReplyType::ErrPolicy, &[])
                    .await?;
                Ok(None)
            }
            Err(e) => {
                error!(session = self.id, export, "lease acquisition failed: {e}");
                self.send_option_reply(option, NbdReplyType::ErrPolicy, &[])
                    .await?;
                Err(e)
            }
        }
    }

    /// Transmission phase: serial command dispatch, replies in request
    /// order. Aborts on lease loss or server shutdown.
    async fn transmission(&mut self, storage: &ExportStorage) -> BlockResult<()> {
        let mut lost = storage.lease().subscribe();
        let mut request_buf = [0u8; NbdRequest::SIZE];
        let mut storage_failures = 0u32;

        loop {
            tokio::select! {
                read = self.stream.read_exact(&mut request_buf) => {
                    match read {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            debug!(session = self.id, "client disconnected");
                            return Ok(());
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                _ = lost.recv() => {
                    error!(
                        session = self.id,
                        export = storage.export(),
                        "lease lost, aborting session"
                    );
                    return Err(BlockError::LeaseLost(storage.export().to_string()));
                }
                _ = self.shutdown.recv() => {
                    info!(session = self.id, "server shutting down, closing session");
                    return Err(BlockError::ShuttingDown);
                }
            }

            let request = NbdRequest::parse(&request_buf)?;
            self.commands_handled += 1;
            debug!(
                session = self.id,
                seq = self.commands_handled,
                kind = request.kind,
                offset = request.offset,
                length = request.length,
                "command"
            );

            let outcome = match request.command() {
                Ok(NbdCommand::Disc) => {
                    debug!(session = self.id, "client requested disconnect");
                    return Ok(());
                }
                // Losing the lease cancels the command in flight; the
                // client gets no reply, only the close.
                Ok(command) => tokio::select! {
                    outcome = async {
                        match command {
                            NbdCommand::Read => self.handle_read(&request, storage).await,
                            NbdCommand::Write => self.handle_write(&request, storage).await,
                            NbdCommand::Flush => self.handle_flush(&request, storage).await,
                            NbdCommand::Disc => Ok(CmdOutcome::Done), // handled above
                        }
                    } => outcome?,
                    _ = lost.recv() => {
                        error!(
                            session = self.id,
                            export = storage.export(),
                            "lease lost mid-command, aborting session without reply"
                        );
                        return Err(BlockError::LeaseLost(storage.export().to_string()));
                    }
                },
                Err(e) => {
                    warn!(session = self.id, kind = request.kind, "unsupported command");
                    self.send_reply(request.handle, e.to_errno()).await?;
                    CmdOutcome::Done
                }
            };

            match outcome {
                CmdOutcome::Done => storage_failures = 0,
                CmdOutcome::StorageError => {
                    storage_failures += 1;
                    if storage_failures >= MAX_STORAGE_FAILURES {
                        warn!(
                            session = self.id,
                            "repeated storage failures, closing session"
                        );
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_read(
        &mut self,
        request: &NbdRequest,
        storage: &ExportStorage,
    ) -> BlockResult<CmdOutcome> {
        if request.length > MAX_IO_LEN {
            self.send_reply(request.handle, NbdErrno::Inval).await?;
            return Ok(CmdOutcome::Done);
        }

        match storage.read(request.offset, request.length).await {
            Ok(data) => {
                let mut buf = BytesMut::with_capacity(16 + data.len());
                buf.extend_from_slice(&encode_simple_reply(NbdErrno::Ok, request.handle));
                buf.extend_from_slice(&data);
                self.stream.write_all(&buf).await?;
                Ok(CmdOutcome::Done)
            }
            Err(BlockError::Range { .. }) => {
                debug!(
                    session = self.id,
                    offset = request.offset,
                    length = request.length,
                    "read out of bounds"
                );
                self.send_reply(request.handle, NbdErrno::Inval).await?;
                Ok(CmdOutcome::Done)
            }
            Err(BlockError::Storage(e)) => {
                error!(session = self.id, "read failed: {e}");
                self.send_reply(request.handle, NbdErrno::Io).await?;
                Ok(CmdOutcome::StorageError)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_write(
        &mut self,
        request: &NbdRequest,
        storage: &ExportStorage,
    ) -> BlockResult<CmdOutcome> {
        if request.length > MAX_IO_LEN {
            self.drain_payload(request.length as u64).await?;
            self.send_reply(request.handle, NbdErrno::Inval).await?;
            return Ok(CmdOutcome::Done);
        }

        // The payload is always consumed, even when the write is rejected;
        // the stream must stay framed.
        let mut data = vec![0u8; request.length as usize];
        self.stream.read_exact(&mut data).await?;

        match storage.write(request.offset, &data).await {
            Ok(()) => {
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(CmdOutcome::Done)
            }
            Err(BlockError::Range { .. }) => {
                debug!(
                    session = self.id,
                    offset = request.offset,
                    length = request.length,
                    "write out of bounds"
                );
                self.send_reply(request.handle, NbdErrno::Inval).await?;
                Ok(CmdOutcome::Done)
            }
            Err(BlockError::Storage(e)) => {
                error!(session = self.id, "write failed: {e}");
                self.send_reply(request.handle, NbdErrno::Io).await?;
                Ok(CmdOutcome::StorageError)
            }
            Err(e) => Err(e),
        }
    }

    async fn handle_flush(
        &mut self,
        request: &NbdRequest,
        storage: &ExportStorage,
    ) -> BlockResult<CmdOutcome> {
        match storage.flush().await {
            Ok(()) => {
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(CmdOutcome::Done)
            }
            Err(BlockError::Storage(e)) => {
                error!(session = self.id, "flush failed: {e}");
                self.send_reply(request.handle, NbdErrno::Io).await?;
                Ok(CmdOutcome::StorageError)
            }
            Err(e) => Err(e),
        }
    }

    async fn send_reply(&mut self, handle: u64, errno: NbdErrno) -> BlockResult<()> {
        self.stream
            .write_all(&encode_simple_reply(errno, handle))
            .await?;
        Ok(())
    }

    async fn send_option_reply(
        &mut self,
        option: u32,
        reply: NbdReplyType,
        data: &[u8],
    ) -> BlockResult<()> {
        self.stream
            .write_all(&encode_option_reply(option, reply, data))
            .await?;
        Ok(())
    }

    async fn drain_payload(&mut self, mut remaining: u64) -> BlockResult<()> {
        let mut buf = [0u8; 8192];
        while remaining > 0 {
            let n = remaining.min(buf.len() as u64) as usize;
            self.stream.read_exact(&mut buf[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }
}
