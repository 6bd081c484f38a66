pub mod dispatch;
pub mod executor;
pub mod portal;
pub mod response;
pub mod session;
pub mod sql_state;
pub mod statement;
pub mod testing;
pub mod value;

use std::{future::poll_fn, net::SocketAddr, ops::ControlFlow, sync::Arc};

use bytes::Buf;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use pgwire::{
    api::{ClientInfo, ClientInfoHolder},
    error::{ErrorInfo, PgWireError},
    messages::{
        response::{ReadyForQuery, READY_STATUS_IDLE},
        startup::{ParameterStatus, SslRequest},
        PgWireBackendMessage, PgWireFrontendMessage,
    },
    tokio::PgWireMessageServerCodec,
};
use quay_types::{
    backend::BackendPool, codec::BinaryValueCodec, config::PgConfig, dialect::Dialect,
    statement::SqlFrontend,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::mpsc::{channel, Sender},
    task::block_in_place,
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, trace, warn};

use crate::{dispatch::AggregatedPacket, session::Session, sql_state::SqlState};

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct PgServer {
    pub local_addr: SocketAddr,
}

pub enum BackendResponse {
    Message {
        message: PgWireBackendMessage,
        flush: bool,
    },
    Flush,
}

impl From<(PgWireBackendMessage, bool)> for BackendResponse {
    fn from((message, flush): (PgWireBackendMessage, bool)) -> Self {
        Self::Message { message, flush }
    }
}

pub(crate) fn send(
    back_tx: &Sender<BackendResponse>,
    message: PgWireBackendMessage,
    flush: bool,
) -> Result<(), BoxError> {
    back_tx.blocking_send((message, flush).into())?;
    Ok(())
}

pub(crate) fn send_error(
    back_tx: &Sender<BackendResponse>,
    severity: &str,
    code: &str,
    message: impl Into<String>,
    flush: bool,
) -> Result<(), BoxError> {
    send(
        back_tx,
        PgWireBackendMessage::ErrorResponse(
            ErrorInfo::new(severity.to_owned(), code.to_owned(), message.into()).into(),
        ),
        flush,
    )
}

/// Boundary collaborators the protocol engine consumes. All of them are
/// read-only and process-wide except the backend pool, which hands out one
/// dedicated executor per connection.
#[derive(Clone)]
pub struct Proxy {
    pub frontend: Arc<dyn SqlFrontend>,
    pub dialect: &'static dyn Dialect,
    pub codec: Arc<dyn BinaryValueCodec>,
    pub backends: Arc<dyn BackendPool>,
}

async fn peek_for_sslrequest(
    tcp_socket: &mut TcpStream,
    ssl_supported: bool,
) -> std::io::Result<bool> {
    let mut ssl = false;
    let mut buf = [0u8; SslRequest::BODY_SIZE];
    let mut buf = ReadBuf::new(&mut buf);
    loop {
        let size = poll_fn(|cx| tcp_socket.poll_peek(cx, &mut buf)).await?;
        if size == 0 {
            // the tcp_stream has ended
            return Ok(false);
        }
        if size == SslRequest::BODY_SIZE {
            let mut buf_ref = buf.filled();
            // skip first 4 bytes
            buf_ref.get_i32();
            if buf_ref.get_i32() == SslRequest::BODY_MAGIC_NUMBER {
                // the socket is sending sslrequest, read the first 8 bytes
                tcp_socket
                    .read_exact(&mut [0u8; SslRequest::BODY_SIZE])
                    .await?;
                if ssl_supported {
                    ssl = true;
                    tcp_socket.write_all(b"S").await?;
                } else {
                    tcp_socket.write_all(b"N").await?;
                }
            }

            return Ok(ssl);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PgStartError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub async fn start(
    proxy: Proxy,
    pg: PgConfig,
    cancel: CancellationToken,
) -> Result<PgServer, PgStartError> {
    let server = TcpListener::bind(pg.bind_addr).await?;
    let local_addr = server.local_addr()?;

    tokio::spawn(async move {
        loop {
            let (mut conn, remote_addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = server.accept() => res?,
            };
            info!("accepted a conn, addr: {remote_addr}");
            counter!("quay.pg.connections.accepted").increment(1);

            let proxy = proxy.clone();
            let channel_size = pg.frame_channel_size;
            tokio::spawn(async move {
                conn.set_nodelay(true)?;
                let ssl = peek_for_sslrequest(&mut conn, false).await?;
                trace!("SSL? {ssl}");

                let mut framed = Framed::new(
                    conn,
                    PgWireMessageServerCodec::new(ClientInfoHolder::new(remote_addr, false)),
                );

                let msg = match framed.next().await {
                    Some(msg) => msg?,
                    None => {
                        return Ok(());
                    }
                };

                match msg {
                    PgWireFrontendMessage::Startup(startup) => {
                        debug!("received startup message: {startup:?}");
                    }
                    _ => {
                        framed
                            .send(PgWireBackendMessage::ErrorResponse(
                                ErrorInfo::new(
                                    "FATAL".into(),
                                    SqlState::PROTOCOL_VIOLATION.code().into(),
                                    "expected startup message".into(),
                                )
                                .into(),
                            ))
                            .await?;
                        return Ok(());
                    }
                }

                framed.set_state(pgwire::api::PgWireConnectionState::ReadyForQuery);

                framed
                    .feed(PgWireBackendMessage::Authentication(
                        pgwire::messages::startup::Authentication::Ok,
                    ))
                    .await?;

                framed
                    .feed(PgWireBackendMessage::ParameterStatus(ParameterStatus::new(
                        "server_version".into(),
                        proxy.dialect.server_version().into(),
                    )))
                    .await?;

                framed
                    .feed(PgWireBackendMessage::ReadyForQuery(ReadyForQuery::new(
                        READY_STATUS_IDLE,
                    )))
                    .await?;

                framed.flush().await?;

                trace!("sent auth ok and ReadyForQuery");

                let (front_tx, mut front_rx) = channel(channel_size);
                let (back_tx, mut back_rx) = channel(channel_size);

                let (mut sink, mut stream) = framed.split();

                tokio::spawn({
                    let back_tx = back_tx.clone();
                    async move {
                        while let Some(decode_res) = stream.next().await {
                            let msg = match decode_res {
                                Ok(msg) => msg,
                                Err(PgWireError::IoError(io_error)) => {
                                    debug!("postgres io error: {io_error}");
                                    break;
                                }
                                Err(e) => {
                                    warn!("could not receive pg frontend message: {e}");
                                    // attempt to send this...
                                    _ = back_tx.try_send(
                                        (
                                            PgWireBackendMessage::ErrorResponse(
                                                ErrorInfo::new(
                                                    "FATAL".to_owned(),
                                                    SqlState::INTERNAL_ERROR.code().to_owned(),
                                                    e.to_string(),
                                                )
                                                .into(),
                                            ),
                                            true,
                                        )
                                            .into(),
                                    );
                                    break;
                                }
                            };

                            front_tx.send(msg).await?;
                        }
                        debug!("frontend stream is done");

                        Ok::<_, BoxError>(())
                    }
                });

                tokio::spawn(async move {
                    while let Some(back) = back_rx.recv().await {
                        match back {
                            BackendResponse::Message { message, flush } => {
                                debug!("sending: {message:?}");
                                sink.feed(message).await?;
                                if flush {
                                    sink.flush().await?;
                                }
                            }
                            BackendResponse::Flush => {
                                sink.flush().await?;
                            }
                        }
                    }
                    debug!("backend stream is done");
                    Ok::<_, std::io::Error>(())
                });

                block_in_place(|| {
                    let mut backend = match proxy.backends.dedicated() {
                        Ok(backend) => backend,
                        Err(e) => {
                            back_tx.blocking_send(
                                (
                                    PgWireBackendMessage::ErrorResponse(
                                        ErrorInfo::new(
                                            "FATAL".into(),
                                            SqlState::CONNECTION_EXCEPTION.code().into(),
                                            e.to_string(),
                                        )
                                        .into(),
                                    ),
                                    true,
                                )
                                    .into(),
                            )?;
                            return Ok(());
                        }
                    };
                    trace!("opened backend connection");

                    let mut session = Session::default();

                    'outer: while let Some(msg) = front_rx.blocking_recv() {
                        // drain whatever the client pipelined behind the
                        // first frame into one aggregated group
                        let mut frames = vec![msg];
                        while let Ok(more) = front_rx.try_recv() {
                            frames.push(more);
                        }
                        trace!("aggregated {} frame(s)", frames.len());

                        for command in AggregatedPacket::new(frames).into_commands() {
                            match executor::run(
                                command,
                                &mut session,
                                backend.as_mut(),
                                &proxy,
                                &back_tx,
                            )? {
                                ControlFlow::Break(()) => break 'outer,
                                ControlFlow::Continue(()) => {}
                            }
                        }
                    }

                    Ok::<_, BoxError>(())
                })?;

                Ok::<_, BoxError>(())
            });
        }

        info!("postgres server done");

        Ok::<_, BoxError>(())
    });

    Ok(PgServer { local_addr })
}
