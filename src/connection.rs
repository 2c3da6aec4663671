use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::codec::{CodecError, RespCodec};
use crate::pairing::{PairingEngine, Pending};
use crate::reply::CommandError;

/// Bytes to write and the commands they carry, in wire order.
#[derive(Debug)]
pub(crate) struct Request {
    payload: Bytes,
    pending: Vec<Pending>,
}

impl Request {
    pub(crate) fn new(payload: Bytes, pending: Vec<Pending>) -> Self {
        Self { payload, pending }
    }

    #[cfg(test)]
    pub(crate) fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[Pending] {
        &self.pending
    }

    /// Fails the carried commands without writing anything.
    pub(crate) fn abort(self, cause: &CommandError) {
        PairingEngine::fail(self.pending, cause);
    }
}

/// Owns one transport. Reads replies and writes requests from a single task, so a command joins
/// the outstanding queue right after its bytes are flushed and before the next reply is looked at.
pub(crate) struct Connection<T> {
    id: Uuid,
    framed: Framed<T, RespCodec>,
    engine: PairingEngine,
    requests: mpsc::UnboundedReceiver<Request>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        transport: T,
        codec: RespCodec,
        engine: PairingEngine,
        requests: mpsc::UnboundedReceiver<Request>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            framed: Framed::new(transport, codec),
            engine,
            requests,
        }
    }

    /// Runs until the server closes the stream, the stream breaks, or every client handle is
    /// dropped and no reply is outstanding.
    #[instrument(name = "connection", skip(self), fields(connection_id))]
    pub(crate) async fn run(mut self) {
        tracing::Span::current().record("connection_id", self.id.to_string());
        info!("Connection established");

        let mut accepting = true;

        loop {
            if !accepting && self.engine.is_empty() {
                debug!("client handles dropped and nothing outstanding");
                break;
            }

            tokio::select! {
                frame = self.framed.next() => match frame {
                    Some(Ok(frame)) => self.engine.receive(frame),
                    Some(Err(err)) => {
                        error!("failed to read from server: {}", err);
                        break;
                    }
                    None => {
                        info!("Server closed the connection");
                        break;
                    }
                },
                request = self.requests.recv(), if accepting => match request {
                    Some(request) => {
                        if let Err(err) = self.write(request).await {
                            error!("failed to write to server: {}", err);
                            break;
                        }
                    }
                    None => accepting = false,
                },
            }
        }

        self.close();
        info!("Connection closed");
    }

    async fn write(&mut self, request: Request) -> Result<(), CodecError> {
        let Request { payload, pending } = request;

        match self.framed.send(payload).await {
            Ok(()) => {
                self.engine.sent(pending);
                Ok(())
            }
            Err(err) => {
                PairingEngine::fail(pending, &CommandError::Write(err.to_string()));
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        self.engine.connection_closed();

        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            request.abort(&CommandError::ConnectionClosed);
        }
    }
}
