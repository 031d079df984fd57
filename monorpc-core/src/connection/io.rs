use futures_channel::{
    mpsc::{unbounded, UnboundedReceiver},
    oneshot::{self, Receiver as OReceiver},
};
use futures_util::StreamExt;
use monoio::io::{sink::Sink, stream::Stream, OwnedReadHalf, OwnedWriteHalf, Splitable};
use monoio_codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use super::{Connection, Link};
use crate::{
    codec::{CodecError, Frame, FrameCodec},
    pool::Reactor,
    transport::Transport,
};

type Reader = FramedRead<OwnedReadHalf<Transport>, FrameCodec>;
type Writer = FramedWrite<OwnedWriteHalf<Transport>, FrameCodec>;

/// The reactor side of a connected [`Connection`].
pub(crate) struct Session {
    conn: Connection,
    reader: Reader,
    writer: Writer,
    outbound: UnboundedReceiver<Frame>,
    close: OReceiver<()>,
}

enum CloseReason {
    Local,
    PeerClosed,
    Transport(std::io::Error),
    Malformed(CodecError),
}

impl Session {
    /// Bind `transport` to `conn`, moving it to `Connected`.
    ///
    /// Returns `None` if the connection was torn down in the meantime.
    pub(crate) fn open(
        conn: &Connection,
        reactor: Reactor,
        transport: Transport,
        max_frame_length: usize,
    ) -> Option<Self> {
        let (read, write) = transport.into_split();
        let (outbound_tx, outbound) = unbounded();
        let (close_tx, close) = oneshot::channel();
        let link = Link {
            outbound: outbound_tx,
            close: Some(close_tx),
            reactor,
        };
        if !conn.establish(link) {
            return None;
        }
        Some(Self {
            conn: conn.clone(),
            reader: FramedRead::new(read, FrameCodec::new(max_frame_length)),
            writer: FramedWrite::new(write, FrameCodec::new(max_frame_length)),
            outbound,
            close,
        })
    }

    /// Drive the connection until it closes, then tear it down.
    pub(crate) async fn run(self) {
        let Session {
            conn,
            mut reader,
            writer,
            outbound,
            mut close,
        } = self;
        monoio::spawn(write_loop(conn.clone(), writer, outbound));

        let reason = loop {
            monoio::select! {
                _ = &mut close => {
                    break CloseReason::Local;
                }
                decoded = reader.next() => {
                    match decoded {
                        Some(Ok(frame)) => conn.on_frame(frame),
                        Some(Err(CodecError::Io(e))) => break CloseReason::Transport(e),
                        Some(Err(e)) => break CloseReason::Malformed(e),
                        None => break CloseReason::PeerClosed,
                    }
                }
            }
        };
        match reason {
            CloseReason::Local => debug!(conn = conn.id(), "read loop stopped"),
            CloseReason::PeerClosed => conn.teardown("peer closed"),
            CloseReason::Transport(e) => {
                warn!(conn = conn.id(), "read failed: {e}");
                conn.teardown("transport error");
            }
            CloseReason::Malformed(e) => {
                warn!(conn = conn.id(), "malformed frame: {e}");
                conn.teardown_malformed(e.to_string());
            }
        }
    }
}

async fn write_loop(
    conn: Connection,
    mut writer: Writer,
    mut outbound: UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.next().await {
        let mut next = Some(frame);
        // write everything already queued, then flush once
        while let Some(frame) = next.take() {
            let (kind, id) = (frame.kind, frame.correlation_id);
            match writer.send(frame).await {
                Ok(()) => trace!(conn = conn.id(), correlation_id = id, "frame written"),
                Err(CodecError::Io(e)) => {
                    warn!(conn = conn.id(), "write failed: {e}");
                    conn.teardown("transport error");
                    return;
                }
                Err(e) => conn.on_unsendable(kind, id, e.to_string()),
            }
            if let Ok(Some(frame)) = outbound.try_next() {
                next = Some(frame);
            }
        }
        if let Err(e) = writer.flush().await {
            warn!(conn = conn.id(), "flush failed: {e}");
            conn.teardown("transport error");
            return;
        }
    }
    let _ = writer.close().await;
    debug!(conn = conn.id(), "write loop stopped");
}
