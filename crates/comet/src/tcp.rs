//! TCP subscribe server
//!
//! Handles subscriber connections speaking the `*<argc>` command protocol

use crate::bucket::ChannelList;
use crate::connection::{reply, shared, SharedTransport, TcpTransport};
use push_core::PushError;
use resp::{
    AsyncCommandParser, Command, Reply, Subscribe, FIRST_PACKET_TIMEOUT, HEARTBEAT,
    HEARTBEAT_DELAY_SECS,
};
use socket2::SockRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// TCP subscribe server
pub struct TcpServer {
    channels: Arc<ChannelList>,
    keepalive: bool,
}

impl TcpServer {
    pub fn new(channels: Arc<ChannelList>, keepalive: bool) -> Self {
        Self {
            channels,
            keepalive,
        }
    }

    /// Accept subscribers until `cancel` fires
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        info!("TCP subscribe server listening on {}", local);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TCP subscribe server {} stopped", local);
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("New subscriber connection from {}", addr);
                    if self.keepalive {
                        if let Err(e) = socket_keepalive(&stream) {
                            warn!("Failed to enable keepalive for {}: {}", addr, e);
                        }
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set nodelay for {}: {}", addr, e);
                    }
                    let channels = self.channels.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let (reader, writer) = split(stream);
                        handle_client(reader, writer, channels, cancel).await;
                        debug!("Subscriber {} disconnected", addr);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

fn socket_keepalive(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    SockRef::from(stream).set_keepalive(true)
}

/// Serve one subscriber socket
///
/// The first frame must arrive within [`FIRST_PACKET_TIMEOUT`]; after a
/// successful `sub` the socket only carries heartbeat bytes.
pub async fn handle_client<R, W>(
    reader: R,
    writer: W,
    channels: Arc<ChannelList>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut parser = AsyncCommandParser::new(reader);
    let transport = shared(TcpTransport::new(writer));

    let args = match timeout(FIRST_PACKET_TIMEOUT, parser.parse_command()).await {
        Ok(Ok(args)) => args,
        Ok(Err(e)) => {
            warn!("Bad subscribe frame: {}", e);
            reply(&transport, Reply::Param).await;
            return;
        }
        Err(_) => {
            debug!("No command within {:?}", FIRST_PACKET_TIMEOUT);
            return;
        }
    };

    let sub = match Command::from_args(&args) {
        Ok(Command::Subscribe(sub)) => sub,
        Ok(Command::Unknown(name)) => {
            warn!("Unknown command {}", name);
            reply(&transport, Reply::Param).await;
            return;
        }
        Err(e) => {
            warn!("Bad subscribe arguments: {}", e);
            reply(&transport, Reply::Param).await;
            return;
        }
    };

    subscribe(&mut parser, transport, sub, &channels, cancel).await;
}

async fn subscribe<R>(
    parser: &mut AsyncCommandParser<R>,
    transport: SharedTransport,
    sub: Subscribe,
    channels: &ChannelList,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let (channel, id) = match channels
        .subscribe(&sub.key, transport.clone(), &sub.version, cancel.clone())
        .await
    {
        Ok(added) => added,
        Err(e) => {
            warn!("Subscribe {} failed: {}", sub.key, e);
            if let Some(r) = failure_reply(&e) {
                reply(&transport, r).await;
            }
            return;
        }
    };
    info!("Subscriber {} joined (heartbeat {}s)", sub.key, sub.heartbeat);

    let deadline = Duration::from_secs(sub.heartbeat + HEARTBEAT_DELAY_SECS);
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(deadline, parser.read_byte()) => read,
        };
        match read {
            Ok(Ok(HEARTBEAT)) => {
                if let Err(e) = transport.lock().await.send_reply(Reply::Heartbeat).await {
                    warn!("Heartbeat reply to {} failed: {}", sub.key, e);
                    break;
                }
                debug!("Heartbeat from {}", sub.key);
            }
            Ok(Ok(byte)) => {
                warn!("Unexpected byte {:#x} from {}", byte, sub.key);
                break;
            }
            Ok(Err(e)) => {
                debug!("Subscriber {} read ended: {}", sub.key, e);
                break;
            }
            Err(_) => {
                info!("Subscriber {} missed heartbeat for {:?}", sub.key, deadline);
                break;
            }
        }
    }

    channels.remove_conn(&channel, id);
    info!("Subscriber {} left", sub.key);
}

/// Reply sent when a subscribe is refused, if any
pub(crate) fn failure_reply(e: &PushError) -> Option<Reply> {
    match e {
        PushError::Routing(_) => Some(Reply::Node),
        PushError::Capacity(_) | PushError::Io(_) => None,
        _ => Some(Reply::Channel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::RecordingSink;
    use crate::config::ChannelConfig;
    use std::collections::HashMap;
    use tokio_test::io::Builder;

    const SUB_ALICE: &[u8] = b"*3\r\n$3\r\nsub\r\n$5\r\nalice\r\n$2\r\n30\r\n";

    fn channels(node: &str, max: usize) -> Arc<ChannelList> {
        let config = ChannelConfig {
            max_subscribers: max,
            msgbuf: 8,
            bucket_count: 2,
        };
        Arc::new(ChannelList::new(node, config, Arc::new(RecordingSink::default())))
    }

    async fn run(mock: tokio_test::io::Mock, channels: Arc<ChannelList>) {
        let (reader, writer) = split(mock);
        handle_client(reader, writer, channels, CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn test_subscribe_heartbeat_then_eof() {
        let list = channels("n1", 4);
        let mock = Builder::new()
            .read(SUB_ALICE)
            .write(b"+h\r\n")
            .read(b"h")
            .write(b"+h\r\n")
            .build();
        run(mock, list.clone()).await;
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_command_gets_param_reply() {
        let mock = Builder::new()
            .read(b"*2\r\n$3\r\npub\r\n$1\r\nx\r\n")
            .write(b"-p\r\n")
            .build();
        run(mock, channels("n1", 4)).await;
    }

    #[tokio::test]
    async fn test_short_heartbeat_gets_param_reply() {
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nsub\r\n$1\r\nk\r\n$2\r\n10\r\n")
            .write(b"-p\r\n")
            .build();
        run(mock, channels("n1", 4)).await;
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_param_reply() {
        let mock = Builder::new().read(b"+3\r\n").write(b"-p\r\n").build();
        run(mock, channels("n1", 4)).await;
    }

    #[tokio::test]
    async fn test_foreign_key_gets_node_reply() {
        let list = channels("11", 4);
        let weights: HashMap<String, u32> =
            [("11".to_string(), 1), ("22".to_string(), 1)].into_iter().collect();
        list.migrate(&weights);
        let mock = Builder::new()
            .read(b"*3\r\n$3\r\nsub\r\n$12\r\nlucas-chi332\r\n$2\r\n30\r\n")
            .write(b"-n\r\n")
            .build();
        run(mock, list).await;
    }

    #[tokio::test]
    async fn test_unexpected_byte_ends_subscription() {
        let list = channels("n1", 4);
        let mock = Builder::new()
            .read(SUB_ALICE)
            .write(b"+h\r\n")
            .read(b"x")
            .build();
        run(mock, list.clone()).await;
        assert!(list.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_heartbeat_removes_subscriber() {
        let list = channels("n1", 4);
        let mock = Builder::new()
            .read(SUB_ALICE)
            .write(b"+h\r\n")
            .wait(Duration::from_secs(3600))
            .build();
        let started = tokio::time::Instant::now();
        run(mock, list.clone()).await;
        assert!(started.elapsed() >= Duration::from_secs(35));
        assert!(started.elapsed() < Duration::from_secs(3600));
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscription() {
        let list = channels("n1", 4);
        let (client, server) = tokio::io::duplex(1024);
        let (reader, writer) = split(server);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(handle_client(reader, writer, list.clone(), cancel.clone()));

        let (mut client_reader, mut client_writer) = split(client);
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_writer.write_all(SUB_ALICE).await.unwrap();
        let mut ack = [0u8; 4];
        client_reader.read_exact(&mut ack).await.unwrap();
        assert_eq!(&ack, b"+h\r\n");
        assert_eq!(list.len(), 1);

        cancel.cancel();
        task.await.unwrap();
        assert!(list.is_empty());
    }
}
