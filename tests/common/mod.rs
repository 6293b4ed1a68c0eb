#![allow(dead_code)]

use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio_util::codec::FramedRead;

use rustdis_client::codec::FrameCodec;
use rustdis_client::{Command, Config};

/// A scripted stand-in for a Redis server: tests read the commands the client wrote and decide
/// which bytes to answer with.
pub struct MockServer {
    listener: TcpListener,
    pub config: Config,
}

/// One accepted client connection.
pub struct Peer {
    commands: FramedRead<OwnedReadHalf, FrameCodec>,
    writer: OwnedWriteHalf,
}

impl MockServer {
    pub async fn start() -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = listener.local_addr().unwrap();

        let config = Config {
            host: local_addr.ip().to_string(),
            port: local_addr.port(),
            ..Config::default()
        };

        MockServer { listener, config }
    }

    pub async fn accept(&self) -> Peer {
        let (socket, _) = self.listener.accept().await.unwrap();
        let (reader, writer) = socket.into_split();

        Peer {
            commands: FramedRead::new(reader, FrameCodec::default()),
            writer,
        }
    }
}

impl Peer {
    /// The next command written by the client.
    pub async fn command(&mut self) -> Command {
        let frame = self
            .commands
            .next()
            .await
            .expect("client closed the connection")
            .unwrap();

        Command::try_from(frame).unwrap()
    }

    pub async fn expect(&mut self, args: &[&str]) {
        let expected = Command::new(args[0]).args(&args[1..]);

        assert_eq!(self.command().await, expected);
    }

    /// Waits until the client shuts the connection down.
    pub async fn closed(&mut self) {
        assert!(self.commands.next().await.is_none());
    }

    pub async fn reply(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }
}
