use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::FramedRead;

use rustdis_client::codec::RespCodec;
use rustdis_client::pubsub::TopicKind;
use rustdis_client::{
    cmd, Charset, Client, Command, CommandError, Config, Frame, ListenerHandle, Message,
};

/// A scripted server. Commands it decodes are forwarded to the test; bytes the test sends are
/// written back verbatim. Dropping the byte sender closes the server's side of the stream.
struct FakeServer {
    replies: UnboundedSender<Vec<u8>>,
    commands: UnboundedReceiver<Frame>,
}

impl FakeServer {
    fn reply(&self, bytes: &[u8]) {
        self.replies.send(bytes.to_vec()).unwrap();
    }

    async fn command(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .expect("timed out waiting for a command")
            .expect("server stopped")
    }
}

async fn create_tcp_connection() -> Result<(FakeServer, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (replies_tx, mut replies_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        if let Ok((socket, _)) = listener.accept().await {
            let (read, mut write) = socket.into_split();

            tokio::spawn(async move {
                let mut frames = FramedRead::new(read, RespCodec::default());
                while let Some(Ok(frame)) = frames.next().await {
                    if commands_tx.send(frame).is_err() {
                        break;
                    }
                }
            });

            while let Some(data) = replies_rx.recv().await {
                // Write the received channel data to the socket.
                if write.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    // Connect to the server as a client to complete the setup.
    let stream = TcpStream::connect(local_addr).await?;

    Ok((
        FakeServer {
            replies: replies_tx,
            commands: commands_rx,
        },
        stream,
    ))
}

async fn connect() -> (FakeServer, Client) {
    let (server, stream) = create_tcp_connection().await.unwrap();
    let client = Client::with_transport(stream, &Config::default());

    (server, client)
}

fn command(parts: &[&str]) -> Frame {
    Frame::Array(
        parts
            .iter()
            .map(|part| Frame::Bulk(Bytes::from(part.to_string())))
            .collect(),
    )
}

#[tokio::test]
async fn test_connect_with_config() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let config = Config::new().address(listener.local_addr().unwrap().to_string());

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(&mut socket, RespCodec::default());
        let ping = frames.next().await.unwrap().unwrap();
        drop(frames);
        socket.write_all(b"+PONG\r\n").await.unwrap();
        ping
    });

    let client = Client::connect(&config).await.unwrap();

    assert_eq!(client.ping(None).await.unwrap(), Bytes::from("PONG"));
    assert_eq!(server.await.unwrap(), command(&["PING"]));
}

#[tokio::test]
async fn test_pipelined_replies_are_paired_in_order() {
    let (mut server, client) = connect().await;

    let first = client.submit(Command::<String>::new("GET").arg("a"));
    let second = client.submit(Command::<String>::new("GET").arg("b"));

    assert_eq!(server.command().await, command(&["GET", "a"]));
    assert_eq!(server.command().await, command(&["GET", "b"]));

    server.reply(b"$5\r\nfirst\r\n$6\r\nsecond\r\n");

    assert_eq!(second.await.unwrap(), "second");
    assert_eq!(first.await.unwrap(), "first");
}

#[tokio::test]
async fn test_llen_encoding_and_reply() {
    let (mut server, client) = connect().await;

    let reply = client.llen("mylist");

    assert_eq!(server.command().await, command(&["LLEN", "mylist"]));
    server.reply(b":3\r\n");

    assert_eq!(reply.await.unwrap(), 3);
}

#[tokio::test]
async fn test_reply_split_across_writes() {
    let (mut server, client) = connect().await;

    let reply = client.submit(cmd("LRANGE").arg("l").arg(0).arg(-1));
    assert_eq!(server.command().await, command(&["LRANGE", "l", "0", "-1"]));

    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n";
    for part in [&b"*3\r\n$3\r\nSE"[..], b"T\r\n$5\r\nmyke", b"y\r\n$7\r\nmyvalue\r\n"] {
        server.reply(part);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        reply.await.unwrap(),
        Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("mykey")),
            Frame::Bulk(Bytes::from("myvalue")),
        ])
    );
}

#[tokio::test]
async fn test_server_error_reply() {
    let (mut server, client) = connect().await;

    let reply = client.llen("greeting");
    server.command().await;
    server.reply(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n");

    match reply.await {
        Err(CommandError::Server(err)) => assert_eq!(err.prefix(), "WRONGTYPE"),
        other => panic!("expected a server error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_error_reply_echoing_non_utf8_bytes_keeps_connection() {
    let (mut server, stream) = create_tcp_connection().await.unwrap();
    let client = Client::with_transport(stream, &Config::new().charset(Charset::Latin1));

    let unknown = client.submit(cmd("café"));
    let ping = client.submit(cmd("PING"));

    assert_eq!(
        server.command().await,
        Frame::Array(vec![Frame::Bulk(Bytes::from_static(b"caf\xe9"))])
    );
    assert_eq!(server.command().await, command(&["PING"]));
    server.reply(b"-ERR unknown command 'caf\xe9'\r\n+PONG\r\n");

    match unknown.await {
        Err(CommandError::Server(err)) => assert_eq!(err.prefix(), "ERR"),
        other => panic!("expected a server error, got {:?}", other),
    }
    assert_eq!(ping.await.unwrap(), Frame::Simple("PONG".to_string()));
}

#[tokio::test]
async fn test_null_replies() {
    let (mut server, client) = connect().await;

    let missing = client.memory_usage("missing");
    let bulk = client.submit(Command::<Option<String>>::new("GET").arg("missing"));
    server.command().await;
    server.command().await;
    server.reply(b"$-1\r\n$-1\r\n");

    assert_eq!(missing.await.unwrap(), None);
    assert_eq!(bulk.await.unwrap(), None);
}

#[tokio::test]
async fn test_transaction_fans_out_exec_reply() {
    let (mut server, client) = connect().await;

    let (x, y) = client.transaction(|tx| {
        (
            tx.submit(Command::<i64>::new("INCR").arg("x")),
            tx.submit(Command::<i64>::new("INCRBY").arg("y").arg(20)),
        )
    });

    assert_eq!(server.command().await, command(&["MULTI"]));
    assert_eq!(server.command().await, command(&["INCR", "x"]));
    assert_eq!(server.command().await, command(&["INCRBY", "y", "20"]));
    assert_eq!(server.command().await, command(&["EXEC"]));

    server.reply(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*2\r\n:10\r\n:20\r\n");

    assert_eq!(x.await.unwrap(), 10);
    assert_eq!(y.await.unwrap(), 20);
}

#[tokio::test]
async fn test_transaction_failure_reaches_every_member() {
    let (mut server, client) = connect().await;

    let (x, y) = client.transaction(|tx| {
        (
            tx.submit(Command::<i64>::new("INCR").arg("x")),
            tx.submit(Command::<i64>::new("INCR").arg("y")),
        )
    });
    for _ in 0..4 {
        server.command().await;
    }

    server.reply(b"+OK\r\n+QUEUED\r\n+QUEUED\r\n*-1\r\n");

    assert_eq!(x.await, Err(CommandError::TransactionAborted));
    assert_eq!(y.await, Err(CommandError::TransactionAborted));
}

#[tokio::test]
async fn test_transaction_queue_time_error() {
    let (mut server, client) = connect().await;

    let (bad, good) = client.transaction(|tx| {
        (
            tx.submit(cmd("NOSUCHCOMMAND")),
            tx.submit(Command::<i64>::new("INCR").arg("y")),
        )
    });
    for _ in 0..4 {
        server.command().await;
    }

    server.reply(b"+OK\r\n-ERR unknown command 'NOSUCHCOMMAND'\r\n+QUEUED\r\n");
    server.reply(b"-EXECABORT Transaction discarded because of previous errors.\r\n");

    match bad.await {
        Err(CommandError::Server(err)) => assert_eq!(err.prefix(), "ERR"),
        other => panic!("expected ERR, got {:?}", other),
    }
    match good.await {
        Err(CommandError::Server(err)) => assert_eq!(err.prefix(), "EXECABORT"),
        other => panic!("expected EXECABORT, got {:?}", other),
    }
}

#[tokio::test]
async fn test_commands_after_transaction_stay_paired() {
    let (mut server, client) = connect().await;

    let member = client.transaction(|tx| tx.submit(Command::<String>::new("GET").arg("k")));
    let after = client.submit(Command::<String>::new("ECHO").arg("after"));
    for _ in 0..4 {
        server.command().await;
    }

    server.reply(b"+OK\r\n+QUEUED\r\n*1\r\n$1\r\nv\r\n$5\r\nafter\r\n");

    assert_eq!(member.await.unwrap(), "v");
    assert_eq!(after.await.unwrap(), "after");
}

#[tokio::test]
async fn test_subscribe_waits_for_every_channel() {
    let (mut server, client) = connect().await;
    let listener = ListenerHandle::new(|_: &Message| {});

    let mut reply = client.subscribe(&listener, &["a", "b"]);
    assert_eq!(server.command().await, command(&["SUBSCRIBE", "a", "b"]));

    server.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(futures::poll!(&mut reply).is_pending());

    server.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\nb\r\n:2\r\n");
    assert_eq!(reply.await.unwrap(), 2);

    assert_eq!(client.listeners().topics(TopicKind::Channel), vec!["a", "b"]);
}

#[tokio::test]
async fn test_published_messages_reach_listeners() {
    let (mut server, client) = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let listener = ListenerHandle::new(move |message: &Message| {
        tx.send(message.clone()).unwrap();
    });

    let reply = client.psubscribe(&listener, &["news.*"]);
    assert_eq!(server.command().await, command(&["PSUBSCRIBE", "news.*"]));
    server.reply(b"*3\r\n$10\r\npsubscribe\r\n$6\r\nnews.*\r\n:1\r\n");
    assert_eq!(reply.await.unwrap(), 1);

    server.reply(b"*4\r\n$8\r\npmessage\r\n$6\r\nnews.*\r\n$9\r\nnews.tech\r\n$5\r\nhello\r\n");

    let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        message,
        Message {
            channel: "news.tech".to_string(),
            pattern: Some("news.*".to_string()),
            payload: Bytes::from("hello"),
        }
    );
}

#[tokio::test]
async fn test_removed_listener_gets_nothing() {
    let (mut server, client) = connect().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let removed_tx = tx.clone();
    let removed = ListenerHandle::new(move |message: &Message| {
        removed_tx.send(("removed", message.payload.clone())).unwrap();
    });
    let kept = ListenerHandle::new(move |message: &Message| {
        tx.send(("kept", message.payload.clone())).unwrap();
    });

    let reply = client.subscribe(&kept, &["a"]);
    server.command().await;
    server.reply(b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n");
    reply.await.unwrap();

    client.add_channel_listener(&removed, &["a"]).unwrap();
    client.remove_channel_listener(&removed, &["a"]);

    server.reply(b"*3\r\n$7\r\nmessage\r\n$1\r\na\r\n$2\r\nm1\r\n");

    assert_eq!(rx.recv().await.unwrap(), ("kept", Bytes::from("m1")));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_unsubscribe_all_waits_for_zero_active() {
    let (mut server, client) = connect().await;
    let listener = ListenerHandle::new(|_: &Message| {});

    let reply = client.subscribe(&listener, &["a", "b", "c"]);
    server.command().await;
    server.reply(
        b"*3\r\n$9\r\nsubscribe\r\n$1\r\na\r\n:1\r\n\
          *3\r\n$9\r\nsubscribe\r\n$1\r\nb\r\n:2\r\n\
          *3\r\n$9\r\nsubscribe\r\n$1\r\nc\r\n:3\r\n",
    );
    assert_eq!(reply.await.unwrap(), 3);

    let mut reply = client.unsubscribe(&listener, &[] as &[&str]);
    assert_eq!(server.command().await, command(&["UNSUBSCRIBE"]));

    server.reply(
        b"*3\r\n$11\r\nunsubscribe\r\n$1\r\na\r\n:2\r\n\
          *3\r\n$11\r\nunsubscribe\r\n$1\r\nb\r\n:1\r\n",
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(futures::poll!(&mut reply).is_pending());

    server.reply(b"*3\r\n$11\r\nunsubscribe\r\n$1\r\nc\r\n:0\r\n");

    assert_eq!(reply.await.unwrap(), 0);
    assert!(client.listeners().topics(TopicKind::Channel).is_empty());
}

#[tokio::test]
async fn test_subscribe_requires_channels() {
    let (_server, client) = connect().await;
    let listener = ListenerHandle::new(|_: &Message| {});

    assert!(matches!(
        client.subscribe(&listener, &[] as &[&str]).await,
        Err(CommandError::Usage(_))
    ));
    assert!(matches!(
        client.submit(cmd("subscribe").arg("a")).await,
        Err(CommandError::Usage(_))
    ));
}

#[tokio::test]
async fn test_scan_keys_follows_cursor() {
    let (mut server, client) = connect().await;

    let responder = tokio::spawn(async move {
        assert_eq!(
            server.command().await,
            command(&["SCAN", "0", "MATCH", "user:*"])
        );
        server.reply(b"*2\r\n$2\r\n17\r\n*2\r\n$6\r\nuser:1\r\n$6\r\nuser:2\r\n");

        assert_eq!(
            server.command().await,
            command(&["SCAN", "17", "MATCH", "user:*"])
        );
        server.reply(b"*2\r\n$1\r\n0\r\n*1\r\n$6\r\nuser:3\r\n");
        server
    });

    let keys: Vec<String> = client
        .scan_keys(Some("user:*".to_string()), None)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(keys, vec!["user:1", "user:2", "user:3"]);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_connection_closed_fails_outstanding_commands() {
    let (mut server, client) = connect().await;

    let replies: Vec<_> = (0..3)
        .map(|i| client.submit(cmd("GET").arg(format!("key:{}", i))))
        .collect();
    for _ in 0..3 {
        server.command().await;
    }

    drop(server);

    for reply in replies {
        assert_eq!(reply.await, Err(CommandError::ConnectionClosed));
    }
    assert_eq!(
        client.ping(None).await,
        Err(CommandError::ConnectionClosed)
    );
}
