//! Restarts and damaged state on disk.

use std::sync::Arc;

use bundle_core::crypto::Identity;
use bundle_core::wire::UploadStatus;
use bundle_services::{ChannelConsumer, ConsumerEvent, ExchangeListener, ServerNode};
use tokio::sync::{broadcast, mpsc};

use crate::{delivered, exchange_config, server_config, Net};

struct Restarted {
    server: ServerNode,
    addr: String,
    events: mpsc::UnboundedReceiver<ConsumerEvent>,
    _shutdown: broadcast::Sender<()>,
}

impl Restarted {
    fn drain_events(&mut self) -> Vec<ConsumerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Stop the running server and bring up a fresh one over the same data
/// directory and identity.
async fn restart_server(net: &Net) -> Restarted {
    let _ = net.shutdown.send(());
    let (consumer, events) = ChannelConsumer::new();
    let server = ServerNode::open(&server_config(&net.tmp), net.server_identity.clone(), Arc::new(consumer)).unwrap();
    let (shutdown, rx) = broadcast::channel(1);
    let listener = ExchangeListener::bind("127.0.0.1:0", Arc::new(server.clone()), exchange_config().chunk_size, rx)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(listener.run());
    Restarted {
        server,
        addr,
        events,
        _shutdown: shutdown,
    }
}

#[tokio::test]
async fn server_restart_keeps_peers_and_windows() {
    let mut net = Net::start().await.unwrap();
    let client = net.client("alice", &Arc::new(Identity::generate())).unwrap();
    client.send("mail", b"before").unwrap();
    client.sync(&net.to_server()).await.unwrap();
    assert_eq!(delivered(&net.drain_events()).len(), 1);

    let mut restarted = restart_server(&net).await;
    let server = restarted.server.clone();
    let client_id = client.engine().local().id();
    assert!(server.peers().contains(&client_id));
    server.send_to(&client_id, "mail", b"after restart").unwrap();

    client.send("mail", b"after").unwrap();
    let report = client.sync(&net.exchange(&restarted.addr)).await.unwrap();
    assert_eq!(report.upload, Some(UploadStatus::Success));
    assert_eq!(report.new_adus, 1);
    assert_eq!(&client.inbox("mail").unwrap()[0].data[..], b"after restart");

    assert_eq!(delivered(&restarted.drain_events()), vec![("mail".to_string(), 2, b"after".to_vec())]);
    assert!(server.engine().violations().is_empty());
}

#[tokio::test]
async fn client_restart_continues_numbering() {
    let mut net = Net::start().await.unwrap();
    let identity = Arc::new(Identity::generate());
    let exchange = net.to_server();

    let client = net.client("bob", &identity).unwrap();
    client.send("echo", b"1").unwrap();
    client.sync(&exchange).await.unwrap();
    drop(client);

    let client = net.client("bob", &identity).unwrap();
    assert_eq!(client.send("echo", b"2").unwrap(), 2);
    let report = client.sync(&exchange).await.unwrap();
    assert!(!report.retransmission);
    assert_eq!(report.applied, 1);

    let got = delivered(&net.drain_events());
    assert_eq!(
        got,
        vec![
            ("echo".to_string(), 1, b"1".to_vec()),
            ("echo".to_string(), 2, b"2".to_vec()),
        ]
    );
}

#[tokio::test]
async fn corrupt_window_state_is_replaced_with_fresh_windows() {
    let net = Net::start().await.unwrap();
    let client = net.client("carol", &Arc::new(Identity::generate())).unwrap();
    client.send("mail", b"first").unwrap();
    client.sync(&net.to_server()).await.unwrap();

    let client_id = client.engine().local().id();
    let windows = net.dir("server").join("engine").join("windows").join(format!("{client_id}.json"));
    assert!(windows.exists());
    std::fs::write(&windows, b"{ not json").unwrap();

    let mut restarted = restart_server(&net).await;
    client.send("mail", b"second").unwrap();
    let report = client.sync(&net.exchange(&restarted.addr)).await.unwrap();
    assert_eq!(report.upload, Some(UploadStatus::Success));

    assert_eq!(delivered(&restarted.drain_events()), vec![("mail".to_string(), 2, b"second".to_vec())]);
    assert!(restarted.server.engine().status(&client_id).is_ok());
}

#[tokio::test]
async fn unreachable_peer_does_not_move_windows() {
    let net = Net::start().await.unwrap();
    let client = net.client("dave", &Arc::new(Identity::generate())).unwrap();
    client.sync(&net.to_server()).await.unwrap();
    let before = client.engine().status(&client.server().id()).unwrap();

    // Nothing listens here any more.
    let gone = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let report = client.sync(&net.exchange(&gone)).await.unwrap();
    assert_eq!(report.upload, None);
    assert_eq!(report.downloaded, 0);

    let after = client.engine().status(&client.server().id()).unwrap();
    assert_eq!(after.recv_window, before.recv_window);
    assert_eq!(after.send_window, before.send_window);
}
