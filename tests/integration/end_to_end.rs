//! Client and server talking directly over loopback.

use std::sync::Arc;

use bundle_core::crypto::Identity;
use bundle_core::wire::UploadStatus;
use bundle_services::{AduDirection, ConsumerEvent};

use crate::{delivered, Net};

#[tokio::test]
async fn round_trip_delivers_and_acks_retire_sent_adus() {
    let mut net = Net::start().await.unwrap();
    let client = net.client("alice", &Arc::new(Identity::generate())).unwrap();
    let exchange = net.to_server();

    for body in [&b"one"[..], b"two", b"three"] {
        client.send("mail", body).unwrap();
    }
    let report = client.sync(&exchange).await.unwrap();
    assert_eq!(report.upload, Some(UploadStatus::Success));
    assert!(!report.retransmission);

    let events = net.drain_events();
    let got = delivered(&events);
    assert_eq!(got.len(), 3);
    assert_eq!(got[0], ("mail".to_string(), 1, b"one".to_vec()));
    assert_eq!(got[2].2, b"three".to_vec());
    assert!(events.contains(&ConsumerEvent::BatchComplete));

    // The server's reply acknowledged the upload, so the client dropped
    // everything it carried.
    assert_eq!(report.applied, 1);
    let server_id = client.server().id();
    let meta = client
        .engine()
        .adus()
        .metadata(&server_id, "mail", AduDirection::Send)
        .unwrap();
    assert_eq!(meta.last_deleted_id, 3);
    assert_eq!(meta.last_sent_id, 3);
}

#[tokio::test]
async fn unsent_bundle_is_retransmitted_under_the_same_id() {
    let mut net = Net::start().await.unwrap();
    let client = net.client("bob", &Arc::new(Identity::generate())).unwrap();

    client.send("echo", b"ping").unwrap();
    // Minted but never delivered: the carrier lost it.
    let lost = client.generate().unwrap();
    assert!(!lost.retransmission);

    let report = client.sync(&net.to_server()).await.unwrap();
    assert!(report.retransmission);
    assert_eq!(report.bundle_id, lost.bundle_id);
    assert_eq!(report.upload, Some(UploadStatus::Success));

    let got = delivered(&net.drain_events());
    assert_eq!(got, vec![("echo".to_string(), 1, b"ping".to_vec())]);
}

#[tokio::test]
async fn duplicate_upload_is_harmless() {
    let mut net = Net::start().await.unwrap();
    let client = net.client("carol", &Arc::new(Identity::generate())).unwrap();
    let exchange = net.to_server();

    client.send("mail", b"once").unwrap();
    let bundle = client.generate().unwrap();
    let bytes = std::fs::read(&bundle.path).unwrap();

    client.sync(&exchange).await.unwrap();
    assert_eq!(delivered(&net.drain_events()).len(), 1);

    // A second carrier shows up with the same bundle later.
    let status = exchange.upload(client.sender(), &bundle.bundle_id, &bytes).await.unwrap();
    assert_eq!(status, UploadStatus::Success);
    assert!(delivered(&net.drain_events()).is_empty());
    assert!(net.server.engine().violations().is_empty());
}

#[tokio::test]
async fn server_data_waits_for_the_next_sync() {
    let net = Net::start().await.unwrap();
    let client = net.client("dave", &Arc::new(Identity::generate())).unwrap();
    let exchange = net.to_server();

    // Unknown clients cannot be addressed until they upload once.
    let client_id = client.engine().local().id();
    assert!(net.server.send_to(&client_id, "mail", b"early").is_err());

    client.sync(&exchange).await.unwrap();
    net.server.send_to(&client_id, "mail", b"hello").unwrap();
    net.server.send_to(&client_id, "echo", b"pong").unwrap();

    let report = client.sync(&exchange).await.unwrap();
    assert_eq!(report.new_adus, 2);
    let mut apps = client.inbox_apps();
    apps.sort();
    assert_eq!(apps, vec!["echo".to_string(), "mail".to_string()]);
    assert_eq!(&client.inbox("mail").unwrap()[0].data[..], b"hello");

    // Nothing new: another sync applies nothing fresh.
    let again = client.sync(&exchange).await.unwrap();
    assert_eq!(again.new_adus, 0);
}

#[tokio::test]
async fn two_clients_are_tracked_separately() {
    let mut net = Net::start().await.unwrap();
    let exchange = net.to_server();
    let a = net.client("a", &Arc::new(Identity::generate())).unwrap();
    let b = net.client("b", &Arc::new(Identity::generate())).unwrap();

    a.send("mail", b"from a").unwrap();
    b.send("mail", b"from b").unwrap();
    a.sync(&exchange).await.unwrap();
    b.sync(&exchange).await.unwrap();

    let got = delivered(&net.drain_events());
    assert_eq!(got.len(), 2);
    assert_eq!(net.server.peers().len(), 2);
}
