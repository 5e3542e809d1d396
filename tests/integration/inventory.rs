//! Inventory reconciliation between a transport and the server.

use std::sync::Arc;

use bundle_core::crypto::Identity;
use bundle_core::wire::{BundleSender, InventoryRequest, UploadStatus};
use bundle_services::{AduDirection, RelayReport};

use crate::{delivered, Net};

#[tokio::test]
async fn processed_uploads_are_deleted_and_current_downloads_kept() {
    let mut net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("t1").await.unwrap();
    let client = net.client("alice", &Arc::new(Identity::generate())).unwrap();
    let via_transport = net.exchange(&transport_addr);
    let server = net.to_server();

    // 1. The client leaves bundle X with the transport.
    client.send("mail", b"x").unwrap();
    let first = client.sync(&via_transport).await.unwrap();
    assert_eq!(first.upload, Some(UploadStatus::Success));
    assert_eq!(first.downloaded, 0);
    let x = first.bundle_id.clone();
    assert_eq!(transport.client_bundles().unwrap(), vec![x.clone()]);

    // 2. The server has not seen X: upload it. The route is learned from
    //    the upload itself, so nothing is downloaded yet.
    let round = transport.relay_with_server(&server).await.unwrap();
    assert_eq!(round.uploaded, 1);
    assert_eq!(round.downloaded, 0);
    assert!(transport.client_bundles().unwrap().is_empty());
    assert_eq!(delivered(&net.drain_events()).len(), 1);

    // 3. Now the server knows the client is reachable here: fetch Y.
    let round = transport.relay_with_server(&server).await.unwrap();
    assert_eq!(round.downloaded, 1);
    let y = transport.server_bundles().unwrap();
    assert_eq!(y.len(), 1);

    // 4. The client comes back. Nothing changed on its side, so X goes
    //    up again, and Y comes down carrying the acknowledgement of X.
    let second = client.sync(&via_transport).await.unwrap();
    assert!(second.retransmission);
    assert_eq!(second.bundle_id, x);
    assert_eq!(second.applied, 1);
    let meta = client
        .engine()
        .adus()
        .metadata(&client.server().id(), "mail", AduDirection::Send)
        .unwrap();
    assert_eq!(meta.last_deleted_id, 1);

    // 5. X is already processed: delete it. Y is still current: keep it.
    let round = transport.relay_with_server(&server).await.unwrap();
    assert_eq!(
        round,
        RelayReport {
            deleted: 1,
            uploaded: 0,
            upload_failures: 0,
            downloaded: 0,
            recency_refreshed: true,
        }
    );
    assert!(transport.client_bundles().unwrap().is_empty());
    assert_eq!(transport.server_bundles().unwrap(), y);
    assert!(delivered(&net.drain_events()).is_empty());
}

#[tokio::test]
async fn stale_server_bundles_are_replaced() {
    let net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("t1").await.unwrap();
    let client = net.client("bob", &Arc::new(Identity::generate())).unwrap();
    let via_transport = net.exchange(&transport_addr);
    let server = net.to_server();

    client.sync(&via_transport).await.unwrap();
    transport.relay_with_server(&server).await.unwrap();
    transport.relay_with_server(&server).await.unwrap();
    let old = transport.server_bundles().unwrap();
    assert_eq!(old.len(), 1);

    // New data for the client supersedes the held bundle.
    let client_id = client.engine().local().id();
    net.server.send_to(&client_id, "mail", b"fresh").unwrap();
    let round = transport.relay_with_server(&server).await.unwrap();
    assert_eq!(round.deleted, 1);
    assert_eq!(round.downloaded, 1);
    let held = transport.server_bundles().unwrap();
    assert_eq!(held.len(), 1);
    assert_ne!(held, old);

    let report = client.sync(&via_transport).await.unwrap();
    assert_eq!(report.new_adus, 1);
}

#[tokio::test]
async fn inventory_scope_follows_the_sender() {
    let net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("t1").await.unwrap();
    let client = net.client("carol", &Arc::new(Identity::generate())).unwrap();
    client.sync(&net.exchange(&transport_addr)).await.unwrap();
    transport.relay_with_server(&net.to_server()).await.unwrap();

    let server = net.to_server();
    let ask = |sender: Option<BundleSender>| InventoryRequest {
        sender,
        bundle_ids_from_clients_on_transport: Vec::new(),
        bundle_ids_from_server_on_transport: Vec::new(),
    };

    let here = server.inventory(&ask(Some(transport.sender().clone()))).await.unwrap();
    assert_eq!(here.to_download.len(), 1);

    let elsewhere = server
        .inventory(&ask(Some(BundleSender::Transport("t2".into()))))
        .await
        .unwrap();
    assert!(elsewhere.to_download.is_empty());

    let anonymous = server.inventory(&ask(None)).await.unwrap();
    assert!(anonymous.to_download.is_empty());
}

#[tokio::test]
async fn transport_does_not_answer_inventory() {
    let net = Net::start().await.unwrap();
    let (_transport, transport_addr) = net.transport("t1").await.unwrap();
    let request = InventoryRequest::default();
    assert!(net.exchange(&transport_addr).inventory(&request).await.is_err());
}
