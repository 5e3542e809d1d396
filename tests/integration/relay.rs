//! Data and recency carried by a transport.

use std::sync::Arc;

use bundle_core::crypto::Identity;
use bundle_core::recency::{unix_now, SignedRecencyBlob};
use bundle_core::wire::BundleSender;
use bundle_services::UploadOptions;

use crate::{delivered, Net};

#[tokio::test]
async fn server_data_reaches_a_client_through_a_transport() {
    let mut net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("bus-42").await.unwrap();
    let client = net.client("alice", &Arc::new(Identity::generate())).unwrap();
    let via_transport = net.exchange(&transport_addr);
    let server = net.to_server();

    client.send("mail", b"up the road").unwrap();
    client.sync(&via_transport).await.unwrap();
    transport.relay_with_server(&server).await.unwrap();
    assert_eq!(
        delivered(&net.drain_events()),
        vec![("mail".to_string(), 1, b"up the road".to_vec())]
    );

    let client_id = client.engine().local().id();
    assert_eq!(net.server.routes().transport_of(&client_id).as_deref(), Some("bus-42"));
    net.server.send_to(&client_id, "mail", b"down the road").unwrap();

    let round = transport.relay_with_server(&server).await.unwrap();
    assert_eq!(round.downloaded, 1);

    let report = client.sync(&via_transport).await.unwrap();
    assert_eq!(report.new_adus, 1);
    let inbox = client.inbox("mail").unwrap();
    assert_eq!(&inbox[0].data[..], b"down the road");

    // The transport cannot open what it carries.
    let id = &transport.server_bundles().unwrap()[0];
    let held = std::fs::read(net.dir("bus-42").join("from_server").join(id)).unwrap();
    assert!(!held.windows(13).any(|w| w == b"down the road"));
}

#[tokio::test]
async fn recency_is_relayed_and_verified() {
    let net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("t1").await.unwrap();
    let client = net.client("bob", &Arc::new(Identity::generate())).unwrap();
    let via_transport = net.exchange(&transport_addr);

    // Nothing cached before the first relay.
    assert!(!client.fetch_recency("t1", &via_transport).await.unwrap());
    assert!(client.newest_recency("t1").is_none());

    let round = transport.relay_with_server(&net.to_server()).await.unwrap();
    assert!(round.recency_refreshed);
    assert!(client.fetch_recency("t1", &via_transport).await.unwrap());
    let seen = client.newest_recency("t1").unwrap();
    assert!(seen.timestamp <= unix_now());

    // The same blob again is not newer.
    assert!(!client.fetch_recency("t1", &via_transport).await.unwrap());

    // A blob signed by anyone but the server is refused.
    let forged = SignedRecencyBlob::sign(&Identity::generate(), unix_now() + 5);
    assert!(client.observe_recency("t1", &forged).is_err());
    assert_eq!(client.newest_recency("t1").unwrap(), seen);
}

#[tokio::test]
async fn cached_recency_survives_a_transport_restart() {
    let net = Net::start().await.unwrap();
    let (transport, _) = net.transport("t1").await.unwrap();
    transport.relay_with_server(&net.to_server()).await.unwrap();
    let cached = transport.cached_recency().unwrap();

    let (reopened, _) = net.transport("t1").await.unwrap();
    assert_eq!(reopened.cached_recency().unwrap().blob, cached.blob);
}

#[tokio::test]
async fn transport_only_accepts_client_uploads() {
    let net = Net::start().await.unwrap();
    let (transport, transport_addr) = net.transport("t1").await.unwrap();
    let client = net.client("carol", &Arc::new(Identity::generate())).unwrap();
    let bundle = client.generate().unwrap();
    let bytes = std::fs::read(&bundle.path).unwrap();

    let exchange = net.exchange(&transport_addr);
    let other = BundleSender::Transport("t2".into());
    assert!(exchange.upload(&other, &bundle.bundle_id, &bytes).await.is_err());
    assert!(transport.client_bundles().unwrap().is_empty());
}

#[tokio::test]
async fn crash_report_rides_along_with_an_upload() {
    let net = Net::start().await.unwrap();
    let client = net.client("dave", &Arc::new(Identity::generate())).unwrap();
    let bundle = client.generate().unwrap();
    let bytes = std::fs::read(&bundle.path).unwrap();

    let options = UploadOptions {
        crash_report: Some(b"panicked at main.rs:1".to_vec()),
    };
    net.to_server()
        .upload_with(client.sender(), &bundle.bundle_id, &bytes, &options)
        .await
        .unwrap();

    let reports: Vec<_> = std::fs::read_dir(net.dir("server").join("crash_reports"))
        .unwrap()
        .flatten()
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(std::fs::read(reports[0].path()).unwrap(), b"panicked at main.rs:1");
}
