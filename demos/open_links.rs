//! Opens a scope against a real Event Hubs-compatible endpoint and attaches
//! a producer and a consumer link, authorizing both via a SAS credential.
//!
//! Configuration is read from the environment (optionally via a `.env`
//! file), matching the teacher crate's own `examples/service_bus` binaries.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use amqp_connection_scope::{
    ConnectionScope, ConsumerOptions, EventPosition, ServiceEndpoint, TransportType,
};
use dotenv::dotenv;

#[tokio::main]
async fn main() {
    dotenv().ok();

    let hostname = env::var("HOST_NAME").expect("HOST_NAME not set");
    let entity = env::var("EVENT_HUB_NAME").expect("EVENT_HUB_NAME not set");
    let key_name = env::var("SHARED_ACCESS_KEY_NAME").expect("SHARED_ACCESS_KEY_NAME not set");
    let key_value = env::var("SHARED_ACCESS_KEY_VALUE").expect("SHARED_ACCESS_KEY_VALUE not set");

    let url = url::Url::parse(&format!("sb://{hostname}/")).unwrap();
    let endpoint = ServiceEndpoint::new(url, entity).unwrap();

    let credential = Arc::new(amqp_connection_scope::credential::SharedAccessSignatureCredential::new(
        key_name,
        key_value,
        Duration::from_secs(60 * 60),
    ));

    let scope = ConnectionScope::new(endpoint, credential, TransportType::TcpTls, None, None)
        .expect("failed to construct connection scope");

    let timeout = Duration::from_secs(30);
    let cancel = amqp_connection_scope::cancellation::CancellationSignal::none();

    let mut producer = scope
        .open_producer_link(Some("0"), timeout, &cancel)
        .await
        .expect("failed to open producer link");
    println!("opened producer link {}", producer.name());

    let mut consumer = scope
        .open_consumer_link(
            "$Default",
            "0",
            EventPosition::Latest,
            ConsumerOptions {
                prefetch_count: 100,
                owner_level: None,
                track_last_enqueued_event_information: true,
            },
            timeout,
            &cancel,
        )
        .await
        .expect("failed to open consumer link");
    println!("opened consumer link {}", consumer.name());

    producer.close().await.ok();
    consumer.close().await.ok();
    scope.dispose().await;
}
