//! The shared ten-step skeleton all three link roles open through
//! (spec.md §4.3), plus the role-specific `Source`/`Target`/properties each
//! one builds at step 6.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp::link::{ReceiverAttachError, SenderAttachError};
use fe2o3_amqp::{Receiver, Sender, Session};
use fe2o3_amqp_management::client::MgmtClient;
use fe2o3_amqp_types::messaging::{Source, Target};
use fe2o3_amqp_types::primitives::{Symbol, Value};
use tracing::{debug, instrument};

use crate::cancellation::CancellationSignal;
use crate::cbs::{self, claims};
use crate::connection::fault_tolerant::FaultTolerantConnection;
use crate::connection::{AmqpConnectionHandle, ConnectionFactory};
use crate::credential::TokenCredential;
use crate::deadline::Deadline;
use crate::endpoint::ServiceEndpoint;
use crate::error::{Result, ScopeError};
use crate::position::EventPosition;
use crate::refresh::{self, arm_refresh_timer, TokenRefresher};
use crate::registry::{LinkHandleId, SharedRegistry};

use super::naming::{format_link_name, IdSequence};
use super::{ConsumerLink, ConsumerOptions, ManagementLink, ProducerLink};

/// Session-level timeout (spec.md §3: "Session-level timeout = 30 s").
const SESSION_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds and tracks links for a single scope. Shared across all three
/// roles: the only thing that differs between them is step 4 (whether CBS
/// authorization runs at all) and step 6 (the role-specific link settings).
pub struct LinkOpener {
    connection: Arc<FaultTolerantConnection<ConnectionFactory>>,
    registry: SharedRegistry,
    credential: Arc<dyn TokenCredential>,
    endpoint: ServiceEndpoint,
    scope_id: String,
    disposed: Arc<AtomicBool>,
    session_seq: IdSequence,
    link_seq: IdSequence,
    /// Derived from the scope's own `CancellationSource`, distinct from the
    /// per-call `cancel` every opener method already takes: this one fires
    /// only on scope `dispose()` (spec.md §5) and is threaded into every CBS
    /// token request so an in-flight `get_token` aborts the moment the scope
    /// goes away, instead of outliving it.
    scope_cancel: CancellationSignal,
}

impl LinkOpener {
    pub fn new(
        connection: Arc<FaultTolerantConnection<ConnectionFactory>>,
        registry: SharedRegistry,
        credential: Arc<dyn TokenCredential>,
        endpoint: ServiceEndpoint,
        scope_id: String,
        disposed: Arc<AtomicBool>,
        scope_cancel: CancellationSignal,
    ) -> Self {
        LinkOpener {
            connection,
            registry,
            credential,
            endpoint,
            scope_id,
            disposed,
            session_seq: IdSequence::new(),
            link_seq: IdSequence::new(),
            scope_cancel,
        }
    }

    fn assert_usable(&self, cancel: &CancellationSignal) -> Result<()> {
        if self.disposed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(ScopeError::Disposed);
        }
        cancel.check()
    }

    /// Acquires the scope's connection and begins a fresh session for the
    /// link about to be opened (steps 1-5 of the skeleton).
    async fn begin(
        &self,
        deadline: &Deadline,
        cancel: &CancellationSignal,
    ) -> Result<(AmqpConnectionHandle, Session, String)> {
        self.assert_usable(cancel)?;
        let connection = self.connection.get_or_create(deadline.check()?).await?;

        cancel.check()?;
        let session_timeout = std::cmp::min(SESSION_OPEN_TIMEOUT, deadline.remaining());
        let session = connection.begin_session(session_timeout).await?;

        // Connection identity is not exposed by `fe2o3-amqp`'s public
        // handles; `0` stands in for it here since a scope only ever holds
        // one logical connection at a time (spec.md §3, Non-goals).
        let link_name = format_link_name(&self.scope_id, 0, self.session_seq.next(), self.link_seq.next());
        Ok((connection, session, link_name))
    }

    /// Requests CBS authorization for a non-management link, returning the
    /// token's server-acknowledged expiry (skeleton step 4).
    async fn authorize(
        &self,
        connection: &AmqpConnectionHandle,
        resource: &str,
        claims: &[&str],
        deadline: &Deadline,
    ) -> Result<chrono::DateTime<chrono::Utc>> {
        cbs::request_token(
            connection,
            self.credential.as_ref(),
            self.endpoint.url.as_str(),
            resource,
            claims,
            deadline.check()?,
            &self.scope_cancel,
        )
        .await
    }

    #[instrument(skip(self, cancel))]
    pub async fn open_management(
        &self,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> Result<ManagementLink> {
        let deadline = Deadline::starting_now(timeout);
        let (_connection, mut session, link_name) = self.begin(&deadline, cancel).await?;

        // `MgmtClient::attach` takes the client-side node address (its own
        // reply-to link name), not the fixed server-side "$management"
        // address; reusing it here keeps one well-known string per scope
        // rather than minting a random reply-to address per management link.
        let id = LinkHandleId::next();
        let client = match MgmtClient::attach(&mut session, self.endpoint.management_address()).await {
            Ok(client) => client,
            Err(e) => {
                let _ = session.end().await;
                return Err(ScopeError::link_creation(e.to_string()));
            }
        };

        if let Err(e) = self.registry.insert(id, None) {
            tracing::warn!("registry insert failed for management link, safe-closing");
            let mut client = client;
            let _ = client.close().await;
            return Err(e);
        }

        debug!(link = %link_name, "management link opened");
        Ok(ManagementLink {
            client,
            id,
            name: link_name,
            registry: self.registry.clone(),
        })
    }

    #[instrument(skip(self, cancel))]
    pub async fn open_producer(
        &self,
        partition_id: Option<&str>,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> Result<ProducerLink> {
        let deadline = Deadline::starting_now(timeout);
        let (connection, mut session, link_name) = self.begin(&deadline, cancel).await?;

        let target_address = self.endpoint.producer_target(partition_id);
        let expiry = self
            .authorize(&connection, &self.endpoint.entity, claims::PRODUCER, &deadline)
            .await?;

        cancel.check()?;
        let source = Source::builder().address(uuid_like_id()).build();
        let target = Target::builder().address(target_address.clone()).build();
        let properties = producer_link_properties(deadline.remaining());

        let attach_result: std::result::Result<Sender, SenderAttachError> = Sender::builder()
            .name(link_name.clone())
            .source(source)
            .target(target)
            .properties(properties)
            .attach(&mut session)
            .await;
        let sender = match attach_result {
            Ok(sender) => sender,
            Err(e) => {
                let _ = session.end().await;
                return Err(ScopeError::link_creation(e.to_string()));
            }
        };

        let id = LinkHandleId::next();
        let refresher = CbsRefresher {
            connection: connection.clone(),
            credential: self.credential.clone(),
            endpoint: self.endpoint.url.to_string(),
            resource: self.endpoint.entity.clone(),
            claims: claims::PRODUCER,
            cancel: self.scope_cancel.clone(),
        };
        let timer = arm_refresh_timer(link_name.clone(), Arc::new(refresher), expiry);

        if let Err(e) = self.registry.insert(id, Some(timer.clone())) {
            timer.dispose().await;
            let _ = sender.close().await;
            return Err(e);
        }

        debug!(link = %link_name, "producer link opened");
        Ok(ProducerLink {
            sender,
            id,
            name: link_name,
            registry: self.registry.clone(),
        })
    }

    #[instrument(skip(self, cancel, options))]
    pub async fn open_consumer(
        &self,
        consumer_group: &str,
        partition_id: &str,
        event_position: EventPosition,
        options: ConsumerOptions,
        timeout: Duration,
        cancel: &CancellationSignal,
    ) -> Result<ConsumerLink> {
        let deadline = Deadline::starting_now(timeout);
        let (connection, mut session, link_name) = self.begin(&deadline, cancel).await?;

        let source_address = self.endpoint.consumer_source(consumer_group, partition_id);
        let expiry = self
            .authorize(&connection, &self.endpoint.entity, claims::CONSUMER, &deadline)
            .await?;

        cancel.check()?;
        let source = Source::builder()
            .address(source_address.clone())
            .filter(event_position.to_filter_set())
            .build();
        let target = Target::builder().address(uuid_like_id()).build();
        let properties = consumer_link_properties(deadline.remaining(), options.owner_level);
        let desired_capabilities = options
            .track_last_enqueued_event_information
            .then(|| vec![Symbol::from("com.microsoft:track-last-enqueued-event-information")]);

        let mut builder = Receiver::builder()
            .name(link_name.clone())
            .source(source)
            .target(target)
            .properties(properties)
            .credit_mode(select_credit_mode(&options));
        if let Some(caps) = desired_capabilities {
            builder = builder.desired_capabilities(caps);
        }

        let attach_result: std::result::Result<Receiver, ReceiverAttachError> =
            builder.attach(&mut session).await;
        let receiver = match attach_result {
            Ok(receiver) => receiver,
            Err(e) => {
                let _ = session.end().await;
                return Err(ScopeError::link_creation(e.to_string()));
            }
        };

        let id = LinkHandleId::next();
        let refresher = CbsRefresher {
            connection: connection.clone(),
            credential: self.credential.clone(),
            endpoint: self.endpoint.url.to_string(),
            resource: self.endpoint.entity.clone(),
            claims: claims::CONSUMER,
            cancel: self.scope_cancel.clone(),
        };
        let timer = arm_refresh_timer(link_name.clone(), Arc::new(refresher), expiry);

        if let Err(e) = self.registry.insert(id, Some(timer.clone())) {
            timer.dispose().await;
            let _ = receiver.close().await;
            return Err(e);
        }

        debug!(link = %link_name, "consumer link opened");
        Ok(ConsumerLink {
            receiver,
            id,
            name: link_name,
            registry: self.registry.clone(),
        })
    }
}

/// `autoFlow = (prefetchCount > 0)` (spec.md §3/§8): a zero prefetch count
/// means the caller drives credit itself, so the receiver must not be handed
/// an auto-topping-up credit mode at all.
fn select_credit_mode(options: &ConsumerOptions) -> fe2o3_amqp::link::receiver::CreditMode {
    if options.auto_flow() {
        fe2o3_amqp::link::receiver::CreditMode::Auto(options.prefetch_count)
    } else {
        fe2o3_amqp::link::receiver::CreditMode::Manual
    }
}

fn uuid_like_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn producer_link_properties(remaining: Duration) -> fe2o3_amqp_types::definitions::Fields {
    let mut fields = fe2o3_amqp_types::definitions::Fields::new();
    fields.insert(Symbol::from("EntityType"), Value::String("EventHub".into()));
    fields.insert(
        Symbol::from("Timeout"),
        Value::UInt(remaining.as_millis() as u32),
    );
    fields
}

fn consumer_link_properties(remaining: Duration, owner_level: Option<i64>) -> fe2o3_amqp_types::definitions::Fields {
    let mut fields = fe2o3_amqp_types::definitions::Fields::new();
    fields.insert(Symbol::from("EntityType"), Value::String("ConsumerGroup".into()));
    fields.insert(
        Symbol::from("Timeout"),
        Value::UInt(remaining.as_millis() as u32),
    );
    if let Some(level) = owner_level {
        fields.insert(Symbol::from("OwnerLevel"), Value::Long(level));
    }
    fields
}

/// Adapts [`cbs::request_token`] to the [`TokenRefresher`] contract so
/// `arm_refresh_timer` can drive CBS re-authorization for a specific link
/// without the refresh loop needing to know about sessions or links at all.
struct CbsRefresher {
    connection: AmqpConnectionHandle,
    credential: Arc<dyn TokenCredential>,
    endpoint: String,
    resource: String,
    claims: &'static [&'static str],
    /// The scope-internal signal, not the per-call `cancel` passed to the
    /// opener that created this link — the refresh loop outlives that call.
    cancel: CancellationSignal,
}

#[async_trait]
impl TokenRefresher for CbsRefresher {
    async fn refresh(&self) -> std::result::Result<chrono::DateTime<chrono::Utc>, String> {
        cbs::request_token(
            &self.connection,
            self.credential.as_ref(),
            &self.endpoint,
            &self.resource,
            self.claims,
            refresh::refresh_timeout(),
            &self.cancel,
        )
        .await
        .map_err(|e| e.to_string())
    }
}

impl std::fmt::Debug for CbsRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CbsRefresher").field("resource", &self.resource).finish()
    }
}
