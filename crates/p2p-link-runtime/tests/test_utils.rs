//! Test utilities for deterministic testing of the link layer
//!
//! In-memory stand-ins for every collaborator (directory, group policy,
//! key store, hosting map, message bus) plus a small network that routes
//! `link.out` records of one node to the `link.in` processor of another.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use parking_lot::{Mutex, RwLock};
use rand_chacha::ChaCha8Rng;
use rand_core::{CryptoRng, RngCore, SeedableRng};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

use p2p_link_core::records::LINK_IN_TOPIC;
use p2p_link_core::{
    AppMessage, AuthenticatedMessage, AuthenticatedMessageHeader, CounterpartyKey,
    DataMessagePayload, GroupPolicy, HoldingIdentity, IdentityKeyPair, LinkError, LinkInMessage,
    LinkManagerConfig, LinkOutMessage, LinkPayload, LinkResult, MarkerKind, MemberInfo, MessageId,
    NetworkType, PkiMode, ProtocolMode, Record, RecordValue, SealedPayload, Session, SessionId,
    SignatureSpec, TimeSource, Timestamp,
};
use p2p_link_runtime::{
    GroupPolicyProvider, HostingMap, LinkCollaborators, LinkManager, LinkManagerBuilder,
    MembershipLookup, RecordPublisher, SigningOracle,
};

pub const GROUP: &str = "group-1";

// ----------------------------------------------------------------------------
// Mock Time Source
// ----------------------------------------------------------------------------

/// Mock time source for deterministic testing
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    current_time: Arc<AtomicU64>,
}

impl MockTimeSource {
    /// Create a new mock time source starting at a specific time
    pub fn new_at(start_time: u64) -> Self {
        Self {
            current_time: Arc::new(AtomicU64::new(start_time)),
        }
    }

    /// Advance time by the specified number of milliseconds
    pub fn advance(&self, millis: u64) {
        self.current_time.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn current_time(&self) -> u64 {
        self.current_time.load(Ordering::SeqCst)
    }
}

impl Default for MockTimeSource {
    fn default() -> Self {
        Self::new_at(1_000_000)
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current_time.load(Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Deterministic Keys
// ----------------------------------------------------------------------------

/// Seeded RNG so generated keys are identical across runs
pub struct DeterministicRng {
    inner: ChaCha8Rng,
}

impl DeterministicRng {
    pub fn new() -> Self {
        Self::with_seed(42)
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.inner.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.inner.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.inner.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.inner.try_fill_bytes(dest)
    }
}

impl CryptoRng for DeterministicRng {}

/// Identity key derived from a fixed seed
pub fn deterministic_key(seed: u8) -> IdentityKeyPair {
    IdentityKeyPair::generate_with_rng(&mut DeterministicRng::with_seed(u64::from(seed)))
}

pub fn identity(name: &str) -> HoldingIdentity {
    HoldingIdentity::new(format!("O={}, L=London, C=GB", name), GROUP)
}

pub fn counterparties(ours: &TestNode, theirs: &TestNode) -> CounterpartyKey {
    CounterpartyKey::new(ours.identity.clone(), theirs.identity.clone())
}

// ----------------------------------------------------------------------------
// Directory and Group Policy
// ----------------------------------------------------------------------------

/// Membership directory and group policy store shared by every test node
#[derive(Default)]
pub struct TestDirectory {
    members: RwLock<HashMap<HoldingIdentity, MemberInfo>>,
    policies: RwLock<HashMap<String, GroupPolicy>>,
}

impl TestDirectory {
    pub fn add_member(&self, member: MemberInfo) {
        self.members
            .write()
            .insert(member.holding_identity.clone(), member);
    }

    pub fn remove_member(&self, identity: &HoldingIdentity) {
        self.members.write().remove(identity);
    }

    pub fn member(&self, identity: &HoldingIdentity) -> Option<MemberInfo> {
        self.members.read().get(identity).cloned()
    }

    pub fn set_policy(&self, policy: GroupPolicy) {
        self.policies.write().insert(policy.group_id.clone(), policy);
    }

    pub fn update_policy(&self, group_id: &str, update: impl FnOnce(&mut GroupPolicy)) {
        if let Some(policy) = self.policies.write().get_mut(group_id) {
            update(policy);
        }
    }
}

impl MembershipLookup for TestDirectory {
    fn resolve_member(&self, identity: &HoldingIdentity) -> Option<MemberInfo> {
        self.member(identity)
    }
}

impl GroupPolicyProvider for TestDirectory {
    fn resolve_group_policy(&self, group_id: &str) -> Option<GroupPolicy> {
        self.policies.read().get(group_id).cloned()
    }
}

// ----------------------------------------------------------------------------
// Key Store
// ----------------------------------------------------------------------------

/// Signing oracle holding the session keys of the identities one node hosts
#[derive(Default)]
pub struct TestKeyStore {
    keys: RwLock<HashMap<[u8; 32], (String, IdentityKeyPair)>>,
    signatures: AtomicUsize,
    /// Reports the held request, then waits for the release
    hold: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
}

impl TestKeyStore {
    pub fn add_key(&self, tenant_id: String, key: IdentityKeyPair) {
        self.keys.write().insert(key.public_key_bytes(), (tenant_id, key));
    }

    /// Answer signing requests for `public_key` with an unrelated key
    pub fn add_impostor(&self, public_key: [u8; 32], tenant_id: String, key: IdentityKeyPair) {
        self.keys.write().insert(public_key, (tenant_id, key));
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.load(Ordering::SeqCst)
    }

    /// Hold the next signing request until the returned sender fires
    ///
    /// The returned receiver gets a message once the request is waiting.
    pub fn hold_next_signature(&self) -> (mpsc::Receiver<()>, mpsc::Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.hold.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }
}

impl SigningOracle for TestKeyStore {
    fn sign(
        &self,
        tenant_id: &str,
        public_key: &[u8; 32],
        spec: SignatureSpec,
        data: &[u8],
    ) -> LinkResult<Vec<u8>> {
        assert_eq!(spec, SignatureSpec::Ed25519);
        let hold = self.hold.lock().take();
        if let Some((entered, release)) = hold {
            let _ = entered.send(());
            let _ = release.recv();
        }
        let keys = self.keys.read();
        let (tenant, key) = keys
            .get(public_key)
            .ok_or_else(|| LinkError::unresolved("signing key"))?;
        if tenant != tenant_id {
            return Err(LinkError::unresolved(format!("signing key of tenant {}", tenant_id)));
        }
        self.signatures.fetch_add(1, Ordering::SeqCst);
        Ok(key.sign(data).to_vec())
    }
}

// ----------------------------------------------------------------------------
// Hosting Map
// ----------------------------------------------------------------------------

#[derive(Default)]
pub struct TestHosting {
    hosted: RwLock<HashSet<HoldingIdentity>>,
}

impl TestHosting {
    pub fn host(&self, identity: HoldingIdentity) {
        self.hosted.write().insert(identity);
    }

    pub fn hosts(&self, identity: &HoldingIdentity) -> bool {
        self.hosted.read().contains(identity)
    }
}

impl HostingMap for TestHosting {
    fn is_hosted_locally(&self, identity: &HoldingIdentity) -> bool {
        self.hosts(identity)
    }
}

// ----------------------------------------------------------------------------
// Recording Publisher
// ----------------------------------------------------------------------------

/// Message bus stand-in that remembers every published record
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<Record>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    /// Take everything published so far
    pub fn drain(&self) -> Vec<Record> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn published(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl RecordPublisher for RecordingPublisher {
    fn publish(&self, records: Vec<Record>) -> LinkResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(LinkError::publish_failed("bus unavailable"));
        }
        self.records.lock().extend(records);
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Plain Session
// ----------------------------------------------------------------------------

/// Session that seals nothing, for tests of the queue alone
#[derive(Debug)]
pub struct PlainSession {
    pub session_id: SessionId,
    pub max_message_size: u32,
    next_nonce: AtomicU64,
}

impl PlainSession {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: SessionId::new(session_id),
            max_message_size: 1_000_000,
            next_nonce: AtomicU64::new(0),
        }
    }
}

impl Session for PlainSession {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn mode(&self) -> ProtocolMode {
        ProtocolMode::Authentication
    }

    fn max_message_size(&self) -> u32 {
        self.max_message_size
    }

    fn seal(&self, plaintext: &[u8]) -> LinkResult<SealedPayload> {
        Ok(SealedPayload {
            nonce: self.next_nonce.fetch_add(1, Ordering::SeqCst),
            payload: plaintext.to_vec(),
            tag: None,
        })
    }

    fn open(&self, sealed: &SealedPayload) -> LinkResult<Vec<u8>> {
        Ok(sealed.payload.clone())
    }
}

/// Message id carried by a data record sealed under a `PlainSession`
pub fn plain_message_id(record: &Record) -> Option<MessageId> {
    let RecordValue::LinkOut(LinkOutMessage {
        payload: LinkPayload::AuthenticatedData(data),
        ..
    }) = &record.value
    else {
        return None;
    };
    match DataMessagePayload::from_binary(&data.sealed.payload).ok()? {
        DataMessagePayload::Data(message) => Some(message.header.message_id),
        DataMessagePayload::Ack(_) => None,
    }
}

// ----------------------------------------------------------------------------
// Messages and Record Inspection
// ----------------------------------------------------------------------------

pub fn authenticated(
    source: &HoldingIdentity,
    destination: &HoldingIdentity,
    id: &str,
    ttl: Option<Timestamp>,
) -> AuthenticatedMessage {
    AuthenticatedMessage {
        header: AuthenticatedMessageHeader {
            destination: destination.clone(),
            source: source.clone(),
            ttl,
            message_id: MessageId::new(id),
            trace_id: None,
            subsystem: "flow".into(),
            suppress_ack: false,
        },
        payload: format!("payload of {}", id).into_bytes(),
    }
}

pub fn p2p_out(message: AuthenticatedMessage) -> Record {
    Record::new(
        p2p_link_core::records::P2P_OUT_TOPIC,
        message.message_id().to_string(),
        RecordValue::AppMessage(AppMessage::Authenticated(message)),
    )
}

pub fn on_topic<'a>(records: &'a [Record], topic: &'a str) -> impl Iterator<Item = &'a Record> + 'a {
    records.iter().filter(move |record| record.topic == topic)
}

/// `(message id, marker kind)` of every marker record, in order
pub fn markers(records: &[Record]) -> Vec<(String, MarkerKind)> {
    records
        .iter()
        .filter_map(|record| match &record.value {
            RecordValue::Marker(marker) => Some((marker.message_id.to_string(), marker.kind())),
            _ => None,
        })
        .collect()
}

pub fn link_outs(records: &[Record]) -> Vec<LinkOutMessage> {
    records
        .iter()
        .filter_map(|record| match &record.value {
            RecordValue::LinkOut(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Application messages delivered on `p2p.in`, in order
pub fn delivered(records: &[Record]) -> Vec<AppMessage> {
    on_topic(records, p2p_link_core::records::P2P_IN_TOPIC)
        .filter_map(|record| match &record.value {
            RecordValue::AppMessage(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn delivered_ids(records: &[Record]) -> Vec<String> {
    delivered(records)
        .iter()
        .map(|message| message.message_id().to_string())
        .collect()
}

/// What the gateway of the destination hands to its link layer
pub fn to_link_in(message: LinkOutMessage) -> Record {
    let key = message.record_key();
    Record::new(LINK_IN_TOPIC, key, RecordValue::LinkIn(message.into_link_in()))
}

pub fn link_in(payload: LinkPayload) -> Record {
    Record::new(LINK_IN_TOPIC, "k", RecordValue::LinkIn(LinkInMessage { payload }))
}

// ----------------------------------------------------------------------------
// Warning Counter
// ----------------------------------------------------------------------------

/// Layer counting `WARN` events
struct WarningCounter {
    count: Arc<AtomicUsize>,
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Run `f` and count the warnings it logs on this thread
pub fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = tracing_subscriber::registry().with(WarningCounter {
        count: count.clone(),
    });
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, count.load(Ordering::SeqCst))
}

// ----------------------------------------------------------------------------
// Test Network
// ----------------------------------------------------------------------------

/// One node of the test network, hosting a single identity
pub struct TestNode {
    pub identity: HoldingIdentity,
    pub key: IdentityKeyPair,
    pub link: LinkManager<MockTimeSource>,
    pub publisher: Arc<RecordingPublisher>,
    pub hosting: Arc<TestHosting>,
    pub keys: Arc<TestKeyStore>,
}

/// Nodes sharing one directory, one trust root and one clock
pub struct TestNetwork {
    pub time: MockTimeSource,
    pub directory: Arc<TestDirectory>,
    pub trust_root: IdentityKeyPair,
    pub nodes: Vec<TestNode>,
}

impl TestNetwork {
    pub fn new(names: &[&str]) -> Self {
        Self::with_config(names, LinkManagerConfig::for_testing())
    }

    pub fn with_config(names: &[&str], config: LinkManagerConfig) -> Self {
        let time = MockTimeSource::default();
        let directory = Arc::new(TestDirectory::default());
        let trust_root = deterministic_key(200);
        directory.set_policy(GroupPolicy {
            group_id: GROUP.into(),
            network_type: NetworkType::Standard,
            trust_roots: vec![trust_root.public_key_bytes()],
            pki_mode: PkiMode::Standard,
        });

        let mut network = Self {
            time,
            directory,
            trust_root,
            nodes: Vec::new(),
        };
        for (index, name) in names.iter().enumerate() {
            network.add_node(name, index as u8 + 1, config.clone());
        }
        network
    }

    /// Register `name` in the directory and start a node hosting it
    pub fn add_node(&mut self, name: &str, seed: u8, config: LinkManagerConfig) {
        let identity = identity(name);
        let key = deterministic_key(seed);
        self.directory.add_member(MemberInfo {
            holding_identity: identity.clone(),
            session_public_key: key.public_key_bytes(),
            session_key_endorsement: Some(self.trust_root.endorse(&key.public_key_bytes())),
            endpoint: format!("https://{}.example.com:8443", name.to_lowercase()),
            protocol_modes: vec![ProtocolMode::AuthenticatedEncryption, ProtocolMode::Authentication],
        });

        let keys = Arc::new(TestKeyStore::default());
        keys.add_key(identity.short_hash(), key.clone());
        let hosting = Arc::new(TestHosting::default());
        hosting.host(identity.clone());
        let publisher = Arc::new(RecordingPublisher::default());

        let collaborators = LinkCollaborators {
            members: self.directory.clone(),
            policies: self.directory.clone(),
            signer: keys.clone(),
            hosting: hosting.clone(),
            publisher: publisher.clone(),
        };
        let link = LinkManagerBuilder::new(collaborators)
            .with_config(config)
            .build(self.time.clone())
            .expect("test configuration is valid");
        link.partitions()
            .on_partitions_assigned(&[(LINK_IN_TOPIC.to_string(), 0), (LINK_IN_TOPIC.to_string(), 1)]);

        self.nodes.push(TestNode {
            identity,
            key,
            link,
            publisher,
            hosting,
            keys,
        });
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    fn node_hosting(&self, identity: &HoldingIdentity) -> Option<&TestNode> {
        self.nodes.iter().find(|node| node.hosting.hosts(identity))
    }

    /// Deliver every `link.out` record to the node hosting its destination
    ///
    /// Returns what the receiving inbound processors produced.
    pub fn deliver(&self, records: &[Record]) -> Vec<Record> {
        let mut output = Vec::new();
        for message in link_outs(records) {
            let Some(node) = self.node_hosting(&message.header.destination) else {
                continue;
            };
            output.extend(node.link.inbound().on_next(vec![to_link_in(message)]));
        }
        output
    }

    /// Keep delivering wire traffic, including records published by queue
    /// flushes, until none is left; returns every record produced on the way
    pub fn settle(&self, records: Vec<Record>) -> Vec<Record> {
        let mut transcript = Vec::new();
        let mut pending = records;
        loop {
            for node in &self.nodes {
                pending.extend(node.publisher.drain());
            }
            if pending.is_empty() {
                return transcript;
            }
            let produced = self.deliver(&pending);
            transcript.extend(pending);
            pending = produced;
        }
    }
}
