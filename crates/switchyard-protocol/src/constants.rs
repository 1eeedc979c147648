/// Ciphertext value that tears down a peer's connection out-of-band of TLS.
pub const TEARDOWN_SENTINEL: &[u8] = b"-255";

/// Terminator between application messages inside one TLS stream.
pub const MESSAGE_DELIMITER: u8 = 0x00;

/// Maximum length of a peer routing identity, in bytes.
pub const MAX_IDENTITY_LEN: usize = 32;

/// Length of identities assigned by the router to peers that announce none.
pub const GENERATED_IDENTITY_LEN: usize = 5;

/// Target reachable by unauthenticated peers (registration only).
pub const ADMIN_TOPIC: &str = "admin";

/// Target handled by the liveness tracker.
pub const HEARTBEAT_TARGET: &str = "heartbeat";

/// Separates the PEM blocks of an APPROVED registration reply.
pub const CERT_SEPARATOR: &str = "-----SWITCHYARD-CERT-SEPARATOR-----";

/// Tenant id used when multi-tenancy is disabled.
pub const DEFAULT_TENANT_ID: &str = "DEFAULT";
pub const DEFAULT_TENANT_NAME: &str = "DEFAULT";

/// Pub/sub control actions (first byte of a subscription frame).
pub const SUBSCRIBE_ACTION: u8 = 0x01;
pub const UNSUBSCRIBE_ACTION: u8 = 0x00;

/// Greeting published on a freshly subscribed topic that is not a tenant id.
pub const WELCOME: &str = "WELCOME";

/// Marker published on every tenant topic each heartbeat cycle.
pub const HEARTBEAT_MARKER: &str = "HEARTBEAT";

/// Reply word carrying a tenant topic back to a node.
pub const TOPIC_REPLY: &str = "TOPIC";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;

/// Members unseen for longer than this multiple of the heartbeat interval are evicted.
pub const LIVENESS_FACTOR: f64 = 1.5;

pub const REGISTRATION_RETRY_SECS: u64 = 10;
pub const DEFAULT_APPROVAL_TIMEOUT_SECS: u64 = 600;

/// Default maximum certificate chain depth accepted from clients.
pub const DEFAULT_VERIFY_DEPTH: usize = 5;

/// Bounded poll used by every worker loop.
pub const POLL_INTERVAL_MS: u64 = 250;

/// Unauthenticated connections idle longer than this are dropped.
pub const DEFAULT_ANONYMOUS_IDLE_SECS: u64 = 30;
