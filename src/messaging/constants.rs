use std::time::Duration;

// Keys found in received message dictionaries.
pub const RAW_DATA_KEY: &str = "rawData";
pub const COLLAPSE_KEY: &str = "collapse_key";
pub const FROM_KEY: &str = "from";

/// Prefix of every key the backend reserves for itself inside a message.
pub const MESSAGE_INTERNAL_RESERVED_PREFIX: &str = "gcm.";
pub const MESSAGE_GOOGLE_RESERVED_PREFIX: &str = "google.";
pub const MESSAGE_PERSISTENT_ID_KEY: &str = "persistent_id";
pub const MESSAGE_ID_KEY: &str = "gcm.message_id";
pub const MESSAGE_APS_KEY: &str = "aps";
pub const MESSAGE_APNS_CONTENT_AVAILABLE_KEY: &str = "content-available";
pub const MESSAGE_SYNC_VIA_MCS_KEY: &str = "gcm.duplex";
pub const MESSAGE_SYNC_MESSAGE_TTL_KEY: &str = "gcm.ttl";
pub const MESSAGE_LINK_KEY: &str = "gcm.app.link";

/// Sender used by the instance-id backend for control messages.
pub const IID_MESSAGE_SENDER: &str = "google.com/iid";
/// Data key holding a control command in instance-id messages.
pub const IID_COMMAND_KEY: &str = "CMD";
/// Command value instructing the client to discard its identity.
pub const IDENTITY_RESET_COMMAND: &str = "RST";

/// Subdirectory, relative to the cache root, owned by this crate.
pub const MESSAGING_SUBDIRECTORY_NAME: &str = "Google/FirebaseMessaging";
/// Subdirectory used by older releases; migrated on first open.
pub const INSTANCE_ID_SUBDIRECTORY_NAME: &str = "Google/FirebaseInstanceID";

// Notification names.
pub const CHECKIN_FETCHED_NOTIFICATION: &str = "com.google.gcm.notif-checkin-fetched";
pub const REGISTRATION_TOKEN_REFRESH_NOTIFICATION: &str = "com.firebase.iid.notif.refresh-token";
pub const DEFAULT_GCM_TOKEN_FAIL_NOTIFICATION: &str = "com.google.gcm.notif-default-gcm-token-fail";
pub const IDENTITY_INVALIDATED_NOTIFICATION: &str = "com.google.iid.identity-invalidated";

/// Default message TTL; also the default lifetime of a checkin identity.
pub const SEND_TTL_DEFAULT: Duration = Duration::from_secs(24 * 60 * 60);
/// Cached tokens older than this are re-registered on next access.
pub const TOKEN_REFRESH_INTERVAL_DEFAULT: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Scope of the IID "all scope" token. The server never issued it.
pub const ALL_SCOPE_IDENTIFIER: &str = "iid-all";
/// Scope of the default registration token.
pub const DEFAULT_TOKEN_SCOPE: &str = "*";

// Keys of the token options mapping, as sent in registration requests.
pub const TOKEN_OPTIONS_APNS_KEY: &str = "apns_token";
pub const TOKEN_OPTIONS_APNS_IS_SANDBOX_KEY: &str = "apns_sandbox";
pub const TOKEN_OPTIONS_FIREBASE_APP_ID_KEY: &str = "gmp_app_id";
/// Installation ID / instance ID parameter of a token request.
pub const PARAM_INSTANCE_ID: &str = "appid";

/// Keychain error reported when the process lacks the secure-storage entitlement.
pub const SEC_MISSING_ENTITLEMENT_ERROR_CODE: i32 = -34018;

pub const CHECKIN_API_URL: &str = "https://device-provisioning.googleapis.com/checkin";
pub const REGISTRATION_API_URL: &str = "https://fcmtoken.googleapis.com/register";
