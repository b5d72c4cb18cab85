//! Well-known label keys.
//!
//! Membership in a collection is denormalized onto each instance as a label so
//! that listers can select a collection's instances without walking owner
//! references.

/// Set on every instance that is an active member of a collection.
pub const COLLECTION_NAME: &str = "DedicatedGameServerCollectionName";

/// Set on an instance once it has been detached from its collection.
pub const ORIGINAL_COLLECTION_NAME: &str = "OriginalDedicatedGameServerCollectionName";

/// Set on every pod, naming the instance it is bound to.
pub const GAME_SERVER_NAME: &str = "DedicatedGameServerName";

/// Set on every pod created for an instance.
pub const IS_GAME_SERVER: &str = "IsDedicatedGameServer";
