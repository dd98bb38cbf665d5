// -
// Configuration

/// Environment variable prefix for configuration overrides (`KEYVAL__...`)
pub(crate) const ENV_PREFIX: &str = "KEYVAL";

// -
// Iteration

/// Keys requested per scan round trip
pub(crate) const SCAN_PAGE_SIZE: usize = 100;

// -
// Keyspace notifications

/// Channel prefix of keyspace notifications, followed by `<db>__:`
pub(crate) const KEYSPACE_CHANNEL_PREFIX: &str = "__keyspace@";

/// Event flags enabling keyspace notifications for all commands
pub(crate) const KEYSPACE_EVENTS: &str = "KA";

/// Number of hash slots in a cluster
pub(crate) const CLUSTER_SLOTS: u16 = 16384;
