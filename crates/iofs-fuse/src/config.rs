//! Mount and connection configuration.
//!
//! [`MountConfig`] is what the operator chooses on the command line.
//! [`ConnConfig`] is the set of kernel-facing knobs the engine gets to look
//! at once during `init`. [`SinkConfig`] holds the external sink settings
//! that are accepted and logged but not consumed yet.

use iofs_metrics::ExporterConfig;
use std::time::Duration;

/// Default kernel cache TTL for attributes and entries.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Default filesystem name shown in the mount table.
pub const DEFAULT_FSNAME: &str = "iofs";

/// Configuration options for the mounted filesystem.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Time-to-live for cached file attributes.
    ///
    /// Only honored while auto-caching stays enabled; otherwise attributes
    /// are not cached at all so every stat reaches the engine.
    pub attr_ttl: Duration,

    /// Time-to-live for cached directory entries.
    pub entry_ttl: Duration,

    /// Route reads and writes through the buffer-vector path.
    pub zero_copy: bool,

    /// Allow other users to access the mount.
    pub allow_other: bool,

    /// Filesystem name in the mount table.
    pub fsname: String,

    /// Metrics endpoint; `None` disables the exporter.
    pub metrics: Option<ExporterConfig>,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            attr_ttl: DEFAULT_TTL,
            entry_ttl: DEFAULT_TTL,
            zero_copy: false,
            allow_other: false,
            fsname: DEFAULT_FSNAME.to_string(),
            metrics: Some(ExporterConfig::default()),
        }
    }
}

impl MountConfig {
    /// Sets the attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }

    /// Sets the entry TTL.
    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Enables or disables the zero-copy path.
    #[must_use]
    pub fn zero_copy(mut self, enabled: bool) -> Self {
        self.zero_copy = enabled;
        self
    }

    /// Enables or disables `allow_other`.
    #[must_use]
    pub fn allow_other(mut self, enabled: bool) -> Self {
        self.allow_other = enabled;
        self
    }

    /// Sets the filesystem name.
    #[must_use]
    pub fn fsname(mut self, name: impl Into<String>) -> Self {
        self.fsname = name.into();
        self
    }

    /// Sets (or clears) the metrics endpoint.
    #[must_use]
    pub fn metrics(mut self, exporter: Option<ExporterConfig>) -> Self {
        self.metrics = exporter;
        self
    }

    /// Initial connection settings derived from this configuration.
    pub fn conn_config(&self) -> ConnConfig {
        ConnConfig {
            attr_timeout: self.attr_ttl,
            entry_timeout: self.entry_ttl,
            ..ConnConfig::default()
        }
    }
}

/// Connection settings negotiated once at mount time.
///
/// Handed to the engine's `init`, which may switch `auto_cache` off; the
/// protocol adapter derives its reply TTLs and open flags from the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    /// Let the kernel keep attributes and page cache between calls.
    pub auto_cache: bool,
    /// Keep page cache across opens.
    pub kernel_cache: bool,
    /// Bypass the page cache entirely.
    pub direct_io: bool,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
    pub negative_timeout: Duration,
    /// Forward `flock(2)` to the filesystem.
    pub flock: bool,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            auto_cache: true,
            kernel_cache: false,
            direct_io: false,
            attr_timeout: DEFAULT_TTL,
            entry_timeout: DEFAULT_TTL,
            negative_timeout: Duration::ZERO,
            flock: true,
        }
    }
}

impl ConnConfig {
    /// Attribute TTL the kernel should actually be given.
    pub fn effective_attr_ttl(&self) -> Duration {
        if self.auto_cache {
            self.attr_timeout
        } else {
            Duration::ZERO
        }
    }

    /// TTL for entry replies. The kernel caches the attributes carried by
    /// an entry for the same duration, so this follows the attribute TTL.
    pub fn effective_entry_ttl(&self) -> Duration {
        if self.auto_cache {
            self.entry_timeout
        } else {
            Duration::ZERO
        }
    }

    /// Whether opens should ask the kernel to keep cached pages.
    pub fn keep_cache(&self) -> bool {
        self.kernel_cache || (self.auto_cache && !self.direct_io)
    }
}

/// Default sink output file.
pub const DEFAULT_OUTFILE: &str = "/tmp/iofs.out";

/// Settings for external metric sinks.
///
/// Accepted so existing invocations keep working; no sink consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub outfile: String,
    pub verbosity: u32,
    /// Push interval in seconds.
    pub interval: u64,
    pub es_server: Option<String>,
    pub es_port: Option<u16>,
    pub es_uri: Option<String>,
    pub in_server: Option<String>,
    pub in_db: Option<String>,
    pub in_tags: Vec<String>,
    pub in_username: Option<String>,
    pub in_password: Option<String>,
    pub csv_rw_path: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            outfile: DEFAULT_OUTFILE.to_string(),
            verbosity: 10,
            interval: 1,
            es_server: None,
            es_port: None,
            es_uri: None,
            in_server: None,
            in_db: None,
            in_tags: Vec::new(),
            in_username: None,
            in_password: None,
            csv_rw_path: None,
        }
    }
}

impl SinkConfig {
    /// Names of the sinks that were given any configuration.
    pub fn requested_sinks(&self) -> Vec<&'static str> {
        let mut sinks = Vec::new();
        if self.es_server.is_some() || self.es_port.is_some() || self.es_uri.is_some() {
            sinks.push("elasticsearch");
        }
        if self.in_server.is_some()
            || self.in_db.is_some()
            || !self.in_tags.is_empty()
            || self.in_username.is_some()
            || self.in_password.is_some()
        {
            sinks.push("influxdb");
        }
        if self.csv_rw_path.is_some() {
            sinks.push("csv");
        }
        sinks
    }
}
