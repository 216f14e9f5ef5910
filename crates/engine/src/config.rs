//! Pool configuration
//!
//! [`PoolOptions`] collects everything that is applied while a pool is
//! created or opened. Two environment variables add control queries on top
//! of the programmatic options:
//!
//! - `PMOBJ_CONF`: `key=value;key=value`
//! - `PMOBJ_CONF_FILE`: path of a file with the same syntax; newlines may
//!   separate queries and `#` starts a comment
//!
//! Environment queries run after the programmatic ones, so they win.

use std::fs;
use std::path::Path;

use pmobj_core::limits::{DEFAULT_GRANULARITY, MIN_PART};
use pmobj_core::{Error, Result};
use pmobj_storage::parse_size;

/// Variable holding inline control queries
pub const CONF_ENV: &str = "PMOBJ_CONF";

/// Variable naming a file of control queries
pub const CONF_FILE_ENV: &str = "PMOBJ_CONF_FILE";

const PREFAULT_AT_CREATE: &str = "prefault.at_create";
const PREFAULT_AT_OPEN: &str = "prefault.at_open";

/// Options applied at create and open
///
/// # Example
///
/// ```ignore
/// use pmobj::{Pool, PoolOptions};
///
/// let options = PoolOptions::new()
///     .granularity(16 << 20)
///     .stats_enabled(true)
///     .ctl("heap.alloc_class.128.desc", "2M,0,4,none");
/// let pool = Pool::open_with_options("/mnt/pmem/pool.set", Some("app"), &options)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Automatic growth step in bytes (0 disables automatic growth)
    pub granularity: u64,
    /// Count heap statistics from the start
    pub stats_enabled: bool,
    /// Touch every page after mapping at create
    pub prefault_at_create: bool,
    /// Touch every page after mapping at open
    pub prefault_at_open: bool,
    /// Control queries run once the pool is open, in order
    pub queries: Vec<(String, String)>,
    /// Read `PMOBJ_CONF` and `PMOBJ_CONF_FILE`
    pub use_environment: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            granularity: DEFAULT_GRANULARITY,
            stats_enabled: false,
            prefault_at_create: false,
            prefault_at_open: false,
            queries: Vec::new(),
            use_environment: true,
        }
    }
}

impl PoolOptions {
    /// Defaults: 128 MiB granularity, statistics off, no prefault
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults without the environment, for tests
    pub fn for_testing() -> Self {
        PoolOptions {
            use_environment: false,
            ..Self::default()
        }
    }

    /// Set the growth granularity
    pub fn granularity(mut self, bytes: u64) -> Self {
        self.granularity = bytes;
        self
    }

    /// Turn statistics on or off
    pub fn stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }

    /// Prefault at create
    pub fn prefault_at_create(mut self, enabled: bool) -> Self {
        self.prefault_at_create = enabled;
        self
    }

    /// Prefault at open
    pub fn prefault_at_open(mut self, enabled: bool) -> Self {
        self.prefault_at_open = enabled;
        self
    }

    /// Queue a control query
    pub fn ctl(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.queries.push((key.into(), value.into()));
        self
    }

    /// Skip the environment variables
    pub fn ignore_environment(mut self) -> Self {
        self.use_environment = false;
        self
    }

    /// Check option ranges
    ///
    /// # Errors
    ///
    /// `InvalidGranularity` for a granularity between 0 and the minimum part
    /// size, `InvalidArgument` for an empty query key.
    pub fn validate(&self) -> Result<()> {
        if self.granularity != 0 && self.granularity < MIN_PART {
            return Err(Error::InvalidGranularity {
                value: self.granularity,
                minimum: MIN_PART,
            });
        }
        if let Some((key, _)) = self.queries.iter().find(|(k, _)| k.is_empty()) {
            return Err(Error::InvalidArgument(format!("empty control key {:?}", key)));
        }
        Ok(())
    }

    /// Merge environment queries and fold the mapping-time keys into fields
    ///
    /// `prefault.*` queries only mean something before the pool is mapped,
    /// so they are consumed here; every other query is kept for the ctl pass.
    pub(crate) fn resolve(&self) -> Result<PoolOptions> {
        let mut resolved = self.clone();
        if self.use_environment {
            resolved.queries.extend(environment_queries()?);
        }
        let mut remaining = Vec::with_capacity(resolved.queries.len());
        for (key, value) in std::mem::take(&mut resolved.queries) {
            match key.as_str() {
                PREFAULT_AT_CREATE => resolved.prefault_at_create = parse_bool(&value)?,
                PREFAULT_AT_OPEN => resolved.prefault_at_open = parse_bool(&value)?,
                _ => remaining.push((key, value)),
            }
        }
        resolved.queries = remaining;
        resolved.validate()?;
        Ok(resolved)
    }
}

/// Parse `key=value` queries separated by `;` or newlines
///
/// # Errors
///
/// `InvalidArgument` for a query without `=` or with an empty key.
pub fn parse_queries(text: &str) -> Result<Vec<(String, String)>> {
    let mut queries = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("");
        for query in line.split(';').map(str::trim).filter(|q| !q.is_empty()) {
            let (key, value) = query
                .split_once('=')
                .ok_or_else(|| Error::InvalidArgument(format!("query {:?} has no '='", query)))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(Error::InvalidArgument(format!("query {:?} has no key", query)));
            }
            queries.push((key.to_string(), value.trim().to_string()));
        }
    }
    Ok(queries)
}

/// Queries from `PMOBJ_CONF` and the file named by `PMOBJ_CONF_FILE`
pub fn environment_queries() -> Result<Vec<(String, String)>> {
    let mut queries = Vec::new();
    if let Ok(inline) = std::env::var(CONF_ENV) {
        queries.extend(parse_queries(&inline)?);
    }
    if let Ok(file) = std::env::var(CONF_FILE_ENV) {
        queries.extend(queries_from_file(Path::new(&file))?);
    }
    Ok(queries)
}

/// Queries from a configuration file
pub fn queries_from_file(path: &Path) -> Result<Vec<(String, String)>> {
    parse_queries(&fs::read_to_string(path)?)
}

/// `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`
pub fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::InvalidArgument(format!("{:?} is not a boolean", other))),
    }
}

/// Size with an optional `K/M/G/T` suffix
pub fn parse_bytes(text: &str) -> Result<u64> {
    parse_size(text).ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a size", text)))
}
