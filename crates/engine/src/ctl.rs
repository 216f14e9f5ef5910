//! Runtime control interface
//!
//! Dotted keys address pool tunables and counters:
//!
//! | Key | get | set | exec |
//! |-----|-----|-----|------|
//! | `heap.size.granularity` | bytes | bytes | |
//! | `heap.size.extend` | | | bytes, returns bytes added |
//! | `heap.alloc_class.<id>.desc` | descriptor | descriptor | |
//! | `heap.alloc_class.new.desc` | | descriptor | descriptor, returns id |
//! | `stats.enabled` | bool | bool | |
//! | `stats.heap.curr_allocated` | bytes | | |
//! | `stats.heap.run_allocated` | bytes | | |
//! | `stats.heap.run_active` | bytes | | |
//!
//! A failed call leaves the previous configuration in place.

use std::fmt;

use pmobj_core::{record_error, Error, Result};
use pmobj_heap::AllocClassDesc;
use tracing::debug;

use crate::config::{parse_bool, parse_bytes};
use crate::pool::Pool;

/// Value passed to or returned by a control call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlValue {
    /// Flag
    Bool(bool),
    /// Byte count
    Size(u64),
    /// Allocation class descriptor
    ClassDesc(AllocClassDesc),
    /// Allocation class id
    ClassId(u8),
}

impl CtlValue {
    fn kind(&self) -> &'static str {
        match self {
            CtlValue::Bool(_) => "bool",
            CtlValue::Size(_) => "size",
            CtlValue::ClassDesc(_) => "class descriptor",
            CtlValue::ClassId(_) => "class id",
        }
    }

    /// The byte count, if this is a size
    pub fn as_size(&self) -> Option<u64> {
        match self {
            CtlValue::Size(v) => Some(*v),
            _ => None,
        }
    }

    /// The flag, if this is a bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CtlValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for CtlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CtlValue::Bool(v) => write!(f, "{}", u8::from(*v)),
            CtlValue::Size(v) => write!(f, "{}", v),
            CtlValue::ClassDesc(d) => write!(f, "{}", d),
            CtlValue::ClassId(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stat {
    CurrAllocated,
    RunAllocated,
    RunActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtlKey {
    Granularity,
    Extend,
    ClassDesc(u8),
    NewClassDesc,
    StatsEnabled,
    Stat(Stat),
}

impl CtlKey {
    fn parse(key: &str) -> Result<Self> {
        let segments: Vec<&str> = key.split('.').collect();
        Ok(match segments.as_slice() {
            ["heap", "size", "granularity"] => CtlKey::Granularity,
            ["heap", "size", "extend"] => CtlKey::Extend,
            ["heap", "alloc_class", "new", "desc"] => CtlKey::NewClassDesc,
            ["heap", "alloc_class", id, "desc"] => CtlKey::ClassDesc(id.parse().map_err(|_| {
                Error::InvalidArgument(format!("{:?} is not a class id", id))
            })?),
            ["stats", "enabled"] => CtlKey::StatsEnabled,
            ["stats", "heap", "curr_allocated"] => CtlKey::Stat(Stat::CurrAllocated),
            ["stats", "heap", "run_allocated"] => CtlKey::Stat(Stat::RunAllocated),
            ["stats", "heap", "run_active"] => CtlKey::Stat(Stat::RunActive),
            _ => return Err(Error::UnknownCtlKey(key.to_string())),
        })
    }

    fn parse_value(self, text: &str) -> Result<CtlValue> {
        match self {
            CtlKey::Granularity | CtlKey::Extend => parse_bytes(text).map(CtlValue::Size),
            CtlKey::ClassDesc(_) | CtlKey::NewClassDesc => text.parse().map(CtlValue::ClassDesc),
            CtlKey::StatsEnabled => parse_bool(text).map(CtlValue::Bool),
            CtlKey::Stat(_) => Err(Error::InvalidArgument("statistics are read-only".into())),
        }
    }
}

fn unsupported(key: &str, op: &str) -> Error {
    Error::InvalidArgument(format!("{} does not support {}", key, op))
}

fn wrong_type(key: &str, expected: &str, got: &CtlValue) -> Error {
    Error::InvalidArgument(format!("{} takes a {}, got a {}", key, expected, got.kind()))
}

impl Pool {
    /// Read a control value
    ///
    /// # Errors
    ///
    /// `UnknownCtlKey` for unrecognised keys, `InvalidArgument` for keys
    /// that cannot be read or classes that are not registered.
    pub fn ctl_get(&self, key: &str) -> Result<CtlValue> {
        record_error(self.ctl_get_inner(key))
    }

    fn ctl_get_inner(&self, key: &str) -> Result<CtlValue> {
        let heap = &self.inner.heap;
        match CtlKey::parse(key)? {
            CtlKey::Granularity => Ok(CtlValue::Size(self.inner.extension.granularity())),
            CtlKey::ClassDesc(id) => heap
                .class(id)
                .map(|class| CtlValue::ClassDesc(class.desc))
                .ok_or_else(|| Error::InvalidArgument(format!("allocation class {} is not registered", id))),
            CtlKey::StatsEnabled => Ok(CtlValue::Bool(heap.stats().is_enabled())),
            CtlKey::Stat(stat) => {
                let snapshot = heap.stats_snapshot();
                Ok(CtlValue::Size(match stat {
                    Stat::CurrAllocated => snapshot.curr_allocated,
                    Stat::RunAllocated => snapshot.run_allocated,
                    Stat::RunActive => snapshot.run_active,
                }))
            }
            CtlKey::Extend | CtlKey::NewClassDesc => Err(unsupported(key, "get")),
        }
    }

    /// Write a control value
    ///
    /// # Errors
    ///
    /// `UnknownCtlKey` for unrecognised keys, `InvalidArgument` for values
    /// of the wrong type, `InvalidGranularity` for a granularity below the
    /// minimum part size.
    pub fn ctl_set(&self, key: &str, value: CtlValue) -> Result<()> {
        record_error(self.ctl_set_inner(key, value))
    }

    fn ctl_set_inner(&self, key: &str, value: CtlValue) -> Result<()> {
        let heap = &self.inner.heap;
        match (CtlKey::parse(key)?, value) {
            (CtlKey::Granularity, CtlValue::Size(bytes)) => self.inner.extension.set_granularity(bytes)?,
            (CtlKey::ClassDesc(id), CtlValue::ClassDesc(desc)) => {
                heap.register_class(Some(id), desc)?;
            }
            (CtlKey::NewClassDesc, CtlValue::ClassDesc(desc)) => {
                heap.register_class(None, desc)?;
            }
            (CtlKey::StatsEnabled, CtlValue::Bool(enabled)) => heap.stats().set_enabled(enabled),
            (CtlKey::Granularity, other) => return Err(wrong_type(key, "size", &other)),
            (CtlKey::ClassDesc(_) | CtlKey::NewClassDesc, other) => {
                return Err(wrong_type(key, "class descriptor", &other))
            }
            (CtlKey::StatsEnabled, other) => return Err(wrong_type(key, "bool", &other)),
            (CtlKey::Extend | CtlKey::Stat(_), _) => return Err(unsupported(key, "set")),
        }
        debug!(target: "pmobj::pool", key, "Control value set");
        Ok(())
    }

    /// Run a control action
    ///
    /// # Errors
    ///
    /// As [`ctl_set`](Pool::ctl_set), plus the errors of [`Pool::extend`].
    pub fn ctl_exec(&self, key: &str, arg: CtlValue) -> Result<CtlValue> {
        record_error(self.ctl_exec_inner(key, arg))
    }

    fn ctl_exec_inner(&self, key: &str, arg: CtlValue) -> Result<CtlValue> {
        let inner = &self.inner;
        match (CtlKey::parse(key)?, arg) {
            (CtlKey::Extend, CtlValue::Size(bytes)) => inner
                .extension
                .extend(&inner.mapping, &inner.heap, bytes)
                .map(CtlValue::Size),
            (CtlKey::NewClassDesc, CtlValue::ClassDesc(desc)) => inner
                .heap
                .register_class(None, desc)
                .map(|class| CtlValue::ClassId(class.id)),
            (CtlKey::Extend, other) => Err(wrong_type(key, "size", &other)),
            (CtlKey::NewClassDesc, other) => Err(wrong_type(key, "class descriptor", &other)),
            _ => Err(unsupported(key, "exec")),
        }
    }

    /// [`ctl_set`](Pool::ctl_set) with the value parsed from text
    pub fn ctl_set_str(&self, key: &str, value: &str) -> Result<()> {
        record_error(CtlKey::parse(key).and_then(|k| k.parse_value(value)))
            .and_then(|value| self.ctl_set(key, value))
    }

    /// [`ctl_exec`](Pool::ctl_exec) with the argument parsed from text
    pub fn ctl_exec_str(&self, key: &str, arg: &str) -> Result<CtlValue> {
        record_error(CtlKey::parse(key).and_then(|k| k.parse_value(arg)))
            .and_then(|arg| self.ctl_exec(key, arg))
    }

    /// Apply a configuration query: exec for action keys, set otherwise
    pub(crate) fn apply_query(&self, key: &str, value: &str) -> Result<()> {
        match CtlKey::parse(key)? {
            CtlKey::Extend => self.ctl_exec_str(key, value).map(|_| ()),
            _ => self.ctl_set_str(key, value),
        }
    }
}
