//! Persistent object identifier

use std::fmt;

/// Identifier of an object inside a pool
///
/// `off` is the offset of the object's user data from the pool base, so an
/// identifier stays valid across restarts and remaps. `pool_uuid_lo` ties
/// the identifier to one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId {
    /// Low 64 bits of the owning pool's UUID
    pub pool_uuid_lo: u64,
    /// Offset of the object's data from the pool base
    pub off: u64,
}

impl ObjectId {
    /// The absent object
    pub const NULL: ObjectId = ObjectId {
        pool_uuid_lo: 0,
        off: 0,
    };

    /// Create an identifier for `off` in pool `pool_uuid_lo`
    pub const fn new(pool_uuid_lo: u64, off: u64) -> Self {
        ObjectId { pool_uuid_lo, off }
    }

    /// True for [`ObjectId::NULL`]
    pub const fn is_null(&self) -> bool {
        self.off == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}:{:#x}", self.pool_uuid_lo, self.off)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null() {
        assert!(ObjectId::NULL.is_null());
        assert!(ObjectId::default().is_null());
        assert!(!ObjectId::new(1, 4096).is_null());
    }

    #[test]
    fn test_display() {
        let id = ObjectId::new(0xab, 0x1000);
        assert_eq!(id.to_string(), "00000000000000ab:0x1000");
    }
}
