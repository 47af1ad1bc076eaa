//! Message-request (MRQ) identifiers and BPMP error codes

use core::fmt;

/// Size of the sparse MRQ id space the dispatch table can address
pub const MAX_MRQ: usize = 128;

/// Message-type identifier carried in the `code` field of a request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mrq(pub i32);

impl Mrq {
    pub const PING: Mrq = Mrq(0);
    pub const QUERY_TAG: Mrq = Mrq(1);
    pub const MODULE_LOAD: Mrq = Mrq(4);
    pub const MODULE_UNLOAD: Mrq = Mrq(5);
    pub const TRACE_MODIFY: Mrq = Mrq(7);
    pub const WRITE_TRACE: Mrq = Mrq(8);
    pub const THREADED_PING: Mrq = Mrq(9);
    pub const MODULE_MAIL: Mrq = Mrq(11);
    pub const DEBUGFS: Mrq = Mrq(19);
    pub const RESET: Mrq = Mrq(20);
    pub const QUERY_ABI: Mrq = Mrq(23);

    pub const fn id(self) -> i32 {
        self.0
    }

    /// Index into the dispatch id space, if addressable
    pub fn table_index(self) -> Option<usize> {
        usize::try_from(self.0).ok().filter(|&idx| idx < MAX_MRQ)
    }
}

impl fmt::Display for Mrq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MRQ {}", self.0)
    }
}

impl From<i32> for Mrq {
    fn from(id: i32) -> Self {
        Mrq(id)
    }
}

/// Positive BPMP error numbers; replies carry them negated
pub mod errno {
    pub const ENOENT: i32 = 2;
    pub const ENOHANDLER: i32 = 3;
    pub const EIO: i32 = 5;
    pub const EBADCMD: i32 = 6;
    pub const EAGAIN: i32 = 11;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const ETIMEDOUT: i32 = 23;
    pub const ERANGE: i32 = 34;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_index() {
        assert_eq!(Mrq::PING.table_index(), Some(0));
        assert_eq!(Mrq::QUERY_ABI.table_index(), Some(23));
        assert_eq!(Mrq(-1).table_index(), None);
        assert_eq!(Mrq(MAX_MRQ as i32).table_index(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Mrq::THREADED_PING.to_string(), "MRQ 9");
    }
}
