//! Raw message archive: read-only access to the bytes the receiving edge
//! stored at `{prefix}/{message_id}`.

pub mod fs;
pub mod memory;

use async_trait::async_trait;

use crate::error::ArchiveError;

pub use fs::FsArchive;
pub use memory::MemoryArchive;

/// Object storage holding raw inbound messages.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Read the whole object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, ArchiveError>;
}

/// Object key of a message: `{prefix}/{message_id}` without duplicated slashes.
pub fn object_key(prefix: &str, message_id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let message_id = message_id.trim_start_matches('/');
    if prefix.is_empty() {
        message_id.to_string()
    } else {
        format!("{prefix}/{message_id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_joins_once() {
        assert_eq!(object_key("inbound", "abc"), "inbound/abc");
        assert_eq!(object_key("inbound/", "abc"), "inbound/abc");
        assert_eq!(object_key("/mail/inbound/", "/abc"), "mail/inbound/abc");
        assert_eq!(object_key("", "abc"), "abc");
        assert_eq!(object_key("/", "abc"), "abc");
    }
}
