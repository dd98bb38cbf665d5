use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::Error;
use crate::Result;

/// Key prefix implicitly applied by a broker or watcher
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Namespace {
    prefix: Bytes,
}

impl Namespace {
    pub(crate) fn new(prefix: &[u8]) -> Self {
        Self {
            prefix: Bytes::copy_from_slice(prefix),
        }
    }

    pub(crate) fn as_bytes(&self) -> &Bytes {
        &self.prefix
    }

    /// Store key of a single caller key; empty keys are rejected
    pub(crate) fn key(
        &self,
        key: &[u8],
    ) -> Result<Bytes> {
        if key.is_empty() {
            return Err(Error::MalformedKey("key must not be empty".into()));
        }
        Ok(self.join(key))
    }

    /// Store prefix of a caller prefix; the empty prefix selects the whole namespace
    pub(crate) fn prefix(
        &self,
        prefix: &[u8],
    ) -> Bytes {
        self.join(prefix)
    }

    /// Caller key of a store key, `None` when it lies outside the namespace
    pub(crate) fn strip(
        &self,
        key: &Bytes,
    ) -> Option<Bytes> {
        key.starts_with(&self.prefix)
            .then(|| key.slice(self.prefix.len()..))
    }

    fn join(
        &self,
        suffix: &[u8],
    ) -> Bytes {
        if self.prefix.is_empty() {
            return Bytes::copy_from_slice(suffix);
        }
        let mut buf = BytesMut::with_capacity(self.prefix.len() + suffix.len());
        buf.put_slice(&self.prefix);
        buf.put_slice(suffix);
        buf.freeze()
    }
}
