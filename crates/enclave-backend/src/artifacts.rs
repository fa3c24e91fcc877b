//! Files-artifact store contract.
//!
//! The store holds content-addressed tar.gz blobs extracted from (or
//! destined for) running services. The core only appends and fetches;
//! everything else about the store's layout belongs to its owner.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content id of a stored files artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactUuid(String);

impl ArtifactUuid {
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactUuid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Append-and-fetch storage for tar.gz blobs.
///
/// `store_file` consumes `reader` to EOF; callers that need streaming run it
/// on a blocking task and feed the reader through a pipe.
pub trait FilesArtifactStore: Send + Sync {
    /// Persist a blob, returning its new content id.
    fn store_file(&self, reader: &mut dyn Read) -> io::Result<ArtifactUuid>;

    /// Open a stored blob for reading.
    fn fetch(&self, uuid: &ArtifactUuid) -> io::Result<Box<dyn Read + Send>>;
}

/// In-memory artifact store for tests.
#[derive(Default)]
pub struct InMemoryFilesArtifactStore {
    blobs: Mutex<BTreeMap<ArtifactUuid, Vec<u8>>>,
}

impl InMemoryFilesArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().expect("artifact store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of a stored blob, if present.
    pub fn blob(&self, uuid: &ArtifactUuid) -> Option<Vec<u8>> {
        self.blobs.lock().expect("artifact store lock").get(uuid).cloned()
    }
}

impl FilesArtifactStore for InMemoryFilesArtifactStore {
    fn store_file(&self, reader: &mut dyn Read) -> io::Result<ArtifactUuid> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let uuid = ArtifactUuid::random();
        self.blobs
            .lock()
            .expect("artifact store lock")
            .insert(uuid.clone(), buf);
        Ok(uuid)
    }

    fn fetch(&self, uuid: &ArtifactUuid) -> io::Result<Box<dyn Read + Send>> {
        let blobs = self.blobs.lock().expect("artifact store lock");
        match blobs.get(uuid) {
            Some(bytes) => Ok(Box::new(io::Cursor::new(bytes.clone()))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no files artifact with uuid '{uuid}'"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_then_fetch_round_trips() {
        let store = InMemoryFilesArtifactStore::new();
        let uuid = store.store_file(&mut io::Cursor::new(b"blob".to_vec())).unwrap();

        let mut fetched = Vec::new();
        store.fetch(&uuid).unwrap().read_to_end(&mut fetched).unwrap();
        assert_eq!(fetched, b"blob");
    }

    #[test]
    fn fetch_unknown_uuid_is_not_found() {
        let store = InMemoryFilesArtifactStore::new();
        let err = match store.fetch(&ArtifactUuid::random()) {
            Err(err) => err,
            Ok(_) => panic!("expected fetch of unknown uuid to fail"),
        };
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
