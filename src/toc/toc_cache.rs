use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};

use crate::toc::toc::{Toc, TocEntry, TocKind};
use crate::util::buf_ext::{BufExt, BufMutExt};


/// Persistent storage for downloaded TOCs, keyed by CRC
#[cfg_attr(test, automock)]
pub trait TocCacheStore: Send + Sync + 'static {
    fn lookup(&self, crc: u32) -> anyhow::Result<Option<Toc>>;
    fn store(&self, toc: &Toc) -> anyhow::Result<()>;
}

/// A store that never remembers anything, for sessions without a cache directory
pub struct NoTocStore;
impl TocCacheStore for NoTocStore {
    fn lookup(&self, _crc: u32) -> anyhow::Result<Option<Toc>> {
        Ok(None)
    }

    fn store(&self, _toc: &Toc) -> anyhow::Result<()> {
        Ok(())
    }
}


const FILE_FORMAT_VERSION: u8 = 1;
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Stores each TOC in a file of its own, named `<kind>_<CRC>.toc`.
///
/// ```ascii
/// 0: format version (u8)
/// 1: crc of the TOC (u32 LE)
/// 5: number of entries (u16 LE)
/// *: entries - id (u16 LE), type byte (u8), group (string), name (string)
/// *: CRC-32 of everything before it (u32 LE)
/// ```
pub struct FileTocStore {
    kind: TocKind,
    dir: PathBuf,
}
impl FileTocStore {
    pub fn new(kind: TocKind, dir: impl Into<PathBuf>) -> FileTocStore {
        FileTocStore {
            kind,
            dir: dir.into(),
        }
    }

    pub fn file_path(&self, crc: u32) -> PathBuf {
        self.dir.join(format!("{}_{:08X}.toc", self.kind.name(), crc))
    }

    fn serialize(toc: &Toc) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u8(FILE_FORMAT_VERSION);
        buf.put_u32_le(toc.crc());
        buf.put_u16_le(toc.len() as u16);
        for entry in toc.entries() {
            buf.put_u16_le(entry.id);
            buf.put_u8(entry.type_byte);
            buf.put_string(&entry.group);
            buf.put_string(&entry.name);
        }

        let checksum = CRC32.checksum(&buf);
        buf.put_u32_le(checksum);
        buf
    }

    fn deserialize(&self, path: &Path, raw: &[u8]) -> anyhow::Result<Toc> {
        if raw.len() < 4 {
            bail!("{:?} is truncated", path);
        }
        let (content, mut trailer) = raw.split_at(raw.len() - 4);
        if trailer.get_u32_le() != CRC32.checksum(content) {
            bail!("checksum mismatch in {:?}", path);
        }

        let mut buf = content;
        let version = buf.try_read_u8()?;
        if version != FILE_FORMAT_VERSION {
            bail!("unsupported format version {} in {:?}", version, path);
        }
        let crc = buf.try_read_u32_le()?;
        let num_entries = buf.try_read_u16_le()?;

        let mut entries = Vec::with_capacity(num_entries as usize);
        for _ in 0..num_entries {
            let id = buf.try_read_u16_le()?;
            let type_byte = buf.try_read_u8()?;
            let group = buf.try_read_string()?;
            let name = buf.try_read_string()?;
            entries.push(TocEntry::new(self.kind, id, type_byte, group, name)?);
        }
        if buf.has_remaining() {
            bail!("trailing data in {:?}", path);
        }

        Ok(Toc::new(self.kind, crc, entries))
    }
}

impl TocCacheStore for FileTocStore {
    fn lookup(&self, crc: u32) -> anyhow::Result<Option<Toc>> {
        let path = self.file_path(crc);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(anyhow!("error reading {:?}: {}", path, e)),
        };

        let toc = self.deserialize(&path, &raw)?;
        if toc.crc() != crc {
            bail!("{:?} contains a TOC with crc {:08X}", path, toc.crc());
        }
        Ok(Some(toc))
    }

    fn store(&self, toc: &Toc) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.file_path(toc.crc());
        fs::write(&path, Self::serialize(toc))?;
        debug!(?path, "stored TOC");
        Ok(())
    }
}


/// Downloaded TOCs by CRC: an in-memory map in front of a (possibly persistent) store.
///  Problems with the store are logged and treated as cache misses. Store access runs on
///  tokio's blocking pool.
pub struct TocCache {
    memory: Mutex<FxHashMap<u32, Arc<Toc>>>,
    store: Arc<dyn TocCacheStore>,
}
impl TocCache {
    pub fn new(store: Box<dyn TocCacheStore>) -> TocCache {
        TocCache {
            memory: Default::default(),
            store: store.into(),
        }
    }

    pub fn in_memory() -> TocCache {
        TocCache::new(Box::new(NoTocStore))
    }

    pub async fn lookup(&self, crc: u32) -> Option<Arc<Toc>> {
        let cached = self.memory.lock().get(&crc).cloned();
        if cached.is_some() {
            return cached;
        }

        let store = self.store.clone();
        match spawn_blocking(move || store.lookup(crc)).await {
            Ok(Ok(Some(toc))) => {
                let toc = Arc::new(toc);
                self.memory.lock().insert(crc, toc.clone());
                Some(toc)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                warn!("ignoring cached TOC {:08X}: {}", crc, e);
                None
            }
            Err(e) => {
                warn!("looking up TOC {:08X} failed: {}", crc, e);
                None
            }
        }
    }

    pub async fn insert(&self, toc: Arc<Toc>) {
        let crc = toc.crc();
        self.memory.lock().insert(crc, toc.clone());

        let store = self.store.clone();
        match spawn_blocking(move || store.store(&toc)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("error storing TOC {:08X}: {}", crc, e),
            Err(e) => warn!("storing TOC {:08X} failed: {}", crc, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toc() -> Toc {
        Toc::new(TocKind::Param, 0xAABBCCDD, vec![
            TocEntry::new(TocKind::Param, 0, 0x08, "pid".into(), "rate".into()).unwrap(),
            TocEntry::new(TocKind::Param, 1, 0x46, "sys".into(), "id".into()).unwrap(),
            TocEntry::new(TocKind::Param, 2, 0x0b, "\u{e9}t\u{e9}".into(), "x".into()).unwrap(),
        ])
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("crazylink-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = temp_dir();
        let store = FileTocStore::new(TocKind::Param, &dir);
        store.store(&sample_toc()).unwrap();

        assert!(dir.join("param_AABBCCDD.toc").exists());
        assert_eq!(store.lookup(0xAABBCCDD).unwrap(), Some(sample_toc()));
        assert_eq!(store.lookup(0x12345678).unwrap(), None);

        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_file() {
        let dir = temp_dir();
        let store = FileTocStore::new(TocKind::Param, &dir);
        store.store(&sample_toc()).unwrap();

        let path = store.file_path(0xAABBCCDD);
        let mut raw = fs::read(&path).unwrap();
        raw[8] ^= 0x01;
        fs::write(&path, raw).unwrap();

        assert!(store.lookup(0xAABBCCDD).is_err());

        let cache = TocCache::new(Box::new(store));
        assert!(cache.lookup(0xAABBCCDD).await.is_none());

        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_file_store_rejects_truncated_file() {
        let dir = temp_dir();
        let store = FileTocStore::new(TocKind::Log, &dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(store.file_path(1), [1, 2]).unwrap();

        assert!(store.lookup(1).is_err());
        fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn test_cache_consults_store_once() {
        let mut store = MockTocCacheStore::new();
        store.expect_lookup()
            .times(1)
            .returning(|_| Ok(Some(sample_toc())));
        let cache = TocCache::new(Box::new(store));

        assert_eq!(cache.lookup(0xAABBCCDD).await.map(|t| t.len()), Some(3));
        assert_eq!(cache.lookup(0xAABBCCDD).await.map(|t| t.len()), Some(3));
    }

    #[tokio::test]
    async fn test_cache_insert_writes_through() {
        let mut store = MockTocCacheStore::new();
        store.expect_store()
            .withf(|toc| toc.crc() == 0xAABBCCDD)
            .times(1)
            .returning(|_| Err(anyhow!("disk full")));
        store.expect_lookup().never();
        let cache = TocCache::new(Box::new(store));

        cache.insert(Arc::new(sample_toc())).await;
        assert!(cache.lookup(0xAABBCCDD).await.is_some());
    }
}
