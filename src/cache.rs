//! Content-addressable parse cache.
//!
//! Entries are keyed by the sha-256 digest of the source file's bytes:
//! `<cache_dir>/<hash>/<hash>.json` holds the structured parse output and
//! sibling `page-NNNN.<ext>` files hold derived page renders. Entries are
//! created-if-absent and never mutated; identical bytes always resolve to the
//! same entry, so re-ingesting a file never re-parses it.
//!
//! A per-hash async mutex gives at-most-one-writer-per-hash: when two files
//! with the same content are processed concurrently, one parses and writes,
//! the other finds the finished entry. Entry writes go through a temp file
//! and rename, so a crash mid-parse never leaves a corrupt entry behind.
//!
//! A `hash_index.json` at the cache root maps source paths to hashes for
//! observability; correctness never depends on it.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::IngestError;
use crate::models::{ParsedDocument, ParsedPage};
use crate::parser::{ConvertOptions, ConvertedDocument, ParserAdapter};

const ENTRY_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CacheEntryFile {
    version: u32,
    parsed_document: ParsedDocument,
}

#[derive(Serialize, Deserialize, Default)]
struct HashIndex(HashMap<String, HashIndexEntry>);

#[derive(Serialize, Deserialize)]
struct HashIndexEntry {
    hash: String,
    updated_at: i64,
}

pub struct ContentCache {
    root: PathBuf,
    /// Per-hash parse locks (singleflight).
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    index_lock: Mutex<()>,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            index_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Streaming sha-256 over the file's bytes, hex encoded.
    pub fn file_hash(path: &Path) -> Result<String, IngestError> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| IngestError::Parse(format!("cannot open {}: {}", path.display(), e)))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = file
                .read(&mut buf)
                .map_err(|e| IngestError::Parse(format!("cannot read {}: {}", path.display(), e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    fn entry_path(&self, hash: &str) -> PathBuf {
        self.entry_dir(hash).join(format!("{}.json", hash))
    }

    /// Return the parsed form of `path`, parsing at most once per content
    /// hash. Cache hits never invoke the adapter. The adapter runs on a
    /// blocking thread under `timeout`; a timeout or panic surfaces as a
    /// parse failure for this file only.
    pub async fn lookup_or_parse(
        &self,
        path: &Path,
        adapter: &ParserAdapter,
        options: &ConvertOptions,
        timeout: Duration,
    ) -> Result<ParsedDocument, IngestError> {
        let hash = Self::file_hash(path)?;

        let hash_lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry(hash.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = hash_lock.lock().await;

        let json_path = self.entry_path(&hash);
        if json_path.exists() {
            match self.load_entry(&json_path) {
                Some(parsed) => return Ok(parsed),
                None => warn!(entry = %json_path.display(), "corrupt cache entry, re-parsing"),
            }
        }

        let converted = {
            let adapter = adapter.clone();
            let options = options.clone();
            let path = path.to_path_buf();
            let task =
                tokio::task::spawn_blocking(move || adapter.parse(&path, &options));
            match tokio::time::timeout(timeout, task).await {
                Err(_) => {
                    return Err(IngestError::Parse(format!(
                        "parse timed out after {}s",
                        timeout.as_secs()
                    )))
                }
                Ok(Err(join_err)) => {
                    return Err(IngestError::Parse(format!("parse task failed: {}", join_err)))
                }
                Ok(Ok(result)) => result?,
            }
        };

        let parsed = self.materialize(path, &hash, converted)?;
        self.write_entry_atomic(&json_path, &parsed)?;
        self.update_hash_index(path, &hash).await;
        Ok(parsed)
    }

    /// Build the durable [`ParsedDocument`] from raw converter output:
    /// write page renders under the entry directory and stamp provenance
    /// metadata onto the document and each page.
    fn materialize(
        &self,
        source: &Path,
        hash: &str,
        converted: ConvertedDocument,
    ) -> Result<ParsedDocument, IngestError> {
        let entry_dir = self.entry_dir(hash);
        std::fs::create_dir_all(&entry_dir).map_err(|e| {
            IngestError::Parse(format!("cannot create cache dir {}: {}", entry_dir.display(), e))
        })?;

        let mut pages = Vec::with_capacity(converted.pages.len());
        for page in converted.pages {
            let mut metadata = page.metadata;
            metadata.insert(
                "page_number".to_string(),
                serde_json::Value::from(page.number),
            );
            metadata.insert(
                "content_hash".to_string(),
                serde_json::Value::String(hash.to_string()),
            );

            let render = match page.image {
                Some(image) => {
                    let target =
                        entry_dir.join(format!("page-{:04}.{}", page.number, image.extension));
                    std::fs::write(&target, &image.bytes).map_err(|e| {
                        IngestError::Parse(format!(
                            "cannot write render {}: {}",
                            target.display(),
                            e
                        ))
                    })?;
                    metadata.insert(
                        "render_path".to_string(),
                        serde_json::Value::String(target.display().to_string()),
                    );
                    Some(target)
                }
                None => None,
            };

            pages.push(ParsedPage {
                number: page.number,
                text: page.text,
                metadata,
                render,
            });
        }

        let mut metadata = converted.metadata;
        metadata.insert(
            "content_hash".to_string(),
            serde_json::Value::String(hash.to_string()),
        );
        metadata.insert(
            "cache_entry".to_string(),
            serde_json::Value::String(self.entry_path(hash).display().to_string()),
        );
        metadata.insert(
            "render_dir".to_string(),
            serde_json::Value::String(entry_dir.display().to_string()),
        );
        metadata.insert(
            "source_path".to_string(),
            serde_json::Value::String(source.display().to_string()),
        );
        metadata.insert("page_count".to_string(), serde_json::Value::from(pages.len()));

        let title = converted
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| {
                source
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| source.display().to_string())
            });

        Ok(ParsedDocument {
            title,
            pages,
            metadata,
        })
    }

    fn load_entry(&self, json_path: &Path) -> Option<ParsedDocument> {
        let raw = std::fs::read_to_string(json_path).ok()?;
        let entry: CacheEntryFile = serde_json::from_str(&raw).ok()?;
        if entry.version != ENTRY_VERSION {
            return None;
        }
        Some(entry.parsed_document)
    }

    fn write_entry_atomic(
        &self,
        json_path: &Path,
        parsed: &ParsedDocument,
    ) -> Result<(), IngestError> {
        let dir = json_path.parent().expect("entry path has a parent");
        let entry = CacheEntryFile {
            version: ENTRY_VERSION,
            parsed_document: parsed.clone(),
        };
        let body = serde_json::to_vec(&entry)
            .map_err(|e| IngestError::Parse(format!("cannot encode cache entry: {}", e)))?;

        let tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| IngestError::Parse(format!("cannot create temp entry: {}", e)))?;
        std::fs::write(tmp.path(), &body)
            .map_err(|e| IngestError::Parse(format!("cannot write cache entry: {}", e)))?;
        tmp.persist(json_path)
            .map_err(|e| IngestError::Parse(format!("cannot persist cache entry: {}", e)))?;
        Ok(())
    }

    /// Record source-path → hash in `hash_index.json`. Best effort: failures
    /// are logged and never affect the parse result.
    async fn update_hash_index(&self, source: &Path, hash: &str) {
        let _guard = self.index_lock.lock().await;
        let index_path = self.root.join("hash_index.json");
        let mut index: HashIndex = std::fs::read_to_string(&index_path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        index.0.insert(
            source.display().to_string(),
            HashIndexEntry {
                hash: hash.to_string(),
                updated_at: chrono::Utc::now().timestamp(),
            },
        );
        let write = serde_json::to_vec_pretty(&index)
            .map_err(|e| e.to_string())
            .and_then(|body| std::fs::write(&index_path, body).map_err(|e| e.to_string()));
        if let Err(e) = write {
            warn!(index = %index_path.display(), error = %e, "failed to update hash index");
        }
    }

    /// Filesystem path of the cached render for one page, if any.
    pub fn page_render(&self, hash: &str, page_number: i64) -> Option<PathBuf> {
        let dir = self.entry_dir(hash);
        let prefix = format!("page-{:04}.", page_number);
        let entries = std::fs::read_dir(&dir).ok()?;
        let mut matches: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(&prefix))
                        .unwrap_or(false)
            })
            .collect();
        matches.sort();
        matches.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{ConvertedPage, DocumentConverter, PageImage};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConverter {
        calls: AtomicUsize,
        with_image: bool,
        fail: bool,
    }

    impl CountingConverter {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                with_image: false,
                fail: false,
            }
        }
    }

    impl DocumentConverter for CountingConverter {
        fn name(&self) -> &str {
            "counting"
        }

        fn convert(
            &self,
            path: &Path,
            _options: &ConvertOptions,
        ) -> Result<ConvertedDocument, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IngestError::Parse("converter rejected input".into()));
            }
            let text = std::fs::read_to_string(path).unwrap_or_default();
            let image = self.with_image.then(|| PageImage {
                bytes: vec![0x89, 0x50, 0x4e, 0x47],
                extension: "png".to_string(),
            });
            Ok(ConvertedDocument {
                title: None,
                pages: vec![ConvertedPage {
                    number: 1,
                    text,
                    metadata: serde_json::Map::new(),
                    image,
                }],
                metadata: serde_json::Map::new(),
            })
        }
    }

    fn options() -> ConvertOptions {
        ConvertOptions {
            do_ocr: false,
            extract_tables: true,
            generate_page_images: true,
            image_scale: 2.0,
            accelerator: "auto".to_string(),
            num_threads: 0,
        }
    }

    fn timeout() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_second_lookup_skips_parser() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "stable content").unwrap();

        let converter = Arc::new(CountingConverter::new());
        let adapter = ParserAdapter::Structured(converter.clone() as Arc<dyn DocumentConverter>);
        let cache = ContentCache::new(tmp.path().join("cache"));

        let first = cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();
        let second = cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();

        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.pages[0].text, second.pages[0].text);
        assert_eq!(first.metadata, second.metadata);
    }

    #[tokio::test]
    async fn test_failed_parse_leaves_no_entry() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "broken").unwrap();

        let converter = Arc::new(CountingConverter {
            calls: AtomicUsize::new(0),
            with_image: false,
            fail: true,
        });
        let adapter = ParserAdapter::Structured(converter as Arc<dyn DocumentConverter>);
        let cache = ContentCache::new(tmp.path().join("cache"));

        let err = cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Parse(_)));

        let hash = ContentCache::file_hash(&source).unwrap();
        assert!(!cache.entry_path(&hash).exists());
    }

    #[tokio::test]
    async fn test_corrupt_entry_falls_back_to_reparse() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "salvageable").unwrap();

        let converter = Arc::new(CountingConverter::new());
        let adapter = ParserAdapter::Structured(converter.clone() as Arc<dyn DocumentConverter>);
        let cache = ContentCache::new(tmp.path().join("cache"));

        cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();

        // Scribble over the entry
        let hash = ContentCache::file_hash(&source).unwrap();
        std::fs::write(cache.entry_path(&hash), "{ not json").unwrap();

        let parsed = cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();
        assert_eq!(parsed.pages[0].text, "salvageable");
        assert_eq!(converter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_parse_once() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "shared bytes").unwrap();

        let converter = Arc::new(CountingConverter::new());
        let adapter = ParserAdapter::Structured(converter.clone() as Arc<dyn DocumentConverter>);
        let cache = Arc::new(ContentCache::new(tmp.path().join("cache")));

        let opts = options();
        let (a, b) = tokio::join!(
            cache.lookup_or_parse(&source, &adapter, &opts, timeout()),
            cache.lookup_or_parse(&source, &adapter, &opts, timeout()),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_renders_materialized_and_served() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "with image").unwrap();

        let converter = Arc::new(CountingConverter {
            calls: AtomicUsize::new(0),
            with_image: true,
            fail: false,
        });
        let adapter = ParserAdapter::Structured(converter as Arc<dyn DocumentConverter>);
        let cache = ContentCache::new(tmp.path().join("cache"));

        let parsed = cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();
        assert!(parsed.pages[0].render.is_some());

        let hash = ContentCache::file_hash(&source).unwrap();
        let render = cache.page_render(&hash, 1).expect("render exists");
        assert_eq!(std::fs::read(render).unwrap(), vec![0x89, 0x50, 0x4e, 0x47]);
        assert!(cache.page_render(&hash, 2).is_none());
    }

    #[tokio::test]
    async fn test_hash_index_recorded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("doc.pdf");
        std::fs::write(&source, "indexed").unwrap();

        let converter = Arc::new(CountingConverter::new());
        let adapter = ParserAdapter::Structured(converter as Arc<dyn DocumentConverter>);
        let cache = ContentCache::new(tmp.path().join("cache"));

        cache
            .lookup_or_parse(&source, &adapter, &options(), timeout())
            .await
            .unwrap();

        let raw = std::fs::read_to_string(tmp.path().join("cache").join("hash_index.json")).unwrap();
        let hash = ContentCache::file_hash(&source).unwrap();
        assert!(raw.contains(&hash));
    }
}
