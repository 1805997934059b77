//! On-disk wiki store.
//!
//! Layout per space root: `page/<name>.gmi`, `keep/<name>/<rev>.gmi`,
//! `file/<name>`, `meta/<name>`, `index`, `changes.log`. Every write goes
//! through temp-file-plus-rename in the target directory, so readers observe
//! either the old or the new content, never a truncated slot.
//!
//! Writers to the same `(space, name)` serialize on a per-resource mutex;
//! change-log appends serialize on a per-space mutex around one `O_APPEND`
//! write of a fully formed line.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::changes::{self, ChangeEntry};
use crate::error::ServerError;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A page read from the primary slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Current gemtext.
    pub text: String,
    /// Current revision number, 1-based.
    pub revision: u32,
}

/// The wiki store rooted at one data directory.
#[derive(Debug)]
pub struct Store {
    wiki_dir: PathBuf,
    page_locks: Mutex<HashMap<(SmolStr, String), Arc<Mutex<()>>>>,
    log_locks: Mutex<HashMap<SmolStr, Arc<Mutex<()>>>>,
}

impl Store {
    #[must_use]
    pub fn new(wiki_dir: impl Into<PathBuf>) -> Self {
        Self {
            wiki_dir: wiki_dir.into(),
            page_locks: Mutex::new(HashMap::new()),
            log_locks: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn wiki_dir(&self) -> &Path {
        &self.wiki_dir
    }

    /// Reject names that cannot live in the store.
    ///
    /// `/` would escape the directory, control characters would corrupt the
    /// change log, and a leading `.` collides with temp files.
    pub fn validate_name(name: &str) -> Result<(), ServerError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.chars().any(char::is_control)
        {
            return Err(ServerError::InvalidName(SmolStr::new(name)));
        }
        Ok(())
    }

    fn space_dir(&self, space: &str) -> PathBuf {
        if space.is_empty() {
            self.wiki_dir.clone()
        } else {
            self.wiki_dir.join(space)
        }
    }

    fn page_path(&self, space: &str, name: &str) -> PathBuf {
        self.space_dir(space).join("page").join(format!("{name}.gmi"))
    }

    fn keep_dir(&self, space: &str, name: &str) -> PathBuf {
        self.space_dir(space).join("keep").join(name)
    }

    fn keep_path(&self, space: &str, name: &str, revision: u32) -> PathBuf {
        self.keep_dir(space, name).join(format!("{revision}.gmi"))
    }

    fn file_path(&self, space: &str, name: &str) -> PathBuf {
        self.space_dir(space).join("file").join(name)
    }

    fn meta_path(&self, space: &str, name: &str) -> PathBuf {
        self.space_dir(space).join("meta").join(name)
    }

    fn index_path(&self, space: &str) -> PathBuf {
        self.space_dir(space).join("index")
    }

    /// Path of a space's change log.
    #[must_use]
    pub fn log_path(&self, space: &str) -> PathBuf {
        self.space_dir(space).join("changes.log")
    }

    // -----------------------------------------------------------------------
    // Pages
    // -----------------------------------------------------------------------

    /// Current text and revision of a page.
    pub fn read_page(&self, space: &str, name: &str) -> Result<Page, ServerError> {
        Self::validate_name(name)?;
        let path = self.page_path(space, name);
        let text = read_text(&path)?.ok_or_else(|| ServerError::NotFound(SmolStr::new(name)))?;
        let revision = self.latest_revision(space, name)?;
        Ok(Page { text, revision })
    }

    /// Text of one historical (or the current) revision.
    pub fn read_page_revision(
        &self,
        space: &str,
        name: &str,
        revision: u32,
    ) -> Result<String, ServerError> {
        Self::validate_name(name)?;
        if let Some(text) = read_text(&self.keep_path(space, name, revision))? {
            return Ok(text);
        }
        // The current revision lives in the primary slot, not under keep/.
        if revision == self.latest_revision(space, name)? {
            if let Some(text) = read_text(&self.page_path(space, name))? {
                return Ok(text);
            }
        }
        Err(ServerError::NotFound(SmolStr::new(format!(
            "{name} revision {revision}"
        ))))
    }

    #[must_use]
    pub fn has_page(&self, space: &str, name: &str) -> bool {
        self.page_path(space, name).is_file()
    }

    /// Revisions of a page, newest first, including the current one.
    pub fn revisions(&self, space: &str, name: &str) -> Result<Vec<u32>, ServerError> {
        Self::validate_name(name)?;
        let mut revs = Vec::new();
        let keep = self.keep_dir(space, name);
        if keep.is_dir() {
            for entry in std::fs::read_dir(&keep)? {
                let entry = entry?;
                if let Some(rev) = entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".gmi"))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    revs.push(rev);
                }
            }
        }
        if self.has_page(space, name) {
            revs.push(self.latest_revision(space, name)?);
        }
        revs.sort_unstable();
        revs.dedup();
        revs.reverse();
        Ok(revs)
    }

    /// Commit a new page revision; empty text deletes the primary slot.
    ///
    /// Returns the committed revision number. Deletion is a revision too,
    /// and revision numbers never reset.
    pub fn write_page(
        &self,
        space: &str,
        name: &str,
        text: &str,
        code: &str,
    ) -> Result<u32, ServerError> {
        Self::validate_name(name)?;
        let lock = self.resource_lock(space, name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.latest_revision(space, name)?;
        let primary = self.page_path(space, name);
        if current >= 1 {
            if let Some(old) = read_text(&primary)? {
                atomic_write(&self.keep_path(space, name, current), old.as_bytes())?;
            }
        }
        if text.is_empty() {
            match std::fs::remove_file(&primary) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        } else {
            atomic_write(&primary, text.as_bytes())?;
        }
        let revision = current + 1;
        debug!(space, name, revision, deleted = text.is_empty(), "page committed");
        self.append_change(
            space,
            &ChangeEntry {
                timestamp: now_timestamp(),
                name: SmolStr::new(name),
                revision,
                code: SmolStr::new(code),
            },
        );
        self.invalidate_index(space);
        Ok(revision)
    }

    /// Highest committed revision of a page, 0 when there has never been one.
    ///
    /// Derived from the keep directory and the primary slot, cross-checked
    /// against the change log so revisions stay monotone across deletions
    /// (and survive a wholesale history purge).
    fn latest_revision(&self, space: &str, name: &str) -> Result<u32, ServerError> {
        let logged = changes::last_page_revision(&self.log_path(space), name)?.unwrap_or(0);
        let mut keep_max = 0;
        let keep = self.keep_dir(space, name);
        if keep.is_dir() {
            for entry in std::fs::read_dir(&keep)? {
                let entry = entry?;
                if let Some(rev) = entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".gmi"))
                    .and_then(|n| n.parse::<u32>().ok())
                {
                    keep_max = keep_max.max(rev);
                }
            }
        }
        let derived = if self.page_path(space, name).is_file() {
            keep_max + 1
        } else {
            keep_max
        };
        Ok(logged.max(derived))
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Overwrite a binary file and its content-type sidecar. No history.
    pub fn write_file(
        &self,
        space: &str,
        name: &str,
        bytes: &[u8],
        mime: &str,
        code: &str,
    ) -> Result<(), ServerError> {
        Self::validate_name(name)?;
        let lock = self.resource_lock(space, name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let file_path = self.file_path(space, name);
        let existed = file_path.is_file();
        atomic_write(&file_path, bytes)?;
        let meta = serde_json::json!({ "content-type": mime });
        if let Err(err) = atomic_write(&self.meta_path(space, name), meta.to_string().as_bytes()) {
            // File and sidecar exist together or not at all.
            if !existed {
                let _ = std::fs::remove_file(&file_path);
            }
            return Err(err);
        }
        debug!(space, name, mime, bytes = bytes.len(), "file committed");
        self.append_change(
            space,
            &ChangeEntry {
                timestamp: now_timestamp(),
                name: SmolStr::new(name),
                revision: 0,
                code: SmolStr::new(code),
            },
        );
        Ok(())
    }

    /// Raw bytes and declared content type of an uploaded file.
    pub fn read_file(&self, space: &str, name: &str) -> Result<(Vec<u8>, String), ServerError> {
        Self::validate_name(name)?;
        let meta_text = read_text(&self.meta_path(space, name))?
            .ok_or_else(|| ServerError::NotFound(SmolStr::new(name)))?;
        let meta: serde_json::Value = serde_json::from_str(&meta_text)
            .map_err(|err| ServerError::Store(SmolStr::new(format!("meta {name}: {err}"))))?;
        let mime = meta
            .get("content-type")
            .and_then(|v| v.as_str())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = std::fs::read(self.file_path(space, name))
            .map_err(|_| ServerError::NotFound(SmolStr::new(name)))?;
        Ok((bytes, mime))
    }

    #[must_use]
    pub fn has_file(&self, space: &str, name: &str) -> bool {
        self.file_path(space, name).is_file() && self.meta_path(space, name).is_file()
    }

    // -----------------------------------------------------------------------
    // Index
    // -----------------------------------------------------------------------

    /// Ordered current page names; served from the `index` cache when fresh.
    ///
    /// A missing index is rebuilt from a directory scan and written back
    /// atomically, so deleting the file forces regeneration.
    pub fn list_pages(&self, space: &str) -> Result<Vec<String>, ServerError> {
        let index = self.index_path(space);
        if let Some(text) = read_text(&index)? {
            return Ok(text.lines().map(str::to_string).collect());
        }
        let mut names = Vec::new();
        let page_dir = self.space_dir(space).join("page");
        if page_dir.is_dir() {
            for entry in std::fs::read_dir(&page_dir)? {
                let entry = entry?;
                if let Some(name) = entry
                    .file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".gmi"))
                {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        let mut body = String::new();
        for name in &names {
            body.push_str(name);
            body.push('\n');
        }
        atomic_write(&index, body.as_bytes())?;
        Ok(names)
    }

    fn invalidate_index(&self, space: &str) {
        match std::fs::remove_file(self.index_path(space)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(space, "index invalidation failed: {err}"),
        }
    }

    // -----------------------------------------------------------------------
    // Change log
    // -----------------------------------------------------------------------

    /// Parsed change-log entries, newest first.
    pub fn read_changes(
        &self,
        space: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChangeEntry>, ServerError> {
        changes::read_backward(&self.log_path(space), limit, offset)
    }

    /// Append one entry under the per-space log mutex.
    ///
    /// A failed append after a committed write leaves the page in place;
    /// history reconstruction is best-effort by design.
    fn append_change(&self, space: &str, entry: &ChangeEntry) {
        let lock = self.log_lock(space);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.log_path(space);
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            file.write_all(entry.to_line().as_bytes())
        })();
        if let Err(err) = result {
            warn!(space, name = %entry.name, "change-log append failed: {err}");
        }
    }

    fn resource_lock(&self, space: &str, name: &str) -> Arc<Mutex<()>> {
        let mut table = self
            .page_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        table
            .entry((SmolStr::new(space), name.to_string()))
            .or_default()
            .clone()
    }

    fn log_lock(&self, space: &str) -> Arc<Mutex<()>> {
        let mut table = self
            .log_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        table.entry(SmolStr::new(space)).or_default().clone()
    }
}

fn now_timestamp() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn read_text(path: &Path) -> Result<Option<String>, ServerError> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ServerError::Store(SmolStr::new(format!(
            "{}: {err}",
            path.display()
        )))),
    }
}

/// Write `bytes` to `path` through a temp file in the same directory.
///
/// Either the old content stays intact or the new content is fully visible.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), ServerError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let temp = parent.join(format!(
        ".phoebe-tmp-{}-{}",
        std::process::id(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed),
    ));
    let result = (|| -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    })();
    if let Err(err) = result {
        let _ = std::fs::remove_file(&temp);
        return Err(err.into());
    }
    if let Err(err) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(err.into());
    }
    Ok(())
}
