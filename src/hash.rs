//! Content-hash cache used to tell a touched file from a changed file.
//!
//! The cache persists as `BUILD.md5s` under the build root, one
//! `<path> <hash>` pair per line.  While a build runs, an entry checked
//! against disk gains a one-character annotation: '@' means the content
//! changed since the persisted value, '*' means it did not.  Annotations are
//! stripped on persistence.

use anyhow::Context;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

pub const CHANGED: char = '@';
pub const UNCHANGED: char = '*';

pub struct HashCache {
    entries: Mutex<BTreeMap<String, String>>,
}

impl HashCache {
    /// Load the persisted cache; a missing file yields an empty cache.
    pub fn load(path: &Path) -> HashCache {
        let mut entries = BTreeMap::new();
        if let Ok(text) = std::fs::read_to_string(path) {
            for line in text.lines() {
                let mut parts = line.split_whitespace();
                if let (Some(file), Some(hash), None) =
                    (parts.next(), parts.next(), parts.next())
                {
                    entries.insert(file.to_string(), hash.to_string());
                }
            }
        }
        HashCache {
            entries: Mutex::new(entries),
        }
    }

    fn compute(file: &str) -> anyhow::Result<String> {
        let bytes = std::fs::read(file).with_context(|| format!("hash {}", file))?;
        Ok(format!("{:x}", md5::compute(bytes)))
    }

    /// Hash `file` and report whether its content changed since the last
    /// persisted run.  The returned string starts with '@' or '*'; the check
    /// is performed at most once per run per file.
    pub fn check(&self, file: &str) -> anyhow::Result<String> {
        let old = {
            let entries = self.entries.lock().unwrap();
            match entries.get(file) {
                Some(old) if old.starts_with(CHANGED) || old.starts_with(UNCHANGED) => {
                    return Ok(old.clone());
                }
                Some(old) => Some(old.clone()),
                None => None,
            }
        };
        let new = Self::compute(file)?;
        let mut entries = self.entries.lock().unwrap();
        // Another worker may have finished the same check meanwhile.
        if let Some(done) = entries.get(file) {
            if done.starts_with(CHANGED) || done.starts_with(UNCHANGED) {
                return Ok(done.clone());
            }
        }
        let annotated = match old {
            Some(old) if old == new => format!("{}{}", UNCHANGED, new),
            _ => format!("{}{}", CHANGED, new),
        };
        entries.insert(file.to_string(), annotated.clone());
        Ok(annotated)
    }

    /// Ensure `file` has an entry, hashing it only when absent.  Used after
    /// a build to seed the cache for the next run.
    pub fn record(&self, file: &str) -> anyhow::Result<()> {
        {
            let entries = self.entries.lock().unwrap();
            if entries.contains_key(file) {
                return Ok(());
            }
        }
        let new = Self::compute(file)?;
        self.entries
            .lock()
            .unwrap()
            .entry(file.to_string())
            .or_insert_with(|| format!("{}{}", CHANGED, new));
        Ok(())
    }

    /// Write the cache back out, annotations stripped, sorted by path.
    pub fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let entries = self.entries.lock().unwrap();
        let mut out = String::new();
        for (file, hash) in entries.iter() {
            let hash = hash
                .strip_prefix(CHANGED)
                .or_else(|| hash.strip_prefix(UNCHANGED))
                .unwrap_or(hash);
            out.push_str(file);
            out.push(' ');
            out.push_str(hash);
            out.push('\n');
        }
        std::fs::write(path, out).with_context(|| format!("write {}", path.display()))
    }
}
