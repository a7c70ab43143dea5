//! # Archive: filtered directory snapshots as tar streams
//!
//! Export turns a mounted container filesystem into a POSIX ustar byte
//! stream. The stream is lazy: nothing touches the filesystem until it is
//! polled, and file contents are read in chunks as the consumer pulls.
//! Calling [`diff`] again starts a fresh walk from the beginning; a stream
//! cannot be resumed mid-way.
//!
//! ## Filtering
//!
//! A [`FilterSpec`] decides which entries appear. Paths are matched relative
//! to the export root, without a leading slash, by plain string prefix:
//!
//! - the longest matching exclusion is compared with the longest matching
//!   inclusion, and the entry is dropped only when the exclusion is longer;
//! - the empty prefix `""` matches every path;
//! - `strip_path` is removed from the front of the archived name and
//!   `rebase_path` prepended.
//!
//! Excluded directories are still descended into, so an inclusion can pull
//! a child back into an otherwise excluded tree.
//!
//! ## Example
//!
//! ```rust,ignore
//! let mut spec = FilterSpec::default();
//! spec.exclude("");
//! spec.include("etc/");
//! let mut stream = archive::diff(&op, "/mnt/abc", &spec, true)?;
//! while let Some(chunk) = stream.try_next().await? {
//!     out.write_all(&chunk).await?;
//! }
//! ```

pub mod ustar;

use std::{
    collections::{BTreeSet, VecDeque},
    fs,
    io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    pin::Pin,
};

use bytes::Bytes;
use futures::{stream, Stream};
use tokio::io::{AsyncRead, AsyncReadExt};

use self::ustar::{EntryType, Header};
use crate::operation::Operation;

/// Lazily produced archive bytes.
pub type ArchiveStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Archive bytes supplied to an import.
pub type ArchiveReader = Pin<Box<dyn AsyncRead + Send>>;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    pub rebase_path: String,
    pub strip_path: String,
    pub exclusions: BTreeSet<String>,
    pub inclusions: BTreeSet<String>,
}

impl FilterSpec {
    pub fn exclude(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.exclusions.insert(prefix.into());
        self
    }

    pub fn include(&mut self, prefix: impl Into<String>) -> &mut Self {
        self.inclusions.insert(prefix.into());
        self
    }

    /// Whether `path`, relative to the export root, is filtered out.
    pub fn excluded(&self, path: &str) -> bool {
        let longest = |set: &BTreeSet<String>| {
            set.iter()
                .filter(|prefix| path.starts_with(prefix.as_str()))
                .map(|prefix| prefix.len() as isize)
                .max()
                .unwrap_or(-1)
        };
        longest(&self.exclusions) > longest(&self.inclusions)
    }

    /// Archive name for `path`, or `None` when stripping leaves nothing.
    pub fn archive_name(&self, path: &str) -> Option<String> {
        let mut name = path;
        if !self.strip_path.is_empty() {
            let strip = self.strip_path.trim_end_matches('/');
            if let Some(rest) = name.strip_prefix(strip) {
                if rest.is_empty() {
                    return None;
                }
                if let Some(rest) = rest.strip_prefix('/') {
                    name = rest;
                }
            }
        }
        let rebase = self.rebase_path.trim_matches('/');
        if rebase.is_empty() {
            Some(name.to_string())
        } else {
            Some(format!("{rebase}/{name}"))
        }
    }
}

#[derive(Debug)]
struct Entry {
    abs: PathBuf,
    header: Header,
}

/// Produce a tar stream of the tree under `root`, filtered by `spec`.
///
/// With `data == false` only headers are written; regular files are
/// recorded with size zero.
pub fn diff(
    op: &Operation,
    root: impl Into<PathBuf>,
    spec: &FilterSpec,
    data: bool,
) -> io::Result<ArchiveStream> {
    let root = root.into();
    tracing::debug!(
        "archive: diff root={} data={} op={}",
        root.display(),
        data,
        op.id()
    );
    let state = DiffState {
        root,
        spec: spec.clone(),
        data,
        op: op.clone(),
        entries: None,
        body: None,
        trailer_sent: false,
        finished: false,
    };
    Ok(Box::pin(stream::unfold(state, |mut state| async move {
        state.next_chunk().await.map(|chunk| (chunk, state))
    })))
}

struct Body {
    file: tokio::fs::File,
    remaining: u64,
    padding: usize,
}

struct DiffState {
    root: PathBuf,
    spec: FilterSpec,
    data: bool,
    op: Operation,
    entries: Option<VecDeque<Entry>>,
    body: Option<Body>,
    trailer_sent: bool,
    finished: bool,
}

impl DiffState {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.finished {
            return None;
        }
        let res = self.advance().await;
        match res {
            Ok(Some(bytes)) => Some(Ok(bytes)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }

    async fn advance(&mut self) -> io::Result<Option<Bytes>> {
        if self.op.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("operation {} cancelled", self.op.id()),
            ));
        }

        if self.entries.is_none() {
            let root = self.root.clone();
            let spec = self.spec.clone();
            let data = self.data;
            let entries = tokio::task::spawn_blocking(move || walk(&root, &spec, data))
                .await
                .map_err(io::Error::other)??;
            self.entries = Some(entries);
        }

        if let Some(body) = self.body.as_mut() {
            if body.remaining > 0 {
                let want = body.remaining.min(READ_CHUNK as u64) as usize;
                let mut buf = vec![0u8; want];
                let n = body.file.read(&mut buf).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "file shrank while being archived",
                    ));
                }
                buf.truncate(n);
                body.remaining -= n as u64;
                if body.remaining == 0 {
                    buf.resize(n + body.padding, 0);
                    self.body = None;
                }
                return Ok(Some(Bytes::from(buf)));
            }
            self.body = None;
        }

        let Some(entries) = self.entries.as_mut() else {
            return Ok(None);
        };
        match entries.pop_front() {
            Some(entry) => {
                let block = entry.header.encode();
                if entry.header.entry_type == EntryType::Regular && entry.header.size > 0 {
                    let file = tokio::fs::File::open(&entry.abs).await?;
                    self.body = Some(Body {
                        file,
                        remaining: entry.header.size,
                        padding: ustar::padding(entry.header.size),
                    });
                }
                Ok(Some(Bytes::from(block)))
            }
            None if !self.trailer_sent => {
                self.trailer_sent = true;
                Ok(Some(Bytes::copy_from_slice(&ustar::trailer())))
            }
            None => Ok(None),
        }
    }
}

/// Depth-first, name-sorted walk of `root` collecting the entries to archive.
fn walk(root: &Path, spec: &FilterSpec, data: bool) -> io::Result<VecDeque<Entry>> {
    let mut out = VecDeque::new();
    walk_dir(root, "", spec, data, &mut out)?;
    Ok(out)
}

fn walk_dir(
    dir: &Path,
    rel_dir: &str,
    spec: &FilterSpec,
    data: bool,
    out: &mut VecDeque<Entry>,
) -> io::Result<()> {
    let mut children: Vec<_> = fs::read_dir(dir)?
        .map(|res| res.map(|e| e.file_name()))
        .collect::<io::Result<_>>()?;
    children.sort();

    for child in children {
        let abs = dir.join(&child);
        let Some(name) = child.to_str() else {
            tracing::warn!("archive: skipping non UTF-8 name {}", abs.display());
            continue;
        };
        let rel = if rel_dir.is_empty() {
            name.to_string()
        } else {
            format!("{rel_dir}/{name}")
        };
        let meta = fs::symlink_metadata(&abs)?;
        let file_type = meta.file_type();

        let entry_type = if file_type.is_dir() {
            EntryType::Directory
        } else if file_type.is_symlink() {
            EntryType::Symlink
        } else if file_type.is_file() {
            EntryType::Regular
        } else {
            tracing::debug!("archive: skipping special file {}", abs.display());
            continue;
        };

        let archive_name = if spec.excluded(&rel) {
            None
        } else {
            spec.archive_name(&rel)
        };

        if let Some(archive_name) = archive_name {
            let link_name = if entry_type == EntryType::Symlink {
                match fs::read_link(&abs)?.into_os_string().into_string() {
                    Ok(target) => target,
                    Err(_) => {
                        tracing::warn!(
                            "archive: skipping symlink with non UTF-8 target {}",
                            abs.display()
                        );
                        continue;
                    }
                }
            } else {
                String::new()
            };
            let size = if entry_type == EntryType::Regular && data {
                meta.len()
            } else {
                0
            };
            out.push_back(Entry {
                abs: abs.clone(),
                header: Header {
                    name: archive_name,
                    entry_type,
                    mode: meta.mode(),
                    uid: u64::from(meta.uid()),
                    gid: u64::from(meta.gid()),
                    size,
                    mtime: meta.mtime().max(0) as u64,
                    link_name,
                },
            });
        }

        // Excluded directories are still walked for included children.
        if entry_type == EntryType::Directory {
            walk_dir(&abs, &rel, spec, data, out)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    #[test]
    fn test_excluded_longest_prefix_wins() {
        let mut spec = FilterSpec::default();
        spec.exclude("").include("etc/").exclude("etc/shadow");

        assert!(spec.excluded("bin/sh"));
        assert!(spec.excluded("etc"));
        assert!(!spec.excluded("etc/passwd"));
        assert!(spec.excluded("etc/shadow"));
    }

    #[test]
    fn test_inclusion_wins_ties() {
        let mut spec = FilterSpec::default();
        spec.exclude("tmp").include("tmp");
        assert!(!spec.excluded("tmp/x"));
    }

    #[test]
    fn test_empty_spec_keeps_everything() {
        let spec = FilterSpec::default();
        assert!(!spec.excluded("anything"));
        assert_eq!(spec.archive_name("a/b").as_deref(), Some("a/b"));
    }

    #[test]
    fn test_strip_and_rebase() {
        let spec = FilterSpec {
            rebase_path: "/rootfs/".into(),
            strip_path: "var/lib/".into(),
            ..Default::default()
        };
        assert_eq!(spec.archive_name("var/lib").as_deref(), None);
        assert_eq!(
            spec.archive_name("var/lib/data/x").as_deref(),
            Some("rootfs/data/x")
        );
        assert_eq!(spec.archive_name("etc/x").as_deref(), Some("rootfs/etc/x"));
    }

    #[tokio::test]
    async fn test_large_sparse_file_streams() {
        let dir = tempdir().unwrap();
        let file = fs::File::create(dir.path().join("db.bin")).unwrap();
        file.set_len(9 << 30).unwrap();
        let op = Operation::new("test");

        let mut stream = diff(&op, dir.path(), &FilterSpec::default(), true).unwrap();
        let header = stream.try_next().await.unwrap().unwrap();
        assert_eq!(header.len(), ustar::BLOCK_SIZE);
        assert_eq!(&header[..7], b"db.bin\0");
        assert_eq!(header[124], 0x80);
        let size = header[128..136]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        assert_eq!(size, 9 << 30);

        let body = stream.try_next().await.unwrap().unwrap();
        assert_eq!(body.len(), READ_CHUNK);
        assert!(body.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_non_utf8_names_are_skipped() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("ok"), "x").unwrap();
        fs::write(dir.path().join(OsStr::from_bytes(b"bad\xff")), "y").unwrap();
        let op = Operation::new("test");

        let chunks: Vec<Bytes> = diff(&op, dir.path(), &FilterSpec::default(), true)
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let bytes = chunks.concat();
        // one header, one content block, the trailer
        assert_eq!(bytes.len(), 4 * ustar::BLOCK_SIZE);
        assert_eq!(&bytes[..3], b"ok\0");
    }
}
