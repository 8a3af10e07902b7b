use std::io::Write;

use tracing::instrument;

use crate::archive::{ArchiveEntryEncoder, FilesystemNode, NodeKind};
use crate::error::Error;

const GLOB_META: &[char] = &['*', '?', '[', '{', '\\'];

/// Lexically normalizes a path: drops `.` components, resolves `..` against
/// preceding normal components and collapses repeated separators.
#[must_use]
pub fn clean_path(path: &std::path::Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut parts: Vec<Component> = vec![];
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir) => {}
                _ => parts.push(component),
            },
            _ => parts.push(component),
        }
    }
    if parts.is_empty() {
        return std::path::PathBuf::from(".");
    }
    parts.iter().collect()
}

fn has_glob_meta(pattern: &std::ffi::OsStr) -> bool {
    pattern
        .to_str()
        .is_some_and(|pattern| pattern.contains(GLOB_META))
}

/// Source and destination of one transfer, split into a base directory and
/// the final path segment the way the archive is rooted.
///
/// The source's final segment may be a shell-style wildcard pattern. The
/// destination base is the directory the remote side extracts into; entry
/// names are relative to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRoots {
    pub source_base: std::path::PathBuf,
    pub source_pattern: std::ffi::OsString,
    pub dest_base: std::path::PathBuf,
    /// Empty when wildcard matches land directly inside `dest_base`.
    pub dest_pattern: std::path::PathBuf,
}

impl ArchiveRoots {
    /// Builds the roots for copying `source` to `destination`.
    ///
    /// A destination with a trailing slash (or ending in `.`) means "copy into":
    /// the source keeps its own name inside that directory.
    pub fn new(source: &std::path::Path, destination: &str) -> Result<Self, Error> {
        let invalid = |path: &str, reason: &str| Error::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let source_display = source.to_string_lossy();
        if source.as_os_str().is_empty() {
            return Err(invalid(&source_display, "source path is empty"));
        }
        let mut source = clean_path(source);
        if source.file_name().is_none() {
            // `.`, `..` and the like stand for the directory they resolve to
            source = std::fs::canonicalize(&source).map_err(|err| Error::Stat {
                path: source.clone(),
                source: err,
            })?;
        }
        let source_pattern = source
            .file_name()
            .ok_or_else(|| invalid(&source_display, "source must name a file or directory"))?
            .to_os_string();
        let source_base = source
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| std::path::PathBuf::from("."), std::path::Path::to_path_buf);
        if destination.is_empty() {
            return Err(invalid(destination, "destination path is empty"));
        }
        let wildcard = has_glob_meta(&source_pattern);
        let copy_into =
            destination.ends_with('/') || destination == "." || destination.ends_with("/.");
        let cleaned = clean_path(std::path::Path::new(destination));
        let (dest_base, dest_pattern) = if copy_into {
            let pattern = if wildcard {
                std::path::PathBuf::new()
            } else {
                std::path::PathBuf::from(&source_pattern)
            };
            (cleaned, pattern)
        } else {
            let name = cleaned
                .file_name()
                .ok_or_else(|| invalid(destination, "destination must name a file or directory"))?;
            let base = cleaned
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map_or_else(|| std::path::PathBuf::from("."), std::path::Path::to_path_buf);
            (base, std::path::PathBuf::from(name))
        };
        Ok(Self {
            source_base,
            source_pattern,
            dest_base,
            dest_pattern,
        })
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        has_glob_meta(&self.source_pattern)
    }

    /// Resolves the source pattern against the source base.
    ///
    /// A literal pattern matches itself if it exists. A wildcard pattern is
    /// matched against the base directory's entries, results are sorted by name.
    /// No match is not an error.
    #[instrument]
    pub fn matches(&self) -> Result<Vec<std::path::PathBuf>, Error> {
        let candidate = self.source_base.join(&self.source_pattern);
        if !self.is_wildcard() {
            return Ok(match std::fs::symlink_metadata(&candidate) {
                Ok(_) => vec![candidate],
                Err(_) => vec![],
            });
        }
        let pattern = self.source_pattern.to_string_lossy();
        let matcher = globset::GlobBuilder::new(&pattern)
            .literal_separator(true)
            .backslash_escape(true)
            .build()
            .map_err(|source| Error::Glob {
                pattern: pattern.to_string(),
                source,
            })?
            .compile_matcher();
        let entries = match std::fs::read_dir(&self.source_base) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(source) => {
                return Err(Error::ReadDir {
                    path: self.source_base.clone(),
                    source,
                });
            }
        };
        let mut names = vec![];
        for entry in entries {
            let entry = entry.map_err(|source| Error::ReadDir {
                path: self.source_base.clone(),
                source,
            })?;
            let name = entry.file_name();
            if matcher.is_match(&name) {
                names.push(name);
            }
        }
        names.sort();
        tracing::debug!("pattern {:?} matched {} entries", &pattern, names.len());
        Ok(names
            .into_iter()
            .map(|name| self.source_base.join(name))
            .collect())
    }

    fn destination_name(&self, matched: &std::path::Path) -> std::path::PathBuf {
        if !self.is_wildcard() {
            return self.dest_pattern.clone();
        }
        // matches always come from joining the base with a directory entry name
        match matched.file_name() {
            Some(name) => self.dest_pattern.join(name),
            None => self.dest_pattern.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_archived: u64,
    pub files_archived: usize,
    pub symlinks_archived: usize,
    pub empty_directories_archived: usize,
    pub special_files_archived: usize,
}

impl Summary {
    #[must_use]
    pub fn entries(&self) -> usize {
        self.files_archived
            + self.symlinks_archived
            + self.empty_directories_archived
            + self.special_files_archived
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes archived: {}\n\
            files archived: {}\n\
            symlinks archived: {}\n\
            empty directories archived: {}\n\
            special files archived: {}\n",
            bytesize::ByteSize(self.bytes_archived),
            self.files_archived,
            self.symlinks_archived,
            self.empty_directories_archived,
            self.special_files_archived,
        )
    }
}

struct TreeWalker<'a, W: Write> {
    encoder: &'a mut ArchiveEntryEncoder<W>,
    summary: Summary,
}

impl<W: Write> TreeWalker<'_, W> {
    #[instrument(skip(self))]
    fn visit(&mut self, path: &std::path::Path, name: &std::path::Path) -> Result<(), Error> {
        let node = FilesystemNode::lstat(path)?;
        match node.kind {
            NodeKind::Directory => {
                let mut children = vec![];
                for entry in std::fs::read_dir(path).map_err(|source| Error::ReadDir {
                    path: path.to_path_buf(),
                    source,
                })? {
                    let entry = entry.map_err(|source| Error::ReadDir {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    children.push(entry.file_name());
                }
                if children.is_empty() {
                    tracing::debug!("empty directory");
                    self.encoder.encode(&node, name)?;
                    self.summary.empty_directories_archived += 1;
                    return Ok(());
                }
                children.sort();
                for child in children {
                    self.visit(&path.join(&child), &name.join(&child))?;
                }
                Ok(())
            }
            NodeKind::Symlink => {
                self.encoder.encode(&node, name)?;
                self.summary.symlinks_archived += 1;
                Ok(())
            }
            NodeKind::File => {
                let bytes = self.encoder.encode(&node, name)?;
                self.summary.files_archived += 1;
                self.summary.bytes_archived += bytes;
                Ok(())
            }
            NodeKind::Fifo | NodeKind::CharDevice | NodeKind::BlockDevice | NodeKind::Other => {
                self.encoder.encode(&node, name)?;
                self.summary.special_files_archived += 1;
                Ok(())
            }
        }
    }
}

/// Walks everything `roots` selects and appends one entry per node to `encoder`.
///
/// Directories with children produce no entry of their own, an empty directory
/// produces exactly one. Traversal is depth-first and sequential.
#[instrument(skip(encoder))]
pub fn walk<W: Write>(
    roots: &ArchiveRoots,
    encoder: &mut ArchiveEntryEncoder<W>,
) -> Result<Summary, Error> {
    let mut walker = TreeWalker {
        encoder,
        summary: Summary::default(),
    };
    let walked = roots.matches().and_then(|matches| {
        matches.iter().try_for_each(|matched| {
            let name = roots.destination_name(matched);
            walker.visit(matched, &name)
        })
    });
    if let Err(error) = walked {
        walker.encoder.abandon();
        return Err(error);
    }
    tracing::debug!("walk done: {} entries", walker.summary.entries());
    Ok(walker.summary)
}

/// Writes a complete archive of `roots` into `sink`.
#[cfg(test)]
fn write_archive<W: Write>(roots: &ArchiveRoots, sink: W) -> Result<(Summary, W), Error> {
    let mut encoder = ArchiveEntryEncoder::new(sink);
    let summary = walk(roots, &mut encoder)?;
    let sink = encoder.finish()?;
    Ok((summary, sink))
}
