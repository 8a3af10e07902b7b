//! Serialization of single filesystem nodes into tar entries.
//!
//! The encoder knows nothing about recursion: it is handed one [`FilesystemNode`]
//! and the name the node should have on the remote side, and appends exactly one
//! entry (header plus body) to the underlying sink.

use std::io::{Read, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use tracing::instrument;

use crate::error::Error;

/// Size of a tar record, extraction tools read the archive in units of this size.
pub const RECORD_SIZE: u64 = 10240;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    /// Anything tar has no entry type for (e.g. sockets).
    Other,
}

impl NodeKind {
    fn from_file_type(file_type: std::fs::FileType) -> Self {
        if file_type.is_symlink() {
            NodeKind::Symlink
        } else if file_type.is_dir() {
            NodeKind::Directory
        } else if file_type.is_file() {
            NodeKind::File
        } else if file_type.is_fifo() {
            NodeKind::Fifo
        } else if file_type.is_char_device() {
            NodeKind::CharDevice
        } else if file_type.is_block_device() {
            NodeKind::BlockDevice
        } else {
            NodeKind::Other
        }
    }

    fn entry_type(self) -> tar::EntryType {
        match self {
            NodeKind::File | NodeKind::Other => tar::EntryType::Regular,
            NodeKind::Directory => tar::EntryType::Directory,
            NodeKind::Symlink => tar::EntryType::Symlink,
            NodeKind::Fifo => tar::EntryType::Fifo,
            NodeKind::CharDevice => tar::EntryType::Char,
            NodeKind::BlockDevice => tar::EntryType::Block,
        }
    }
}

/// Snapshot of one filesystem object, taken without following symlinks.
#[derive(Debug, Clone)]
pub struct FilesystemNode {
    pub path: std::path::PathBuf,
    pub kind: NodeKind,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
    pub mtime: u64,
    pub size: u64,
    pub link_target: Option<std::path::PathBuf>,
    pub device: Option<(u64, u64)>,
}

impl FilesystemNode {
    #[instrument]
    pub fn lstat(path: &std::path::Path) -> Result<Self, Error> {
        let metadata = std::fs::symlink_metadata(path).map_err(|source| Error::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        let kind = NodeKind::from_file_type(metadata.file_type());
        let link_target = if kind == NodeKind::Symlink {
            Some(std::fs::read_link(path).map_err(|source| Error::LinkRead {
                path: path.to_path_buf(),
                source,
            })?)
        } else {
            None
        };
        let device = match kind {
            NodeKind::CharDevice | NodeKind::BlockDevice => {
                let rdev = metadata.rdev();
                Some((
                    nix::sys::stat::major(rdev),
                    nix::sys::stat::minor(rdev),
                ))
            }
            _ => None,
        };
        Ok(Self {
            path: path.to_path_buf(),
            kind,
            mode: metadata.mode() & 0o7777,
            uid: u64::from(metadata.uid()),
            gid: u64::from(metadata.gid()),
            // pre-epoch timestamps can't be represented in a ustar header
            mtime: u64::try_from(metadata.mtime()).unwrap_or(0),
            size: if kind == NodeKind::File {
                metadata.len()
            } else {
                0
            },
            link_target,
            device,
        })
    }

    fn header(&self) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(self.kind.entry_type());
        header.set_mode(self.mode);
        header.set_uid(self.uid);
        header.set_gid(self.gid);
        header.set_mtime(self.mtime);
        header.set_size(self.size);
        // values too large for the header fields are left zeroed
        if let Some((major, minor)) = self.device
            && let (Ok(major), Ok(minor)) = (u32::try_from(major), u32::try_from(minor))
        {
            let _ = header.set_device_major(major);
            let _ = header.set_device_minor(minor);
        }
        header
    }
}

/// Reader that remembers how many bytes went through it.
struct Counted<R> {
    inner: R,
    count: u64,
}

impl<R: Read> Read for Counted<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

/// Writer that remembers how many bytes went through it.
///
/// Once abandoned it refuses all writes, so a dropped builder cannot append an
/// end-of-archive marker to a partial archive.
struct CountingSink<W> {
    inner: W,
    written: u64,
    abandoned: bool,
}

impl<W: Write> Write for CountingSink<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.abandoned {
            return Err(std::io::Error::other("archive abandoned"));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct ArchiveEntryEncoder<W: Write> {
    builder: tar::Builder<CountingSink<W>>,
}

impl<W: Write> ArchiveEntryEncoder<W> {
    pub fn new(sink: W) -> Self {
        let mut builder = tar::Builder::new(CountingSink {
            inner: sink,
            written: 0,
            abandoned: false,
        });
        builder.follow_symlinks(false);
        Self { builder }
    }

    /// Appends one entry for `node` named `name`.
    ///
    /// Returns the number of content bytes written (non-zero only for regular files).
    #[instrument(skip(self, node), fields(path = ?node.path, kind = ?node.kind))]
    pub fn encode(&mut self, node: &FilesystemNode, name: &std::path::Path) -> Result<u64, Error> {
        let mut header = node.header();
        let context = || format!("failed archiving {:?} as {:?}", &node.path, name);
        match node.kind {
            NodeKind::Symlink => {
                let target = node.link_target.as_deref().unwrap_or(std::path::Path::new(""));
                tracing::debug!("symlink -> {:?}", target);
                self.builder
                    .append_link(&mut header, name, target)
                    .map_err(|err| Error::io(context(), err))?;
                Ok(0)
            }
            NodeKind::File => {
                let file = std::fs::File::open(&node.path).map_err(|err| {
                    Error::io(format!("cannot open {:?} for reading", &node.path), err)
                })?;
                let mut content = Counted {
                    inner: file.take(node.size),
                    count: 0,
                };
                self.builder
                    .append_data(&mut header, name, &mut content)
                    .map_err(|err| Error::io(context(), err))?;
                if content.count != node.size {
                    return Err(Error::io(
                        context(),
                        std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!(
                                "file shrank while reading: expected {} bytes, got {}",
                                node.size, content.count
                            ),
                        ),
                    ));
                }
                tracing::debug!("archived {} bytes", content.count);
                Ok(content.count)
            }
            _ => {
                self.builder
                    .append_data(&mut header, name, std::io::empty())
                    .map_err(|err| Error::io(context(), err))?;
                Ok(0)
            }
        }
    }

    /// Stops writing to the sink for good.
    ///
    /// Called when the archive cannot be completed; the sink is left holding a
    /// truncated archive without an end-of-archive marker.
    pub fn abandon(&mut self) {
        self.builder.get_mut().abandoned = true;
    }

    /// Writes the end-of-archive marker, pads to a full record and returns the sink.
    pub fn finish(self) -> Result<W, Error> {
        let mut sink = self
            .builder
            .into_inner()
            .map_err(|err| Error::io("failed writing end of archive", err))?;
        let padding = (RECORD_SIZE - sink.written % RECORD_SIZE) % RECORD_SIZE;
        std::io::copy(&mut std::io::repeat(0).take(padding), &mut sink)
            .map_err(|err| Error::io("failed padding end of archive", err))?;
        sink.flush()
            .map_err(|err| Error::io("failed flushing archive", err))?;
        Ok(sink.inner)
    }
}
