//! Per-file manifests of layers.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::io::AsyncRead;
use tokio_stream::StreamExt;
use tokio_tar::{Archive, EntryType};
use tracing::{instrument, trace, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::Error;

/// Prefix of the name of a whiteout marker. `dir/.wh.foo` in a layer means
/// `dir/foo` was deleted by it.
const WHITEOUT_PREFIX: &str = ".wh.";

/// The kind of a file, with the single character codes used in manifests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    #[serde(rename = "f")]
    Regular,
    #[serde(rename = "l")]
    Link,
    #[serde(rename = "s")]
    Symlink,
    #[serde(rename = "c")]
    CharDevice,
    #[serde(rename = "b")]
    BlockDevice,
    #[serde(rename = "d")]
    Directory,
    #[serde(rename = "i")]
    Fifo,
    #[serde(rename = "t")]
    Contiguous,
    #[serde(rename = "L")]
    LongName,
    #[serde(rename = "K")]
    LongLink,
    #[serde(rename = "S")]
    Sparse,
    #[serde(rename = "u")]
    Unknown,
}

impl FileKind {
    /// Maps the type of a tar entry. Returns None for pax extension headers,
    /// which don't describe files.
    fn from_entry_type(entry_type: EntryType) -> Option<Self> {
        Some(match entry_type {
            EntryType::Regular => FileKind::Regular,
            EntryType::Link => FileKind::Link,
            EntryType::Symlink => FileKind::Symlink,
            EntryType::Char => FileKind::CharDevice,
            EntryType::Block => FileKind::BlockDevice,
            EntryType::Directory => FileKind::Directory,
            EntryType::Fifo => FileKind::Fifo,
            EntryType::Continuous => FileKind::Contiguous,
            EntryType::GNULongName => FileKind::LongName,
            EntryType::GNULongLink => FileKind::LongLink,
            EntryType::GNUSparse => FileKind::Sparse,
            EntryType::XHeader | EntryType::XGlobalHeader => return None,
            _ => FileKind::Unknown,
        })
    }
}

/// Everything known about a file in a layer, except for its path.
///
/// Serialized as `[kind, deleted, size, mtime, mode, uid, gid]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    /// Set if the layer carried a whiteout marker for the path.
    pub deleted: bool,
    pub size: u64,
    /// Seconds since the epoch.
    pub mtime: u64,
    pub mode: u32,
    pub uid: u64,
    pub gid: u64,
}

type FileInfoTuple = (FileKind, bool, u64, u64, u32, u64, u64);

impl Serialize for FileInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        (
            self.kind,
            self.deleted,
            self.size,
            self.mtime,
            self.mode,
            self.uid,
            self.gid,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileInfo {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (kind, deleted, size, mtime, mode, uid, gid) = FileInfoTuple::deserialize(deserializer)?;
        Ok(FileInfo {
            kind,
            deleted,
            size,
            mtime,
            mode,
            uid,
            gid,
        })
    }
}

/// A file in a layer.
///
/// Serialized as `[path, kind, deleted, size, mtime, mode, uid, gid]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute, normalized path. Never carries the whiteout prefix.
    pub path: String,
    pub info: FileInfo,
}

impl Serialize for FileRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let info = &self.info;
        (
            &self.path,
            info.kind,
            info.deleted,
            info.size,
            info.mtime,
            info.mode,
            info.uid,
            info.gid,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (path, kind, deleted, size, mtime, mode, uid, gid) =
            <(String, FileKind, bool, u64, u64, u32, u64, u64)>::deserialize(deserializer)?;
        Ok(FileRecord {
            path,
            info: FileInfo {
                kind,
                deleted,
                size,
                mtime,
                mode,
                uid,
                gid,
            },
        })
    }
}

/// The files of a single layer, in archive order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest(Vec<FileRecord>);

impl Manifest {
    pub fn records(&self) -> &[FileRecord] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the files by path. If a path occurs more than once, the later
    /// record wins.
    pub fn to_map(&self) -> HashMap<&str, &FileInfo> {
        self.0
            .iter()
            .map(|record| (record.path.as_str(), &record.info))
            .collect()
    }

    /// Like [Self::to_map], consuming the manifest.
    pub fn into_map(self) -> HashMap<String, FileInfo> {
        self.0
            .into_iter()
            .map(|record| (record.path, record.info))
            .collect()
    }
}

impl From<Vec<FileRecord>> for Manifest {
    fn from(records: Vec<FileRecord>) -> Self {
        Self(records)
    }
}

/// Turns a name from a tar header into an absolute path.
///
/// `.` and `./` become `/`, `./x` and `x` become `/x`. Trailing slashes of
/// directory names are dropped.
pub fn normalize_name(name: &str) -> String {
    let name = name.trim_end_matches('/');
    let name = name.strip_prefix("./").unwrap_or(name);

    if name.is_empty() || name == "." {
        "/".to_string()
    } else if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

/// Resolves a whiteout marker in the last component of a normalized path.
///
/// Returns the path and whether it was deleted, or None if the entry is
/// union filesystem metadata (a marker of a marker, like `.wh..wh..opq`)
/// that is not part of the manifest.
pub fn resolve_whiteout(path: String) -> Option<(String, bool)> {
    let split = path.rfind('/').map_or(0, |i| i + 1);
    let (parent, base) = path.split_at(split);

    match base.strip_prefix(WHITEOUT_PREFIX) {
        None => Some((path, false)),
        Some(stripped) if stripped.starts_with(WHITEOUT_PREFIX) => None,
        Some(stripped) => Some((format!("{}{}", parent, stripped), true)),
    }
}

/// Reads all entries of the given tar archive into a [Manifest].
#[instrument(skip_all, fields(indicatif.pb_show=1), err)]
pub async fn build_manifest<R>(mut archive: Archive<R>) -> Result<Manifest, Error>
where
    R: AsyncRead + Unpin,
{
    let span = Span::current();
    span.pb_set_style(&strata_tracing::PB_SPINNER_STYLE);
    span.pb_set_message("Reading layer entries");
    span.pb_start();

    let mut records = Vec::new();

    let mut entries = archive.entries().map_err(Error::Decode)?;
    while let Some(entry) = entries.try_next().await.map_err(Error::Decode)? {
        span.pb_inc(1);

        let header = entry.header();
        let Some(kind) = FileKind::from_entry_type(header.entry_type()) else {
            continue;
        };

        let name = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let Some((path, deleted)) = resolve_whiteout(normalize_name(&name)) else {
            trace!(name = %name, "skipping whiteout metadata");
            continue;
        };

        records.push(FileRecord {
            path,
            info: FileInfo {
                kind,
                deleted,
                size: header.size().map_err(Error::Decode)?,
                mtime: header.mtime().map_err(Error::Decode)?,
                mode: header.mode().map_err(Error::Decode)?,
                uid: header.uid().map_err(Error::Decode)?,
                gid: header.gid().map_err(Error::Decode)?,
            },
        });
    }

    Ok(Manifest(records))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tokio_tar::{Archive, EntryType};

    use super::{build_manifest, normalize_name, resolve_whiteout, FileInfo, FileKind, FileRecord};
    use crate::fixtures::{tar, TarEntry};
    use crate::Manifest;

    #[rstest]
    #[case::dot(".", "/")]
    #[case::dot_slash("./", "/")]
    #[case::root("/", "/")]
    #[case::dot_relative("./a/b", "/a/b")]
    #[case::relative("etc/passwd", "/etc/passwd")]
    #[case::absolute("/etc/passwd", "/etc/passwd")]
    #[case::directory("./usr/lib/", "/usr/lib")]
    #[case::empty("", "/")]
    fn normalize(#[case] name: &str, #[case] expected: &str) {
        assert_eq!(expected, normalize_name(name));
    }

    #[rstest]
    #[case::plain("/a/b", Some(("/a/b", false)))]
    #[case::root_whiteout("/.wh.a", Some(("/a", true)))]
    #[case::nested_whiteout("/usr/lib/.wh.libfoo.so", Some(("/usr/lib/libfoo.so", true)))]
    #[case::opaque_marker("/.wh..wh..opq", None)]
    #[case::nested_opaque_marker("/var/.wh..wh..opq", None)]
    #[case::whiteout_in_dir_name("/.wh.dir/file", Some(("/.wh.dir/file", false)))]
    #[case::contains_prefix("/a.wh.b", Some(("/a.wh.b", false)))]
    fn whiteouts(#[case] path: &str, #[case] expected: Option<(&str, bool)>) {
        assert_eq!(
            expected.map(|(p, d)| (p.to_string(), d)),
            resolve_whiteout(path.to_string())
        );
    }

    async fn manifest_of(entries: &[TarEntry]) -> Manifest {
        let archive = Archive::new(Cursor::new(tar(entries)));
        build_manifest(archive).await.expect("must build manifest")
    }

    #[tokio::test]
    async fn records() {
        let manifest = manifest_of(&[
            TarEntry::dir("./"),
            TarEntry::dir("./etc/"),
            TarEntry::file("./etc/hostname", b"strata\n"),
            TarEntry::file("./.wh.tmp", b""),
            TarEntry::file("./etc/.wh..wh..opq", b""),
        ])
        .await;

        assert_eq!(
            vec![
                FileRecord {
                    path: "/".into(),
                    info: FileInfo {
                        kind: FileKind::Directory,
                        deleted: false,
                        size: 0,
                        mtime: 1_400_000_000,
                        mode: 0o755,
                        uid: 1000,
                        gid: 100,
                    },
                },
                FileRecord {
                    path: "/etc".into(),
                    info: FileInfo {
                        kind: FileKind::Directory,
                        deleted: false,
                        size: 0,
                        mtime: 1_400_000_000,
                        mode: 0o755,
                        uid: 1000,
                        gid: 100,
                    },
                },
                FileRecord {
                    path: "/etc/hostname".into(),
                    info: FileInfo {
                        kind: FileKind::Regular,
                        deleted: false,
                        size: 7,
                        mtime: 1_400_000_000,
                        mode: 0o644,
                        uid: 1000,
                        gid: 100,
                    },
                },
                FileRecord {
                    path: "/tmp".into(),
                    info: FileInfo {
                        kind: FileKind::Regular,
                        deleted: true,
                        size: 0,
                        mtime: 1_400_000_000,
                        mode: 0o644,
                        uid: 1000,
                        gid: 100,
                    },
                },
            ],
            manifest.records()
        );
    }

    #[rstest]
    #[case::regular(EntryType::Regular, FileKind::Regular)]
    #[case::link(EntryType::Link, FileKind::Link)]
    #[case::symlink(EntryType::Symlink, FileKind::Symlink)]
    #[case::char(EntryType::Char, FileKind::CharDevice)]
    #[case::block(EntryType::Block, FileKind::BlockDevice)]
    #[case::directory(EntryType::Directory, FileKind::Directory)]
    #[case::fifo(EntryType::Fifo, FileKind::Fifo)]
    #[case::continuous(EntryType::Continuous, FileKind::Contiguous)]
    #[case::other(EntryType::new(b'Z'), FileKind::Unknown)]
    #[tokio::test]
    async fn kinds(#[case] entry_type: EntryType, #[case] expected: FileKind) {
        let manifest = manifest_of(&[TarEntry::of_type("./x", entry_type)]).await;

        assert_eq!(1, manifest.len());
        assert_eq!(expected, manifest.records()[0].info.kind);
    }

    /// Global pax headers carry no file.
    #[tokio::test]
    async fn skips_pax_headers() {
        let manifest = manifest_of(&[
            TarEntry {
                data: b"17 comment=hello\n",
                ..TarEntry::of_type("pax_global_header", EntryType::XGlobalHeader)
            },
            TarEntry::file("./a", b"a"),
        ])
        .await;

        assert_eq!(
            vec!["/a"],
            manifest
                .records()
                .iter()
                .map(|r| r.path.as_str())
                .collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn later_duplicate_wins() {
        let manifest = manifest_of(&[
            TarEntry::file("./a", b"first"),
            TarEntry::file("./a", b"second!"),
        ])
        .await;

        assert_eq!(2, manifest.len());
        assert_eq!(7, manifest.to_map()["/a"].size);
        assert_eq!(7, manifest.into_map()["/a"].size);
    }

    #[test]
    fn serialization() {
        let manifest = Manifest::from(vec![FileRecord {
            path: "/etc/hostname".into(),
            info: FileInfo {
                kind: FileKind::Regular,
                deleted: false,
                size: 7,
                mtime: 1_400_000_000,
                mode: 0o644,
                uid: 0,
                gid: 0,
            },
        }]);

        let json = serde_json::to_string(&manifest).expect("must serialize");
        assert_eq!(r#"[["/etc/hostname","f",false,7,1400000000,420,0,0]]"#, json);
        assert_eq!(
            manifest,
            serde_json::from_str::<Manifest>(&json).expect("must deserialize")
        );
    }
}
