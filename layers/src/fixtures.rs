use async_compression::tokio::write::{BzEncoder, GzipEncoder, XzEncoder};
use lazy_static::lazy_static;
use tokio::io::AsyncWriteExt;
use tokio_tar::{Builder, EntryType, Header};

/// Produces a poorly compressible payload of the given size.
pub fn payload_of_size(size: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..size)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// Compresses the given bytes with xz.
pub fn xz(data: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut encoder = XzEncoder::new(Vec::new());
        encoder.write_all(data).await.expect("must compress");
        encoder.shutdown().await.expect("must finish");
        encoder.into_inner()
    })
}

/// Compresses the given bytes with gzip.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.expect("must compress");
        encoder.shutdown().await.expect("must finish");
        encoder.into_inner()
    })
}

/// Compresses the given bytes with bzip2.
pub fn bzip2(data: &[u8]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut encoder = BzEncoder::new(Vec::new());
        encoder.write_all(data).await.expect("must compress");
        encoder.shutdown().await.expect("must finish");
        encoder.into_inner()
    })
}

/// A single entry of a tar fixture. The name is written into the header
/// verbatim, so names like `./` or `.wh.foo` survive.
pub struct TarEntry {
    pub name: &'static str,
    pub entry_type: EntryType,
    pub data: &'static [u8],
    pub mtime: u64,
    pub mode: u32,
}

impl TarEntry {
    pub fn file(name: &'static str, data: &'static [u8]) -> Self {
        Self {
            name,
            entry_type: EntryType::Regular,
            data,
            mtime: 1_400_000_000,
            mode: 0o644,
        }
    }

    pub fn dir(name: &'static str) -> Self {
        Self {
            name,
            entry_type: EntryType::Directory,
            data: b"",
            mtime: 1_400_000_000,
            mode: 0o755,
        }
    }

    pub fn of_type(name: &'static str, entry_type: EntryType) -> Self {
        Self {
            name,
            entry_type,
            data: b"",
            mtime: 1_400_000_000,
            mode: 0o600,
        }
    }

    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }
}

/// Builds an uncompressed tarball out of the given entries.
pub fn tar(entries: &[TarEntry]) -> Vec<u8> {
    futures::executor::block_on(async {
        let mut builder = Builder::new(Vec::new());
        for entry in entries {
            let mut header = Header::new_gnu();
            let name = entry.name.as_bytes();
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_entry_type(entry.entry_type);
            header.set_size(entry.data.len() as u64);
            header.set_mtime(entry.mtime);
            header.set_mode(entry.mode);
            header.set_uid(1000);
            header.set_gid(100);
            header.set_cksum();

            let mut data = entry.data;
            builder
                .append(&header, &mut data)
                .await
                .expect("must append");
        }
        builder.into_inner().await.expect("must finish")
    })
}

lazy_static! {
    /// The root layer: `/a` and `/b`.
    pub static ref LAYER_0: Vec<u8> = xz(&tar(&[
        TarEntry::dir("./"),
        TarEntry::file("./a", b"a from layer 0"),
        TarEntry::file("./b", b"b from layer 0"),
    ]));

    /// Deletes `/a`, adds `/c`.
    pub static ref LAYER_1: Vec<u8> = xz(&tar(&[
        TarEntry::file("./.wh.a", b""),
        TarEntry::file("./c", b"c from layer 1"),
    ]));

    /// Recreates `/a`, changes `/b`. Not compressed.
    pub static ref LAYER_2: Vec<u8> = tar(&[
        TarEntry::file("./a", b"a from layer 2").with_mtime(1_500_000_000),
        TarEntry::file("./b", b"b from layer 2").with_mtime(1_500_000_000),
    ]);
}
