//! On-disk format of a single index.
//!
//! ```text
//! magic "ANNI" | version u32 | family tag u8 | payload len u64 | bincode payload | crc32 u32
//! ```
//!
//! The checksum covers the family tag, the length and the payload. Graphs are
//! not persisted; an HNSW index rebuilds its graph on first search.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crc32fast::Hasher;

use crate::handle::{IndexHandle, NativeIndex};
use crate::hnsw::HnswIndex;
use crate::ivf_pq::IvfPqIndex;
use crate::meta::IndexType;
use crate::IndexError;

const PERSIST_MAGIC: [u8; 4] = *b"ANNI";
const PERSIST_VERSION: u32 = 1;

fn write_u8<W: Write>(writer: &mut W, value: u8, hasher: Option<&mut Hasher>) -> io::Result<()> {
    let bytes = [value];
    if let Some(h) = hasher {
        h.update(&bytes);
    }
    writer.write_all(&bytes)
}

fn write_u32<W: Write>(writer: &mut W, value: u32, hasher: Option<&mut Hasher>) -> io::Result<()> {
    let bytes = value.to_le_bytes();
    if let Some(h) = hasher {
        h.update(&bytes);
    }
    writer.write_all(&bytes)
}

fn write_u64<W: Write>(writer: &mut W, value: u64, hasher: Option<&mut Hasher>) -> io::Result<()> {
    let bytes = value.to_le_bytes();
    if let Some(h) = hasher {
        h.update(&bytes);
    }
    writer.write_all(&bytes)
}

fn read_u8<R: Read>(reader: &mut R, hasher: Option<&mut Hasher>) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    if let Some(h) = hasher {
        h.update(&buf);
    }
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R, hasher: Option<&mut Hasher>) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    if let Some(h) = hasher {
        h.update(&buf);
    }
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R, hasher: Option<&mut Hasher>) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    if let Some(h) = hasher {
        h.update(&buf);
    }
    Ok(u64::from_le_bytes(buf))
}

fn encode(handle: &IndexHandle) -> Result<Vec<u8>, IndexError> {
    let encoded = match handle.native() {
        NativeIndex::Hnsw(index) => bincode::serialize(index),
        NativeIndex::IvfPq(index) => bincode::serialize(index),
        NativeIndex::External(_) => {
            return Err(IndexError::NativeLibraryError(format!(
                "external {} index cannot be persisted by this crate",
                handle.index_type()
            )))
        }
    };
    encoded.map_err(|err| IndexError::InvalidPersistence(format!("failed to serialize index: {err}")))
}

fn decode(index_type: IndexType, payload: &[u8]) -> Result<IndexHandle, IndexError> {
    let corrupt = |err: bincode::Error| IndexError::InvalidPersistence(format!("failed to deserialize index: {err}"));
    match index_type {
        IndexType::Hnsw => {
            let index: HnswIndex = bincode::deserialize(payload).map_err(corrupt)?;
            index.check_layout()?;
            Ok(IndexHandle::hnsw(index))
        }
        IndexType::IvfPq => {
            let index: IvfPqIndex = bincode::deserialize(payload).map_err(corrupt)?;
            index.check_layout()?;
            Ok(IndexHandle::ivf_pq(index))
        }
    }
}

pub fn save_to_writer<W: Write>(handle: &IndexHandle, writer: W) -> Result<(), IndexError> {
    let payload = encode(handle)?;
    let mut writer = BufWriter::new(writer);
    let mut hasher = Hasher::new();

    writer.write_all(&PERSIST_MAGIC)?;
    write_u32(&mut writer, PERSIST_VERSION, None)?;
    write_u8(&mut writer, handle.index_type().to_tag(), Some(&mut hasher))?;
    write_u64(&mut writer, payload.len() as u64, Some(&mut hasher))?;
    writer.write_all(&payload)?;
    hasher.update(&payload);
    write_u32(&mut writer, hasher.finalize(), None)?;

    writer.flush()?;
    Ok(())
}

pub fn save_to_path<P: AsRef<Path>>(handle: &IndexHandle, path: P) -> Result<(), IndexError> {
    let path = path.as_ref();
    let file = File::create(path)?;
    save_to_writer(handle, file)?;
    tracing::debug!(path = %path.display(), index_type = %handle.index_type(), "saved index");
    Ok(())
}

pub fn load_from_reader<R: Read>(reader: R) -> Result<IndexHandle, IndexError> {
    let mut reader = BufReader::new(reader);
    let mut hasher = Hasher::new();

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != PERSIST_MAGIC {
        return Err(IndexError::InvalidPersistence("invalid magic bytes".to_string()));
    }
    let version = read_u32(&mut reader, None)?;
    if version != PERSIST_VERSION {
        return Err(IndexError::InvalidPersistence(format!(
            "unsupported version {version}"
        )));
    }

    let tag = read_u8(&mut reader, Some(&mut hasher))?;
    let index_type = IndexType::from_tag(tag)
        .ok_or_else(|| IndexError::InvalidPersistence(format!("unknown family tag {tag}")))?;
    let len = usize::try_from(read_u64(&mut reader, Some(&mut hasher))?)
        .map_err(|_| IndexError::InvalidPersistence("payload length overflows usize".to_string()))?;
    let mut payload = Vec::new();
    (&mut reader).take(len as u64).read_to_end(&mut payload)?;
    if payload.len() != len {
        return Err(IndexError::InvalidPersistence("truncated payload".to_string()));
    }
    hasher.update(&payload);

    let stored = read_u32(&mut reader, None)?;
    if stored != hasher.finalize() {
        return Err(IndexError::InvalidPersistence("checksum mismatch".to_string()));
    }

    decode(index_type, &payload)
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<IndexHandle, IndexError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let handle = load_from_reader(file)?;
    tracing::debug!(path = %path.display(), index_type = %handle.index_type(), "loaded index");
    Ok(handle)
}
