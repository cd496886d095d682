//! Segment compression codecs.
//!
//! Three interchangeable algorithms sit behind one encode/decode contract and
//! are used by the compressed filesystem directory:
//!
//! | Algorithm | Format | Notes |
//! |-----------|--------|-------|
//! | Snappy | framed stream (`snap`) | default, fastest |
//! | LZ4 | LZ4 frame (`lz4_flex`) | fast, better ratio |
//! | Zstd | zstd frame, level 3 | best ratio, shared decoder |
//!
//! Nothing in the encoded bytes identifies the algorithm: a directory must be
//! read back with the algorithm it was written with.

use std::io::{self, Read, Write};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

/// Fixed zstd level (balanced throughput).
pub const ZSTD_LEVEL: i32 = 3;

/// Compression algorithm selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Snappy framed format
    #[default]
    Snappy,
    /// LZ4 frame format
    Lz4,
    /// Zstandard at [`ZSTD_LEVEL`]
    Zstd,
}

impl CompressionAlgorithm {
    /// Parse an algorithm name, case-insensitively.
    ///
    /// Unknown names fall back to the default (Snappy).
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "lz4" => Self::Lz4,
            "zstd" => Self::Zstd,
            _ => Self::Snappy,
        }
    }

    /// Name used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Compress `src` into `dst`, returning the number of compressed bytes written.
    pub fn compress<W: Write>(&self, dst: &mut W, src: &[u8]) -> Result<usize> {
        let mut counter = CountingWriter::new(dst);
        match self {
            Self::Snappy => snappy_compress(&mut counter, src)?,
            Self::Lz4 => lz4_compress(&mut counter, src)?,
            Self::Zstd => zstd_compress(&mut counter, src)?,
        }
        Ok(counter.written)
    }

    /// Decompress a complete buffer produced by [`CompressionAlgorithm::compress`].
    pub fn decompress(&self, src: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Snappy => snappy_decompress(src),
            Self::Lz4 => lz4_decompress(src),
            Self::Zstd => zstd_decompress(src),
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts bytes passed through to the inner writer.
struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    written: usize,
}

impl<'a, W: Write> CountingWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner, written: 0 }
    }
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn compression_err(alg: &str, op: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Compression(format!("{} {} failed: {}", alg, op, err))
}

fn snappy_compress<W: Write>(dst: &mut W, src: &[u8]) -> Result<()> {
    let mut encoder = snap::write::FrameEncoder::new(dst);
    encoder
        .write_all(src)
        .map_err(|e| compression_err("snappy", "compression", e))?;
    encoder
        .into_inner()
        .map_err(|e| compression_err("snappy", "compression", e.error()))?;
    Ok(())
}

fn snappy_decompress(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    snap::read::FrameDecoder::new(src)
        .read_to_end(&mut out)
        .map_err(|e| compression_err("snappy", "decompression", e))?;
    Ok(out)
}

fn lz4_compress<W: Write>(dst: &mut W, src: &[u8]) -> Result<()> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(dst);
    encoder
        .write_all(src)
        .map_err(|e| compression_err("lz4", "compression", e))?;
    encoder
        .finish()
        .map_err(|e| compression_err("lz4", "compression", e))?;
    Ok(())
}

fn lz4_decompress(src: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    lz4_flex::frame::FrameDecoder::new(src)
        .read_to_end(&mut out)
        .map_err(|e| compression_err("lz4", "decompression", e))?;
    Ok(out)
}

fn zstd_compress<W: Write>(dst: &mut W, src: &[u8]) -> Result<()> {
    // Single-shot compression records the content size in the frame header,
    // which lets the shared decoder size its output buffer exactly.
    let compressed =
        zstd::bulk::compress(src, ZSTD_LEVEL).map_err(|e| compression_err("zstd", "compression", e))?;
    dst.write_all(&compressed)
        .map_err(|e| compression_err("zstd", "compression", e))?;
    Ok(())
}

/// Upper bound on zstd expansion: an RLE block of 4 bytes yields at most 128 KiB.
const ZSTD_MAX_RATIO: u64 = 128 * 1024 / 4;

/// Largest content size decoded into one preallocated buffer; bigger frames stream.
const ZSTD_MAX_PREALLOC: u64 = 256 * 1024 * 1024;

/// Process-wide zstd decoder, created on first use.
static ZSTD_DECODER: OnceCell<Mutex<zstd::bulk::Decompressor<'static>>> = OnceCell::new();

fn zstd_decoder() -> Result<&'static Mutex<zstd::bulk::Decompressor<'static>>> {
    ZSTD_DECODER.get_or_try_init(|| {
        tracing::debug!("initialising shared zstd decoder");
        zstd::bulk::Decompressor::new()
            .map(Mutex::new)
            .map_err(|e| compression_err("zstd", "decoder init", e))
    })
}

fn zstd_decompress(src: &[u8]) -> Result<Vec<u8>> {
    match zstd::zstd_safe::get_frame_content_size(src) {
        Ok(Some(size)) if size > (src.len() as u64).saturating_mul(ZSTD_MAX_RATIO) => {
            Err(compression_err(
                "zstd",
                "decompression",
                format!("frame claims {} bytes from {} input bytes", size, src.len()),
            ))
        }
        Ok(Some(size)) if size <= ZSTD_MAX_PREALLOC => {
            let capacity = usize::try_from(size)
                .map_err(|_| compression_err("zstd", "decompression", "frame too large"))?;
            zstd_decoder()?
                .lock()
                .decompress(src, capacity)
                .map_err(|e| compression_err("zstd", "decompression", e))
        }
        // No content size (streaming encoder), or too large to preallocate.
        Ok(_) => {
            zstd::stream::decode_all(src).map_err(|e| compression_err("zstd", "decompression", e))
        }
        Err(e) => Err(compression_err("zstd", "decompression", format!("{:?}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::Snappy,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
    ];

    fn roundtrip(alg: CompressionAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        let written = alg.compress(&mut encoded, data).unwrap();
        assert_eq!(written, encoded.len());
        alg.decompress(&encoded).unwrap()
    }

    #[test]
    fn test_roundtrip_empty() {
        for alg in ALL {
            assert!(roundtrip(alg, b"").is_empty(), "{}", alg);
        }
    }

    #[test]
    fn test_roundtrip_small() {
        for alg in ALL {
            assert_eq!(roundtrip(alg, b"segment bytes"), b"segment bytes", "{}", alg);
        }
    }

    #[test]
    fn test_roundtrip_multi_megabyte() {
        let data: Vec<u8> = (0..3 * 1024 * 1024u32)
            .map(|i| (i.wrapping_mul(31) ^ (i >> 7)) as u8)
            .collect();
        for alg in ALL {
            assert_eq!(roundtrip(alg, &data), data, "{}", alg);
        }
    }

    #[test]
    fn test_compression_actually_compresses() {
        let data = "x".repeat(100_000);
        for alg in ALL {
            let mut encoded = Vec::new();
            alg.compress(&mut encoded, data.as_bytes()).unwrap();
            assert!(
                encoded.len() < data.len() / 10,
                "{} produced {} bytes",
                alg,
                encoded.len()
            );
        }
    }

    #[test]
    fn test_wrong_algorithm_fails() {
        let mut encoded = Vec::new();
        CompressionAlgorithm::Lz4
            .compress(&mut encoded, b"some data that is lz4 framed")
            .unwrap();
        let err = CompressionAlgorithm::Snappy.decompress(&encoded).unwrap_err();
        assert!(matches!(err, StorageError::Compression(_)));
    }

    #[test]
    fn test_zstd_streamed_frame_is_decoded() {
        let streamed = zstd::stream::encode_all(&b"no content size"[..], 3).unwrap();
        let out = CompressionAlgorithm::Zstd.decompress(&streamed).unwrap();
        assert_eq!(out, b"no content size");
    }

    #[test]
    fn test_zstd_forged_content_size_is_rejected() {
        // Magic, descriptor with an 8-byte content size field, size 2^60, no blocks.
        let mut frame = vec![0x28, 0xb5, 0x2f, 0xfd, 0xe0];
        frame.extend_from_slice(&(1u64 << 60).to_le_bytes());
        let err = CompressionAlgorithm::Zstd.decompress(&frame).unwrap_err();
        assert!(matches!(err, StorageError::Compression(_)), "{:?}", err);
    }

    #[test]
    fn test_zstd_truncated_frame_fails() {
        let mut encoded = Vec::new();
        CompressionAlgorithm::Zstd
            .compress(&mut encoded, &vec![7u8; 64 * 1024])
            .unwrap();
        encoded.truncate(encoded.len() / 2);
        let err = CompressionAlgorithm::Zstd.decompress(&encoded).unwrap_err();
        assert!(matches!(err, StorageError::Compression(_)));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(CompressionAlgorithm::from_name("LZ4"), CompressionAlgorithm::Lz4);
        assert_eq!(CompressionAlgorithm::from_name("zstd"), CompressionAlgorithm::Zstd);
        assert_eq!(CompressionAlgorithm::from_name("snappy"), CompressionAlgorithm::Snappy);
        assert_eq!(CompressionAlgorithm::from_name("gzip"), CompressionAlgorithm::Snappy);
        assert_eq!(CompressionAlgorithm::default(), CompressionAlgorithm::Snappy);
    }
}
