//! Streaming conversion of source files to UTF-8
//!
//! The publisher encodes every file in ISO-8859-1. Conversion reads and
//! writes fixed-size chunks, so peak memory is bounded by the chunk size and
//! not by the file size. The converted copy is owned by a [`ConvertedFile`]
//! guard that deletes it when dropped, which also removes partial output
//! when conversion fails halfway.

use crate::error::{IngestError, IngestResult};
use encoding_rs::Encoding;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Default conversion chunk (50 MiB)
pub const DEFAULT_ENCODING_CHUNK_BYTES: usize = 52_428_800;

/// Source character encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEncoding {
    /// True ISO-8859-1: every byte maps to the code point of the same value.
    Latin1,
    /// Already UTF-8; the file is read in place.
    Utf8,
    /// Any other WHATWG label understood by `encoding_rs`.
    Labeled(&'static Encoding),
}

impl FromStr for SourceEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().to_lowercase();
        match label.as_str() {
            // encoding_rs maps these labels to windows-1252, which differs from
            // ISO-8859-1 in 0x80..0x9F
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" | "l1" => Ok(SourceEncoding::Latin1),
            "utf-8" | "utf8" => Ok(SourceEncoding::Utf8),
            _ => Encoding::for_label(label.as_bytes())
                .map(SourceEncoding::Labeled)
                .ok_or_else(|| format!("unknown source encoding '{s}'")),
        }
    }
}

impl std::fmt::Display for SourceEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceEncoding::Latin1 => f.write_str("iso-8859-1"),
            SourceEncoding::Utf8 => f.write_str("utf-8"),
            SourceEncoding::Labeled(enc) => f.write_str(enc.name()),
        }
    }
}

/// A UTF-8 file ready for parsing.
#[derive(Debug)]
pub struct ConvertedFile {
    path: PathBuf,
    len: u64,
    owned: bool,
}

impl ConvertedFile {
    fn in_place(path: &Path, len: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            len,
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size in bytes of the UTF-8 content.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ConvertedFile {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed converted file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove converted file"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodingNormalizer {
    encoding: SourceEncoding,
    chunk_bytes: usize,
    temp_dir: PathBuf,
}

impl EncodingNormalizer {
    pub fn new(encoding: SourceEncoding, chunk_bytes: usize, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            encoding,
            chunk_bytes: chunk_bytes.max(1),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn encoding(&self) -> SourceEncoding {
        self.encoding
    }

    /// Produce a UTF-8 version of `source`.
    pub async fn convert(&self, source: &Path) -> IngestResult<ConvertedFile> {
        if self.encoding == SourceEncoding::Utf8 {
            let len = tokio::fs::metadata(source)
                .await
                .map_err(|e| IngestError::io(source, e))?
                .len();
            return Ok(ConvertedFile::in_place(source, len));
        }

        tokio::fs::create_dir_all(&self.temp_dir)
            .await
            .map_err(|e| IngestError::io(&self.temp_dir, e))?;

        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let target = self.temp_dir.join(format!("{name}.utf8"));

        let input = File::open(source)
            .await
            .map_err(|e| IngestError::io(source, e))?;
        let output = File::create(&target)
            .await
            .map_err(|e| IngestError::io(&target, e))?;

        // From here on the guard owns the target; an early return deletes it.
        let mut converted = ConvertedFile {
            path: target,
            len: 0,
            owned: true,
        };

        let started = std::time::Instant::now();
        converted.len = match self.encoding {
            SourceEncoding::Labeled(enc) => {
                self.transcode(enc, input, output, source, &converted.path).await?
            },
            _ => self.widen_latin1(input, output, source, &converted.path).await?,
        };

        debug!(
            source = %source.display(),
            encoding = %self.encoding,
            bytes = converted.len,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Converted to UTF-8"
        );

        Ok(converted)
    }

    async fn widen_latin1(
        &self,
        mut input: File,
        output: File,
        source: &Path,
        target: &Path,
    ) -> IngestResult<u64> {
        let mut writer = BufWriter::new(output);
        let mut inbuf = vec![0u8; self.chunk_bytes];
        let mut outbuf = vec![0u8; self.chunk_bytes * 2];
        let mut total = 0u64;

        loop {
            let read = input
                .read(&mut inbuf)
                .await
                .map_err(|e| IngestError::io(source, e))?;
            if read == 0 {
                break;
            }
            let written = encoding_rs::mem::convert_latin1_to_utf8(&inbuf[..read], &mut outbuf);
            writer
                .write_all(&outbuf[..written])
                .await
                .map_err(|e| IngestError::io(target, e))?;
            total += written as u64;
        }

        writer.flush().await.map_err(|e| IngestError::io(target, e))?;
        Ok(total)
    }

    async fn transcode(
        &self,
        encoding: &'static Encoding,
        mut input: File,
        output: File,
        source: &Path,
        target: &Path,
    ) -> IngestResult<u64> {
        let mut decoder = encoding.new_decoder_without_bom_handling();
        let mut writer = BufWriter::new(output);
        let mut inbuf = vec![0u8; self.chunk_bytes];
        let mut outbuf = Vec::new();
        let mut total = 0u64;

        loop {
            let read = input
                .read(&mut inbuf)
                .await
                .map_err(|e| IngestError::io(source, e))?;
            let last = read == 0;

            let needed = decoder
                .max_utf8_buffer_length(read)
                .unwrap_or(read * 3 + 16);
            outbuf.resize(needed, 0);

            // Sized for the worst case, so one call consumes the whole chunk.
            // A multi-byte sequence split across chunks stays in the decoder.
            let (_, _, written, had_errors) =
                decoder.decode_to_utf8(&inbuf[..read], &mut outbuf, last);
            if had_errors {
                debug!(path = %target.display(), "Replaced undecodable bytes");
            }

            writer
                .write_all(&outbuf[..written])
                .await
                .map_err(|e| IngestError::io(target, e))?;
            total += written as u64;

            if last {
                break;
            }
        }

        writer.flush().await.map_err(|e| IngestError::io(target, e))?;
        Ok(total)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_encodings() {
        assert_eq!("ISO-8859-1".parse::<SourceEncoding>().unwrap(), SourceEncoding::Latin1);
        assert_eq!("utf8".parse::<SourceEncoding>().unwrap(), SourceEncoding::Utf8);
        assert_eq!(
            "windows-1252".parse::<SourceEncoding>().unwrap(),
            SourceEncoding::Labeled(encoding_rs::WINDOWS_1252)
        );
        assert!("klingon".parse::<SourceEncoding>().is_err());
    }

    #[tokio::test]
    async fn test_latin1_converted_across_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("F.K03200$Z.D40511.MUNICCSV");
        // "0001";"SÃO JOÃO" in Latin-1
        let latin1: Vec<u8> = b"\"0001\";\"S\xC3O JO\xC3O\"\n".to_vec();
        tokio::fs::write(&source, &latin1).await.unwrap();

        let normalizer = EncodingNormalizer::new(SourceEncoding::Latin1, 3, dir.path().join("tmp"));
        let converted = normalizer.convert(&source).await.unwrap();

        let text = tokio::fs::read_to_string(converted.path()).await.unwrap();
        assert_eq!(text, "\"0001\";\"SÃO JOÃO\"\n");
        assert_eq!(converted.len(), text.len() as u64);
    }

    #[tokio::test]
    async fn test_latin1_high_control_range_is_not_windows_1252() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw");
        tokio::fs::write(&source, [0x80u8]).await.unwrap();

        let normalizer = EncodingNormalizer::new(SourceEncoding::Latin1, 1024, dir.path());
        let converted = normalizer.convert(&source).await.unwrap();

        let text = tokio::fs::read_to_string(converted.path()).await.unwrap();
        assert_eq!(text, "\u{80}");
    }

    #[tokio::test]
    async fn test_labeled_decoder_handles_split_sequences() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("sjis");
        // Shift_JIS for "日本" is two 2-byte sequences; chunk size 1 splits both.
        tokio::fs::write(&source, [0x93u8, 0xFA, 0x96, 0x7B]).await.unwrap();

        let normalizer =
            EncodingNormalizer::new("shift_jis".parse().unwrap(), 1, dir.path().join("out"));
        let converted = normalizer.convert(&source).await.unwrap();

        assert_eq!(tokio::fs::read_to_string(converted.path()).await.unwrap(), "日本");
    }

    #[tokio::test]
    async fn test_converted_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("K3241.K03200Y0.D40511.EMPRECSV");
        tokio::fs::write(&source, b"1;2\n").await.unwrap();

        let normalizer = EncodingNormalizer::new(SourceEncoding::Latin1, 8, dir.path().join("tmp"));
        let converted = normalizer.convert(&source).await.unwrap();
        let path = converted.path().to_path_buf();
        assert!(path.exists());

        drop(converted);
        assert!(!path.exists());
        assert!(source.exists(), "source must never be deleted");
    }

    #[tokio::test]
    async fn test_utf8_source_is_read_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("utf8.csv");
        tokio::fs::write(&source, "a;b\n").await.unwrap();

        let normalizer = EncodingNormalizer::new(SourceEncoding::Utf8, 8, dir.path().join("tmp"));
        let converted = normalizer.convert(&source).await.unwrap();
        assert_eq!(converted.path(), source.as_path());
        drop(converted);
        assert!(source.exists());
    }

    #[tokio::test]
    async fn test_missing_source_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let normalizer = EncodingNormalizer::new(SourceEncoding::Latin1, 8, dir.path());
        let err = normalizer.convert(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }
}
