//! File sink with rotation.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Local;

use crate::format::PcmFormat;
use crate::sink::Sink;
use crate::TransportError;

// WAV file format constants
// See: http://soundfile.sapp.org/doc/WaveFormat/

/// Byte offset of the RIFF chunk size field.
const WAV_RIFF_SIZE_OFFSET: u64 = 4;

/// Byte offset of the data chunk size field.
const WAV_DATA_SIZE_OFFSET: u64 = 40;

/// Size of the canonical PCM WAV header.
const WAV_HEADER_SIZE: u32 = 44;

/// Audio format code for uncompressed PCM.
const WAV_FORMAT_PCM: u16 = 1;

const WAV_BITS_PER_SAMPLE: u16 = 16;

/// Timestamp layout used in archive file names.
const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// On-disk layout of a [`FileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// Bytes are written exactly as received.
    Raw,
    /// 16-bit PCM in a WAV container; the header is patched on cut/close.
    Wav(PcmFormat),
}

/// A sink that writes to a local file.
///
/// `cut()` finalizes the current file, renames it to
/// `<stem>-<YYYYMMDD-HHMMSS>.<ext>` next to the original or in the archive
/// directory (adding `-1`, `-2`, ... if that name is taken) and starts a
/// fresh file at the configured path. If the rename fails the current file
/// stays open and keeps growing, so no audio is lost.
///
/// # Example
///
/// ```no_run
/// use stream_connector::format::PcmFormat;
/// use stream_connector::FileSink;
///
/// let raw = FileSink::raw("capture.pcm");
/// let wav = FileSink::wav("capture.wav", PcmFormat::new(44100, 2));
/// ```
pub struct FileSink {
    name: String,
    path: PathBuf,
    format: FileFormat,
    file: Option<OpenFile>,
    /// Where `cut()` moves finished files; the file's own directory if unset.
    archive_dir: Option<PathBuf>,
    archived: Vec<PathBuf>,
}

struct OpenFile {
    writer: BufWriter<File>,
    data_bytes: u64,
}

impl FileSink {
    /// Creates a sink writing raw bytes.
    pub fn raw(path: impl AsRef<Path>) -> Self {
        Self::new(path, FileFormat::Raw)
    }

    /// Creates a sink writing a WAV file of the given PCM format.
    pub fn wav(path: impl AsRef<Path>, format: PcmFormat) -> Self {
        Self::new(path, FileFormat::Wav(format))
    }

    /// Creates a sink with an explicit file format.
    pub fn new(path: impl AsRef<Path>, format: FileFormat) -> Self {
        Self {
            name: format!("file:{}", path.as_ref().display()),
            path: path.as_ref().to_path_buf(),
            format,
            file: None,
            archive_dir: None,
            archived: Vec::new(),
        }
    }

    /// Moves files finished by `cut()` into `dir`.
    ///
    /// `dir` must exist and be on the same filesystem as the output path.
    #[must_use]
    pub fn with_archive_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.archive_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Path of the file currently being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Files moved aside by `cut()`, oldest first.
    pub fn archived(&self) -> &[PathBuf] {
        &self.archived
    }

    fn create(&self) -> Result<OpenFile, TransportError> {
        let file = File::create(&self.path).map_err(|e| TransportError::file(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        if let FileFormat::Wav(format) = self.format {
            // Placeholder sizes, patched in finalize()
            write_wav_header(&mut writer, format, 0)
                .map_err(|e| TransportError::file(&self.path, e))?;
        }
        Ok(OpenFile {
            writer,
            data_bytes: 0,
        })
    }

    /// Reopens the current file for writing at its end, without truncating.
    fn reopen(&self, data_bytes: u64) -> Result<OpenFile, TransportError> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|e| TransportError::file(&self.path, e))?;
        // Not append mode: WAV finalization seeks back to the header
        file.seek(SeekFrom::End(0))
            .map_err(|e| TransportError::file(&self.path, e))?;
        Ok(OpenFile {
            writer: BufWriter::new(file),
            data_bytes,
        })
    }

    fn finalize(&self, file: &mut OpenFile) -> Result<(), TransportError> {
        if matches!(self.format, FileFormat::Wav(_)) {
            let data_size = u32::try_from(file.data_bytes).unwrap_or(u32::MAX - WAV_HEADER_SIZE);
            patch_wav_sizes(&mut file.writer, data_size)
                .map_err(|e| TransportError::file(&self.path, e))?;
        }
        file.writer
            .flush()
            .map_err(|e| TransportError::file(&self.path, e))
    }

    fn archive_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ext = self
            .path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let stamp = Local::now().format(ARCHIVE_STAMP_FORMAT);
        let place = |name: String| match self.archive_dir {
            Some(ref dir) => dir.join(name),
            None => self.path.with_file_name(name),
        };

        let mut candidate = place(format!("{stem}-{stamp}{ext}"));
        let mut n = 1;
        while candidate.exists() {
            candidate = place(format!("{stem}-{stamp}-{n}{ext}"));
            n += 1;
        }
        candidate
    }
}

impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.file.is_none() {
            self.file = Some(self.create()?);
            tracing::debug!(path = %self.path.display(), "file sink opened");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn can_write(&mut self, _timeout: Duration) -> Result<bool, TransportError> {
        Ok(self.file.is_some())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let file = self.file.as_mut().ok_or(TransportError::NotOpen)?;
        file.writer
            .write_all(data)
            .map_err(|e| TransportError::file(&self.path, e))?;
        file.data_bytes += data.len() as u64;
        tracing::trace!(path = %self.path.display(), bytes = data.len(), "file sink write");
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        if let Some(ref mut file) = self.file {
            file.writer
                .flush()
                .map_err(|e| TransportError::file(&self.path, e))?;
        }
        Ok(())
    }

    fn cut(&mut self) -> Result<(), TransportError> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if let Err(e) = self.finalize(&mut file) {
            self.file = Some(file);
            return Err(e);
        }

        let data_bytes = file.data_bytes;
        drop(file);

        let archive = self.archive_path();
        if let Err(e) = std::fs::rename(&self.path, &archive) {
            // Keep appending to the unrotated file; the next cut retries
            tracing::warn!(
                from = %self.path.display(),
                to = %archive.display(),
                error = %e,
                "file rotation failed, continuing current file"
            );
            self.file = Some(self.reopen(data_bytes)?);
            return Err(TransportError::file(&archive, e));
        }
        tracing::info!(
            from = %self.path.display(),
            to = %archive.display(),
            "file sink rotated"
        );
        self.archived.push(archive);

        self.file = Some(self.create()?);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        match self.file.take() {
            Some(mut file) => self.finalize(&mut file),
            None => Ok(()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to finalize file");
        }
    }
}

/// Writes the 44-byte RIFF/fmt/data header.
fn write_wav_header<W: Write>(
    writer: &mut W,
    format: PcmFormat,
    data_size: u32,
) -> std::io::Result<()> {
    let block_align = format.frame_bytes() as u16;

    writer.write_all(b"RIFF")?;
    writer.write_all(&(WAV_HEADER_SIZE - 8 + data_size).to_le_bytes())?;
    writer.write_all(b"WAVE")?;

    writer.write_all(b"fmt ")?;
    writer.write_all(&16u32.to_le_bytes())?;
    writer.write_all(&WAV_FORMAT_PCM.to_le_bytes())?;
    writer.write_all(&format.channels.to_le_bytes())?;
    writer.write_all(&format.sample_rate.to_le_bytes())?;
    writer.write_all(&format.byte_rate().to_le_bytes())?;
    writer.write_all(&block_align.to_le_bytes())?;
    writer.write_all(&WAV_BITS_PER_SAMPLE.to_le_bytes())?;

    writer.write_all(b"data")?;
    writer.write_all(&data_size.to_le_bytes())
}

/// Seeks back to fill in the RIFF and data sizes, then returns to the end.
fn patch_wav_sizes<W: Write + Seek>(writer: &mut W, data_size: u32) -> std::io::Result<()> {
    writer.seek(SeekFrom::Start(WAV_RIFF_SIZE_OFFSET))?;
    writer.write_all(&(WAV_HEADER_SIZE - 8 + data_size).to_le_bytes())?;
    writer.seek(SeekFrom::Start(WAV_DATA_SIZE_OFFSET))?;
    writer.write_all(&data_size.to_le_bytes())?;
    writer.seek(SeekFrom::End(0))?;
    Ok(())
}
