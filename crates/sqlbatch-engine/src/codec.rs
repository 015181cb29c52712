//! Partition file codec
//!
//! Partitions are CSV with a header row, optionally gzip-compressed as a whole.
//! Writes go to a hidden temporary file in the destination directory and are
//! renamed into place on [`PartitionWriter::commit`]; a writer dropped before
//! commit deletes its temporary file, so a reader never sees a partial
//! partition at its final path.

use crate::error::{EngineError, Result};
use crate::partition::{Compression, PartitionFormat};
use crate::source::Row;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::debug;

enum Encoder {
    Plain(csv::Writer<BufWriter<File>>),
    Gzip(csv::Writer<GzEncoder<BufWriter<File>>>),
}

impl Encoder {
    fn write_record<I, T>(&mut self, record: I) -> csv::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        match self {
            Encoder::Plain(w) => w.write_record(record),
            Encoder::Gzip(w) => w.write_record(record),
        }
    }

    /// Flush every layer and return the underlying file
    fn finish(self) -> std::io::Result<File> {
        let buffered = match self {
            Encoder::Plain(w) => w
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?,
            Encoder::Gzip(w) => w
                .into_inner()
                .map_err(|e| std::io::Error::other(e.to_string()))?
                .finish()?,
        };
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

/// Streaming writer for one partition file
pub struct PartitionWriter {
    path: PathBuf,
    temp: TempPath,
    encoder: Encoder,
    rows: u64,
}

impl PartitionWriter {
    /// Start a partition at `path`, writing the header immediately
    pub fn create(path: &Path, format: PartitionFormat, columns: &[String]) -> Result<Self> {
        let dir = path
            .parent()
            .ok_or_else(|| EngineError::codec(path, "output path has no parent directory"))?;
        std::fs::create_dir_all(dir)?;

        let (file, temp) = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(dir)?
            .into_parts();

        let buffered = BufWriter::new(file);
        let mut encoder = match format.compression {
            Compression::None => Encoder::Plain(csv::Writer::from_writer(buffered)),
            Compression::Gzip => Encoder::Gzip(csv::Writer::from_writer(GzEncoder::new(
                buffered,
                flate2::Compression::default(),
            ))),
        };
        encoder
            .write_record(columns)
            .map_err(|e| EngineError::codec(path, e))?;

        debug!(path = %path.display(), temp = %temp.display(), "partition writer opened");

        Ok(Self {
            path: path.to_path_buf(),
            temp,
            encoder,
            rows: 0,
        })
    }

    /// Append rows; NULL cells are written as empty fields
    pub fn write_batch(&mut self, rows: &[Row]) -> Result<()> {
        for row in rows {
            self.encoder
                .write_record(row.iter().map(|cell| cell.as_deref().unwrap_or("")))
                .map_err(|e| EngineError::codec(&self.path, e))?;
        }
        self.rows += rows.len() as u64;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, sync and atomically move the file to its final path
    pub fn commit(self) -> Result<u64> {
        let file = self
            .encoder
            .finish()
            .map_err(|e| EngineError::codec(&self.path, e))?;
        file.sync_all()?;
        drop(file);

        self.temp
            .persist(&self.path)
            .map_err(|e| EngineError::codec(&self.path, e.error))?;

        debug!(path = %self.path.display(), rows = self.rows, "partition committed");
        Ok(self.rows)
    }
}

/// Reader over one partition file; compression follows the file extension
pub struct PartitionReader {
    path: PathBuf,
    columns: Vec<String>,
    reader: csv::Reader<Box<dyn Read + Send>>,
}

impl PartitionReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = BufReader::new(File::open(path)?);
        let input: Box<dyn Read + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };

        let mut reader = csv::Reader::from_reader(input);
        let columns = reader
            .headers()
            .map_err(|e| EngineError::codec(path, e))?
            .iter()
            .map(str::to_string)
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            columns,
            reader,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Remaining rows in file order
    pub fn rows(&mut self) -> impl Iterator<Item = Result<Vec<String>>> + '_ {
        let path = &self.path;
        self.reader.records().map(move |record| {
            record
                .map(|r| r.iter().map(str::to_string).collect())
                .map_err(|e| EngineError::codec(path, e))
        })
    }
}
