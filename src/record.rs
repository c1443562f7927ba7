//! Documents, input sources, and output sinks.
//!
//! Sources are restartable: `open` yields a fresh pass over the same records
//! in the same order, so records can be addressed by their position (`seq`)
//! across passes. Sinks stage their output and only make it visible on
//! `commit`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use siphasher::sip::SipHasher13;
use std::collections::HashSet;
use std::fs::{self, File};
use std::hash::Hasher;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

use crate::error::Result;

/// An admitted document: opaque id plus text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A document tagged with its position in the source stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Positioned {
    pub seq: u64,
    pub doc: Document,
}

/// Why a record could not be turned into a document. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing or non-scalar id field '{0}'")]
    MissingId(String),
    #[error("missing or non-string text field '{0}'")]
    MissingText(String),
    #[error("unreadable text in '{0}'")]
    UnreadableText(String),
}

/// One record read from a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Valid(Document),
    Malformed(RecordError),
}

/// Field names used to read `{id, text}` from JSON records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub id: String,
    pub text: String,
}

impl Default for RecordFields {
    fn default() -> Self {
        Self {
            id: "id".into(),
            text: "text".into(),
        }
    }
}

/// Interpret a JSON value as a document record.
pub fn parse_value(value: &Value, fields: &RecordFields) -> RawRecord {
    let id = match value.get(&fields.id) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return RawRecord::Malformed(RecordError::MissingId(fields.id.clone())),
    };
    match value.get(&fields.text) {
        Some(Value::String(s)) => RawRecord::Valid(Document::new(id, s.clone())),
        _ => RawRecord::Malformed(RecordError::MissingText(fields.text.clone())),
    }
}

/// Interpret one JSONL line.
pub fn parse_line(line: &str, fields: &RecordFields) -> RawRecord {
    match serde_json::from_str::<Value>(line) {
        Ok(v) => parse_value(&v, fields),
        Err(e) => RawRecord::Malformed(RecordError::InvalidJson(e.to_string())),
    }
}

/// JSONL records from a byte reader. A line that is not valid UTF-8 is a
/// malformed record, not a read error.
struct JsonlRecords<'f, R> {
    reader: R,
    fields: &'f RecordFields,
    line: u64,
    buf: Vec<u8>,
}

impl<'f, R: BufRead> JsonlRecords<'f, R> {
    fn new(reader: R, fields: &'f RecordFields) -> Self {
        Self {
            reader,
            fields,
            line: 0,
            buf: Vec::new(),
        }
    }
}

impl<R: BufRead> Iterator for JsonlRecords<'_, R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => self.line += 1,
                Err(e) => return Some(Err(e.into())),
            }
            match std::str::from_utf8(&self.buf) {
                Ok(l) if l.trim().is_empty() => continue,
                Ok(l) => return Some(Ok(parse_line(l, self.fields))),
                Err(_) => {
                    let at = format!("line {}", self.line);
                    return Some(Ok(RawRecord::Malformed(RecordError::UnreadableText(at))));
                }
            }
        }
    }
}

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<RawRecord>> + Send + 'a>;

/// A finite, restartable stream of records.
pub trait DocumentSource: Sync {
    /// Start a fresh pass from the first record.
    fn open(&self) -> Result<RecordIter<'_>>;

    /// Stable hash identifying the source's contents, for checkpoint keying.
    fn fingerprint(&self) -> Result<u64>;
}

// ── In-memory ────────────────────────────────────────────────────────────────

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    records: Vec<RawRecord>,
}

impl MemorySource {
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self { records }
    }

    pub fn from_documents(docs: Vec<Document>) -> Self {
        Self::new(docs.into_iter().map(RawRecord::Valid).collect())
    }

    pub fn from_values(values: &[Value], fields: &RecordFields) -> Self {
        Self::new(values.iter().map(|v| parse_value(v, fields)).collect())
    }

    /// Read all JSONL lines from a reader (for non-restartable inputs like stdin).
    pub fn from_jsonl_reader(reader: impl BufRead, fields: &RecordFields) -> Result<Self> {
        let records = JsonlRecords::new(reader, fields).collect::<Result<Vec<_>>>()?;
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl DocumentSource for MemorySource {
    fn open(&self) -> Result<RecordIter<'_>> {
        Ok(Box::new(self.records.iter().cloned().map(Ok)))
    }

    fn fingerprint(&self) -> Result<u64> {
        let mut hasher = SipHasher13::new();
        for r in &self.records {
            match r {
                RawRecord::Valid(d) => {
                    hasher.write_u8(1);
                    hasher.write(d.id.as_bytes());
                    hasher.write_u8(0xff);
                    hasher.write(d.text.as_bytes());
                    hasher.write_u8(0xff);
                }
                RawRecord::Malformed(_) => hasher.write_u8(0),
            }
        }
        Ok(hasher.finish())
    }
}

// ── JSONL file ───────────────────────────────────────────────────────────────

/// Newline-delimited JSON records in a file.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    path: PathBuf,
    fields: RecordFields,
}

impl JsonlSource {
    pub fn new(path: impl Into<PathBuf>, fields: RecordFields) -> Self {
        Self {
            path: path.into(),
            fields,
        }
    }
}

fn file_stamp(hasher: &mut SipHasher13, path: &Path) -> Result<()> {
    let meta = fs::metadata(path)?;
    hasher.write(path.to_string_lossy().as_bytes());
    hasher.write(&meta.len().to_le_bytes());
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    hasher.write(&modified.to_le_bytes());
    Ok(())
}

impl DocumentSource for JsonlSource {
    fn open(&self) -> Result<RecordIter<'_>> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(JsonlRecords::new(reader, &self.fields)))
    }

    fn fingerprint(&self) -> Result<u64> {
        let mut hasher = SipHasher13::new();
        file_stamp(&mut hasher, &self.path)?;
        hasher.write(self.fields.id.as_bytes());
        hasher.write(self.fields.text.as_bytes());
        Ok(hasher.finish())
    }
}

// ── Directory of text files ──────────────────────────────────────────────────

/// One document per regular file; id is the file name. Files are visited in
/// name order.
#[derive(Debug, Clone)]
pub struct TextDirSource {
    dir: PathBuf,
}

impl TextDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}

impl DocumentSource for TextDirSource {
    fn open(&self) -> Result<RecordIter<'_>> {
        let files = self.files()?;
        Ok(Box::new(files.into_iter().map(|path| -> Result<RawRecord> {
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Ok(RawRecord::Malformed(RecordError::UnreadableText(format!("{id}: {e}"))));
                }
            };
            Ok(match String::from_utf8(bytes) {
                Ok(text) => RawRecord::Valid(Document::new(id, text)),
                Err(_) => RawRecord::Malformed(RecordError::UnreadableText(id)),
            })
        })))
    }

    fn fingerprint(&self) -> Result<u64> {
        let mut hasher = SipHasher13::new();
        for path in self.files()? {
            file_stamp(&mut hasher, &path)?;
        }
        Ok(hasher.finish())
    }
}

// ── Sinks ────────────────────────────────────────────────────────────────────

/// Destination for surviving documents.
pub trait DocumentSink {
    fn write(&mut self, doc: &Document) -> Result<()>;

    /// Make everything written so far visible as the final output.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Collects documents in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub docs: Vec<Document>,
}

impl DocumentSink for VecSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        self.docs.push(doc.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Borrowed form, so the collected documents outlive the boxed sink.
impl DocumentSink for &mut VecSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        self.docs.push(doc.clone());
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Writes JSONL `{id, text}` lines to any writer (e.g. stdout).
pub struct JsonlWriterSink<W: Write> {
    out: W,
}

impl<W: Write> JsonlWriterSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> DocumentSink for JsonlWriterSink<W> {
    fn write(&mut self, doc: &Document) -> Result<()> {
        serde_json::to_writer(&mut self.out, doc)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Writes JSONL to `<path>.partial`, renamed onto `path` on commit.
pub struct JsonlFileSink {
    path: PathBuf,
    staging: PathBuf,
    out: BufWriter<File>,
}

impl JsonlFileSink {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut staging = path.clone().into_os_string();
        staging.push(".partial");
        let staging = PathBuf::from(staging);
        let out = BufWriter::new(File::create(&staging)?);
        Ok(Self { path, staging, out })
    }
}

impl DocumentSink for JsonlFileSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        serde_json::to_writer(&mut self.out, doc)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        fs::rename(&self.staging, &self.path)?;
        Ok(())
    }
}

/// Writes one file per document (named by id) into a directory.
///
/// Files are staged in the sibling directory `<dir>.partial`, which is
/// renamed onto `dir` in one step on commit. `dir` must be absent or empty.
/// Ids that map to an already used file name get a `~N` suffix.
pub struct TextDirSink {
    dir: PathBuf,
    staging: PathBuf,
    names: HashSet<String>,
}

impl TextDirSink {
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() && fs::read_dir(&dir)?.next().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("output directory '{}' is not empty", dir.display()),
            )
            .into());
        }
        let mut staging = dir.clone().into_os_string();
        staging.push(".partial");
        let staging = PathBuf::from(staging);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;
        Ok(Self {
            dir,
            staging,
            names: HashSet::new(),
        })
    }

    fn unique_name(&self, id: &str) -> String {
        let base = file_name_for(id);
        if !self.names.contains(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}~{n}"))
            .find(|name| !self.names.contains(name))
            .unwrap_or(base)
    }
}

/// Reduce an id to a single safe path component.
fn file_name_for(id: &str) -> String {
    let name: String = id
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{name}"),
        _ => name,
    }
}

impl DocumentSink for TextDirSink {
    fn write(&mut self, doc: &Document) -> Result<()> {
        let name = self.unique_name(&doc.id);
        fs::write(self.staging.join(&name), doc.text.as_bytes())?;
        self.names.insert(name);
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir(&self.dir)?;
        }
        fs::rename(&self.staging, &self.dir)?;
        Ok(())
    }
}
