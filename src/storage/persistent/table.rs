//! Durable period table.
//!
//! One directory per entity:
//!
//! ```text
//! <entity>/table.dat           header, table frame, then blocks
//! <entity>/index/_<period>.idx id -> row-number index of one period
//! ```
//!
//! A block is a [`BlockHeader`] frame followed by one frame per field. The
//! rows of a period may span several consecutive blocks, each naming the
//! window of the whole period. Windows and column offsets are rebuilt by
//! scanning the block headers on open; a period whose blocks stop short of
//! its window was cut by a crash and is truncated away.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::{self, FileKind};
use super::file_lock::StoreLock;
use crate::config::StorageConfig;
use crate::period::Period;
use crate::schema::FieldDef;
use crate::storage::traits::{
    columns_for_append, to_u64, to_usize, DiskIndex, IndexReader, PeriodStore, RowWindow,
    StorageError,
};
use crate::table::{ColumnTable, RowIndex};
use crate::value::Column;

const TABLE_FILE: &str = "table.dat";
const INDEX_DIR: &str = "index";

/// First frame of a table file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableHeader {
    entity: String,
    fields: Vec<FieldDef>,
    created_at: DateTime<Utc>,
}

/// Frame opening a block of rows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct BlockHeader {
    period: Period,
    window: RowWindow,
    /// Rows of the whole period; the last block ends where it ends.
    period_window: RowWindow,
}

#[derive(Debug, Clone)]
struct Block {
    period: Period,
    window: RowWindow,
    /// File offset of each field's frame, in field order.
    offsets: Vec<u64>,
}

/// Index file reader.
#[derive(Debug)]
struct FileIndex {
    path: PathBuf,
}

impl IndexReader for FileIndex {
    fn load(&self) -> Result<RowIndex, StorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader, FileKind::Index)?;
        Ok(codec::decode(&mut reader)?)
    }
}

fn index_path(dir: &Path, period: Period) -> PathBuf {
    dir.join(INDEX_DIR).join(format!("_{period}.idx"))
}

/// Period store backed by a table file and per-period index files.
#[derive(Debug)]
pub struct PersistentPeriodTable {
    dir: PathBuf,
    name: String,
    fields: Vec<FieldDef>,
    nrows: u64,
    windows: BTreeMap<Period, RowWindow>,
    blocks: Vec<Block>,
    file: File,
    end: u64,
    sync_on_write: bool,
    max_block_rows: usize,
    _lock: Arc<StoreLock>,
}

impl PersistentPeriodTable {
    /// Opens the table in `dir`, creating it with `fields` when absent.
    ///
    /// An existing table must have been created with the same fields.
    pub(crate) fn open_or_create(
        dir: &Path,
        name: &str,
        fields: Vec<FieldDef>,
        config: &StorageConfig,
        lock: Arc<StoreLock>,
    ) -> Result<Self, StorageError> {
        fs::create_dir_all(dir.join(INDEX_DIR))?;
        let path = dir.join(TABLE_FILE);
        if !path.exists() {
            let header = TableHeader {
                entity: name.to_string(),
                fields: fields.clone(),
                created_at: Utc::now(),
            };
            let mut writer = BufWriter::new(
                OpenOptions::new().write(true).create_new(true).open(&path)?,
            );
            codec::write_header(&mut writer, FileKind::Table)?;
            writer.write_all(&codec::encode(&header)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
            tracing::debug!(table = name, path = %path.display(), "created period table");
        }

        let table = Self::open_existing(dir, config, lock)?;
        if table.name != name || table.fields != fields {
            return Err(StorageError::Corrupted(format!(
                "table at {} was created for a different entity layout than '{name}'",
                dir.display()
            )));
        }
        Ok(table)
    }

    /// Opens an existing table, taking the fields from its header.
    pub(crate) fn open_existing(
        dir: &Path,
        config: &StorageConfig,
        lock: Arc<StoreLock>,
    ) -> Result<Self, StorageError> {
        let path = dir.join(TABLE_FILE);
        let mut reader = BufReader::new(File::open(&path)?);
        codec::read_header(&mut reader, FileKind::Table)?;
        let header: TableHeader = codec::decode(&mut reader)?;

        let (blocks, valid_end) = Self::scan(&mut reader, header.fields.len())?;
        let file_len = reader.seek(SeekFrom::End(0))?;
        drop(reader);

        if valid_end < file_len {
            tracing::warn!(
                table = %header.entity,
                valid_end,
                file_len,
                "truncating incomplete period at the end of the table file"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let mut windows: BTreeMap<Period, RowWindow> = BTreeMap::new();
        for block in &blocks {
            windows
                .entry(block.period)
                .and_modify(|w| w.stop = block.window.stop)
                .or_insert(block.window);
        }
        let nrows = blocks.last().map_or(0, |b| b.window.stop);

        let file = OpenOptions::new().append(true).open(&path)?;
        fs::create_dir_all(dir.join(INDEX_DIR))?;
        Self::remove_stale_temp_files(&dir.join(INDEX_DIR))?;

        tracing::debug!(
            table = %header.entity,
            periods = windows.len(),
            nrows,
            "opened period table"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            name: header.entity,
            fields: header.fields,
            nrows,
            windows,
            blocks,
            file,
            end: valid_end,
            sync_on_write: config.sync_on_write,
            max_block_rows: config.max_block_rows,
            _lock: lock,
        })
    }

    /// Walks the blocks after the table frame, returning those of complete
    /// periods and the offset just past the last of them.
    fn scan(
        reader: &mut BufReader<File>,
        nfields: usize,
    ) -> Result<(Vec<Block>, u64), StorageError> {
        let mut blocks: Vec<Block> = Vec::new();
        // blocks[..committed] belong to periods written as a whole
        let mut committed = 0;
        let mut valid_end = reader.stream_position()?;
        loop {
            let header: BlockHeader = match codec::decode(reader) {
                Ok(header) => header,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    tracing::warn!(error = %e, offset = valid_end, "unreadable block header");
                    break;
                }
            };
            let mut offsets = Vec::with_capacity(nfields);
            let mut complete = true;
            for _ in 0..nfields {
                let offset = reader.stream_position()?;
                if codec::skip(reader).is_err() {
                    complete = false;
                    break;
                }
                offsets.push(offset);
            }
            if !complete {
                break;
            }

            Self::check_block(&header, &blocks[..committed], &blocks[committed..])?;
            blocks.push(Block {
                period: header.period,
                window: header.window,
                offsets,
            });
            if header.window.stop == header.period_window.stop {
                committed = blocks.len();
                valid_end = reader.stream_position()?;
            }
        }

        if let Some(first) = blocks.get(committed) {
            let written: u64 = blocks[committed..].iter().map(|b| b.window.len()).sum();
            tracing::warn!(
                period = %first.period,
                rows_written = written,
                "dropping period cut short before all of its blocks were written"
            );
            blocks.truncate(committed);
        }
        Ok((blocks, valid_end))
    }

    /// Checks that `header` continues the committed blocks, or the blocks
    /// of the period still being read.
    fn check_block(
        header: &BlockHeader,
        committed: &[Block],
        pending: &[Block],
    ) -> Result<(), StorageError> {
        let period_start = committed.last().map_or(0, |b| b.window.stop);
        let expected_start = pending.last().map_or(period_start, |b| b.window.stop);

        if header.window.start != expected_start {
            return Err(StorageError::Corrupted(format!(
                "block of period {} starts at row {} instead of {expected_start}",
                header.period, header.window.start
            )));
        }
        if header.period_window.start != period_start
            || header.window.stop > header.period_window.stop
        {
            return Err(StorageError::Corrupted(format!(
                "block {} of period {} lies outside the period rows {}",
                header.window, header.period, header.period_window
            )));
        }
        if let Some(open) = pending.first() {
            if header.period != open.period {
                return Err(StorageError::Corrupted(format!(
                    "block of period {} interrupts period {}",
                    header.period, open.period
                )));
            }
        } else if let Some(last) = committed.last() {
            if header.period <= last.period {
                return Err(StorageError::Corrupted(format!(
                    "block of period {} follows period {}",
                    header.period, last.period
                )));
            }
        }
        Ok(())
    }

    /// Removes index files left half-written by an interrupted run.
    fn remove_stale_temp_files(index_dir: &Path) -> Result<(), StorageError> {
        for entry in fs::read_dir(index_dir)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".tmp."));
            if is_temp {
                tracing::warn!(path = %path.display(), "removing stale temporary index file");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Directory of this table.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn position(&self, field: &str) -> Result<usize, StorageError> {
        self.fields
            .iter()
            .position(|f| f.name == field)
            .ok_or_else(|| StorageError::UnknownField {
                table: self.name.clone(),
                field: field.to_string(),
            })
    }

    fn read_columns(&self, window: RowWindow, positions: &[usize]) -> Result<Vec<Column>, StorageError> {
        let window = window.clamp(self.nrows);
        let mut out: Vec<Column> = positions
            .iter()
            .map(|&p| Column::empty(self.fields[p].field_type))
            .collect();
        if window.is_empty() {
            return Ok(out);
        }

        let mut reader = BufReader::new(File::open(self.dir.join(TABLE_FILE))?);
        for block in self.blocks.iter().filter(|b| b.window.overlaps(&window)) {
            let start = to_usize(window.start.max(block.window.start) - block.window.start);
            let stop = to_usize(window.stop.min(block.window.stop) - block.window.start);
            for (column, &pos) in out.iter_mut().zip(positions) {
                reader.seek(SeekFrom::Start(block.offsets[pos]))?;
                let stored: Column = codec::decode(&mut reader)?;
                if stored.len() != to_usize(block.window.len()) {
                    return Err(StorageError::Corrupted(format!(
                        "field '{}' of period {} holds {} rows instead of {}",
                        self.fields[pos].name,
                        block.period,
                        stored.len(),
                        block.window.len()
                    )));
                }
                column
                    .extend_from(&stored.slice(start, stop))
                    .map_err(|e| StorageError::Corrupted(e.to_string()))?;
            }
        }
        Ok(out)
    }

    /// Encodes one block into `buf`, which starts at file offset `at`.
    fn encode_block(
        at: u64,
        header: &BlockHeader,
        columns: &[Column],
        buf: &mut Vec<u8>,
    ) -> Result<Block, StorageError> {
        buf.extend(codec::encode(header)?);
        let mut offsets = Vec::with_capacity(columns.len());
        for column in columns {
            offsets.push(at + to_u64(buf.len()));
            buf.extend(codec::encode(column)?);
        }
        Ok(Block {
            period: header.period,
            window: header.window,
            offsets,
        })
    }

    /// Appends the encoded blocks of one period. On failure the file is cut
    /// back to where it ended, leaving the table as it was.
    fn commit(&mut self, buf: &[u8], blocks: Vec<Block>) -> Result<(), StorageError> {
        let written = self.file.write_all(buf).and_then(|()| {
            if self.sync_on_write {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.end) {
                tracing::warn!(
                    table = %self.name,
                    error = %rollback,
                    "cannot cut the table file back after a failed append"
                );
            }
            return Err(e.into());
        }
        self.end += to_u64(buf.len());
        self.blocks.extend(blocks);
        Ok(())
    }
}

impl PeriodStore for PersistentPeriodTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    fn nrows(&self) -> u64 {
        self.nrows
    }

    fn windows(&self) -> &BTreeMap<Period, RowWindow> {
        &self.windows
    }

    fn read_field(&self, window: RowWindow, field: &str) -> Result<Column, StorageError> {
        let pos = self.position(field)?;
        let mut columns = self.read_columns(window, &[pos])?;
        columns
            .pop()
            .ok_or_else(|| StorageError::BackendError("no column read".to_string()))
    }

    fn read_rows(&self, window: RowWindow) -> Result<ColumnTable, StorageError> {
        let positions: Vec<usize> = (0..self.fields.len()).collect();
        let columns = self.read_columns(window, &positions)?;
        ColumnTable::from_columns(
            self.fields
                .iter()
                .map(|f| f.name.clone())
                .zip(columns),
        )
        .map_err(|e| StorageError::Corrupted(e.to_string()))
    }

    fn append(&mut self, period: Period, rows: &ColumnTable) -> Result<RowWindow, StorageError> {
        let columns = columns_for_append(&self.name, &self.fields, &self.windows, period, rows)?;
        let start = self.nrows;
        let period_window = RowWindow::new(start, start + to_u64(rows.len()));
        let block_rows = self.max_block_rows.max(1);

        let mut buf = Vec::new();
        let mut blocks = Vec::new();
        let mut offset = 0;
        loop {
            let stop = (offset + block_rows).min(rows.len());
            let chunk: Vec<Column> = columns.iter().map(|c| c.slice(offset, stop)).collect();
            let header = BlockHeader {
                period,
                window: RowWindow::new(start + to_u64(offset), start + to_u64(stop)),
                period_window,
            };
            blocks.push(Self::encode_block(self.end, &header, &chunk, &mut buf)?);
            offset = stop;
            if offset >= rows.len() {
                break;
            }
        }
        self.commit(&buf, blocks)?;

        self.nrows = period_window.stop;
        self.windows.insert(period, period_window);
        tracing::trace!(table = %self.name, %period, window = %period_window, "appended period rows");
        Ok(period_window)
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn write_index(&mut self, period: Period, index: &RowIndex) -> Result<(), StorageError> {
        let final_path = index_path(&self.dir, period);
        let temp_path = final_path.with_extension(format!("idx.tmp.{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut writer = BufWriter::new(file);
        let written = (|| -> std::io::Result<()> {
            codec::write_header(&mut writer, FileKind::Index)?;
            writer.write_all(&codec::encode(index)?)?;
            writer.flush()?;
            writer.get_ref().sync_all()
        })();
        if let Err(e) = written {
            drop(writer);
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        drop(writer);
        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn index_handle(&self, period: Period) -> Result<Option<DiskIndex>, StorageError> {
        let path = index_path(&self.dir, period);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(DiskIndex::new(
            period,
            Arc::new(FileIndex { path }) as Arc<dyn IndexReader>,
        )))
    }
}
