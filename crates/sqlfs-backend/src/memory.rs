//! In-memory reference backend.
//!
//! Tables are plain row maps and blobs are byte vectors, all behind one
//! mutex. Clones share storage, so several core instances can be pointed at
//! the same backend to exercise reload paths in tests.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::dialect::{Assignment, ColumnRef, Filter, Statement};
use crate::{BackendError, BlobRead, BlobRef, BlobWrite, Result, Row, SqlBackend, Value};

type TableRow = HashMap<String, Value>;

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<TableRow>>,
    blobs: HashMap<BlobRef, Vec<u8>>,
}

/// Shared-state in-memory backend.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held in a table. Test introspection only.
    pub fn table_len(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Number of live blobs. Test introspection only.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }
}

fn param<'a>(params: &'a [Value], idx: usize) -> Result<&'a Value> {
    params.get(idx).ok_or(BackendError::MissingParam(idx + 1))
}

fn slot_index(params: &[Value], idx: usize) -> Result<usize> {
    let v = param(params, idx)?
        .as_i64()
        .ok_or(BackendError::ParamType(idx + 1))?;
    usize::try_from(v).map_err(|_| BackendError::ParamType(idx + 1))
}

fn matches_filter(row: &TableRow, filter: &Option<Filter>, params: &[Value]) -> Result<bool> {
    match filter {
        None => Ok(true),
        Some(f) => {
            let want = param(params, f.param)?;
            Ok(row.get(&f.column) == Some(want))
        }
    }
}

/// Read one slot out of an array cell. Unknown columns, non-arrays and
/// out-of-range indices all read as `Null` rather than failing, mirroring
/// how the core tolerates corrupt rows.
fn element_of(cell: Option<&Value>, idx: usize) -> Value {
    match cell {
        Some(Value::IntArray(v)) => v.get(idx).map(|x| Value::Int(*x)).unwrap_or(Value::Null),
        Some(Value::TextArray(v)) => v
            .get(idx)
            .map(|x| Value::Text(x.clone()))
            .unwrap_or(Value::Null),
        Some(Value::BytesArray(v)) => v
            .get(idx)
            .map(|x| Value::Bytes(x.clone()))
            .unwrap_or(Value::Null),
        Some(Value::TextMatrix(v)) => v
            .get(idx)
            .map(|x| Value::TextArray(x.clone()))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Slot upsert: replace in range, append exactly at `len`.
fn assign_slot(cell: &mut Value, idx: usize, value: Value, param_no: usize) -> Result<()> {
    if cell.is_null() {
        *cell = match &value {
            Value::Int(_) => Value::IntArray(Vec::new()),
            Value::Text(_) => Value::TextArray(Vec::new()),
            Value::Bytes(_) => Value::BytesArray(Vec::new()),
            Value::TextArray(_) => Value::TextMatrix(Vec::new()),
            _ => return Err(BackendError::ParamType(param_no + 1)),
        };
    }
    macro_rules! upsert {
        ($arr:expr, $item:expr) => {{
            if idx < $arr.len() {
                $arr[idx] = $item;
                Ok(())
            } else if idx == $arr.len() {
                $arr.push($item);
                Ok(())
            } else {
                Err(BackendError::Statement(format!(
                    "slot {idx} past end of array of {}",
                    $arr.len()
                )))
            }
        }};
    }
    match (cell, value) {
        (Value::IntArray(arr), Value::Int(v)) => upsert!(arr, v),
        (Value::TextArray(arr), Value::Text(v)) => upsert!(arr, v),
        (Value::BytesArray(arr), Value::Bytes(v)) => upsert!(arr, v),
        (Value::TextMatrix(arr), Value::TextArray(v)) => upsert!(arr, v),
        _ => Err(BackendError::ParamType(param_no + 1)),
    }
}

fn apply_assignment(row: &mut TableRow, set: &Assignment, params: &[Value]) -> Result<()> {
    let value = param(params, set.value_param)?.clone();
    match set.index_param {
        None => {
            row.insert(set.column.clone(), value);
        }
        Some(ip) => {
            let idx = slot_index(params, ip)?;
            let cell = row.entry(set.column.clone()).or_insert(Value::Null);
            assign_slot(cell, idx, value, set.value_param)?;
        }
    }
    Ok(())
}

impl SqlBackend for MemoryBackend {
    fn execute(&self, statement: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = Statement::parse(statement)?;
        debug!(statement, params = params.len(), "execute");
        let mut inner = self.inner.lock();
        match stmt {
            Statement::Select {
                table,
                columns,
                filter,
            } => {
                let Some(rows) = inner.tables.get(&table) else {
                    return Ok(Vec::new());
                };
                let mut out = Vec::new();
                for row in rows {
                    if !matches_filter(row, &filter, params)? {
                        continue;
                    }
                    let mut projected = Vec::with_capacity(columns.len());
                    for col in &columns {
                        match col {
                            ColumnRef::Whole(name) => {
                                projected.push(row.get(name).cloned().unwrap_or(Value::Null));
                            }
                            ColumnRef::Slot {
                                column,
                                index_param,
                            } => {
                                let idx = slot_index(params, *index_param)?;
                                projected.push(element_of(row.get(column), idx));
                            }
                        }
                    }
                    out.push(projected);
                }
                Ok(out)
            }
            Statement::Insert {
                table,
                columns,
                params: positions,
            } => {
                let mut row = TableRow::with_capacity(columns.len());
                for (col, pos) in columns.iter().zip(positions.iter()) {
                    row.insert(col.clone(), param(params, *pos)?.clone());
                }
                inner.tables.entry(table).or_default().push(row);
                Ok(Vec::new())
            }
            Statement::Update {
                table,
                sets,
                filter,
            } => {
                let Some(rows) = inner.tables.get_mut(&table) else {
                    return Ok(Vec::new());
                };
                for row in rows.iter_mut() {
                    if matches_filter(row, &filter, params)? {
                        for set in &sets {
                            apply_assignment(row, set, params)?;
                        }
                    }
                }
                Ok(Vec::new())
            }
            Statement::Delete { table, filter } => {
                let Some(rows) = inner.tables.get_mut(&table) else {
                    return Ok(Vec::new());
                };
                let mut kept = Vec::with_capacity(rows.len());
                for row in rows.drain(..) {
                    if !matches_filter(&row, &filter, params)? {
                        kept.push(row);
                    }
                }
                *rows = kept;
                Ok(Vec::new())
            }
        }
    }

    fn open_blob_write(&self, blob: BlobRef) -> Result<Box<dyn BlobWrite>> {
        self.inner.lock().blobs.insert(blob, Vec::new());
        Ok(Box::new(MemoryBlobWriter {
            inner: Arc::clone(&self.inner),
            blob,
            written: 0,
        }))
    }

    fn open_blob_read(&self, blob: BlobRef) -> Result<Box<dyn BlobRead>> {
        if !self.inner.lock().blobs.contains_key(&blob) {
            return Err(BackendError::BlobNotFound(blob));
        }
        Ok(Box::new(MemoryBlobReader {
            inner: Arc::clone(&self.inner),
            blob,
            offset: 0,
        }))
    }

    fn unlink_blob(&self, blob: BlobRef) -> Result<()> {
        match self.inner.lock().blobs.remove(&blob) {
            Some(_) => Ok(()),
            None => Err(BackendError::BlobNotFound(blob)),
        }
    }
}

struct MemoryBlobWriter {
    inner: Arc<Mutex<Inner>>,
    blob: BlobRef,
    written: u64,
}

impl BlobWrite for MemoryBlobWriter {
    fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let buf = inner
            .blobs
            .get_mut(&self.blob)
            .ok_or(BackendError::BlobNotFound(self.blob))?;
        buf.extend_from_slice(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> Result<u64> {
        Ok(self.written)
    }
}

struct MemoryBlobReader {
    inner: Arc<Mutex<Inner>>,
    blob: BlobRef,
    offset: usize,
}

impl BlobRead for MemoryBlobReader {
    fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let buf = inner
            .blobs
            .get(&self.blob)
            .ok_or(BackendError::BlobNotFound(self.blob))?;
        if self.offset >= buf.len() {
            return Ok(Vec::new());
        }
        let end = (self.offset + max).min(buf.len());
        let chunk = buf[self.offset..end].to_vec();
        self.offset = end;
        Ok(chunk)
    }
}
