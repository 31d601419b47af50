use super::{
    INDIRECTION_COLUMN, MAX_COLUMNS, META_COLUMNS, RID_COLUMN, RecordAddr, RecordMeta,
    SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN, TXN_COLUMN,
};
use crate::error::{DbError, DbResult};

const META_WIDTH: usize = 8;

/// Column-major layout shared by a table's data and meta pages.
///
/// A data page holds `num_columns` user columns of `column_width` bytes, a
/// meta page holds the five 8-byte metadata columns. Both hold `capacity`
/// slots, and value `(col, slot)` lives at `(col * capacity + slot) * width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    page_size: usize,
    column_width: usize,
    num_columns: usize,
    capacity: usize,
}

impl PageLayout {
    pub fn new(page_size: usize, column_width: usize, num_columns: usize) -> DbResult<Self> {
        if num_columns == 0 || num_columns > MAX_COLUMNS {
            return Err(DbError::InvalidConfig(format!(
                "a table needs 1..={MAX_COLUMNS} columns, got {num_columns}"
            )));
        }

        let data_slots = page_size / (column_width * num_columns);
        let meta_slots = page_size / (META_WIDTH * META_COLUMNS);
        let capacity = data_slots.min(meta_slots).min(u16::MAX as usize);
        if capacity == 0 {
            return Err(DbError::InvalidConfig(format!(
                "{num_columns} columns of {column_width} bytes do not fit a {page_size} byte page"
            )));
        }

        Ok(Self {
            page_size,
            column_width,
            num_columns,
            capacity,
        })
    }

    /// Records per page
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn value_offset(&self, column: usize, slot: u16) -> usize {
        (column * self.capacity + slot as usize) * self.column_width
    }

    fn meta_offset(&self, column: usize, slot: u16) -> usize {
        (column * self.capacity + slot as usize) * META_WIDTH
    }

    pub fn read_value(&self, data: &[u8], column: usize, slot: u16) -> i64 {
        let offset = self.value_offset(column, slot);
        let raw = &data[offset..offset + self.column_width];
        // sign-extend narrow columns
        let fill = if raw[self.column_width - 1] & 0x80 != 0 {
            0xff
        } else {
            0
        };
        let mut bytes = [fill; 8];
        bytes[..self.column_width].copy_from_slice(raw);
        i64::from_le_bytes(bytes)
    }

    pub fn write_value(&self, data: &mut [u8], column: usize, slot: u16, value: i64) {
        let offset = self.value_offset(column, slot);
        data[offset..offset + self.column_width]
            .copy_from_slice(&value.to_le_bytes()[..self.column_width]);
    }

    pub fn read_row(&self, data: &[u8], slot: u16) -> Vec<i64> {
        (0..self.num_columns)
            .map(|column| self.read_value(data, column, slot))
            .collect()
    }

    pub fn write_row(&self, data: &mut [u8], slot: u16, values: &[i64]) {
        for (column, value) in values.iter().enumerate() {
            self.write_value(data, column, slot, *value);
        }
    }

    pub fn meta_field(&self, meta: &[u8], column: usize, slot: u16) -> u64 {
        let offset = self.meta_offset(column, slot);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&meta[offset..offset + META_WIDTH]);
        u64::from_le_bytes(bytes)
    }

    pub fn set_meta_field(&self, meta: &mut [u8], column: usize, slot: u16, value: u64) {
        let offset = self.meta_offset(column, slot);
        meta[offset..offset + META_WIDTH].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_meta(&self, meta: &[u8], slot: u16) -> RecordMeta {
        RecordMeta {
            indirection: RecordAddr::from_raw(self.meta_field(meta, INDIRECTION_COLUMN, slot)),
            rid: self.meta_field(meta, RID_COLUMN, slot),
            timestamp: self.meta_field(meta, TIMESTAMP_COLUMN, slot),
            schema: self.meta_field(meta, SCHEMA_ENCODING_COLUMN, slot),
            txn: self.meta_field(meta, TXN_COLUMN, slot),
        }
    }

    pub fn write_meta(&self, meta: &mut [u8], slot: u16, record: &RecordMeta) {
        self.set_meta_field(meta, INDIRECTION_COLUMN, slot, record.indirection.raw());
        self.set_meta_field(meta, RID_COLUMN, slot, record.rid);
        self.set_meta_field(meta, TIMESTAMP_COLUMN, slot, record.timestamp);
        self.set_meta_field(meta, SCHEMA_ENCODING_COLUMN, slot, record.schema);
        self.set_meta_field(meta, TXN_COLUMN, slot, record.txn);
    }
}
