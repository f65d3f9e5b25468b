//! Bucket matrices and the wire-visible sizing constants.

/// Number of TRIED buckets any single group can ever land in.
pub const TRIED_BUCKETS_PER_GROUP: u16 = 8;
/// Number of NEW buckets any single source group can ever land in.
pub const NEW_BUCKETS_PER_SOURCE_GROUP: u16 = 64;
/// Total number of TRIED buckets.
pub const TRIED_BUCKET_COUNT: u16 = 256;
/// Total number of NEW buckets.
pub const NEW_BUCKET_COUNT: u16 = 1024;
/// Slots per bucket, in either table.
pub const BUCKET_SIZE: u16 = 64;
/// Maximum number of queued tried-table collisions.
pub const TRIED_COLLISION_SIZE: usize = 10;
/// Maximum number of NEW slots a single entry can occupy at once.
pub const NEW_BUCKETS_PER_ADDRESS: u8 = 8;
/// Entries untouched for this many days are eligible for eviction.
pub const HORIZON_DAYS: i64 = 30;
/// Entries with no success after this many attempts are terrible.
pub const MAX_RETRIES: u32 = 3;
/// Window (in days) used by the "N failures in the last week" terribleness rule.
pub const MIN_FAIL_DAYS: i64 = 7;
/// Failure count threshold for the "N failures in the last week" rule.
pub const MAX_FAILURES: u32 = 10;

/// Bit-widths used as random strides while walking a table during
/// rejection-sampling selection (`select_peer`). These intentionally
/// mirror the reference implementation's constants rather than
/// `log2(bucket_count)`: a short stride still reaches every slot over
/// repeated random draws, it just does so less directly, and changing it
/// would silently change the selection distribution relative to the
/// ported algorithm.
pub const LOG_TRIED_BUCKET_COUNT_BITS: u32 = 3;
pub const LOG_NEW_BUCKET_COUNT_BITS: u32 = 10;
pub const LOG_BUCKET_SIZE_BITS: u32 = 6;

/// A sentinel meaning "no entry" in either bucket matrix.
pub const EMPTY_SLOT: i64 = -1;

/// A dense 2-D matrix of entry-id slots (`-1` = empty).
///
/// Flattened into a single `Vec<i64>` to avoid 1024/256 separate heap
/// allocations; `row * BUCKET_SIZE + col` addresses a slot.
#[derive(Debug, Clone)]
pub struct BucketMatrix {
    rows: usize,
    cols: usize,
    slots: Vec<i64>,
}

impl BucketMatrix {
    /// Build a matrix with the given number of rows, `BUCKET_SIZE` columns,
    /// all slots empty.
    pub fn new(rows: usize) -> Self {
        let cols = BUCKET_SIZE as usize;
        BucketMatrix {
            rows,
            cols,
            slots: vec![EMPTY_SLOT; rows * cols],
        }
    }

    fn index(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        row * self.cols + col
    }

    /// Id currently occupying `(row, col)`, if any.
    pub fn get(&self, row: usize, col: usize) -> Option<i64> {
        let v = self.slots[self.index(row, col)];
        if v == EMPTY_SLOT {
            None
        } else {
            Some(v)
        }
    }

    /// Place `id` at `(row, col)`, overwriting whatever was there.
    pub fn set(&mut self, row: usize, col: usize, id: i64) {
        let i = self.index(row, col);
        self.slots[i] = id;
    }

    /// Clear `(row, col)`.
    pub fn clear(&mut self, row: usize, col: usize) {
        let i = self.index(row, col);
        self.slots[i] = EMPTY_SLOT;
    }

    /// Number of rows (buckets) in this matrix.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns (slots per bucket) in this matrix.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Count of non-empty slots across the whole matrix.
    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|&&v| v != EMPTY_SLOT).count()
    }

    /// Number of occupied slots in a single row.
    pub fn row_occupied_count(&self, row: usize) -> usize {
        let start = row * self.cols;
        self.slots[start..start + self.cols]
            .iter()
            .filter(|&&v| v != EMPTY_SLOT)
            .count()
    }
}
