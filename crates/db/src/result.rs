//! In-memory query results

use opal_engine::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cursor handle the session must close at commit
pub trait TemporaryResult: Send + Sync {
    /// Whether the handle holds resources that need closing
    fn needs_close(&self) -> bool;

    fn close(&self);
}

/// A fully materialized query result
#[derive(Debug)]
pub struct LocalResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    cursor: Mutex<usize>,
    needs_close: bool,
    closed: AtomicBool,
}

impl LocalResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows,
            cursor: Mutex::new(0),
            needs_close: false,
            closed: AtomicBool::new(false),
        }
    }

    /// A result backed by external resources (temporary files, cursors)
    pub fn with_close_needed(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            needs_close: true,
            ..Self::new(columns, rows)
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Fetch the next row, advancing the cursor
    pub fn next_row(&self) -> Option<&[Value]> {
        let mut cursor = self.cursor.lock();
        let row = self.rows.get(*cursor)?;
        *cursor += 1;
        Some(row.as_slice())
    }

    /// Rewind the cursor to the first row
    pub fn reset(&self) {
        *self.cursor.lock() = 0;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl TemporaryResult for LocalResult {
    fn needs_close(&self) -> bool {
        self.needs_close
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_iteration() {
        let result = LocalResult::new(
            vec!["f1".to_string()],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        assert_eq!(result.row_count(), 2);
        assert_eq!(result.next_row(), Some(&[Value::Int(1)][..]));
        assert_eq!(result.next_row(), Some(&[Value::Int(2)][..]));
        assert_eq!(result.next_row(), None);
        result.reset();
        assert_eq!(result.next_row(), Some(&[Value::Int(1)][..]));
    }

    #[test]
    fn test_close_flags() {
        let plain = LocalResult::new(vec![], vec![]);
        assert!(!plain.needs_close());

        let external = LocalResult::with_close_needed(vec![], vec![]);
        assert!(external.needs_close());
        external.close();
        assert!(external.is_closed());
    }
}
