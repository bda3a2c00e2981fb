//! Values stored in rows and session variables

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// State of a large object behind a [`LobHandle`]
#[derive(Debug, Default)]
struct LobState {
    linked: bool,
    closed: bool,
    unlink_count: u32,
    close_count: u32,
    table_id: i32,
}

/// Handle to a large object
///
/// LOBs are linked to an owning table (or the session-variable pseudo
/// table) while referenced, unlinked when the reference is dropped, and
/// closed exactly once afterwards.
#[derive(Debug)]
pub struct LobHandle {
    id: u64,
    state: Mutex<LobState>,
}

impl LobHandle {
    pub fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(LobState::default()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Link this LOB to the given owner table
    pub fn link(&self, table_id: i32) {
        let mut state = self.state.lock();
        state.linked = true;
        state.table_id = table_id;
    }

    /// Unlink this LOB from its owner
    pub fn unlink(&self) {
        let mut state = self.state.lock();
        state.linked = false;
        state.unlink_count += 1;
    }

    /// Release the LOB's backing resources
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.close_count += 1;
    }

    pub fn is_linked(&self) -> bool {
        self.state.lock().linked
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// How many times `unlink` ran (observability for lifetime checks)
    pub fn unlink_count(&self) -> u32 {
        self.state.lock().unlink_count
    }

    /// How many times `close` ran
    pub fn close_count(&self) -> u32 {
        self.state.lock().close_count
    }
}

/// A database value
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Text(String),
    Lob(Arc<LobHandle>),
}

impl Value {
    /// Whether this is the NULL value
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Link a contained LOB to the given owner table; other values pass through
    pub fn link(&self, table_id: i32) {
        if let Value::Lob(lob) = self {
            lob.link(table_id);
        }
    }

    /// Unlink a contained LOB
    pub fn unlink(&self) {
        if let Value::Lob(lob) = self {
            lob.unlink();
        }
    }

    /// Close a contained LOB
    pub fn close(&self) {
        if let Value::Lob(lob) = self {
            lob.close();
        }
    }

    /// Whether this value holds a linked LOB
    pub fn is_linked(&self) -> bool {
        match self {
            Value::Lob(lob) => lob.is_linked(),
            _ => false,
        }
    }

    /// Interpret as i64 where possible
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Lob(a), Value::Lob(b)) => a.id == b.id,
            // numeric widening between INT and BIGINT
            (Value::Int(a), Value::Long(b)) | (Value::Long(b), Value::Int(a)) => {
                i64::from(*a) == *b
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
            Value::Lob(lob) => write!(f, "lob-{}", lob.id()),
        }
    }
}
