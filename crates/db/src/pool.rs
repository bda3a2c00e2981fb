//! Nested session pool
//!
//! Sessions opened toward peers on behalf of a distributed transaction are
//! pooled per URL. The construction capability is injected at process start;
//! the default factory resolves the URL against the process-wide database
//! registry and opens an in-process session, which is what embedded and test
//! deployments use. Released sessions have their parent link severed before
//! they return to the free list.

use crate::connection::ConnectionInfo;
use crate::database::DatabaseRegistry;
use crate::session::Session;
use crate::user::User;
use opal_common::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Capability to open a session for a connection URL
pub trait SessionFactory: Send + Sync {
    fn create(&self, parent: &Arc<Session>, info: &ConnectionInfo) -> Result<Arc<Session>>;
}

/// Default factory: resolve the database locally and open a participant
/// session for the parent's user
pub struct LocalSessionFactory;

impl SessionFactory for LocalSessionFactory {
    fn create(&self, parent: &Arc<Session>, info: &ConnectionInfo) -> Result<Arc<Session>> {
        let database = DatabaseRegistry::global().resolve(info)?;
        let session = database.create_session(User::new(parent.user().name()));
        session.set_connection_info(info.clone());
        session.set_root(false);
        Ok(session)
    }
}

/// Process-wide pool of nested sessions keyed by URL
pub struct SessionPool {
    factory: Mutex<Arc<dyn SessionFactory>>,
    idle: Mutex<HashMap<String, Vec<Arc<Session>>>>,
}

static POOL: OnceLock<SessionPool> = OnceLock::new();

impl SessionPool {
    /// The process-wide pool
    pub fn global() -> &'static SessionPool {
        POOL.get_or_init(|| SessionPool {
            factory: Mutex::new(Arc::new(LocalSessionFactory)),
            idle: Mutex::new(HashMap::new()),
        })
    }

    /// Install the session construction capability (process start)
    pub fn set_factory(&self, factory: Arc<dyn SessionFactory>) {
        *self.factory.lock() = factory;
    }

    /// Acquire a session for `url`, reusing an idle one when possible
    pub fn acquire(&self, parent: &Arc<Session>, url: &str) -> Result<Arc<Session>> {
        let pooled = {
            let mut idle = self.idle.lock();
            idle.get_mut(url).and_then(Vec::pop)
        };
        let session = match pooled {
            Some(session) if !session.is_closed() => session,
            _ => {
                let info = ConnectionInfo::parse(url)?;
                let factory = self.factory.lock().clone();
                factory.create(parent, &info)?
            }
        };
        session.set_parent(Some(parent));
        session.set_root(false);
        Ok(session)
    }

    /// Return a session to the pool; the parent link must already be severed
    pub fn release(&self, session: Arc<Session>) {
        if session.is_closed() {
            return;
        }
        session.set_parent(None);
        let Some(info) = session.connection_info() else {
            // not pool-constructed; nothing to return it to
            session.close();
            return;
        };
        self.idle
            .lock()
            .entry(info.url().to_string())
            .or_default()
            .push(session);
    }

    /// Idle sessions currently pooled for `url`
    pub fn idle_count(&self, url: &str) -> usize {
        self.idle.lock().get(url).map_or(0, Vec::len)
    }
}
