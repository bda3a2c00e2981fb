//! Cooperative session scheduler
//!
//! A pool of handler threads each owns a list of sessions. A handler picks a
//! session whose status is dispatchable, runs its yieldable command for one
//! quantum, and moves on; idle handlers park on a condvar with a short bound
//! so lock-wait timeouts keep being checked.

use crate::command::{TimeoutListener, YieldableCommand};
use crate::session::Session;
use crate::settings::HandlerFactoryType;
use opal_common::DbError;
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

/// How long an idle handler parks before rechecking timeouts
const IDLE_PARK: Duration = Duration::from_millis(1);

/// Wake signal a session sends to the handler that owns it
pub trait HandlerWake: Send + Sync {
    fn wake_up(&self);
}

struct DefaultTimeoutListener;

impl TimeoutListener for DefaultTimeoutListener {
    fn on_timeout(&self, command: &YieldableCommand, error: &DbError) {
        tracing::warn!(
            packet = command.packet_id(),
            session = command.session_id(),
            error = %error,
            "command timed out while waiting"
        );
    }
}

/// One handler: a worker thread with its own session list
pub struct SessionHandler {
    id: usize,
    self_weak: Weak<SessionHandler>,
    sessions: Mutex<Vec<Arc<Session>>>,
    load: AtomicU64,
    signal: Mutex<bool>,
    wake: Condvar,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandler {
    fn new(id: usize) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            id,
            self_weak: self_weak.clone(),
            sessions: Mutex::new(Vec::new()),
            load: AtomicU64::new(0),
            signal: Mutex::new(false),
            wake: Condvar::new(),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Pending work estimate used by the load-balancing strategy
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Acquire)
    }

    /// Adopt a session onto this handler
    pub fn add_session(&self, session: Arc<Session>) {
        session.set_handler(self.self_weak.clone() as Weak<dyn HandlerWake>);
        self.sessions.lock().push(session);
        self.load.fetch_add(1, Ordering::AcqRel);
        self.wake_up();
    }

    pub fn remove_session(&self, session_id: u64) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| s.id() != session_id);
        let removed = (before - sessions.len()) as u64;
        if removed > 0 {
            self.load.fetch_sub(removed, Ordering::AcqRel);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(handler) = self.self_weak.upgrade() else {
            return;
        };
        let thread = std::thread::Builder::new()
            .name(format!("session-handler-{}", self.id))
            .spawn(move || handler.run_loop())
            .ok();
        *self.thread.lock() = thread;
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.wake_up();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }

    fn run_loop(self: Arc<Self>) {
        tracing::debug!(handler = self.id, "session handler started");
        let timeout_listener = DefaultTimeoutListener;
        while self.running.load(Ordering::Acquire) {
            let dispatched = self.dispatch_once(&timeout_listener);
            if !dispatched {
                let mut signal = self.signal.lock();
                if !*signal {
                    let _ = self.wake.wait_for(&mut signal, IDLE_PARK);
                }
                *signal = false;
            }
        }
        tracing::debug!(handler = self.id, "session handler stopped");
    }

    /// Run one quantum of the first dispatchable session; returns whether
    /// anything ran
    fn dispatch_once(&self, timeout_listener: &dyn TimeoutListener) -> bool {
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock();
            sessions.retain(|s| !s.is_closed());
            sessions.clone()
        };
        let mut dispatched = false;
        for session in sessions {
            let Some(command) = session.yieldable_command(true, Some(timeout_listener)) else {
                continue;
            };
            dispatched = true;
            session.set_running_thread(Some(std::thread::current().id()));
            if let Err(error) = command.run() {
                session.handle_command_failure(&command, error);
            }
            session.set_running_thread(None);
        }
        dispatched
    }
}

impl HandlerWake for SessionHandler {
    fn wake_up(&self) {
        let mut signal = self.signal.lock();
        *signal = true;
        self.wake.notify_one();
    }
}

/// The handler pool plus the session-placement strategy
pub struct SessionScheduler {
    handlers: Vec<Arc<SessionHandler>>,
    strategy: HandlerFactoryType,
    next: AtomicUsize,
}

impl SessionScheduler {
    pub fn new(handler_count: usize, strategy: HandlerFactoryType) -> Arc<Self> {
        let handler_count = handler_count.max(1);
        let handlers = (0..handler_count).map(SessionHandler::new).collect();
        Arc::new(Self {
            handlers,
            strategy,
            next: AtomicUsize::new(0),
        })
    }

    pub fn handlers(&self) -> &[Arc<SessionHandler>] {
        &self.handlers
    }

    pub fn start(&self) {
        for handler in &self.handlers {
            handler.start();
        }
    }

    pub fn stop(&self) {
        for handler in &self.handlers {
            handler.stop();
        }
    }

    /// Place a session on a handler according to the strategy
    pub fn register(&self, session: Arc<Session>) -> Arc<SessionHandler> {
        let handler = self.select_handler();
        handler.add_session(session);
        handler
    }

    fn select_handler(&self) -> Arc<SessionHandler> {
        match self.strategy {
            HandlerFactoryType::RoundRobin => {
                let index = self.next.fetch_add(1, Ordering::AcqRel) % self.handlers.len();
                self.handlers[index].clone()
            }
            HandlerFactoryType::Random => {
                let index = rand::thread_rng().gen_range(0..self.handlers.len());
                self.handlers[index].clone()
            }
            HandlerFactoryType::LoadBalance => {
                let mut min_load = u64::MAX;
                let mut index = 0;
                for (i, handler) in self.handlers.iter().enumerate() {
                    let load = handler.load();
                    if load < min_load {
                        min_load = load;
                        index = i;
                    }
                }
                self.handlers[index].clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{Database, DatabaseRegistry};
    use crate::settings::DbSettings;
    use crate::statement::{SqlParser, SqlParserFactory};
    use crate::user::User;

    struct NoParserFactory;

    impl SqlParserFactory for NoParserFactory {
        fn create_parser(&self, _session: &Arc<Session>) -> Box<dyn SqlParser> {
            unreachable!("scheduler tests never parse")
        }
    }

    fn test_database(name: &str) -> Arc<Database> {
        let db = Database::new(name, DbSettings::default(), Arc::new(NoParserFactory));
        DatabaseRegistry::global().register(db.clone());
        db
    }

    #[test]
    fn test_round_robin_rotates() {
        let scheduler = SessionScheduler::new(3, HandlerFactoryType::RoundRobin);
        let db = test_database("sched_rr");
        let picked: Vec<usize> = (0..6)
            .map(|_| scheduler.register(db.create_session(User::new("u"))).id())
            .collect();
        assert_eq!(picked, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_load_balance_tracks_minimum() {
        let scheduler = SessionScheduler::new(3, HandlerFactoryType::LoadBalance);
        let db = test_database("sched_lb");

        // preload handlers 0 and 1 so handler 2 is the true minimum
        scheduler.handlers()[0].add_session(db.create_session(User::new("u")));
        scheduler.handlers()[0].add_session(db.create_session(User::new("u")));
        scheduler.handlers()[1].add_session(db.create_session(User::new("u")));

        let chosen = scheduler.register(db.create_session(User::new("u")));
        assert_eq!(chosen.id(), 2, "must pick the least-loaded handler");

        // now handler 1 and 2 tie at 1; the first minimum wins
        let chosen = scheduler.register(db.create_session(User::new("u")));
        assert_eq!(chosen.id(), 1);
    }

    #[test]
    fn test_random_stays_in_range() {
        let scheduler = SessionScheduler::new(2, HandlerFactoryType::Random);
        let db = test_database("sched_rand");
        for _ in 0..16 {
            let handler = scheduler.register(db.create_session(User::new("u")));
            assert!(handler.id() < 2);
        }
    }

    #[test]
    fn test_remove_session_updates_load() {
        let scheduler = SessionScheduler::new(1, HandlerFactoryType::RoundRobin);
        let db = test_database("sched_rm");
        let session = db.create_session(User::new("u"));
        let handler = scheduler.register(session.clone());
        assert_eq!(handler.load(), 1);
        handler.remove_session(session.id());
        assert_eq!(handler.load(), 0);
        assert_eq!(handler.session_count(), 0);
    }
}
