use std::cmp::min;
use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::Notify;

use crate::api::{Builder, ManageConnection};
use crate::lock::Mutex;

/// The guts of a `Pool`.
#[allow(missing_debug_implementations)]
pub(crate) struct SharedPool<M>
where
    M: ManageConnection + Send,
{
    pub(crate) statics: Builder,
    pub(crate) manager: M,
    pub(crate) internals: Mutex<PoolInternals<M>>,
    pub(crate) notify: Notify,
}

impl<M> SharedPool<M>
where
    M: ManageConnection + Send,
{
    pub(crate) fn new(statics: Builder, manager: M) -> Self {
        Self {
            statics,
            manager,
            internals: Mutex::new(PoolInternals::default()),
            notify: Notify::new(),
        }
    }

    /// Takes an idle connection if there is one. Without one, approves a
    /// single new connection if the pool has room for it.
    pub(crate) fn pop(&self) -> Option<(Option<Conn<M::Connection>>, ApprovalIter)> {
        let mut locked = self.internals.lock();
        if locked.closed {
            return None;
        }

        let conn = locked.conns.pop_front().map(Conn::from);
        let approvals = match &conn {
            Some(_) => locked.wanted(&self.statics),
            None => locked.approvals(&self.statics, 1),
        };

        Some((conn, approvals))
    }

    pub(crate) fn reap(&self) -> ApprovalIter {
        let mut locked = self.internals.lock();
        locked.reap(&self.statics)
    }
}

/// The pool data that must be protected by a lock.
#[allow(missing_debug_implementations)]
pub(crate) struct PoolInternals<M>
where
    M: ManageConnection,
{
    conns: VecDeque<IdleConn<M::Connection>>,
    num_conns: u32,
    pending_conns: u32,
    closed: bool,
}

impl<M> PoolInternals<M>
where
    M: ManageConnection,
{
    pub(crate) fn put(
        &mut self,
        conn: Conn<M::Connection>,
        approval: Option<Approval>,
        notify: &Notify,
    ) {
        if approval.is_some() {
            self.pending_conns -= 1;
            self.num_conns += 1;
        }

        if self.closed {
            self.num_conns -= 1;
            return;
        }

        self.conns.push_back(IdleConn::from(conn));
        notify.notify_one();
    }

    pub(crate) fn connect_failed(&mut self, _: Approval) {
        self.pending_conns -= 1;
    }

    pub(crate) fn dropped(&mut self, num: u32, config: &Builder) -> ApprovalIter {
        self.num_conns -= num;
        self.wanted(config)
    }

    pub(crate) fn wanted(&mut self, config: &Builder) -> ApprovalIter {
        let available = self.conns.len() as u32 + self.pending_conns;
        let min_idle = config.min_idle.unwrap_or(0);
        let wanted = min_idle.saturating_sub(available);
        self.approvals(config, wanted)
    }

    /// Approvals for the connections a freshly built pool opens.
    pub(crate) fn initial(&mut self, config: &Builder) -> ApprovalIter {
        let wanted = config.initial_size.max(config.min_idle.unwrap_or(0));
        self.approvals(config, wanted)
    }

    fn approvals(&mut self, config: &Builder, num: u32) -> ApprovalIter {
        if self.closed {
            return ApprovalIter { num: 0 };
        }

        let current = self.num_conns + self.pending_conns;
        let allowed = config.max_size.saturating_sub(current);
        let num = min(num, allowed);
        self.pending_conns += num;
        ApprovalIter { num: num as usize }
    }

    pub(crate) fn reap(&mut self, config: &Builder) -> ApprovalIter {
        let now = Instant::now();
        let before = self.conns.len();

        if let Some(timeout) = config.idle_timeout {
            self.conns.retain(|conn| now - conn.idle_start < timeout);
        }

        self.dropped((before - self.conns.len()) as u32, config)
    }

    /// Marks the pool closed and hands back the idle connections so they can
    /// be dropped outside the lock.
    pub(crate) fn close(&mut self) -> Vec<M::Connection> {
        self.closed = true;
        let idle: Vec<_> = self.conns.drain(..).map(|idle| idle.conn.conn).collect();
        self.num_conns -= idle.len() as u32;
        idle
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn state(&self) -> State {
        State {
            connections: self.num_conns,
            idle_connections: self.conns.len() as u32,
            pending_connections: self.pending_conns,
            closed: self.closed,
        }
    }
}

impl<M> Default for PoolInternals<M>
where
    M: ManageConnection,
{
    fn default() -> Self {
        Self {
            conns: VecDeque::new(),
            num_conns: 0,
            pending_conns: 0,
            closed: false,
        }
    }
}

#[must_use]
pub(crate) struct ApprovalIter {
    num: usize,
}

impl Iterator for ApprovalIter {
    type Item = Approval;

    fn next(&mut self) -> Option<Self::Item> {
        match self.num {
            0 => None,
            _ => {
                self.num -= 1;
                Some(Approval { _priv: () })
            }
        }
    }
}

impl ExactSizeIterator for ApprovalIter {
    fn len(&self) -> usize {
        self.num
    }
}

/// Permission to open one connection, counted in `pending_conns` until it is
/// either put into the pool or reported as failed.
#[must_use]
pub(crate) struct Approval {
    _priv: (),
}

#[derive(Debug)]
pub(crate) struct Conn<C>
where
    C: Send,
{
    pub(crate) conn: C,
}

impl<C: Send> Conn<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self { conn }
    }
}

impl<C: Send> From<IdleConn<C>> for Conn<C> {
    fn from(conn: IdleConn<C>) -> Self {
        conn.conn
    }
}

struct IdleConn<C>
where
    C: Send,
{
    conn: Conn<C>,
    idle_start: Instant,
}

impl<C: Send> From<Conn<C>> for IdleConn<C> {
    fn from(conn: Conn<C>) -> Self {
        IdleConn {
            conn,
            idle_start: Instant::now(),
        }
    }
}

/// Information about the state of a `Pool`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct State {
    /// The number of connections currently being managed by the pool.
    pub connections: u32,
    /// The number of idle connections.
    pub idle_connections: u32,
    /// The number of connections being opened.
    pub pending_connections: u32,
    /// Whether the pool has been closed.
    pub closed: bool,
}
