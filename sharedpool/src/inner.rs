use std::cmp::{max, min};
use std::fmt;
use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::spawn;
use tokio::time::{interval_at, sleep, timeout, Interval};
use tracing::{debug, warn};

use crate::api::{Builder, ConnectionState, ManageConnection, PooledConnection, State};
use crate::internals::{Approval, ApprovalIter, Conn, SharedPool};
use crate::Error;

pub(crate) struct PoolInner<M>
where
    M: ManageConnection + Send,
{
    inner: Arc<SharedPool<M>>,
}

impl<M> PoolInner<M>
where
    M: ManageConnection + Send,
{
    pub(crate) fn new(builder: Builder, manager: M) -> Self {
        let inner = Arc::new(SharedPool::new(builder, manager));

        if let Some(idle_timeout) = inner.statics.idle_timeout {
            let s = Arc::downgrade(&inner);
            let reaper_rate = min(inner.statics.reaper_rate, idle_timeout);
            let start = tokio::time::Instant::now() + reaper_rate;
            let interval = interval_at(start, reaper_rate);
            schedule_reaping(interval, s);
        }

        Self { inner }
    }

    pub(crate) fn spawn_start_connections(&self) {
        let approvals = self.inner.internals.lock().initial(&self.inner.statics);
        self.spawn_replenishing_approvals(approvals);
    }

    pub(crate) async fn start_connections(&self) -> Result<(), Error> {
        let approvals = self.inner.internals.lock().initial(&self.inner.statics);
        let mut stream = self.replenish_idle_connections(approvals);
        while let Some(result) = stream.next().await {
            result?;
        }
        Ok(())
    }

    fn spawn_replenishing_approvals(&self, approvals: ApprovalIter) {
        if approvals.len() == 0 {
            return;
        }

        let this = self.clone();
        spawn(async move {
            let mut stream = this.replenish_idle_connections(approvals);
            while let Some(result) = stream.next().await {
                if let Err(e) = result {
                    warn!(error = %e, "failed to replenish pool connection");
                }
            }
        });
    }

    fn replenish_idle_connections(
        &self,
        approvals: ApprovalIter,
    ) -> FuturesUnordered<impl Future<Output = Result<(), Error>>> {
        let stream = FuturesUnordered::new();
        for approval in approvals {
            let this = self.clone();
            stream.push(async move { this.add_connection_with_backoff(approval).await });
        }
        stream
    }

    pub(crate) async fn get(&self) -> Result<PooledConnection<M>, Error> {
        self.get_timeout(self.inner.statics.connection_timeout).await
    }

    pub(crate) async fn get_timeout(&self, wait: Duration) -> Result<PooledConnection<M>, Error> {
        let future = async {
            loop {
                // Registered before looking at the pool, so a close or a
                // returned connection in between still wakes us.
                let mut notified = pin!(self.inner.notify.notified());
                notified.as_mut().enable();

                let Some((conn, mut approvals)) = self.inner.pop() else {
                    return Err(Error::AlreadyClosed);
                };
                let mut conn = match conn {
                    Some(conn) => {
                        self.spawn_replenishing_approvals(approvals);
                        PooledConnection::new(self.clone(), conn)
                    }
                    None => {
                        match approvals.next() {
                            // Open the connection on a separate task, so that it
                            // still lands in the pool if this checkout times out.
                            Some(approval) => {
                                let this = self.clone();
                                match spawn(async move { this.add_connection(approval).await })
                                    .await
                                {
                                    Ok(Ok(())) => {}
                                    Ok(Err(e)) => return Err(e),
                                    Err(e) => return Err(Error::driver(e)),
                                }
                            }
                            None => notified.await,
                        }
                        continue;
                    }
                };

                if !self.inner.statics.test_on_check_out {
                    return Ok(conn);
                }

                match self.inner.manager.is_valid(&mut *conn).await {
                    Ok(()) => return Ok(conn),
                    Err(e) => {
                        warn!(error = %e, "discarding connection that failed validation");
                        conn.state = ConnectionState::Invalid;
                        continue;
                    }
                }
            }
        };

        match timeout(wait, future).await {
            Ok(result) => result,
            Err(_) => Err(Error::TimedOut),
        }
    }

    pub(crate) fn put_back(&self, mut conn: Conn<M::Connection>, state: ConnectionState) {
        let is_broken = self.inner.manager.has_broken(&mut conn.conn);
        let mut locked = self.inner.internals.lock();
        if state == ConnectionState::Present && !is_broken {
            locked.put(conn, None, &self.inner.notify);
            return;
        }

        let approvals = locked.dropped(1, &self.inner.statics);
        drop(locked);
        drop(conn);
        self.spawn_replenishing_approvals(approvals);
        // A slot was freed; let a waiter open a replacement.
        self.inner.notify.notify_one();
    }

    /// Returns information about the current state of the pool.
    pub(crate) fn state(&self) -> State {
        self.inner.internals.lock().state()
    }

    pub(crate) fn close(&self) {
        let idle = self.inner.internals.lock().close();
        debug!(dropped = idle.len(), "closing pool");
        drop(idle);
        self.inner.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.internals.lock().is_closed()
    }

    fn reap(&self) {
        let approvals = self.inner.reap();
        self.spawn_replenishing_approvals(approvals);
    }

    pub(crate) async fn connect(&self) -> Result<M::Connection, Error> {
        self.inner.manager.connect().await.map_err(Error::driver)
    }

    /// Opens one connection, giving up after the first failure.
    async fn add_connection(&self, approval: Approval) -> Result<(), Error> {
        match self.inner.manager.connect().await {
            Ok(conn) => {
                let conn = Conn::new(conn);
                self.inner
                    .internals
                    .lock()
                    .put(conn, Some(approval), &self.inner.notify);
                Ok(())
            }
            Err(e) => {
                self.inner.internals.lock().connect_failed(approval);
                self.inner.notify.notify_one();
                Err(Error::driver(e))
            }
        }
    }

    /// Opens one connection, retrying with backoff until the connection
    /// timeout has elapsed.
    async fn add_connection_with_backoff(&self, approval: Approval) -> Result<(), Error> {
        let start = Instant::now();
        let mut delay = Duration::from_secs(0);
        loop {
            match self.inner.manager.connect().await {
                Ok(conn) => {
                    let conn = Conn::new(conn);
                    self.inner
                        .internals
                        .lock()
                        .put(conn, Some(approval), &self.inner.notify);
                    return Ok(());
                }
                Err(e) => {
                    if start.elapsed() > self.inner.statics.connection_timeout
                        || self.is_closed()
                    {
                        self.inner.internals.lock().connect_failed(approval);
                        return Err(Error::driver(e));
                    }

                    debug!(error = %e, ?delay, "connection attempt failed, retrying");
                    delay = max(Duration::from_millis(200), delay);
                    delay = min(self.inner.statics.connection_timeout / 2, delay * 2);
                    sleep(delay).await;
                }
            }
        }
    }
}

impl<M> Clone for PoolInner<M>
where
    M: ManageConnection,
{
    fn clone(&self) -> Self {
        PoolInner {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for PoolInner<M>
where
    M: ManageConnection,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("PoolInner({:p})", self.inner))
    }
}

fn schedule_reaping<M>(mut interval: Interval, weak_shared: Weak<SharedPool<M>>)
where
    M: ManageConnection,
{
    spawn(async move {
        loop {
            let _ = interval.tick().await;
            let Some(inner) = weak_shared.upgrade() else {
                break;
            };
            let pool = PoolInner { inner };
            if pool.is_closed() {
                break;
            }
            pool.reap();
        }
    });
}
