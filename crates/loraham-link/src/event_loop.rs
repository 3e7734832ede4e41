//! Cooperative single-threaded event loop.
//!
//! [`EventLoop`] owns every [`LinkConnection`] and a [`Scheduler`] of
//! one-shot timers. Each [`run_once`](EventLoop::run_once) waits for socket
//! readiness no longer than the nearest timer deadline (capped by
//! `max_wait`), pumps the ready links, then fires every expired timer.
//! Timer callbacks receive `&mut EventLoop` and run on the loop's thread.

use std::collections::BTreeMap;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use loraham_core::error::{Error, Result};
use loraham_core::packet::Packet;

use crate::connection::{LinkConnection, LinkContext};

/// Index of a link within its [`EventLoop`].
pub type LinkId = usize;

/// A scheduled timer callback.
pub type Task = Box<dyn FnOnce(&mut EventLoop)>;

/// Default cap on a single readiness wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Handle to a scheduled timer, unique for the lifetime of its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// One-shot timers keyed by handle.
#[derive(Debug)]
pub struct Scheduler<T> {
    next_id: u64,
    tasks: BTreeMap<u64, (Instant, T)>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            tasks: BTreeMap::new(),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to fire once `delay` has elapsed.
    pub fn schedule(&mut self, task: T, delay: Duration) -> TimerHandle {
        self.schedule_at(task, Instant::now() + delay)
    }

    /// Schedule `task` to fire at `deadline`.
    pub fn schedule_at(&mut self, task: T, deadline: Instant) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.tasks.insert(id, (deadline, task));
        TimerHandle(id)
    }

    /// Remove a pending timer, returning its task.
    ///
    /// Fails with [`Error::UnknownTimer`] if the handle already fired, was
    /// already cancelled, or never existed.
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<T> {
        self.tasks
            .remove(&handle.0)
            .map(|(_, task)| task)
            .ok_or(Error::UnknownTimer(handle.0))
    }

    pub fn contains(&self, handle: TimerHandle) -> bool {
        self.tasks.contains_key(&handle.0)
    }

    /// Deadline of the nearest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks.values().map(|(deadline, _)| *deadline).min()
    }

    /// Remove and return every task due at or before `now`, earliest first.
    /// Timers sharing a deadline come out in scheduling order.
    pub fn take_expired(&mut self, now: Instant) -> Vec<T> {
        let mut due: Vec<(Instant, u64)> = self
            .tasks
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, (deadline, _))| (*deadline, *id))
            .collect();
        due.sort_unstable();
        due.into_iter()
            .filter_map(|(_, id)| self.tasks.remove(&id).map(|(_, task)| task))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// The harness run loop: links plus timers.
pub struct EventLoop {
    scheduler: Scheduler<Task>,
    links: Vec<LinkConnection>,
    max_wait: Duration,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        Self::with_max_wait(DEFAULT_MAX_WAIT)
    }

    /// A loop whose readiness wait never exceeds `max_wait`.
    pub fn with_max_wait(max_wait: Duration) -> Self {
        Self {
            scheduler: Scheduler::new(),
            links: Vec::new(),
            max_wait,
        }
    }

    /// Take ownership of a link and return its id.
    pub fn add_link(&mut self, mut link: LinkConnection) -> LinkId {
        let id = self.links.len();
        link.set_id(id);
        debug!(link = %link.name(), id, "link added to event loop");
        self.links.push(link);
        id
    }

    pub fn link(&self, id: LinkId) -> Option<&LinkConnection> {
        self.links.get(id)
    }

    pub fn link_mut(&mut self, id: LinkId) -> Option<&mut LinkConnection> {
        self.links.get_mut(id)
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkConnection> {
        self.links.iter()
    }

    /// Whether any link still has an open socket.
    pub fn has_open_links(&self) -> bool {
        self.links.iter().any(LinkConnection::is_open)
    }

    /// Number of pending timers.
    pub fn pending_timers(&self) -> usize {
        self.scheduler.len()
    }

    /// Schedule `f` to run on the loop after `delay`.
    pub fn schedule(
        &mut self,
        delay: Duration,
        f: impl FnOnce(&mut EventLoop) + 'static,
    ) -> TimerHandle {
        self.scheduler.schedule(Box::new(f), delay)
    }

    /// Cancel a timer scheduled earlier.
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<()> {
        self.scheduler.cancel(handle).map(drop)
    }

    /// Run `f` with a handler context bound to link `id`, as protocol
    /// handlers see it. Work `f` defers runs before this returns.
    pub fn with_link<R>(
        &mut self,
        id: LinkId,
        f: impl FnOnce(&mut LinkContext<'_>) -> R,
    ) -> Result<R> {
        let link = Self::known(&mut self.links, id)?;
        let mut ctx = link.context(&mut self.scheduler);
        let out = f(&mut ctx);
        ctx.finish();
        Ok(out)
    }

    /// Feed received bytes to link `id` as if read from its socket.
    pub fn feed(&mut self, id: LinkId, data: &[u8]) -> Result<()> {
        let link = Self::known(&mut self.links, id)?;
        link.feed(data, &mut self.scheduler);
        Ok(())
    }

    /// Dispatch an already decoded packet on link `id`.
    pub fn deliver(&mut self, id: LinkId, packet: &Packet) -> Result<()> {
        let link = Self::known(&mut self.links, id)?;
        link.dispatch(packet, &mut self.scheduler);
        Ok(())
    }

    fn known(links: &mut [LinkConnection], id: LinkId) -> Result<&mut LinkConnection> {
        links
            .get_mut(id)
            .ok_or_else(|| Error::InvalidParameter(format!("no link with id {id}")))
    }

    /// Route a timer expiry to the handler registered under `tag` on `link`.
    pub fn deliver_timeout(&mut self, link: LinkId, tag: &str, key: &str) {
        trace!(id = link, tag, key, "timer expired");
        if let Some(conn) = self.links.get_mut(link) {
            conn.deliver_timeout(tag, key, &mut self.scheduler);
        }
    }

    /// Fire every timer whose deadline has passed. Returns how many fired.
    ///
    /// Expired timers are all collected before any of them runs, so a
    /// callback that schedules a zero-delay timer does not see it fire in
    /// the same pass.
    pub fn fire_expired(&mut self) -> usize {
        let due = self.scheduler.take_expired(Instant::now());
        let fired = due.len();
        for task in due {
            task(self);
        }
        fired
    }

    /// One turn of the loop.
    ///
    /// Returns `false` without waiting when no link has an open socket.
    pub async fn run_once(&mut self) -> bool {
        let cap = Instant::now() + self.max_wait;
        self.turn(cap).await
    }

    /// Call [`run_once`](Self::run_once) until `done` holds.
    ///
    /// Returns whether `done` held, giving up once `limit` has elapsed or
    /// every link has closed.
    pub async fn run_until(
        &mut self,
        mut done: impl FnMut(&EventLoop) -> bool,
        limit: Duration,
    ) -> bool {
        let give_up = Instant::now() + limit;
        loop {
            if done(self) {
                return true;
            }
            if Instant::now() >= give_up {
                return false;
            }
            let cap = give_up.min(Instant::now() + self.max_wait);
            if !self.turn(cap).await {
                return done(self);
            }
        }
    }

    async fn turn(&mut self, cap: Instant) -> bool {
        if !self.has_open_links() {
            return false;
        }

        let deadline = self
            .scheduler
            .next_deadline()
            .map_or(cap, |next| next.min(cap));

        let links = &self.links;
        let ready = tokio::time::timeout_at(
            deadline,
            poll_fn(|cx| {
                let ready: Vec<_> = links
                    .iter()
                    .enumerate()
                    .filter_map(|(id, link)| link.poll_ready(cx).map(|r| (id, r)))
                    .collect();
                if ready.is_empty() {
                    Poll::Pending
                } else {
                    Poll::Ready(ready)
                }
            }),
        )
        .await
        .unwrap_or_default();

        for (id, readiness) in ready {
            let link = &mut self.links[id];
            if readiness.readable {
                link.pump_read(&mut self.scheduler);
            }
            if readiness.writable {
                link.pump_write();
            }
        }

        self.fire_expired();
        true
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("links", &self.links)
            .field("timers", &self.scheduler.len())
            .field("max_wait", &self.max_wait)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::connection::{LinkConfig, PacketReceiver};
    use crate::protocol::encode_packet_line;

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    #[test]
    fn handles_are_unique() {
        let mut s: Scheduler<u8> = Scheduler::new();
        let a = s.schedule(1, Duration::from_secs(1));
        let b = s.schedule(2, Duration::from_secs(1));
        s.cancel(a).unwrap();
        let c = s.schedule(3, Duration::from_secs(1));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn cancel_unknown_handle_is_error() {
        let mut s: Scheduler<u8> = Scheduler::new();
        let h = s.schedule(1, Duration::from_secs(1));
        assert_eq!(s.cancel(h).unwrap(), 1);
        assert!(matches!(s.cancel(h), Err(Error::UnknownTimer(id)) if id == h.id()));
        assert!(s.is_empty());
    }

    #[test]
    fn next_deadline_is_minimum() {
        let mut s: Scheduler<u8> = Scheduler::new();
        assert_eq!(s.next_deadline(), None);
        let now = Instant::now();
        s.schedule_at(1, now + Duration::from_secs(5));
        s.schedule_at(2, now + Duration::from_secs(2));
        assert_eq!(s.next_deadline(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn take_expired_in_deadline_order() {
        let mut s: Scheduler<&str> = Scheduler::new();
        let now = Instant::now();
        s.schedule_at("late", now + Duration::from_secs(3));
        s.schedule_at("second", now + Duration::from_secs(2));
        s.schedule_at("first", now + Duration::from_secs(1));
        s.schedule_at("tie", now + Duration::from_secs(2));
        s.schedule_at("future", now + Duration::from_secs(9));

        let due = s.take_expired(now + Duration::from_secs(3));
        assert_eq!(due, ["first", "second", "tie", "late"]);
        assert_eq!(s.len(), 1);
    }

    // -----------------------------------------------------------------------
    // Timers on the loop
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timers_fire_once_when_due() {
        let fired = Rc::new(RefCell::new(Vec::new()));
        let mut ev = EventLoop::new();

        let log = fired.clone();
        ev.schedule(Duration::from_secs(3), move |_| log.borrow_mut().push(3));
        let log = fired.clone();
        ev.schedule(Duration::from_secs(1), move |_| log.borrow_mut().push(1));

        assert_eq!(ev.fire_expired(), 0);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ev.fire_expired(), 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(ev.fire_expired(), 0);
        assert_eq!(*fired.borrow(), [1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let fired = Rc::new(RefCell::new(false));
        let mut ev = EventLoop::new();
        let flag = fired.clone();
        let h = ev.schedule(Duration::from_secs(1), move |_| *flag.borrow_mut() = true);
        ev.cancel(h).unwrap();
        assert!(ev.cancel(h).is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(ev.fire_expired(), 0);
        assert!(!*fired.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_scheduled_by_timer_waits_for_next_pass() {
        let count = Rc::new(RefCell::new(0));
        let mut ev = EventLoop::new();
        let c = count.clone();
        ev.schedule(Duration::from_secs(1), move |ev| {
            *c.borrow_mut() += 1;
            let c = c.clone();
            ev.schedule(Duration::ZERO, move |_| *c.borrow_mut() += 1);
        });

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(*count.borrow(), 1);
        assert_eq!(ev.fire_expired(), 1);
        assert_eq!(*count.borrow(), 2);
    }

    struct TimeoutRecorder(Rc<RefCell<Vec<String>>>);

    impl PacketReceiver for TimeoutRecorder {
        fn receive(&mut self, _packet: &Packet, _ctx: &mut LinkContext<'_>) {}

        fn timeout(&mut self, key: &str, ctx: &mut LinkContext<'_>) {
            self.0.borrow_mut().push(key.to_string());
            ctx.send("retry");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_reaches_handler() {
        let keys = Rc::new(RefCell::new(Vec::new()));
        let mut ev = EventLoop::new();
        let mut link = LinkConnection::detached("client");
        link.add_protocol_handler(
            &["PONG"],
            Rc::new(RefCell::new(TimeoutRecorder(keys.clone()))),
        );
        let id = ev.add_link(link);

        ev.with_link(id, |ctx| ctx.arm("PONG", "B", Duration::from_secs(10)))
            .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(ev.fire_expired(), 1);

        assert_eq!(*keys.borrow(), ["B"]);
        assert_eq!(ev.link(id).unwrap().pending_output(), b"retry");
    }

    #[test]
    fn with_link_unknown_id() {
        let mut ev = EventLoop::new();
        assert!(matches!(
            ev.with_link(3, |_| ()),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            ev.feed(3, b"x"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            ev.deliver(3, &Packet::default()),
            Err(Error::InvalidParameter(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Sockets
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn run_once_without_open_links_returns_false() {
        let mut ev = EventLoop::new();
        assert!(!ev.run_once().await);
        ev.add_link(LinkConnection::detached("client"));
        assert!(!ev.run_once().await);
    }

    #[derive(Default)]
    struct Packets(Vec<Packet>);

    impl PacketReceiver for Packets {
        fn receive(&mut self, packet: &Packet, _ctx: &mut LinkContext<'_>) {
            self.0.push(packet.clone());
        }

        fn timeout(&mut self, _key: &str, _ctx: &mut LinkContext<'_>) {}
    }

    #[tokio::test]
    async fn socket_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let mut link = LinkConnection::connect("client", &addr, LinkConfig::default())
            .await
            .unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        let rec = Rc::new(RefCell::new(Packets::default()));
        link.add_protocol_handler(&["PONG"], rec.clone());
        link.enter_tnc_mode();

        let mut ev = EventLoop::with_max_wait(Duration::from_millis(200));
        let id = ev.add_link(link);

        // Outbound.
        assert!(
            ev.run_until(|ev| !ev.link(id).unwrap().wants_write(), Duration::from_secs(5))
                .await
        );
        let mut buf = [0u8; 6];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\r!tnc\r");

        // Inbound.
        server
            .write_all(&encode_packet_line(-40.0, b"A<B:PONG hi"))
            .await
            .unwrap();
        let got = rec.clone();
        assert!(
            ev.run_until(move |_| !got.borrow().0.is_empty(), Duration::from_secs(5))
                .await
        );
        assert_eq!(rec.borrow().0[0].message, b"hi");

        // Peer hangs up.
        drop(server);
        assert!(ev.run_until(|ev| !ev.has_open_links(), Duration::from_secs(5)).await);
        assert!(!ev.run_once().await);
    }

    #[tokio::test]
    async fn run_once_wakes_for_timer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let link = LinkConnection::connect("client", &addr, LinkConfig::default())
            .await
            .unwrap();
        let (_server, _) = listener.accept().await.unwrap();

        let mut ev = EventLoop::new();
        ev.add_link(link);
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        ev.schedule(Duration::from_millis(20), move |_| *flag.borrow_mut() = true);

        let started = Instant::now();
        while !*fired.borrow() {
            assert!(ev.run_once().await);
        }
        // Woke for the timer, not the 60 second cap.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ev.pending_timers(), 0);
    }
}
