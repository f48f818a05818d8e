use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    io,
    rc::Rc,
    time::{Duration, Instant},
};
use mio::{event::Source, Events, Poll};

pub use mio::{Interest, Token};

use crate::{config::ReactorConfig, error::Result};

// A socket owner. Every registered token maps to one of these; the reactor
// dispatches readiness back through it.
pub trait Agent {
    fn on_readable(&mut self, reactor: &mut Reactor, token: Token) -> Result<()>;

    fn on_writable(&mut self, reactor: &mut Reactor, token: Token) -> Result<()>;

    // Error or hangup on the socket; the owner tears the socket down.
    fn on_error(&mut self, reactor: &mut Reactor, token: Token);
}

pub type Owner = Rc<RefCell<dyn Agent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct Timer {
    deadline: Instant,
    seq: u64,
    id: TimerId,
    callback: Box<dyn FnOnce(&mut Reactor)>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap surfaces the nearest deadline, ties broken by
    // schedule order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// Single-threaded event loop: owns the selector, the timer queue and the
// registered socket set. One iteration = select, dispatch I/O in ascending
// token order, run expired timers.
pub struct Reactor {
    poll: Poll,
    owners: HashMap<Token, Owner>,
    timers: BinaryHeap<Timer>,
    live_timers: HashSet<TimerId>,
    next_token: usize,
    next_timer: u64,
    next_seq: u64,
    stopped: bool,
    config: ReactorConfig,
}

impl Reactor {

    pub fn new(config: ReactorConfig) -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            owners: HashMap::new(),
            timers: BinaryHeap::new(),
            live_timers: HashSet::new(),
            next_token: 0,
            next_timer: 0,
            next_seq: 0,
            stopped: false,
            config,
        })
    }

    pub fn config(&self) -> &ReactorConfig {
        &self.config
    }

    pub fn register(&mut self, source: &mut dyn Source, interest: Interest, owner: Owner) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(source, token, interest)?;
        self.owners.insert(token, owner);
        Ok(token)
    }

    pub fn reregister(&mut self, source: &mut dyn Source, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    // Valid from within any handler; in-flight events for the token are
    // dropped on dispatch.
    pub fn deregister(&mut self, source: &mut dyn Source, token: Token) -> io::Result<()> {
        self.owners.remove(&token);
        self.poll.registry().deregister(source)
    }

    // Forgets a token whose socket is already gone.
    pub fn forget(&mut self, token: Token) {
        self.owners.remove(&token);
    }

    pub fn socket_count(&self) -> usize {
        self.owners.len()
    }

    // Single-fire timer; the callback runs on the reactor thread at timer
    // dispatch of the iteration in which the deadline expires.
    pub fn schedule(&mut self, delay: Duration, callback: impl FnOnce(&mut Reactor) + 'static) -> TimerId {
        let id = self.alloc_timer_id();
        self.push_timer(id, delay, Box::new(callback));
        id
    }

    // Single-fire underneath: the callback re-arms for another period by
    // returning true. The handle stays valid across re-arms.
    pub fn schedule_every(&mut self, period: Duration, callback: impl FnMut(&mut Reactor) -> bool + 'static) -> TimerId {
        let id = self.alloc_timer_id();
        self.arm_every(id, period, Box::new(callback));
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.live_timers.remove(&id);
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    // Runs until stop() or no sockets and no timers remain. Graceful exit
    // returns Ok; a fatal select error tears every registration down first.
    pub fn run(&mut self) -> Result<()> {
        self.stopped = false;
        while !self.stopped {
            if !self.run_once()? {
                break;
            }
        }
        Ok(())
    }

    // One iteration. Returns false when there is no work left.
    pub fn run_once(&mut self) -> Result<bool> {
        if self.owners.is_empty() && self.timers.is_empty() {
            return Ok(false);
        }

        let mut events = Events::with_capacity(self.config.events_capacity);
        match self.poll.poll(&mut events, Some(self.poll_timeout())) {
            Ok(()) => {}
            // Interruption is retryable; timers still get their pass.
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                self.run_timers();
                return Ok(true);
            }
            Err(e) => {
                tracing::error!("fatal poll error: {}", e);
                self.owners.clear();
                self.timers.clear();
                self.live_timers.clear();
                return Err(e.into());
            }
        }

        // Snapshot readiness so handlers may mutate the socket set freely.
        let mut ready: Vec<(Token, bool, bool, bool)> = events
            .iter()
            .map(|ev| (
                ev.token(),
                ev.is_error(),
                ev.is_readable() || ev.is_read_closed(),
                ev.is_writable(),
            ))
            .collect();
        ready.sort_by_key(|(token, ..)| token.0);

        for (token, error, readable, writable) in ready {
            let owner = match self.owners.get(&token) {
                Some(owner) => Rc::clone(owner),
                None => continue,
            };
            if error {
                owner.borrow_mut().on_error(self, token);
                continue;
            }
            if readable {
                // bind the result first: the agent borrow must be released
                // before the error path borrows it again
                let dispatched = owner.borrow_mut().on_readable(self, token);
                if let Err(e) = dispatched {
                    tracing::warn!("read dispatch failed on {:?}: {}", token, e);
                    owner.borrow_mut().on_error(self, token);
                    continue;
                }
            }
            if writable && self.owners.contains_key(&token) {
                let dispatched = owner.borrow_mut().on_writable(self, token);
                if let Err(e) = dispatched {
                    tracing::warn!("write dispatch failed on {:?}: {}", token, e);
                    owner.borrow_mut().on_error(self, token);
                }
            }
        }

        self.run_timers();
        Ok(true)
    }

    fn alloc_timer_id(&mut self) -> TimerId {
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        id
    }

    fn push_timer(&mut self, id: TimerId, delay: Duration, callback: Box<dyn FnOnce(&mut Reactor)>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live_timers.insert(id);
        self.timers.push(Timer {
            deadline: Instant::now() + delay,
            seq,
            id,
            callback,
        });
    }

    fn arm_every(&mut self, id: TimerId, period: Duration, mut callback: Box<dyn FnMut(&mut Reactor) -> bool>) {
        self.push_timer(id, period, Box::new(move |reactor: &mut Reactor| {
            if callback(reactor) {
                reactor.arm_every(id, period, callback);
            }
        }));
    }

    fn poll_timeout(&self) -> Duration {
        match self.timers.peek() {
            Some(timer) => self
                .config
                .poll_cap
                .min(timer.deadline.saturating_duration_since(Instant::now())),
            None => self.config.poll_cap,
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(timer) = self.timers.peek() {
            if timer.deadline > now {
                break;
            }
            // Min-heap pop order is (deadline, seq), which is run order.
            due.push(self.timers.pop().expect("peeked timer"));
        }
        for timer in due {
            // Lazily dropped if cancelled, including by an earlier timer in
            // this same pass.
            if !self.live_timers.remove(&timer.id) {
                continue;
            }
            (timer.callback)(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reactor() -> Reactor {
        Reactor::new(ReactorConfig {
            poll_cap: Duration::from_millis(20),
            ..ReactorConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_timers_fire_in_deadline_then_schedule_order() {
        let mut reactor = reactor();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        reactor.schedule(Duration::from_millis(5), move |_| s.borrow_mut().push("late"));
        let s = Rc::clone(&seen);
        reactor.schedule(Duration::ZERO, move |_| s.borrow_mut().push("first"));
        let s = Rc::clone(&seen);
        reactor.schedule(Duration::ZERO, move |_| s.borrow_mut().push("second"));

        reactor.run().unwrap();
        assert_eq!(*seen.borrow(), vec!["first", "second", "late"]);
    }

    #[test]
    fn test_cancelled_timer_does_not_fire() {
        let mut reactor = reactor();
        let fired = Rc::new(RefCell::new(false));

        let f = Rc::clone(&fired);
        let id = reactor.schedule(Duration::ZERO, move |_| *f.borrow_mut() = true);
        reactor.cancel(id);

        reactor.run().unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_timer_can_cancel_sibling_in_same_pass() {
        let mut reactor = reactor();
        let fired = Rc::new(RefCell::new(false));

        // Both timers are due in the same pass; the first cancels the second.
        let f = Rc::clone(&fired);
        let victim_holder = Rc::new(RefCell::new(None));
        let holder = Rc::clone(&victim_holder);
        reactor.schedule(Duration::ZERO, move |r| {
            if let Some(id) = *holder.borrow() {
                r.cancel(id);
            }
        });
        let id = reactor.schedule(Duration::ZERO, move |_| *f.borrow_mut() = true);
        *victim_holder.borrow_mut() = Some(id);

        reactor.run().unwrap();
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_schedule_every_rearms_until_false() {
        let mut reactor = reactor();
        let count = Rc::new(RefCell::new(0));

        let c = Rc::clone(&count);
        reactor.schedule_every(Duration::from_millis(1), move |_| {
            *c.borrow_mut() += 1;
            *c.borrow() < 3
        });

        reactor.run().unwrap();
        assert_eq!(*count.borrow(), 3);
    }

    #[test]
    fn test_run_returns_when_no_work_remains() {
        let mut reactor = reactor();
        reactor.run().unwrap();
        assert!(!reactor.run_once().unwrap());
    }

    #[test]
    fn test_stop_exits_after_current_iteration() {
        let mut reactor = reactor();
        reactor.schedule_every(Duration::from_millis(1), |r| {
            r.stop();
            true
        });
        reactor.run().unwrap();
        assert!(reactor.is_stopped());
    }
}
