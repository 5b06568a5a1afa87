//! A single-threaded, cooperative, stackful coroutine engine with byte
//! channels.
//!
//! Coroutines run one at a time on their own stacks (see [`crate::stack`])
//! and give up control only at explicit points: [`Engine::yield_now`],
//! [`Engine::sched`], or a channel operation that cannot finish at once.
//! Context switching uses the `ucontext` primitives, so suspending a
//! coroutine saves its registers and resuming jumps straight back into
//! the frame that suspended.
//!
//! The engine tracks who resumed whom: scheduling a target records the
//! scheduler as the target's *caller*, and a bare yield returns control
//! to the caller first. The reverse edge, the *callee*, is followed to
//! its live leaf when an ancestor is scheduled directly, so control always
//! lands on the coroutine that actually suspended last in a chain.
//!
//! Channels move raw bytes through a bounded ring. Writers and readers
//! queue FIFO per side; only the task at the head of its queue moves
//! bytes, everyone behind it defers to the head. A coroutine whose task
//! cannot finish hands control to the opposite side's head (who can make
//! room or produce data) or yields if that side is empty. When every live
//! coroutine is blocked and no channel can move a byte, the engine
//! reports deadlock.
//!
//! All engine state lives behind a cheaply clonable [`Engine`] handle, and
//! coroutines are addressed by [`CoroId`]s that are never reused, so a
//! stale caller/callee edge is detected by lookup failure instead of a
//! dangling pointer.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use log::{debug, trace};
use thiserror::Error;

use crate::stack::{CoroStack, StackError, DEFAULT_STACK_SIZE};

/// Identifies a coroutine. Ids are unique for the lifetime of an engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoroId(u64);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("deadlock: every live coroutine is blocked on a channel")]
    Deadlock,
    #[error("channel {0} already exists")]
    ChannelExists(u64),
    #[error("channel {0} does not exist")]
    UnknownChannel(u64),
    #[error("channel {id} closed with {writers} pending writers and {readers} pending readers")]
    ChannelBusy { id: u64, writers: usize, readers: usize },
    #[error("start called while the engine is already running")]
    NestedStart,
    #[error("coroutines can only be spawned while the engine is running")]
    NotStarted,
    #[error("channel transfers require a running coroutine")]
    OutsideCoroutine,
    #[error(transparent)]
    Stack(#[from] StackError),
}

type EntryFn = Box<dyn FnOnce(Engine)>;

struct Context {
    uc: libc::ucontext_t,
    /// Keeps the stack mapping alive as long as the context.
    _stack: CoroStack,
    /// Who resumed this coroutine most recently.
    caller: Option<CoroId>,
    /// Whom this coroutine most recently transferred control to.
    callee: Option<CoroId>,
    /// The channel this coroutine is blocked on, if any.
    awaiting: Option<u64>,
    /// The body, consumed by the trampoline on first activation.
    entry: Option<EntryFn>,
}

struct Waiter {
    owner: CoroId,
    remaining: usize,
}

struct Channel {
    cap: usize,
    buf: VecDeque<u8>,
    writers: VecDeque<Waiter>,
    readers: VecDeque<Waiter>,
}

impl Channel {
    /// True when some queued task could move at least one byte right now:
    /// a reader with buffered data, or a writer with ring space left.
    fn can_progress(&self) -> bool {
        (!self.readers.is_empty() && !self.buf.is_empty())
            || (!self.writers.is_empty() && self.buf.len() < self.cap)
    }
}

struct Inner {
    contexts: HashMap<CoroId, Box<Context>>,
    /// All live coroutines in scheduling order, newest first.
    running: Vec<CoroId>,
    current: Option<CoroId>,
    /// The saved context of the `start` caller; where control goes when
    /// nothing is left to run.
    idle: Option<Box<libc::ucontext_t>>,
    channels: HashMap<u64, Channel>,
    /// Finished contexts whose stacks cannot be unmapped from their own
    /// stack; the next coroutine to regain control frees them.
    graveyard: Vec<Box<Context>>,
    next_id: u64,
    active: bool,
    /// First panic out of a coroutine body, re-raised by `start`.
    panic: Option<Box<dyn Any + Send>>,
    /// Fatal condition discovered where no caller could receive it.
    fatal: Option<EngineError>,
}

impl Inner {
    fn alive(&self, id: CoroId) -> bool {
        self.contexts.contains_key(&id)
    }

    fn blocked(&self, id: CoroId) -> bool {
        self.contexts[&id].awaiting.is_some()
    }

    /// Whether any queued channel task could move at least one byte.
    fn any_channel_can_progress(&self) -> bool {
        self.channels.values().any(Channel::can_progress)
    }

    fn channel_can_progress(&self, id: u64) -> bool {
        self.channels.get(&id).map_or(false, Channel::can_progress)
    }

    /// Deadlock means: live coroutines exist, every one of them is
    /// blocked on a channel, and no channel can move a byte. The last
    /// clause keeps the two ends of an in-flight transfer, which are both
    /// briefly queued, from counting as deadlocked.
    fn check_deadlock(&self) -> Result<(), EngineError> {
        if self.running.is_empty() {
            return Ok(());
        }
        if self.running.iter().any(|&id| !self.blocked(id)) {
            return Ok(());
        }
        if self.any_channel_can_progress() {
            return Ok(());
        }
        Err(EngineError::Deadlock)
    }

    /// Follows the callee chain from `id` to its deepest live member,
    /// dropping stale edges along the way. Control must resume the leaf
    /// of a chain, never an ancestor.
    fn descend_callee(&mut self, mut id: CoroId) -> CoroId {
        let mut hops = 0;
        loop {
            hops += 1;
            debug_assert!(hops <= self.contexts.len() + 1, "callee cycle");
            match self.contexts[&id].callee {
                Some(callee) if self.alive(callee) && hops <= self.contexts.len() => id = callee,
                Some(_) => {
                    if let Some(ctx) = self.contexts.get_mut(&id) {
                        ctx.callee = None;
                    }
                    return id;
                }
                None => return id,
            }
        }
    }
}

thread_local! {
    /// Hand-off slot for a fresh coroutine's first activation: the engine
    /// (as a raw `Rc`) and the coroutine id, parked here across the
    /// context switch into the trampoline.
    static TRAMPOLINE_ARGS: Cell<Option<(*const RefCell<Inner>, u64)>> = const { Cell::new(None) };
}

/// The coroutine engine. Cloning is cheap and every clone drives the same
/// engine; coroutine bodies receive their own clone.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<RefCell<Inner>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Engine {
        Engine {
            inner: Rc::new(RefCell::new(Inner {
                contexts: HashMap::new(),
                running: Vec::new(),
                current: None,
                idle: None,
                channels: HashMap::new(),
                graveyard: Vec::new(),
                next_id: 0,
                active: false,
                panic: None,
                fatal: None,
            })),
        }
    }

    /// Runs `main` as the first coroutine and returns once every
    /// coroutine has finished.
    ///
    /// Must not be called re-entrantly. A panic in any coroutine body is
    /// re-raised here after the remaining coroutines have run; a fatal
    /// condition found when no coroutine could receive it (deadlock
    /// discovered as the last runnable coroutine exits) is returned as an
    /// error.
    pub fn start<F>(&self, main: F) -> Result<(), EngineError>
    where
        F: FnOnce(Engine) + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.active {
                return Err(EngineError::NestedStart);
            }
            inner.active = true;
            inner.idle = Some(Box::new(unsafe { std::mem::zeroed() }));
        }

        let result = self
            .spawn(main)
            .and_then(|main_id| self.sched(Some(main_id)));

        let (panicked, fatal) = {
            let mut inner = self.inner.borrow_mut();
            inner.active = false;
            inner.idle = None;
            inner.current = None;
            inner.graveyard.clear();
            // Suspended frames of leftover coroutines are discarded, not
            // unwound; their stacks are unmapped here, and any channel
            // tasks they left queued go with them.
            inner.running.clear();
            inner.contexts.clear();
            for ch in inner.channels.values_mut() {
                ch.writers.clear();
                ch.readers.clear();
            }
            (inner.panic.take(), inner.fatal.take())
        };

        if let Some(payload) = panicked {
            panic::resume_unwind(payload);
        }
        if let Some(err) = fatal {
            return Err(err);
        }
        result
    }

    /// Registers a new coroutine and returns its id. The body does not
    /// run until the coroutine is scheduled.
    pub fn spawn<F>(&self, f: F) -> Result<CoroId, EngineError>
    where
        F: FnOnce(Engine) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        if !inner.active {
            return Err(EngineError::NotStarted);
        }

        let stack = CoroStack::new(DEFAULT_STACK_SIZE)?;
        let id = CoroId(inner.next_id);
        inner.next_id += 1;

        let mut ctx = Box::new(Context {
            uc: unsafe { std::mem::zeroed() },
            _stack: stack,
            caller: inner.current,
            callee: None,
            awaiting: None,
            entry: Some(Box::new(f)),
        });

        // The ucontext is prepared in its final home inside the box, so
        // nothing makecontext records can go stale.
        unsafe {
            if libc::getcontext(&mut ctx.uc) != 0 {
                return Err(StackError::os("getcontext").into());
            }
            let (sp, len) = ctx._stack.usable();
            ctx.uc.uc_stack.ss_sp = sp as *mut libc::c_void;
            ctx.uc.uc_stack.ss_size = len;
            ctx.uc.uc_stack.ss_flags = 0;
            ctx.uc.uc_link = std::ptr::null_mut();
            libc::makecontext(&mut ctx.uc, trampoline, 0);
        }

        inner.contexts.insert(id, ctx);
        inner.running.insert(0, id);
        debug!("spawn: {:?} (caller {:?})", id, inner.current);
        Ok(id)
    }

    /// Equivalent to [`sched`](Engine::sched) with no target.
    pub fn yield_now(&self) -> Result<(), EngineError> {
        self.sched(None)
    }

    /// Suspends the current coroutine and transfers control.
    ///
    /// With a target, control goes to the live leaf of its callee chain
    /// and the current coroutine becomes the target's caller. With no
    /// target, control goes back to the current coroutine's caller if it
    /// can run, else to any runnable coroutine, else to a blocked one
    /// whose channel can progress; with nowhere to go this is a no-op.
    pub fn sched(&self, target: Option<CoroId>) -> Result<(), EngineError> {
        let prev_uc: *mut libc::ucontext_t;
        let next_uc: *const libc::ucontext_t;
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.active {
                return Err(EngineError::NotStarted);
            }
            inner.check_deadlock()?;

            let current = inner.current;
            // A target that already finished is as good as no target.
            let mut t = target.filter(|&t| inner.alive(t));

            if t.is_none() {
                let cur = match current {
                    Some(cur) => cur,
                    // Only the `start` frame runs with no current
                    // coroutine, and it always names a target.
                    None => return Ok(()),
                };

                // Prefer the caller, unless it is stuck on a channel that
                // cannot move; then any runnable coroutine; then any
                // blocked one whose channel can move.
                t = inner.contexts[&cur]
                    .caller
                    .filter(|&c| inner.alive(c))
                    .filter(|&c| {
                        let ch = inner.contexts[&c].awaiting;
                        ch.map_or(true, |ch| inner.channel_can_progress(ch))
                    });
                if t.is_none() {
                    t = inner
                        .running
                        .iter()
                        .copied()
                        .find(|&r| r != cur && !inner.blocked(r));
                }
                if t.is_none() {
                    t = inner.running.iter().copied().find(|&r| {
                        r != cur
                            && inner.contexts[&r]
                                .awaiting
                                .map_or(false, |ch| inner.channel_can_progress(ch))
                    });
                }
                // With nobody else to run, control stays here.
                let cur_t = t.unwrap_or(cur);
                t = Some(cur_t);
            }

            let t = t.expect("target resolved above");

            // A bare yield back along an explicit schedule dissolves that
            // edge before the chain is followed.
            if let Some(cur) = current {
                if inner.contexts[&t].callee == Some(cur) {
                    inner.contexts.get_mut(&t).expect("target is alive").callee = None;
                    inner.contexts.get_mut(&cur).expect("current is alive").caller = None;
                }
            }

            let leaf = inner.descend_callee(t);
            if Some(leaf) == current {
                return Ok(());
            }

            inner.contexts.get_mut(&leaf).expect("leaf is alive").caller = current;
            if let Some(cur) = current {
                inner.contexts.get_mut(&cur).expect("current is alive").callee = Some(leaf);
            }
            inner.current = Some(leaf);
            trace!("sched: {:?} -> {:?}", current, leaf);

            // A fresh coroutine's first activation picks its spawn
            // payload up from the thread-local hand-off slot.
            if inner.contexts[&leaf].entry.is_some() {
                let raw = Rc::into_raw(Rc::clone(&self.inner));
                TRAMPOLINE_ARGS.with(|slot| slot.set(Some((raw, leaf.0))));
            }

            prev_uc = match current {
                Some(cur) => &mut inner.contexts.get_mut(&cur).expect("current is alive").uc,
                None => inner.idle.as_deref_mut().expect("idle context inside start"),
            };
            next_uc = &inner.contexts[&leaf].uc;
        }

        // The borrow is released: the switch may run arbitrary engine
        // code on the other stack before control returns here.
        let rc = unsafe { libc::swapcontext(prev_uc, next_uc) };
        debug_assert_eq!(rc, 0, "swapcontext failed");
        self.reap();
        Ok(())
    }

    /// True when `id` names a live channel.
    pub fn cexists(&self, id: u64) -> bool {
        self.inner.borrow().channels.contains_key(&id)
    }

    /// Creates channel `id` with a `capacity`-byte ring buffer.
    pub fn cnew(&self, id: u64, capacity: usize) -> Result<(), EngineError> {
        let mut inner = self.inner.borrow_mut();
        if inner.channels.contains_key(&id) {
            return Err(EngineError::ChannelExists(id));
        }
        inner.channels.insert(
            id,
            Channel {
                cap: capacity,
                buf: VecDeque::with_capacity(capacity),
                writers: VecDeque::new(),
                readers: VecDeque::new(),
            },
        );
        debug!("cnew: channel {} with capacity {}", id, capacity);
        Ok(())
    }

    /// Destroys channel `id`. Closing a channel with queued tasks is an
    /// error; closing an unknown id is a no-op.
    pub fn cclose(&self, id: u64) -> Result<(), EngineError> {
        let mut inner = self.inner.borrow_mut();
        let ch = match inner.channels.get(&id) {
            None => return Ok(()),
            Some(ch) => ch,
        };
        if !ch.writers.is_empty() || !ch.readers.is_empty() {
            return Err(EngineError::ChannelBusy {
                id,
                writers: ch.writers.len(),
                readers: ch.readers.len(),
            });
        }
        inner.channels.remove(&id);
        debug!("cclose: channel {}", id);
        Ok(())
    }

    /// Writes all of `src` into channel `id`, blocking the current
    /// coroutine until every byte is in the ring (and from there, in a
    /// reader's buffer). Writers are served strictly in arrival order.
    pub fn cwrite(&self, id: u64, src: &[u8]) -> Result<(), EngineError> {
        let me = self.enqueue(id, src.len(), Side::Write)?;
        trace!("cwrite: {:?} offers {} bytes on channel {}", me, src.len(), id);

        let mut sent = 0;
        loop {
            let (head, space) = {
                let inner = self.inner.borrow();
                let ch = &inner.channels[&id];
                (
                    ch.writers.front().expect("task queued until done").owner,
                    ch.buf.len() < ch.cap,
                )
            };

            if head != me {
                // FIFO: the head writer moves first. If even the head is
                // stalled on a full ring, defer to the readers instead.
                let to = if space { Some(head) } else { self.opposite_head(id, Side::Write) };
                self.step(id, me, Side::Write, to)?;
                continue;
            }

            let done = {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                let ch = inner.channels.get_mut(&id).expect("channel open while tasks pend");
                while sent < src.len() && ch.buf.len() < ch.cap {
                    ch.buf.push_back(src[sent]);
                    sent += 1;
                }
                let task = ch.writers.front_mut().expect("own task at queue head");
                task.remaining = src.len() - sent;
                if task.remaining == 0 {
                    ch.writers.pop_front();
                    inner.contexts.get_mut(&me).expect("current is alive").awaiting = None;
                    true
                } else {
                    false
                }
            };

            let reader = self.opposite_head(id, Side::Write);
            if done {
                // Hand the freshly buffered bytes to the waiting reader
                // before returning.
                if let Some(reader) = reader {
                    self.sched(Some(reader))?;
                }
                trace!("cwrite: {:?} delivered {} bytes on channel {}", me, src.len(), id);
                return Ok(());
            }
            self.step(id, me, Side::Write, reader)?;
        }
    }

    /// Fills all of `dst` from channel `id`, blocking the current
    /// coroutine until every byte has arrived. Readers are served
    /// strictly in arrival order.
    pub fn cread(&self, id: u64, dst: &mut [u8]) -> Result<(), EngineError> {
        let me = self.enqueue(id, dst.len(), Side::Read)?;
        trace!("cread: {:?} wants {} bytes from channel {}", me, dst.len(), id);

        let mut got = 0;
        loop {
            let (head, data) = {
                let inner = self.inner.borrow();
                let ch = &inner.channels[&id];
                (
                    ch.readers.front().expect("task queued until done").owner,
                    !ch.buf.is_empty(),
                )
            };

            if head != me {
                let to = if data { Some(head) } else { self.opposite_head(id, Side::Read) };
                self.step(id, me, Side::Read, to)?;
                continue;
            }

            let done = {
                let mut inner = self.inner.borrow_mut();
                let inner = &mut *inner;
                let ch = inner.channels.get_mut(&id).expect("channel open while tasks pend");
                while got < dst.len() {
                    match ch.buf.pop_front() {
                        Some(byte) => {
                            dst[got] = byte;
                            got += 1;
                        }
                        None => break,
                    }
                }
                let task = ch.readers.front_mut().expect("own task at queue head");
                task.remaining = dst.len() - got;
                if task.remaining == 0 {
                    ch.readers.pop_front();
                    inner.contexts.get_mut(&me).expect("current is alive").awaiting = None;
                    true
                } else {
                    false
                }
            };

            let writer = self.opposite_head(id, Side::Read);
            if done {
                // Freed ring space may unblock the head writer.
                if let Some(writer) = writer {
                    self.sched(Some(writer))?;
                }
                trace!("cread: {:?} received {} bytes from channel {}", me, dst.len(), id);
                return Ok(());
            }
            self.step(id, me, Side::Read, writer)?;
        }
    }

    ////////////////////////////////////////////////////////////
    // Channel plumbing

    /// Queues a task for the current coroutine on one side of a channel
    /// and marks the coroutine as awaiting it.
    fn enqueue(&self, id: u64, size: usize, side: Side) -> Result<CoroId, EngineError> {
        let mut inner = self.inner.borrow_mut();
        let me = inner.current.ok_or(EngineError::OutsideCoroutine)?;
        let ch = inner.channels.get_mut(&id).ok_or(EngineError::UnknownChannel(id))?;
        let queue = match side {
            Side::Write => &mut ch.writers,
            Side::Read => &mut ch.readers,
        };
        queue.push_back(Waiter { owner: me, remaining: size });
        inner.contexts.get_mut(&me).expect("current is alive").awaiting = Some(id);
        Ok(me)
    }

    /// The coroutine at the head of the *other* side's queue, if any.
    fn opposite_head(&self, id: u64, side: Side) -> Option<CoroId> {
        let inner = self.inner.borrow();
        let ch = &inner.channels[&id];
        let queue = match side {
            Side::Write => &ch.readers,
            Side::Read => &ch.writers,
        };
        queue.front().map(|w| w.owner)
    }

    /// One blocked scheduling step of a channel loop: hand control to
    /// `to`, or yield when there is nobody specific to hand it to. If the
    /// engine reports a fatal condition (deadlock), the task is withdrawn
    /// so the channel is left consistent.
    fn step(&self, id: u64, me: CoroId, side: Side, to: Option<CoroId>) -> Result<(), EngineError> {
        let result = match to {
            Some(to) => self.sched(Some(to)),
            None => self.yield_now(),
        };
        if let Err(err) = result {
            self.withdraw(id, me, side);
            return Err(err);
        }
        Ok(())
    }

    /// Removes `me`'s pending task after a failed wait.
    fn withdraw(&self, id: u64, me: CoroId, side: Side) {
        let mut inner = self.inner.borrow_mut();
        if let Some(ch) = inner.channels.get_mut(&id) {
            let queue = match side {
                Side::Write => &mut ch.writers,
                Side::Read => &mut ch.readers,
            };
            queue.retain(|w| w.owner != me);
        }
        if let Some(ctx) = inner.contexts.get_mut(&me) {
            ctx.awaiting = None;
        }
    }

    /// Frees the stacks of coroutines that finished while we were away.
    fn reap(&self) {
        self.inner.borrow_mut().graveyard.clear();
    }
}

#[derive(Clone, Copy)]
enum Side {
    Write,
    Read,
}

/// First activation target of every coroutine: runs the body and then
/// hands control onward, never returning.
extern "C" fn trampoline() {
    let (raw, id) = TRAMPOLINE_ARGS
        .with(Cell::take)
        .expect("coroutine activated without spawn arguments");
    let engine = Engine { inner: unsafe { Rc::from_raw(raw) } };

    let entry = engine
        .inner
        .borrow_mut()
        .contexts
        .get_mut(&CoroId(id))
        .and_then(|ctx| ctx.entry.take())
        .expect("fresh coroutine has an entry");

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| entry(engine.clone()))) {
        engine.inner.borrow_mut().panic.get_or_insert(payload);
    }

    finish(engine);
}

/// Tears the finished coroutine out of the engine and switches to
/// whoever should run next: its caller, else any runnable coroutine,
/// else a blocked one that can progress, else back to `start`.
fn finish(engine: Engine) -> ! {
    let inner_rc = Rc::clone(&engine.inner);
    drop(engine);

    let next_uc: *const libc::ucontext_t;
    {
        let mut inner = inner_rc.borrow_mut();
        let inner = &mut *inner;

        let id = inner.current.take().expect("finish outside a coroutine");
        inner.running.retain(|&r| r != id);
        let ctx = inner.contexts.remove(&id).expect("finished context exists");
        let caller = ctx.caller;
        if let Some(caller) = caller {
            if let Some(caller_ctx) = inner.contexts.get_mut(&caller) {
                if caller_ctx.callee == Some(id) {
                    caller_ctx.callee = None;
                }
            }
        }
        // The stack under our feet cannot be unmapped here; whoever runs
        // next reaps it.
        inner.graveyard.push(ctx);
        debug!("finish: {:?}, {} coroutines remain", id, inner.running.len());

        // Same preference order as a bare yield: the caller unless it is
        // stuck on a channel that cannot move, then the runnable, then
        // the blocked-but-unblockable.
        let mut next = caller.filter(|&c| inner.alive(c)).filter(|&c| {
            inner.contexts[&c]
                .awaiting
                .map_or(true, |ch| inner.channel_can_progress(ch))
        });
        if next.is_none() {
            next = inner.running.iter().copied().find(|&r| !inner.blocked(r));
        }
        if next.is_none() {
            next = inner.running.iter().copied().find(|&r| {
                inner.contexts[&r]
                    .awaiting
                    .map_or(false, |ch| inner.channel_can_progress(ch))
            });
        }
        if next.is_none() && !inner.running.is_empty() {
            // Everyone left is stuck: report it where start can see.
            inner.fatal.get_or_insert(EngineError::Deadlock);
        }

        next_uc = match next {
            Some(next) => {
                let leaf = inner.descend_callee(next);
                inner.contexts.get_mut(&leaf).expect("leaf is alive").caller = None;
                inner.current = Some(leaf);
                trace!("finish: resuming {:?}", leaf);
                &inner.contexts[&leaf].uc
            }
            None => inner.idle.as_deref().expect("idle context inside start"),
        };
    }

    drop(inner_rc);
    unsafe { libc::setcontext(next_uc) };
    unreachable!("setcontext returned");
}
