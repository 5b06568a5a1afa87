#![cfg(unix)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use corekit::coro::{CoroId, Engine, EngineError};

use test_log::test;

/// Two coroutines ping-pong through explicit scheduling; the combined
/// transcript interleaves them exactly.
#[test]
fn printer_transcript() {
    let engine = Engine::new();
    let out = Rc::new(RefCell::new(String::new()));

    let main_out = Rc::clone(&out);
    engine
        .start(move |eng| {
            let pa: Rc<Cell<Option<CoroId>>> = Rc::new(Cell::new(None));
            let pb: Rc<Cell<Option<CoroId>>> = Rc::new(Cell::new(None));

            let (out_a, other_a) = (Rc::clone(&main_out), Rc::clone(&pb));
            let a = eng
                .spawn(move |eng| {
                    for step in 1..=3 {
                        out_a.borrow_mut().push_str(&format!("A{} ", step));
                        eng.sched(other_a.get()).unwrap();
                    }
                })
                .unwrap();

            let (out_b, other_b) = (Rc::clone(&main_out), Rc::clone(&pa));
            let b = eng
                .spawn(move |eng| {
                    for step in 1..=3 {
                        out_b.borrow_mut().push_str(&format!("B{} ", step));
                        if step < 3 {
                            eng.sched(other_b.get()).unwrap();
                        }
                    }
                })
                .unwrap();

            pa.set(Some(a));
            pb.set(Some(b));

            // The pair ping-pongs greedily, then control comes back here.
            eng.sched(Some(a)).unwrap();
            main_out.borrow_mut().push_str("END");
        })
        .unwrap();

    assert_eq!(*out.borrow(), "A1 B1 A2 B2 A3 B3 END");
}

/// Bytes written before any reader exists are buffered and delivered to
/// a reader spawned later.
#[test]
fn delayed_channel_read() {
    let engine = Engine::new();
    let out = Rc::new(RefCell::new(Vec::new()));

    let main_out = Rc::clone(&out);
    engine
        .start(move |eng| {
            let msg = b"hello\0";
            eng.cnew(1, msg.len()).unwrap();
            eng.cwrite(1, msg).unwrap();

            let sink = Rc::clone(&main_out);
            eng.spawn(move |eng| {
                let mut buf = vec![0u8; 6];
                eng.cread(1, &mut buf).unwrap();
                sink.borrow_mut().extend_from_slice(&buf);
            })
            .unwrap();
            eng.yield_now().unwrap();
        })
        .unwrap();

    let got = out.borrow();
    assert_eq!(&got[..5], b"hello");
    assert_eq!(got[5], 0);
}

/// Writers queued on one channel are served strictly first-come,
/// first-served: their bytes never interleave.
#[test]
fn writers_are_fifo() {
    let engine = Engine::new();
    let got = Rc::new(RefCell::new(Vec::new()));

    let main_got = Rc::clone(&got);
    engine
        .start(move |eng| {
            // A ring far smaller than either message forces both writers
            // to block and hand off repeatedly.
            eng.cnew(1, 2).unwrap();

            let w1 = eng.spawn(|eng| eng.cwrite(1, b"aaaa").unwrap()).unwrap();
            let w2 = eng.spawn(|eng| eng.cwrite(1, b"bbbb").unwrap()).unwrap();
            eng.sched(Some(w1)).unwrap();
            eng.sched(Some(w2)).unwrap();

            let mut buf = [0u8; 8];
            eng.cread(1, &mut buf).unwrap();
            main_got.borrow_mut().extend_from_slice(&buf);
        })
        .unwrap();

    assert_eq!(*got.borrow(), b"aaaabbbb");
}

/// A byte stream split across two readers honors reader FIFO order, and
/// every byte written is read exactly once.
#[test]
fn readers_split_a_stream_in_order() {
    let engine = Engine::new();
    let first = Rc::new(RefCell::new(vec![0u8; 5]));
    let second = Rc::new(RefCell::new(vec![0u8; 5]));

    let (r1_buf, r2_buf) = (Rc::clone(&first), Rc::clone(&second));
    engine
        .start(move |eng| {
            eng.cnew(1, 3).unwrap();

            let sink = Rc::clone(&r1_buf);
            let r1 = eng
                .spawn(move |eng| {
                    let mut buf = vec![0u8; 5];
                    eng.cread(1, &mut buf).unwrap();
                    sink.borrow_mut().copy_from_slice(&buf);
                })
                .unwrap();
            let sink = Rc::clone(&r2_buf);
            let r2 = eng
                .spawn(move |eng| {
                    let mut buf = vec![0u8; 5];
                    eng.cread(1, &mut buf).unwrap();
                    sink.borrow_mut().copy_from_slice(&buf);
                })
                .unwrap();

            eng.sched(Some(r1)).unwrap();
            eng.sched(Some(r2)).unwrap();
            eng.cwrite(1, b"abcdefghij").unwrap();
        })
        .unwrap();

    assert_eq!(*first.borrow(), b"abcde");
    assert_eq!(*second.borrow(), b"fghij");
}

/// A reader with no writer anywhere is a deadlock, discovered when the
/// last runnable coroutine exits.
#[test]
fn orphaned_reader_deadlocks() {
    let engine = Engine::new();
    let result = engine.start(|eng| {
        eng.cnew(1, 4).unwrap();
        let reader = eng
            .spawn(|eng| {
                let mut buf = [0u8; 4];
                // Nobody will ever write; this wait is abandoned when
                // the engine reports deadlock.
                let _ = eng.cread(1, &mut buf);
            })
            .unwrap();
        eng.sched(Some(reader)).unwrap();
    });
    assert!(matches!(result, Err(EngineError::Deadlock)));
}

/// Total bytes read equals total bytes written across many tasks of
/// mismatched sizes.
#[test]
fn no_bytes_are_lost_or_invented() {
    let engine = Engine::new();
    let collected = Rc::new(RefCell::new(Vec::new()));

    let sink_main = Rc::clone(&collected);
    engine
        .start(move |eng| {
            eng.cnew(7, 4).unwrap();

            // 3 + 9 + 1 + 11 = 24 bytes written, each writer scheduled
            // once so their tasks queue in spawn order...
            for chunk in [&b"abc"[..], b"defghijkl", b"m", b"nopqrstuvwx"] {
                let w = eng.spawn(move |eng| eng.cwrite(7, chunk).unwrap()).unwrap();
                eng.sched(Some(w)).unwrap();
            }

            // ...and 24 bytes read in different-sized gulps.
            for size in [10usize, 8, 6] {
                let sink = Rc::clone(&sink_main);
                let r = eng
                    .spawn(move |eng| {
                        let mut buf = vec![0u8; size];
                        eng.cread(7, &mut buf).unwrap();
                        sink.borrow_mut().extend_from_slice(&buf);
                    })
                    .unwrap();
                eng.sched(Some(r)).unwrap();
            }
            eng.yield_now().unwrap();
        })
        .unwrap();

    assert_eq!(collected.borrow().len(), 24);
    // Writer FIFO means the concatenation is exactly the writes in
    // order; reader FIFO means collection order matches too.
    assert_eq!(*collected.borrow(), b"abcdefghijklmnopqrstuvwx");
}

/// The engine survives several runs in a row, with channels persisting
/// between them.
#[test]
fn engine_is_reusable_across_starts() {
    let engine = Engine::new();
    engine.cnew(1, 8).unwrap();

    engine.start(|eng| eng.cwrite(1, b"late").unwrap()).unwrap();
    assert!(engine.cexists(1));

    let out = Rc::new(RefCell::new(vec![0u8; 4]));
    let sink = Rc::clone(&out);
    engine
        .start(move |eng| {
            let mut buf = vec![0u8; 4];
            eng.cread(1, &mut buf).unwrap();
            sink.borrow_mut().copy_from_slice(&buf);
        })
        .unwrap();

    assert_eq!(*out.borrow(), b"late");
    engine.cclose(1).unwrap();
}

/// Scheduling an id whose coroutine already finished degrades to a bare
/// yield instead of failing.
#[test]
fn scheduling_a_finished_coroutine_yields() {
    let engine = Engine::new();
    let log = Rc::new(RefCell::new(Vec::new()));

    let main_log = Rc::clone(&log);
    engine
        .start(move |eng| {
            let worker_log = Rc::clone(&main_log);
            let w = eng
                .spawn(move |_| worker_log.borrow_mut().push("worker"))
                .unwrap();
            eng.sched(Some(w)).unwrap();
            // w is gone by now; this must be harmless.
            eng.sched(Some(w)).unwrap();
            main_log.borrow_mut().push("done");
        })
        .unwrap();

    assert_eq!(*log.borrow(), ["worker", "done"]);
}

/// Coroutines that were spawned but never explicitly scheduled still run
/// before start returns.
#[test]
fn unscheduled_coroutines_run_before_start_returns() {
    let engine = Engine::new();
    let ran = Rc::new(Cell::new(0));

    let counter = Rc::clone(&ran);
    engine
        .start(move |eng| {
            for _ in 0..3 {
                let c = Rc::clone(&counter);
                eng.spawn(move |_| c.set(c.get() + 1)).unwrap();
            }
            // Main finishes without ever scheduling them.
        })
        .unwrap();

    assert_eq!(ran.get(), 3);
}
