//! Two coroutines ping-pong control back and forth, then hand it back to
//! the coroutine that started them.

use std::cell::Cell;
use std::rc::Rc;

use corekit::coro::{CoroId, Engine};

fn main() {
    env_logger::init();

    let engine = Engine::new();
    engine
        .start(|eng| {
            let ping_id: Rc<Cell<Option<CoroId>>> = Rc::new(Cell::new(None));
            let pong_id: Rc<Cell<Option<CoroId>>> = Rc::new(Cell::new(None));

            let other = Rc::clone(&pong_id);
            let ping = eng
                .spawn(move |eng| {
                    for round in 1..=3 {
                        println!("ping {}", round);
                        eng.sched(other.get()).expect("pong is alive");
                    }
                })
                .expect("engine is running");

            let other = Rc::clone(&ping_id);
            let pong = eng
                .spawn(move |eng| {
                    for round in 1..=3 {
                        println!("pong {}", round);
                        if round < 3 {
                            eng.sched(other.get()).expect("ping is alive");
                        }
                    }
                })
                .expect("engine is running");

            ping_id.set(Some(ping));
            pong_id.set(Some(pong));

            eng.sched(Some(ping)).expect("rally runs to completion");
            println!("done");
        })
        .expect("engine shuts down cleanly");
}
