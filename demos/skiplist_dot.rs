//! Builds a small skiplist and prints its tower structure as graphviz
//! dot. Pipe through `dot -Tpng` to see the shape.

use std::io;

use corekit::skiplist::SkipList;

fn main() {
    env_logger::init();

    let mut list: SkipList<u32, &str> = SkipList::with_seed(0xC0FFEE);
    for (i, word) in "the quick brown fox jumps over the lazy dog"
        .split_whitespace()
        .enumerate()
    {
        list.put(i as u32 * 7 % 13, word);
    }

    list.dot_dump(&mut io::stdout().lock())
        .expect("stdout is writable");
}
