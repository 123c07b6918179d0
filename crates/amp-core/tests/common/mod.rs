#![allow(dead_code)]

use amp_core::{callee, Executor, MemoryStore, Vat, VatSettings};

pub fn open(here: &str, store: MemoryStore) -> Vat {
    Vat::open(VatSettings::default().with_here(here), Box::new(store), None).unwrap()
}

/// Carries every request `a` has released to `b` and hands the answers back
/// in send order. Returns how many requests crossed.
pub fn step(a: &mut Vat, b: &mut Vat) -> usize {
    a.run_until_idle();
    let out = a.take_outbox();
    for o in &out {
        let response = callee::serve(b, o.request.clone());
        b.run_until_idle();
        a.deliver(o.peer.clone(), o.mid, Ok(response));
    }
    a.run_until_idle();
    out.len()
}

/// Steps until `a` has nothing left to send.
pub fn pump(a: &mut Vat, b: &mut Vat) -> usize {
    let mut total = 0;
    loop {
        match step(a, b) {
            0 => return total,
            n => total += n,
        }
    }
}
