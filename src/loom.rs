//! Re-exports of either `std` or `loom` synchronization primitives, depending
//! on whether the crate is being model checked (`RUSTFLAGS="--cfg loom"`).
#[allow(unused_imports)]
pub(crate) use self::inner::*;

#[cfg(loom)]
mod inner {
    #![allow(dead_code)]
    pub(crate) use loom::{model, thread};

    pub(crate) mod sync {
        pub(crate) use loom::sync::atomic;
        pub(crate) use loom::sync::{Arc, Condvar, Mutex, MutexGuard};
    }
}

#[cfg(not(loom))]
mod inner {
    #![allow(dead_code)]
    pub(crate) use std::thread;

    pub(crate) mod sync {
        pub(crate) use std::sync::atomic;
        pub(crate) use std::sync::{Arc, Condvar, Mutex, MutexGuard};
    }

    #[cfg(test)]
    pub(crate) fn model(f: impl Fn() + Sync + Send + 'static) {
        f()
    }
}
