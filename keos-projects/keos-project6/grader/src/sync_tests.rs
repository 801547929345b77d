//! Tests for the priority-donating mutex, semaphore, writer-preferring
//! reader/writer lock, and Mesa-semantics condition variable.
//!
//! Shaped after `keos-project4/grader/src/sync.rs`: one module per
//! primitive, plain `pub fn` test cases registered with
//! [`keos::TestDriver`].

pub mod mutex {
    use alloc::{sync::Arc, vec::Vec};
    use keos::{
        sync::atomic::{AtomicBool, AtomicUsize},
        thread::{ThreadBuilder, ThreadState},
    };
    use keos_project6::sync::Mutex;

    pub fn smoke() {
        const LENGTH: usize = 64;
        let output = Arc::new(Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = Arc::new(AtomicUsize::new(0));

        let joins: Vec<_> = (0..LENGTH)
            .map(|i| {
                let (counter, counter2, output) = (counter.clone(), counter2.clone(), output.clone());
                ThreadBuilder::new("smoker").spawn(move || {
                    counter.fetch_add(1);
                    let mut d = output.lock();
                    while counter.load() != LENGTH {}
                    d.push(i);
                    counter2.fetch_add(1);
                    d.unlock();
                })
            })
            .collect();

        while counter2.load() != LENGTH {}
        for j in joins {
            j.join();
        }

        let mut output = output.lock();
        output.sort();
        assert_eq!(&*output, &(0..LENGTH).collect::<Vec<_>>());
        output.unlock();
    }

    pub fn parking() {
        let mutex = Arc::new(Mutex::new(()));
        let guard = mutex.lock();
        let thread_spawned = Arc::new(AtomicBool::new(false));

        let be_parked = {
            let (thread_spawned, mutex) = (thread_spawned.clone(), mutex.clone());
            ThreadBuilder::new("blockee").spawn(move || {
                thread_spawned.store(true);
                let guard = mutex.lock();
                guard.unlock();
            })
        };

        while !thread_spawned.load() {
            core::hint::spin_loop();
        }
        for _ in 0..10000 {
            core::hint::spin_loop();
        }

        assert_eq!(
            keos::thread::get_state_by_tid(be_parked.tid),
            Ok(ThreadState::Parked),
            "a thread blocked on a held Mutex should be Parked"
        );

        guard.unlock();
        be_parked.join();
    }

    pub fn try_lock_fails_while_held() {
        let mutex = Mutex::new(0);
        let guard = mutex.lock();
        assert!(mutex.try_lock().is_err());
        guard.unlock();
        let retry = mutex.try_lock();
        assert!(retry.is_ok());
        retry.unwrap().unlock();
    }
}

pub mod semaphore {
    use alloc::sync::Arc;
    use keos::{sync::atomic::AtomicUsize, thread::ThreadBuilder};
    use keos_project6::sync::Semaphore;

    pub fn producer_consumer() {
        const N: usize = 32;
        let sema = Arc::new(Semaphore::new(0));
        let produced = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));

        let producer = {
            let (sema, produced) = (sema.clone(), produced.clone());
            ThreadBuilder::new("producer").spawn(move || {
                for _ in 0..N {
                    produced.fetch_add(1);
                    sema.up();
                }
            })
        };

        let consumers: alloc::vec::Vec<_> = (0..N)
            .map(|_| {
                let (sema, consumed) = (sema.clone(), consumed.clone());
                ThreadBuilder::new("consumer").spawn(move || {
                    sema.down();
                    consumed.fetch_add(1);
                })
            })
            .collect();

        producer.join();
        for c in consumers {
            c.join();
        }
        assert_eq!(consumed.load(), N);
        assert_eq!(produced.load(), N);
        assert_eq!(sema.value(), 0);
    }

    pub fn try_down_does_not_block() {
        let sema = Semaphore::new(1);
        assert!(sema.try_down());
        assert!(!sema.try_down());
        sema.up();
        assert!(sema.try_down());
    }
}

pub mod rwlock {
    use alloc::sync::Arc;
    use keos::{sync::atomic::AtomicUsize, thread::ThreadBuilder};
    use keos_project6::sync::RwLock;

    pub fn many_readers_concurrent() {
        let lock = Arc::new(RwLock::new(0usize));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let readers: alloc::vec::Vec<_> = (0..8)
            .map(|_| {
                let (lock, inside, max_inside) = (lock.clone(), inside.clone(), max_inside.clone());
                ThreadBuilder::new("reader").spawn(move || {
                    let guard = lock.read();
                    let now = inside.fetch_add(1) + 1;
                    let mut observed = max_inside.load();
                    while now > observed {
                        match max_inside.compare_exchange(observed, now) {
                            Ok(_) => break,
                            Err(v) => observed = v,
                        }
                    }
                    for _ in 0..2000 {
                        core::hint::spin_loop();
                    }
                    inside.fetch_sub(1);
                    drop(guard);
                })
            })
            .collect();

        for r in readers {
            r.join();
        }
        assert!(max_inside.load() > 1, "readers should overlap under a shared read lock");
    }

    pub fn writer_excludes_readers() {
        let lock = Arc::new(RwLock::new(0usize));
        let writer_guard = lock.write();

        let reader_done = Arc::new(keos::sync::atomic::AtomicBool::new(false));
        let reader = {
            let (lock, reader_done) = (lock.clone(), reader_done.clone());
            ThreadBuilder::new("reader").spawn(move || {
                let _guard = lock.read();
                reader_done.store(true);
            })
        };

        for _ in 0..10000 {
            core::hint::spin_loop();
        }
        assert!(!reader_done.load(), "a reader must not proceed while a writer holds the lock");

        drop(writer_guard);
        reader.join();
        assert!(reader_done.load());
    }
}

pub mod condvar {
    use alloc::{sync::Arc, vec::Vec};
    use keos::{sync::atomic::AtomicUsize, thread::ThreadBuilder};
    use keos_project6::sync::{CondVar, Mutex};

    const MAX: usize = 4;

    struct BufferInner {
        item: [usize; MAX],
        front: usize,
        tail: usize,
        count: usize,
    }

    struct Buffer {
        inner: Mutex<BufferInner>,
        full: CondVar,
        empty: CondVar,
    }

    impl Buffer {
        fn new() -> Self {
            Self {
                inner: Mutex::new(BufferInner {
                    item: [0; MAX],
                    front: 0,
                    tail: 0,
                    count: 0,
                }),
                full: CondVar::new(),
                empty: CondVar::new(),
            }
        }

        fn put(&self, val: usize) {
            let mut guard = self.inner.lock();
            while guard.count == MAX {
                guard = self.full.wait(guard, &self.inner);
            }
            guard.item[guard.tail] = val;
            guard.tail = (guard.tail + 1) % MAX;
            guard.count += 1;
            guard.unlock();
            self.empty.signal();
        }

        fn get(&self) -> usize {
            let mut guard = self.inner.lock();
            while guard.count == 0 {
                guard = self.empty.wait(guard, &self.inner);
            }
            let v = guard.item[guard.front];
            guard.front = (guard.front + 1) % MAX;
            guard.count -= 1;
            guard.unlock();
            self.full.signal();
            v
        }
    }

    pub fn bounded_buffer() {
        const N: usize = 64;
        let buffer = Arc::new(Buffer::new());
        let output = Arc::new(Mutex::new(Vec::new()));
        let consumers: Vec<_> = (0..N)
            .map(|_| {
                let (buffer, output) = (buffer.clone(), output.clone());
                ThreadBuilder::new("consumer").spawn(move || {
                    let v = buffer.get();
                    let mut guard = output.lock();
                    guard.push(v);
                    guard.unlock();
                })
            })
            .collect();

        let producer = {
            let buffer = buffer.clone();
            ThreadBuilder::new("producer").spawn(move || {
                for i in 0..N {
                    buffer.put(i);
                }
            })
        };

        producer.join();
        for c in consumers {
            c.join();
        }

        let mut output = output.lock();
        output.sort();
        assert_eq!(&*output, &(0..N).collect::<Vec<_>>());
        output.unlock();
    }

    pub fn broadcast_wakes_every_waiter() {
        let mutex = Arc::new(Mutex::new(false));
        let cv = Arc::new(CondVar::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let (mutex, cv, woken) = (mutex.clone(), cv.clone(), woken.clone());
                ThreadBuilder::new("waiter").spawn(move || {
                    let mut guard = mutex.lock();
                    while !*guard {
                        guard = cv.wait(guard, &mutex);
                    }
                    guard.unlock();
                    woken.fetch_add(1);
                })
            })
            .collect();

        for _ in 0..10000 {
            core::hint::spin_loop();
        }

        let mut guard = mutex.lock();
        *guard = true;
        guard.unlock();
        cv.broadcast();

        for w in waiters {
            w.join();
        }
        assert_eq!(woken.load(), 8);
    }
}
