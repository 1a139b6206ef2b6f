//! A thread-backed cluster: ranks simulated by threads of one process.
//!
//! Each simulated rank owns its forest exclusively, exactly like an MPI
//! rank; the threads only meet inside the collectives, which are built on a
//! single round-based all-gather over shared memory. This is the
//! communicator the multi-rank tests run on, with no system MPI required.

use std::any::Any;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

/// Round marker meaning a peer rank died; every waiter bails out.
const ABORTED: u64 = u64::MAX;

struct RoundState {
    round: u64,
    deposited: usize,
    slots: Vec<Option<Box<dyn Any + Send>>>,
    // The gathered Vec<T> of the round that just closed.
    result: Option<Box<dyn Any + Send>>,
}

struct Shared {
    size: usize,
    state: Mutex<RoundState>,
    cv: Condvar,
}

/// One simulated rank of a [`LocalCluster`]. Clones share the rank's slot,
/// so a clone is the same rank, not a new one.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// The one collective everything else is built from: every rank
    /// deposits a value and receives all of them in rank order.
    ///
    /// Every rank must call every collective in the same program order; a
    /// round closes when the last rank deposits.
    pub fn all_gather<T: Clone + Send + 'static>(&self, v: T) -> Vec<T> {
        let shared = &*self.shared;
        let mut st = shared.state.lock().unwrap();
        assert!(st.round != ABORTED, "a peer rank died mid-collective");

        // Wait for our slot from the previous round to drain.
        while st.slots[self.rank].is_some() {
            st = shared.cv.wait(st).unwrap();
        }
        st.slots[self.rank] = Some(Box::new(v));
        st.deposited += 1;
        let my_round = st.round;

        if st.deposited == shared.size {
            // Last one in closes the round and publishes the gather.
            let gathered: Vec<T> = st
                .slots
                .iter_mut()
                .map(|slot| *slot.take().unwrap().downcast::<T>().unwrap())
                .collect();
            st.result = Some(Box::new(gathered));
            st.round += 1;
            st.deposited = 0;
            shared.cv.notify_all();
        }

        while st.round == my_round {
            st = shared.cv.wait(st).unwrap();
        }
        assert!(st.round != ABORTED, "a peer rank died mid-collective");
        st.result
            .as_ref()
            .unwrap()
            .downcast_ref::<Vec<T>>()
            .unwrap()
            .clone()
    }
}

/// Wakes every waiter with the abort marker if its thread unwinds, so one
/// failing rank cannot strand the others inside a collective.
struct AbortOnPanic(Arc<Shared>);

impl Drop for AbortOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            let mut st = match self.0.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            st.round = ABORTED;
            self.0.cv.notify_all();
        }
    }
}

/// Spawns `size` simulated ranks and joins them.
pub struct LocalCluster;

impl LocalCluster {
    /// Builds the communicators without running anything, for callers that
    /// manage their own threads.
    pub fn comms(size: usize) -> Vec<LocalComm> {
        assert!(size > 0);
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(RoundState {
                round: 0,
                deposited: 0,
                slots: (0..size).map(|_| None).collect(),
                result: None,
            }),
            cv: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalComm { rank, shared: shared.clone() })
            .collect()
    }

    /// Runs `f` once per rank on its own thread and joins them all,
    /// propagating any panic.
    pub fn run<F>(size: usize, f: F)
    where
        F: Fn(crate::Runtime) + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let handles: Vec<_> = Self::comms(size)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || {
                    let _abort = AbortOnPanic(comm.shared.clone());
                    f(crate::Runtime::from_comm(crate::Communicator::Local(comm)))
                })
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.join() {
                std::panic::resume_unwind(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_stay_in_lockstep() {
        LocalCluster::run(3, |rt| {
            for round in 0..50u64 {
                let gathered = rt.all_gather(round * 10 + rt.rank() as u64);
                let expected: Vec<u64> =
                    (0..3).map(|r| round * 10 + r).collect();
                assert_eq!(gathered, expected);
            }
        });
    }

    #[test]
    fn heterogeneous_rounds() {
        // Different payload types in consecutive rounds must not confuse the
        // type-erased slots.
        let handles: Vec<_> = LocalCluster::comms(2)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let a = comm.all_gather(comm.rank() as u64);
                    assert_eq!(a, vec![0, 1]);
                    let b = comm.all_gather(vec![comm.rank(); 2]);
                    assert_eq!(b, vec![vec![0, 0], vec![1, 1]]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
