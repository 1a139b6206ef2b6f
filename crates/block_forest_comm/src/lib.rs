//! The message-layer runtime handed to every forest.
//!
//! All parallelism in the forest is coarse-grained message passing between
//! peer ranks; within a rank the code is single threaded. The only blocking
//! points are the collectives defined on [`Runtime`]: reductions, prefix
//! sums, gathers and variable-count all-to-all exchanges.
//!
//! Three communicators implement the collectives:
//!
//! - [`Runtime::serial`]: a single rank, no communication at all;
//! - [`local::LocalCluster`]: ranks simulated by threads of one process,
//!   used heavily by the multi-rank tests;
//! - with the `mpi` cargo feature, an rsmpi-backed communicator over real
//!   MPI ranks.
//!
//! The runtime is an explicit value passed to constructors; nothing is
//! registered in process-global state.

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi_backend;

pub use crate::local::{LocalCluster, LocalComm};

/// Plain-data types that can travel between ranks.
#[cfg(not(feature = "mpi"))]
pub trait Message: Clone + Default + Send + 'static {}
#[cfg(not(feature = "mpi"))]
impl<T: Clone + Default + Send + 'static> Message for T {}

/// Plain-data types that can travel between ranks. With the `mpi` feature
/// they additionally declare an MPI datatype.
#[cfg(feature = "mpi")]
pub trait Message: Clone + Default + Send + 'static + mpi::datatype::Equivalence {}
#[cfg(feature = "mpi")]
impl<T: Clone + Default + Send + 'static + mpi::datatype::Equivalence> Message for T {}

/// The communicator backing a runtime. Clones refer to the same rank.
#[derive(Clone)]
pub enum Communicator {
    /// A single rank; every collective is the identity.
    Serial,
    /// One of several threads of this process, synchronizing through shared
    /// memory.
    Local(LocalComm),
    /// An MPI rank.
    #[cfg(feature = "mpi")]
    Mpi(mpi_backend::MpiComm),
}

/// An explicit handle on the message layer, passed to every forest. Clones
/// refer to the same rank; two forests sharing a cloned runtime must issue
/// their collectives in the same order on every rank.
#[derive(Clone)]
pub struct Runtime {
    comm: Communicator,
}

impl Runtime {
    /// A runtime with a single rank and no peers.
    pub fn serial() -> Runtime {
        Runtime { comm: Communicator::Serial }
    }

    pub fn from_comm(comm: Communicator) -> Runtime {
        Runtime { comm }
    }

    /// Wraps an MPI world communicator.
    #[cfg(feature = "mpi")]
    pub fn from_mpi(world: mpi::topology::SystemCommunicator) -> Runtime {
        Runtime { comm: Communicator::Mpi(mpi_backend::MpiComm::new(world)) }
    }

    pub fn rank(&self) -> usize {
        match &self.comm {
            Communicator::Serial => 0,
            Communicator::Local(c) => c.rank(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.rank(),
        }
    }

    pub fn size(&self) -> usize {
        match &self.comm {
            Communicator::Serial => 1,
            Communicator::Local(c) => c.size(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.size(),
        }
    }

    pub fn barrier(&self) {
        match &self.comm {
            Communicator::Serial => {}
            Communicator::Local(c) => {
                c.all_gather(());
            }
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.barrier(),
        }
    }

    /// Sum of `v` over all ranks, on all ranks.
    pub fn all_reduce_sum(&self, v: u64) -> u64 {
        match &self.comm {
            Communicator::Serial => v,
            Communicator::Local(c) => c.all_gather(v).into_iter().sum(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.all_reduce_sum(v),
        }
    }

    /// Maximum of `v` over all ranks, on all ranks.
    pub fn all_reduce_max(&self, v: u64) -> u64 {
        match &self.comm {
            Communicator::Serial => v,
            Communicator::Local(c) => c.all_gather(v).into_iter().max().unwrap(),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.all_reduce_max(v),
        }
    }

    /// Sum of `v` over all ranks strictly before this one; 0 on rank 0.
    pub fn exclusive_scan_sum(&self, v: u64) -> u64 {
        match &self.comm {
            Communicator::Serial => 0,
            Communicator::Local(c) => {
                let all = c.all_gather(v);
                all[..c.rank()].iter().sum()
            }
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.exclusive_scan_sum(v),
        }
    }

    /// Every rank contributes one value; every rank receives all of them in
    /// rank order.
    pub fn all_gather<T: Message>(&self, v: T) -> Vec<T> {
        match &self.comm {
            Communicator::Serial => vec![v],
            Communicator::Local(c) => c.all_gather(v),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.all_gather(v),
        }
    }

    /// Every rank contributes a slice of the same length; every rank
    /// receives all of them in rank order.
    pub fn all_gather_vec<T: Message>(&self, v: &[T]) -> Vec<Vec<T>> {
        match &self.comm {
            Communicator::Serial => vec![v.to_vec()],
            Communicator::Local(c) => c.all_gather(v.to_vec()),
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.all_gather_vec(v),
        }
    }

    /// Variable-count all-to-all: `sends[r]` goes to rank `r`; the result's
    /// slot `r` holds what rank `r` sent here. Counts are exchanged first,
    /// then the payload moves in one collective.
    pub fn all_to_all<T: Message>(&self, sends: Vec<Vec<T>>) -> Vec<Vec<T>> {
        assert_eq!(sends.len(), self.size(), "one send list per rank required");
        match &self.comm {
            Communicator::Serial => sends,
            Communicator::Local(c) => {
                let rank = c.rank();
                let gathered = c.all_gather(sends);
                gathered
                    .into_iter()
                    .map(|mut matrix| matrix.swap_remove(rank))
                    .collect()
            }
            #[cfg(feature = "mpi")]
            Communicator::Mpi(c) => c.all_to_all(sends),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_collectives_are_identities() {
        let rt = Runtime::serial();
        assert_eq!(rt.rank(), 0);
        assert_eq!(rt.size(), 1);
        assert_eq!(rt.all_reduce_sum(5), 5);
        assert_eq!(rt.exclusive_scan_sum(5), 0);
        assert_eq!(rt.all_gather(7u64), vec![7]);
        assert_eq!(rt.all_to_all(vec![vec![1u64, 2]]), vec![vec![1, 2]]);
    }

    #[test]
    fn local_cluster_collectives() {
        LocalCluster::run(4, |rt| {
            let r = rt.rank() as u64;
            assert_eq!(rt.size(), 4);
            assert_eq!(rt.all_reduce_sum(r), 6);
            assert_eq!(rt.all_reduce_max(r), 3);
            assert_eq!(rt.exclusive_scan_sum(1), r);
            assert_eq!(rt.all_gather(r), vec![0, 1, 2, 3]);

            // Rank r sends the value 10*r + d to destination d.
            let sends: Vec<Vec<u64>> = (0..4).map(|d| vec![10 * r + d]).collect();
            let recvd = rt.all_to_all(sends);
            let expected: Vec<Vec<u64>> = (0..4).map(|s| vec![10 * s + r]).collect();
            assert_eq!(recvd, expected);
        });
    }

    #[test]
    fn local_cluster_varying_counts() {
        LocalCluster::run(3, |rt| {
            let r = rt.rank();
            // Rank r sends r copies of its rank id to every destination.
            let sends: Vec<Vec<u64>> = (0..3).map(|_| vec![r as u64; r]).collect();
            let recvd = rt.all_to_all(sends);
            for (src, payload) in recvd.iter().enumerate() {
                assert_eq!(payload.len(), src);
                assert!(payload.iter().all(|&v| v == src as u64));
            }
        });
    }
}
