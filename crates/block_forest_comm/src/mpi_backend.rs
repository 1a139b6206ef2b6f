//! The rsmpi-backed communicator. Compiled only with the `mpi` feature.

use crate::Message;

use mpi::collective::SystemOperation;
use mpi::datatype::{Partition, PartitionMut};
use mpi::topology::SystemCommunicator;
use mpi::traits::*;
use mpi::Count;

/// An MPI rank of the world communicator.
#[derive(Clone)]
pub struct MpiComm {
    world: SystemCommunicator,
}

impl MpiComm {
    pub fn new(world: SystemCommunicator) -> Self {
        MpiComm { world }
    }

    pub fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    pub fn size(&self) -> usize {
        self.world.size() as usize
    }

    pub fn barrier(&self) {
        self.world.barrier();
    }

    pub fn all_reduce_sum(&self, v: u64) -> u64 {
        let mut out = 0u64;
        self.world.all_reduce_into(&v, &mut out, SystemOperation::sum());
        out
    }

    pub fn all_reduce_max(&self, v: u64) -> u64 {
        let mut out = 0u64;
        self.world.all_reduce_into(&v, &mut out, SystemOperation::max());
        out
    }

    pub fn exclusive_scan_sum(&self, v: u64) -> u64 {
        let mut out = 0u64;
        self.world
            .exclusive_scan_into(&v, &mut out, SystemOperation::sum());
        // MPI leaves rank 0's exscan output undefined.
        if self.rank() == 0 {
            0
        } else {
            out
        }
    }

    pub fn all_gather<T: Message>(&self, v: T) -> Vec<T> {
        let mut buf = vec![T::default(); self.size()];
        self.world.all_gather_into(&v, &mut buf[..]);
        buf
    }

    pub fn all_gather_vec<T: Message>(&self, v: &[T]) -> Vec<Vec<T>> {
        let len = v.len();
        if len == 0 {
            return vec![Vec::new(); self.size()];
        }
        let mut buf = vec![T::default(); len * self.size()];
        self.world.all_gather_into(v, &mut buf[..]);
        buf.chunks(len).map(|c| c.to_vec()).collect()
    }

    pub fn all_to_all<T: Message>(&self, sends: Vec<Vec<T>>) -> Vec<Vec<T>> {
        let size = self.size();

        // Counts first, then one varcount collective for the payload.
        let send_counts: Vec<Count> = sends.iter().map(|s| s.len() as Count).collect();
        let mut recv_counts = vec![0 as Count; size];
        self.world
            .all_to_all_into(&send_counts[..], &mut recv_counts[..]);

        let displs = |counts: &[Count]| -> Vec<Count> {
            let mut d = Vec::with_capacity(counts.len());
            let mut acc = 0;
            for &c in counts {
                d.push(acc);
                acc += c;
            }
            d
        };
        let send_displs = displs(&send_counts);
        let recv_displs = displs(&recv_counts);

        let send_buf: Vec<T> = sends.into_iter().flatten().collect();
        let total: Count = recv_counts.iter().sum();
        let mut recv_buf = vec![T::default(); total as usize];
        {
            let partition = Partition::new(&send_buf[..], &send_counts[..], &send_displs[..]);
            let mut recv_partition =
                PartitionMut::new(&mut recv_buf[..], &recv_counts[..], &recv_displs[..]);
            self.world
                .all_to_all_varcount_into(&partition, &mut recv_partition);
        }

        let mut out = Vec::with_capacity(size);
        let mut offset = 0usize;
        for &c in &recv_counts {
            let c = c as usize;
            out.push(recv_buf[offset..offset + c].to_vec());
            offset += c;
        }
        out
    }
}
