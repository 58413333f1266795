//! In-memory NIC queue pair.
//!
//! [`LoopbackNic::pair`] returns two ends of a shared packet channel: the
//! TX end enqueues, the RX end drains. Packets are tagged with their launch
//! time as the receive timestamp (or the enqueue wall time when the launch
//! time is 0). A drop filter on the TX end injects loss for the redundancy
//! and recovery tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{NicQueue, RxPacket, TxPacket};

/// Burst bound of the loopback queue, matching a typical NIC descriptor
/// ring slice.
pub const LOOPBACK_BURST_MAX: usize = 128;

type DropFilter = Box<dyn FnMut(u64, &[u8]) -> bool + Send>;

#[derive(Default)]
struct Channel {
    queue: VecDeque<RxPacket>,
    /// Packets enqueued on the TX end, including dropped ones.
    tx_count: u64,
}

/// Factory for connected loopback queue ends.
pub struct LoopbackNic;

impl LoopbackNic {
    /// Create a connected (TX, RX) queue pair.
    pub fn pair() -> (LoopbackTx, LoopbackRx) {
        let chan = Arc::new(Mutex::new(Channel::default()));
        (
            LoopbackTx {
                chan: chan.clone(),
                drop_filter: None,
            },
            LoopbackRx { chan },
        )
    }
}

/// Transmit end of a loopback channel.
pub struct LoopbackTx {
    chan: Arc<Mutex<Channel>>,
    drop_filter: Option<DropFilter>,
}

impl LoopbackTx {
    /// Install a loss filter: called with `(tx_index, packet)`, returning
    /// `false` drops the packet.
    pub fn set_drop_filter(&mut self, f: impl FnMut(u64, &[u8]) -> bool + Send + 'static) {
        self.drop_filter = Some(Box::new(f));
    }
}

impl NicQueue for LoopbackTx {
    fn tx_burst(&mut self, pkts: &mut Vec<TxPacket>) -> usize {
        let take = pkts.len().min(LOOPBACK_BURST_MAX);
        let mut chan = self.chan.lock();
        for pkt in pkts.drain(..take) {
            let idx = chan.tx_count;
            chan.tx_count += 1;
            let keep = match &mut self.drop_filter {
                Some(f) => f(idx, &pkt.data),
                None => true,
            };
            if keep {
                chan.queue.push_back(RxPacket {
                    timestamp_ns: pkt.launch_time_ns,
                    data: pkt.data,
                });
            }
        }
        take
    }

    fn rx_burst(&mut self, _max: usize) -> Vec<RxPacket> {
        Vec::new()
    }
}

/// Receive end of a loopback channel.
pub struct LoopbackRx {
    chan: Arc<Mutex<Channel>>,
}

impl LoopbackRx {
    /// Packets waiting to be drained.
    pub fn pending(&self) -> usize {
        self.chan.lock().queue.len()
    }
}

impl NicQueue for LoopbackRx {
    fn tx_burst(&mut self, _pkts: &mut Vec<TxPacket>) -> usize {
        0
    }

    fn rx_burst(&mut self, max: usize) -> Vec<RxPacket> {
        let mut chan = self.chan.lock();
        let take = chan.queue.len().min(max).min(LOOPBACK_BURST_MAX);
        chan.queue.drain(..take).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(byte: u8, launch: u64) -> TxPacket {
        TxPacket {
            data: vec![byte; 4],
            launch_time_ns: launch,
        }
    }

    #[test]
    fn round_trip_preserves_order_and_timestamps() {
        let (mut tx, mut rx) = LoopbackNic::pair();
        let mut pkts = vec![pkt(1, 10), pkt(2, 20), pkt(3, 30)];
        assert_eq!(tx.tx_burst(&mut pkts), 3);
        assert!(pkts.is_empty());

        let got = rx.rx_burst(16);
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].data[0], 1);
        assert_eq!(got[2].timestamp_ns, 30);
    }

    #[test]
    fn burst_bound_respected() {
        let (mut tx, mut rx) = LoopbackNic::pair();
        let mut pkts: Vec<TxPacket> = (0..200).map(|i| pkt(i as u8, 0)).collect();
        let accepted = tx.tx_burst(&mut pkts);
        assert_eq!(accepted, LOOPBACK_BURST_MAX);
        assert_eq!(pkts.len(), 200 - LOOPBACK_BURST_MAX);
        assert_eq!(rx.rx_burst(usize::MAX).len(), LOOPBACK_BURST_MAX);
    }

    #[test]
    fn drop_filter_injects_loss() {
        let (mut tx, mut rx) = LoopbackNic::pair();
        tx.set_drop_filter(|idx, _| idx % 2 == 0);
        let mut pkts: Vec<TxPacket> = (0..10).map(|i| pkt(i as u8, 0)).collect();
        tx.tx_burst(&mut pkts);
        let got = rx.rx_burst(16);
        assert_eq!(got.len(), 5);
        assert!(got.iter().all(|p| p.data[0] % 2 == 0));
    }
}
