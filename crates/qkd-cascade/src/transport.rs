//! The blocking parity-exchange port.
//!
//! Cascade exchanges small binary frames (seed, parity vectors) over the
//! public authenticated channel. The port is synchronous: the driver owns
//! its frame and blocks on each exchange.

use crate::errors::CascadeError;
use std::sync::mpsc;
use std::time::Duration;

/// Reliable, ordered, blocking frame exchange with the peer instance.
pub trait CascadeChannel {
    /// Send one frame to the peer.
    fn send(&mut self, frame: Vec<u8>) -> Result<(), CascadeError>;

    /// Block until the peer's next frame arrives.
    fn recv(&mut self) -> Result<Vec<u8>, CascadeError>;
}

/// In-process channel pair for running both reconciliation sides locally.
pub struct MemoryChannel {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
    timeout: Duration,
}

impl MemoryChannel {
    /// Two connected endpoints; what one sends the other receives.
    pub fn pair() -> (MemoryChannel, MemoryChannel) {
        let (tx_a, rx_b) = mpsc::channel();
        let (tx_b, rx_a) = mpsc::channel();
        let timeout = Duration::from_secs(30);
        (
            MemoryChannel {
                tx: tx_a,
                rx: rx_a,
                timeout,
            },
            MemoryChannel {
                tx: tx_b,
                rx: rx_b,
                timeout,
            },
        )
    }
}

impl CascadeChannel for MemoryChannel {
    fn send(&mut self, frame: Vec<u8>) -> Result<(), CascadeError> {
        self.tx
            .send(frame)
            .map_err(|_| CascadeError::Transport("peer endpoint dropped".to_string()))
    }

    fn recv(&mut self) -> Result<Vec<u8>, CascadeError> {
        self.rx
            .recv_timeout(self.timeout)
            .map_err(|e| CascadeError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_crosses_frames() {
        let (mut a, mut b) = MemoryChannel::pair();
        a.send(vec![1, 2, 3]).unwrap();
        b.send(vec![9]).unwrap();
        assert_eq!(b.recv().unwrap(), vec![1, 2, 3]);
        assert_eq!(a.recv().unwrap(), vec![9]);
    }

    #[test]
    fn test_dropped_peer_is_transport_error() {
        let (mut a, b) = MemoryChannel::pair();
        drop(b);
        assert!(matches!(
            a.send(vec![0]),
            Err(CascadeError::Transport(_))
        ));
    }
}
