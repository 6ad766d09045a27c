//! Port traits: the narrow seams the engine depends on.

pub mod store;

pub use store::KeyStoreBackend;

/// Consumer of decoded application payloads.
///
/// Typically a virtual network interface or a local message queue; the
/// engine calls this for every successfully decoded DATA message.
pub trait DataSink: Send {
    fn recv_data(&mut self, data: &[u8]);
}

/// A sink that simply collects payloads; useful for tests and tooling.
#[derive(Debug, Default)]
pub struct CollectingSink {
    pub received: Vec<Vec<u8>>,
}

impl DataSink for CollectingSink {
    fn recv_data(&mut self, data: &[u8]) {
        self.received.push(data.to_vec());
    }
}
