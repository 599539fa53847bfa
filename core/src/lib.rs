//! Core types and collaborator traits shared by the recon engine crates.

pub mod model;
pub mod net;
pub mod options;
pub mod store;
#[cfg(feature = "mock")]
pub mod mock;

pub use model::{
    tcp_flags, Classification, PortStatus, ProbeOutcome, TcpProbe, TcpReply, Technique,
    UnknownStatus,
};
pub use net::{HttpHeaders, HttpProbe, PacketTransport};
pub use options::ScanOptions;
pub use store::{
    HostId, HostPortWrite, OsGuess, OsGuessRow, PortId, PortRecord, PortSummary, ResultStore,
    ServiceId,
};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Protocol label stored for every port this engine probes.
pub const TCP: &str = "tcp";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }
}
