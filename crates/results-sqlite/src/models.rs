pub use recon_core::store::{
    HostId, HostPortWrite, OsGuess, OsGuessRow, PortId, PortRecord, PortSummary, ServiceId,
};

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Confidence stored when a guess arrives without one.
pub const UNKNOWN_CONFIDENCE: &str = "unknown";

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}
