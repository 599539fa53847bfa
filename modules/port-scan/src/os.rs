//! OS family guesses from response TTLs and banner hints.

use anyhow::Result;
use recon_core::{HostId, OsGuess, ResultStore};

/// Common initial TTLs. Declaration order settles ties.
pub const TTL_REFERENCES: [(u8, &str); 3] =
    [(64, "Linux/Unix"), (128, "Windows"), (255, "Cisco/Network device/BSD")];

pub const TTL_METHOD: &str = "ttl-guess";
pub const TTL_CONFIDENCE: &str = "medium";

/// OS family whose reference TTL lies closest to `ttl`; ties go to the lower reference.
pub fn guess_os_from_ttl(ttl: u8) -> &'static str {
    let distance = |reference: u8| (i16::from(reference) - i16::from(ttl)).abs();
    let mut best = TTL_REFERENCES[0];
    for candidate in &TTL_REFERENCES[1..] {
        if distance(candidate.0) < distance(best.0) {
            best = *candidate;
        }
    }
    best.1
}

/// Record the TTL guess for a host. No observation, no guess.
pub fn record_ttl_guess(store: &dyn ResultStore, host_id: HostId, ttl: Option<u8>) -> Result<bool> {
    let Some(ttl) = ttl else { return Ok(false) };
    let guess = OsGuess {
        os_name: guess_os_from_ttl(ttl).to_string(),
        method: TTL_METHOD.to_string(),
        confidence: Some(TTL_CONFIDENCE.to_string()),
        notes: format!("Observed TTL: {}", ttl),
    };
    store.upsert_os_guess(host_id, &guess)
}

/// Record an OS named by a service banner, e.g. `o/Linux/` in a version template.
pub fn record_banner_os_hint(
    store: &dyn ResultStore,
    host_id: HostId,
    os_name: &str,
    service: &str,
) -> Result<bool> {
    let guess = OsGuess {
        os_name: os_name.to_string(),
        method: format!("banner-{}", service),
        confidence: None,
        notes: "From service detection".to_string(),
    };
    store.upsert_os_guess(host_id, &guess)
}
