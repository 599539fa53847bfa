//! Service identification from connect banners using nmap-service-probes
//! `match` rules.

mod rules;
mod scan;
mod template;

pub use rules::{Rule, RuleError, RuleSet, ServiceMatch, DEFAULT_PROBES_PATH};
pub use scan::{record_match, version_scan, version_scan_ports, REASON_VERSION};
pub use template::VersionInfo;
