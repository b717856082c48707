//! Deterministic resource names.
//!
//! Names are the only idempotency key: re-running against a live
//! experiment finds the same resources by name instead of creating new
//! ones.

/// Monitoring aggregator of an experiment.
pub fn aggregator_name(experiment: &str) -> String {
    format!("BonFIRE-monitor-experiment{experiment}")
}

/// Metric server of an experiment.
pub fn server_name(experiment: &str) -> String {
    format!("server-experiment{experiment}")
}

/// Private inter-VM network of an experiment.
pub fn private_network_name(experiment: &str) -> String {
    format!("network-experiment{experiment}")
}

/// Suffix shared by every client of an experiment.
pub fn client_suffix(experiment: &str) -> String {
    format!("client-e{experiment}")
}

/// Client `ordinal` placed at `location`.
pub fn client_name(location: &str, ordinal: u32, experiment: &str) -> String {
    format!("{location}-{ordinal}-{}", client_suffix(experiment))
}

/// Ordinal encoded in a client name, if it is one of `experiment`'s clients.
pub fn client_ordinal(name: &str, experiment: &str) -> Option<u32> {
    let suffix = format!("-{}", client_suffix(experiment));
    let head = name.strip_suffix(&suffix)?;
    let (_, ordinal) = head.rsplit_once('-')?;
    ordinal.parse().ok()
}

/// Private address of client `ordinal` in the block starting at `base`.
///
/// `base` is a dotted quad such as `192.168.0.0`; the last octet becomes
/// `offset + ordinal`.
pub fn client_private_ip(base: &str, offset: u32, ordinal: u32) -> Option<String> {
    let (prefix, _) = base.rsplit_once('.')?;
    let host = offset.checked_add(ordinal)?;
    if host > 254 {
        return None;
    }
    Some(format!("{prefix}.{host}"))
}
