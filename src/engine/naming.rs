//! Zone parsing, instance naming, and serial-console key scanning.

/// Marker the server's startup script prints in front of its public key.
const KEY_MARKER: &str = "[PUBLIC_KEY] ";
const KEY_LENGTH: usize = 44;

/// Derives the region from a zone name by prefix, for example
/// `us-central1-a` → `us-central1`. Returns `None` when the zone does not
/// follow the `<letters>-<alnum>` convention.
#[must_use]
pub fn region_for_zone(zone: &str) -> Option<String> {
    let mut parts = zone.split('-');
    let family = parts.next()?;
    let locality = parts.next()?;
    if family.is_empty() || !family.chars().all(|ch| ch.is_ascii_lowercase()) {
        return None;
    }
    if locality.is_empty()
        || !locality
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{family}-{locality}"))
}

/// Final dash-separated segment of a zone name (`us-central1-a` → `a`).
#[must_use]
pub fn zone_letter(zone: &str) -> &str {
    zone.rsplit('-').next().unwrap_or(zone)
}

/// Canonical instance name for a deployment target.
#[must_use]
pub fn base_instance_name(prefix: &str, region: &str, zone: &str) -> String {
    format!("{prefix}-{region}-{}", zone_letter(zone))
}

/// Next rotation suffix number: one past the highest `<base>-rotate<N>`
/// among `names`, or 1 when none match.
#[must_use]
pub fn next_rotation_number(base: &str, names: &[String]) -> u32 {
    names
        .iter()
        .filter_map(|name| {
            name.strip_prefix(base)?
                .strip_prefix("-rotate")?
                .parse::<u32>()
                .ok()
        })
        .max()
        .map_or(1, |highest| highest.saturating_add(1))
}

/// Scans serial console output for the published WireGuard public key: a
/// 44-character base64 token ending in `=` after the key marker.
#[must_use]
pub fn extract_public_key(console_output: &str) -> Option<String> {
    for (index, _) in console_output.match_indices(KEY_MARKER) {
        let rest = console_output.get(index + KEY_MARKER.len()..)?;
        let candidate: String = rest.chars().take(KEY_LENGTH).collect();
        if is_wireguard_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Whether `candidate` has the shape of a WireGuard public key.
#[must_use]
pub fn is_wireguard_key(candidate: &str) -> bool {
    candidate.len() == KEY_LENGTH
        && candidate.ends_with('=')
        && candidate
            .chars()
            .take(KEY_LENGTH - 1)
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '+' || ch == '/')
}
