//! Port-chain identity.
//!
//! A *port chain* is the canonical string naming a USB device location on the
//! host bus: `1-2`, `1-2.3`, or an OS-specific location token. It is the
//! primary identity of an Openterface unit — stable across enumeration passes
//! while the device stays plugged, unlike device nodes (`/dev/hidraw3`,
//! `COM7`) which the OS hands out in arrival order.
//!
//! Everything here is a pure function on `&str`. All functions are total:
//! arbitrary input never fails, and the empty string never relates to
//! anything (empty means "unknown location").

/// Returns the hub-port prefix of a port chain: everything up to the last
/// `.`, or the chain itself when it has no dot.
///
/// `1-2.1` → `1-2`, `1-2` → `1-2`. Interfaces of one composite device share
/// a hub port, so this is the grouping key the correlator merges on.
pub fn hub_port(chain: &str) -> &str {
    match chain.rfind('.') {
        Some(idx) => &chain[..idx],
        None => chain,
    }
}

/// True iff `sub` is a direct interface path of `parent`: `parent` followed
/// by a `.` and one or more digits (`1-2.1` is an interface of `1-2`).
pub fn is_interface_of(sub: &str, parent: &str) -> bool {
    if parent.is_empty() || sub.len() <= parent.len() + 1 {
        return false;
    }
    let Some(rest) = sub.strip_prefix(parent) else {
        return false;
    };
    let Some(digits) = rest.strip_prefix('.') else {
        return false;
    };
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Whether two port chains plausibly belong to the same physical unit.
///
/// True when the chains are identical, one is a dotted prefix of the other,
/// both hang off the same hub port (siblings), or they differ only in a
/// trailing integer by at most 2 (adjacent ports on one hub, the shape the
/// split-serial generations present). Empty chains relate to nothing.
pub fn related(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    if is_interface_of(a, b) || is_interface_of(b, a) {
        return true;
    }
    // Siblings: same prefix before the last dot.
    if a.contains('.') && b.contains('.') && hub_port(a) == hub_port(b) {
        return true;
    }
    // Adjacent ports: same prefix, trailing integers within 2 of each other.
    if let (Some((pre_a, num_a)), Some((pre_b, num_b))) = (split_trailing_int(a), split_trailing_int(b)) {
        if pre_a == pre_b {
            return num_a.abs_diff(num_b) <= 2;
        }
    }
    false
}

/// Increments the trailing integer of a hub port: `1-4` → `1-5`,
/// `1-4.2` → `1-4.3`. Returns `None` when the string has no trailing
/// integer.
///
/// This encodes the Gen2/Gen3 firmware layout: the split serial device
/// enumerates one port number above the integrated video/HID device.
pub fn next_numeric(chain: &str) -> Option<String> {
    let (prefix, num) = split_trailing_int(chain)?;
    Some(format!("{prefix}{}", num + 1))
}

/// Splits `…N` into (`…`, N) where N is the maximal trailing decimal run.
/// The numeric part saturates rather than overflowing on absurd input.
fn split_trailing_int(s: &str) -> Option<(&str, u64)> {
    let digits_at = s.rfind(|c: char| !c.is_ascii_digit()).map_or(0, |i| i + 1);
    let digits = &s[digits_at..];
    if digits.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for b in digits.bytes() {
        value = value.saturating_mul(10).saturating_add(u64::from(b - b'0'));
    }
    Some((&s[..digits_at], value))
}
