//! First-RDN extraction
//!
//! Member references are resolved once per member per query, so the
//! identifier is taken with two string splits instead of a full DN parser.
//! This is only correct for entries whose naming value never contains an
//! unescaped `,` or `=`, which holds for users, groups and computers.

/// Value of the first relative distinguished name.
///
/// `"uid=alice,cn=users,dc=example"` yields `"alice"`. A component without
/// `=` is returned whole.
pub fn first_rdn_value(dn: &str) -> &str {
    let rdn = match find_unescaped(dn, b',') {
        Some(idx) => &dn[..idx],
        None => dn,
    };
    match find_unescaped(rdn, b'=') {
        Some(idx) => &rdn[idx + 1..],
        None => rdn,
    }
}

fn find_unescaped(s: &str, needle: u8) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut escaped = false;
    for (idx, &b) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            _ if b == needle => return Some(idx),
            _ => {}
        }
    }
    None
}
