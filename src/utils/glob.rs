use bytes::Bytes;

/// Escapes glob metacharacters so `prefix` matches literally inside `MATCH`
/// and `PSUBSCRIBE` patterns.
pub(crate) fn escape_glob(prefix: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(prefix.len() + 1);
    for &b in prefix {
        if matches!(b, b'*' | b'?' | b'[' | b']' | b'\\' | b'^') {
            escaped.push(b'\\');
        }
        escaped.push(b);
    }
    escaped
}

/// Pattern matching every key that starts with `prefix`
pub(crate) fn prefix_pattern(prefix: &[u8]) -> Bytes {
    let mut pattern = escape_glob(prefix);
    pattern.push(b'*');
    Bytes::from(pattern)
}
