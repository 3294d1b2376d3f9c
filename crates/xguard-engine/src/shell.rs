/// POSIX single-quote escaping for values interpolated into remote shell
/// scripts. Addresses and container names are validated upstream, but every
/// interpolation still goes through here.
pub fn quote(s: &str) -> String {
    if !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric() || matches!(b, b'@' | b'%' | b'+' | b'=' | b':' | b',' | b'.' | b'/' | b'-' | b'_')
        })
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_strings_pass_through() {
        assert_eq!(quote("marzban-node"), "marzban-node");
        assert_eq!(quote("203.0.113.5"), "203.0.113.5");
        assert_eq!(quote("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn unsafe_strings_are_single_quoted() {
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote("$(reboot)"), "'$(reboot)'");
    }
}
