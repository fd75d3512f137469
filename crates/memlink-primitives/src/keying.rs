//! Deterministic OS-object identifiers derived from a channel name.
//!
//! Both peers only share a channel name, so every identifier must be a pure
//! function of it: a 31-bit System V key on POSIX, session-local object
//! names on Windows. No filesystem round-trip (`ftok`-style) is involved.

use crate::sem::SemIndex;

/// Which OS-object family a key is derived for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The shared memory segment.
    Segment,
    /// The semaphore set.
    Semaphore,
}

impl KeyKind {
    fn suffix(self) -> &'static str {
        match self {
            KeyKind::Segment => "_shm",
            KeyKind::Semaphore => "_sem",
        }
    }
}

/// Derive the System V key for `channel` and `kind`.
///
/// A djb2 rolling hash over `channel` plus the kind suffix, masked to 31
/// bits so the key is positive, with 0 remapped to 1 (0 is `IPC_PRIVATE`).
pub fn derive_key(channel: &str, kind: KeyKind) -> i32 {
    let mut hash: u32 = 0;
    for &byte in channel.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }
    for &byte in kind.suffix().as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u32);
    }

    let key = (hash & 0x7FFF_FFFF) as i32;
    if key == 0 { 1 } else { key }
}

/// Windows object name for the channel's shared memory segment.
///
/// The `Local\` session namespace is used rather than `Global\`, which would
/// require `SeCreateGlobalPrivilege`.
pub fn segment_name(channel: &str) -> String {
    format!(r"Local\{channel}_shm")
}

/// Windows object name for one semaphore of the channel's set.
pub fn semaphore_name(channel: &str, index: SemIndex) -> String {
    let suffix = match index {
        SemIndex::ServerWrite => "server_write",
        SemIndex::ServerRead => "server_read",
        SemIndex::ClientWrite => "client_write",
        SemIndex::ClientRead => "client_read",
    };
    format!(r"Local\{channel}_{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(
            derive_key("alpha", KeyKind::Segment),
            derive_key("alpha", KeyKind::Segment)
        );
    }

    #[test]
    fn kinds_produce_distinct_keys() {
        assert_ne!(
            derive_key("alpha", KeyKind::Segment),
            derive_key("alpha", KeyKind::Semaphore)
        );
    }

    #[test]
    fn names_produce_distinct_keys() {
        assert_ne!(
            derive_key("alpha", KeyKind::Segment),
            derive_key("beta", KeyKind::Segment)
        );
    }

    #[test]
    fn keys_are_always_positive() {
        for name in ["", "a", "some-channel", "\u{2603}", "x".repeat(300).as_str()] {
            for kind in [KeyKind::Segment, KeyKind::Semaphore] {
                assert!(derive_key(name, kind) > 0, "name={name:?} kind={kind:?}");
            }
        }
    }

    #[test]
    fn windows_names_follow_the_session_local_scheme() {
        assert_eq!(segment_name("chat"), r"Local\chat_shm");
        assert_eq!(
            semaphore_name("chat", SemIndex::ServerWrite),
            r"Local\chat_server_write"
        );
        assert_eq!(
            semaphore_name("chat", SemIndex::ClientRead),
            r"Local\chat_client_read"
        );
    }
}
