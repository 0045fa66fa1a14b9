//! Generates session ids from the reduced alphabet.

use rand::Rng;

use relay_protocol::session_id::{ALPHABET, LENGTH};

/// Produces a fresh, uniformly random 6-character session id.
///
/// Collision handling against live registrations is the caller's
/// responsibility (see [`crate::session::store::SessionStore`] callers),
/// since only the store knows which ids are currently live.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::session_id;

    #[test]
    fn generates_ids_matching_the_grammar() {
        for _ in 0..1000 {
            let id = generate();
            assert!(session_id::is_valid(&id), "invalid id: {id}");
        }
    }

    #[test]
    fn generates_varied_ids() {
        let ids: std::collections::HashSet<_> = (0..100).map(|_| generate()).collect();
        assert!(ids.len() > 50, "ids look suspiciously non-random: {ids:?}");
    }
}
