//! Voice catalog.
//!
//! The voice service binds a voice per session, so the id string is all
//! that crosses the wire (`start_session.voice`).  The catalog exists to
//! populate the picker and to reject ids the service would not accept.

// ---------------------------------------------------------------------------
// VoiceInfo
// ---------------------------------------------------------------------------

/// Static display metadata for one synthesized voice.
#[derive(Debug, PartialEq, Eq)]
pub struct VoiceInfo {
    /// Identifier sent in `start_session` (e.g. `"nova"`).
    pub id: &'static str,
    /// Name shown in the voice picker.
    pub display_name: &'static str,
    /// One-line character description.
    pub description: &'static str,
}

/// Voices offered by the realtime service.
pub const VOICES: &[VoiceInfo] = &[
    VoiceInfo {
        id: "alloy",
        display_name: "Alloy",
        description: "Neutral and balanced",
    },
    VoiceInfo {
        id: "ash",
        display_name: "Ash",
        description: "Clear and direct",
    },
    VoiceInfo {
        id: "ballad",
        display_name: "Ballad",
        description: "Warm and melodic",
    },
    VoiceInfo {
        id: "coral",
        display_name: "Coral",
        description: "Friendly and upbeat",
    },
    VoiceInfo {
        id: "echo",
        display_name: "Echo",
        description: "Calm and resonant",
    },
    VoiceInfo {
        id: "fable",
        display_name: "Fable",
        description: "Expressive storyteller",
    },
    VoiceInfo {
        id: "nova",
        display_name: "Nova",
        description: "Bright and energetic",
    },
    VoiceInfo {
        id: "onyx",
        display_name: "Onyx",
        description: "Deep and authoritative",
    },
    VoiceInfo {
        id: "sage",
        display_name: "Sage",
        description: "Soft and thoughtful",
    },
    VoiceInfo {
        id: "shimmer",
        display_name: "Shimmer",
        description: "Light and gentle",
    },
    VoiceInfo {
        id: "verse",
        display_name: "Verse",
        description: "Versatile and articulate",
    },
];

/// Voice used when the configured default is not in the catalog.
pub const FALLBACK_VOICE: &str = "alloy";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Look up a voice by id (exact, case-sensitive).
///
/// ```rust
/// use voice_assistant::session::find_voice;
///
/// assert_eq!(find_voice("nova").map(|v| v.display_name), Some("Nova"));
/// assert!(find_voice("Nova").is_none());
/// ```
pub fn find_voice(id: &str) -> Option<&'static VoiceInfo> {
    VOICES.iter().find(|v| v.id == id)
}

pub fn is_known_voice(id: &str) -> bool {
    find_voice(id).is_some()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<&str> = VOICES.iter().map(|v| v.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), VOICES.len());
    }

    #[test]
    fn fallback_voice_is_in_catalog() {
        assert!(is_known_voice(FALLBACK_VOICE));
    }

    #[test]
    fn relay_default_voices_are_listed() {
        for id in ["alloy", "echo", "nova", "shimmer"] {
            assert!(is_known_voice(id), "{id} missing");
        }
    }

    #[test]
    fn unknown_voice_is_rejected() {
        assert!(find_voice("").is_none());
        assert!(find_voice("robot").is_none());
    }

    #[test]
    fn metadata_is_filled_in() {
        for v in VOICES {
            assert!(!v.display_name.is_empty(), "{}", v.id);
            assert!(!v.description.is_empty(), "{}", v.id);
        }
    }
}
