use crate::model::ChatMessage;

/// Room-scoped display mode. Not persisted past the room session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TranslationMode {
    #[default]
    Off,
    On,
}

impl TranslationMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            TranslationMode::On
        } else {
            TranslationMode::Off
        }
    }

    pub fn is_on(self) -> bool {
        self == TranslationMode::On
    }

    pub fn toggled(self) -> Self {
        TranslationMode::from_enabled(!self.is_on())
    }

    /// The text to render for `message` under this mode.
    ///
    /// A message loaded in translated mode that the server could not
    /// translate still shows its original text.
    pub fn display_content(self, message: &ChatMessage) -> &str {
        match self {
            TranslationMode::Off => &message.origin_content,
            TranslationMode::On => message
                .translated_content
                .as_deref()
                .unwrap_or(&message.origin_content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(translated: Option<&str>) -> ChatMessage {
        ChatMessage {
            id: 1,
            room_id: 1,
            sender_id: 1,
            sender_display_name: "a".into(),
            sender_avatar_url: None,
            origin_content: "안녕".into(),
            translated_content: translated.map(str::to_string),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn projects_the_right_field() {
        let msg = message(Some("hello"));
        assert_eq!(TranslationMode::Off.display_content(&msg), "안녕");
        assert_eq!(TranslationMode::On.display_content(&msg), "hello");
        assert_eq!(TranslationMode::On.display_content(&message(None)), "안녕");
    }

    #[test]
    fn toggles() {
        assert_eq!(TranslationMode::Off.toggled(), TranslationMode::On);
        assert_eq!(TranslationMode::On.toggled(), TranslationMode::Off);
    }
}
