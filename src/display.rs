//! User-facing surface. The engine only knows this trait; the binary wires
//! in a console implementation and tests substitute a recording one.

/// Everything the engine ever shows a user.
pub trait Display: Send + Sync {
    /// Short standby/listening/speaking status line.
    fn update_status(&self, status: &str);

    /// A chat line, attributed to "user" or "assistant".
    fn update_text(&self, role: &str, text: &str);

    /// Emotion tag from the server, see [`emotion_glyph`].
    fn update_emotion(&self, emotion: &str);

    fn update_connection_status(&self, connected: bool);

    /// Something went wrong badly enough that the user should know.
    fn alert(&self, title: &str, message: &str);
}

/// Maps a server emotion tag to a glyph. Unknown tags fall back to neutral.
pub fn emotion_glyph(emotion: &str) -> &'static str {
    match emotion {
        "neutral" => "😶",
        "happy" => "🙂",
        "laughing" => "😆",
        "funny" => "😂",
        "sad" => "😔",
        "angry" => "😠",
        "crying" => "😭",
        "loving" => "😍",
        "embarrassed" => "😳",
        "surprised" => "😲",
        "shocked" => "😱",
        "thinking" => "🤔",
        "winking" => "😉",
        "cool" => "😎",
        "relaxed" => "😌",
        "delicious" => "🤤",
        "kissy" => "😘",
        "confident" => "😏",
        "sleepy" => "😴",
        "silly" => "😜",
        "confused" => "🙄",
        _ => "😶",
    }
}

/// Prints everything to stdout/stderr. Good enough for a headless box.
pub struct ConsoleDisplay;

impl Display for ConsoleDisplay {
    fn update_status(&self, status: &str) {
        println!("[{status}]");
    }

    fn update_text(&self, role: &str, text: &str) {
        println!("{role}: {text}");
    }

    fn update_emotion(&self, emotion: &str) {
        println!("{}", emotion_glyph(emotion));
    }

    fn update_connection_status(&self, connected: bool) {
        if connected {
            println!("[connected]");
        } else {
            println!("[disconnected]");
        }
    }

    fn alert(&self, title: &str, message: &str) {
        eprintln!("⚠️  {title}: {message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_emotion_falls_back_to_neutral() {
        assert_eq!(emotion_glyph("neutral"), emotion_glyph("no-such-tag"));
        assert_ne!(emotion_glyph("happy"), emotion_glyph("sad"));
    }
}
