//! Makes build output safe to echo to a terminal and to write into log files.

const MAX_LINE_CHARS: usize = 2048;

#[derive(Clone, Copy)]
enum State {
    Text,
    /// After ESC.
    Escape,
    /// `ESC [` ... final byte in `@..=~`.
    Csi,
    /// `ESC ]`, `ESC P`, `ESC X`, `ESC ^`, `ESC _` ... terminated by BEL or `ESC \`.
    String { bel_ends: bool },
    /// ESC seen inside a string sequence.
    StringEscape { bel_ends: bool },
}

fn is_bidi_control(c: char) -> bool {
    matches!(
        c,
        '\u{061C}' | '\u{200E}' | '\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

/// Drops escape sequences, control and bidi characters; tabs become spaces; caps the length.
pub fn sanitize_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut state = State::Text;
    let mut kept = 0usize;

    for c in input.chars() {
        if kept >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
        state = match (state, c) {
            (State::Text, '\x1b') => State::Escape,
            (State::Text, '\t') => {
                out.push(' ');
                kept += 1;
                State::Text
            }
            (State::Text, c) if c.is_control() || is_bidi_control(c) => State::Text,
            (State::Text, c) => {
                out.push(c);
                kept += 1;
                State::Text
            }
            (State::Escape, '[') => State::Csi,
            (State::Escape, ']') => State::String { bel_ends: true },
            (State::Escape, 'P' | 'X' | '^' | '_') => State::String { bel_ends: false },
            (State::Escape, _) => State::Text,
            (State::Csi, '@'..='~') => State::Text,
            (State::Csi, _) => State::Csi,
            (State::String { bel_ends: true }, '\x07') => State::Text,
            (State::String { bel_ends }, '\x1b') => State::StringEscape { bel_ends },
            (State::String { bel_ends }, _) => State::String { bel_ends },
            (State::StringEscape { .. }, '\\') => State::Text,
            (State::StringEscape { bel_ends }, '\x1b') => State::StringEscape { bel_ends },
            (State::StringEscape { bel_ends }, _) => State::String { bel_ends },
        };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::sanitize_line;

    #[test]
    fn colour_codes_and_titles_are_removed() {
        let got = sanitize_line("\u{1b}[1;31merror:\u{1b}[0m ld \u{1b}]0;make\u{7}returned 1");
        assert_eq!(got, "error: ld returned 1");
    }

    #[test]
    fn device_control_strings_are_removed() {
        assert_eq!(sanitize_line("x\u{1b}Pq#0;2;0;0;0\u{1b}\\y"), "xy");
    }

    #[test]
    fn control_and_bidi_characters_are_removed() {
        assert_eq!(sanitize_line("gcc\t-O2\r\u{202e}\u{0}x"), "gcc -O2x");
    }

    #[test]
    fn long_lines_are_capped() {
        let got = sanitize_line(&"a".repeat(10_000));
        assert!(got.ends_with("...[truncated]"));
        assert!(got.len() < 2100);
    }
}
