//! Narration fragments: the short lines the outbox batches into spoken messages.

pub fn greeting(nick: &str) -> String {
    format!("{} sagt hallo", nick)
}

pub fn thanks(nick: &str) -> String {
    format!("{} bedankt sich", nick)
}

pub fn reply(nick: &str, comment: &str, answer: &str) -> String {
    format!("@{}: {} → {}", nick, comment, answer)
}

pub fn gift(nick: &str, gift_name: &str, count: u32) -> String {
    format!("{} sent {} x{}", nick, gift_name, count)
}

pub fn followed(nick: &str) -> String {
    format!("{} followed", nick)
}

pub fn shared(nick: &str) -> String {
    format!("{} shared", nick)
}

pub fn subscribed(nick: &str) -> String {
    format!("{} subscribed", nick)
}

pub fn liked(nick: &str, count: u32) -> String {
    format!("{} liked x{}", nick, count)
}

/// Batched welcome for viewers confirmed present.
pub fn newcomers(names: &[String]) -> String {
    format!("Neu dabei: {}", names.join(", "))
}

/// Trim and cap a line at `max_chars` characters, ending a cut line with `…`.
pub fn fit_line(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates() {
        assert_eq!(gift("Anna", "Rose", 5), "Anna sent Rose x5");
        assert_eq!(reply("Bo", "warum?", "darum."), "@Bo: warum? → darum.");
        assert_eq!(newcomers(&["a".into(), "b".into()]), "Neu dabei: a, b");
    }

    #[test]
    fn fit_line_caps_length() {
        assert_eq!(fit_line("  kurz ", 140), "kurz");
        let long = "ä".repeat(200);
        let cut = fit_line(&long, 140);
        assert_eq!(cut.chars().count(), 140);
        assert!(cut.ends_with('…'));
    }
}
