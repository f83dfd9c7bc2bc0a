//! Speech markup construction.

use crate::config::TtsConfig;

/// Wrap `text` in a voice and prosody envelope.
pub fn build_ssml(text: &str, config: &TtsConfig) -> String {
    format!(
        "<speak version=\"1.0\" xmlns=\"http://www.w3.org/2001/10/synthesis\" xml:lang=\"{lang}\">\
         <voice name=\"{voice}\">\
         <prosody rate=\"{rate}\" pitch=\"{pitch}\" volume=\"{volume}\">{text}</prosody>\
         </voice></speak>",
        lang = escape(&config.language),
        voice = escape(&config.voice),
        rate = escape(&config.rate),
        pitch = escape(&config.pitch),
        volume = escape(&config.volume),
        text = escape(text),
    )
}

/// Escape the five XML special characters.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Plain text of a markup document, for synthesizers that cannot render
/// markup. Tags are dropped and entities decoded.
pub fn strip_markup(markup: &str) -> String {
    let mut text = String::with_capacity(markup.len());
    let mut in_tag = false;
    for ch in markup.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
