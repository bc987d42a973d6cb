//! ASCII folding for text that is about to be printed.
//!
//! The encoder rejects non-ASCII input outright. Callers holding free-form
//! text (generated prompts, user captions) run it through
//! [`sanitize_for_receipt`] first.

/// Replacement for a single character.
enum Fold {
    /// Dropped entirely.
    Remove,
    /// Replaced in place.
    Text(&'static str),
    /// A word-like replacement that must not run into the previous word.
    Word(&'static str),
}

fn fold(c: char) -> Option<Fold> {
    let fold = match c {
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => Fold::Text("'"),
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' | '\u{00AB}' | '\u{00BB}' => {
            Fold::Text("\"")
        }
        '\u{2014}' | '\u{2015}' => Fold::Text("--"),
        '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2212}' => Fold::Text("-"),
        '\u{2026}' => Fold::Text("..."),
        '\u{2022}' | '\u{00B7}' => Fold::Text("*"),
        '\u{00D7}' => Fold::Text("x"),
        '\u{2192}' | '\u{27F6}' => Fold::Text("->"),
        '\u{2190}' | '\u{27F5}' => Fold::Text("<-"),
        '\u{2194}' => Fold::Text("<->"),
        '\u{21D2}' => Fold::Text("=>"),

        '\u{2122}' => Fold::Word("(TM)"),
        '\u{00A9}' => Fold::Word("(C)"),
        '\u{00AE}' => Fold::Word("(R)"),
        '\u{20AC}' => Fold::Word("EUR"),
        '\u{00A3}' => Fold::Word("GBP"),
        '\u{00BD}' => Fold::Word("1/2"),
        '\u{00BC}' => Fold::Word("1/4"),
        '\u{00BE}' => Fold::Word("3/4"),
        '\u{2153}' => Fold::Word("1/3"),
        '\u{2154}' => Fold::Word("2/3"),

        '\u{00A0}' | '\u{2002}'..='\u{200A}' | '\u{202F}' | '\u{205F}' | '\u{3000}' => Fold::Text(" "),
        '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}' => Fold::Remove,

        'À'..='Å' | 'Ā' | 'Ă' | 'Ą' => Fold::Text("A"),
        'à'..='å' | 'ā' | 'ă' | 'ą' => Fold::Text("a"),
        'Ç' | 'Ć' | 'Č' => Fold::Text("C"),
        'ç' | 'ć' | 'č' => Fold::Text("c"),
        'È'..='Ë' | 'Ē' | 'Ę' | 'Ě' => Fold::Text("E"),
        'è'..='ë' | 'ē' | 'ę' | 'ě' => Fold::Text("e"),
        'Ì'..='Ï' | 'Ī' => Fold::Text("I"),
        'ì'..='ï' | 'ī' | 'ı' => Fold::Text("i"),
        'Ñ' | 'Ń' | 'Ň' => Fold::Text("N"),
        'ñ' | 'ń' | 'ň' => Fold::Text("n"),
        'Ò'..='Ö' | 'Ø' | 'Ō' | 'Ő' => Fold::Text("O"),
        'ò'..='ö' | 'ø' | 'ō' | 'ő' => Fold::Text("o"),
        'Ù'..='Ü' | 'Ū' | 'Ů' | 'Ű' => Fold::Text("U"),
        'ù'..='ü' | 'ū' | 'ů' | 'ű' => Fold::Text("u"),
        'Ý' | 'Ÿ' => Fold::Text("Y"),
        'ý' | 'ÿ' => Fold::Text("y"),
        'Ś' | 'Š' => Fold::Text("S"),
        'ś' | 'š' => Fold::Text("s"),
        'Ź' | 'Ż' | 'Ž' => Fold::Text("Z"),
        'ź' | 'ż' | 'ž' => Fold::Text("z"),
        'Ł' => Fold::Text("L"),
        'ł' => Fold::Text("l"),
        'ß' => Fold::Text("ss"),
        'Æ' => Fold::Text("AE"),
        'æ' => Fold::Text("ae"),
        'Œ' => Fold::Text("OE"),
        'œ' => Fold::Text("oe"),
        _ => return None,
    };
    Some(fold)
}

/// Fold typographic Unicode to plain ASCII.
///
/// Known characters are transliterated; anything else outside printable
/// ASCII is dropped, except `\n` and `\t`.
pub fn sanitize_for_receipt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for c in text.chars() {
        if c == '\n' || c == '\t' || (' '..='~').contains(&c) {
            out.push(c);
            continue;
        }
        match fold(c) {
            Some(Fold::Text(s)) => out.push_str(s),
            Some(Fold::Word(s)) => {
                if !out.is_empty() && !out.ends_with(char::is_whitespace) {
                    out.push(' ');
                }
                out.push_str(s);
            }
            Some(Fold::Remove) | None => {}
        }
    }

    out
}
