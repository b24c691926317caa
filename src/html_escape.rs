use std::borrow::Cow;

/// Escape HTML special characters: & < > " '
///
/// Borrows the input unchanged when nothing needs escaping, which is the
/// common case for interpolated values.
pub fn escape(input: &str) -> Cow<'_, str> {
    let Some(first) = input.find(|c| matches!(c, '&' | '<' | '>' | '"' | '\'')) else {
        return Cow::Borrowed(input);
    };
    let mut output = String::with_capacity(input.len() + 8);
    output.push_str(&input[..first]);
    for c in input[first..].chars() {
        match c {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            '\'' => output.push_str("&#39;"),
            _ => output.push(c),
        }
    }
    Cow::Owned(output)
}
