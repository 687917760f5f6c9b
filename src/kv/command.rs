/// A client command against the key-value store.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Sets a key to a value.
    Set { key: String, value: String },
    /// Fetches a key's value.
    Get { key: String },
    /// Deletes a key.
    Del { key: String },
    /// Lists all keys.
    Keys,
}

impl Command {
    /// Parses a command line. Parse failures are returned as the error
    /// response text (without trailing newline) to send back to the client.
    ///
    /// A field is either a double-quoted span (read up to the closing quote,
    /// no escapes) or a whitespace-delimited token. SET reads the key as a
    /// field and the value as the remainder of the line: if quoted, up to
    /// the matching quote, otherwise the rest of the line verbatim. This is
    /// what lets values with spaces round-trip through the journal.
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut chars = input.chars().peekable();
        let word = Self::scan_token(&mut chars);
        if word.is_empty() {
            return Err("ERR empty command".to_string());
        }
        match word.as_str() {
            "SET" => {
                let key = Self::scan_field(&mut chars);
                let value = Self::scan_value(&mut chars);
                match (key, value) {
                    (Some(key), Some(value)) if !key.is_empty() => Ok(Command::Set { key, value }),
                    _ => Err("ERR wrong number of arguments for 'SET'".to_string()),
                }
            }
            "GET" => match Self::scan_field(&mut chars) {
                Some(key) if !key.is_empty() => Ok(Command::Get { key }),
                _ => Err("ERR wrong number of arguments for 'GET'".to_string()),
            },
            "DEL" => match Self::scan_field(&mut chars) {
                Some(key) if !key.is_empty() => Ok(Command::Del { key }),
                _ => Err("ERR wrong number of arguments for 'DEL'".to_string()),
            },
            "KEYS" => Ok(Command::Keys),
            word => Err(format!("ERR unknown command '{word}'")),
        }
    }

    /// Returns the canonical journal line for mutating commands, quoting the
    /// fields so that keys and values with spaces replay correctly. Reads
    /// are never journaled.
    pub fn journal_line(&self) -> Option<String> {
        match self {
            Command::Set { key, value } => Some(format!("SET \"{key}\" \"{value}\"")),
            Command::Del { key } => Some(format!("DEL \"{key}\"")),
            Command::Get { .. } | Command::Keys => None,
        }
    }

    /// Consumes leading whitespace.
    fn skip_whitespace(chars: &mut std::iter::Peekable<std::str::Chars>) {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    /// Scans a whitespace-delimited token, skipping leading whitespace.
    fn scan_token(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
        Self::skip_whitespace(chars);
        let mut token = String::new();
        while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
            token.push(c);
        }
        token
    }

    /// Scans a field: a double-quoted span or a bare token. Returns None at
    /// end of input.
    fn scan_field(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
        Self::skip_whitespace(chars);
        chars.peek()?;
        if chars.next_if(|&c| c == '"').is_some() {
            let mut field = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                field.push(c);
            }
            Some(field)
        } else {
            Some(Self::scan_token(chars))
        }
    }

    /// Scans a SET value: a quoted span, or the rest of the line verbatim.
    /// Returns None at end of input.
    fn scan_value(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<String> {
        Self::skip_whitespace(chars);
        chars.peek()?;
        if chars.peek() == Some(&'"') {
            Self::scan_field(chars)
        } else {
            Some(chars.collect())
        }
    }
}
