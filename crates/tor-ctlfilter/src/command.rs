//! Splitting control-protocol command lines into their parts.
//!
//! The control protocol's command grammar is loose: a keyword, then
//! arguments whose syntax depends on the keyword.  We parse only as much as
//! the filter needs in order to decide what to do with a line, and we treat
//! anything we can't parse as a reason to refuse it.

use crate::portmap::PortMapError;

/// The kinds of command that the filter handles differently from one another.
///
/// Every command the filter doesn't single out is [`CommandKind::Other`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum CommandKind {
    /// `PROTOCOLINFO`: we answer this ourselves.
    ProtocolInfo,
    /// `AUTHENTICATE`: we answer this ourselves.
    Authenticate,
    /// `AUTHCHALLENGE`: part of SAFECOOKIE negotiation, which we never offer.
    AuthChallenge,
    /// `QUIT`: we answer this ourselves and hang up.
    Quit,
    /// `ADD_ONION`: allowed only if none of its port mappings reach a
    /// denied target.
    AddOnion,
    /// Anything else.
    Other,
}

/// How the filter evaluates a given [`CommandKind`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Strategy {
    /// Reply with our own PROTOCOLINFO answer.
    AnswerProtocolInfo,
    /// Reply with a successful authentication.
    AnswerAuthenticate,
    /// Reply, then end the session.
    AnswerQuit,
    /// Refuse, whatever the policy says.
    Refuse,
    /// Apply the policy's rules, then check the line's onion service port
    /// mappings against the deny list.
    RulesThenOnionCheck,
    /// Apply the policy's rules.
    Rules,
}

impl CommandKind {
    /// Classify a command keyword.  Keywords are case-insensitive.
    pub fn from_keyword(keyword: &str) -> Self {
        use CommandKind as K;
        const KINDS: &[(&str, CommandKind)] = &[
            ("PROTOCOLINFO", K::ProtocolInfo),
            ("AUTHENTICATE", K::Authenticate),
            ("AUTHCHALLENGE", K::AuthChallenge),
            ("QUIT", K::Quit),
            ("ADD_ONION", K::AddOnion),
        ];
        KINDS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(keyword))
            .map(|(_, kind)| *kind)
            .unwrap_or(K::Other)
    }

    /// Return the evaluation strategy for this kind of command.
    pub(crate) fn strategy(self) -> Strategy {
        use CommandKind as K;
        use Strategy as S;
        match self {
            K::ProtocolInfo => S::AnswerProtocolInfo,
            K::Authenticate => S::AnswerAuthenticate,
            K::AuthChallenge => S::Refuse,
            K::Quit => S::AnswerQuit,
            K::AddOnion => S::RulesThenOnionCheck,
            K::Other => S::Rules,
        }
    }

    /// Return true if a client may send this command before it has
    /// authenticated.
    pub(crate) fn permitted_before_auth(self) -> bool {
        use CommandKind as K;
        matches!(
            self,
            K::ProtocolInfo | K::Authenticate | K::AuthChallenge | K::Quit
        )
    }
}

/// A reason why a command line could not be parsed.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MalformedCommand {
    /// The line was empty, or began with a space.
    #[error("Empty command")]
    Empty,
    /// The line was not valid UTF-8.
    #[error("Command was not valid UTF-8")]
    InvalidUtf8,
    /// The line contained a NUL or a bare CR.
    #[error("Command contained a forbidden control character")]
    ControlCharacter,
    /// The client tried to send a multi-line (`+`) command.
    #[error("Multi-line commands are not supported")]
    MultiLine,
    /// A quoted string in the arguments was not terminated or had a bad escape.
    #[error("Badly quoted argument")]
    BadQuoting,
    /// An `ADD_ONION` port mapping was malformed.
    #[error("Invalid port mapping")]
    PortMapping(#[from] PortMapError),
}

/// A single command line from a client, split into keyword and arguments.
#[derive(Clone, Debug)]
pub struct Command<'a> {
    /// The whole line, without its terminator.
    line: &'a str,
    /// The first word of the line.
    keyword: &'a str,
    /// Everything after the first separator.
    args: &'a str,
    /// What kind of command this is.
    kind: CommandKind,
}

impl<'a> Command<'a> {
    /// Split `line` (which must not include its line terminator) into a
    /// command.
    pub fn parse(line: &'a str) -> Result<Self, MalformedCommand> {
        if line.contains(['\0', '\r', '\n']) {
            return Err(MalformedCommand::ControlCharacter);
        }
        if line.starts_with('+') {
            return Err(MalformedCommand::MultiLine);
        }
        let (keyword, args) = line.split_once(is_separator).unwrap_or((line, ""));
        if keyword.is_empty() {
            return Err(MalformedCommand::Empty);
        }
        Ok(Command {
            line,
            keyword,
            args,
            kind: CommandKind::from_keyword(keyword),
        })
    }

    /// Return the whole line.
    pub fn line(&self) -> &'a str {
        self.line
    }

    /// Return the command keyword, as the client spelled it.
    pub fn keyword(&self) -> &'a str {
        self.keyword
    }

    /// Return everything after the keyword.
    pub fn args(&self) -> &'a str {
        self.args
    }

    /// Return the kind of this command.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }
}

/// Return true if `ch` separates words in a command line.
///
/// Tor ends a keyword or an argument at any of these, not just at a space.
pub(crate) fn is_separator(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\x0b' | '\x0c')
}

/// Split a command's arguments on separators, keeping double-quoted strings
/// (which may contain spaces) together.
///
/// The tokens are returned as they appear in the line, quotes included;
/// use [`unquote`] to decode them.
pub(crate) fn split_args(args: &str) -> Result<Vec<&str>, MalformedCommand> {
    let mut tokens = Vec::new();
    let mut start = None;
    let mut in_quote = false;
    let mut escaped = false;

    for (idx, ch) in args.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            ch if is_separator(ch) => {
                if let Some(s) = start.take() {
                    tokens.push(&args[s..idx]);
                }
            }
            _ => {
                if start.is_none() {
                    start = Some(idx);
                }
                if ch == '"' {
                    in_quote = true;
                }
            }
        }
    }
    if in_quote {
        return Err(MalformedCommand::BadQuoting);
    }
    if let Some(s) = start {
        tokens.push(&args[s..]);
    }
    Ok(tokens)
}

/// Decode `s` if it is a quoted string; otherwise return it unchanged.
///
/// An unquoted string may not contain a double quote.
pub(crate) fn unquote(s: &str) -> Result<String, MalformedCommand> {
    let Some(inner) = s.strip_prefix('"') else {
        if s.contains('"') {
            return Err(MalformedCommand::BadQuoting);
        }
        return Ok(s.to_owned());
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '"' => {
                // The closing quote has to be the last thing in the token.
                return if chars.next().is_none() {
                    Ok(out)
                } else {
                    Err(MalformedCommand::BadQuoting)
                };
            }
            '\\' => match chars.next() {
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some('\'') => out.push('\''),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                _ => return Err(MalformedCommand::BadQuoting),
            },
            c => out.push(c),
        }
    }
    Err(MalformedCommand::BadQuoting)
}

/// Encode `s` as a quoted string.
pub(crate) fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
