//! Wire grammar of the control protocol.
//!
//! Inbound notifications have the shape
//! `<ACTION> <SUBJECT> [<PROPERTY> [<VALUE...>]]`; outbound commands are
//! built with [`Command`] and rendered to the same single-line text.

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Call,
    Chat,
    Group,
    User,
    WindowState,
    SkypeVersion,
    ConnStatus,
    CurrentUserHandle,
    UserStatus,
    ChatMember,
    Error,
    Protocol,
}

impl Action {
    /// Matches the wire name exactly; `call` is not `CALL`.
    pub fn parse(token: &str) -> Option<Self> {
        let action = match token {
            "CALL" => Self::Call,
            "CHAT" => Self::Chat,
            "GROUP" => Self::Group,
            "USER" => Self::User,
            "WINDOWSTATE" => Self::WindowState,
            "SKYPEVERSION" => Self::SkypeVersion,
            "CONNSTATUS" => Self::ConnStatus,
            "CURRENTUSERHANDLE" => Self::CurrentUserHandle,
            "USERSTATUS" => Self::UserStatus,
            "CHATMEMBER" => Self::ChatMember,
            "ERROR" => Self::Error,
            "PROTOCOL" => Self::Protocol,
            _ => return None,
        };
        Some(action)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "CALL",
            Self::Chat => "CHAT",
            Self::Group => "GROUP",
            Self::User => "USER",
            Self::WindowState => "WINDOWSTATE",
            Self::SkypeVersion => "SKYPEVERSION",
            Self::ConnStatus => "CONNSTATUS",
            Self::CurrentUserHandle => "CURRENTUSERHANDLE",
            Self::UserStatus => "USERSTATUS",
            Self::ChatMember => "CHATMEMBER",
            Self::Error => "ERROR",
            Self::Protocol => "PROTOCOL",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Soft failure while turning an inbound payload into state.
///
/// These are logged and the single update is dropped; they never reach the
/// caller of a client operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload has fewer than two tokens")]
    TooFewTokens,
    #[error("unrecognized action {0:?}")]
    UnknownAction(String),
    #[error(transparent)]
    Frame(#[from] crate::transport::FrameError),
    #[error("{entity} has no property {property:?}")]
    UnknownProperty {
        entity: &'static str,
        property: String,
    },
    #[error("property {property} requires a value")]
    MissingValue { property: String },
    #[error("cannot convert {value:?} for {property}: {reason}")]
    InvalidValue {
        property: String,
        value: String,
        reason: String,
    },
    #[error("peer error code {0:?} is not numeric")]
    InvalidErrorCode(String),
}

/// One tokenized inbound notification, borrowing from the payload text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyUpdate<'a> {
    pub action: Action,
    pub subject: &'a str,
    pub property: Option<&'a str>,
    pub value: Option<&'a str>,
    /// Everything after the subject, for actions whose payload is free text.
    pub tail: Option<&'a str>,
}

/// Splits a payload on single spaces.
///
/// Token 0 is the action, token 1 the subject, token 2 the property and
/// tokens 3.. are rejoined with single spaces as the value. Taking the
/// remainder verbatim after the third separator gives the same text.
pub fn tokenize(text: &str) -> Result<PropertyUpdate<'_>, DecodeError> {
    let (action, rest) = text.split_once(' ').ok_or(DecodeError::TooFewTokens)?;
    let (subject, tail) = match rest.split_once(' ') {
        Some((subject, tail)) => (subject, Some(tail)),
        None => (rest, None),
    };
    if subject.is_empty() {
        return Err(DecodeError::TooFewTokens);
    }
    let action =
        Action::parse(action).ok_or_else(|| DecodeError::UnknownAction(action.to_string()))?;
    let (property, value) = match tail {
        Some(tail) => match tail.split_once(' ') {
            Some((property, value)) => (Some(property), Some(value)),
            None => (Some(tail), None),
        },
        None => (None, None),
    };

    Ok(PropertyUpdate {
        action,
        subject,
        property,
        value,
        tail,
    })
}

/// Parses `ERROR <code> <message...>` into its numeric code and message.
pub fn parse_peer_error(update: &PropertyUpdate<'_>) -> Result<(u32, String), DecodeError> {
    let code = update
        .subject
        .parse::<u32>()
        .map_err(|_| DecodeError::InvalidErrorCode(update.subject.to_string()))?;
    Ok((code, update.tail.unwrap_or_default().to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Set,
    Alter,
    Search,
    Open,
    Protocol,
    Ping,
    Call,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Set => "SET",
            Self::Alter => "ALTER",
            Self::Search => "SEARCH",
            Self::Open => "OPEN",
            Self::Protocol => "PROTOCOL",
            Self::Ping => "PING",
            Self::Call => "CALL",
        }
    }
}

/// Call properties the client may write with `SET CALL <id> ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSetProperty {
    Status,
    Seen,
    Dtmf,
    JoinConference,
}

impl CallSetProperty {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "STATUS",
            Self::Seen => "SEEN",
            Self::Dtmf => "DTMF",
            Self::JoinConference => "JOIN_CONFERENCE",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "STATUS" => Some(Self::Status),
            "SEEN" => Some(Self::Seen),
            "DTMF" => Some(Self::Dtmf),
            "JOIN_CONFERENCE" => Some(Self::JoinConference),
            _ => None,
        }
    }

    fn requires_value(self) -> bool {
        !matches!(self, Self::Seen)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: Verb,
    args: Vec<String>,
}

impl Command {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn ping() -> Self {
        Self::new(Verb::Ping)
    }

    pub fn protocol(version: u32) -> Self {
        Self::new(Verb::Protocol).arg(version.to_string())
    }

    pub fn get_call_property(call_id: &str, property: &str) -> Self {
        Self::new(Verb::Get).arg("CALL").arg(call_id).arg(property)
    }

    /// `GET CALL <id> CONF_PARTICIPANT <index>`.
    pub fn get_conference_participant(call_id: &str, index: usize) -> Self {
        Self::get_call_property(call_id, "CONF_PARTICIPANT").arg(index.to_string())
    }

    pub fn set_call_property(
        call_id: &str,
        property: CallSetProperty,
        value: Option<&str>,
    ) -> Result<Self, String> {
        let mut command = Self::new(Verb::Set)
            .arg("CALL")
            .arg(call_id)
            .arg(property.as_str());
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            Some(value) => command = command.arg(value),
            None if property.requires_value() => {
                return Err(format!("{} requires a value", property.as_str()))
            }
            None => {}
        }
        Ok(command)
    }

    pub fn call<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            verb: Verb::Call,
            args: targets.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb.as_str())?;
        if self.args.is_empty() {
            return Ok(());
        }
        let sep = if self.verb == Verb::Call { ", " } else { " " };
        write!(f, " {}", self.args.join(sep))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn tokenize_rejoins_value_with_spaces() {
        let update = tokenize("CALL 17 PARTNER_DISPNAME Mike Mann").unwrap();
        assert_eq!(update.action, Action::Call);
        assert_eq!(update.subject, "17");
        assert_eq!(update.property, Some("PARTNER_DISPNAME"));
        assert_eq!(update.value, Some("Mike Mann"));
        assert_eq!(update.tail, Some("PARTNER_DISPNAME Mike Mann"));
    }

    #[test]
    fn tokenize_handles_subject_only_and_missing_value() {
        let update = tokenize("CURRENTUSERHANDLE echo123").unwrap();
        assert_eq!(update.action, Action::CurrentUserHandle);
        assert_eq!(update.subject, "echo123");
        assert_eq!(update.property, None);
        assert_eq!(update.value, None);

        let update = tokenize("CALL 42 SUBJECT").unwrap();
        assert_eq!(update.property, Some("SUBJECT"));
        assert_eq!(update.value, None);
    }

    #[test]
    fn tokenize_discards_short_payloads() {
        assert_eq!(tokenize(""), Err(DecodeError::TooFewTokens));
        assert_eq!(tokenize("PING"), Err(DecodeError::TooFewTokens));
        assert_eq!(tokenize("CALL "), Err(DecodeError::TooFewTokens));
    }

    #[test]
    fn action_matching_is_case_sensitive() {
        assert_eq!(
            tokenize("call 17 STATUS RINGING"),
            Err(DecodeError::UnknownAction("call".to_string()))
        );
        assert_eq!(
            tokenize("VOICEMAIL 3 STATUS PLAYING"),
            Err(DecodeError::UnknownAction("VOICEMAIL".to_string()))
        );
    }

    #[test]
    fn peer_error_splits_code_and_message() {
        let update = tokenize("ERROR 68 Access denied").unwrap();
        assert_eq!(parse_peer_error(&update).unwrap(), (68, "Access denied".to_string()));

        let update = tokenize("ERROR 9901").unwrap();
        assert_eq!(parse_peer_error(&update).unwrap(), (9901, String::new()));

        let update = tokenize("ERROR oops broken").unwrap();
        assert_eq!(
            parse_peer_error(&update),
            Err(DecodeError::InvalidErrorCode("oops".to_string()))
        );
    }

    #[test]
    fn commands_render_wire_text() {
        assert_eq!(Command::ping().to_string(), "PING");
        assert_eq!(Command::protocol(8).to_string(), "PROTOCOL 8");
        assert_eq!(
            Command::new(Verb::Get).arg("SKYPEVERSION").to_string(),
            "GET SKYPEVERSION"
        );
        assert_eq!(
            Command::get_conference_participant("42", 3).to_string(),
            "GET CALL 42 CONF_PARTICIPANT 3"
        );
        assert_eq!(Command::call(["echo123"]).to_string(), "CALL echo123");
        assert_eq!(
            Command::call(["alice", "bob", "+3725550100"]).to_string(),
            "CALL alice, bob, +3725550100"
        );
    }

    #[test]
    fn set_call_property_checks_value_requirement() {
        let cmd = Command::set_call_property("42", CallSetProperty::Status, Some("ONHOLD")).unwrap();
        assert_eq!(cmd.to_string(), "SET CALL 42 STATUS ONHOLD");

        let cmd = Command::set_call_property("42", CallSetProperty::Seen, None).unwrap();
        assert_eq!(cmd.to_string(), "SET CALL 42 SEEN");

        assert!(Command::set_call_property("42", CallSetProperty::Dtmf, Some("  ")).is_err());
        assert_eq!(
            CallSetProperty::parse("join_conference"),
            Some(CallSetProperty::JoinConference)
        );
    }

    fn word() -> impl Strategy<Value = String> {
        "[A-Za-z0-9_+.]{1,12}"
    }

    proptest! {
        #[test]
        fn tokenize_recovers_all_parts(
            subject in word(),
            property in word(),
            value in proptest::collection::vec(word(), 0..6),
        ) {
            let mut text = format!("USER {subject} {property}");
            if !value.is_empty() {
                text.push(' ');
                text.push_str(&value.join(" "));
            }
            let update = tokenize(&text).unwrap();
            prop_assert_eq!(update.action, Action::User);
            prop_assert_eq!(update.subject, subject.as_str());
            prop_assert_eq!(update.property, Some(property.as_str()));
            let expected = if value.is_empty() { None } else { Some(value.join(" ")) };
            prop_assert_eq!(update.value.map(str::to_string), expected);
        }

        #[test]
        fn single_token_payloads_never_tokenize(token in "[^ ]{0,24}") {
            prop_assert_eq!(tokenize(&token), Err(DecodeError::TooFewTokens));
        }
    }
}
